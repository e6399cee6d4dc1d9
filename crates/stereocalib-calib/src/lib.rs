#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;
pub use error::CalibrationError;

/// Reprojection factors shared by the calibrators.
mod factors;

/// Single camera calibration from planar target views.
pub mod intrinsic;

/// Reading and writing point files.
pub mod io;

/// End-to-end calibration of a camera pair.
pub mod pipeline;

/// A calibrated stereo rig.
pub mod rig;

/// Extrinsic calibration of a camera pair with fixed intrinsics.
pub mod stereo;

/// Persistence of calibration results.
pub mod store;
