//! # Pose estimation
//!
//! Geometry between an image and a plane, or between two views.
//!
//! - [`homography`]: plane to image mapping (8 DOF) and the board pose it implies
//! - [`essential`]: epipolar geometry in normalized coordinates (5 DOF)

mod essential;
pub use essential::*;

mod homography;
pub use homography::*;

mod utils;
pub use utils::normalize_points_2d;
