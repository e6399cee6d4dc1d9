#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Pinhole camera model with Brown-Conrady lens distortion.
pub mod camera;

/// Small fixed-size linear algebra utilities.
pub mod linalg;

/// Pose estimation algorithms.
pub mod pose;

/// Projection matrices built from calibrated cameras.
pub mod projection;

/// Rotation parametrizations.
pub mod so3;

/// Triangulation of stereo correspondences.
pub mod triangulation;

/// A pixel or normalized image coordinate `(u, v)`.
pub type Point2 = [f64; 2];

/// A 3D point `(X, Y, Z)`.
pub type Point3 = [f64; 3];

/// A row-major 3x3 matrix.
pub type Mat33 = [[f64; 3]; 3];
