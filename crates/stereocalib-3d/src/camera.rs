use serde::{Deserialize, Serialize};

use crate::linalg::{self, IDENTITY33};
use crate::{so3, Mat33, Point2, Point3};

/// Brown-Conrady lens distortion: radial `k1, k2, k3` and tangential `p1, p2`.
///
/// The coefficient order of [`Distortion::to_array`] is `[k1, k2, p1, p2, k3]`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Distortion {
    /// The first radial distortion coefficient
    pub k1: f64,
    /// The second radial distortion coefficient
    pub k2: f64,
    /// The first tangential distortion coefficient
    pub p1: f64,
    /// The second tangential distortion coefficient
    pub p2: f64,
    /// The third radial distortion coefficient
    pub k3: f64,
}

impl Distortion {
    /// Build from `[k1, k2, p1, p2, k3]`.
    pub fn from_array(c: [f64; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        }
    }

    /// Coefficients as `[k1, k2, p1, p2, k3]`.
    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Whether any coefficient is non zero.
    pub fn has_distortion(&self) -> bool {
        self.to_array().iter().any(|c| *c != 0.0)
    }

    /// Apply the distortion to a normalized image point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let kr = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = x * kr + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * kr + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Remove the distortion from a normalized image point with fixed-point iterations.
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        const MAX_ITERATIONS: usize = 20;
        const EPSILON: f64 = 1e-14;

        if !self.has_distortion() {
            return (xd, yd);
        }

        let (mut x, mut y) = (xd, yd);
        for _ in 0..MAX_ITERATIONS {
            let (xp, yp) = self.distort(x, y);
            let (dx, dy) = (xd - xp, yd - yp);
            x += dx;
            y += dy;
            if dx.abs() < EPSILON && dy.abs() < EPSILON {
                break;
            }
        }
        (x, y)
    }
}

/// Intrinsic parameters of a pinhole camera with lens distortion.
///
/// The camera matrix has zero skew:
///
/// ```text
/// | fx  0 cx |
/// |  0 fy cy |
/// |  0  0  1 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct IntrinsicParameters {
    /// The focal length in the x direction
    pub fx: f64,
    /// The focal length in the y direction
    pub fy: f64,
    /// The x coordinate of the principal point
    pub cx: f64,
    /// The y coordinate of the principal point
    pub cy: f64,
    /// Lens distortion coefficients
    pub distortion: Distortion,
    /// The image dimensions the camera was calibrated for (width, height)
    pub image_size: (usize, usize),
}

impl IntrinsicParameters {
    /// Create distortion-free intrinsics.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, image_size: (usize, usize)) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::default(),
            image_size,
        }
    }

    /// Set the distortion coefficients.
    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    /// Build from a camera matrix. The skew term is ignored.
    pub fn from_camera_matrix(k: &Mat33, distortion: Distortion, image_size: (usize, usize)) -> Self {
        Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
            distortion,
            image_size,
        }
    }

    /// Returns the camera matrix as a 3x3 array.
    pub fn camera_matrix(&self) -> Mat33 {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Whether all parameters are finite and the focal lengths are positive.
    pub fn is_valid(&self) -> bool {
        let all_finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.to_array().iter())
            .all(|v| v.is_finite());
        all_finite && self.fx > 0.0 && self.fy > 0.0
    }

    /// Map a normalized image point to pixels, applying lens distortion.
    pub fn normalized_to_pixel(&self, x: f64, y: f64) -> Point2 {
        let (xd, yd) = self.distortion.distort(x, y);
        [self.fx * xd + self.cx, self.fy * yd + self.cy]
    }

    /// Map a pixel to its undistorted normalized image point.
    pub fn pixel_to_normalized(&self, u: f64, v: f64) -> Point2 {
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let (x, y) = self.distortion.undistort(xd, yd);
        [x, y]
    }

    /// Remove lens distortion from a pixel, keeping the same camera matrix.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> Point2 {
        let [x, y] = self.pixel_to_normalized(u, v);
        [self.fx * x + self.cx, self.fy * y + self.cy]
    }

    /// Project a point given in camera coordinates.
    ///
    /// Returns `None` when the point is not in front of the camera.
    pub fn project_camera_point(&self, p: &Point3) -> Option<Point2> {
        if p[2] <= f64::EPSILON {
            return None;
        }
        Some(self.normalized_to_pixel(p[0] / p[2], p[1] / p[2]))
    }

    /// Project a point expressed in a frame whose pose relative to the camera is `pose`.
    pub fn project(&self, pose: &ExtrinsicParameters, p: &Point3) -> Option<Point2> {
        self.project_camera_point(&pose.transform_point(p))
    }
}

/// A rigid transform `X_dst = R * X_src + T`.
///
/// For a stereo rig it maps points from camera-1 coordinates into camera-2
/// coordinates; for a calibration view it maps pattern coordinates into camera
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ExtrinsicParameters {
    /// The rotation matrix 3x3
    pub rotation: Mat33,
    /// The translation vector 3x1
    pub translation: [f64; 3],
}

impl Default for ExtrinsicParameters {
    fn default() -> Self {
        Self::identity()
    }
}

impl ExtrinsicParameters {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: IDENTITY33,
            translation: [0.0; 3],
        }
    }

    /// Create from a rotation matrix and a translation.
    pub fn new(rotation: Mat33, translation: [f64; 3]) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Create from an axis-angle rotation and a translation.
    pub fn from_axis_angle(rvec: &[f64; 3], translation: [f64; 3]) -> Self {
        Self::new(so3::exp(rvec), translation)
    }

    /// Axis-angle representation of the rotation.
    pub fn axis_angle(&self) -> [f64; 3] {
        so3::log(&self.rotation)
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Point3) -> Point3 {
        let rp = linalg::mat33_mul_vec3(&self.rotation, p);
        [
            rp[0] + self.translation[0],
            rp[1] + self.translation[1],
            rp[2] + self.translation[2],
        ]
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let rt = linalg::transpose_mat33(&self.rotation);
        let t = linalg::mat33_mul_vec3(&rt, &self.translation);
        Self::new(rt, [-t[0], -t[1], -t[2]])
    }

    /// Compose two transforms: `(self ∘ other)(X) = self(other(X))`.
    pub fn compose(&self, other: &ExtrinsicParameters) -> Self {
        Self::new(
            linalg::mat33_mul(&self.rotation, &other.rotation),
            self.transform_point(&other.translation),
        )
    }

    /// Length of the translation, i.e. the stereo baseline.
    pub fn baseline(&self) -> f64 {
        linalg::norm_vec3(&self.translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> IntrinsicParameters {
        IntrinsicParameters::new(800.0, 800.0, 320.0, 240.0, (640, 480))
    }

    #[test]
    fn test_camera_matrix() {
        let k = intrinsics().camera_matrix();
        assert_eq!(k, [[800.0, 0.0, 320.0], [0.0, 800.0, 240.0], [0.0, 0.0, 1.0]]);
        let back = IntrinsicParameters::from_camera_matrix(&k, Distortion::default(), (640, 480));
        assert_eq!(back, intrinsics());
    }

    #[test]
    fn test_project_camera_point() {
        let cam = intrinsics();
        let uv = cam.project_camera_point(&[0.12, 0.12, 2.0]).unwrap();
        assert_relative_eq!(uv[0], 368.0, epsilon = 1e-9);
        assert_relative_eq!(uv[1], 288.0, epsilon = 1e-9);
        assert!(cam.project_camera_point(&[0.0, 0.0, -1.0]).is_none());
    }

    #[test]
    fn test_distortion_roundtrip() {
        let cam = intrinsics().with_distortion(Distortion::from_array([-0.2, 0.05, 1e-3, -5e-4, 0.01]));
        let uv = cam.normalized_to_pixel(0.3, -0.2);
        let n = cam.pixel_to_normalized(uv[0], uv[1]);
        assert_relative_eq!(n[0], 0.3, epsilon = 1e-10);
        assert_relative_eq!(n[1], -0.2, epsilon = 1e-10);
        assert_eq!(
            cam.distortion.to_array(),
            [-0.2, 0.05, 1e-3, -5e-4, 0.01]
        );
    }

    #[test]
    fn test_invalid_intrinsics() {
        assert!(intrinsics().is_valid());
        let mut cam = intrinsics();
        cam.fx = f64::NAN;
        assert!(!cam.is_valid());
        cam.fx = -1.0;
        assert!(!cam.is_valid());
    }

    #[test]
    fn test_extrinsics_inverse_compose() {
        let pose = ExtrinsicParameters::from_axis_angle(&[0.1, -0.3, 0.2], [0.3, 0.1, -0.2]);
        let p = [0.5, -0.4, 2.0];
        let q = pose.transform_point(&p);
        let back = pose.inverse().transform_point(&q);
        for k in 0..3 {
            assert_relative_eq!(back[k], p[k], epsilon = 1e-12);
        }

        let id = pose.compose(&pose.inverse());
        for i in 0..3 {
            assert_relative_eq!(id.translation[i], 0.0, epsilon = 1e-12);
            for j in 0..3 {
                assert_relative_eq!(id.rotation[i][j], IDENTITY33[i][j], epsilon = 1e-12);
            }
        }
        assert_relative_eq!(pose.baseline(), (0.09f64 + 0.01 + 0.04).sqrt(), epsilon = 1e-12);
    }
}
