use serde::Serialize;

use crate::camera::{ExtrinsicParameters, IntrinsicParameters};
use crate::linalg;
use crate::{Point2, Point3};

/// A 3x4 camera projection matrix `P = K [R | T]`.
///
/// Projection matrices are only built from calibrated camera parameters and
/// are never modified afterwards. The last row of `K` is `[0, 0, 1]`, so the
/// third homogeneous coordinate of `P X` is the depth of `X` in the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectionMatrix {
    data: [[f64; 4]; 3],
}

impl ProjectionMatrix {
    /// Projection matrix of the reference camera: `K [I | 0]`.
    pub fn from_intrinsics(intrinsics: &IntrinsicParameters) -> Self {
        Self::from_calibration(intrinsics, &ExtrinsicParameters::identity())
    }

    /// Projection matrix `K [R | T]` of a camera posed by `extrinsics`.
    pub fn from_calibration(
        intrinsics: &IntrinsicParameters,
        extrinsics: &ExtrinsicParameters,
    ) -> Self {
        let k = intrinsics.camera_matrix();
        let (r, t) = (&extrinsics.rotation, &extrinsics.translation);
        let mut data = [[0.0; 4]; 3];
        for (i, row) in data.iter_mut().enumerate() {
            for (j, val) in row.iter_mut().enumerate() {
                *val = (0..3)
                    .map(|m| k[i][m] * if j < 3 { r[m][j] } else { t[m] })
                    .sum();
            }
        }
        Self { data }
    }

    /// The matrix entries, row-major.
    pub fn as_array(&self) -> &[[f64; 4]; 3] {
        &self.data
    }

    /// Row `i` of the matrix.
    pub fn row(&self, i: usize) -> &[f64; 4] {
        &self.data[i]
    }

    /// Depth of a point along the optical axis of this camera.
    pub fn depth(&self, p: &Point3) -> f64 {
        let r = &self.data[2];
        r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + r[3]
    }

    /// Optical centre of the camera, `C = -M⁻¹ p₄` with `M` the left 3x3 block.
    ///
    /// Returns `None` when `M` is singular.
    pub fn centre(&self) -> Option<Point3> {
        let m = self.data.map(|r| [r[0], r[1], r[2]]);
        let p4 = self.data.map(|r| r[3]);
        let c = linalg::mat33_mul_vec3(&linalg::inverse_mat33(&m)?, &p4);
        Some([-c[0], -c[1], -c[2]])
    }

    /// Project a point to pixels (no lens distortion).
    ///
    /// Returns `None` for points on the camera's principal plane.
    pub fn project(&self, p: &Point3) -> Option<Point2> {
        let h = self
            .data
            .map(|r| r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + r[3]);
        if h[2].abs() < f64::EPSILON {
            return None;
        }
        Some([h[0] / h[2], h[1] / h[2]])
    }
}
