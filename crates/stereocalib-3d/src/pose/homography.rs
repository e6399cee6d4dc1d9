use crate::camera::ExtrinsicParameters;
use crate::linalg;
use crate::pose::utils::normalize_points_2d;
use crate::{Mat33, Point2};

/// Errors returned by homography estimation.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum HomographyError {
    /// Not enough correspondences for the estimator.
    #[error("Homography requires at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences provided.
        actual: usize,
    },

    /// Source and destination have different lengths.
    #[error("Mismatched correspondences: {src} source and {dst} destination points")]
    MismatchedLengths {
        /// Number of source points.
        src: usize,
        /// Number of destination points.
        dst: usize,
    },

    /// The configuration does not determine a unique homography.
    #[error("Degenerate configuration: {0}")]
    Degenerate(&'static str),
}

/// Estimate the homography mapping `src` onto `dst` with the normalized DLT.
///
/// Both point sets are normalized (Hartley), the `2N x 9` design matrix is
/// solved for its null vector with an SVD and the result is denormalized and
/// scaled so that `H[2][2] = 1`.
///
/// # Arguments
///
/// * `src` - The source 2d points, at least 4.
/// * `dst` - The destination 2d points.
pub fn find_homography(src: &[Point2], dst: &[Point2]) -> Result<Mat33, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::MismatchedLengths {
            src: src.len(),
            dst: dst.len(),
        });
    }
    if src.len() < 4 {
        return Err(HomographyError::InsufficientCorrespondences {
            required: 4,
            actual: src.len(),
        });
    }

    let (x1, t1) = normalize_points_2d(src);
    let (x2, t2) = normalize_points_2d(dst);

    let mut mat_a = faer::Mat::<f64>::zeros(2 * x1.len(), 9);
    for (i, (p, q)) in x1.iter().zip(&x2).enumerate() {
        let (r0, r1) = (2 * i, 2 * i + 1);
        mat_a.write(r0, 0, p[0]);
        mat_a.write(r0, 1, p[1]);
        mat_a.write(r0, 2, 1.0);
        mat_a.write(r0, 6, -q[0] * p[0]);
        mat_a.write(r0, 7, -q[0] * p[1]);
        mat_a.write(r0, 8, -q[0]);

        mat_a.write(r1, 3, p[0]);
        mat_a.write(r1, 4, p[1]);
        mat_a.write(r1, 5, 1.0);
        mat_a.write(r1, 6, -q[1] * p[0]);
        mat_a.write(r1, 7, -q[1] * p[1]);
        mat_a.write(r1, 8, -q[1]);
    }

    let (h, singular) = linalg::null_vector(&mat_a);

    // a second (near) null direction means the points do not pin down H
    if singular[7] <= 1e-10 * singular[0] {
        return Err(HomographyError::Degenerate("collinear or repeated points"));
    }

    let h_n = [[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], h[8]]];
    let t2_inv = linalg::inverse_mat33(&t2)
        .ok_or(HomographyError::Degenerate("coincident destination points"))?;
    let mut homo = linalg::mat33_mul(&linalg::mat33_mul(&t2_inv, &h_n), &t1);

    if homo[2][2].abs() > f64::EPSILON {
        let s = homo[2][2];
        homo.iter_mut().flatten().for_each(|v| *v /= s);
    } else {
        linalg::normalize_mat33_inplace(&mut homo);
    }

    if linalg::det_mat33(&homo).abs() < 1e-12 {
        return Err(HomographyError::Degenerate("singular homography"));
    }

    Ok(homo)
}

/// Recover the pose of a plane `Z = 0` from its homography to the image.
///
/// With `H ~ K [r1 r2 t]`, the columns of `K⁻¹H` are rescaled to unit-length
/// rotation columns, the third column is completed with `r1 x r2`, and the
/// result is projected onto the nearest rotation. The sign is chosen so that
/// the plane lies in front of the camera.
pub fn pose_from_homography(
    k: &Mat33,
    homography: &Mat33,
) -> Result<ExtrinsicParameters, HomographyError> {
    let k_inv =
        linalg::inverse_mat33(k).ok_or(HomographyError::Degenerate("singular camera matrix"))?;
    let m = linalg::mat33_mul(&k_inv, homography);
    let col = |j: usize| [m[0][j], m[1][j], m[2][j]];
    let (h1, h2, h3) = (col(0), col(1), col(2));

    let norm = 0.5 * (linalg::norm_vec3(&h1) + linalg::norm_vec3(&h2));
    if norm < f64::EPSILON {
        return Err(HomographyError::Degenerate("zero homography columns"));
    }
    let mut lambda = 1.0 / norm;
    if h3[2] * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1.map(|v| v * lambda);
    let r2 = h2.map(|v| v * lambda);
    let r3 = linalg::cross_vec3(&r1, &r2);
    let t = h3.map(|v| v * lambda);

    let approx_r = [
        [r1[0], r2[0], r3[0]],
        [r1[1], r2[1], r3[1]],
        [r1[2], r2[2], r3[2]],
    ];

    Ok(ExtrinsicParameters::new(
        linalg::nearest_rotation(&approx_r),
        t,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::IntrinsicParameters;
    use approx::assert_relative_eq;

    fn apply(h: &Mat33, p: &Point2) -> Point2 {
        let q = linalg::mat33_mul_vec3(h, &[p[0], p[1], 1.0]);
        [q[0] / q[2], q[1] / q[2]]
    }

    #[test]
    fn test_homography_identity() -> Result<(), HomographyError> {
        let x1 = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let homo = find_homography(&x1, &x1)?;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(homo[i][j], linalg::IDENTITY33[i][j], epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_homography_projective() -> Result<(), HomographyError> {
        let expected = [[1.2, 0.1, 5.0], [0.0, 0.9, -3.0], [0.001, 0.002, 1.0]];
        let x1: Vec<Point2> = (0..20)
            .map(|i| [(i % 5) as f64 * 10.0, (i / 5) as f64 * 7.0])
            .collect();
        let x2: Vec<Point2> = x1.iter().map(|p| apply(&expected, p)).collect();

        let homo = find_homography(&x1, &x2)?;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(homo[i][j], expected[i][j], epsilon = 1e-8);
            }
        }
        Ok(())
    }

    #[test]
    fn test_homography_errors() {
        let x = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        assert_eq!(
            find_homography(&x, &x),
            Err(HomographyError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            })
        );
        assert!(matches!(
            find_homography(&x, &x[..2]),
            Err(HomographyError::MismatchedLengths { src: 3, dst: 2 })
        ));

        let collinear = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
        assert!(matches!(
            find_homography(&collinear, &collinear),
            Err(HomographyError::Degenerate(_))
        ));
    }

    #[test]
    fn test_pose_from_homography() -> Result<(), HomographyError> {
        let cam = IntrinsicParameters::new(800.0, 780.0, 320.0, 240.0, (640, 480));
        let pose = ExtrinsicParameters::from_axis_angle(&[0.2, -0.3, 0.1], [-0.5, -0.4, 2.5]);

        let board: Vec<Point2> = (0..35)
            .map(|k| [(k % 7) as f64 * 0.1, (k / 7) as f64 * 0.1])
            .collect();
        let image: Vec<Point2> = board
            .iter()
            .map(|p| cam.project(&pose, &[p[0], p[1], 0.0]).unwrap())
            .collect();

        let h = find_homography(&board, &image)?;
        let recovered = pose_from_homography(&cam.camera_matrix(), &h)?;
        for i in 0..3 {
            assert_relative_eq!(recovered.translation[i], pose.translation[i], epsilon = 1e-6);
            for j in 0..3 {
                assert_relative_eq!(recovered.rotation[i][j], pose.rotation[i][j], epsilon = 1e-6);
            }
        }
        Ok(())
    }
}
