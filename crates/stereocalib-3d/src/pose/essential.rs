use crate::camera::ExtrinsicParameters;
use crate::linalg::{self, Svd3};
use crate::pose::utils::normalize_points_2d;
use crate::triangulation::solve_dlt;
use crate::{Mat33, Point2, Point3};

/// Errors returned by essential matrix estimation.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EssentialError {
    /// Not enough correspondences for the 8-point algorithm.
    #[error("Essential matrix requires at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number of correspondences provided.
        actual: usize,
    },

    /// The two point sets have different lengths.
    #[error("Mismatched correspondences: {left} and {right} points")]
    MismatchedLengths {
        /// Number of points in the first view.
        left: usize,
        /// Number of points in the second view.
        right: usize,
    },

    /// The correspondences do not determine the epipolar geometry.
    #[error("Degenerate configuration: {0}")]
    Degenerate(&'static str),

    /// No pose candidate puts the points in front of both cameras.
    #[error("No pose candidate passes the cheirality check")]
    CheiralityFailed,
}

/// Estimate an essential matrix from normalized image coordinates.
///
/// Solves `x2ᵀ E x1 = 0` with the 8-point algorithm on Hartley-normalized
/// points and projects the result onto the essential manifold, i.e. singular
/// values `(1, 1, 0)`.
///
/// # Arguments
///
/// * `x1` - Undistorted normalized coordinates in the first view.
/// * `x2` - Undistorted normalized coordinates in the second view.
pub fn essential_8point(x1: &[Point2], x2: &[Point2]) -> Result<Mat33, EssentialError> {
    if x1.len() != x2.len() {
        return Err(EssentialError::MismatchedLengths {
            left: x1.len(),
            right: x2.len(),
        });
    }
    if x1.len() < 8 {
        return Err(EssentialError::InsufficientCorrespondences {
            required: 8,
            actual: x1.len(),
        });
    }

    let (x1n, t1) = normalize_points_2d(x1);
    let (x2n, t2) = normalize_points_2d(x2);

    let mut a = faer::Mat::<f64>::zeros(x1n.len(), 9);
    for (i, (p, q)) in x1n.iter().zip(&x2n).enumerate() {
        let row = [
            q[0] * p[0],
            q[0] * p[1],
            q[0],
            q[1] * p[0],
            q[1] * p[1],
            q[1],
            p[0],
            p[1],
            1.0,
        ];
        for (j, v) in row.iter().enumerate() {
            a.write(i, j, *v);
        }
    }

    let (e, singular) = linalg::null_vector(&a);
    if singular[7] <= 1e-10 * singular[0] {
        return Err(EssentialError::Degenerate("points do not span the epipolar constraint"));
    }

    let e_n = [[e[0], e[1], e[2]], [e[3], e[4], e[5]], [e[6], e[7], e[8]]];
    let e_full = linalg::mat33_mul(
        &linalg::mat33_mul(&linalg::transpose_mat33(&t2), &e_n),
        &t1,
    );

    Ok(enforce_essential_constraints(&e_full))
}

/// Enforce the (1,1,0) singular value constraint on an essential matrix.
pub fn enforce_essential_constraints(e: &Mat33) -> Mat33 {
    let Svd3 { u, v, .. } = linalg::svd3(e);
    // U diag(1, 1, 0) Vᵀ
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = u[i][0] * v[j][0] + u[i][1] * v[j][1];
        }
    }
    out
}

/// Decompose an essential matrix into its four `(R, t)` candidates.
///
/// The translations have unit norm; the baseline length is not observable
/// from `E` alone.
pub fn decompose_essential(e: &Mat33) -> [(Mat33, [f64; 3]); 4] {
    let Svd3 { mut u, mut v, .. } = linalg::svd3(e);

    if linalg::det_mat33(&u) < 0.0 {
        u.iter_mut().for_each(|row| row[2] = -row[2]);
    }
    if linalg::det_mat33(&v) < 0.0 {
        v.iter_mut().for_each(|row| row[2] = -row[2]);
    }

    let w = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    let vt = linalg::transpose_mat33(&v);
    let r1 = linalg::mat33_mul(&linalg::mat33_mul(&u, &w), &vt);
    let r2 = linalg::mat33_mul(&linalg::mat33_mul(&u, &linalg::transpose_mat33(&w)), &vt);

    let t = [u[0][2], u[1][2], u[2][2]];
    let t_neg = [-t[0], -t[1], -t[2]];

    [(r1, t), (r1, t_neg), (r2, t), (r2, t_neg)]
}

/// Select the pose candidate of `E` that places the most points in front of
/// both cameras.
///
/// Returns the pose of the second camera relative to the first (unit-norm
/// translation) and the number of points that passed the cheirality test.
pub fn recover_pose(
    e: &Mat33,
    x1: &[Point2],
    x2: &[Point2],
) -> Result<(ExtrinsicParameters, usize), EssentialError> {
    if x1.len() != x2.len() {
        return Err(EssentialError::MismatchedLengths {
            left: x1.len(),
            right: x2.len(),
        });
    }

    let p1 = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    let mut best: Option<(ExtrinsicParameters, usize)> = None;
    for (r, t) in decompose_essential(e) {
        let pose = ExtrinsicParameters::new(r, t);
        let p2 = [
            [r[0][0], r[0][1], r[0][2], t[0]],
            [r[1][0], r[1][1], r[1][2], t[1]],
            [r[2][0], r[2][1], r[2][2], t[2]],
        ];

        let count = x1
            .iter()
            .zip(x2)
            .filter(|(a, b)| {
                let (xh, _) = solve_dlt(&p1, &p2, a, b);
                if xh[3].abs() < 1e-12 {
                    return false;
                }
                let x: Point3 = [xh[0] / xh[3], xh[1] / xh[3], xh[2] / xh[3]];
                x[2] > 0.0 && pose.transform_point(&x)[2] > 0.0
            })
            .count();

        if best.as_ref().is_none_or(|(_, c)| count > *c) {
            best = Some((pose, count));
        }
    }

    match best {
        Some((pose, count)) if count > 0 => Ok((pose, count)),
        _ => Err(EssentialError::CheiralityFailed),
    }
}
