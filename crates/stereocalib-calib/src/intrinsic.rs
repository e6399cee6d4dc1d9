//! # Intrinsic calibration
//!
//! Zhang's method: one plane-to-image homography per view, a closed-form
//! camera matrix from the homographies, per-view poses from `K⁻¹H`, and a
//! joint Levenberg-Marquardt refinement of the camera, its distortion and all
//! poses against the pixel reprojection error.

use serde::{Deserialize, Serialize};
use stereocalib_3d::camera::{ExtrinsicParameters, IntrinsicParameters};
use stereocalib_3d::linalg;
use stereocalib_3d::pose::{find_homography, pose_from_homography};
use stereocalib_3d::{Mat33, Point2};
use stereocalib_imgproc::chessboard::PatternView;
use stereocalib_optim::{
    LeastSquaresSolver, LevenbergMarquardt, Problem, TerminationReason, Variable,
};

use crate::factors::{
    intrinsics_from_params, intrinsics_to_params, pose_from_params, pose_to_params,
    IntrinsicViewFactor,
};
use crate::CalibrationError;

/// Minimum number of correspondences for a view to constrain a homography.
const MIN_POINTS_PER_VIEW: usize = 4;

/// Parameters of the intrinsic calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibrationConfig {
    /// Minimum number of usable views.
    pub min_views: usize,
    /// Iteration budget of the refinement.
    pub max_iterations: usize,
    /// Relative cost change at which the refinement stops.
    pub epsilon: f64,
    /// Keep `k3` at zero.
    pub fix_k3: bool,
    /// Keep `p1` and `p2` at zero.
    pub zero_tangential: bool,
}

impl Default for IntrinsicCalibrationConfig {
    fn default() -> Self {
        Self {
            min_views: 4,
            max_iterations: 30,
            epsilon: 1e-3,
            fix_k3: false,
            zero_tangential: false,
        }
    }
}

impl IntrinsicCalibrationConfig {
    /// Set the minimum number of usable views.
    pub fn with_min_views(mut self, min_views: usize) -> Self {
        self.min_views = min_views;
        self
    }

    /// Set the iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the relative cost change at which the refinement stops.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Keep `k3` at zero.
    pub fn with_fix_k3(mut self, fix: bool) -> Self {
        self.fix_k3 = fix;
        self
    }

    /// Keep the tangential coefficients at zero.
    pub fn with_zero_tangential(mut self, zero: bool) -> Self {
        self.zero_tangential = zero;
        self
    }

    /// The solver configured with this iteration budget and tolerance.
    pub fn solver(&self) -> LevenbergMarquardt {
        LevenbergMarquardt::default()
            .with_max_iterations(self.max_iterations)
            .with_cost_tolerance(self.epsilon)
    }

    fn fixed_camera_params(&self) -> Vec<usize> {
        let mut fixed = Vec::new();
        if self.zero_tangential {
            fixed.extend([6, 7]);
        }
        if self.fix_k3 {
            fixed.push(8);
        }
        fixed
    }
}

/// Result of an intrinsic calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    /// The refined camera.
    pub intrinsics: IntrinsicParameters,
    /// Reprojection RMS over all points, in pixels.
    pub rms: f64,
    /// Pose of the pattern in the camera frame, one per input view. `None`
    /// for views skipped for having too few correspondences.
    pub poses: Vec<Option<ExtrinsicParameters>>,
    /// Iterations of the refinement.
    pub iterations: usize,
}

/// Calibrate a single camera from views of a planar pattern.
///
/// Views with fewer than four correspondences are skipped with a warning and
/// do not count towards `min_views`. The others must have `Z = 0` pattern
/// points and share one image size. Uses the default Levenberg-Marquardt solver
/// configured from `config`.
pub fn calibrate_intrinsics(
    views: &[PatternView],
    config: &IntrinsicCalibrationConfig,
) -> Result<IntrinsicCalibration, CalibrationError> {
    calibrate_intrinsics_with(views, config, &config.solver())
}

/// Calibrate a single camera with a custom least-squares solver.
pub fn calibrate_intrinsics_with(
    views: &[PatternView],
    config: &IntrinsicCalibrationConfig,
    solver: &dyn LeastSquaresSolver,
) -> Result<IntrinsicCalibration, CalibrationError> {
    let usable: Vec<usize> = views
        .iter()
        .enumerate()
        .filter_map(|(index, view)| {
            if view.len() >= MIN_POINTS_PER_VIEW {
                return Some(index);
            }
            log::warn!(
                "skipping view {index}: {} correspondences, at least {MIN_POINTS_PER_VIEW} required",
                view.len()
            );
            None
        })
        .collect();
    if usable.is_empty() || usable.len() < config.min_views {
        return Err(CalibrationError::InsufficientData {
            obtained: usable.len(),
            required: config.min_views.max(1),
        });
    }

    let image_size = views[usable[0]].image_size;
    for &index in &usable {
        let view = &views[index];
        if view.image_size != image_size {
            return Err(CalibrationError::InvalidView {
                index,
                reason: format!(
                    "image size {:?} differs from {:?}",
                    view.image_size, image_size
                ),
            });
        }
        if view.correspondences.iter().any(|c| c.object[2] != 0.0) {
            return Err(CalibrationError::InvalidView {
                index,
                reason: "pattern points are not on the plane Z = 0".to_string(),
            });
        }
    }

    let homographies = usable
        .iter()
        .map(|&index| {
            let view = &views[index];
            let plane: Vec<Point2> = view
                .correspondences
                .iter()
                .map(|c| [c.object[0], c.object[1]])
                .collect();
            find_homography(&plane, &view.image_points()).map_err(|e| {
                CalibrationError::InvalidView {
                    index,
                    reason: e.to_string(),
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let k = initial_camera_matrix(&homographies, image_size);
    log::debug!(
        "intrinsic init: fx {:.2} fy {:.2} cx {:.2} cy {:.2}",
        k[0][0],
        k[1][1],
        k[0][2],
        k[1][2]
    );

    let initial_poses = homographies
        .iter()
        .map(|h| pose_from_homography(&k, h))
        .collect::<Result<Vec<_>, _>>()?;

    let camera = IntrinsicParameters::from_camera_matrix(&k, Default::default(), image_size);

    let mut problem = Problem::new();
    problem.add_variable(
        Variable::new("camera", intrinsics_to_params(&camera))
            .with_fixed(&config.fixed_camera_params()),
    )?;
    for (&i, pose) in usable.iter().zip(&initial_poses) {
        let view = &views[i];
        let name = format!("view{i}");
        problem.add_variable(Variable::new(name.clone(), pose_to_params(pose)))?;
        problem.add_factor(
            Box::new(IntrinsicViewFactor {
                image_size,
                image_points: view.image_points(),
                object_points: view.object_points(),
            }),
            vec!["camera".to_string(), name],
        )?;
    }

    let result = solver.minimize(&mut problem)?;
    let num_points: usize = usable.iter().map(|&i| views[i].len()).sum();
    let rms = (result.final_cost / num_points as f64).sqrt();

    if !accepts(result.termination_reason) {
        return Err(CalibrationError::ConvergenceFailure {
            iterations: result.iterations,
            rms,
        });
    }

    let intrinsics = intrinsics_from_params(problem.values("camera")?, image_size);
    if !intrinsics.is_valid() {
        return Err(CalibrationError::ConvergenceFailure {
            iterations: result.iterations,
            rms,
        });
    }

    let mut poses = vec![None; views.len()];
    for &i in &usable {
        poses[i] = Some(pose_from_params(problem.values(&format!("view{i}"))?));
    }

    log::info!(
        "intrinsic calibration: {} of {} views, rms {:.4} px after {} iterations ({:?})",
        usable.len(),
        views.len(),
        rms,
        result.iterations,
        result.termination_reason
    );

    Ok(IntrinsicCalibration {
        intrinsics,
        rms,
        poses,
        iterations: result.iterations,
    })
}

/// Whether a refinement result is a usable minimum.
///
/// A damping blow-up means no step decreases the cost any further, which is
/// a minimum as far as the solver can tell.
pub(crate) fn accepts(reason: TerminationReason) -> bool {
    reason.is_converged() || reason == TerminationReason::LambdaMaxExceeded
}

/// Estimate the camera matrix from plane-to-image homographies.
///
/// Tries the closed form with zero skew first, then focal lengths with the
/// principal point at the image centre, then a focal length equal to the image
/// width.
fn initial_camera_matrix(homographies: &[Mat33], image_size: (usize, usize)) -> Mat33 {
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let (cx0, cy0) = (0.5 * w, 0.5 * h);

    if let Some(k) = zhang_camera_matrix(homographies, image_size) {
        return k;
    }
    log::debug!("closed-form camera matrix degenerate, fixing the principal point");

    if let Some((fx, fy)) = focal_from_homographies(homographies, cx0, cy0) {
        return [[fx, 0.0, cx0], [0.0, fy, cy0], [0.0, 0.0, 1.0]];
    }
    log::warn!("views do not constrain the focal length, starting from the image width");

    [[w, 0.0, cx0], [0.0, w, cy0], [0.0, 0.0, 1.0]]
}

/// Zhang's `v_ij` row, built from columns `i` and `j` of `h`.
fn zhang_row(h: &Mat33, i: usize, j: usize) -> [f64; 6] {
    let a = [h[0][i], h[1][i], h[2][i]];
    let b = [h[0][j], h[1][j], h[2][j]];
    [
        a[0] * b[0],
        a[0] * b[1] + a[1] * b[0],
        a[1] * b[1],
        a[2] * b[0] + a[0] * b[2],
        a[2] * b[1] + a[1] * b[2],
        a[2] * b[2],
    ]
}

/// Condition a homography with `N = [[1/w, 0, -cx/w], [0, 1/w, -cy/w], [0, 0, 1]]`
/// and scale it to unit Frobenius norm.
fn condition(h: &Mat33, w: f64, cx: f64, cy: f64) -> Mat33 {
    let n = [[1.0 / w, 0.0, -cx / w], [0.0, 1.0 / w, -cy / w], [0.0, 0.0, 1.0]];
    let mut hn = linalg::mat33_mul(&n, h);
    linalg::normalize_mat33_inplace(&mut hn);
    hn
}

fn zhang_camera_matrix(homographies: &[Mat33], image_size: (usize, usize)) -> Option<Mat33> {
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let (cx0, cy0) = (0.5 * w, 0.5 * h);

    let mut a = faer::Mat::<f64>::zeros(2 * homographies.len() + 1, 6);
    for (k, hom) in homographies.iter().enumerate() {
        let hn = condition(hom, w, cx0, cy0);
        let v12 = zhang_row(&hn, 0, 1);
        let v11 = zhang_row(&hn, 0, 0);
        let v22 = zhang_row(&hn, 1, 1);
        for j in 0..6 {
            a.write(2 * k, j, v12[j]);
            a.write(2 * k + 1, j, v11[j] - v22[j]);
        }
    }
    // zero skew
    a.write(2 * homographies.len(), 1, 1.0);

    let (b, singular) = linalg::null_vector(&a);
    if singular[4] <= 1e-9 * singular[0] {
        return None;
    }

    // B is defined up to sign; it must be positive definite
    let b: Vec<f64> = if b[0] < 0.0 {
        b.iter().map(|v| -v).collect()
    } else {
        b
    };
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let den = b11 * b22 - b12 * b12;
    if b11 <= 0.0 || den <= 0.0 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / den;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / den).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;

    let k = [
        [w * alpha, 0.0, w * u0 + cx0],
        [0.0, w * beta, w * v0 + cy0],
        [0.0, 0.0, 1.0],
    ];
    plausible(&k, image_size).then_some(k)
}

/// Focal lengths from the orthonormality constraints with a known principal point.
fn focal_from_homographies(homographies: &[Mat33], cx: f64, cy: f64) -> Option<(f64, f64)> {
    // normal equations of the 2 unknowns (1/fx², 1/fy²)
    let mut ata = [[0.0; 2]; 2];
    let mut atb = [0.0; 2];
    let shift = [[1.0, 0.0, -cx], [0.0, 1.0, -cy], [0.0, 0.0, 1.0]];

    for hom in homographies {
        let mut hs = linalg::mat33_mul(&shift, hom);
        linalg::normalize_mat33_inplace(&mut hs);
        let col = |j: usize| [hs[0][j], hs[1][j], hs[2][j]];
        let (h1, h2) = (col(0), col(1));

        let rows = [
            ([h1[0] * h2[0], h1[1] * h2[1]], -h1[2] * h2[2]),
            (
                [h1[0] * h1[0] - h2[0] * h2[0], h1[1] * h1[1] - h2[1] * h2[1]],
                -(h1[2] * h1[2] - h2[2] * h2[2]),
            ),
        ];
        for (row, rhs) in rows {
            for i in 0..2 {
                for j in 0..2 {
                    ata[i][j] += row[i] * row[j];
                }
                atb[i] += row[i] * rhs;
            }
        }
    }

    let det = ata[0][0] * ata[1][1] - ata[0][1] * ata[1][0];
    let scale = ata[0][0] + ata[1][1];
    if det.abs() <= 1e-10 * scale * scale {
        return None;
    }
    let a = (ata[1][1] * atb[0] - ata[0][1] * atb[1]) / det;
    let b = (ata[0][0] * atb[1] - ata[1][0] * atb[0]) / det;
    if a <= 0.0 || b <= 0.0 {
        return None;
    }
    Some((1.0 / a.sqrt(), 1.0 / b.sqrt()))
}

fn plausible(k: &Mat33, image_size: (usize, usize)) -> bool {
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let finite = k.iter().flatten().all(|v| v.is_finite());
    finite
        && k[0][0] > 0.0
        && k[1][1] > 0.0
        && (0.0..=w).contains(&k[0][2])
        && (0.0..=h).contains(&k[1][2])
}
