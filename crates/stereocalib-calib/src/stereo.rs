//! # Stereo calibration
//!
//! Estimates the rigid transform from the left to the right camera with both
//! intrinsics held fixed. Two initial guesses are computed, one from the
//! essential matrix of all correspondences and one from per-frame board
//! poses, and the better one seeds a joint refinement of the transform and
//! every board pose.

use serde::{Deserialize, Serialize};
use stereocalib_3d::camera::{ExtrinsicParameters, IntrinsicParameters};
use stereocalib_3d::linalg;
use stereocalib_3d::pose::{
    essential_8point, find_homography, pose_from_homography, recover_pose,
};
use stereocalib_3d::projection::ProjectionMatrix;
use stereocalib_3d::triangulation::{triangulate_point, StereoObservation, TriangulationConfig};
use stereocalib_3d::{Mat33, Point2};
use stereocalib_imgproc::chessboard::PatternView;
use stereocalib_optim::{LeastSquaresSolver, LevenbergMarquardt, Problem, Variable};

use crate::factors::{pose_from_params, pose_to_params, StereoViewFactor};
use crate::intrinsic::accepts;
use crate::CalibrationError;

/// Pattern views of one time-aligned frame of a camera pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StereoFrame {
    /// The view of the left camera, if the pattern was found.
    pub left: Option<PatternView>,
    /// The view of the right camera, if the pattern was found.
    pub right: Option<PatternView>,
}

impl StereoFrame {
    /// Create a new frame.
    pub fn new(left: Option<PatternView>, right: Option<PatternView>) -> Self {
        Self { left, right }
    }

    /// Whether both cameras saw the pattern.
    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

/// What to do with a frame where only one camera saw the pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialFramePolicy {
    /// Skip the frame and log it.
    #[default]
    Drop,
    /// Fail with [`CalibrationError::PartialFrame`].
    Reject,
}

/// Parameters of the stereo calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibrationConfig {
    /// Minimum number of frames seen by both cameras.
    pub min_pairs: usize,
    /// Iteration budget of the refinement.
    pub max_iterations: usize,
    /// Relative cost change at which the refinement stops.
    pub epsilon: f64,
    /// Handling of frames seen by one camera only.
    pub partial_frames: PartialFramePolicy,
}

impl Default for StereoCalibrationConfig {
    fn default() -> Self {
        Self {
            min_pairs: 4,
            max_iterations: 100,
            epsilon: 1e-4,
            partial_frames: PartialFramePolicy::Drop,
        }
    }
}

impl StereoCalibrationConfig {
    /// Set the minimum number of paired frames.
    pub fn with_min_pairs(mut self, min_pairs: usize) -> Self {
        self.min_pairs = min_pairs;
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

    /// Set the partial frame policy.
    pub fn with_partial_frames(mut self, policy: PartialFramePolicy) -> Self {
        self.partial_frames = policy;
        self
    }

    /// The solver configured with this iteration budget and tolerance.
    pub fn solver(&self) -> LevenbergMarquardt {
        LevenbergMarquardt::default()
            .with_max_iterations(self.max_iterations)
            .with_cost_tolerance(self.epsilon)
    }
}

/// Result of a stereo calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    /// Transform from left camera to right camera coordinates.
    pub extrinsics: ExtrinsicParameters,
    /// Reprojection RMS over the observations of both cameras, in pixels.
    pub rms: f64,
    /// Iterations of the refinement.
    pub iterations: usize,
    /// Number of frames used.
    pub pairs_used: usize,
}

struct ViewPair<'a> {
    left: &'a PatternView,
    right: &'a PatternView,
}

/// Calibrate the transform between two cameras with known intrinsics.
pub fn calibrate_stereo(
    frames: &[StereoFrame],
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
    config: &StereoCalibrationConfig,
) -> Result<StereoCalibration, CalibrationError> {
    calibrate_stereo_with(frames, left, right, config, &config.solver())
}

/// Calibrate the transform between two cameras with a custom least-squares solver.
pub fn calibrate_stereo_with(
    frames: &[StereoFrame],
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
    config: &StereoCalibrationConfig,
    solver: &dyn LeastSquaresSolver,
) -> Result<StereoCalibration, CalibrationError> {
    let pairs = collect_pairs(frames, left, right, config.partial_frames)?;
    if pairs.is_empty() || pairs.len() < config.min_pairs {
        return Err(CalibrationError::InsufficientData {
            obtained: pairs.len(),
            required: config.min_pairs.max(1),
        });
    }

    let board_poses: Vec<(ExtrinsicParameters, ExtrinsicParameters)> = pairs
        .iter()
        .map(|p| Ok((board_pose(left, p.left)?, board_pose(right, p.right)?)))
        .collect::<Result<_, CalibrationError>>()?;
    let left_boards: Vec<ExtrinsicParameters> = board_poses.iter().map(|(l, _)| *l).collect();

    let mut candidates = vec![("board poses", mean_relative_pose(&board_poses))];
    match essential_initialization(&pairs, left, right) {
        Ok(pose) => candidates.push(("essential matrix", pose)),
        Err(e) => log::debug!("essential matrix initialization failed: {e}"),
    }

    let mut best: Option<(Problem, f64, &str)> = None;
    for (name, candidate) in candidates {
        let problem = build_problem(&pairs, left, right, &candidate, &left_boards)?;
        let cost = problem.compute_total_cost().unwrap_or(f64::INFINITY);
        log::debug!("stereo init from {name}: cost {cost:.6e}");
        if best.as_ref().is_none_or(|(_, c, _)| cost < *c) {
            best = Some((problem, cost, name));
        }
    }
    let Some((mut problem, _, name)) = best else {
        return Err(CalibrationError::InitializationFailed(
            "no initial stereo transform".to_string(),
        ));
    };
    log::debug!("stereo refinement seeded from {name}");

    let result = solver.minimize(&mut problem)?;
    let num_obs: usize = pairs.iter().map(|p| p.left.len() + p.right.len()).sum();
    let rms = (result.final_cost / num_obs as f64).sqrt();

    if !accepts(result.termination_reason) {
        return Err(CalibrationError::ConvergenceFailure {
            iterations: result.iterations,
            rms,
        });
    }

    let extrinsics = pose_from_params(problem.values("stereo")?);
    log::info!(
        "stereo calibration: {} pairs, rms {:.4} px, baseline {:.4} after {} iterations",
        pairs.len(),
        rms,
        extrinsics.baseline(),
        result.iterations
    );

    Ok(StereoCalibration {
        extrinsics,
        rms,
        iterations: result.iterations,
        pairs_used: pairs.len(),
    })
}

fn collect_pairs<'a>(
    frames: &'a [StereoFrame],
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
    policy: PartialFramePolicy,
) -> Result<Vec<ViewPair<'a>>, CalibrationError> {
    let mut pairs = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let (l, r) = match (&frame.left, &frame.right) {
            (Some(l), Some(r)) => (l, r),
            (None, None) => continue,
            _ => match policy {
                PartialFramePolicy::Reject => {
                    return Err(CalibrationError::PartialFrame { index });
                }
                PartialFramePolicy::Drop => {
                    log::warn!("frame {index}: pattern seen by one camera only, skipping");
                    continue;
                }
            },
        };
        validate_pair(index, l, r, left, right)?;
        pairs.push(ViewPair { left: l, right: r });
    }
    Ok(pairs)
}

fn validate_pair(
    index: usize,
    l: &PatternView,
    r: &PatternView,
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
) -> Result<(), CalibrationError> {
    let mismatch = |reason: String| CalibrationError::MismatchedViews { index, reason };

    if l.len() != r.len() {
        return Err(mismatch(format!(
            "{} correspondences in the left view, {} in the right",
            l.len(),
            r.len()
        )));
    }
    if l.len() < 4 {
        return Err(mismatch(format!("only {} correspondences", l.len())));
    }
    let same_points = l
        .correspondences
        .iter()
        .zip(&r.correspondences)
        .all(|(a, b)| a.object.iter().zip(&b.object).all(|(x, y)| (x - y).abs() <= 1e-9));
    if !same_points {
        return Err(mismatch("views pair different pattern points".to_string()));
    }
    if l.image_size != left.image_size || r.image_size != right.image_size {
        return Err(mismatch(format!(
            "image sizes {:?} / {:?} differ from the calibrated {:?} / {:?}",
            l.image_size, r.image_size, left.image_size, right.image_size
        )));
    }
    Ok(())
}

fn normalized_points(camera: &IntrinsicParameters, view: &PatternView) -> Vec<Point2> {
    view.correspondences
        .iter()
        .map(|c| camera.pixel_to_normalized(c.image[0], c.image[1]))
        .collect()
}

/// Pose of the pattern in the camera frame from the homography of the
/// undistorted normalized points.
fn board_pose(
    camera: &IntrinsicParameters,
    view: &PatternView,
) -> Result<ExtrinsicParameters, CalibrationError> {
    let plane: Vec<Point2> = view
        .correspondences
        .iter()
        .map(|c| [c.object[0], c.object[1]])
        .collect();
    let h = find_homography(&plane, &normalized_points(camera, view))?;
    Ok(pose_from_homography(&linalg::IDENTITY33, &h)?)
}

/// Chordal mean of the per-frame left-to-right transforms `B_r ∘ B_l⁻¹`.
fn mean_relative_pose(
    board_poses: &[(ExtrinsicParameters, ExtrinsicParameters)],
) -> ExtrinsicParameters {
    let n = board_poses.len().max(1) as f64;
    let mut rot_sum: Mat33 = [[0.0; 3]; 3];
    let mut t_sum = [0.0; 3];
    for (l, r) in board_poses {
        let rel = r.compose(&l.inverse());
        for i in 0..3 {
            t_sum[i] += rel.translation[i] / n;
            for j in 0..3 {
                rot_sum[i][j] += rel.rotation[i][j];
            }
        }
    }
    ExtrinsicParameters::new(linalg::nearest_rotation(&rot_sum), t_sum)
}

/// Relative pose from the essential matrix of all correspondences, scaled
/// with the known spacing of consecutive pattern points.
fn essential_initialization(
    pairs: &[ViewPair],
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
) -> Result<ExtrinsicParameters, CalibrationError> {
    let per_pair: Vec<(Vec<Point2>, Vec<Point2>)> = pairs
        .iter()
        .map(|p| (normalized_points(left, p.left), normalized_points(right, p.right)))
        .collect();
    let x1: Vec<Point2> = per_pair.iter().flat_map(|(a, _)| a.iter().copied()).collect();
    let x2: Vec<Point2> = per_pair.iter().flat_map(|(_, b)| b.iter().copied()).collect();

    let e = essential_8point(&x1, &x2)?;
    let (unit_pose, inliers) = recover_pose(&e, &x1, &x2)?;
    log::debug!("essential matrix: {inliers}/{} points in front of both cameras", x1.len());

    // identity camera matrices: the projections act on normalized coordinates
    let normalized = IntrinsicParameters::new(1.0, 1.0, 0.0, 0.0, left.image_size);
    let p1 = ProjectionMatrix::from_intrinsics(&normalized);
    let p2 = ProjectionMatrix::from_calibration(&normalized, &unit_pose);
    let config = TriangulationConfig::default();

    let mut ratios = Vec::new();
    for (pair, (a, b)) in pairs.iter().zip(&per_pair) {
        let points: Vec<_> = a
            .iter()
            .zip(b)
            .map(|(u, v)| {
                triangulate_point(&p1, &p2, &StereoObservation::new(*u, *v), &config).ok()
            })
            .collect();
        let objects = pair.left.object_points();
        for k in 1..points.len() {
            let (Some(xa), Some(xb)) = (points[k - 1], points[k]) else {
                continue;
            };
            let d_obj = distance(&objects[k - 1], &objects[k]);
            let d_tri = distance(&xa, &xb);
            if d_tri > f64::EPSILON && d_obj > f64::EPSILON {
                ratios.push(d_obj / d_tri);
            }
        }
    }

    if ratios.is_empty() {
        return Err(CalibrationError::InitializationFailed(
            "no triangulated pattern points to recover the scale".to_string(),
        ));
    }
    ratios.sort_by(|a, b| a.total_cmp(b));
    let scale = ratios[ratios.len() / 2];

    Ok(ExtrinsicParameters::new(
        unit_pose.rotation,
        unit_pose.translation.map(|v| v * scale),
    ))
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    linalg::norm_vec3(&[a[0] - b[0], a[1] - b[1], a[2] - b[2]])
}

fn build_problem(
    pairs: &[ViewPair],
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
    stereo: &ExtrinsicParameters,
    boards: &[ExtrinsicParameters],
) -> Result<Problem, CalibrationError> {
    let mut problem = Problem::new();
    problem.add_variable(Variable::new("stereo", pose_to_params(stereo)))?;
    for (i, (pair, board)) in pairs.iter().zip(boards).enumerate() {
        let name = format!("board{i}");
        problem.add_variable(Variable::new(name.clone(), pose_to_params(board)))?;
        problem.add_factor(
            Box::new(StereoViewFactor {
                left: *left,
                right: *right,
                left_points: pair.left.image_points(),
                right_points: pair.right.image_points(),
                object_points: pair.left.object_points(),
            }),
            vec![name, "stereo".to_string()],
        )?;
    }
    Ok(problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use stereocalib_imgproc::chessboard::PatternGeometry;

    fn view(camera: &IntrinsicParameters, pose: &ExtrinsicParameters) -> PatternView {
        let geometry = PatternGeometry::new(5, 4, 0.1);
        let corners: Vec<Point2> = geometry
            .object_points()
            .iter()
            .filter_map(|p| camera.project(pose, p))
            .collect();
        PatternView::from_corners(&geometry, &corners, camera.image_size)
            .expect("all corners project")
    }

    fn camera() -> IntrinsicParameters {
        IntrinsicParameters::new(800.0, 800.0, 320.0, 240.0, (640, 480))
    }

    #[test]
    fn test_mean_relative_pose() {
        let stereo = ExtrinsicParameters::from_axis_angle(&[0.0, 0.05, 0.0], [-0.3, 0.0, 0.01]);
        let poses: Vec<_> = [[0.1, 0.2, 0.0], [-0.2, 0.1, 0.1], [0.0, -0.3, 0.05]]
            .iter()
            .map(|r| {
                let l = ExtrinsicParameters::from_axis_angle(r, [-0.2, -0.1, 1.5]);
                (l, stereo.compose(&l))
            })
            .collect();

        let mean = mean_relative_pose(&poses);
        for i in 0..3 {
            assert_relative_eq!(mean.translation[i], stereo.translation[i], epsilon = 1e-12);
            for j in 0..3 {
                assert_relative_eq!(mean.rotation[i][j], stereo.rotation[i][j], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_partial_frame_policies() {
        let k = camera();
        let pose = ExtrinsicParameters::from_axis_angle(&[0.1, 0.0, 0.0], [-0.2, -0.15, 1.5]);
        let frames = vec![
            StereoFrame::new(Some(view(&k, &pose)), Some(view(&k, &pose))),
            StereoFrame::new(Some(view(&k, &pose)), None),
            StereoFrame::new(None, None),
        ];

        let pairs = collect_pairs(&frames, &k, &k, PartialFramePolicy::Drop);
        assert!(matches!(pairs, Ok(ref p) if p.len() == 1));

        let rejected = collect_pairs(&frames, &k, &k, PartialFramePolicy::Reject);
        assert!(matches!(rejected, Err(CalibrationError::PartialFrame { index: 1 })));
    }

    #[test]
    fn test_mismatched_views() {
        let k = camera();
        let pose = ExtrinsicParameters::from_axis_angle(&[0.1, 0.0, 0.0], [-0.2, -0.15, 1.5]);
        let mut short = view(&k, &pose);
        short.correspondences.pop();
        let frames = vec![StereoFrame::new(Some(view(&k, &pose)), Some(short))];
        assert!(matches!(
            collect_pairs(&frames, &k, &k, PartialFramePolicy::Drop),
            Err(CalibrationError::MismatchedViews { index: 0, .. })
        ));

        let mut shifted = view(&k, &pose);
        shifted.correspondences[3].object[0] += 0.05;
        let frames = vec![StereoFrame::new(Some(view(&k, &pose)), Some(shifted))];
        assert!(matches!(
            collect_pairs(&frames, &k, &k, PartialFramePolicy::Drop),
            Err(CalibrationError::MismatchedViews { index: 0, .. })
        ));
    }

    #[test]
    fn test_board_pose_from_normalized_homography() -> Result<(), CalibrationError> {
        let k = camera();
        let pose = ExtrinsicParameters::from_axis_angle(&[0.2, -0.1, 0.05], [-0.2, -0.1, 1.8]);
        let est = board_pose(&k, &view(&k, &pose))?;
        for i in 0..3 {
            assert_relative_eq!(est.translation[i], pose.translation[i], epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_insufficient_pairs() {
        let k = camera();
        let pose = ExtrinsicParameters::from_axis_angle(&[0.1, 0.0, 0.0], [-0.2, -0.15, 1.5]);
        let frames = vec![StereoFrame::new(Some(view(&k, &pose)), Some(view(&k, &pose))); 3];
        let res = calibrate_stereo(&frames, &k, &k, &StereoCalibrationConfig::default());
        assert!(matches!(
            res,
            Err(CalibrationError::InsufficientData {
                obtained: 3,
                required: 4
            })
        ));
    }
}
