use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereocalib_optim::{
    central_difference_jacobian, Factor, FactorError, FactorResult, LeastSquaresSolver,
    LevenbergMarquardt, LinearizationResult, OptimizerError, Problem, Variable,
};

use crate::linalg;
use crate::projection::ProjectionMatrix;
use crate::{Point2, Point3};

/// Errors returned by triangulation.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TriangulationError {
    /// The two rays do not determine a unique finite point in front of both cameras.
    #[error("Degenerate geometry: {reason}")]
    DegenerateGeometry {
        /// What made the geometry degenerate.
        reason: &'static str,
    },

    /// An observation or projection contains NaN or infinite values.
    #[error("Non-finite input to triangulation")]
    NonFiniteInput,

    /// The refinement of a triangulated point failed.
    #[error("Point refinement failed: {0}")]
    RefinementFailed(String),
}

/// A pair of pixel observations of the same 3D point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoObservation {
    /// Pixel in the first (reference) camera.
    pub left: Point2,
    /// Pixel in the second camera.
    pub right: Point2,
}

impl StereoObservation {
    /// Create a new observation pair.
    pub fn new(left: Point2, right: Point2) -> Self {
        Self { left, right }
    }
}

/// Thresholds used to detect degenerate triangulation geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriangulationConfig {
    /// Reject when `σ₃ / σ₁` of the DLT system is below this ratio (coincident rays).
    pub min_singular_ratio: f64,
    /// Reject when `|w| / ‖X̃‖` is below this value (point at infinity).
    pub min_homogeneous_scale: f64,
    /// Reject points whose depth in either camera is not positive.
    pub require_positive_depth: bool,
    /// Depths at or below this value count as non positive.
    pub min_depth: f64,
    /// Reject when the angle between the two rays at the point is below this
    /// value, in radians (camera centres too close for the point's distance).
    pub min_parallax: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_singular_ratio: 1e-9,
            min_homogeneous_scale: 1e-12,
            require_positive_depth: true,
            min_depth: 1e-9,
            min_parallax: 1e-3,
        }
    }
}

impl TriangulationConfig {
    /// Set the singular value ratio threshold.
    pub fn with_min_singular_ratio(mut self, ratio: f64) -> Self {
        self.min_singular_ratio = ratio;
        self
    }

    /// Set the minimum ray angle at the point, in radians.
    pub fn with_min_parallax(mut self, radians: f64) -> Self {
        self.min_parallax = radians;
        self
    }

    /// Enable or disable the positive depth check.
    pub fn with_positive_depth(mut self, require: bool) -> Self {
        self.require_positive_depth = require;
        self
    }
}

/// Reconstruct a 3D point from a stereo observation.
pub trait Triangulator: Send + Sync {
    /// Triangulate one observation pair seen through `p1` and `p2`.
    fn triangulate(
        &self,
        p1: &ProjectionMatrix,
        p2: &ProjectionMatrix,
        obs: &StereoObservation,
    ) -> Result<Point3, TriangulationError>;
}

/// Linear triangulation by the direct linear transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct DltTriangulator {
    /// The degeneracy thresholds.
    pub config: TriangulationConfig,
}

impl DltTriangulator {
    /// Create a triangulator with the given thresholds.
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }
}

impl Triangulator for DltTriangulator {
    fn triangulate(
        &self,
        p1: &ProjectionMatrix,
        p2: &ProjectionMatrix,
        obs: &StereoObservation,
    ) -> Result<Point3, TriangulationError> {
        triangulate_point(p1, p2, obs, &self.config)
    }
}

/// Triangulate a single point with the DLT and check it for degeneracy.
///
/// For each camera `P` and pixel `(u, v)` the rows `v·P₃ − P₂` and
/// `P₁ − u·P₃` are stacked into a 4x4 system `A X̃ = 0`, solved by SVD.
/// The point is rejected when the rays meet at less than
/// [`TriangulationConfig::min_parallax`], which also catches nearly
/// coincident camera centres under pixel noise.
///
/// # Arguments
///
/// * `p1` - Projection matrix of the reference camera.
/// * `p2` - Projection matrix of the second camera.
/// * `obs` - The undistorted pixels in both cameras.
/// * `config` - The degeneracy thresholds.
pub fn triangulate_point(
    p1: &ProjectionMatrix,
    p2: &ProjectionMatrix,
    obs: &StereoObservation,
    config: &TriangulationConfig,
) -> Result<Point3, TriangulationError> {
    let finite = obs.left.iter().chain(&obs.right).all(|v| v.is_finite())
        && p1
            .as_array()
            .iter()
            .chain(p2.as_array())
            .flatten()
            .all(|v| v.is_finite());
    if !finite {
        return Err(TriangulationError::NonFiniteInput);
    }

    let (xh, singular) = solve_dlt(p1.as_array(), p2.as_array(), &obs.left, &obs.right);

    if singular[0] <= 0.0 || singular[2] < config.min_singular_ratio * singular[0] {
        return Err(TriangulationError::DegenerateGeometry {
            reason: "rays are coincident",
        });
    }

    let norm = xh.iter().map(|v| v * v).sum::<f64>().sqrt();
    let w = xh[3];
    if w.abs() < config.min_homogeneous_scale * norm {
        return Err(TriangulationError::DegenerateGeometry {
            reason: "rays are parallel, point at infinity",
        });
    }

    let x = [xh[0] / w, xh[1] / w, xh[2] / w];

    if config.require_positive_depth
        && (p1.depth(&x) <= config.min_depth || p2.depth(&x) <= config.min_depth)
    {
        return Err(TriangulationError::DegenerateGeometry {
            reason: "point is not in front of both cameras",
        });
    }

    if parallax(p1, p2, &x).is_none_or(|angle| angle < config.min_parallax) {
        return Err(TriangulationError::DegenerateGeometry {
            reason: "rays are nearly parallel, insufficient parallax",
        });
    }

    Ok(x)
}

/// Angle in radians between the rays from both camera centres to `x`.
fn parallax(p1: &ProjectionMatrix, p2: &ProjectionMatrix, x: &Point3) -> Option<f64> {
    let (c1, c2) = (p1.centre()?, p2.centre()?);
    let r1 = [x[0] - c1[0], x[1] - c1[1], x[2] - c1[2]];
    let r2 = [x[0] - c2[0], x[1] - c2[1], x[2] - c2[2]];
    let sin = linalg::norm_vec3(&linalg::cross_vec3(&r1, &r2));
    Some(sin.atan2(linalg::dot_product3(&r1, &r2)))
}

/// Solve the homogeneous DLT system of two views.
///
/// Returns the homogeneous point and the four singular values of `A` in
/// non-increasing order.
pub(crate) fn solve_dlt(
    p1: &[[f64; 4]; 3],
    p2: &[[f64; 4]; 3],
    x1: &Point2,
    x2: &Point2,
) -> ([f64; 4], Vec<f64>) {
    let mut a = faer::Mat::<f64>::zeros(4, 4);
    write_dlt_row(&mut a, 0, x1[1], &p1[2], &p1[1], 1.0);
    write_dlt_row(&mut a, 1, x1[0], &p1[2], &p1[0], -1.0);
    write_dlt_row(&mut a, 2, x2[1], &p2[2], &p2[1], 1.0);
    write_dlt_row(&mut a, 3, x2[0], &p2[2], &p2[0], -1.0);

    let (null, singular) = linalg::null_vector(&a);
    ([null[0], null[1], null[2], null[3]], singular)
}

/// Write `sign · (x·P₃ − Pᵢ)` into row `row` of `a`.
fn write_dlt_row(
    a: &mut faer::Mat<f64>,
    row: usize,
    x: f64,
    p3: &[f64; 4],
    pi: &[f64; 4],
    sign: f64,
) {
    for j in 0..4 {
        a.write(row, j, sign * (x * p3[j] - pi[j]));
    }
}

/// Wraps a triangulator and refines its result by minimizing the reprojection
/// error in both images with Levenberg-Marquardt.
#[derive(Debug, Clone)]
pub struct RefinedTriangulator<T> {
    inner: T,
    solver: LevenbergMarquardt,
}

impl<T: Triangulator> RefinedTriangulator<T> {
    /// Refine the points produced by `inner`.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            solver: LevenbergMarquardt::default()
                .with_max_iterations(20)
                .with_cost_tolerance(1e-12),
        }
    }

    /// Use a custom solver configuration.
    pub fn with_solver(mut self, solver: LevenbergMarquardt) -> Self {
        self.solver = solver;
        self
    }

    /// The wrapped triangulator.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Triangulator> Triangulator for RefinedTriangulator<T> {
    fn triangulate(
        &self,
        p1: &ProjectionMatrix,
        p2: &ProjectionMatrix,
        obs: &StereoObservation,
    ) -> Result<Point3, TriangulationError> {
        let initial = self.inner.triangulate(p1, p2, obs)?;

        let refine = || -> Result<Point3, OptimizerError> {
            let mut problem = Problem::new();
            problem.add_variable(Variable::new("point", initial.to_vec()))?;
            for (p, uv) in [(p1, obs.left), (p2, obs.right)] {
                problem.add_factor(
                    Box::new(PointReprojectionFactor { projection: *p, uv }),
                    vec!["point".to_string()],
                )?;
            }
            let result = self.solver.minimize(&mut problem)?;
            log::trace!(
                "point refinement: cost {:.3e} -> {:.3e} in {} iterations",
                result.initial_cost,
                result.final_cost,
                result.iterations
            );
            let v = problem.values("point")?;
            Ok([v[0], v[1], v[2]])
        };

        let refined = refine().map_err(|e| TriangulationError::RefinementFailed(e.to_string()))?;
        if !refined.iter().all(|v| v.is_finite()) {
            return Err(TriangulationError::RefinementFailed(
                "non-finite refined point".to_string(),
            ));
        }
        Ok(refined)
    }
}

/// Pixel reprojection residual of a 3D point in one camera.
struct PointReprojectionFactor {
    projection: ProjectionMatrix,
    uv: Point2,
}

impl PointReprojectionFactor {
    fn residual(&self, x: &[f64]) -> FactorResult<Vec<f64>> {
        let uv = self
            .projection
            .project(&[x[0], x[1], x[2]])
            .ok_or_else(|| FactorError::InvalidParameters("point on principal plane".into()))?;
        Ok(vec![uv[0] - self.uv[0], uv[1] - self.uv[1]])
    }
}

impl Factor for PointReprojectionFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        if params.len() != 1 || params[0].len() != 3 {
            return Err(FactorError::DimensionMismatch {
                expected: 3,
                actual: params.first().map_or(0, |p| p.len()),
            });
        }
        let residual = self.residual(params[0])?;
        let jacobian = if compute_jacobian {
            Some(central_difference_jacobian(params, 2, |p: &[&[f64]]| {
                self.residual(p[0])
            })?)
        } else {
            None
        };
        Ok(LinearizationResult::new(residual, jacobian, 3))
    }

    fn residual_dim(&self) -> usize {
        2
    }

    fn num_variables(&self) -> usize {
        1
    }

    fn variable_dim(&self, _idx: usize) -> usize {
        3
    }
}

/// Triangulate a batch of observations sequentially.
///
/// Results are returned in input order; a degenerate observation yields an
/// error in its slot and does not abort the batch.
pub fn triangulate_batch<T: Triangulator + ?Sized>(
    triangulator: &T,
    p1: &ProjectionMatrix,
    p2: &ProjectionMatrix,
    observations: &[StereoObservation],
) -> Vec<Result<Point3, TriangulationError>> {
    observations
        .iter()
        .map(|obs| triangulator.triangulate(p1, p2, obs))
        .collect()
}

/// Triangulate a batch of observations in parallel.
///
/// Same output as [`triangulate_batch`], computed with rayon.
pub fn par_triangulate_batch<T: Triangulator + ?Sized>(
    triangulator: &T,
    p1: &ProjectionMatrix,
    p2: &ProjectionMatrix,
    observations: &[StereoObservation],
) -> Vec<Result<Point3, TriangulationError>> {
    observations
        .par_iter()
        .map(|obs| triangulator.triangulate(p1, p2, obs))
        .collect()
}

/// Triangulate a time series of keypoint frames.
///
/// Each frame holds one optional observation per keypoint. Missing
/// observations stay `None`; degenerate ones become `None` and are logged.
pub fn triangulate_sequence<T: Triangulator + ?Sized>(
    triangulator: &T,
    p1: &ProjectionMatrix,
    p2: &ProjectionMatrix,
    frames: &[Vec<Option<StereoObservation>>],
) -> Vec<Vec<Option<Point3>>> {
    frames
        .par_iter()
        .enumerate()
        .map(|(frame_idx, frame)| {
            frame
                .iter()
                .enumerate()
                .map(|(kpt_idx, obs)| {
                    let obs = obs.as_ref()?;
                    match triangulator.triangulate(p1, p2, obs) {
                        Ok(p) => Some(p),
                        Err(e) => {
                            log::warn!("frame {frame_idx}, keypoint {kpt_idx}: {e}");
                            None
                        }
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{ExtrinsicParameters, IntrinsicParameters};
    use approx::assert_relative_eq;

    fn rig(t: [f64; 3]) -> (ProjectionMatrix, ProjectionMatrix) {
        let k = IntrinsicParameters::new(800.0, 800.0, 320.0, 240.0, (640, 480));
        (
            ProjectionMatrix::from_intrinsics(&k),
            ProjectionMatrix::from_calibration(&k, &ExtrinsicParameters::new(linalg::IDENTITY33, t)),
        )
    }

    #[test]
    fn test_solve_dlt_rows() {
        let (p1, p2) = rig([0.3, 0.0, 0.0]);
        let (xh, singular) = solve_dlt(p1.as_array(), p2.as_array(), &[368.0, 288.0], &[488.0, 288.0]);
        assert_eq!(singular.len(), 4);
        assert!(singular.windows(2).all(|w| w[0] >= w[1]));
        assert_relative_eq!(xh[0] / xh[3], 0.12, epsilon = 1e-9);
        assert_relative_eq!(xh[2] / xh[3], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_parallel_rays() {
        let (p1, p2) = rig([0.3, 0.0, 0.0]);
        let obs = StereoObservation::new([320.0, 240.0], [320.0, 240.0]);
        let res = triangulate_point(&p1, &p2, &obs, &TriangulationConfig::default());
        assert!(matches!(
            res,
            Err(TriangulationError::DegenerateGeometry { .. })
        ));
    }

    #[test]
    fn test_behind_camera() {
        let (p1, p2) = rig([0.3, 0.0, 0.0]);
        // negative disparity puts the point behind the rig
        let obs = StereoObservation::new([368.0, 288.0], [300.0, 288.0]);
        let config = TriangulationConfig::default();
        assert!(triangulate_point(&p1, &p2, &obs, &config).is_err());
        assert!(triangulate_point(&p1, &p2, &obs, &config.with_positive_depth(false)).is_ok());
    }

    #[test]
    fn test_nearly_coincident_centres() {
        let config = TriangulationConfig::default();
        for baseline in [1e-4, 1e-6, 1e-8] {
            let (p1, p2) = rig([baseline, 0.0, 0.0]);
            // a point at 2 m, right pixel off by a fraction of a pixel
            let x = [0.12, 0.12, 2.0];
            let (l, r) = (p1.project(&x).unwrap(), p2.project(&x).unwrap());
            let obs = StereoObservation::new(l, [r[0] + 0.3, r[1] - 0.2]);
            let res = triangulate_point(&p1, &p2, &obs, &config);
            assert!(
                matches!(res, Err(TriangulationError::DegenerateGeometry { .. })),
                "baseline {baseline}: {res:?}"
            );
        }
    }

    #[test]
    fn test_parallax_threshold() {
        // 0.3 m baseline at 2 m gives about 0.147 rad of parallax
        let (p1, p2) = rig([0.3, 0.0, 0.0]);
        let obs = StereoObservation::new([368.0, 288.0], [488.0, 288.0]);
        let config = TriangulationConfig::default();
        assert!(triangulate_point(&p1, &p2, &obs, &config).is_ok());
        assert!(triangulate_point(&p1, &p2, &obs, &config.with_min_parallax(0.2)).is_err());
        assert!(parallax(&p1, &p2, &[0.12, 0.12, 2.0]).is_some_and(|a| (a - 0.1468).abs() < 1e-3));
    }

    #[test]
    fn test_non_finite() {
        let (p1, p2) = rig([0.3, 0.0, 0.0]);
        let obs = StereoObservation::new([f64::NAN, 288.0], [488.0, 288.0]);
        assert_eq!(
            triangulate_point(&p1, &p2, &obs, &TriangulationConfig::default()),
            Err(TriangulationError::NonFiniteInput)
        );
    }
}
