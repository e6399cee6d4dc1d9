use stereocalib_3d::camera::{Distortion, ExtrinsicParameters, IntrinsicParameters};
use stereocalib_3d::{Point2, Point3};
use stereocalib_optim::{
    central_difference_jacobian, Factor, FactorError, FactorResult, LinearizationResult,
};

/// `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
pub(crate) const CAMERA_DIM: usize = 9;

/// `[rx, ry, rz, tx, ty, tz]` with the rotation as an axis-angle vector.
pub(crate) const POSE_DIM: usize = 6;

pub(crate) fn pose_to_params(pose: &ExtrinsicParameters) -> Vec<f64> {
    let r = pose.axis_angle();
    let t = pose.translation;
    vec![r[0], r[1], r[2], t[0], t[1], t[2]]
}

pub(crate) fn pose_from_params(p: &[f64]) -> ExtrinsicParameters {
    ExtrinsicParameters::from_axis_angle(&[p[0], p[1], p[2]], [p[3], p[4], p[5]])
}

pub(crate) fn intrinsics_to_params(k: &IntrinsicParameters) -> Vec<f64> {
    let mut p = vec![k.fx, k.fy, k.cx, k.cy];
    p.extend_from_slice(&k.distortion.to_array());
    p
}

pub(crate) fn intrinsics_from_params(p: &[f64], image_size: (usize, usize)) -> IntrinsicParameters {
    IntrinsicParameters::new(p[0], p[1], p[2], p[3], image_size)
        .with_distortion(Distortion::from_array([p[4], p[5], p[6], p[7], p[8]]))
}

/// Write the reprojection residuals of one view into `out`.
///
/// Fails when a point lands behind the camera, which lets the solver reject
/// the step that caused it.
pub(crate) fn reprojection_residuals(
    camera: &IntrinsicParameters,
    pose: &ExtrinsicParameters,
    image_points: &[Point2],
    object_points: &[Point3],
    out: &mut Vec<f64>,
) -> FactorResult<()> {
    for (uv, xyz) in image_points.iter().zip(object_points) {
        let proj = camera
            .project(pose, xyz)
            .ok_or_else(|| FactorError::InvalidParameters("point behind camera".into()))?;
        out.push(proj[0] - uv[0]);
        out.push(proj[1] - uv[1]);
    }
    Ok(())
}

fn check_dims(params: &[&[f64]], dims: &[usize]) -> FactorResult<()> {
    if params.len() != dims.len() {
        return Err(FactorError::DimensionMismatch {
            expected: dims.len(),
            actual: params.len(),
        });
    }
    for (p, &d) in params.iter().zip(dims) {
        if p.len() != d {
            return Err(FactorError::DimensionMismatch {
                expected: d,
                actual: p.len(),
            });
        }
    }
    Ok(())
}

/// Reprojection error of one pattern view.
///
/// Variables: the camera `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` and the pose
/// of the pattern in the camera frame.
pub(crate) struct IntrinsicViewFactor {
    pub image_size: (usize, usize),
    pub image_points: Vec<Point2>,
    pub object_points: Vec<Point3>,
}

impl IntrinsicViewFactor {
    fn residual(&self, camera: &[f64], pose: &[f64]) -> FactorResult<Vec<f64>> {
        let camera = intrinsics_from_params(camera, self.image_size);
        let pose = pose_from_params(pose);
        let mut out = Vec::with_capacity(self.residual_dim());
        reprojection_residuals(
            &camera,
            &pose,
            &self.image_points,
            &self.object_points,
            &mut out,
        )?;
        Ok(out)
    }
}

impl Factor for IntrinsicViewFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        check_dims(params, &[CAMERA_DIM, POSE_DIM])?;
        let residual = self.residual(params[0], params[1])?;
        let jacobian = if compute_jacobian {
            Some(central_difference_jacobian(
                params,
                self.residual_dim(),
                |p: &[&[f64]]| self.residual(p[0], p[1]),
            )?)
        } else {
            None
        };
        Ok(LinearizationResult::new(
            residual,
            jacobian,
            CAMERA_DIM + POSE_DIM,
        ))
    }

    fn residual_dim(&self) -> usize {
        2 * self.image_points.len()
    }

    fn num_variables(&self) -> usize {
        2
    }

    fn variable_dim(&self, idx: usize) -> usize {
        match idx {
            0 => CAMERA_DIM,
            _ => POSE_DIM,
        }
    }
}

/// Reprojection error of one stereo pair of pattern views with both cameras fixed.
///
/// Variables: the pattern pose in the left camera and the left-to-right
/// transform. The right camera sees the pattern through `stereo ∘ board`.
pub(crate) struct StereoViewFactor {
    pub left: IntrinsicParameters,
    pub right: IntrinsicParameters,
    pub left_points: Vec<Point2>,
    pub right_points: Vec<Point2>,
    pub object_points: Vec<Point3>,
}

impl StereoViewFactor {
    fn residual(&self, board: &[f64], stereo: &[f64]) -> FactorResult<Vec<f64>> {
        let board = pose_from_params(board);
        let stereo = pose_from_params(stereo);
        let mut out = Vec::with_capacity(self.residual_dim());
        reprojection_residuals(
            &self.left,
            &board,
            &self.left_points,
            &self.object_points,
            &mut out,
        )?;
        reprojection_residuals(
            &self.right,
            &stereo.compose(&board),
            &self.right_points,
            &self.object_points,
            &mut out,
        )?;
        Ok(out)
    }
}

impl Factor for StereoViewFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        check_dims(params, &[POSE_DIM, POSE_DIM])?;
        let residual = self.residual(params[0], params[1])?;
        let jacobian = if compute_jacobian {
            Some(central_difference_jacobian(
                params,
                self.residual_dim(),
                |p: &[&[f64]]| self.residual(p[0], p[1]),
            )?)
        } else {
            None
        };
        Ok(LinearizationResult::new(residual, jacobian, 2 * POSE_DIM))
    }

    fn residual_dim(&self) -> usize {
        2 * (self.left_points.len() + self.right_points.len())
    }

    fn num_variables(&self) -> usize {
        2
    }

    fn variable_dim(&self, _idx: usize) -> usize {
        POSE_DIM
    }
}
