use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereocalib_3d::camera::{ExtrinsicParameters, IntrinsicParameters};
use stereocalib_3d::projection::ProjectionMatrix;
use stereocalib_3d::triangulation::{
    triangulate_sequence, StereoObservation, TriangulationError, Triangulator,
};
use stereocalib_3d::Point3;

/// Both cameras of a calibrated pair and the transform between them.
///
/// Points are expressed in left camera coordinates; the right camera sees
/// `X2 = R X1 + T`.
#[derive(
    Debug, Clone, Copy, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct StereoRig {
    /// The left (reference) camera.
    pub left: IntrinsicParameters,
    /// The right camera.
    pub right: IntrinsicParameters,
    /// Transform from left to right camera coordinates.
    pub extrinsics: ExtrinsicParameters,
}

impl StereoRig {
    /// Create a rig from its calibrated parts.
    pub fn new(
        left: IntrinsicParameters,
        right: IntrinsicParameters,
        extrinsics: ExtrinsicParameters,
    ) -> Self {
        Self {
            left,
            right,
            extrinsics,
        }
    }

    /// The projection matrices `K1 [I | 0]` and `K2 [R | T]`.
    pub fn projection_matrices(&self) -> (ProjectionMatrix, ProjectionMatrix) {
        (
            ProjectionMatrix::from_intrinsics(&self.left),
            ProjectionMatrix::from_calibration(&self.right, &self.extrinsics),
        )
    }

    /// Remove lens distortion from both pixels of an observation.
    pub fn undistort_observation(&self, obs: &StereoObservation) -> StereoObservation {
        StereoObservation::new(
            self.left.undistort_pixel(obs.left[0], obs.left[1]),
            self.right.undistort_pixel(obs.right[0], obs.right[1]),
        )
    }

    /// Triangulate a raw (distorted) observation.
    pub fn triangulate<T: Triangulator + ?Sized>(
        &self,
        triangulator: &T,
        obs: &StereoObservation,
    ) -> Result<Point3, TriangulationError> {
        let (p1, p2) = self.projection_matrices();
        triangulator.triangulate(&p1, &p2, &self.undistort_observation(obs))
    }

    /// Triangulate raw observations in parallel, in input order.
    pub fn triangulate_points<T: Triangulator + ?Sized>(
        &self,
        triangulator: &T,
        observations: &[StereoObservation],
    ) -> Vec<Result<Point3, TriangulationError>> {
        let (p1, p2) = self.projection_matrices();
        observations
            .par_iter()
            .map(|obs| triangulator.triangulate(&p1, &p2, &self.undistort_observation(obs)))
            .collect()
    }

    /// Triangulate a time series of raw keypoint frames; missing or
    /// degenerate keypoints are `None`.
    pub fn triangulate_frames<T: Triangulator + ?Sized>(
        &self,
        triangulator: &T,
        frames: &[Vec<Option<StereoObservation>>],
    ) -> Vec<Vec<Option<Point3>>> {
        let undistorted: Vec<Vec<Option<StereoObservation>>> = frames
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .map(|obs| obs.as_ref().map(|o| self.undistort_observation(o)))
                    .collect()
            })
            .collect();
        let (p1, p2) = self.projection_matrices();
        triangulate_sequence(triangulator, &p1, &p2, &undistorted)
    }

    /// Project a point in left camera coordinates into both images.
    pub fn project(&self, p: &Point3) -> Option<([f64; 2], [f64; 2])> {
        let left = self.left.project_camera_point(p)?;
        let right = self.right.project(&self.extrinsics, p)?;
        Some((left, right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use stereocalib_3d::camera::Distortion;
    use stereocalib_3d::triangulation::{DltTriangulator, TriangulationConfig};

    fn rig() -> StereoRig {
        let k = IntrinsicParameters::new(800.0, 800.0, 320.0, 240.0, (640, 480))
            .with_distortion(Distortion::from_array([-0.1, 0.02, 0.0, 0.0, 0.0]));
        StereoRig::new(
            k,
            k,
            ExtrinsicParameters::from_axis_angle(&[0.0, -0.05, 0.0], [-0.3, 0.0, 0.0]),
        )
    }

    #[test]
    fn test_triangulate_distorted_observation() -> Result<(), TriangulationError> {
        let rig = rig();
        let tri = DltTriangulator::new(TriangulationConfig::default());
        let point = [0.25, -0.1, 2.5];
        let (left, right) = rig.project(&point).ok_or(TriangulationError::NonFiniteInput)?;

        let est = rig.triangulate(&tri, &StereoObservation::new(left, right))?;
        for i in 0..3 {
            assert_relative_eq!(est[i], point[i], epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_triangulate_frames_keeps_missing() {
        let rig = rig();
        let tri = DltTriangulator::new(TriangulationConfig::default());
        let obs = rig
            .project(&[0.0, 0.0, 2.0])
            .map(|(l, r)| StereoObservation::new(l, r));
        let out = rig.triangulate_frames(&tri, &[vec![obs, None]]);
        assert_eq!(out.len(), 1);
        assert!(out[0][0].is_some());
        assert!(out[0][1].is_none());
    }
}
