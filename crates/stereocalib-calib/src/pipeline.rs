use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereocalib_image::Image;
use stereocalib_imgproc::chessboard::{
    find_pattern, ChessboardParams, DetectionError, PatternGeometry, PatternView,
};

use crate::intrinsic::{calibrate_intrinsics, IntrinsicCalibration, IntrinsicCalibrationConfig};
use crate::rig::StereoRig;
use crate::stereo::{
    calibrate_stereo, StereoCalibration, StereoCalibrationConfig, StereoFrame,
};
use crate::CalibrationError;

/// Parameters of the end-to-end rig calibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RigCalibrationConfig {
    /// Chessboard detector parameters.
    pub detector: ChessboardParams,
    /// Per camera calibration parameters.
    pub intrinsic: IntrinsicCalibrationConfig,
    /// Stereo calibration parameters.
    pub stereo: StereoCalibrationConfig,
}

impl RigCalibrationConfig {
    /// Set the detector parameters.
    pub fn with_detector(mut self, detector: ChessboardParams) -> Self {
        self.detector = detector;
        self
    }

    /// Set the per camera calibration parameters.
    pub fn with_intrinsic(mut self, intrinsic: IntrinsicCalibrationConfig) -> Self {
        self.intrinsic = intrinsic;
        self
    }

    /// Set the stereo calibration parameters.
    pub fn with_stereo(mut self, stereo: StereoCalibrationConfig) -> Self {
        self.stereo = stereo;
        self
    }
}

/// Result of the end-to-end rig calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigCalibration {
    /// Calibration of the left camera.
    pub left: IntrinsicCalibration,
    /// Calibration of the right camera.
    pub right: IntrinsicCalibration,
    /// Calibration of the transform between the cameras.
    pub stereo: StereoCalibration,
}

impl RigCalibration {
    /// The calibrated rig.
    pub fn rig(&self) -> StereoRig {
        StereoRig::new(
            self.left.intrinsics,
            self.right.intrinsics,
            self.stereo.extrinsics,
        )
    }
}

/// Detect the pattern in time-aligned image pairs.
///
/// Images where the pattern is not found leave the corresponding side of the
/// frame empty; any other detection error aborts.
pub fn detect_frames(
    left_images: &[Image<u8, 1>],
    right_images: &[Image<u8, 1>],
    geometry: &PatternGeometry,
    params: &ChessboardParams,
) -> Result<Vec<StereoFrame>, CalibrationError> {
    if left_images.len() != right_images.len() {
        return Err(CalibrationError::FrameCountMismatch {
            left: left_images.len(),
            right: right_images.len(),
        });
    }

    let detect = |index: usize, side: &str, image: &Image<u8, 1>| {
        match find_pattern(image, geometry, params) {
            Ok(view) => Ok(Some(view)),
            Err(DetectionError::NotFound { found, expected }) => {
                log::debug!("frame {index} {side}: {found}/{expected} corners, pattern not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    };

    let frames = left_images
        .par_iter()
        .zip(right_images.par_iter())
        .enumerate()
        .map(|(index, (l, r))| {
            Ok(StereoFrame::new(
                detect(index, "left", l)?,
                detect(index, "right", r)?,
            ))
        })
        .collect::<Result<Vec<_>, DetectionError>>()?;

    let count = |f: fn(&StereoFrame) -> bool| frames.iter().filter(|x| f(x)).count();
    log::info!(
        "pattern found in {} left, {} right and {} paired frames of {}",
        count(|f| f.left.is_some()),
        count(|f| f.right.is_some()),
        count(|f| f.is_complete()),
        frames.len()
    );

    Ok(frames)
}

/// Calibrate a camera pair from time-aligned grayscale image pairs.
pub fn calibrate_rig(
    left_images: &[Image<u8, 1>],
    right_images: &[Image<u8, 1>],
    geometry: &PatternGeometry,
    config: &RigCalibrationConfig,
) -> Result<RigCalibration, CalibrationError> {
    let frames = detect_frames(left_images, right_images, geometry, &config.detector)?;
    calibrate_rig_from_frames(&frames, config)
}

/// Calibrate a camera pair from already detected frames.
///
/// Each camera is calibrated from every frame where it saw the pattern, the
/// two calibrations running concurrently; the stereo calibration then uses the
/// frames seen by both.
pub fn calibrate_rig_from_frames(
    frames: &[StereoFrame],
    config: &RigCalibrationConfig,
) -> Result<RigCalibration, CalibrationError> {
    let left_views: Vec<PatternView> = frames.iter().filter_map(|f| f.left.clone()).collect();
    let right_views: Vec<PatternView> = frames.iter().filter_map(|f| f.right.clone()).collect();

    let (left, right) = rayon::join(
        || calibrate_intrinsics(&left_views, &config.intrinsic),
        || calibrate_intrinsics(&right_views, &config.intrinsic),
    );
    let (left, right) = (left?, right?);
    log::info!(
        "intrinsics: left rms {:.4} px, right rms {:.4} px",
        left.rms,
        right.rms
    );

    let stereo = calibrate_stereo(frames, &left.intrinsics, &right.intrinsics, &config.stereo)?;

    Ok(RigCalibration {
        left,
        right,
        stereo,
    })
}
