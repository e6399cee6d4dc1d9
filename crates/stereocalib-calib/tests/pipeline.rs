use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stereocalib_3d::camera::{ExtrinsicParameters, IntrinsicParameters};
use stereocalib_3d::linalg::IDENTITY33;
use stereocalib_calib::intrinsic::IntrinsicCalibrationConfig;
use stereocalib_calib::pipeline::{calibrate_rig, detect_frames, RigCalibrationConfig};
use stereocalib_calib::CalibrationError;
use stereocalib_image::{Image, ImageSize};
use stereocalib_imgproc::chessboard::{ChessboardParams, PatternGeometry};

type Mat33 = [[f64; 3]; 3];

const SQUARE: f64 = 0.035;

fn apply(h: &Mat33, x: f64, y: f64) -> [f64; 2] {
    let w = h[2][0] * x + h[2][1] * y + h[2][2];
    [
        (h[0][0] * x + h[0][1] * y + h[0][2]) / w,
        (h[1][0] * x + h[1][1] * y + h[1][2]) / w,
    ]
}

fn invert(h: &Mat33) -> Mat33 {
    let det = h[0][0] * (h[1][1] * h[2][2] - h[1][2] * h[2][1])
        - h[0][1] * (h[1][0] * h[2][2] - h[1][2] * h[2][0])
        + h[0][2] * (h[1][0] * h[2][1] - h[1][1] * h[2][0]);
    let mut inv = [[0.0; 3]; 3];
    for (i, row) in inv.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            let (r0, r1) = ((j + 1) % 3, (j + 2) % 3);
            let (c0, c1) = ((i + 1) % 3, (i + 2) % 3);
            *val = (h[r0][c0] * h[r1][c1] - h[r0][c1] * h[r1][c0]) / det;
        }
    }
    inv
}

fn size() -> ImageSize {
    ImageSize {
        width: 640,
        height: 480,
    }
}

fn camera() -> IntrinsicParameters {
    IntrinsicParameters::new(800.0, 800.0, 320.0, 240.0, (640, 480))
}

fn stereo_truth() -> ExtrinsicParameters {
    ExtrinsicParameters::from_axis_angle(&[0.0, -0.02, 0.0], [0.3, 0.0, 0.0])
}

/// Render the 8x11 squares board seen by `camera` at `pose`, where the pose
/// maps the pattern frame (first inner corner at the origin) to the camera.
fn render(camera: &IntrinsicParameters, pose: &ExtrinsicParameters, seed: u64) -> Image<u8, 1> {
    let r = pose.rotation;
    let t = pose.translation;
    let plane_to_image = [
        [r[0][0], r[0][1], t[0]],
        [r[1][0], r[1][1], t[1]],
        [r[2][0], r[2][1], t[2]],
    ];
    let image_to_plane = invert(&plane_to_image);
    let mut rng = StdRng::seed_from_u64(seed);
    Image::from_fn(size(), |x, y| {
        let mut acc = 0.0;
        for sy in 0..4 {
            for sx in 0..4 {
                let u = x as f64 + (sx as f64 + 0.5) / 4.0 - 0.5;
                let v = y as f64 + (sy as f64 + 0.5) / 4.0 - 0.5;
                let [xn, yn] = camera.pixel_to_normalized(u, v);
                let [px, py] = apply(&image_to_plane, xn, yn);
                // board units are squares, the first inner corner sits at (1, 1)
                let (bx, by) = (px / SQUARE + 1.0, py / SQUARE + 1.0);
                let inside = bx >= 0.0 && by >= 0.0 && bx < 8.0 && by < 11.0;
                let dark = inside && (bx.floor() as i64 + by.floor() as i64) % 2 == 0;
                acc += if dark { 30.0 } else { 220.0 };
            }
        }
        let noise: f64 = rng.random_range(-4.0..4.0);
        [(acc / 16.0 + noise).clamp(0.0, 255.0) as u8]
    })
    .unwrap()
}

/// Board poses in left camera coordinates, about 1 m away.
fn board_poses() -> Vec<ExtrinsicParameters> {
    let to_centre = ExtrinsicParameters::new(IDENTITY33, [-0.105, -0.1575, 0.0]);
    [
        ([0.25, 0.05, 0.02], [-0.15, 0.0, 1.0]),
        ([-0.20, 0.25, -0.04], [-0.12, -0.02, 1.05]),
        ([0.10, -0.30, 0.05], [-0.18, 0.03, 0.95]),
        ([-0.25, -0.20, 0.00], [-0.14, 0.02, 1.0]),
        ([0.20, 0.25, -0.06], [-0.16, -0.03, 1.1]),
        ([0.30, -0.10, 0.03], [-0.13, 0.0, 1.02]),
        ([-0.10, 0.05, 0.10], [-0.15, 0.01, 0.98]),
        // only the right camera sees this one
        ([0.05, 0.15, 0.00], [-0.46, 0.0, 1.0]),
    ]
    .iter()
    .map(|(r, t)| ExtrinsicParameters::from_axis_angle(r, *t).compose(&to_centre))
    .collect()
}

fn images() -> (Vec<Image<u8, 1>>, Vec<Image<u8, 1>>) {
    let stereo = stereo_truth();
    board_poses()
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            (
                render(&camera(), pose, 2 * i as u64),
                render(&camera(), &stereo.compose(pose), 2 * i as u64 + 1),
            )
        })
        .unzip()
}

#[test]
fn detects_pattern_in_image_pairs() -> Result<(), CalibrationError> {
    let (left, right) = images();
    let geometry = PatternGeometry::new(7, 10, SQUARE);

    let frames = detect_frames(&left, &right, &geometry, &ChessboardParams::default())?;
    assert_eq!(frames.len(), 8);
    assert_eq!(frames.iter().filter(|f| f.is_complete()).count(), 7);
    assert!(frames[7].left.is_none());
    assert!(frames[7].right.is_some());

    assert!(matches!(
        detect_frames(&left, &right[..3], &geometry, &ChessboardParams::default()),
        Err(CalibrationError::FrameCountMismatch { left: 8, right: 3 })
    ));
    Ok(())
}

#[test]
fn calibrates_rig_from_rendered_images() -> Result<(), CalibrationError> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (left, right) = images();
    let geometry = PatternGeometry::new(7, 10, SQUARE);
    let config = RigCalibrationConfig::default().with_intrinsic(
        IntrinsicCalibrationConfig::default()
            .with_fix_k3(true)
            .with_zero_tangential(true)
            .with_max_iterations(100),
    );

    let calibration = calibrate_rig(&left, &right, &geometry, &config)?;
    assert_eq!(calibration.stereo.pairs_used, 7);
    assert!(calibration.left.rms < 0.3, "left rms {}", calibration.left.rms);
    assert!(calibration.right.rms < 0.3, "right rms {}", calibration.right.rms);
    assert!(calibration.stereo.rms < 0.3, "stereo rms {}", calibration.stereo.rms);

    let rig = calibration.rig();
    for k in [rig.left, rig.right] {
        assert_relative_eq!(k.fx, 800.0, max_relative = 0.02);
        assert_relative_eq!(k.fy, 800.0, max_relative = 0.02);
        assert!((k.cx - 320.0).abs() < 8.0 && (k.cy - 240.0).abs() < 8.0);
    }
    assert_relative_eq!(rig.extrinsics.baseline(), 0.3, max_relative = 0.03);
    assert!(rig.extrinsics.translation[0] > 0.0);
    Ok(())
}
