use stereocalib_3d::camera::{Distortion, ExtrinsicParameters, IntrinsicParameters};
use stereocalib_calib::store::{
    CalibrationStore, FileCalibrationStore, MissingKind, RigStatus, StoreError, StoreFormat,
};

fn left() -> IntrinsicParameters {
    IntrinsicParameters::new(801.5, 799.25, 321.0, 241.5, (640, 480))
        .with_distortion(Distortion::from_array([-0.1, 0.02, 1e-4, -2e-4, 0.0]))
}

fn right() -> IntrinsicParameters {
    IntrinsicParameters::new(798.0, 802.0, 318.5, 239.0, (640, 480))
}

fn extrinsics() -> ExtrinsicParameters {
    ExtrinsicParameters::from_axis_angle(&[0.01, -0.02, 0.005], [-0.3, 0.002, 0.001])
}

fn store_roundtrip(format: StoreFormat) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut store = FileCalibrationStore::open(dir.path(), format)?;

    store.save_intrinsics("cam0", &left())?;
    store.save_intrinsics("cam1", &right())?;
    store.save_extrinsics("rig", "cam0", "cam1", &extrinsics(), &left(), &right())?;

    // a second handle on the same directory sees the records
    let reopened = FileCalibrationStore::open(dir.path(), format)?;
    assert_eq!(reopened.status("rig")?, RigStatus::Ready);
    let rig = reopened.load_rig("rig")?;
    assert_eq!(rig.left, left());
    assert_eq!(rig.right, right());
    assert_eq!(rig.extrinsics, extrinsics());

    let ext = format.extension();
    assert!(dir.path().join("cameras").join(format!("cam0.{ext}")).exists());
    assert!(dir.path().join("rigs").join(format!("rig.{ext}")).exists());
    let leftovers = std::fs::read_dir(dir.path().join("cameras"))?
        .filter_map(Result::ok)
        .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[test]
fn json_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    store_roundtrip(StoreFormat::Json)
}

#[test]
fn binary_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    store_roundtrip(StoreFormat::Binary)
}

#[test]
fn missing_records() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut store = FileCalibrationStore::open(dir.path(), StoreFormat::Json)?;

    assert_eq!(
        store.status("rig")?,
        RigStatus::Missing(vec![MissingKind::Extrinsics("rig".into())])
    );
    assert!(matches!(
        store.load_intrinsics("cam0"),
        Err(StoreError::MissingCalibration(MissingKind::Intrinsics(id))) if id == "cam0"
    ));

    store.save_intrinsics("cam0", &left())?;
    store.save_extrinsics("rig", "cam0", "cam1", &extrinsics(), &left(), &right())?;
    assert_eq!(
        store.status("rig")?,
        RigStatus::Missing(vec![MissingKind::Intrinsics("cam1".into())])
    );
    assert!(matches!(
        store.load_rig("rig"),
        Err(StoreError::MissingCalibration(MissingKind::Intrinsics(id))) if id == "cam1"
    ));
    Ok(())
}

#[test]
fn recalibrated_camera_makes_rig_stale() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut store = FileCalibrationStore::open(dir.path(), StoreFormat::Binary)?;

    store.save_intrinsics("cam0", &left())?;
    store.save_intrinsics("cam1", &right())?;
    store.save_extrinsics("rig", "cam0", "cam1", &extrinsics(), &left(), &right())?;

    let mut updated = right();
    updated.fx += 0.5;
    store.save_intrinsics("cam1", &updated)?;

    assert_eq!(
        store.status("rig")?,
        RigStatus::Stale {
            camera_ids: vec!["cam1".into()]
        }
    );
    assert!(matches!(
        store.load_rig("rig"),
        Err(StoreError::StaleCalibration { rig_id, camera_id }) if rig_id == "rig" && camera_id == "cam1"
    ));

    // a new stereo calibration against the current intrinsics restores the rig
    store.save_extrinsics("rig", "cam0", "cam1", &extrinsics(), &left(), &updated)?;
    assert_eq!(store.load_rig("rig")?.right, updated);
    Ok(())
}

#[test]
fn unsupported_version_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut store = FileCalibrationStore::open(dir.path(), StoreFormat::Json)?;
    store.save_intrinsics("cam0", &left())?;

    let path = dir.path().join("cameras").join("cam0.json");
    let mut record: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    record["version"] = serde_json::json!(99);
    std::fs::write(&path, serde_json::to_vec(&record)?)?;

    assert!(matches!(
        store.load_intrinsics("cam0"),
        Err(StoreError::UnsupportedVersion {
            found: 99,
            expected: 1
        })
    ));
    Ok(())
}

#[test]
fn corrupted_record_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let store = FileCalibrationStore::open(dir.path(), StoreFormat::Json)?;
    std::fs::write(dir.path().join("cameras").join("cam0.json"), b"{\"version\": 1")?;
    assert!(matches!(
        store.load_intrinsics("cam0"),
        Err(StoreError::Json(_))
    ));
    Ok(())
}

#[test]
fn invalid_ids_and_records() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut store = FileCalibrationStore::open(dir.path(), StoreFormat::Json)?;

    for id in ["", ".", "..", "../escape", "a\\b"] {
        assert!(matches!(
            store.save_intrinsics(id, &left()),
            Err(StoreError::InvalidId(_))
        ));
    }

    let mut broken = left();
    broken.fx = f64::NAN;
    assert!(matches!(
        store.save_intrinsics("cam0", &broken),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(matches!(
        store.save_extrinsics("rig", "cam0", "cam0", &extrinsics(), &left(), &left()),
        Err(StoreError::InvalidRecord(_))
    ));

    // rejected writes leave nothing behind
    assert_eq!(std::fs::read_dir(dir.path().join("cameras"))?.count(), 0);
    assert_eq!(std::fs::read_dir(dir.path().join("rigs"))?.count(), 0);
    Ok(())
}
