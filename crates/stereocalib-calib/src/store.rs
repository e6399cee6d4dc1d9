//! # Calibration store
//!
//! Persists per-camera intrinsics and per-rig extrinsics. Every rig record
//! keeps a snapshot of the intrinsics it was computed against, and a rig is
//! only handed out when both cameras are present and still match that
//! snapshot.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stereocalib_3d::camera::{ExtrinsicParameters, IntrinsicParameters};

use crate::rig::StereoRig;

/// Version written into every record.
pub const FORMAT_VERSION: u32 = 1;

/// A part of a rig calibration that is not in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingKind {
    /// No intrinsics for this camera id.
    Intrinsics(String),
    /// No extrinsics for this rig id.
    Extrinsics(String),
}

impl fmt::Display for MissingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingKind::Intrinsics(id) => write!(f, "intrinsics of camera '{id}'"),
            MissingKind::Extrinsics(id) => write!(f, "extrinsics of rig '{id}'"),
        }
    }
}

/// Errors returned by a [`CalibrationStore`].
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A required record is absent.
    #[error("Missing calibration: {0}")]
    MissingCalibration(MissingKind),

    /// The rig was calibrated against intrinsics that have since changed.
    #[error("Rig '{rig_id}' was calibrated against different intrinsics of camera '{camera_id}'")]
    StaleCalibration {
        /// The rig id.
        rig_id: String,
        /// The camera whose intrinsics changed.
        camera_id: String,
    },

    /// The record was written by an incompatible version.
    #[error("Unsupported record version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the record.
        found: u32,
        /// Version this build reads and writes.
        expected: u32,
    },

    /// The record content is not acceptable.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The id cannot be used as a record name.
    #[error("Invalid id: '{0}'")]
    InvalidId(String),

    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Binary encoding error.
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),

    /// Binary decoding error.
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
}

/// The stored intrinsics of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct IntrinsicsRecord {
    /// Record format version.
    pub version: u32,
    /// The camera id.
    pub camera_id: String,
    /// The camera.
    pub intrinsics: IntrinsicParameters,
}

/// The stored extrinsics of one rig with the intrinsics they were computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RigRecord {
    /// Record format version.
    pub version: u32,
    /// The rig id.
    pub rig_id: String,
    /// Id of the left (reference) camera.
    pub left_id: String,
    /// Id of the right camera.
    pub right_id: String,
    /// Transform from left to right camera coordinates.
    pub extrinsics: ExtrinsicParameters,
    /// The left intrinsics used by the stereo calibration.
    pub left_intrinsics: IntrinsicParameters,
    /// The right intrinsics used by the stereo calibration.
    pub right_intrinsics: IntrinsicParameters,
}

/// Completeness of a rig in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RigStatus {
    /// The rig can be loaded.
    Ready,
    /// Records are absent.
    Missing(Vec<MissingKind>),
    /// The intrinsics of these cameras changed after the stereo calibration.
    Stale {
        /// Ids of the changed cameras.
        camera_ids: Vec<String>,
    },
}

/// Storage of calibration results.
///
/// Implementors provide the four record operations; rig assembly and status
/// are shared.
pub trait CalibrationStore {
    /// Store the intrinsics of a camera, replacing previous ones.
    fn save_intrinsics(
        &mut self,
        camera_id: &str,
        intrinsics: &IntrinsicParameters,
    ) -> Result<(), StoreError>;

    /// Load the intrinsics of a camera.
    fn load_intrinsics(&self, camera_id: &str) -> Result<IntrinsicParameters, StoreError>;

    /// Store the extrinsics of a rig together with the intrinsics they were computed against.
    fn save_extrinsics(
        &mut self,
        rig_id: &str,
        left_id: &str,
        right_id: &str,
        extrinsics: &ExtrinsicParameters,
        left: &IntrinsicParameters,
        right: &IntrinsicParameters,
    ) -> Result<(), StoreError>;

    /// Load the raw rig record.
    fn load_rig_record(&self, rig_id: &str) -> Result<RigRecord, StoreError>;

    /// Describe which parts of a rig are present and current.
    fn status(&self, rig_id: &str) -> Result<RigStatus, StoreError> {
        let record = match self.load_rig_record(rig_id) {
            Ok(record) => record,
            Err(StoreError::MissingCalibration(kind)) => return Ok(RigStatus::Missing(vec![kind])),
            Err(e) => return Err(e),
        };

        let mut missing = Vec::new();
        let mut stale = Vec::new();
        for (id, snapshot) in [
            (&record.left_id, &record.left_intrinsics),
            (&record.right_id, &record.right_intrinsics),
        ] {
            match self.load_intrinsics(id) {
                Ok(current) if current == *snapshot => {}
                Ok(_) => stale.push(id.clone()),
                Err(StoreError::MissingCalibration(kind)) => missing.push(kind),
                Err(e) => return Err(e),
            }
        }

        Ok(if !missing.is_empty() {
            RigStatus::Missing(missing)
        } else if !stale.is_empty() {
            RigStatus::Stale { camera_ids: stale }
        } else {
            RigStatus::Ready
        })
    }

    /// Load a complete, current rig.
    fn load_rig(&self, rig_id: &str) -> Result<StereoRig, StoreError> {
        let record = self.load_rig_record(rig_id)?;
        let left = self.load_intrinsics(&record.left_id)?;
        let right = self.load_intrinsics(&record.right_id)?;

        for (id, current, snapshot) in [
            (&record.left_id, &left, &record.left_intrinsics),
            (&record.right_id, &right, &record.right_intrinsics),
        ] {
            if current != snapshot {
                return Err(StoreError::StaleCalibration {
                    rig_id: rig_id.to_string(),
                    camera_id: id.clone(),
                });
            }
        }

        Ok(StereoRig::new(left, right, record.extrinsics))
    }
}

fn check_intrinsics(camera_id: &str, intrinsics: &IntrinsicParameters) -> Result<(), StoreError> {
    if intrinsics.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidRecord(format!(
            "intrinsics of camera '{camera_id}' are not finite or have non-positive focal lengths"
        )))
    }
}

fn rig_record(
    rig_id: &str,
    left_id: &str,
    right_id: &str,
    extrinsics: &ExtrinsicParameters,
    left: &IntrinsicParameters,
    right: &IntrinsicParameters,
) -> Result<RigRecord, StoreError> {
    if left_id == right_id {
        return Err(StoreError::InvalidRecord(format!(
            "rig '{rig_id}' uses camera '{left_id}' twice"
        )));
    }
    check_intrinsics(left_id, left)?;
    check_intrinsics(right_id, right)?;
    let finite = extrinsics
        .rotation
        .iter()
        .flatten()
        .chain(&extrinsics.translation)
        .all(|v| v.is_finite());
    if !finite {
        return Err(StoreError::InvalidRecord(format!(
            "extrinsics of rig '{rig_id}' are not finite"
        )));
    }
    Ok(RigRecord {
        version: FORMAT_VERSION,
        rig_id: rig_id.to_string(),
        left_id: left_id.to_string(),
        right_id: right_id.to_string(),
        extrinsics: *extrinsics,
        left_intrinsics: *left,
        right_intrinsics: *right,
    })
}

/// On-disk encoding of the records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFormat {
    /// Human readable JSON.
    #[default]
    Json,
    /// Compact bincode.
    Binary,
}

impl StoreFormat {
    /// File extension of the records.
    pub fn extension(&self) -> &'static str {
        match self {
            StoreFormat::Json => "json",
            StoreFormat::Binary => "bin",
        }
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// A store keeping one file per record under a root directory:
/// `cameras/<id>.<ext>` and `rigs/<id>.<ext>`.
///
/// Records are written to a temporary file and renamed into place, so a
/// reader never sees a partially written record.
#[derive(Debug, Clone)]
pub struct FileCalibrationStore {
    root: PathBuf,
    format: StoreFormat,
}

const CAMERAS_DIR: &str = "cameras";
const RIGS_DIR: &str = "rigs";

impl FileCalibrationStore {
    /// Open a store, creating its directories when needed.
    pub fn open(root: impl AsRef<Path>, format: StoreFormat) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(CAMERAS_DIR))?;
        std::fs::create_dir_all(root.join(RIGS_DIR))?;
        Ok(Self { root, format })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The record encoding.
    pub fn format(&self) -> StoreFormat {
        self.format
    }

    fn record_path(&self, dir: &str, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self
            .root
            .join(dir)
            .join(format!("{id}.{}", self.format.extension())))
    }

    fn write_record<T: Serialize + bincode::Encode>(
        &self,
        path: &Path,
        record: &T,
    ) -> Result<(), StoreError> {
        let bytes = match self.format {
            StoreFormat::Json => serde_json::to_vec_pretty(record)?,
            StoreFormat::Binary => bincode::encode_to_vec(record, bincode::config::standard())?,
        };
        let tmp = path.with_extension(format!("{}.tmp", self.format.extension()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        log::debug!("wrote {}", path.display());
        Ok(())
    }

    /// Read a record, `None` when the file does not exist.
    fn read_record<T: DeserializeOwned + bincode::Decode<()>>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let config = bincode::config::standard();
        let version = match self.format {
            StoreFormat::Json => serde_json::from_slice::<VersionProbe>(&bytes)?.version,
            StoreFormat::Binary => bincode::decode_from_slice::<u32, _>(&bytes, config)?.0,
        };
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let record = match self.format {
            StoreFormat::Json => serde_json::from_slice(&bytes)?,
            StoreFormat::Binary => bincode::decode_from_slice(&bytes, config)?.0,
        };
        Ok(Some(record))
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn save_intrinsics(
        &mut self,
        camera_id: &str,
        intrinsics: &IntrinsicParameters,
    ) -> Result<(), StoreError> {
        check_intrinsics(camera_id, intrinsics)?;
        let path = self.record_path(CAMERAS_DIR, camera_id)?;
        self.write_record(
            &path,
            &IntrinsicsRecord {
                version: FORMAT_VERSION,
                camera_id: camera_id.to_string(),
                intrinsics: *intrinsics,
            },
        )
    }

    fn load_intrinsics(&self, camera_id: &str) -> Result<IntrinsicParameters, StoreError> {
        let path = self.record_path(CAMERAS_DIR, camera_id)?;
        let record: IntrinsicsRecord = self.read_record(&path)?.ok_or_else(|| {
            StoreError::MissingCalibration(MissingKind::Intrinsics(camera_id.to_string()))
        })?;
        if record.camera_id != camera_id {
            return Err(StoreError::InvalidRecord(format!(
                "{} holds camera '{}'",
                path.display(),
                record.camera_id
            )));
        }
        Ok(record.intrinsics)
    }

    fn save_extrinsics(
        &mut self,
        rig_id: &str,
        left_id: &str,
        right_id: &str,
        extrinsics: &ExtrinsicParameters,
        left: &IntrinsicParameters,
        right: &IntrinsicParameters,
    ) -> Result<(), StoreError> {
        let record = rig_record(rig_id, left_id, right_id, extrinsics, left, right)?;
        let path = self.record_path(RIGS_DIR, rig_id)?;
        self.write_record(&path, &record)
    }

    fn load_rig_record(&self, rig_id: &str) -> Result<RigRecord, StoreError> {
        let path = self.record_path(RIGS_DIR, rig_id)?;
        let record: RigRecord = self.read_record(&path)?.ok_or_else(|| {
            StoreError::MissingCalibration(MissingKind::Extrinsics(rig_id.to_string()))
        })?;
        if record.rig_id != rig_id {
            return Err(StoreError::InvalidRecord(format!(
                "{} holds rig '{}'",
                path.display(),
                record.rig_id
            )));
        }
        Ok(record)
    }
}

/// An in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCalibrationStore {
    cameras: HashMap<String, IntrinsicsRecord>,
    rigs: HashMap<String, RigRecord>,
}

impl MemoryCalibrationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn save_intrinsics(
        &mut self,
        camera_id: &str,
        intrinsics: &IntrinsicParameters,
    ) -> Result<(), StoreError> {
        check_intrinsics(camera_id, intrinsics)?;
        self.cameras.insert(
            camera_id.to_string(),
            IntrinsicsRecord {
                version: FORMAT_VERSION,
                camera_id: camera_id.to_string(),
                intrinsics: *intrinsics,
            },
        );
        Ok(())
    }

    fn load_intrinsics(&self, camera_id: &str) -> Result<IntrinsicParameters, StoreError> {
        self.cameras
            .get(camera_id)
            .map(|r| r.intrinsics)
            .ok_or_else(|| StoreError::MissingCalibration(MissingKind::Intrinsics(camera_id.into())))
    }

    fn save_extrinsics(
        &mut self,
        rig_id: &str,
        left_id: &str,
        right_id: &str,
        extrinsics: &ExtrinsicParameters,
        left: &IntrinsicParameters,
        right: &IntrinsicParameters,
    ) -> Result<(), StoreError> {
        let record = rig_record(rig_id, left_id, right_id, extrinsics, left, right)?;
        self.rigs.insert(rig_id.to_string(), record);
        Ok(())
    }

    fn load_rig_record(&self, rig_id: &str) -> Result<RigRecord, StoreError> {
        self.rigs
            .get(rig_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingCalibration(MissingKind::Extrinsics(rig_id.into())))
    }
}
