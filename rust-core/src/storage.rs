// On-disk ledger snapshot: one JSON file, replaced atomically on every commit.

use crate::constants::Constants;
use crate::ledger::LedgerRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SNAPSHOT_FILE: &str = "ledger_snapshot.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot format version {found} is not supported")]
    VersionMismatch { found: u8 },
    #[error("snapshot was written with different constants; refusing to replay")]
    ConstantsMismatch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedLedger {
    pub version: u8,
    pub constants: Constants,
    pub records: Vec<LedgerRecord>,
}

#[derive(Serialize)]
struct PersistedLedgerRef<'a> {
    version: u8,
    constants: &'a Constants,
    records: &'a [LedgerRecord],
}

pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            path: data_dir.as_ref().join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been committed yet.
    pub fn load(&self, constants: &Constants) -> Result<Option<PersistedLedger>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        let snap = serde_json::from_slice::<PersistedLedger>(&data)?;
        if snap.version != crate::PROTOCOL_VERSION {
            return Err(StorageError::VersionMismatch {
                found: snap.version,
            });
        }
        if snap.constants != *constants {
            return Err(StorageError::ConstantsMismatch);
        }
        Ok(Some(snap))
    }

    pub fn save(&self, constants: &Constants, records: &[LedgerRecord]) -> Result<(), StorageError> {
        let snap = PersistedLedgerRef {
            version: crate::PROTOCOL_VERSION,
            constants,
            records,
        };
        let data = serde_json::to_vec_pretty(&snap)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
