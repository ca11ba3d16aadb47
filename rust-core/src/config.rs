use crate::constants::Constants;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whole-node configuration file. Every section except `constants` may be omitted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub constants: Constants,
    #[serde(default)]
    pub draft_limits: DraftLimits,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Per-session caps enforced by the state store before the engine runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftLimits {
    #[serde(default = "default_max_pending_ops")]
    pub max_pending_ops: usize,
    #[serde(default = "default_max_open_drafts")]
    pub max_open_drafts: usize,
    /// Trailing Stable ticks a draft needs before `Cycle` is accepted; 0 disables.
    #[serde(default)]
    pub hold_ticks: u64,
}

fn default_max_pending_ops() -> usize {
    256
}

fn default_max_open_drafts() -> usize {
    1_024
}

impl Default for DraftLimits {
    fn default() -> Self {
        Self {
            max_pending_ops: default_max_pending_ops(),
            max_open_drafts: default_max_open_drafts(),
            hold_ticks: 0,
        }
    }
}

impl DraftLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending_ops == 0 {
            return Err(ConfigError::Invalid("max_pending_ops must be > 0".into()));
        }
        if self.max_open_drafts == 0 {
            return Err(ConfigError::Invalid("max_open_drafts must be > 0".into()));
        }
        if self.hold_ticks as usize >= self.max_pending_ops {
            return Err(ConfigError::Invalid(
                "hold_ticks must be smaller than max_pending_ops".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where the ledger snapshot lives; in-memory only when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let cfg: NodeConfig = read_json(path.as_ref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.constants.validate()?;
        self.draft_limits.validate()
    }
}

pub fn load_constants<P: AsRef<Path>>(path: P) -> Result<Constants, ConfigError> {
    let c: Constants = read_json(path.as_ref())?;
    c.validate()?;
    Ok(c)
}

pub fn load_draft_limits<P: AsRef<Path>>(path: P) -> Result<DraftLimits, ConfigError> {
    let limits: DraftLimits = read_json(path.as_ref())?;
    limits.validate()?;
    Ok(limits)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn minimal_node_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tmp(&dir, "node.json", "{}");
        let cfg = NodeConfig::load(&path).unwrap();
        assert_eq!(cfg.constants, Constants::default());
        assert_eq!(cfg.draft_limits, DraftLimits::default());
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:7400");
        assert!(cfg.storage.data_dir.is_none());
    }

    #[test]
    fn draft_limits_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tmp(&dir, "limits.json", r#"{"max_pending_ops": 8, "hold_ticks": 2}"#);
        let limits = load_draft_limits(&path).unwrap();
        assert_eq!(limits.max_pending_ops, 8);
        assert_eq!(limits.hold_ticks, 2);
        assert_eq!(limits.max_open_drafts, 1_024);
    }

    #[test]
    fn invalid_constants_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tmp(
            &dir,
            "constants.json",
            r#"{"alpha":0.12,"beta":0.1,"gamma":0.5,"k":0.02,"b1":0.25,"b2":0.2,"sigma_max":0.8}"#,
        );
        assert!(matches!(load_constants(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_constants("/nonexistent/constants.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/constants.json"));
    }

    #[test]
    fn shipped_config_files_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("config");
        let c = load_constants(root.join("constants.json")).unwrap();
        assert_eq!(c, Constants::default());
        let limits = load_draft_limits(root.join("draft_limits.json")).unwrap();
        assert!(limits.validate().is_ok());
    }
}
