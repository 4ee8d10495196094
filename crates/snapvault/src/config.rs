//! runtime configuration
//!
//! read once from a toml file, validated, then handed to each component's
//! constructor. every field has a default so a missing file or a partial
//! file both work.
//!
//! ```toml
//! [keys]
//! dir = "/app/keys"
//! total_shares = 5
//! threshold = 3
//!
//! [store]
//! root = "/app/snapshots"
//! layout = "year-day-month-hour"
//! kind = "disk-image"
//! retention_days = 14
//!
//! [pipeline]
//! source = "/var/lib/images/root.img"
//! mirror_dir = "/mnt/offsite"
//!
//! info_path = "/app/last_snapshot.json"
//!
//! [harness]
//! workers = 8
//! duration_secs = 60
//! decrypt_dir = "/app/decrypted"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sharer::validate_threshold;
use crate::store::{ArtifactKind, Layout};
use crate::{Error, Result};

/// upper bound on brute-force workers
pub const MAX_WORKERS: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keys: KeyConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub harness: HarnessConfig,
}

/// master key files and sharing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// directory holding the key file and the bundle (created 0700)
    pub dir: PathBuf,
    pub key_filename: String,
    pub bundle_filename: String,
    /// n
    pub total_shares: usize,
    /// t
    pub threshold: usize,
    /// also write the key hex into the bundle, for local diagnostics only
    pub record_key_hex: bool,
    /// known-plaintext archive sealed under the current key
    pub canary_path: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/app/keys"),
            key_filename: "master.key".into(),
            bundle_filename: "key_info.json".into(),
            total_shares: 3,
            threshold: 3,
            record_key_hex: false,
            canary_path: Some(PathBuf::from("/app/test_hello.encrypted")),
        }
    }
}

impl KeyConfig {
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_filename)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.dir.join(&self.bundle_filename)
    }
}

/// where archives go and how long they stay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub layout: Layout,
    pub kind: ArtifactKind,
    /// 0 or negative keeps archives forever
    pub retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/app/snapshots"),
            layout: Layout::default(),
            kind: ArtifactKind::default(),
            retention_days: 0,
        }
    }
}

/// collector and upload settings for one archive cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// file to archive as-is (disk image, pre-built tarball)
    pub source: Option<PathBuf>,
    /// external tool whose stdout is archived, program first
    pub command: Option<Vec<String>>,
    /// local mirror standing in for an object store
    pub mirror_dir: Option<PathBuf>,
    /// key prefix inside the mirror
    pub remote_prefix: String,
    /// json record of the last successful cycle, rewritten each time
    pub info_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: None,
            command: None,
            mirror_dir: None,
            remote_prefix: "backups".into(),
            info_path: Some(PathBuf::from("/app/last_snapshot.json")),
        }
    }
}

/// brute-force simulator defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub workers: usize,
    pub duration_secs: u64,
    /// attempts between flushes into the shared counter
    pub report_every: u64,
    /// where manual recovery writes plaintext when no output is given
    pub decrypt_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            duration_secs: 30,
            report_every: 1000,
            decrypt_dir: PathBuf::from("/app/decrypted"),
        }
    }
}

impl Config {
    /// load from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// reject settings that would fail later, before any key is touched
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.keys.total_shares, self.keys.threshold)?;

        if self.keys.key_filename.is_empty() || self.keys.bundle_filename.is_empty() {
            return Err(Error::ConfigInvalid("key and bundle filenames must be set".into()));
        }
        if self.keys.key_filename == self.keys.bundle_filename {
            return Err(Error::ConfigInvalid(
                "key file and bundle file must differ".into(),
            ));
        }
        if self.harness.workers == 0 || self.harness.workers > MAX_WORKERS {
            return Err(Error::ConfigInvalid(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.harness.workers
            )));
        }
        if self.harness.report_every == 0 {
            return Err(Error::ConfigInvalid("report_every must be at least 1".into()));
        }
        if self.harness.duration_secs == 0 {
            return Err(Error::ConfigInvalid("duration_secs must be at least 1".into()));
        }
        if self.pipeline.source.is_some() && self.pipeline.command.is_some() {
            return Err(Error::ConfigInvalid(
                "set either pipeline.source or pipeline.command, not both".into(),
            ));
        }
        if let Some(cmd) = &self.pipeline.command {
            if cmd.is_empty() {
                return Err(Error::ConfigInvalid("pipeline.command is empty".into()));
            }
        }
        Ok(())
    }
}
