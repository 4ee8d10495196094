//! one archive cycle
//!
//! load key → retention → collect → seal → write → upload → record
//!
//! the key must already exist. a missing or corrupt key aborts the cycle
//! before anything is written, a fresh key is never made up here.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, Offset, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::cipher;
use crate::collector::{CommandCollector, FileCollector, MirrorStore, ObjectStore, RawDataCollector};
use crate::config::Config;
use crate::keys::{write_private, KeyManager};
use crate::store::{ArchiveStore, RetentionReport};
use crate::{Error, Result};

/// what happened to the upload step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// no object store configured
    Skipped,
    Uploaded { key: String },
    /// logged and reported, the local archive is kept
    Failed { key: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub archive: PathBuf,
    pub plaintext_len: usize,
    pub archive_len: usize,
    pub retention: RetentionReport,
    pub upload: UploadOutcome,
    /// where the cycle info record went, if it was written
    pub info: Option<PathBuf>,
}

/// record of the last successful cycle: what was written, where, when, and
/// on which host. rewritten as json after every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub name: String,
    pub path: PathBuf,
    /// cycle timestamp in the zone the cycle was stamped with
    pub created_at: DateTime<FixedOffset>,
    pub archive_len: u64,
    pub plaintext_len: u64,
    pub size_mb: f64,
    pub hostname: Option<String>,
    /// seconds since boot when the archive was written
    pub uptime_secs: Option<f64>,
}

impl CycleInfo {
    pub fn new<Tz: TimeZone>(name: &str, path: &Path, now: &DateTime<Tz>, archive_len: u64, plaintext_len: u64) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            created_at: now.with_timezone(&now.offset().fix()),
            archive_len,
            plaintext_len,
            size_mb: archive_len as f64 / 1024.0 / 1024.0,
            hostname: host_name(),
            uptime_secs: uptime_secs(),
        }
    }

    /// write as pretty json, mode 0600
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        write_private(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))
    }
}

/// `HOSTNAME`, falling back to the kernel's idea of it
pub fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// first field of /proc/uptime. none off linux.
pub fn uptime_secs() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    parse_uptime(&raw)
}

fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

pub struct Pipeline {
    keys: KeyManager,
    store: ArchiveStore,
    retention_days: i64,
    collector: Box<dyn RawDataCollector>,
    object_store: Option<Box<dyn ObjectStore>>,
    remote_prefix: String,
    info_path: Option<PathBuf>,
}

impl Pipeline {
    /// build from config. the collector comes from `pipeline.source` or
    /// `pipeline.command`, the mirror from `pipeline.mirror_dir`.
    pub fn new(config: &Config) -> Result<Self> {
        let collector: Box<dyn RawDataCollector> =
            match (&config.pipeline.source, &config.pipeline.command) {
                (Some(path), None) => Box::new(FileCollector::new(path)),
                (None, Some(argv)) => Box::new(CommandCollector::from_argv(argv)?),
                (Some(_), Some(_)) => {
                    return Err(Error::ConfigInvalid(
                        "set either pipeline.source or pipeline.command, not both".into(),
                    ))
                }
                (None, None) => {
                    return Err(Error::ConfigInvalid(
                        "no collector: set pipeline.source or pipeline.command".into(),
                    ))
                }
            };

        let mut pipeline = Self::with_collector(config, collector);
        if let Some(dir) = &config.pipeline.mirror_dir {
            pipeline = pipeline.with_object_store(Box::new(MirrorStore::new(dir)));
        }
        Ok(pipeline)
    }

    pub fn with_collector(config: &Config, collector: Box<dyn RawDataCollector>) -> Self {
        Self {
            keys: KeyManager::new(config.keys.clone()),
            store: ArchiveStore::new(&config.store),
            retention_days: config.store.retention_days,
            collector,
            object_store: None,
            remote_prefix: config.pipeline.remote_prefix.clone(),
            info_path: config.pipeline.info_path.clone(),
        }
    }

    pub fn with_object_store(mut self, object_store: Box<dyn ObjectStore>) -> Self {
        self.object_store = Some(object_store);
        self
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// run a single cycle stamped with `now`
    pub fn run_cycle<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Result<CycleReport> {
        let key = self.keys.load()?;
        info!("loaded master key {}", key.fingerprint());

        let retention = self
            .store
            .apply_retention(self.retention_days, SystemTime::from(now.clone()));

        info!("collecting from {}", self.collector.describe());
        let plaintext = Zeroizing::new(self.collector.collect()?);

        let blob = cipher::seal(&key, &plaintext)?;
        let placement = self.store.placement(&now)?;
        write_private(&placement.path, &blob)?;
        info!(
            "wrote archive {} ({} bytes sealed from {})",
            placement.path.display(),
            blob.len(),
            plaintext.len()
        );

        let upload = match &self.object_store {
            None => UploadOutcome::Skipped,
            Some(object_store) => {
                let remote_key = self.store.remote_key(&placement.path, &self.remote_prefix);
                match object_store.upload(&placement.path, &remote_key) {
                    Ok(()) => UploadOutcome::Uploaded { key: remote_key },
                    Err(e) => {
                        error!("upload to {} failed: {}", object_store.describe(), e);
                        warn!("archive kept locally at {}", placement.path.display());
                        UploadOutcome::Failed {
                            key: remote_key,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        let info = self.info_path.as_ref().and_then(|info_path| {
            let record = CycleInfo::new(
                &placement.name,
                &placement.path,
                &now,
                blob.len() as u64,
                plaintext.len() as u64,
            );
            match record.write(info_path) {
                Ok(()) => {
                    debug!("cycle info written to {}", info_path.display());
                    Some(info_path.clone())
                }
                Err(e) => {
                    warn!("could not record cycle info: {}", e);
                    None
                }
            }
        });

        Ok(CycleReport {
            archive: placement.path,
            plaintext_len: plaintext.len(),
            archive_len: blob.len(),
            retention,
            upload,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Regenerate;
    use chrono::Utc;
    use std::path::Path;
    use std::time::Duration;

    struct FixedCollector(Vec<u8>);

    impl RawDataCollector for FixedCollector {
        fn describe(&self) -> String {
            "fixed".into()
        }

        fn collect(&self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn describe(&self) -> String {
            "broken".into()
        }

        fn upload(&self, _local: &Path, _remote_key: &str) -> Result<()> {
            Err(Error::Upload("bucket unreachable".into()))
        }
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.keys.dir = dir.join("keys");
        config.keys.canary_path = None;
        config.store.root = dir.join("archives");
        config.pipeline.info_path = Some(dir.join("last_snapshot.json"));
        config
    }

    #[test]
    fn test_cycle_seals_and_places() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = KeyManager::new(config.keys.clone());
        let key = manager.generate(Regenerate::Refuse).unwrap();

        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(b"payload".to_vec())));
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 14, 5, 0).unwrap();
        let report = pipeline.run_cycle(now).unwrap();

        assert_eq!(
            report.archive,
            dir.path().join("archives/2026/16/10/14/disk_image_16102026_1405.encrypted")
        );
        assert_eq!(report.plaintext_len, 7);
        assert_eq!(report.archive_len, 7 + cipher::MIN_BLOB_LEN);
        assert_eq!(report.upload, UploadOutcome::Skipped);
        assert_eq!(cipher::open_file(&key, &report.archive).unwrap(), b"payload");
    }

    #[test]
    fn test_cycle_records_info() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        KeyManager::new(config.keys.clone())
            .generate(Regenerate::Refuse)
            .unwrap();

        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(vec![7u8; 2048])));
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 14, 5, 0).unwrap();
        let report = pipeline.run_cycle(now).unwrap();

        let info_path = dir.path().join("last_snapshot.json");
        assert_eq!(report.info.as_deref(), Some(info_path.as_path()));

        let info = CycleInfo::load(&info_path).unwrap();
        assert_eq!(info.name, "disk_image_16102026_1405");
        assert_eq!(info.path, report.archive);
        assert_eq!(info.archive_len, report.archive_len as u64);
        assert_eq!(info.plaintext_len, 2048);
        assert_eq!(info.created_at, now);
        assert_eq!(info.hostname, host_name());

        // the next cycle replaces the record
        let later = Utc.with_ymd_and_hms(2026, 10, 16, 15, 0, 0).unwrap();
        pipeline.run_cycle(later).unwrap();
        assert_eq!(CycleInfo::load(&info_path).unwrap().name, "disk_image_16102026_1500");
    }

    #[test]
    fn test_info_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // parent is a regular file
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        config.pipeline.info_path = Some(dir.path().join("blocker/last.json"));
        KeyManager::new(config.keys.clone())
            .generate(Regenerate::Refuse)
            .unwrap();

        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(b"x".to_vec())));
        let report = pipeline.run_cycle(Utc::now()).unwrap();
        assert!(report.archive.exists());
        assert_eq!(report.info, None);

        config.pipeline.info_path = None;
        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(b"x".to_vec())));
        assert_eq!(pipeline.run_cycle(Utc::now()).unwrap().info, None);
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), Some(350735.47));
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_uptime("up"), None);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(b"x".to_vec())));

        assert!(matches!(pipeline.run_cycle(Utc::now()), Err(Error::KeyAbsent { .. })));
        assert!(!dir.path().join("keys/master.key").exists());
        assert!(pipeline.store().list_archives().unwrap().is_empty());
    }

    #[test]
    fn test_upload_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        KeyManager::new(config.keys.clone())
            .generate(Regenerate::Refuse)
            .unwrap();

        let pipeline = Pipeline::with_collector(&config, Box::new(FixedCollector(b"x".to_vec())))
            .with_object_store(Box::new(BrokenStore));
        let report = pipeline.run_cycle(Utc::now()).unwrap();

        assert!(report.archive.exists());
        match report.upload {
            UploadOutcome::Failed { key, reason } => {
                assert!(key.starts_with("backups/"));
                assert!(reason.contains("bucket unreachable"));
            }
            other => panic!("unexpected upload outcome {:?}", other),
        }
    }

    #[test]
    fn test_mirror_and_retention_in_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.store.retention_days = 3;
        config.pipeline.source = Some(dir.path().join("image.raw"));
        config.pipeline.mirror_dir = Some(dir.path().join("mirror"));
        std::fs::write(dir.path().join("image.raw"), b"image").unwrap();
        KeyManager::new(config.keys.clone())
            .generate(Regenerate::Refuse)
            .unwrap();

        let stale = dir.path().join("archives/2026/01/10/00/disk_image_01102026_0000.encrypted");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(10 * 86_400))
            .unwrap();

        let pipeline = Pipeline::new(&config).unwrap();
        let report = pipeline.run_cycle(Utc::now()).unwrap();

        assert_eq!(report.retention.removed, 1);
        assert!(!stale.exists());
        match &report.upload {
            UploadOutcome::Uploaded { key } => {
                assert!(dir.path().join("mirror").join(key).exists());
            }
            other => panic!("unexpected upload outcome {:?}", other),
        }
    }

    #[test]
    fn test_new_requires_collector() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(matches!(Pipeline::new(&config), Err(Error::ConfigInvalid(_))));
    }
}
