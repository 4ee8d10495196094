//! master key lifecycle
//!
//! one slot, two states: absent, or present in the key file. generating over
//! a present key needs explicit confirmation. shares are returned once and
//! never written anywhere; only the bundle (n, t, timestamp) is kept.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KeyConfig;
use crate::share::KeyShare;
use crate::sharer::{split, validate_threshold};
use crate::{cipher, Error, Result};

/// master key length in bytes
pub const KEY_LEN: usize = 32;

/// plaintext sealed into the canary archive
pub const CANARY_PLAINTEXT: &[u8] = b"hello world!";

/// 256-bit archive key. wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// fresh key from the os rng
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// parse the key file format: one hex line
    pub fn from_hex(s: &str) -> std::result::Result<Self, String> {
        let bytes = Zeroizing::new(hex::decode(s.trim()).map_err(|e| e.to_string())?);
        let arr: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            format!("expected {} bytes, got {}", KEY_LEN, bytes.len())
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// short public identifier for logs: first 8 hex chars of sha256(key)
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey({})", self.fingerprint())
    }
}

/// key metadata written next to the key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub generated_at: DateTime<Utc>,
    pub total_shares: usize,
    pub required_shares: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key_hex: Option<String>,
}

/// what to do when a key is already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regenerate {
    /// keep the existing key and fail with `KeyExists`
    Refuse,
    /// overwrite it. shares issued for the old key stop covering new archives.
    Confirmed,
}

/// result of a full provisioning run
#[derive(Debug)]
pub struct Provisioned {
    pub key: MasterKey,
    pub shares: Vec<KeyShare>,
    pub bundle: KeyBundle,
    /// an older key was replaced
    pub regenerated: bool,
}

pub struct KeyManager {
    config: KeyConfig,
}

impl KeyManager {
    pub fn new(config: KeyConfig) -> Self {
        Self { config }
    }

    pub fn key_path(&self) -> PathBuf {
        self.config.key_path()
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.config.bundle_path()
    }

    pub fn exists(&self) -> bool {
        self.key_path().exists()
    }

    /// create and persist a new master key
    pub fn generate(&self, regenerate: Regenerate) -> Result<MasterKey> {
        let key_path = self.key_path();
        if key_path.exists() && regenerate == Regenerate::Refuse {
            return Err(Error::KeyExists { path: key_path });
        }

        create_private_dir(&self.config.dir)?;
        let key = MasterKey::generate();
        write_private(&key_path, key.to_hex().as_bytes())?;

        info!("generated new 256-bit master key {}", key.fingerprint());
        Ok(key)
    }

    /// read the persisted key. a missing or malformed file is never papered
    /// over with a fresh key.
    pub fn load(&self) -> Result<MasterKey> {
        let key_path = self.key_path();
        let raw = match std::fs::read_to_string(&key_path) {
            Ok(raw) => Zeroizing::new(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyAbsent { path: key_path });
            }
            Err(e) => return Err(Error::io(key_path, e)),
        };

        MasterKey::from_hex(&raw).map_err(|reason| Error::KeyCorrupt {
            path: key_path,
            reason,
        })
    }

    /// split `key` into n shares with threshold t
    pub fn issue_shares(&self, key: &MasterKey, total: usize, threshold: usize) -> Result<Vec<KeyShare>> {
        validate_threshold(total, threshold)?;
        split(key.as_bytes(), total, threshold)
    }

    /// generate a key, split it and record the bundle.
    ///
    /// shares come back only when both the key file and the bundle are on
    /// disk. a bundle failure after the key write is a `PartialProvision`.
    pub fn provision(&self, total: usize, threshold: usize, regenerate: Regenerate) -> Result<Provisioned> {
        validate_threshold(total, threshold)?;

        let regenerated = self.exists();
        if regenerated && regenerate == Regenerate::Confirmed {
            warn!(
                "regenerating master key at {}, existing shares will not open new archives",
                self.key_path().display()
            );
        }

        let key = self.generate(regenerate)?;
        let shares = self.issue_shares(&key, total, threshold)?;

        let bundle = KeyBundle {
            generated_at: Utc::now(),
            total_shares: total,
            required_shares: threshold,
            master_key_hex: self.config.record_key_hex.then(|| key.to_hex().to_string()),
        };

        if let Err(e) = self.write_bundle(&bundle) {
            return Err(Error::PartialProvision {
                key_path: self.key_path(),
                bundle_path: self.bundle_path(),
                source: Box::new(e),
            });
        }

        if regenerated {
            self.remove_stale_canary();
        }

        info!("created {} key shares (threshold {})", total, threshold);
        Ok(Provisioned {
            key,
            shares,
            bundle,
            regenerated,
        })
    }

    pub fn write_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        let path = self.bundle_path();
        let json = serde_json::to_vec_pretty(bundle).map_err(|e| Error::Serialization(e.to_string()))?;
        write_private(&path, &json)?;
        info!("key bundle saved to {}", path.display());
        Ok(())
    }

    pub fn load_bundle(&self) -> Result<KeyBundle> {
        let path = self.bundle_path();
        let raw = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))
    }

    /// seal the known plaintext under `key` so shares can be tested without
    /// touching a real archive
    pub fn write_canary(&self, key: &MasterKey) -> Result<PathBuf> {
        let path = self
            .config
            .canary_path
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("keys.canary_path is not set".into()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        let blob = cipher::seal(key, CANARY_PLAINTEXT)?;
        write_private(&path, &blob)?;

        info!("canary archive written to {}", path.display());
        Ok(path)
    }

    fn remove_stale_canary(&self) {
        let Some(path) = &self.config.canary_path else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => info!("removed canary {} sealed under the previous key", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove stale canary {}: {}", path.display(), e),
        }
    }
}

/// create `dir` (and parents) readable by the owner only
pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| Error::io(dir, e))
}

/// write `bytes` to `path` with mode 0600, replacing any existing file.
/// goes through a temp file in the same directory so readers never see a
/// half-written key or archive.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::ConfigInvalid(format!("{} has no file name", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = options
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| std::fs::rename(&tmp, path));

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharer::combine_key;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> KeyManager {
        KeyManager::new(KeyConfig {
            dir: dir.path().join("keys"),
            canary_path: Some(dir.path().join("test_hello.encrypted")),
            ..KeyConfig::default()
        })
    }

    #[test]
    fn test_generate_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        assert!(matches!(km.load(), Err(Error::KeyAbsent { .. })));

        let key = km.generate(Regenerate::Refuse).unwrap();
        let loaded = km.load().unwrap();
        assert_eq!(key, loaded);

        let raw = std::fs::read_to_string(km.key_path()).unwrap();
        assert_eq!(raw.trim().len(), 64);
    }

    #[test]
    fn test_generate_refuses_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        let first = km.generate(Regenerate::Refuse).unwrap();
        assert!(matches!(km.generate(Regenerate::Refuse), Err(Error::KeyExists { .. })));
        assert_eq!(km.load().unwrap(), first);

        let second = km.generate(Regenerate::Confirmed).unwrap();
        assert_ne!(first, second);
        assert_eq!(km.load().unwrap(), second);
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);
        std::fs::create_dir_all(dir.path().join("keys")).unwrap();

        std::fs::write(km.key_path(), "not hex at all").unwrap();
        assert!(matches!(km.load(), Err(Error::KeyCorrupt { .. })));

        std::fs::write(km.key_path(), hex::encode([1u8; 16])).unwrap();
        assert!(matches!(km.load(), Err(Error::KeyCorrupt { .. })));

        // trailing newline is fine
        std::fs::write(km.key_path(), format!("{}\n", hex::encode([1u8; 32]))).unwrap();
        assert_eq!(km.load().unwrap().as_bytes(), &[1u8; 32]);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);
        km.generate(Regenerate::Refuse).unwrap();

        let mode = std::fs::metadata(km.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("keys")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_provision_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        let p = km.provision(5, 3, Regenerate::Refuse).unwrap();
        assert_eq!(p.shares.len(), 5);
        assert!(!p.regenerated);

        let bundle = km.load_bundle().unwrap();
        assert_eq!(bundle.total_shares, 5);
        assert_eq!(bundle.required_shares, 3);
        assert!(bundle.master_key_hex.is_none());
        assert_eq!(bundle, p.bundle);

        let recovered = combine_key(&p.shares[1..4]).unwrap();
        assert_eq!(recovered, p.key);
    }

    #[test]
    fn test_provision_records_key_hex_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let km = KeyManager::new(KeyConfig {
            dir: dir.path().to_path_buf(),
            record_key_hex: true,
            canary_path: None,
            ..KeyConfig::default()
        });
        let p = km.provision(2, 2, Regenerate::Refuse).unwrap();
        assert_eq!(p.bundle.master_key_hex.as_deref(), Some(p.key.to_hex().as_str()));
    }

    #[test]
    fn test_provision_validates_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        assert!(matches!(
            km.provision(2, 3, Regenerate::Refuse),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(!km.exists());
    }

    #[test]
    fn test_provision_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        // a directory where the bundle should go makes the bundle write fail
        std::fs::create_dir_all(km.bundle_path()).unwrap();

        match km.provision(3, 2, Regenerate::Refuse) {
            Err(Error::PartialProvision { key_path, bundle_path, .. }) => {
                assert_eq!(key_path, km.key_path());
                assert_eq!(bundle_path, km.bundle_path());
            }
            other => panic!("unexpected: {:?}", other.map(|p| p.bundle)),
        }
        assert!(km.load().is_ok());
    }

    #[test]
    fn test_regeneration_removes_canary() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);

        let first = km.provision(3, 3, Regenerate::Refuse).unwrap();
        let canary = km.write_canary(&first.key).unwrap();
        assert!(canary.exists());

        assert!(matches!(
            km.provision(3, 3, Regenerate::Refuse),
            Err(Error::KeyExists { .. })
        ));
        assert!(canary.exists());

        let second = km.provision(3, 3, Regenerate::Confirmed).unwrap();
        assert!(second.regenerated);
        assert!(!canary.exists());
    }

    #[test]
    fn test_canary_opens_with_key() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(&dir);
        let key = km.generate(Regenerate::Refuse).unwrap();

        let path = km.write_canary(&key).unwrap();
        assert_eq!(cipher::open_file(&key, &path).unwrap(), CANARY_PLAINTEXT);
    }

    #[test]
    fn test_debug_is_fingerprint_only() {
        let key = MasterKey::from_bytes([0xab; 32]);
        let dbg = format!("{:?}", key);
        assert!(!dbg.contains(&"ab".repeat(8)));
        assert!(dbg.contains(&key.fingerprint()));
    }
}
