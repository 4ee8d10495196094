//! # snapvault
//!
//! encrypted backup archives under a threshold-shared master key.
//!
//! the master key lives in exactly one owner-only key file on the backup
//! host. for recovery it is split into n shares over GF(256), any t of which
//! rebuild it. t-1 shares reveal nothing.
//!
//! ## architecture
//!
//! ```text
//!   raw data (file / imaging tool)
//!          │ RawDataCollector
//!          ▼
//!    ┌─────────────┐        ┌────────────┐
//!    │  plaintext  │        │ master key │──split──▶ n shares (operator)
//!    └─────┬───────┘        └─────┬──────┘
//!          │ chacha20poly1305     │
//!          ▼◀─────────────────────┘
//!    ┌─────────────────────────────────┐
//!    │ root/YYYY/DD/MM/HH/*.encrypted  │  ArchiveStore (+ retention)
//!    └─────────────┬───────────────────┘
//!                  │ ObjectStore (optional)
//!                  ▼
//!               mirror
//! ```
//!
//! recovery goes the other way: t shares → combine → open.
//!
//! ## usage
//!
//! ```rust,ignore
//! use snapvault::{cipher, keys::{KeyManager, Regenerate}, sharer, Config};
//!
//! let config = Config::default();
//! let manager = KeyManager::new(config.keys.clone());
//! let provisioned = manager.provision(3, 2, Regenerate::Refuse)?;
//!
//! let blob = cipher::seal(&provisioned.key, b"backup bytes")?;
//!
//! let key = sharer::combine_key(&provisioned.shares[..2])?;
//! assert_eq!(cipher::open(&key, &blob)?, b"backup bytes");
//! ```

pub mod cipher;
pub mod collector;
pub mod config;
pub mod error;
pub mod gf256;
pub mod harness;
pub mod keys;
pub mod pipeline;
pub mod share;
pub mod sharer;
pub mod store;

pub use collector::{CommandCollector, FileCollector, MirrorStore, ObjectStore, RawDataCollector};
pub use config::Config;
pub use error::{Error, Result};
pub use harness::{BruteForce, BruteForceReport, Progress, Recovered};
pub use keys::{KeyBundle, KeyManager, MasterKey, Provisioned, Regenerate};
pub use pipeline::{CycleInfo, CycleReport, Pipeline, UploadOutcome};
pub use share::KeyShare;
pub use sharer::{combine, split};
pub use store::{ArchiveEntry, ArchivePath, ArchiveStore, ArtifactKind, Layout, RetentionReport, StoreStats};
