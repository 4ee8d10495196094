//! error types for snapvault

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // === key lifecycle ===
    #[error("no master key at {}", path.display())]
    KeyAbsent { path: PathBuf },

    #[error("master key at {} is corrupt: {reason}", path.display())]
    KeyCorrupt { path: PathBuf, reason: String },

    #[error("master key already exists at {}, regeneration must be confirmed", path.display())]
    KeyExists { path: PathBuf },

    #[error(
        "master key persisted at {} but key bundle {} was not written: {source}",
        key_path.display(),
        bundle_path.display()
    )]
    PartialProvision {
        key_path: PathBuf,
        bundle_path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    // === shares ===
    #[error("share #{position} could not be decoded: {reason}")]
    ShareDecode { position: usize, reason: String },

    #[error("duplicate share index {0}")]
    DuplicateShareIndex(u8),

    #[error("share #{position} has evaluation index 0")]
    InvalidShareIndex { position: usize },

    #[error("not enough shares: have {have}, need {need}")]
    NotEnoughShares { have: usize, need: usize },

    // === archives ===
    #[error("authentication failed: wrong key or tampered archive")]
    Authentication,

    #[error("archive too short: {len} bytes, need at least {need}")]
    ArchiveTooShort { len: usize, need: usize },

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    // === collaborators ===
    #[error("collector failed: {0}")]
    Collector(String),

    #[error("upload failed: {0}")]
    Upload(String),

    // === harness ===
    #[error("CRITICAL: worker {worker} decrypted the target with random shares after {attempts} attempts")]
    CorrectnessViolation { worker: usize, attempts: u64 },
}

impl Error {
    /// attach a path to an io error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// true when asking the operator for different shares could succeed.
    /// archive and key-file problems are not fixed by retyping shares.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ShareDecode { .. }
                | Error::DuplicateShareIndex(_)
                | Error::InvalidShareIndex { .. }
                | Error::NotEnoughShares { .. }
                | Error::Authentication
        )
    }
}
