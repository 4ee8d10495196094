//! collaborators at the edges of an archive cycle
//!
//! a [`RawDataCollector`] produces the plaintext to archive and an
//! [`ObjectStore`] receives the sealed archive afterwards. neither ever
//! sees the master key.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::{Error, Result};

/// source of the bytes to archive
pub trait RawDataCollector: Send + Sync {
    /// short label for logs
    fn describe(&self) -> String;

    /// produce the full plaintext payload
    fn collect(&self) -> Result<Vec<u8>>;
}

/// remote destination for finished archives
pub trait ObjectStore: Send + Sync {
    fn describe(&self) -> String;

    /// copy the archive at `local` to `remote_key`
    fn upload(&self, local: &Path, remote_key: &str) -> Result<()>;
}

/// reads a pre-built artifact (disk image, tarball) from disk
pub struct FileCollector {
    pub path: PathBuf,
}

impl FileCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RawDataCollector for FileCollector {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn collect(&self) -> Result<Vec<u8>> {
        let data = std::fs::read(&self.path).map_err(|e| Error::io(&self.path, e))?;
        debug!("collected {} bytes from {}", data.len(), self.path.display());
        Ok(data)
    }
}

/// runs an external imaging tool and archives its stdout
pub struct CommandCollector {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandCollector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// build from `[program, args..]`
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::ConfigInvalid("collector command is empty".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl RawDataCollector for CommandCollector {
    fn describe(&self) -> String {
        format!("command {} {}", self.program, self.args.join(" "))
    }

    fn collect(&self) -> Result<Vec<u8>> {
        info!("running {}", self.describe().trim_end());
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::Collector(format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Collector(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        debug!("{} produced {} bytes", self.program, output.stdout.len());
        Ok(output.stdout)
    }
}

/// local directory standing in for a bucket. keys map to relative paths.
pub struct MirrorStore {
    pub root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, remote_key: &str) -> Result<PathBuf> {
        let rel = Path::new(remote_key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if remote_key.is_empty() || !clean {
            return Err(Error::Upload(format!("refusing remote key {:?}", remote_key)));
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for MirrorStore {
    fn describe(&self) -> String {
        format!("mirror {}", self.root.display())
    }

    fn upload(&self, local: &Path, remote_key: &str) -> Result<()> {
        let target = self.target(remote_key)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Upload(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::copy(local, &target)
            .map_err(|e| Error::Upload(format!("{} -> {}: {}", local.display(), target.display(), e)))?;
        info!("uploaded {} to {}", local.display(), target.display());
        Ok(())
    }
}
