//! time-partitioned archive store and retention
//!
//! archives land under `root/<partition>/<base>_<DDMMYYYY_HHMM>.encrypted`
//! where the partition is derived from the cycle's timestamp alone:
//!
//! ```text
//! year-day-month-hour   root/2026/16/10/14/disk_image_16102026_1405.encrypted
//! day-month-hour        root/16/10/14/snapshot_16102026_1405.encrypted
//! ```
//!
//! retention deletes archives by modification time and then prunes the
//! directories it emptied.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::StoreConfig;
use crate::{Error, Result};

/// extension marking an encrypted artifact
pub const ARCHIVE_EXTENSION: &str = "encrypted";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// directory partitioning scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `YYYY/DD/MM/HH`
    #[default]
    YearDayMonthHour,
    /// `DD/MM/HH`, older snapshot trees
    DayMonthHour,
}

impl Layout {
    /// number of directory levels between root and an archive
    pub fn depth(self) -> usize {
        match self {
            Layout::YearDayMonthHour => 4,
            Layout::DayMonthHour => 3,
        }
    }
}

/// what the archive holds, decides the file name prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Snapshot,
    #[default]
    DiskImage,
}

impl ArtifactKind {
    pub fn base_name(self) -> &'static str {
        match self {
            ArtifactKind::Snapshot => "snapshot",
            ArtifactKind::DiskImage => "disk_image",
        }
    }
}

/// where one archive cycle writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePath {
    /// partition directory, already created
    pub dir: PathBuf,
    /// logical name without extension, e.g. `disk_image_16102026_1405`
    pub name: String,
    /// `dir/name.encrypted`
    pub path: PathBuf,
}

/// one archive found on disk
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// outcome of a retention sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub removed: usize,
    pub bytes_freed: u64,
    pub dirs_removed: usize,
    /// files or directories that could not be read or removed
    pub failures: Vec<(PathBuf, String)>,
}

/// partition folder and archive counts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub years: usize,
    pub days: usize,
    pub months: usize,
    pub hours: usize,
    pub archives: usize,
    pub bytes: u64,
}

pub struct ArchiveStore {
    root: PathBuf,
    layout: Layout,
    kind: ArtifactKind,
}

enum Visit<'a> {
    Dir { depth: usize },
    File { path: &'a Path, meta: &'a Metadata },
    Failed { path: &'a Path, err: std::io::Error },
}

impl ArchiveStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_layout(&config.root, config.layout, config.kind)
    }

    pub fn with_layout(root: impl Into<PathBuf>, layout: Layout, kind: ArtifactKind) -> Self {
        Self {
            root: root.into(),
            layout,
            kind,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// relative partition directory for `now`. pure.
    pub fn partition_of<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> PathBuf {
        let year = format!("{:04}", now.year());
        let day = format!("{:02}", now.day());
        let month = format!("{:02}", now.month());
        let hour = format!("{:02}", now.hour());

        match self.layout {
            Layout::YearDayMonthHour => [year, day, month, hour].iter().collect(),
            Layout::DayMonthHour => [day, month, hour].iter().collect(),
        }
    }

    /// logical archive name for `now`. pure.
    pub fn name_of<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> String {
        format!(
            "{}_{:02}{:02}{:04}_{:02}{:02}",
            self.kind.base_name(),
            now.day(),
            now.month(),
            now.year(),
            now.hour(),
            now.minute()
        )
    }

    /// creation time encoded in an archive name, the inverse of
    /// [`name_of`](Self::name_of) at minute precision. the base name is not
    /// checked, so archives of either kind parse.
    pub fn parse_name(path: &Path) -> Option<NaiveDateTime> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name
            .strip_suffix(ARCHIVE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(file_name);

        let mut parts = stem.rsplitn(3, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let base = parts.next()?;
        if base.is_empty() || date.len() != 8 || time.len() != 4 {
            return None;
        }
        if !date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }

        let num = |s: &str| s.parse::<u32>().ok();
        let day = num(&date[0..2])?;
        let month = num(&date[2..4])?;
        let year = num(&date[4..8])? as i32;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(num(&time[0..2])?, num(&time[2..4])?, 0)
    }

    /// derive the archive path for `now` and create its directory.
    /// calling it again for the same timestamp is harmless.
    pub fn placement<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<ArchivePath> {
        let dir = self.root.join(self.partition_of(now));
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let name = self.name_of(now);
        let path = dir.join(format!("{}.{}", name, ARCHIVE_EXTENSION));

        debug!("archive placement {}", path.display());
        Ok(ArchivePath { dir, name, path })
    }

    /// object-store key for an archive: `prefix/<partition>/<file name>`.
    /// paths outside the store fall under `unknown/`.
    pub fn remote_key(&self, archive: &Path, prefix: &str) -> String {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let partition: Vec<String> = archive
            .parent()
            .and_then(|p| p.strip_prefix(&self.root).ok())
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .filter(|parts: &Vec<String>| parts.len() == self.layout.depth())
            .unwrap_or_else(|| vec!["unknown".to_string()]);

        let mut parts = Vec::with_capacity(partition.len() + 2);
        if !prefix.is_empty() {
            parts.push(prefix.trim_matches('/').to_string());
        }
        parts.extend(partition);
        parts.push(file_name);
        parts.join("/")
    }

    /// delete archives last modified more than `max_age_days` before `now`,
    /// then prune directories left empty. `max_age_days <= 0` keeps everything,
    /// and so does a period reaching past the representable past.
    ///
    /// individual failures are logged and collected, the sweep carries on.
    pub fn apply_retention(&self, max_age_days: i64, now: SystemTime) -> RetentionReport {
        let mut report = RetentionReport::default();
        if max_age_days <= 0 {
            return report;
        }
        if !self.root.exists() {
            debug!("retention: {} does not exist yet", self.root.display());
            return report;
        }

        let Some(cutoff) = retention_cutoff(max_age_days, now) else {
            info!(
                "retention period of {} days reaches before any archive, nothing to remove",
                max_age_days
            );
            return report;
        };
        info!(
            "checking retention policy: removing archives older than {} days",
            max_age_days
        );

        let expired = self.expired_since(cutoff, &mut report);
        remove_expired(expired, &mut report);

        if report.removed > 0 {
            report.dirs_removed = prune_empty_dirs(&self.root, true, &mut report.failures);
            info!(
                "retention cleanup complete: removed {} archives ({:.2} MB freed), {} empty directories",
                report.removed,
                report.bytes_freed as f64 / 1024.0 / 1024.0,
                report.dirs_removed
            );
        }
        if !report.failures.is_empty() {
            error!("retention sweep finished with {} failures", report.failures.len());
        }

        report
    }

    /// archives modified before `cutoff`, with their sizes. read errors go
    /// into the report.
    fn expired_since(&self, cutoff: SystemTime, report: &mut RetentionReport) -> Vec<(PathBuf, u64)> {
        let mut expired = Vec::new();
        walk(&self.root, 0, &mut |visit| match visit {
            Visit::File { path, meta } => {
                if !is_archive(path) {
                    return;
                }
                match meta.modified() {
                    Ok(modified) if modified < cutoff => expired.push((path.to_path_buf(), meta.len())),
                    Ok(_) => {}
                    Err(e) => report.failures.push((path.to_path_buf(), e.to_string())),
                }
            }
            Visit::Failed { path, err } => {
                error!("retention: cannot read {}: {}", path.display(), err);
                report.failures.push((path.to_path_buf(), err.to_string()));
            }
            Visit::Dir { .. } => {}
        });
        expired
    }

    /// every archive in the store, sorted by path
    pub fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut first_error = None;
        walk(&self.root, 0, &mut |visit| match visit {
            Visit::File { path, meta } if is_archive(path) => entries.push(ArchiveEntry {
                path: path.to_path_buf(),
                size: meta.len(),
                modified: meta.modified().ok(),
            }),
            Visit::Failed { path, err } if first_error.is_none() => {
                first_error = Some(Error::io(path, err));
            }
            _ => {}
        });
        if let Some(e) = first_error {
            return Err(e);
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// count partition folders by level and archives
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        if !self.root.exists() {
            return stats;
        }
        let layout = self.layout;
        walk(&self.root, 0, &mut |visit| match visit {
            Visit::Dir { depth } => match (layout, depth) {
                (Layout::YearDayMonthHour, 1) => stats.years += 1,
                (Layout::YearDayMonthHour, 2) | (Layout::DayMonthHour, 1) => stats.days += 1,
                (Layout::YearDayMonthHour, 3) | (Layout::DayMonthHour, 2) => stats.months += 1,
                (Layout::YearDayMonthHour, 4) | (Layout::DayMonthHour, 3) => stats.hours += 1,
                _ => {}
            },
            Visit::File { path, meta } if is_archive(path) => {
                stats.archives += 1;
                stats.bytes += meta.len();
            }
            _ => {}
        });
        stats
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

/// depth-first walk below `dir`. symlinks are not followed.
fn walk(dir: &Path, depth: usize, visit: &mut dyn FnMut(Visit<'_>)) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            visit(Visit::Failed { path: dir, err });
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                visit(Visit::Failed { path: dir, err });
                continue;
            }
        };
        let path = entry.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                visit(Visit::Failed { path: &path, err });
                continue;
            }
        };

        if meta.is_dir() {
            visit(Visit::Dir { depth: depth + 1 });
            walk(&path, depth + 1, visit);
        } else if meta.is_file() {
            visit(Visit::File { path: &path, meta: &meta });
        }
    }
}

/// `now - max_age_days`, or `None` when that overflows
fn retention_cutoff(max_age_days: i64, now: SystemTime) -> Option<SystemTime> {
    let days = u64::try_from(max_age_days).ok()?;
    let secs = days.checked_mul(SECONDS_PER_DAY)?;
    now.checked_sub(Duration::from_secs(secs))
}

/// delete each expired archive, carrying on past failures
fn remove_expired(expired: Vec<(PathBuf, u64)>, report: &mut RetentionReport) {
    for (path, size) in expired {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.removed += 1;
                report.bytes_freed += size;
                info!("removed old archive {}", path.display());
            }
            Err(e) => {
                error!("failed to remove old archive {}: {}", path.display(), e);
                report.failures.push((path, e.to_string()));
            }
        }
    }
}

/// remove empty directories bottom-up, never `dir` itself when `is_root`.
/// returns how many were removed, failures are appended to `failures`.
fn prune_empty_dirs(dir: &Path, is_root: bool, failures: &mut Vec<(PathBuf, String)>) -> usize {
    let mut removed = 0;
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) => {
                        removed += prune_empty_dirs(&entry.path(), false, failures);
                    }
                    Ok(_) => {}
                    Err(e) => failures.push((dir.to_path_buf(), e.to_string())),
                }
            }
        }
        Err(e) => {
            error!("retention: cannot read {}: {}", dir.display(), e);
            failures.push((dir.to_path_buf(), e.to_string()));
            return removed;
        }
    }

    if !is_root {
        let empty = std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            match std::fs::remove_dir(dir) {
                Ok(()) => {
                    debug!("removed empty directory {}", dir.display());
                    removed += 1;
                }
                Err(e) => {
                    error!("failed to remove empty directory {}: {}", dir.display(), e);
                    failures.push((dir.to_path_buf(), e.to_string()));
                }
            }
        }
    }
    removed
}
