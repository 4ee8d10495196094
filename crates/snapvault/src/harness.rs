//! verification harness
//!
//! two ways to check the sharing scheme against a real archive:
//! - manual: an operator types t shares, the key is rebuilt and the archive
//!   opened. the key is only shown when the tag matches.
//! - brute force: worker threads throw random shares at the archive for a
//!   fixed time. every attempt must fail; one success is a correctness bug.

use std::fmt::Display;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info};

use crate::cipher::{self, MIN_BLOB_LEN};
use crate::config::{HarnessConfig, MAX_WORKERS};
use crate::keys::{create_private_dir, write_private, MasterKey, KEY_LEN};
use crate::store::ARCHIVE_EXTENSION;
use crate::share::KeyShare;
use crate::sharer::{combine_key, MAX_SHARES, MIN_THRESHOLD};
use crate::{Error, Result};

/// how often the operator may retype shares before giving up
pub const MAX_PROMPT_ATTEMPTS: usize = 3;

/// encoded share length of a real key share: 32 data bytes and the index
pub const DEFAULT_SHARE_LEN: usize = KEY_LEN + 1;

/// read exactly `threshold` non-empty share lines from `reader`.
///
/// blank lines are skipped. running out of input before `threshold` shares
/// is `NotEnoughShares`.
pub fn prompt_shares<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    threshold: usize,
) -> Result<Vec<KeyShare>> {
    let console = || PathBuf::from("<console>");
    let mut shares = Vec::with_capacity(threshold);
    let mut line = String::new();

    while shares.len() < threshold {
        let position = shares.len() + 1;
        write!(writer, "enter share {}/{}: ", position, threshold).map_err(|e| Error::io(console(), e))?;
        writer.flush().map_err(|e| Error::io(console(), e))?;

        line.clear();
        let read = reader.read_line(&mut line).map_err(|e| Error::io(console(), e))?;
        if read == 0 {
            return Err(Error::NotEnoughShares {
                have: shares.len(),
                need: threshold,
            });
        }
        if line.trim().is_empty() {
            continue;
        }
        shares.push(KeyShare::from_hex(&line, position)?);
    }

    Ok(shares)
}

/// a key rebuilt from shares that opened its archive
pub struct Recovered {
    pub key: MasterKey,
    pub plaintext: Vec<u8>,
}

/// rebuild the key from `shares` and open `archive` with it.
///
/// the archive is read first so an unreadable file is reported as `Io`
/// rather than blamed on the shares.
pub fn reconstruct(archive: &Path, shares: &[KeyShare]) -> Result<Recovered> {
    let blob = std::fs::read(archive).map_err(|e| Error::io(archive, e))?;
    let key = combine_key(shares)?;
    let plaintext = cipher::open(&key, &blob)?;
    info!(
        "reconstructed key {} opened {} ({} bytes)",
        key.fingerprint(),
        archive.display(),
        plaintext.len()
    );
    Ok(Recovered { key, plaintext })
}

/// output file for plaintext recovered from `archive`:
/// `dir/<archive name minus extension>_<YYYYMMDD_HHMMSS>`
pub fn decrypted_path<Tz: TimeZone>(dir: &Path, archive: &Path, now: &DateTime<Tz>) -> PathBuf
where
    Tz::Offset: Display,
{
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = file_name
        .strip_suffix(ARCHIVE_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(&file_name);
    let base = if base.is_empty() { "archive" } else { base };
    dir.join(format!("{}_{}", base, now.format("%Y%m%d_%H%M%S")))
}

/// write recovered plaintext under `dir` (created 0700) as a 0600 file
/// named by [`decrypted_path`]
pub fn write_decrypted<Tz: TimeZone>(
    dir: &Path,
    archive: &Path,
    plaintext: &[u8],
    now: &DateTime<Tz>,
) -> Result<PathBuf>
where
    Tz::Offset: Display,
{
    create_private_dir(dir)?;
    let path = decrypted_path(dir, archive, now);
    write_private(&path, plaintext)?;
    info!("decrypted {} to {}", archive.display(), path.display());
    Ok(path)
}

/// periodic brute-force status
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub attempts: u64,
    pub elapsed: Duration,
    /// attempts per second so far
    pub rate: f64,
}

#[derive(Debug, Clone)]
pub struct BruteForceReport {
    pub attempts: u64,
    pub elapsed: Duration,
    pub workers: usize,
    pub rate: f64,
}

/// random-share attack simulator
#[derive(Debug, Clone)]
pub struct BruteForce {
    pub workers: usize,
    pub duration: Duration,
    /// attempts a worker batches before touching the shared tally
    pub report_every: u64,
    /// shares per attempt, normally the bundle's threshold
    pub share_count: usize,
    /// encoded bytes per share, index included
    pub share_len: usize,
}

struct Tally {
    attempts: u64,
}

impl BruteForce {
    pub fn from_config(config: &HarnessConfig, share_count: usize) -> Self {
        Self {
            workers: config.workers,
            duration: Duration::from_secs(config.duration_secs),
            report_every: config.report_every,
            share_count,
            share_len: DEFAULT_SHARE_LEN,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(Error::ConfigInvalid(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.report_every == 0 {
            return Err(Error::ConfigInvalid("report_every must be at least 1".into()));
        }
        if self.share_count < MIN_THRESHOLD || self.share_count > MAX_SHARES {
            return Err(Error::ConfigInvalid(format!(
                "share_count must be between {} and {}, got {}",
                MIN_THRESHOLD, MAX_SHARES, self.share_count
            )));
        }
        if self.share_len < 2 {
            return Err(Error::ConfigInvalid("share_len must be at least 2".into()));
        }
        Ok(())
    }

    /// attack `blob` until the duration runs out or `stop` is raised.
    ///
    /// `on_progress` fires from worker threads whenever one flushes its
    /// local count. a successful decryption stops every worker and comes
    /// back as `CorrectnessViolation`.
    pub fn run<F>(&self, blob: &[u8], stop: &AtomicBool, on_progress: F) -> Result<BruteForceReport>
    where
        F: Fn(Progress) + Sync,
    {
        self.validate()?;
        if blob.len() < MIN_BLOB_LEN {
            return Err(Error::ArchiveTooShort {
                len: blob.len(),
                need: MIN_BLOB_LEN,
            });
        }

        info!(
            "starting brute force: {} workers, {:?}, {} random shares of {} bytes per attempt",
            self.workers, self.duration, self.share_count, self.share_len
        );

        let tally = Mutex::new(Tally { attempts: 0 });
        let start = Instant::now();
        let deadline = start + self.duration;
        let finished = AtomicBool::new(false);
        let on_progress = &on_progress;

        let outcomes: Vec<Option<u64>> = thread::scope(|s| {
            let timer = s.spawn(|| {
                while !stop.load(Ordering::Relaxed) && !finished.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now >= deadline {
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    thread::sleep((deadline - now).min(Duration::from_millis(50)));
                }
            });

            let handles: Vec<_> = (0..self.workers)
                .map(|worker| {
                    let tally = &tally;
                    s.spawn(move || self.work(worker, blob, stop, tally, start, on_progress))
                })
                .collect();

            let outcomes: Vec<Option<u64>> = handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect();

            finished.store(true, Ordering::Relaxed);
            if let Err(panic) = timer.join() {
                std::panic::resume_unwind(panic);
            }
            outcomes
        });

        let elapsed = start.elapsed();
        let attempts = tally.lock().attempts;

        if let Some((worker, at)) = outcomes
            .iter()
            .enumerate()
            .find_map(|(worker, hit)| hit.map(|at| (worker, at)))
        {
            error!(
                "CRITICAL: worker {} decrypted the archive with random shares after {} attempts",
                worker, at
            );
            return Err(Error::CorrectnessViolation { worker, attempts: at });
        }

        let report = BruteForceReport {
            attempts,
            elapsed,
            workers: self.workers,
            rate: rate(attempts, elapsed),
        };
        info!(
            "brute force finished: {} attempts in {:.2?} ({:.0}/s), no success",
            report.attempts, report.elapsed, report.rate
        );
        Ok(report)
    }

    /// one worker loop. returns the local attempt count of a success.
    fn work<F>(
        &self,
        worker: usize,
        blob: &[u8],
        stop: &AtomicBool,
        tally: &Mutex<Tally>,
        start: Instant,
        on_progress: &F,
    ) -> Option<u64>
    where
        F: Fn(Progress) + Sync,
    {
        let mut rng = rand::thread_rng();
        let mut local = 0u64;
        let mut unflushed = 0u64;

        let flush = |count: u64| {
            let attempts = {
                let mut tally = tally.lock();
                tally.attempts += count;
                tally.attempts
            };
            let elapsed = start.elapsed();
            on_progress(Progress {
                attempts,
                elapsed,
                rate: rate(attempts, elapsed),
            });
        };

        while !stop.load(Ordering::Relaxed) {
            local += 1;
            unflushed += 1;

            let shares = random_shares(&mut rng, self.share_count, self.share_len);
            let opened = combine_key(&shares).and_then(|key| cipher::open(&key, blob));
            if opened.is_ok() {
                stop.store(true, Ordering::Relaxed);
                flush(unflushed);
                return Some(local);
            }

            if unflushed >= self.report_every {
                flush(unflushed);
                unflushed = 0;
            }
        }

        if unflushed > 0 {
            flush(unflushed);
        }
        debug!("worker {} stopped after {} attempts", worker, local);
        None
    }
}

/// `count` shares with distinct non-zero indices and random payloads
fn random_shares<R: Rng>(rng: &mut R, count: usize, share_len: usize) -> Vec<KeyShare> {
    rand::seq::index::sample(rng, MAX_SHARES, count)
        .into_iter()
        .map(|i| {
            let mut data = vec![0u8; share_len - 1];
            rng.fill(data.as_mut_slice());
            KeyShare::new((i + 1) as u8, data)
        })
        .collect()
}

fn rate(attempts: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        attempts as f64 / secs
    } else {
        0.0
    }
}
