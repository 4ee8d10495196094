//! snapctl - encrypted backup archives under a threshold-shared key
//!
//! usage:
//!   snapctl generate --total 5 --threshold 3    # new key, print shares once
//!   snapctl canary                              # seal "hello world!" for share drills
//!   snapctl snapshot --source /var/lib/root.img # one archive cycle
//!   snapctl decrypt /app/test_hello.encrypted   # type shares, open into /app/decrypted
//!   snapctl brute-force /app/test_hello.encrypted --workers 8 --duration 60
//!   snapctl retention --days 14
//!   snapctl list | info
//!
//! settings come from a toml file (see `snapvault::config`), flags override.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use snapvault::harness::{prompt_shares, reconstruct, write_decrypted, MAX_PROMPT_ATTEMPTS};
use snapvault::{
    ArchiveStore, BruteForce, Config, CycleInfo, Error as VaultError, KeyManager, KeyShare, Pipeline,
    Regenerate, UploadOutcome,
};

/// plaintext up to this size is echoed after decryption when it is utf-8
const PREVIEW_LIMIT: usize = 4096;

#[derive(Parser)]
#[command(name = "snapctl")]
#[command(about = "snapctl - encrypted backup archives under a threshold-shared key")]
#[command(version)]
struct Cli {
    /// config file (missing file means defaults)
    #[arg(short, long, env = "SNAPCTL_CONFIG", default_value = "/app/snapctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// generate a master key and print its shares
    Generate {
        /// number of shares (n)
        #[arg(long)]
        total: Option<usize>,

        /// shares needed to recover (t)
        #[arg(long)]
        threshold: Option<usize>,

        /// replace an existing key. old shares stop working for new archives
        #[arg(long)]
        force: bool,
    },

    /// seal the known plaintext under the current key
    Canary,

    /// collect, encrypt and store one archive
    Snapshot {
        /// archive this file
        #[arg(long, conflicts_with = "command")]
        source: Option<PathBuf>,

        /// archive stdout of this program
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        command: Option<Vec<String>>,
    },

    /// recover the key from shares and open an archive
    Decrypt {
        archive: PathBuf,

        /// write the plaintext here instead of under harness.decrypt_dir
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// attack an archive with random shares, expecting no success
    BruteForce {
        archive: PathBuf,

        #[arg(short, long, env = "SNAPCTL_WORKERS")]
        workers: Option<usize>,

        /// seconds to run
        #[arg(short, long, env = "SNAPCTL_DURATION")]
        duration: Option<u64>,
    },

    /// delete archives older than the retention period
    Retention {
        #[arg(long, env = "SNAPCTL_RETENTION_DAYS")]
        days: Option<i64>,
    },

    /// list archives in the store
    List,

    /// show key, bundle and store status
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("snapctl=info".parse()?)
                .add_directive("snapvault=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Generate { total, threshold, force } => {
            if let Some(n) = total {
                config.keys.total_shares = n;
            }
            if let Some(t) = threshold {
                config.keys.threshold = t;
            }
            config.validate()?;
            run_generate(&config, force)
        }
        Commands::Canary => {
            config.validate()?;
            run_canary(&config)
        }
        Commands::Snapshot { source, command } => {
            if source.is_some() || command.is_some() {
                config.pipeline.source = source;
                config.pipeline.command = command;
            }
            config.validate()?;
            run_snapshot(&config)
        }
        Commands::Decrypt { archive, out } => {
            config.validate()?;
            run_decrypt(&config, &archive, out.as_deref())
        }
        Commands::BruteForce { archive, workers, duration } => {
            if let Some(w) = workers {
                config.harness.workers = w;
            }
            if let Some(d) = duration {
                config.harness.duration_secs = d;
            }
            config.validate()?;
            run_brute_force(&config, &archive)
        }
        Commands::Retention { days } => {
            if let Some(d) = days {
                config.store.retention_days = d;
            }
            config.validate()?;
            run_retention(&config)
        }
        Commands::List => run_list(&config),
        Commands::Info => run_info(&config),
    }
}

fn run_generate(config: &Config, force: bool) -> Result<()> {
    let manager = KeyManager::new(config.keys.clone());
    let regenerate = if force { Regenerate::Confirmed } else { Regenerate::Refuse };

    let provisioned = match manager.provision(config.keys.total_shares, config.keys.threshold, regenerate) {
        Ok(p) => p,
        Err(VaultError::KeyExists { path }) => {
            bail!(
                "master key already exists at {}, pass --force to replace it",
                path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };

    info!("master key {} saved to {}", provisioned.key.fingerprint(), manager.key_path().display());
    if provisioned.regenerated {
        warn!("previous key replaced: archives sealed under it need its old shares");
    }

    print_shares(&provisioned.shares, provisioned.bundle.required_shares);

    if config.keys.canary_path.is_some() {
        manager.write_canary(&provisioned.key)?;
    }
    Ok(())
}

fn print_shares(shares: &[KeyShare], threshold: usize) {
    println!();
    println!("  {} shares, any {} recover the master key", shares.len(), threshold);
    println!("  give one to each custodian. they are not stored anywhere.");
    for share in shares {
        let hex = share.to_hex();
        let width = hex.len() + 4;
        println!();
        println!("  ┌{}┐", "─".repeat(width));
        println!("  │ share {:<w$} │", share.index, w = width - 8);
        println!("  │  {}  │", hex);
        println!("  └{}┘", "─".repeat(width));
    }
    println!();
}

fn run_canary(config: &Config) -> Result<()> {
    let manager = KeyManager::new(config.keys.clone());
    let key = manager.load()?;
    let path = manager.write_canary(&key)?;
    println!("canary sealed under {} at {}", key.fingerprint(), path.display());
    Ok(())
}

fn run_snapshot(config: &Config) -> Result<()> {
    let pipeline = Pipeline::new(config)?;
    let report = pipeline.run_cycle(Local::now())?;

    println!("archive:   {}", report.archive.display());
    println!("plaintext: {} bytes", report.plaintext_len);
    println!("sealed:    {} bytes", report.archive_len);
    if let Some(info) = &report.info {
        println!("recorded:  {}", info.display());
    }
    if report.retention.removed > 0 {
        println!(
            "retention: removed {} archives, {} bytes",
            report.retention.removed, report.retention.bytes_freed
        );
    }
    match &report.upload {
        UploadOutcome::Skipped => {}
        UploadOutcome::Uploaded { key } => println!("uploaded:  {}", key),
        UploadOutcome::Failed { key, reason } => println!("upload of {} failed: {}", key, reason),
    }
    Ok(())
}

/// threshold from the bundle if there is one, else from config
fn required_shares(config: &Config) -> usize {
    let manager = KeyManager::new(config.keys.clone());
    match manager.load_bundle() {
        Ok(bundle) => bundle.required_shares,
        Err(e) => {
            warn!("no readable key bundle ({}), assuming threshold {}", e, config.keys.threshold);
            config.keys.threshold
        }
    }
}

fn run_decrypt(config: &Config, archive: &Path, out: Option<&Path>) -> Result<()> {
    let threshold = required_shares(config);
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut stdout = std::io::stdout();

    for attempt in 1..=MAX_PROMPT_ATTEMPTS {
        let outcome = prompt_shares(&mut input, &mut stdout, threshold)
            .and_then(|shares| reconstruct(archive, &shares));

        match outcome {
            Ok(recovered) => {
                let key_hex = recovered.key.to_hex();
                println!();
                println!("  ┌{}┐", "─".repeat(key_hex.len() + 4));
                println!("  │  {}  │", key_hex.as_str());
                println!("  └{}┘", "─".repeat(key_hex.len() + 4));
                println!("  archive opened, key fingerprint {}", recovered.key.fingerprint());

                let written = match out {
                    Some(path) => {
                        std::fs::write(path, &recovered.plaintext)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        path.to_path_buf()
                    }
                    None => write_decrypted(&config.harness.decrypt_dir, archive, &recovered.plaintext, &Local::now())?,
                };
                print_archive_metadata(archive, recovered.plaintext.len(), &written);
                if recovered.plaintext.len() <= PREVIEW_LIMIT {
                    if let Ok(text) = std::str::from_utf8(&recovered.plaintext) {
                        println!("  content:   {}", text);
                    }
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < MAX_PROMPT_ATTEMPTS => {
                error!("{}", e);
                writeln!(stdout, "try again ({} of {} attempts left)", MAX_PROMPT_ATTEMPTS - attempt, MAX_PROMPT_ATTEMPTS)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    bail!("no valid shares after {} attempts", MAX_PROMPT_ATTEMPTS)
}

fn print_archive_metadata(archive: &Path, plaintext_len: usize, written: &Path) {
    println!("  archive:   {}", archive.display());
    if let Some(created) = ArchiveStore::parse_name(archive) {
        println!("  created:   {}", created.format("%Y-%m-%d %H:%M"));
    }
    if let Ok(meta) = std::fs::metadata(archive) {
        println!("  sealed:    {} bytes", meta.len());
    }
    println!("  plaintext: {} bytes", plaintext_len);
    println!("  saved to:  {}", written.display());
}

fn run_brute_force(config: &Config, archive: &Path) -> Result<()> {
    let blob = std::fs::read(archive).with_context(|| format!("failed to read {}", archive.display()))?;
    let bf = BruteForce::from_config(&config.harness, required_shares(config).max(2));
    let stop = AtomicBool::new(false);

    println!(
        "attacking {} with {} workers for {}s, {} shares per attempt",
        archive.display(),
        bf.workers,
        config.harness.duration_secs,
        bf.share_count
    );

    let report = bf.run(&blob, &stop, |p| {
        info!("{} attempts ({:.0}/s) after {:.1?}", p.attempts, p.rate, p.elapsed);
    })?;

    println!("attempts:  {}", report.attempts);
    println!("elapsed:   {:.2?}", report.elapsed);
    println!("rate:      {:.0}/s over {} workers", report.rate, report.workers);
    println!("result:    no random share set opened the archive");
    Ok(())
}

fn run_retention(config: &Config) -> Result<()> {
    if config.store.retention_days <= 0 {
        println!("retention disabled, nothing removed");
        return Ok(());
    }
    let store = ArchiveStore::new(&config.store);
    let report = store.apply_retention(config.store.retention_days, SystemTime::now());

    println!(
        "removed {} archives ({} bytes), {} empty directories",
        report.removed, report.bytes_freed, report.dirs_removed
    );
    for (path, reason) in &report.failures {
        println!("  failed: {}: {}", path.display(), reason);
    }
    if !report.failures.is_empty() {
        bail!("{} retention failures", report.failures.len());
    }
    Ok(())
}

fn run_list(config: &Config) -> Result<()> {
    let store = ArchiveStore::new(&config.store);
    let archives = store.list_archives()?;
    if archives.is_empty() {
        println!("no archives under {}", store.root().display());
        return Ok(());
    }
    for entry in &archives {
        let modified = entry
            .modified
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!("{}  {:>12}  {}", modified, entry.size, entry.path.display());
    }
    Ok(())
}

fn run_info(config: &Config) -> Result<()> {
    let manager = KeyManager::new(config.keys.clone());

    println!("key:       {}", manager.key_path().display());
    match manager.load() {
        Ok(key) => println!("           present, fingerprint {}", key.fingerprint()),
        Err(e) => println!("           {}", e),
    }

    match manager.load_bundle() {
        Ok(bundle) => println!(
            "bundle:    {}-of-{}, generated {}",
            bundle.required_shares,
            bundle.total_shares,
            bundle.generated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        Err(_) => println!("bundle:    none at {}", manager.bundle_path().display()),
    }

    if let Some(canary) = &config.keys.canary_path {
        println!("canary:    {} ({})", canary.display(), if canary.exists() { "present" } else { "missing" });
    }

    let store = ArchiveStore::new(&config.store);
    let stats = store.stats();
    println!("store:     {} ({:?}, {:?})", store.root().display(), config.store.layout, config.store.kind);
    println!(
        "           {} years, {} days, {} months, {} hours",
        stats.years, stats.days, stats.months, stats.hours
    );
    println!(
        "           {} archives, {:.2} MB",
        stats.archives,
        stats.bytes as f64 / 1024.0 / 1024.0
    );
    match config.store.retention_days {
        d if d > 0 => println!("retention: {} days", d),
        _ => println!("retention: disabled"),
    }

    if let Some(info_path) = &config.pipeline.info_path {
        match CycleInfo::load(info_path) {
            Ok(last) => {
                println!("last:      {} ({:.2} MB)", last.name, last.size_mb);
                println!("           {}", last.path.display());
                println!(
                    "           {} on {}",
                    last.created_at.to_rfc3339(),
                    last.hostname.as_deref().unwrap_or("unknown host")
                );
            }
            Err(_) => println!("last:      no cycle recorded at {}", info_path.display()),
        }
    }
    Ok(())
}
