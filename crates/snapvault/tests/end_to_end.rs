//! end-to-end: provision, seal, recover, reap
//!
//! everything runs against a temp directory with the default 3-of-3 policy
//! unless a test says otherwise.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};

use chrono::{TimeZone, Utc};
use snapvault::harness::{prompt_shares, reconstruct, write_decrypted};
use snapvault::keys::CANARY_PLAINTEXT;
use snapvault::{
    cipher, ArchiveStore, BruteForce, Config, CycleInfo, Error, FileCollector, KeyManager, KeyShare,
    Pipeline, Regenerate,
};

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.keys.dir = dir.join("keys");
    config.keys.canary_path = Some(dir.join("test_hello.encrypted"));
    config.store.root = dir.join("snapshots");
    config.pipeline.info_path = Some(dir.join("last_snapshot.json"));
    config.harness.decrypt_dir = dir.join("decrypted");
    config
}

#[test]
fn hello_world_three_of_three() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let manager = KeyManager::new(config.keys.clone());

    let provisioned = manager.provision(3, 3, Regenerate::Refuse).unwrap();
    assert_eq!(provisioned.shares.len(), 3);
    let canary = manager.write_canary(&provisioned.key).unwrap();

    let hex: Vec<String> = provisioned.shares.iter().map(KeyShare::to_hex).collect();

    // all three shares typed back in
    let input = format!("{}\n{}\n{}\n", hex[0], hex[1], hex[2]);
    let mut prompts = Vec::new();
    let shares = prompt_shares(&mut input.as_bytes(), &mut prompts, 3).unwrap();
    let recovered = reconstruct(&canary, &shares).unwrap();
    assert_eq!(recovered.plaintext, CANARY_PLAINTEXT);
    assert_eq!(recovered.key, provisioned.key);

    // any two of three: never the plaintext
    for skip in 0..3 {
        let partial: Vec<KeyShare> = provisioned
            .shares
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, s)| s.clone())
            .collect();
        match reconstruct(&canary, &partial) {
            Err(e) => assert!(e.is_retryable(), "unexpected error {}", e),
            Ok(_) => panic!("two of three shares opened the canary"),
        }
    }
}

#[test]
fn bundle_records_policy_without_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let manager = KeyManager::new(config.keys.clone());
    manager.provision(5, 3, Regenerate::Refuse).unwrap();

    let bundle = manager.load_bundle().unwrap();
    assert_eq!(bundle.total_shares, 5);
    assert_eq!(bundle.required_shares, 3);
    assert!(bundle.master_key_hex.is_none());

    assert!(matches!(
        manager.provision(5, 3, Regenerate::Refuse),
        Err(Error::KeyExists { .. })
    ));
}

#[test]
fn pipeline_archive_opens_with_threshold_shares() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let manager = KeyManager::new(config.keys.clone());
    let provisioned = manager.provision(4, 2, Regenerate::Refuse).unwrap();

    let image = dir.path().join("root.img");
    std::fs::write(&image, vec![0x5au8; 64 * 1024]).unwrap();

    let pipeline = Pipeline::with_collector(&config, Box::new(FileCollector::new(&image)));
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap();
    let report = pipeline.run_cycle(now).unwrap();

    let recovered = reconstruct(&report.archive, &provisioned.shares[2..]).unwrap();
    assert_eq!(recovered.plaintext.len(), 64 * 1024);
    assert!(recovered.plaintext.iter().all(|&b| b == 0x5a));
}

#[test]
fn recovered_archive_lands_in_decrypt_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let provisioned = KeyManager::new(config.keys.clone())
        .provision(3, 2, Regenerate::Refuse)
        .unwrap();

    let image = dir.path().join("root.img");
    std::fs::write(&image, b"disk contents").unwrap();

    let pipeline = Pipeline::with_collector(&config, Box::new(FileCollector::new(&image)));
    let taken = Utc.with_ymd_and_hms(2026, 10, 16, 22, 15, 0).unwrap();
    let report = pipeline.run_cycle(taken).unwrap();

    let last = CycleInfo::load(config.pipeline.info_path.as_ref().unwrap()).unwrap();
    assert_eq!(last.path, report.archive);
    assert_eq!(ArchiveStore::parse_name(&last.path), Some(taken.naive_utc()));

    let recovered = reconstruct(&last.path, &provisioned.shares[..2]).unwrap();
    let opened_at = Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 1).unwrap();
    let out = write_decrypted(&config.harness.decrypt_dir, &last.path, &recovered.plaintext, &opened_at).unwrap();

    assert_eq!(out, dir.path().join("decrypted/disk_image_16102026_2215_20261017_080001"));
    assert_eq!(std::fs::read(out).unwrap(), b"disk contents");
}

#[test]
fn regeneration_invalidates_old_shares() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let manager = KeyManager::new(config.keys.clone());

    let old = manager.provision(3, 2, Regenerate::Refuse).unwrap();
    let canary = manager.write_canary(&old.key).unwrap();
    let new = manager.provision(3, 2, Regenerate::Confirmed).unwrap();
    assert!(new.regenerated);
    assert!(!canary.exists());

    let canary = manager.write_canary(&new.key).unwrap();
    assert!(matches!(
        reconstruct(&canary, &old.shares[..2]),
        Err(Error::Authentication)
    ));
    assert!(reconstruct(&canary, &new.shares[1..]).is_ok());
}

#[test]
fn brute_force_terminates_without_success() {
    let blob = cipher::seal(&snapvault::MasterKey::generate(), CANARY_PLAINTEXT).unwrap();
    let stop = AtomicBool::new(false);

    let bf = BruteForce {
        workers: 3,
        duration: Duration::from_millis(500),
        report_every: 50,
        share_count: 3,
        share_len: 33,
    };
    let report = bf.run(&blob, &stop, |_| {}).unwrap();

    assert!(report.attempts > 0);
    assert!(report.rate > 0.0);
}

#[test]
fn retention_twice_removes_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.store.retention_days = 2;
    let store = snapvault::ArchiveStore::new(&config.store);

    let now = SystemTime::now();
    for (hour, age_days) in [(1u32, 10u64), (2, 5), (3, 0)] {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, hour, 0, 0).unwrap();
        let placed = store.placement(&at).unwrap();
        std::fs::write(&placed.path, b"sealed").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&placed.path)
            .unwrap()
            .set_modified(now - Duration::from_secs(age_days * 86_400))
            .unwrap();
    }

    let first = store.apply_retention(2, now);
    assert_eq!(first.removed, 2);
    assert_eq!(first.bytes_freed, 12);

    let second = store.apply_retention(2, now);
    assert_eq!(second.removed, 0);
    assert!(second.failures.is_empty());

    let left = store.list_archives().unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].path.to_string_lossy().contains("/2026/16/10/03/"));
}
