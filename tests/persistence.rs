//! Dump/restore round-trip tests.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nitro::{Config, Nitro, NitroError, Snapshot};
use rand::{Rng, SeedableRng, rngs::StdRng};

fn collect(snap: &Arc<Snapshot>) -> Vec<Vec<u8>> {
    let mut it = snap.new_iterator().unwrap();
    let mut keys = Vec::new();
    it.seek_first();
    while it.valid() {
        keys.push(it.get().to_vec());
        it.next();
    }
    it.close();
    keys
}

#[test]
fn test_load_store_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let db = &db;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut w = db.new_writer();
                for i in 0..12_500u64 {
                    if i % 5000 == 0 {
                        let s = w.new_snapshot().unwrap();
                        s.close();
                    }
                    let v: u64 = rng.gen();
                    w.put(&v.to_be_bytes());
                }
            });
        }
    });

    let snap = db.new_snapshot().unwrap();
    let source_keys = collect(&snap);
    db.store_to_disk(dir.path(), &snap, 8, None).unwrap();
    snap.close();
    db.close();

    let db2 = Nitro::new();
    let snap2 = db2.load_from_disk(dir.path(), 8, None).unwrap();
    assert_eq!(snap2.count() as usize, source_keys.len());
    assert_eq!(collect(&snap2), source_keys);
    snap2.close();
    db2.close();
}

#[test]
fn test_load_store_disk_delta() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::with_config(Config::default().use_delta_interleaving());
    let mut w = db.new_writer();
    for i in 0..20_000u64 {
        w.put(format!("{:010}", i).as_bytes());
    }
    let snap = db.new_snapshot().unwrap();
    let source_keys = collect(&snap);
    db.store_to_disk(dir.path(), &snap, 4, None).unwrap();
    snap.close();
    db.close();

    let db2 = Nitro::with_config(Config::default().use_delta_interleaving());
    let snap2 = db2.load_from_disk(dir.path(), 4, None).unwrap();
    assert_eq!(snap2.count() as usize, source_keys.len());
    assert_eq!(collect(&snap2), source_keys);
    snap2.close();
    db2.close();
}

#[test]
fn test_store_disk_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();
    let mut w = db.new_writer();
    for i in 0..100_000u64 {
        w.put(&i.to_be_bytes());
    }
    let snap = db.new_snapshot().unwrap();

    let started = AtomicBool::new(false);
    let slow_callback = |_k: &[u8]| {
        started.store(true, Ordering::Release);
        std::thread::sleep(Duration::from_micros(50));
    };

    let res = std::thread::scope(|s| {
        let handle = {
            let db = &db;
            let snap = &snap;
            let cb = &slow_callback;
            s.spawn(move || db.store_to_disk(dir.path(), snap, 4, Some(cb)))
        };
        while !started.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        snap.close();
        db.close();
        handle.join().unwrap()
    });

    assert_eq!(res, Err(NitroError::Shutdown));
}

#[test]
fn test_load_callback_sees_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();
    let mut w = db.new_writer();
    for i in 0..1000u64 {
        w.put(&i.to_be_bytes());
    }
    let snap = db.new_snapshot().unwrap();
    db.store_to_disk(dir.path(), &snap, 2, None).unwrap();
    snap.close();
    db.close();

    let seen = std::sync::atomic::AtomicU64::new(0);
    let db2 = Nitro::new();
    let cb = |_k: &[u8]| {
        seen.fetch_add(1, Ordering::Relaxed);
    };
    let snap2 = db2.load_from_disk(dir.path(), 2, Some(&cb)).unwrap();
    assert_eq!(seen.load(Ordering::Relaxed), 1000);
    assert_eq!(snap2.count(), 1000);
    snap2.close();
    db2.close();
}

#[test]
fn test_load_missing_dump() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();
    let res = db.load_from_disk(dir.path(), 2, None);
    assert!(matches!(res, Err(NitroError::Io(_))));
    db.close();
}

#[test]
fn test_load_corrupt_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();
    let mut w = db.new_writer();
    for i in 0..100u64 {
        w.put(&i.to_be_bytes());
    }
    let snap = db.new_snapshot().unwrap();
    db.store_to_disk(dir.path(), &snap, 2, None).unwrap();
    snap.close();
    db.close();

    // Stamp garbage over the manifest.
    let mut f = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(dir.path().join("manifest"))
        .unwrap();
    f.write_all(&[0xde, 0xad]).unwrap();
    drop(f);

    let db2 = Nitro::new();
    let res = db2.load_from_disk(dir.path(), 2, None);
    assert!(matches!(res, Err(NitroError::Corrupt(_))));
    db2.close();
}

#[test]
fn test_load_truncated_shard() {
    let dir = tempfile::tempdir().unwrap();
    let db = Nitro::new();
    let mut w = db.new_writer();
    for i in 0..1000u64 {
        w.put(&i.to_be_bytes());
    }
    let snap = db.new_snapshot().unwrap();
    db.store_to_disk(dir.path(), &snap, 1, None).unwrap();
    snap.close();
    db.close();

    // Chop the single shard mid-record.
    let shard = dir.path().join("shard-0000.data");
    let len = std::fs::metadata(&shard).unwrap().len();
    let f = OpenOptions::new().write(true).open(&shard).unwrap();
    f.set_len(len - 3).unwrap();
    drop(f);

    let db2 = Nitro::new();
    let res = db2.load_from_disk(dir.path(), 1, None);
    assert!(matches!(res, Err(NitroError::Corrupt(_))));
    db2.close();
}
