use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::engine::{Engine, EngineConfig};

fn test_config() -> EngineConfig {
    EngineConfig {
        flush_threshold_bytes: 64 * 1024,
        memtable_shards: 4,
        wal_group_n: 4,
        wal_group_micros: 200,
        stripe_group_n: 2,
        ..EngineConfig::default()
    }
}

#[test]
fn test_reopen_after_close_preserves_everything() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), test_config()).unwrap();
        for i in 0..100u64 {
            engine
                .put(format!("key-{i:04}").as_bytes(), &i.to_le_bytes())
                .unwrap();
        }
        engine.delete(b"key-0050").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path(), test_config()).unwrap();
    for i in 0..100u64 {
        let key = format!("key-{i:04}");
        let expected = if i == 50 {
            None
        } else {
            Some(i.to_le_bytes().to_vec())
        };
        assert_eq!(engine.get(key.as_bytes()).unwrap(), expected);
    }
    engine.close().unwrap();
}

#[test]
fn test_seq_counter_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let last = {
        let engine = Engine::open(tmp.path(), test_config()).unwrap();
        let mut last = 0;
        for i in 0..10u64 {
            last = engine.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        engine.close().unwrap();
        last
    };

    let engine = Engine::open(tmp.path(), test_config()).unwrap();
    let next = engine.put(b"after-restart", b"v").unwrap();
    assert!(
        next > last,
        "seq {next} must exceed pre-restart {last}"
    );
    engine.close().unwrap();
}

#[test]
fn test_recovery_without_clean_close() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), test_config()).unwrap();
        for i in 0..50u64 {
            engine
                .put(format!("key-{i:04}").as_bytes(), b"durable")
                .unwrap();
        }
        // No close(): drop runs close, but flush() first so the WAL and
        // SSTs both hold the records, then simulate the crash by leaving
        // the engine via drop.
        engine.flush().unwrap();
    }

    let engine = Engine::open(tmp.path(), test_config()).unwrap();
    for i in 0..50u64 {
        let key = format!("key-{i:04}");
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(b"durable".to_vec()));
    }
    engine.close().unwrap();
}

#[test]
fn test_wal_tail_torn_after_crash() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), test_config()).unwrap();
        // One checkpointed batch...
        for i in 0..20u64 {
            engine
                .put(format!("old-{i:04}").as_bytes(), b"checkpointed")
                .unwrap();
        }
        engine.flush().unwrap();
        // ...then a post-checkpoint batch living only in the WAL.
        for i in 0..20u64 {
            engine
                .put(format!("new-{i:04}").as_bytes(), b"wal-only")
                .unwrap();
        }
        // Crash: suppress the destructor so nothing else is flushed.
        std::mem::forget(engine);
    }

    // Tear the newest WAL segment mid-frame: the crash ate a suffix.
    let wal_dir = tmp.path().join("wal");
    let mut segments: Vec<_> = fs::read_dir(&wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    let live = segments
        .iter()
        .rev()
        .find(|p| fs::metadata(p).unwrap().len() > 0)
        .unwrap();
    let len = fs::metadata(live).unwrap().len();
    let f = OpenOptions::new().write(true).open(live).unwrap();
    f.set_len(len - 13).unwrap();
    f.sync_all().unwrap();

    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    // Checkpointed data is all there.
    for i in 0..20u64 {
        let key = format!("old-{i:04}");
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(b"checkpointed".to_vec())
        );
    }

    // The WAL-only batch recovered a prefix: everything before the torn
    // frame, nothing after it.
    let recovered: Vec<u64> = (0..20u64)
        .filter(|i| {
            engine
                .get(format!("new-{i:04}").as_bytes())
                .unwrap()
                .is_some()
        })
        .collect();
    assert!(recovered.len() < 20, "the torn record must be gone");
    for (expect, got) in recovered.iter().enumerate() {
        assert_eq!(expect as u64, *got, "recovered set must be a prefix");
    }

    engine.close().unwrap();
}

#[test]
fn test_zeroed_lanes_do_not_affect_reads() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(tmp.path(), test_config()).unwrap();
        for i in 0..200u64 {
            engine
                .put(format!("key-{i:04}").as_bytes(), &[i as u8; 128])
                .unwrap();
        }
        engine.close().unwrap();
    }

    // Zero two data lanes in place; the LSM read path never touches
    // them, and stripe recovery must not trim committed stripes.
    for lane in ["data_1", "data_3"] {
        let path = tmp.path().join("lanes").join(lane);
        let len = fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&vec![0u8; len as usize]).unwrap();
        f.sync_all().unwrap();
    }

    let engine = Engine::open(tmp.path(), test_config()).unwrap();
    for i in 0..200u64 {
        let key = format!("key-{i:04}");
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(vec![i as u8; 128]));
    }
    engine.close().unwrap();
}

#[test]
fn test_stripe_fallback_serves_when_wal_is_gone() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        use_stripe_for_read: true,
        // Keep the memtable from sealing so nothing reaches an SSTable.
        flush_threshold_bytes: 64 * 1024 * 1024,
        stripe_group_n: 1,
        ..test_config()
    };

    {
        let engine = Engine::open(tmp.path(), config.clone()).unwrap();
        // Enough data to complete and commit several stripes
        // (k = 4 lanes × 32 KiB blocks per stripe).
        for i in 0..600u64 {
            engine
                .put(format!("key-{i:04}").as_bytes(), &[i as u8; 512])
                .unwrap();
        }
        // Crash: no close(), no flush, destructor suppressed.
        std::mem::forget(engine);
    }

    // The crash also ate the WAL. Committed stripes are now the only
    // copy of the data.
    fs::remove_dir_all(tmp.path().join("wal")).unwrap();

    let engine = Engine::open(tmp.path(), config).unwrap();
    let committed = engine.stats().unwrap().committed_stripes;
    assert!(committed > 0, "group commits must have landed stripes");

    // Early keys live in committed stripes and resolve through the
    // fallback; the newest suffix (incomplete stripe) is gone.
    assert_eq!(engine.get(b"key-0000").unwrap(), Some(vec![0u8; 512]));
    assert_eq!(engine.get(b"key-0050").unwrap(), Some(vec![50u8; 512]));
    engine.close().unwrap();
}
