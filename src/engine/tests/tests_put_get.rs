use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use crate::engine::{Engine, EngineConfig, EngineError};

/// Small thresholds so tests exercise sealing without bulk data.
fn test_config() -> EngineConfig {
    EngineConfig {
        flush_threshold_bytes: 16 * 1024,
        memtable_shards: 4,
        wal_group_n: 4,
        wal_group_micros: 200,
        stripe_group_n: 2,
        ..EngineConfig::default()
    }
}

#[test]
fn test_put_get_delete() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    let seq1 = engine.put(b"k1", b"v1").unwrap();
    assert_eq!(seq1, 1);
    assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));

    let seq2 = engine.delete(b"k1").unwrap();
    assert_eq!(seq2, 2);
    assert_eq!(engine.get(b"k1").unwrap(), None);

    // Deleted and never-written are indistinguishable.
    assert_eq!(engine.get(b"never").unwrap(), None);

    engine.close().unwrap();
}

#[test]
fn test_overwrite_returns_latest() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    for i in 0..10u32 {
        engine.put(b"counter", &i.to_le_bytes()).unwrap();
    }
    assert_eq!(engine.get(b"counter").unwrap(), Some(9u32.to_le_bytes().to_vec()));
    engine.close().unwrap();
}

#[test]
fn test_cas_semantics() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    let seq = engine.put(b"k", b"a").unwrap();

    assert!(engine.cas(b"k", seq, Some(b"b".as_slice())).unwrap());
    assert_eq!(engine.get(b"k").unwrap(), Some(b"b".to_vec()));

    // Stale seq loses; no state change.
    assert!(!engine.cas(b"k", seq, Some(b"c".as_slice())).unwrap());
    assert_eq!(engine.get(b"k").unwrap(), Some(b"b".to_vec()));

    // Create-if-absent via expected seq 0.
    assert!(engine.cas(b"fresh", 0, Some(b"x".as_slice())).unwrap());
    assert!(!engine.cas(b"fresh", 0, Some(b"y".as_slice())).unwrap());

    // CAS can observe and replace a tombstone.
    let dseq = engine.delete(b"k").unwrap();
    assert!(engine.cas(b"k", dseq, Some(b"revived".as_slice())).unwrap());
    assert_eq!(engine.get(b"k").unwrap(), Some(b"revived".to_vec()));

    // CAS to a tombstone deletes.
    let cur = {
        let r = engine.range(Some(b"fresh".as_slice()), Some(b"fresh\x00".as_slice()), None).unwrap();
        r.last().unwrap().2
    };
    assert!(engine.cas(b"fresh", cur, None).unwrap());
    assert_eq!(engine.get(b"fresh").unwrap(), None);

    engine.close().unwrap();
}

#[test]
fn test_range_scan() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
        engine.put(key.as_bytes(), value.as_bytes()).unwrap();
    }

    let got: Vec<(Vec<u8>, Vec<u8>)> = engine
        .range(Some(b"b".as_slice()), Some(b"d".as_slice()), None)
        .unwrap()
        .map(|(k, v, _, _)| (k, v))
        .collect();
    assert_eq!(
        got,
        vec![
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );

    // Unbounded with a limit.
    let got: Vec<Vec<u8>> = engine
        .range(None, None, Some(3))
        .unwrap()
        .map(|(k, _, _, _)| k)
        .collect();
    assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // Deleted keys vanish from scans.
    engine.delete(b"b").unwrap();
    let got: Vec<Vec<u8>> = engine
        .range(None, None, None)
        .unwrap()
        .map(|(k, _, _, _)| k)
        .collect();
    assert_eq!(got, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    engine.close().unwrap();
}

#[test]
fn test_range_spans_memtable_and_sstables() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    for i in 0..50 {
        engine
            .put(format!("sst-{i:03}").as_bytes(), b"old")
            .unwrap();
    }
    engine.flush().unwrap();

    // Overwrite a few in the memtable and add fresh ones.
    engine.put(b"sst-010", b"new").unwrap();
    engine.put(b"zzz", b"tail").unwrap();

    let got: Vec<(Vec<u8>, Vec<u8>)> = engine
        .range(None, None, None)
        .unwrap()
        .map(|(k, v, _, _)| (k, v))
        .collect();
    assert_eq!(got.len(), 51);
    assert!(got.windows(2).all(|w| w[0].0 < w[1].0), "keys must ascend");

    let overwritten = got.iter().find(|(k, _)| k == b"sst-010").unwrap();
    assert_eq!(overwritten.1, b"new");

    engine.close().unwrap();
}

#[test]
fn test_empty_key_is_legal() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    engine.put(b"", b"empty-key-value").unwrap();
    assert_eq!(engine.get(b"").unwrap(), Some(b"empty-key-value".to_vec()));
    engine.close().unwrap();
}

#[test]
fn test_invalid_arguments_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    let long_key = vec![0u8; 70_000];
    assert!(matches!(
        engine.put(&long_key, b"v"),
        Err(EngineError::InvalidArgument(_))
    ));

    // A record must fit one 32 KiB block.
    let huge_value = vec![0u8; 40_000];
    assert!(matches!(
        engine.put(b"k", &huge_value),
        Err(EngineError::InvalidArgument(_))
    ));

    // Nothing leaked into the store.
    assert_eq!(engine.get(b"k").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn test_bad_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let bad = EngineConfig {
        k: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::open(tmp.path(), bad),
        Err(EngineError::InvalidArgument(_))
    ));

    let mismatched = EngineConfig {
        m: 1,
        parity_kind: Some(crate::parity::ParityKind::DualXor),
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::open(tmp.path(), mismatched),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_parallel_readers() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open(tmp.path(), test_config()).unwrap());

    for i in 0..200u64 {
        engine
            .put(format!("key-{i:04}").as_bytes(), &i.to_le_bytes())
            .unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let key = format!("key-{i:04}");
                    assert_eq!(
                        engine.get(key.as_bytes()).unwrap(),
                        Some(i.to_le_bytes().to_vec())
                    );
                }
            })
        })
        .collect();
    for handle in readers {
        handle.join().unwrap();
    }

    engine.close().unwrap();
}

#[test]
fn test_seal_spills_to_l0() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        flush_threshold_bytes: 2 * 1024,
        memtable_shards: 1,
        ..test_config()
    };
    let engine = Engine::open(tmp.path(), config).unwrap();

    for i in 0..200 {
        engine
            .put(format!("key-{i:04}").as_bytes(), &[0u8; 64])
            .unwrap();
    }

    let stats = engine.stats().unwrap();
    assert!(
        stats.tables_per_level.iter().sum::<usize>() > 0,
        "threshold seals must have produced SSTables"
    );

    // Spilled keys still resolve.
    for i in 0..200 {
        let key = format!("key-{i:04}");
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(vec![0u8; 64]),
            "lost {key} after seal"
        );
    }

    engine.close().unwrap();
}
