use crate::block::Record;
use crate::memtable::Memtable;

#[test]
fn test_threshold_reports_full_shard() {
    // Tiny threshold: the very first record crosses it.
    let mt = Memtable::new(16, 1);
    let full = mt
        .apply(Record::put(b"key".to_vec(), vec![0u8; 64], 1))
        .unwrap();
    assert_eq!(full, Some(0));
}

#[test]
fn test_seal_shard_swaps_in_empty_map() {
    let mt = Memtable::new(64, 1);
    let mut full_shard = None;
    for i in 0..10u64 {
        let key = format!("k{i}");
        if let Some(idx) = mt
            .apply(Record::put(key.into_bytes(), vec![1u8; 16], i + 1))
            .unwrap()
        {
            full_shard = Some(idx);
        }
    }
    let idx = full_shard.expect("threshold must have been crossed");

    let sealed = mt.seal_shard(idx).unwrap();
    assert_eq!(sealed.len(), 10);

    // Sorted by key.
    for pair in sealed.windows(2) {
        assert!(pair[0].key < pair[1].key);
    }

    // The shard is fresh again and writable.
    assert!(mt.is_empty());
    assert_eq!(mt.approximate_bytes(), 0);
    mt.apply(Record::put(b"after".to_vec(), b"seal".to_vec(), 100))
        .unwrap();
    assert_eq!(mt.get(b"after").unwrap().unwrap().value, b"seal");

    // Sealed records are gone from the live map.
    assert!(mt.get(b"k0").unwrap().is_none());
}

#[test]
fn test_seal_all_merges_shards_sorted() {
    let mt = Memtable::new(1 << 20, 8);
    let keys = ["zulu", "alpha", "mike", "bravo", "yankee", "charlie"];
    for (i, key) in keys.iter().enumerate() {
        mt.apply(Record::put(
            key.as_bytes().to_vec(),
            vec![i as u8],
            i as u64 + 1,
        ))
        .unwrap();
    }

    let sealed = mt.seal_all().unwrap();
    assert_eq!(sealed.len(), keys.len());
    for pair in sealed.windows(2) {
        assert!(pair[0].key < pair[1].key, "seal_all must be globally sorted");
    }
    assert!(mt.is_empty());
}

#[test]
fn test_sealed_stream_keeps_tombstones() {
    let mt = Memtable::new(1 << 20, 2);
    mt.apply(Record::put(b"a".to_vec(), b"1".to_vec(), 1)).unwrap();
    mt.apply(Record::tombstone(b"a".to_vec(), 2)).unwrap();
    mt.apply(Record::tombstone(b"never-existed".to_vec(), 3))
        .unwrap();

    let sealed = mt.seal_all().unwrap();
    assert_eq!(sealed.len(), 2);
    assert!(sealed.iter().all(|r| r.is_tombstone()));
    // The live put was superseded in place; only the latest version ships.
    let a = sealed.iter().find(|r| r.key == b"a").unwrap();
    assert_eq!(a.seq, 2);
}

#[test]
fn test_byte_accounting_shrinks_on_overwrite() {
    let mt = Memtable::new(1 << 20, 1);
    mt.apply(Record::put(b"k".to_vec(), vec![0u8; 1000], 1))
        .unwrap();
    let big = mt.approximate_bytes();

    mt.apply(Record::put(b"k".to_vec(), vec![0u8; 10], 2)).unwrap();
    let small = mt.approximate_bytes();
    assert!(small < big, "overwrite with a smaller value must shrink accounting");
}
