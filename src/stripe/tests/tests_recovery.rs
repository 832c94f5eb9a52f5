use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::block::{BLOCK_SIZE, BlockPacker, key_fp64, mini_key};
use crate::parity::ParityKind;
use crate::stripe::{self, StripeConfig, StripeError, StripeReader, StripeWriter};

fn config(k: usize, m: usize) -> StripeConfig {
    StripeConfig {
        k,
        m,
        kind: ParityKind::for_m(m),
        group_n: 1,
        group_micros: u64::MAX / 2,
        fast_mode: false,
    }
}

fn fill_block(tag: u8) -> Vec<u8> {
    let mut packer = BlockPacker::new();
    let key = vec![tag; 16];
    let value = vec![tag; 4096];
    assert!(packer.append(&key, &value, u64::from(tag) + 1, 0, key_fp64(&key), mini_key(&key)));
    packer.seal()
}

/// Writes `stripes` full stripes and returns the committed count.
fn populate(dir: &std::path::Path, k: usize, m: usize, stripes: u64) -> u64 {
    let (mut writer, _) = StripeWriter::open(dir, config(k, m), 0).unwrap();
    for s in 0..stripes {
        for lane in 0..k {
            writer.append_block(fill_block((s * k as u64 + lane as u64) as u8)).unwrap();
        }
    }
    writer.flush().unwrap();
    let committed = writer.committed_stripes();
    writer.close().unwrap();
    committed
}

#[test]
fn test_lane_lengths_aligned_after_open() {
    let tmp = TempDir::new().unwrap();
    let committed = populate(tmp.path(), 4, 2, 10);
    assert_eq!(committed, 10);

    // Leave a torn suffix on one lane: half a block extra.
    let data1 = tmp.path().join("data_1");
    let mut f = OpenOptions::new().append(true).open(&data1).unwrap();
    f.write_all(&vec![0xEEu8; BLOCK_SIZE / 2]).unwrap();
    drop(f);

    let (writer, report) = StripeWriter::open(tmp.path(), config(4, 2), committed).unwrap();
    assert_eq!(report.committed, 10);
    assert_eq!(report.trimmed_bytes, (BLOCK_SIZE / 2) as u64);
    drop(writer);

    // Every lane is an equal multiple of 32 KiB.
    for name in ["data_0", "data_1", "data_2", "data_3", "parity_0", "parity_1"] {
        let len = fs::metadata(tmp.path().join(name)).unwrap().len();
        assert_eq!(len, 10 * BLOCK_SIZE as u64, "lane {name} misaligned");
    }
}

#[test]
fn test_uncommitted_tail_discarded_to_manifest_value() {
    let tmp = TempDir::new().unwrap();
    populate(tmp.path(), 2, 1, 5);

    // The manifest only vouches for 3 stripes.
    let (writer, report) = StripeWriter::open(tmp.path(), config(2, 1), 3).unwrap();
    assert_eq!(report.committed, 3);
    assert!(report.trimmed_bytes > 0);
    drop(writer);

    for name in ["data_0", "data_1", "parity_0"] {
        let len = fs::metadata(tmp.path().join(name)).unwrap().len();
        assert_eq!(len, 3 * BLOCK_SIZE as u64);
    }
}

#[test]
fn test_zeroed_lanes_reconstructed_on_read() {
    let tmp = TempDir::new().unwrap();
    let committed = populate(tmp.path(), 4, 2, 10);

    // Pristine copy of every data lane for comparison.
    let pristine: Vec<Vec<u8>> = (0..4)
        .map(|i| fs::read(tmp.path().join(format!("data_{i}"))).unwrap())
        .collect();

    // Zero lanes 1 and 3 in place (lengths preserved).
    for lane in [1usize, 3] {
        let path = tmp.path().join(format!("data_{lane}"));
        let len = fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&vec![0u8; len as usize]).unwrap();
        f.sync_all().unwrap();
    }

    // Alignment is intact, so recovery trims nothing.
    let report = stripe::recover_lanes(tmp.path(), 4, 2, committed).unwrap();
    assert_eq!(report.trimmed_bytes, 0);
    assert_eq!(report.committed, 10);

    let reader = StripeReader::open(tmp.path(), 4, 2, ParityKind::DualXor, committed).unwrap();
    for s in 0..committed {
        let blocks = reader.read_stripe(s).unwrap();
        for (lane, blk) in blocks.iter().enumerate() {
            let offset = (s as usize) * BLOCK_SIZE;
            assert_eq!(
                blk,
                &pristine[lane][offset..offset + BLOCK_SIZE],
                "stripe {s} lane {lane} not restored byte-for-byte"
            );
        }
    }
}

#[test]
fn test_damage_beyond_parity_budget_fails() {
    let tmp = TempDir::new().unwrap();
    let committed = populate(tmp.path(), 4, 1, 2);

    for lane in [0usize, 2] {
        let path = tmp.path().join(format!("data_{lane}"));
        let len = fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(&vec![0u8; len as usize]).unwrap();
        f.sync_all().unwrap();
    }

    let reader = StripeReader::open(tmp.path(), 4, 1, ParityKind::Xor, committed).unwrap();
    assert!(matches!(
        reader.read_stripe(0),
        Err(StripeError::Unrecoverable { .. })
    ));
}

#[test]
fn test_fresh_directory_recovers_to_zero() {
    let tmp = TempDir::new().unwrap();
    let report = stripe::recover_lanes(tmp.path(), 4, 2, 0).unwrap();
    assert_eq!(report.committed, 0);
    assert_eq!(report.trimmed_bytes, 0);
}
