use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use crate::block::Record;
use crate::sstable::{SST_FOOTER_SIZE, SstError, SstReader, SstWriter};

fn build_table(tmp: &TempDir) -> std::path::PathBuf {
    let path = tmp.path().join("t.sst");
    let mut writer = SstWriter::create(&path, 100, 0.01).unwrap();
    for i in 0..100 {
        writer
            .add(&Record::put(
                format!("key-{i:04}").into_bytes(),
                vec![i as u8; 200],
                i as u64 + 1,
            ))
            .unwrap();
    }
    writer.finish().unwrap();
    path
}

fn patch(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn test_bad_magic_is_format_unsupported() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(&tmp);
    let len = fs::metadata(&path).unwrap().len();

    patch(&path, len - SST_FOOTER_SIZE as u64, b"XXXX");
    assert!(matches!(
        SstReader::open(&path),
        Err(SstError::FormatUnsupported { .. })
    ));
}

#[test]
fn test_future_version_is_format_unsupported() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(&tmp);
    let len = fs::metadata(&path).unwrap().len();

    patch(&path, len - SST_FOOTER_SIZE as u64 + 4, &[99]);
    assert!(matches!(
        SstReader::open(&path),
        Err(SstError::FormatUnsupported { magic: _, version: 99 })
    ));
}

#[test]
fn test_payload_bitflip_fails_open() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(&tmp);

    // Damage a data byte in the first block; the full-file CRC catches it.
    patch(&path, 100, &[0xFF]);
    assert!(matches!(
        SstReader::open(&path),
        Err(SstError::Corrupted(_))
    ));
}

#[test]
fn test_truncated_file_fails_open() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(&tmp);
    let len = fs::metadata(&path).unwrap().len();

    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(len - 10).unwrap();
    f.sync_all().unwrap();

    assert!(SstReader::open(&path).is_err());

    // Below footer size entirely.
    f.set_len(8).unwrap();
    f.sync_all().unwrap();
    assert!(matches!(
        SstReader::open(&path),
        Err(SstError::Corrupted(_))
    ));
}

#[test]
fn test_intact_table_still_opens() {
    let tmp = TempDir::new().unwrap();
    let path = build_table(&tmp);
    let reader = SstReader::open(&path).unwrap();
    assert_eq!(reader.entries(), 100);
}
