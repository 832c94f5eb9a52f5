//! SSTable builder.
//!
//! Consumes a strictly ascending record stream and writes the `AKSS`
//! layout: packed 32 KiB data blocks, the fixed-width outer index, the
//! bloom filter, and the checksummed footer. The file and its parent
//! directory are fsynced before the builder reports success, so a table
//! handed to the manifest is durable.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::block::{BlockPacker, Record, key_fp64, mini_key};
use crate::sstable::{BloomFilter, Footer, SST_KEY_PREFIX_LEN, SstError, key_prefix32};

/// Description of a finished table, consumed by the manifest and engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstMeta {
    /// Path the table was written to.
    pub path: PathBuf,

    /// Number of records.
    pub entries: u64,

    /// Smallest key (empty for an empty table).
    pub first_key: Vec<u8>,

    /// Largest key.
    pub last_key: Vec<u8>,

    /// Total file size in bytes.
    pub file_size: u64,
}

/// Streaming writer for one table.
pub struct SstWriter {
    out: BufWriter<File>,
    path: PathBuf,

    packer: BlockPacker,
    bloom: BloomFilter,

    /// `[firstKey32][blockOffset]` pairs, one per sealed block.
    index: Vec<([u8; SST_KEY_PREFIX_LEN], u64)>,

    /// First key of the block currently being packed.
    block_first_key: Option<Vec<u8>>,

    /// Running CRC32C over every byte written so far.
    crc: u32,

    offset: u64,
    entries: u64,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

impl SstWriter {
    /// Creates the output file and sizes the bloom filter.
    ///
    /// `expected_entries` may overestimate (compactions pass the input
    /// total); the filter only gets more selective.
    pub fn create(
        path: impl AsRef<Path>,
        expected_entries: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;

        debug!(path = %path.display(), expected_entries, "SSTable builder started");

        Ok(Self {
            out: BufWriter::new(file),
            path,
            packer: BlockPacker::new(),
            bloom: BloomFilter::new(expected_entries, bloom_fp_rate),
            index: Vec::new(),
            block_first_key: None,
            crc: 0,
            offset: 0,
            entries: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
        })
    }

    /// Appends one record. Input must be strictly ascending by key.
    pub fn add(&mut self, record: &Record) -> Result<(), SstError> {
        if self.entries > 0 && record.key.as_slice() <= self.last_key.as_slice() {
            return Err(SstError::UnsortedInput(format!(
                "key at entry {} does not ascend",
                self.entries
            )));
        }

        let fp = key_fp64(&record.key);
        let mini = mini_key(&record.key);

        if !self
            .packer
            .append(&record.key, &record.value, record.seq, record.flags, fp, mini)
        {
            self.seal_block()?;
            if !self
                .packer
                .append(&record.key, &record.value, record.seq, record.flags, fp, mini)
            {
                return Err(SstError::Block(crate::block::BlockError::RecordTooLarge(
                    record.encoded_len(),
                )));
            }
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(record.key.clone());
        }
        if self.entries == 0 {
            self.first_key = record.key.clone();
        }
        self.last_key = record.key.clone();
        self.bloom.insert(&record.key);
        self.entries += 1;
        Ok(())
    }

    /// Bytes of data blocks written so far (used by compaction to split
    /// outputs at the target file size).
    pub fn data_bytes(&self) -> u64 {
        self.offset
    }

    /// Records added so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Seals the final block, writes index, bloom, and footer, then
    /// fsyncs the file and its parent directory.
    pub fn finish(mut self) -> Result<SstMeta, SstError> {
        if !self.packer.is_empty() {
            self.seal_block()?;
        }

        let index_off = self.offset;
        let index = std::mem::take(&mut self.index);
        for (prefix, off) in &index {
            self.write_all(prefix)?;
            self.write_all(&off.to_le_bytes())?;
        }

        let bloom_off = self.offset;
        let bloom_bytes = self.bloom.as_bytes().to_vec();
        self.write_all(&bloom_bytes)?;

        let footer = Footer {
            index_off,
            bloom_off,
            entries: u32::try_from(self.entries)
                .map_err(|_| SstError::Corrupted("entry count exceeds u32".into()))?,
        };
        // The checksum covers the footer's own leading 28 bytes too.
        let encoded = footer.encode(0);
        self.crc = crc32c::crc32c_append(self.crc, &encoded[..28]);
        let encoded = footer.encode(self.crc);
        self.out.write_all(&encoded)?;
        self.offset += encoded.len() as u64;

        self.out.flush()?;
        self.out.get_ref().sync_all()?;

        // Make the new directory entry durable as well.
        if let Some(parent) = self.path.parent()
            && let Ok(dir) = File::open(parent)
        {
            dir.sync_all()?;
        }

        info!(
            path = %self.path.display(),
            entries = self.entries,
            blocks = index.len(),
            bytes = self.offset,
            "SSTable sealed"
        );

        Ok(SstMeta {
            path: self.path,
            entries: self.entries,
            first_key: self.first_key,
            last_key: self.last_key,
            file_size: self.offset,
        })
    }

    fn seal_block(&mut self) -> Result<(), SstError> {
        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| SstError::Corrupted("sealing an empty block".into()))?;
        let blk = self.packer.seal();
        self.index.push((key_prefix32(&first_key), self.offset));
        self.write_all(&blk)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), SstError> {
        self.out.write_all(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, buf);
        self.offset += buf.len() as u64;
        Ok(())
    }
}
