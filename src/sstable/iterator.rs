//! SSTable iteration.
//!
//! [`SstIter`] walks a table block by block in key order, yielding owned
//! records. One block is decoded at a time; memory stays bounded by the
//! block size regardless of table size.

use tracing::warn;

use crate::block::Record;
use crate::sstable::{SstError, SstReader};

/// Ordered iterator over a table's records.
///
/// Damage discovered mid-iteration (a block that no longer verifies) is
/// surfaced as an `Err` item once; iteration stops afterwards.
pub struct SstIter<'a> {
    reader: &'a SstReader,
    next_block: usize,
    current: std::vec::IntoIter<Record>,

    /// Skip records below this bound (seek support).
    start: Option<Vec<u8>>,

    failed: bool,
}

impl<'a> SstIter<'a> {
    pub(crate) fn new(reader: &'a SstReader, first_block: usize, start: Option<Vec<u8>>) -> Self {
        Self {
            reader,
            next_block: first_block,
            current: Vec::new().into_iter(),
            start,
            failed: false,
        }
    }

    fn load_next_block(&mut self) -> Result<bool, SstError> {
        if self.next_block >= self.reader.block_count() {
            return Ok(false);
        }
        let mut records = Vec::new();
        for view in self.reader.block_views(self.next_block)? {
            let view = view?;
            if let Some(start) = &self.start
                && view.key < start.as_slice()
            {
                continue;
            }
            records.push(view.to_record());
        }
        self.next_block += 1;
        self.current = records.into_iter();
        Ok(true)
    }
}

impl Iterator for SstIter<'_> {
    type Item = Result<Record, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    warn!(error = %e, "SSTable iteration aborted");
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
