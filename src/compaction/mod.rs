//! Compaction Module
//!
//! Leveled compaction over the SSTable tree:
//!
//! - **Trigger** — after every flush or compaction, any level holding
//!   more than `max_per_level[L]` tables is eligible.
//! - **Selection** — L0 compactions take *all* L0 tables (they may
//!   overlap) plus every L1 table their combined key range touches;
//!   deeper levels contribute their oldest table plus the overlapping
//!   tables one level down.
//! - **Merge** — a k-way merge keeps the newest record per key. A
//!   tombstone reaching the bottom level is dropped entirely once its
//!   source table has outlived the tombstone TTL; live data always
//!   survives.
//! - **Swap** — outputs are written and registered (`SstSeal`, then
//!   `CompactionEnd`), the level lists are swapped under a short write
//!   lock, and only then are the input files deleted (`SstDelete` each).
//!
//! The compactor runs on its own thread and talks to the engine through a
//! crossbeam channel: the engine nudges it with [`CompactorMsg::Maybe`]
//! after flushes and tells it to stop with [`CompactorMsg::Shutdown`].
//! The merge phase holds no engine lock — input tables are `Arc` handles
//! snapshotted under a read lock — so foreground reads and writes only
//! wait during the final swap.
//!
//! Crash safety: if the process dies between sealing the outputs and
//! deleting the inputs, replay sees both as live. Reads stay correct
//! (newest-wins over the duplicate versions) and the next compaction of
//! the level clears the duplication.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::block::Record;
use crate::engine::utils::{
    Levels, MergeIterator, OwnedTableIter, SharedLevels, TableHandle, next_sst_nanos,
    sst_abs_path, sst_rel_path,
};
use crate::manifest::{Manifest, ManifestError, ManifestEvent, ManifestSstEntry};
use crate::sstable::{SstError, SstReader, SstWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSTable read or write failure.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// Manifest append failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Compaction tuning, derived from the engine config.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Per-level table-count triggers; the last index is the bottom level.
    pub max_per_level: Vec<usize>,

    /// Target output file size at level 1; deeper levels scale ×10 each.
    pub target_file_bytes: u64,

    /// Tombstones older than this are garbage-collected at the bottom
    /// level.
    pub tombstone_ttl: Duration,

    /// Bloom filter target false-positive rate for output tables.
    pub bloom_fp_rate: f64,
}

impl CompactionConfig {
    /// Bottom (deepest) level index.
    pub fn bottom_level(&self) -> usize {
        self.max_per_level.len().saturating_sub(1)
    }

    fn target_bytes_for(&self, level: usize) -> u64 {
        let scale = 10u64.saturating_pow(level.saturating_sub(1) as u32);
        self.target_file_bytes.saturating_mul(scale)
    }
}

// ------------------------------------------------------------------------------------------------
// Compactor thread
// ------------------------------------------------------------------------------------------------

/// Messages the engine sends the compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorMsg {
    /// Check triggers and compact until the tree is within bounds.
    Maybe,

    /// Finish the current merge (if any) and exit.
    Shutdown,
}

/// Handle to the background compactor.
pub struct CompactorHandle {
    tx: Sender<CompactorMsg>,
    join: Option<thread::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Nudges the compactor; cheap and non-blocking.
    pub fn trigger(&self) {
        let _ = self.tx.send(CompactorMsg::Maybe);
    }

    /// Stops the compactor at the next merge boundary and joins it.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(CompactorMsg::Shutdown);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the compactor thread.
pub fn spawn(
    base_dir: PathBuf,
    levels: SharedLevels,
    manifest: Arc<Mutex<Manifest>>,
    config: CompactionConfig,
) -> CompactorHandle {
    let (tx, rx) = unbounded();
    let join = thread::Builder::new()
        .name("akkara-compact".into())
        .spawn(move || run_loop(&rx, &base_dir, &levels, &manifest, &config))
        .ok();
    CompactorHandle { tx, join }
}

fn run_loop(
    rx: &Receiver<CompactorMsg>,
    base_dir: &Path,
    levels: &SharedLevels,
    manifest: &Arc<Mutex<Manifest>>,
    config: &CompactionConfig,
) {
    'outer: while let Ok(msg) = rx.recv() {
        match msg {
            CompactorMsg::Shutdown => break,
            CompactorMsg::Maybe => loop {
                // Drain nudges queued while we were merging; a shutdown
                // queued behind them wins.
                loop {
                    match rx.try_recv() {
                        Ok(CompactorMsg::Maybe) => {}
                        Ok(CompactorMsg::Shutdown) => break 'outer,
                        Err(_) => break,
                    }
                }

                match compact_once(base_dir, levels, manifest, config) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = %e, "compaction failed; leaving tree as-is");
                        break;
                    }
                }
            },
        }
    }
    debug!("compactor stopped");
}

// ------------------------------------------------------------------------------------------------
// One compaction round
// ------------------------------------------------------------------------------------------------

/// Compacts the lowest over-full level, if any. Returns whether work was
/// done.
pub fn compact_once(
    base_dir: &Path,
    levels: &SharedLevels,
    manifest: &Arc<Mutex<Manifest>>,
    config: &CompactionConfig,
) -> Result<bool, CompactionError> {
    // Snapshot phase: pick inputs under a short read lock.
    let picked = {
        let guard = levels
            .read()
            .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;
        pick_inputs(&guard, config)
    };
    let Some(job) = picked else {
        return Ok(false);
    };

    let level = job.level;
    let input_files: Vec<String> = job.inputs.iter().map(|t| t.file.clone()).collect();
    info!(
        level,
        inputs = input_files.len(),
        "compaction started"
    );

    {
        let mut m = manifest
            .lock()
            .map_err(|_| CompactionError::Internal("manifest lock poisoned".into()))?;
        m.append(ManifestEvent::CompactionStart {
            level,
            inputs: input_files.clone(),
        })?;
    }

    // Merge phase: no engine locks held.
    let out_level = level + 1;
    let outputs = merge_tables(
        base_dir,
        &job.inputs,
        out_level,
        out_level as usize == config.bottom_level(),
        config,
    )?;

    // Swap phase: register outputs, splice level lists, mark inputs dead.
    let output_handles: Vec<Arc<TableHandle>> = outputs
        .iter()
        .map(|(rel, _meta)| -> Result<_, CompactionError> {
            let reader = SstReader::open(sst_abs_path(base_dir, rel))?;
            Ok(Arc::new(TableHandle {
                file: rel.clone(),
                level: out_level,
                created_nanos: crate::engine::utils::sst_created_nanos(rel),
                reader,
            }))
        })
        .collect::<Result<_, _>>()?;

    {
        let mut guard = levels
            .write()
            .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;
        let mut m = manifest
            .lock()
            .map_err(|_| CompactionError::Internal("manifest lock poisoned".into()))?;

        for (rel, meta) in &outputs {
            m.append(ManifestEvent::SstSeal {
                entry: ManifestSstEntry {
                    level: out_level,
                    file: rel.clone(),
                    entries: meta.entries,
                    first_key: meta.first_key.clone(),
                    last_key: meta.last_key.clone(),
                },
            })?;
        }
        m.append(ManifestEvent::CompactionEnd {
            level,
            outputs: outputs.iter().map(|(rel, _)| rel.clone()).collect(),
            inputs: input_files.clone(),
        })?;

        let dead: Vec<&str> = input_files.iter().map(String::as_str).collect();
        for tables in guard.iter_mut() {
            tables.retain(|t| !dead.contains(&t.file.as_str()));
        }
        let out_list = &mut guard[out_level as usize];
        out_list.extend(output_handles);
        out_list.sort_by(|a, b| a.reader.min_key().cmp(b.reader.min_key()));
    }

    // Inputs are unreachable now; delete the files and record it.
    {
        let mut m = manifest
            .lock()
            .map_err(|_| CompactionError::Internal("manifest lock poisoned".into()))?;
        for rel in &input_files {
            let path = sst_abs_path(base_dir, rel);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete compacted input");
            }
            m.append(ManifestEvent::SstDelete { file: rel.clone() })?;
        }
    }

    info!(
        level,
        outputs = outputs.len(),
        "compaction finished"
    );
    Ok(true)
}

// ------------------------------------------------------------------------------------------------
// Selection
// ------------------------------------------------------------------------------------------------

struct CompactionJob {
    level: u16,
    /// Tables at `level` plus the overlapping tables at `level + 1`.
    inputs: Vec<Arc<TableHandle>>,
}

/// Finds the lowest over-full level and gathers its input set.
fn pick_inputs(levels: &Levels, config: &CompactionConfig) -> Option<CompactionJob> {
    // The bottom level has nowhere to push into.
    for level in 0..config.bottom_level() {
        let tables = &levels[level];
        if tables.len() <= config.max_per_level[level] {
            continue;
        }

        let upper: Vec<Arc<TableHandle>> = if level == 0 {
            tables.clone()
        } else {
            // Oldest table first keeps the pick deterministic and cycles
            // through the level over successive rounds.
            let oldest = tables.iter().min_by_key(|t| t.created_nanos)?;
            vec![Arc::clone(oldest)]
        };

        let min_key = upper.iter().map(|t| t.reader.min_key()).min()?.to_vec();
        let max_key = upper.iter().map(|t| t.reader.max_key()).max()?.to_vec();

        let lower: Vec<Arc<TableHandle>> = levels[level + 1]
            .iter()
            .filter(|t| {
                t.reader.min_key() <= max_key.as_slice() && t.reader.max_key() >= min_key.as_slice()
            })
            .cloned()
            .collect();

        let mut inputs = upper;
        inputs.extend(lower);
        return Some(CompactionJob {
            level: level as u16,
            inputs,
        });
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Merge
// ------------------------------------------------------------------------------------------------

/// K-way merges `inputs` into one or more tables at `out_level`, splitting
/// at the level's target file size.
fn merge_tables(
    base_dir: &Path,
    inputs: &[Arc<TableHandle>],
    out_level: u16,
    is_bottom: bool,
    config: &CompactionConfig,
) -> Result<Vec<(String, crate::sstable::SstMeta)>, CompactionError> {
    let out_dir = base_dir.join(format!("sst/L{out_level}"));
    fs::create_dir_all(&out_dir)?;

    let total_entries: u64 = inputs.iter().map(|t| t.reader.entries()).sum();
    let target_bytes = config.target_bytes_for(out_level as usize);

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let ttl_nanos = config.tombstone_ttl.as_nanos() as u64;

    let sources: Vec<Box<dyn Iterator<Item = Result<Record, SstError>> + Send>> = inputs
        .iter()
        .map(|t| Box::new(OwnedTableIter::new(Arc::clone(t))) as _)
        .collect();
    let mut merged = MergeIterator::new(sources);

    let mut outputs = Vec::new();
    let mut writer: Option<SstWriter> = None;
    let mut current_rel = String::new();
    let mut dropped_tombstones = 0u64;

    while let Some(item) = merged.next() {
        let (src, record) = item?;

        // Bottom-level tombstone GC: the deletion has reached the deepest
        // level and aged out, so nothing below can resurrect the key.
        if record.is_tombstone()
            && is_bottom
            && now_nanos.saturating_sub(inputs[src].created_nanos) > ttl_nanos
        {
            dropped_tombstones += 1;
            continue;
        }

        if writer.is_none() {
            let rel = sst_rel_path(out_level, next_sst_nanos());
            let abs = sst_abs_path(base_dir, &rel);
            current_rel = rel;
            writer = Some(SstWriter::create(
                abs,
                total_entries as usize,
                config.bloom_fp_rate,
            )?);
        }
        let Some(w) = writer.as_mut() else {
            return Err(CompactionError::Internal("output writer missing".into()));
        };
        w.add(&record)?;
        let split = w.data_bytes() >= target_bytes;

        if split
            && let Some(finished) = writer.take()
        {
            outputs.push((std::mem::take(&mut current_rel), finished.finish()?));
        }
    }

    if let Some(w) = writer
        && w.entries() > 0
    {
        outputs.push((current_rel, w.finish()?));
    }

    if dropped_tombstones > 0 {
        debug!(dropped_tombstones, "tombstones garbage-collected");
    }
    Ok(outputs)
}
