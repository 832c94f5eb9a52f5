//! Write-Ahead Logging (WAL) Module
//!
//! A durable, append-only log of record payloads that secures every
//! mutation before it is acknowledged, independently of the SST and
//! stripe fsync cadence.
//!
//! # On-disk layout
//!
//! A directory of rotating segments:
//!
//! ```text
//! wal/
//!   wal-000000.log
//!   wal-000001.log
//!   ...
//! ```
//!
//! Each segment is a sequence of frames:
//!
//! ```text
//! [length u32 LE][payload = AKHdr32 ∥ key ∥ value][crc32c u32 LE]
//! ```
//!
//! The CRC32C covers the payload only. Legacy stores that kept a single
//! file at `<base>/wal` are upgraded on open: the file becomes segment 0
//! of the directory layout.
//!
//! # Group commit
//!
//! Appenders enqueue encoded frames; a dedicated flusher thread drains
//! the queue once it holds `group_n` frames or `group_micros` has passed
//! since the last flush, writes the batch, and issues one durability
//! barrier for all of it (`fdatasync` in fast mode, `fsync` in durable
//! mode). A durable append blocks until its frame is covered by a
//! barrier; a fast append returns on enqueue and accepts the loss of a
//! bounded suffix on crash.
//!
//! # Replay
//!
//! Segments are read in order. Replay stops — without error — at the
//! first frame whose length overruns the segment or whose CRC fails:
//! that boundary defines the recovered prefix, and everything beyond it
//! (including later segments) is discarded. A torn tail on the live
//! segment is truncated before new appends so fresh frames never land
//! after garbage.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::block::{self, Record};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The flusher thread hit an I/O error; appends fail until reopen.
    #[error("WAL flusher failed: {0}")]
    FlusherFailed(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration & replay result
// ------------------------------------------------------------------------------------------------

/// WAL tuning knobs, supplied by the engine.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Flush once this many frames are pending.
    pub group_n: usize,

    /// Flush once this many microseconds have passed since the last flush.
    pub group_micros: u64,

    /// `true` → fdatasync-class barrier; `false` → full fsync.
    pub fast_mode: bool,

    /// Rotate segments once they exceed this size.
    pub segment_max_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            group_n: 32,
            group_micros: 500,
            fast_mode: false,
            segment_max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Outcome of replaying the WAL directory on open.
#[derive(Debug)]
pub struct WalReplay {
    /// All records recovered, in append order.
    pub records: Vec<Record>,

    /// Highest sequence number seen (0 when empty).
    pub max_seq: u64,

    /// Whether a torn or corrupt tail was discarded. Informational, not
    /// an error: it defines the recovered prefix.
    pub truncated: bool,
}

/// A rotated-out segment retained until checkpointing prunes it.
#[derive(Debug, Clone)]
struct SealedSegment {
    seg: u64,
    path: PathBuf,
    max_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

fn segment_path(dir: &Path, seg: u64) -> PathBuf {
    dir.join(format!("wal-{seg:06}.log"))
}

fn parse_segment(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

// ------------------------------------------------------------------------------------------------
// Shared state between appenders and the flusher
// ------------------------------------------------------------------------------------------------

struct WalState {
    /// Frames encoded and waiting for the next flush batch.
    queue: Vec<Vec<u8>>,

    /// Ticket of the most recently enqueued frame.
    enqueued: u64,

    /// Ticket of the most recently durable frame.
    flushed: u64,

    /// Current live segment.
    file: File,
    seg: u64,
    seg_bytes: u64,

    /// Highest record seq written to the live segment.
    seg_max_seq: u64,

    /// Rotated-out segments eligible for pruning after a checkpoint.
    sealed: Vec<SealedSegment>,

    /// Set once the flusher dies on an I/O error.
    failed: Option<String>,

    shutdown: bool,
}

struct WalShared {
    state: Mutex<WalState>,

    /// Wakes the flusher when frames arrive or shutdown is requested.
    work_cv: Condvar,

    /// Wakes durable appenders when their ticket becomes durable.
    done_cv: Condvar,
}

// ------------------------------------------------------------------------------------------------
// WAL core
// ------------------------------------------------------------------------------------------------

/// Group-committed, segment-rotating write-ahead log.
pub struct Wal {
    shared: Arc<WalShared>,
    dir: PathBuf,
    config: WalConfig,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens the WAL directory, replays it, truncates any torn tail, and
    /// starts the flusher.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> Result<(Self, WalReplay), WalError> {
        let dir = dir.as_ref().to_path_buf();

        // Legacy layout: a single WAL *file* where the directory belongs.
        if dir.is_file() {
            let tmp = dir.with_extension("legacy");
            fs::rename(&dir, &tmp)?;
            fs::create_dir_all(&dir)?;
            fs::rename(&tmp, segment_path(&dir, 0))?;
            info!(dir = %dir.display(), "migrated legacy single-file WAL to segment 0");
        }
        fs::create_dir_all(&dir)?;

        let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                parse_segment(&path).map(|seg| (seg, path))
            })
            .collect();
        segments.sort_by_key(|(seg, _)| *seg);

        let (replay, sealed, live) = replay_segments(&segments)?;

        let (live_seg, live_path) = match live {
            Some((seg, path, valid_len)) => {
                // Drop the torn tail so new frames append after valid data.
                let file = OpenOptions::new().write(true).open(&path)?;
                if file.metadata()?.len() > valid_len {
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
                (seg, path)
            }
            None => (0, segment_path(&dir, 0)),
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&live_path)?;
        let seg_bytes = file.metadata()?.len();

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            records = replay.records.len(),
            max_seq = replay.max_seq,
            truncated = replay.truncated,
            "WAL opened"
        );

        let shared = Arc::new(WalShared {
            state: Mutex::new(WalState {
                queue: Vec::new(),
                enqueued: 0,
                flushed: 0,
                file,
                seg: live_seg,
                seg_bytes,
                seg_max_seq: replay.max_seq,
                sealed,
                failed: None,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            let config = config.clone();
            thread::Builder::new()
                .name("akkara-wal-flush".into())
                .spawn(move || flusher_loop(&shared, &config))
                .map_err(WalError::Io)?
        };

        Ok((
            Self {
                shared,
                dir,
                config,
                flusher: Mutex::new(Some(flusher)),
            },
            replay,
        ))
    }

    /// Appends one record frame.
    ///
    /// `durable = true` blocks until the group-commit flusher has made the
    /// frame durable; `durable = false` returns as soon as the frame is
    /// enqueued.
    pub fn append(&self, seq: u64, payload: &[u8], durable: bool) -> Result<(), WalError> {
        let mut frame = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());

        let ticket;
        {
            let mut state = self.lock_state()?;
            if let Some(msg) = &state.failed {
                return Err(WalError::FlusherFailed(msg.clone()));
            }
            state.queue.push(frame);
            state.enqueued += 1;
            state.seg_max_seq = state.seg_max_seq.max(seq);
            ticket = state.enqueued;
            self.shared.work_cv.notify_one();

            if durable {
                while state.flushed < ticket {
                    if let Some(msg) = &state.failed {
                        return Err(WalError::FlusherFailed(msg.clone()));
                    }
                    state = self
                        .shared
                        .done_cv
                        .wait(state)
                        .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
                }
            }
        }

        trace!(seq, ticket, durable, "WAL frame enqueued");
        Ok(())
    }

    /// Drains pending frames to disk synchronously (durable barrier).
    pub fn sync(&self) -> Result<(), WalError> {
        let mut state = self.lock_state()?;
        flush_locked(&mut state, self.config.fast_mode).map_err(|e| {
            WalError::FlusherFailed(e.to_string())
        })?;
        self.shared.done_cv.notify_all();
        Ok(())
    }

    /// Atomically closes the current segment and opens the next one.
    pub fn seal_segment(&self) -> Result<(), WalError> {
        let mut state = self.lock_state()?;
        flush_locked(&mut state, false).map_err(|e| WalError::FlusherFailed(e.to_string()))?;
        self.shared.done_cv.notify_all();

        let old_seg = state.seg;
        let old_path = segment_path(&self.dir, old_seg);
        let sealed = SealedSegment {
            seg: old_seg,
            path: old_path,
            max_seq: state.seg_max_seq,
        };

        let next = old_seg + 1;
        let next_path = segment_path(&self.dir, next);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&next_path)?;

        state.sealed.push(sealed);
        state.file = file;
        state.seg = next;
        state.seg_bytes = 0;

        debug!(segment = next, "WAL segment sealed and rotated");
        Ok(())
    }

    /// Deletes sealed segments whose highest record seq is ≤ `upto_seq`
    /// (everything in them is covered by a checkpoint).
    pub fn prune_obsolete(&self, upto_seq: u64) -> Result<usize, WalError> {
        let mut state = self.lock_state()?;
        let mut pruned = 0usize;
        state.sealed.retain(|seg| {
            if seg.max_seq <= upto_seq {
                match fs::remove_file(&seg.path) {
                    Ok(()) => {
                        pruned += 1;
                        false
                    }
                    Err(e) => {
                        warn!(segment = seg.seg, error = %e, "failed to prune WAL segment");
                        true
                    }
                }
            } else {
                true
            }
        });
        if pruned > 0 {
            debug!(pruned, upto_seq, "pruned obsolete WAL segments");
        }
        Ok(pruned)
    }

    /// Whether the live segment has outgrown the configured bound.
    pub fn segment_full(&self) -> Result<bool, WalError> {
        let state = self.lock_state()?;
        Ok(state.seg_bytes >= self.config.segment_max_bytes)
    }

    /// Directory this WAL lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stops the flusher after a final durable drain. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&self) -> Result<(), WalError> {
        {
            let mut state = self.lock_state()?;
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            self.shared.work_cv.notify_all();
        }
        let handle = self
            .flusher
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, WalState>, WalError> {
        self.shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "WAL shutdown failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Flusher
// ------------------------------------------------------------------------------------------------

/// Writes the pending queue to the live segment and barriers it.
fn flush_locked(state: &mut WalState, fast_mode: bool) -> io::Result<()> {
    if state.queue.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(&mut state.queue);
    let frames = batch.len();
    let mut bytes = 0u64;
    for frame in &batch {
        state.file.write_all(frame)?;
        bytes += frame.len() as u64;
    }
    if fast_mode {
        state.file.sync_data()?;
    } else {
        state.file.sync_all()?;
    }
    state.seg_bytes += bytes;
    state.flushed = state.enqueued;

    trace!(frames, bytes, "WAL batch flushed");
    Ok(())
}

fn flusher_loop(shared: &WalShared, config: &WalConfig) {
    let interval = Duration::from_micros(config.group_micros);
    let mut last_flush = Instant::now();

    let mut state = match shared.state.lock() {
        Ok(g) => g,
        Err(_) => return,
    };

    loop {
        if state.shutdown {
            // Final drain so close() loses nothing.
            if let Err(e) = flush_locked(&mut state, config.fast_mode) {
                state.failed = Some(e.to_string());
            }
            shared.done_cv.notify_all();
            return;
        }

        let due = state.queue.len() >= config.group_n
            || (!state.queue.is_empty() && last_flush.elapsed() >= interval);

        if due {
            if let Err(e) = flush_locked(&mut state, config.fast_mode) {
                error!(error = %e, "WAL flush failed");
                state.failed = Some(e.to_string());
                shared.done_cv.notify_all();
                return;
            }
            last_flush = Instant::now();
            shared.done_cv.notify_all();
            continue;
        }

        let (guard, _timeout) = match shared.work_cv.wait_timeout(state, interval) {
            Ok(r) => r,
            Err(_) => return,
        };
        state = guard;
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

type LiveSegment = (u64, PathBuf, u64);

/// Scans segments in order, stopping at the first torn or invalid frame.
///
/// Returns the replay result, the sealed-segment bookkeeping for pruning,
/// and the live (last) segment with its valid byte length.
fn replay_segments(
    segments: &[(u64, PathBuf)],
) -> Result<(WalReplay, Vec<SealedSegment>, Option<LiveSegment>), WalError> {
    let mut records = Vec::new();
    let mut max_seq = 0u64;
    let mut truncated = false;
    let mut sealed = Vec::new();
    let mut live = None;

    for (pos, (seg, path)) in segments.iter().enumerate() {
        let is_last = pos == segments.len() - 1;
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut offset = 0usize;
        let mut seg_max_seq = 0u64;

        loop {
            let rest = &bytes[offset..];
            if rest.len() < U32_SIZE {
                if !rest.is_empty() {
                    truncated = true;
                }
                break;
            }
            let len = u32::from_le_bytes(rest[..U32_SIZE].try_into().expect("slice is 4 bytes"))
                as usize;
            if rest.len() < U32_SIZE + len + U32_SIZE {
                warn!(segment = seg, offset, "WAL torn frame; stopping replay");
                truncated = true;
                break;
            }
            let payload = &rest[U32_SIZE..U32_SIZE + len];
            let stored = u32::from_le_bytes(
                rest[U32_SIZE + len..U32_SIZE + len + U32_SIZE]
                    .try_into()
                    .expect("slice is 4 bytes"),
            );
            if crc32c::crc32c(payload) != stored {
                warn!(segment = seg, offset, "WAL checksum mismatch; stopping replay");
                truncated = true;
                break;
            }

            let record = match block::decode_record(payload) {
                Ok((record, consumed)) if consumed == payload.len() => record,
                _ => {
                    warn!(segment = seg, offset, "WAL frame undecodable; stopping replay");
                    truncated = true;
                    break;
                }
            };

            seg_max_seq = seg_max_seq.max(record.seq);
            max_seq = max_seq.max(record.seq);
            records.push(record);
            offset += U32_SIZE + len + U32_SIZE;
        }

        if is_last {
            live = Some((*seg, path.clone(), offset as u64));
        } else {
            sealed.push(SealedSegment {
                seg: *seg,
                path: path.clone(),
                max_seq: seg_max_seq,
            });
        }

        // Everything after the first damaged frame is discarded, later
        // segments included.
        if truncated {
            if !is_last {
                live = Some((*seg, path.clone(), offset as u64));
                sealed.pop();
                warn!(
                    segment = seg,
                    "discarding WAL segments after torn frame"
                );
                for (later_seg, later_path) in &segments[pos + 1..] {
                    if let Err(e) = fs::remove_file(later_path) {
                        warn!(segment = later_seg, error = %e, "failed to remove stale WAL segment");
                    }
                }
            }
            break;
        }
    }

    Ok((
        WalReplay {
            records,
            max_seq,
            truncated,
        },
        sealed,
        live,
    ))
}
