//! Manifest Module
//!
//! The manifest is the engine's metadata authority: an append-only event
//! log that orders durable events — stripe commits, SSTable seals and
//! deletions, compaction boundaries, checkpoints, truncations — and
//! replays deterministically into the authoritative engine state after a
//! crash.
//!
//! # On-disk layout
//!
//! Rotating segments at the store root:
//!
//! ```text
//! manifest.akman.000000
//! manifest.akman.000001
//! ...
//! ```
//!
//! Each event is framed as `[length u32][tag u8 ∥ fields][crc32c u32]`
//! with the CRC over the payload (tag + fields). Fields use the
//! [`crate::encoding`] wire format.
//!
//! # Durability
//!
//! Every event is written through to the segment file immediately;
//! `Checkpoint` events additionally fsync. Other events become durable at
//! the next checkpoint or explicit [`Manifest::sync`]. A segment that
//! exceeds [`MANIFEST_MAX_BYTES`] is rotated; predecessor segments are
//! swept after the next checkpoint, once the surviving tail fully
//! describes the live state.
//!
//! # Replay
//!
//! All segments are scanned in order. A torn or CRC-invalid frame is
//! tolerated only in the *last* segment (the one that was live at crash
//! time) — rotated segments are immutable and must be fully valid.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Segment rotation threshold.
pub const MANIFEST_MAX_BYTES: u64 = 32 * 1024 * 1024;

/// Highest manifest format version this build understands.
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Event encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A rotated (immutable) segment contained an invalid frame.
    #[error("corrupted manifest segment {segment}: {reason}")]
    CorruptedSegment {
        /// Segment number.
        segment: u64,
        /// What failed.
        reason: String,
    },

    /// The store was written by a newer format. Fatal on open.
    #[error("manifest format version {found} is newer than supported {supported}")]
    FormatUnsupported {
        /// Version recorded in the store.
        found: u16,
        /// Highest version this build supports.
        supported: u16,
    },
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

/// One SSTable as the manifest tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSstEntry {
    /// Level the table lives on.
    pub level: u16,

    /// Path relative to the store root (e.g. `sst/L0/sst_123.sst`).
    pub file: String,

    /// Record count.
    pub entries: u64,

    /// Smallest key in the table.
    pub first_key: Vec<u8>,

    /// Largest key in the table.
    pub last_key: Vec<u8>,
}

/// Events the manifest records. Tags are part of the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEvent {
    /// Stripes `0..stripe` are durable in the lane files.
    StripeCommit {
        /// New committed-stripe count.
        stripe: u64,
    },

    /// A new SSTable is live.
    SstSeal {
        /// The sealed table.
        entry: ManifestSstEntry,
    },

    /// A compaction began (informational; state changes ride SstSeal /
    /// SstDelete).
    CompactionStart {
        /// Level being compacted.
        level: u16,
        /// Input file paths.
        inputs: Vec<String>,
    },

    /// A compaction finished writing its outputs.
    CompactionEnd {
        /// Level that was compacted.
        level: u16,
        /// Output file paths.
        outputs: Vec<String>,
        /// Input file paths, now obsolete.
        inputs: Vec<String>,
    },

    /// An SSTable is no longer live.
    SstDelete {
        /// Path of the deleted table.
        file: String,
    },

    /// Durable recovery boundary; fsynced on append.
    Checkpoint {
        /// Human-readable tag (e.g. `"flush"`, `"close"`).
        name: String,
        /// Committed stripes at the checkpoint.
        stripe: u64,
        /// Highest sequence number covered.
        last_seq: u64,
    },

    /// Lane files were trimmed during recovery.
    Truncate {
        /// Why the trim happened.
        reason: String,
        /// Committed stripes after the trim.
        stripe: u64,
    },

    /// The store format version changed.
    FormatBump {
        /// Previous version.
        old_ver: u16,
        /// New version.
        new_ver: u16,
    },
}

impl Encode for ManifestSstEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.level.encode_to(buf)?;
        self.file.encode_to(buf)?;
        self.entries.encode_to(buf)?;
        self.first_key.encode_to(buf)?;
        self.last_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestSstEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (level, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (file, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (entries, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (first_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (last_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                level,
                file,
                entries,
                first_key,
                last_key,
            },
            off,
        ))
    }
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::StripeCommit { stripe } => {
                0u8.encode_to(buf)?;
                stripe.encode_to(buf)?;
            }
            ManifestEvent::SstSeal { entry } => {
                1u8.encode_to(buf)?;
                entry.encode_to(buf)?;
            }
            ManifestEvent::CompactionStart { level, inputs } => {
                2u8.encode_to(buf)?;
                level.encode_to(buf)?;
                encoding::encode_vec(inputs, buf)?;
            }
            ManifestEvent::CompactionEnd {
                level,
                outputs,
                inputs,
            } => {
                3u8.encode_to(buf)?;
                level.encode_to(buf)?;
                encoding::encode_vec(outputs, buf)?;
                encoding::encode_vec(inputs, buf)?;
            }
            ManifestEvent::SstDelete { file } => {
                4u8.encode_to(buf)?;
                file.encode_to(buf)?;
            }
            ManifestEvent::Checkpoint {
                name,
                stripe,
                last_seq,
            } => {
                5u8.encode_to(buf)?;
                name.encode_to(buf)?;
                stripe.encode_to(buf)?;
                last_seq.encode_to(buf)?;
            }
            ManifestEvent::Truncate { reason, stripe } => {
                6u8.encode_to(buf)?;
                reason.encode_to(buf)?;
                stripe.encode_to(buf)?;
            }
            ManifestEvent::FormatBump { old_ver, new_ver } => {
                7u8.encode_to(buf)?;
                old_ver.encode_to(buf)?;
                new_ver.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (tag, n) = u8::decode_from(buf)?;
        off += n;
        match tag {
            0 => {
                let (stripe, n) = u64::decode_from(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::StripeCommit { stripe }, off))
            }
            1 => {
                let (entry, n) = ManifestSstEntry::decode_from(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::SstSeal { entry }, off))
            }
            2 => {
                let (level, n) = u16::decode_from(&buf[off..])?;
                off += n;
                let (inputs, n) = encoding::decode_vec::<String>(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::CompactionStart { level, inputs }, off))
            }
            3 => {
                let (level, n) = u16::decode_from(&buf[off..])?;
                off += n;
                let (outputs, n) = encoding::decode_vec::<String>(&buf[off..])?;
                off += n;
                let (inputs, n) = encoding::decode_vec::<String>(&buf[off..])?;
                off += n;
                Ok((
                    ManifestEvent::CompactionEnd {
                        level,
                        outputs,
                        inputs,
                    },
                    off,
                ))
            }
            4 => {
                let (file, n) = String::decode_from(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::SstDelete { file }, off))
            }
            5 => {
                let (name, n) = String::decode_from(&buf[off..])?;
                off += n;
                let (stripe, n) = u64::decode_from(&buf[off..])?;
                off += n;
                let (last_seq, n) = u64::decode_from(&buf[off..])?;
                off += n;
                Ok((
                    ManifestEvent::Checkpoint {
                        name,
                        stripe,
                        last_seq,
                    },
                    off,
                ))
            }
            6 => {
                let (reason, n) = String::decode_from(&buf[off..])?;
                off += n;
                let (stripe, n) = u64::decode_from(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::Truncate { reason, stripe }, off))
            }
            7 => {
                let (old_ver, n) = u16::decode_from(&buf[off..])?;
                off += n;
                let (new_ver, n) = u16::decode_from(&buf[off..])?;
                off += n;
                Ok((ManifestEvent::FormatBump { old_ver, new_ver }, off))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "ManifestEvent",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replayed state
// ------------------------------------------------------------------------------------------------

/// Deterministic product of replaying every manifest event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestState {
    /// Live SSTables per level, in seal order.
    pub live: BTreeMap<u16, Vec<ManifestSstEntry>>,

    /// Stripes durable in the lane files.
    pub committed_stripes: u64,

    /// Highest sequence number covered by a checkpoint.
    pub last_checkpoint_seq: u64,

    /// Committed stripes at the last checkpoint.
    pub last_checkpoint_stripe: u64,

    /// Store format version.
    pub format_version: u16,
}

impl ManifestState {
    fn new() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            ..Self::default()
        }
    }

    /// Applies one event.
    fn apply(&mut self, event: &ManifestEvent) {
        match event {
            ManifestEvent::StripeCommit { stripe } => {
                self.committed_stripes = *stripe;
            }
            ManifestEvent::SstSeal { entry } => {
                self.live.entry(entry.level).or_default().push(entry.clone());
            }
            ManifestEvent::SstDelete { file } => {
                for tables in self.live.values_mut() {
                    tables.retain(|t| t.file != *file);
                }
            }
            ManifestEvent::Checkpoint {
                stripe, last_seq, ..
            } => {
                self.last_checkpoint_seq = *last_seq;
                self.last_checkpoint_stripe = *stripe;
            }
            ManifestEvent::Truncate { stripe, .. } => {
                self.committed_stripes = *stripe;
            }
            ManifestEvent::FormatBump { new_ver, .. } => {
                self.format_version = *new_ver;
            }
            // Compaction boundaries carry no state of their own: the
            // SstSeal / SstDelete events around them do.
            ManifestEvent::CompactionStart { .. } | ManifestEvent::CompactionEnd { .. } => {}
        }
    }

    /// All live tables across levels.
    pub fn live_tables(&self) -> impl Iterator<Item = &ManifestSstEntry> {
        self.live.values().flatten()
    }
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

fn segment_path(dir: &Path, seg: u64) -> PathBuf {
    dir.join(format!("manifest.akman.{seg:06}"))
}

fn parse_segment(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("manifest.akman.")?
        .parse()
        .ok()
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// Append-only manifest writer plus its replayed in-memory state.
pub struct Manifest {
    dir: PathBuf,
    file: File,
    seg: u64,
    seg_bytes: u64,

    /// Rotated-out segments awaiting the post-checkpoint sweep.
    old_segments: Vec<PathBuf>,

    state: ManifestState,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("dir", &self.dir)
            .field("segment", &self.seg)
            .finish_non_exhaustive()
    }
}

impl Manifest {
    /// Opens the manifest at the store root, replaying every segment.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                parse_segment(&path).map(|seg| (seg, path))
            })
            .collect();
        segments.sort_by_key(|(seg, _)| *seg);

        let mut state = ManifestState::new();
        let mut events = 0usize;
        for (pos, (seg, path)) in segments.iter().enumerate() {
            let is_last = pos == segments.len() - 1;
            events += replay_segment(*seg, path, is_last, &mut state)?;
        }

        if state.format_version > MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::FormatUnsupported {
                found: state.format_version,
                supported: MANIFEST_FORMAT_VERSION,
            });
        }

        let (seg, path) = segments
            .last()
            .map(|(seg, path)| (*seg, path.clone()))
            .unwrap_or_else(|| (0, segment_path(&dir, 0)));
        let old_segments = segments
            .iter()
            .rev()
            .skip(1)
            .map(|(_, p)| p.clone())
            .collect();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let seg_bytes = file.metadata()?.len();

        info!(
            dir = %dir.display(),
            segments = segments.len().max(1),
            events,
            committed_stripes = state.committed_stripes,
            last_checkpoint_seq = state.last_checkpoint_seq,
            "manifest opened"
        );

        Ok(Self {
            dir,
            file,
            seg,
            seg_bytes,
            old_segments,
            state,
        })
    }

    /// Replayed engine state.
    pub fn state(&self) -> &ManifestState {
        &self.state
    }

    /// Appends one event, applying it to the in-memory state.
    ///
    /// `Checkpoint` events fsync and then sweep rotated-out predecessor
    /// segments; other events defer durability to the next checkpoint or
    /// [`Manifest::sync`].
    pub fn append(&mut self, event: ManifestEvent) -> Result<(), ManifestError> {
        self.write_event(&event)?;
        self.state.apply(&event);

        if matches!(event, ManifestEvent::Checkpoint { .. }) {
            self.file.sync_all()?;
            self.sweep_old_segments();
        }

        debug!(?event, segment = self.seg, "manifest event appended");

        if self.seg_bytes >= MANIFEST_MAX_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    /// Frames and writes one event without touching the in-memory state.
    fn write_event(&mut self, event: &ManifestEvent) -> Result<(), ManifestError> {
        let payload = encoding::encode_to_vec(event)?;
        let mut frame = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());

        self.file.write_all(&frame)?;
        self.seg_bytes += frame.len() as u64;
        Ok(())
    }

    /// Forces pending events to disk.
    pub fn sync(&mut self) -> Result<(), ManifestError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Starts a new segment seeded with a snapshot of the live state, so
    /// replay of the tail alone reproduces it. The rotated-out segment
    /// survives until the next checkpoint sweep.
    fn rotate(&mut self) -> Result<(), ManifestError> {
        self.file.sync_all()?;
        let old_path = segment_path(&self.dir, self.seg);

        let next = self.seg + 1;
        let next_path = segment_path(&self.dir, next);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&next_path)?;

        self.old_segments.push(old_path);
        self.file = file;
        self.seg = next;
        self.seg_bytes = 0;

        // Snapshot events re-create the current state on replay; they are
        // written without re-applying (the state already holds them).
        let snapshot: Vec<ManifestEvent> = self
            .state
            .live_tables()
            .cloned()
            .map(|entry| ManifestEvent::SstSeal { entry })
            .chain(std::iter::once(ManifestEvent::StripeCommit {
                stripe: self.state.committed_stripes,
            }))
            .chain(std::iter::once(ManifestEvent::Checkpoint {
                name: "rotate".into(),
                stripe: self.state.last_checkpoint_stripe,
                last_seq: self.state.last_checkpoint_seq,
            }))
            .collect();
        for event in &snapshot {
            self.write_event(event)?;
        }
        self.file.sync_all()?;
        self.sweep_old_segments();

        info!(segment = next, "manifest segment rotated");
        Ok(())
    }

    fn sweep_old_segments(&mut self) {
        for path in self.old_segments.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to sweep manifest segment");
            } else {
                debug!(path = %path.display(), "swept manifest segment");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Replays one segment into `state`, returning the number of events
/// applied.
///
/// `tolerate_tail` is set for the last (live-at-crash) segment only:
/// rotated segments are immutable and any damage in them is fatal.
fn replay_segment(
    seg: u64,
    path: &Path,
    tolerate_tail: bool,
    state: &mut ManifestState,
) -> Result<usize, ManifestError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut offset = 0usize;
    let mut events = 0usize;
    loop {
        let rest = &bytes[offset..];
        if rest.is_empty() {
            break;
        }

        let frame = (|| -> Option<(ManifestEvent, usize)> {
            if rest.len() < U32_SIZE {
                return None;
            }
            let len =
                u32::from_le_bytes(rest[..U32_SIZE].try_into().expect("slice is 4 bytes")) as usize;
            if rest.len() < U32_SIZE + len + U32_SIZE {
                return None;
            }
            let payload = &rest[U32_SIZE..U32_SIZE + len];
            let stored = u32::from_le_bytes(
                rest[U32_SIZE + len..U32_SIZE + len + U32_SIZE]
                    .try_into()
                    .expect("slice is 4 bytes"),
            );
            if crc32c::crc32c(payload) != stored {
                return None;
            }
            let (event, consumed) = encoding::decode_from_slice::<ManifestEvent>(payload).ok()?;
            if consumed != len {
                return None;
            }
            Some((event, U32_SIZE + len + U32_SIZE))
        })();

        match frame {
            Some((event, consumed)) => {
                state.apply(&event);
                events += 1;
                offset += consumed;
            }
            None if tolerate_tail => {
                warn!(segment = seg, offset, "torn manifest tail; stopping replay");
                break;
            }
            None => {
                return Err(ManifestError::CorruptedSegment {
                    segment: seg,
                    reason: format!("invalid frame at offset {offset}"),
                });
            }
        }
    }

    Ok(events)
}
