//! # AkkaraDB
//!
//! An embeddable, single-writer, ordered key/value storage engine built
//! on a **Log-Structured Merge Tree (LSM-tree)**, augmented with an
//! append-only, erasure-coded **stripe log** that gives recent writes
//! parity-protected durability before they reach SSTables.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Engine                            │
//! │                                                           │
//! │   put/delete ──► WAL ──► Memtable ──► Block packer        │
//! │                (group     (sharded)       │               │
//! │                 commit)                   ▼               │
//! │                                   Stripe writer           │
//! │                                  k data + m parity        │
//! │        seal ▼                        lanes                │
//! │   ┌─────────────────┐                                     │
//! │   │  L0 SSTables    │──► leveled compaction ──► L1..Ln    │
//! │   └─────────────────┘                                     │
//! │                                                           │
//! │   ┌───────────────────────────────────────────────────┐   │
//! │   │   Manifest (append-only event log + checkpoints)  │   │
//! │   └───────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Facade — open, put, get, delete, cas, range, flush, close |
//! | [`block`] | 32-byte record header, fingerprints, 32 KiB block codec |
//! | [`parity`] | XOR / dual-XOR / Reed–Solomon erasure coding over GF(2^8) |
//! | [`stripe`] | k+m lane files, group-committed stripes, parity repair |
//! | [`wal`] | Segmented write-ahead log with group commit and torn-tail replay |
//! | [`memtable`] | Sharded in-memory write buffer with seal-and-swap flush |
//! | [`sstable`] | Immutable sorted tables: blocks, outer index, bloom, footer |
//! | [`compaction`] | Leveled compaction with newest-wins merge and tombstone GC |
//! | [`manifest`] | Append-only metadata log that orders durable events |
//! | [`encoding`] | Hand-written little-endian wire codec for manifest events |
//!
//! ## Key Properties
//!
//! - **WAL-before-ack** — in durable mode a write returns only after its
//!   frame survived an fsync-class barrier; fast mode trades a bounded
//!   crash-loss window for latency.
//! - **Erasure-coded recent history** — every packed block lands in a
//!   k-data/m-parity stripe; any m lanes can be lost and re-derived.
//! - **Crash recovery as replay** — the manifest orders stripe commits,
//!   table seals, and checkpoints; open() reduces to deterministic
//!   replay plus WAL tail application.
//! - **Per-key linearizability** — one atomic sequence counter, newest
//!   record wins, tombstone wins a seq tie.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use akkaradb::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//!
//! let seq = engine.put(b"hello", b"world").unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Compare-and-swap on the sequence number returned by put.
//! assert!(engine.cas(b"hello", seq, Some(b"world2".as_slice())).unwrap());
//!
//! engine.delete(b"hello").unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! for (key, value, _seq, _flags) in engine.range(None, None, Some(10)).unwrap() {
//!     println!("{key:?} = {value:?}");
//! }
//!
//! engine.close().unwrap();
//! ```

pub mod block;
pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod parity;
pub mod sstable;
pub mod stripe;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError};
pub use parity::ParityKind;
