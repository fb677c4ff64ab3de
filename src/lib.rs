//! # Mmcache: a memory-mapped, in-process key/value cache.
//!
//! This crate implements a bounded, high-throughput local cache with optional
//! durability across process restarts and protection against the
//! cache-stampede ("dogpile") effect on expensive key computations.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for ensuring that the design
//! can stay simple and understandable:
//! - the index is a fixed-size, open-addressed table of fixed-width slots, sized at open time
//! - the data region is a single circular byte arena addressed by a monotonic 64-bit write cursor
//! - payloads are written contiguously and never split across the wrap boundary
//! - every payload carries an in-band header and is re-validated against its index entry on read
//! - live item handles pin their payload range; a reservation that would overrun a pinned range
//!   fails with "no room" instead of blocking or corrupting
//! - a corrupt or mismatched index file is silently reset to empty on open; the data file is never
//!   validated up front, stale pointers are caught by per-read payload validation
//! - endianness of the files is little-endian regardless of host
//!
//! ## On-disk layout
//!
//! Two files back a persistent cache: the **index** and the **data** file. When the configuration
//! names no paths, anonymous mappings are used instead and the cache dies with the process.
//!
//! The index file is a 64-byte header followed by a power-of-two array of 32-byte slots:
//!
//!   header:
//!     `magic`:        uint64
//!     `version`:      uint32
//!     `entry_size`:   uint32
//!     `slot_count`:   uint64
//!     `hash_seed`:    uint64
//!     `checksum`:     uint32 (CRC32 of the 32 bytes above)
//!     `write_cursor`: uint64 (updated in place, outside the checksummed prefix)
//!
//!   slot:
//!     `fingerprint`:  uint64
//!     `cursor`:       uint64
//!     `expiry`:       uint64 (wall-clock ms; 0 marks an empty slot)
//!     `payload_len`:  uint64
//!
//! The data file is a raw byte arena with no global header. Each payload is
//! `{fingerprint, expiry, key_size, value_size}` followed by the key echo and the value bytes.
//! The physical offset of a payload is `cursor mod data_file_size`.
//!
//! ## Concurrency model
//!
//! Any number of threads may call any operation on the same [`Cache`]. A single per-cache engine
//! mutex protects the index table, the write cursor, the pin bookkeeping and the hot set; critical
//! sections are short, and bulk payload copies happen outside the mutex under the protection of an
//! acquired [`Item`] pin. The only operation that sleeps is [`Cache::get_de`], bounded by its
//! grace period. Commits are linearizable per key: once a set returns, any later lookup in the
//! same process observes the new value or a strictly newer eviction.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

#[macro_use]
extern crate tracing;

mod arena;
mod cache;
mod clock;
pub mod cluster;
pub mod config;
mod dogpile;
mod flusher;
mod hot;
mod index;
mod io;
mod item;
mod record;
mod simple;
mod txn;

#[cfg(test)]
mod tests;

pub use cache::{Cache, DeAsync, OpenError, SetError};
pub use cluster::Cluster;
pub use config::{BuildError, CacheConfig, CacheConfigBuilder};
pub use item::Item;
pub use simple::SimpleGet;
pub use txn::SetTxn;

use std::time::Duration;

/// Time-to-live that never expires.
pub const MAX_TTL: Duration = Duration::MAX;
