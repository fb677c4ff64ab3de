//! The fixed-size, open-addressed index table.
//!
//! The index maps 64-bit key fingerprints to entries in the data region. It
//! is not a guaranteed store: the probe distance is bounded, inserts may evict
//! the oldest resident of a full window, and fingerprint collisions silently
//! replace the older entry. The read path's payload validation keeps all of
//! this safe: no stale bytes ever reach a caller.
//!
//! All slot accesses go through the raw mapping and must happen with the
//! engine mutex held; the one exception is the write cursor, which the
//! background sync worker reads through [`IndexFile::write_cursor`] after the
//! engine published it under the lock.

use std::io;

use crate::io::Backing;

pub(crate) const HEADER_LEN: usize = 64;
pub(crate) const ENTRY_SIZE: usize = 32;

/// How far a probe walks from a fingerprint's home slot before giving up.
/// Bounds both lookup and insert cost; a full window evicts its oldest
/// resident.
pub(crate) const PROBE_WINDOW: u64 = 16;

const MAGIC: u64 = 0x6d6d_6361_6368_6531; // "mmcache1"
const VERSION: u32 = 1;

/// Seed for the keyed fingerprint hash. Stored in the header so persisted
/// fingerprints keep their meaning; changing it invalidates existing index
/// files (they reset to empty on open).
pub(crate) const HASH_SEED: u64 = 0x51ab_2e01_77f3_9c84;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_ENTRY_SIZE: usize = 12;
const OFF_SLOT_COUNT: usize = 16;
const OFF_HASH_SEED: usize = 24;
const CRC_COVERAGE: usize = 32;
const OFF_CRC: usize = 32;
const OFF_WRITE_CURSOR: usize = 40;

/// One index slot, decoded. A zero expiration marks an empty slot; live
/// entries always expire strictly after the epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Slot {
    pub fingerprint: u64,
    pub cursor: u64,
    pub expiry: u64,
    pub payload_len: u64,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.expiry == 0
    }

    fn is_dead(&self, now: u64) -> bool {
        self.expiry <= now
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.fingerprint.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cursor.to_le_bytes());
        buf[16..24].copy_from_slice(&self.expiry.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            fingerprint: u64::from_le_bytes(buf[0..8].try_into().expect("slice length is 8")),
            cursor: u64::from_le_bytes(buf[8..16].try_into().expect("slice length is 8")),
            expiry: u64::from_le_bytes(buf[16..24].try_into().expect("slice length is 8")),
            payload_len: u64::from_le_bytes(buf[24..32].try_into().expect("slice length is 8")),
        }
    }
}

pub(crate) struct IndexFile {
    backing: Backing,
    slot_count: u64,
    mask: u64,
}

impl IndexFile {
    /// Expected byte length of an index file with `slot_count` slots.
    pub fn file_len(slot_count: usize) -> u64 {
        HEADER_LEN as u64 + (slot_count * ENTRY_SIZE) as u64
    }

    /// Wraps a mapped index region, validating or rebuilding its header.
    ///
    /// `fresh` marks a backing that was just created or resized; its contents
    /// are formatted unconditionally. An existing backing whose header fails
    /// validation (wrong magic, version, geometry, seed or checksum) is
    /// treated as empty and reformatted in place, never reported as an error.
    pub fn open(backing: Backing, slot_count: usize, fresh: bool) -> Self {
        let slot_count = slot_count as u64;
        debug_assert!(slot_count.is_power_of_two());

        let index = Self {
            backing,
            slot_count,
            mask: slot_count - 1,
        };

        if fresh {
            index.format();
        } else if !index.header_is_valid() {
            warn!("Index header validation failed. Resetting index to empty.");
            metrics::counter!("mmcache_index_resets_total", 1);
            index.format();
        }

        index
    }

    fn format(&self) {
        // Zero everything first so a half-written previous life cannot leak
        // slots past a freshly valid header.
        unsafe {
            std::ptr::write_bytes(self.backing.ptr(), 0, self.backing.len());
        }

        self.write_header_u64(OFF_MAGIC, MAGIC);
        self.write_header_u32(OFF_VERSION, VERSION);
        self.write_header_u32(OFF_ENTRY_SIZE, ENTRY_SIZE as u32);
        self.write_header_u64(OFF_SLOT_COUNT, self.slot_count);
        self.write_header_u64(OFF_HASH_SEED, HASH_SEED);
        self.write_header_u32(OFF_CRC, self.header_crc());
        self.write_header_u64(OFF_WRITE_CURSOR, 0);
    }

    fn header_is_valid(&self) -> bool {
        self.read_header_u64(OFF_MAGIC) == MAGIC
            && self.read_header_u32(OFF_VERSION) == VERSION
            && self.read_header_u32(OFF_ENTRY_SIZE) == ENTRY_SIZE as u32
            && self.read_header_u64(OFF_SLOT_COUNT) == self.slot_count
            && self.read_header_u64(OFF_HASH_SEED) == HASH_SEED
            && self.read_header_u32(OFF_CRC) == self.header_crc()
    }

    fn header_crc(&self) -> u32 {
        let mut prefix = [0; CRC_COVERAGE];
        unsafe {
            std::ptr::copy_nonoverlapping(self.backing.ptr(), prefix.as_mut_ptr(), CRC_COVERAGE);
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);
        hasher.finalize()
    }

    /// The persisted write cursor.
    pub fn write_cursor(&self) -> u64 {
        self.read_header_u64(OFF_WRITE_CURSOR)
    }

    /// Publishes a new write cursor. Written through to the mapping on every
    /// reservation so that a clean close (or a background flush) persists it;
    /// it sits outside the checksummed header prefix for exactly that reason.
    pub fn set_write_cursor(&self, cursor: u64) {
        self.write_header_u64(OFF_WRITE_CURSOR, cursor);
    }

    /// Looks up a live entry for `fingerprint`, returning it if present and
    /// not expired at `now`.
    pub fn lookup(&self, fingerprint: u64, now: u64) -> Option<Slot> {
        let home = fingerprint & self.mask;
        for i in 0..self.window() {
            let slot = self.read_slot((home + i) & self.mask);
            if !slot.is_empty() && slot.fingerprint == fingerprint {
                if slot.is_dead(now) {
                    return None;
                }
                return Some(slot);
            }
        }
        None
    }

    /// Installs `entry`, replacing a same-fingerprint resident if present
    /// (anywhere in the window, so a key never occupies two slots),
    /// otherwise taking the first empty or expired slot in the window,
    /// otherwise evicting the window's oldest resident (smallest expiration,
    /// ties broken towards the smallest data cursor).
    ///
    /// Returns `true` when a live entry for a different key was evicted.
    pub fn insert(&self, entry: Slot, now: u64) -> bool {
        let home = entry.fingerprint & self.mask;
        let mut free: Option<u64> = None;
        let mut victim_index = home;
        let mut victim: Option<Slot> = None;

        for i in 0..self.window() {
            let index = (home + i) & self.mask;
            let slot = self.read_slot(index);

            if !slot.is_empty() && slot.fingerprint == entry.fingerprint {
                self.write_slot(index, &entry);
                return false;
            }

            if slot.is_empty() || slot.is_dead(now) {
                if free.is_none() {
                    free = Some(index);
                }
                continue;
            }

            let is_older =
                victim.map_or(true, |v| (slot.expiry, slot.cursor) < (v.expiry, v.cursor));
            if is_older {
                victim_index = index;
                victim = Some(slot);
            }
        }

        if let Some(index) = free {
            self.write_slot(index, &entry);
            return false;
        }

        trace!(
            fingerprint = entry.fingerprint,
            evicted_fingerprint = victim.map(|v| v.fingerprint).unwrap_or_default(),
            "Probe window full. Evicting oldest resident.",
        );
        self.write_slot(victim_index, &entry);
        true
    }

    /// Erases the live entry for `fingerprint`, if any. Returns whether an
    /// entry was found.
    pub fn remove(&self, fingerprint: u64, now: u64) -> bool {
        let home = fingerprint & self.mask;
        for i in 0..self.window() {
            let index = (home + i) & self.mask;
            let slot = self.read_slot(index);
            if !slot.is_empty() && slot.fingerprint == fingerprint {
                self.erase(fingerprint);
                return !slot.is_dead(now);
            }
        }
        false
    }

    /// Zeroes the slot currently holding `fingerprint`, if any. Used by the
    /// read path when payload validation fails.
    pub fn erase(&self, fingerprint: u64) {
        let home = fingerprint & self.mask;
        for i in 0..self.window() {
            let index = (home + i) & self.mask;
            let slot = self.read_slot(index);
            if !slot.is_empty() && slot.fingerprint == fingerprint {
                self.write_slot(index, &Slot::default());
                return;
            }
        }
    }

    /// Zeroes every slot, leaving the header (and write cursor) intact.
    pub fn clear(&self) {
        let slots_len = (self.slot_count as usize) * ENTRY_SIZE;
        unsafe {
            std::ptr::write_bytes(self.backing.ptr().add(HEADER_LEN), 0, slots_len);
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        self.backing.flush()
    }

    fn window(&self) -> u64 {
        PROBE_WINDOW.min(self.slot_count)
    }

    fn read_slot(&self, index: u64) -> Slot {
        let mut buf = [0; ENTRY_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.backing.ptr().add(HEADER_LEN + index as usize * ENTRY_SIZE),
                buf.as_mut_ptr(),
                ENTRY_SIZE,
            );
        }
        Slot::decode(&buf)
    }

    fn write_slot(&self, index: u64, slot: &Slot) {
        let buf = slot.encode();
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.backing.ptr().add(HEADER_LEN + index as usize * ENTRY_SIZE),
                ENTRY_SIZE,
            );
        }
    }

    fn read_header_u64(&self, offset: usize) -> u64 {
        let mut buf = [0; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(self.backing.ptr().add(offset), buf.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(buf)
    }

    fn write_header_u64(&self, offset: usize, value: u64) {
        let buf = value.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.backing.ptr().add(offset), 8);
        }
    }

    fn read_header_u32(&self, offset: usize) -> u32 {
        let mut buf = [0; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.backing.ptr().add(offset), buf.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(buf)
    }

    fn write_header_u32(&self, offset: usize, value: u32) {
        let buf = value.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.backing.ptr().add(offset), 4);
        }
    }
}
