//! Hot-cache bookkeeping.
//!
//! A bounded set of recently accessed fingerprints, plus an accumulator of
//! the bytes their latest payload versions occupy. The set is capped two
//! ways: by entry count (`hot_items_count`) and by resident bytes
//! (`hot_data_size`). When the tracked payloads outgrow the byte budget the
//! coldest fingerprints are shed, on the grounds that a working set larger
//! than the hot window cannot be kept near the write head no matter how often
//! it is re-appended.
//!
//! The engine consults the set on hits: an entry that trails the write head
//! by more than the configured hot window is only re-appended (compacted)
//! once it has proven itself hot, i.e. on at least its second tracked access
//! while within both caps. A capacity of zero disables tracking, which makes
//! every entry eligible.

use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy)]
struct HotEntry {
    seq: u64,
    bytes: u64,
}

pub(crate) struct HotSet {
    capacity: usize,
    /// Resident-byte budget; zero means unbounded.
    byte_cap: u64,
    next_seq: u64,
    by_fingerprint: HashMap<u64, HotEntry>,
    // Access order: oldest sequence first. Mirrors `by_fingerprint` exactly.
    by_seq: BTreeMap<u64, u64>,
    resident_bytes: u64,
}

impl HotSet {
    pub fn new(capacity: usize, byte_cap: u64) -> Self {
        Self {
            capacity,
            byte_cap,
            next_seq: 0,
            by_fingerprint: HashMap::with_capacity(capacity),
            by_seq: BTreeMap::new(),
            resident_bytes: 0,
        }
    }

    /// Records an access to `fingerprint`, whose current payload occupies
    /// `bytes`. Returns whether the fingerprint was already hot.
    pub fn touch(&mut self, fingerprint: u64, bytes: u64) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(entry) = self.by_fingerprint.get_mut(&fingerprint) {
            self.by_seq.remove(&entry.seq);
            self.by_seq.insert(seq, fingerprint);
            self.resident_bytes = self.resident_bytes - entry.bytes + bytes;
            *entry = HotEntry { seq, bytes };
            self.shed();
            return true;
        }

        if self.by_fingerprint.len() == self.capacity {
            self.evict_coldest();
        }

        self.by_fingerprint
            .insert(fingerprint, HotEntry { seq, bytes });
        self.by_seq.insert(seq, fingerprint);
        self.resident_bytes += bytes;
        self.shed();
        false
    }

    /// Sheds coldest entries until the resident bytes fit the budget. The
    /// most recently touched entry is always kept, even when it exceeds the
    /// budget on its own.
    fn shed(&mut self) {
        if self.byte_cap == 0 {
            return;
        }
        while self.resident_bytes > self.byte_cap && self.by_fingerprint.len() > 1 {
            self.evict_coldest();
        }
    }

    fn evict_coldest(&mut self) {
        if let Some((_, coldest)) = self.by_seq.pop_first() {
            if let Some(evicted) = self.by_fingerprint.remove(&coldest) {
                self.resident_bytes -= evicted.bytes;
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_fingerprint.clear();
        self.by_seq.clear();
        self.resident_bytes = 0;
    }
}
