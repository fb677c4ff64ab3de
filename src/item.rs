use std::time::Duration;

use crate::{
    cache::{Inner, PinnedPayload},
    clock,
    record::PAYLOAD_HEADER_LEN,
};

/// A pinned handle on a stored item.
///
/// The handle exposes zero-copy views of the key and value bytes straight out
/// of the data region. While it is alive, the engine refuses to reuse the
/// underlying range: a write that would need the space fails with "no room"
/// rather than invalidating the view. Drop the handle promptly: a pin on an
/// old payload can hold back the write cursor for the entire region.
///
/// Handles are not thread-safe individually (use one from a single thread at
/// a time), but any number of handles on the same cache are independent.
pub struct Item<'a> {
    cache: &'a Inner,
    payload: PinnedPayload,
}

impl<'a> Item<'a> {
    pub(crate) fn new(cache: &'a Inner, payload: PinnedPayload) -> Self {
        Self { cache, payload }
    }

    /// The key this item is stored under.
    pub fn key(&self) -> &[u8] {
        let begin = self.payload.begin + PAYLOAD_HEADER_LEN as u64;
        // The pin taken at acquisition keeps this range from being rewritten
        // for as long as `self` lives, and reservations are contiguous, so
        // the slice is stable and in bounds.
        unsafe {
            std::slice::from_raw_parts(
                self.cache.data.ptr_at(begin),
                self.payload.key_size as usize,
            )
        }
    }

    /// The stored value bytes.
    pub fn value(&self) -> &[u8] {
        let begin =
            self.payload.begin + PAYLOAD_HEADER_LEN as u64 + u64::from(self.payload.key_size);
        // Same argument as `key`.
        unsafe {
            std::slice::from_raw_parts(
                self.cache.data.ptr_at(begin),
                self.payload.value_size as usize,
            )
        }
    }

    /// Remaining time-to-live. [`crate::MAX_TTL`] for items that never
    /// expire.
    pub fn ttl(&self) -> Duration {
        clock::remaining(self.payload.expiry, clock::now_ms())
    }
}

impl Drop for Item<'_> {
    fn drop(&mut self) {
        self.cache.release_pin(self.payload.begin);
    }
}
