use crate::{
    cache::{Inner, PinnedPayload},
    item::Item,
    record::{PayloadHeader, PAYLOAD_HEADER_LEN},
};

/// A two-phase set in its fill phase.
///
/// [`Cache::begin_set`](crate::Cache::begin_set) reserves the payload range
/// and writes the header and key echo; the caller fills the value bytes
/// through [`value_mut`](SetTxn::value_mut) and then commits. Until commit,
/// nothing is visible to lookups, and concurrent transactions cannot collide:
/// each holds its own exclusive cursor range.
///
/// Dropping an uncommitted transaction rolls it back; the reserved bytes
/// become dead space that the write cursor laps in due course.
pub struct SetTxn<'a> {
    cache: &'a Inner,
    header: PayloadHeader,
    begin: u64,
    committed: bool,
}

impl<'a> SetTxn<'a> {
    pub(crate) fn new(cache: &'a Inner, header: PayloadHeader, begin: u64) -> Self {
        Self {
            cache,
            header,
            begin,
            committed: false,
        }
    }

    /// Size, in bytes, of the reserved value range.
    pub fn value_size(&self) -> usize {
        self.header.value_size as usize
    }

    /// The writable value range of the reservation.
    pub fn value_mut(&mut self) -> &mut [u8] {
        let begin = self.begin + PAYLOAD_HEADER_LEN as u64 + u64::from(self.header.key_size);
        // The reservation is exclusive to this transaction until commit, and
        // `&mut self` keeps this the only live view of it.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.cache.data.ptr_at(begin),
                self.header.value_size as usize,
            )
        }
    }

    /// Shrinks the value to `value_size` bytes. Growing is not possible:
    /// requests larger than the current size are ignored, so the call is
    /// idempotent.
    pub fn update_value_size(&mut self, value_size: usize) {
        if value_size < self.header.value_size as usize {
            self.header.value_size = value_size as u32;
            self.cache.rewrite_header(self.begin, &self.header);
        }
    }

    /// Commits the transaction: the item becomes visible to every subsequent
    /// lookup, and any callers waiting on this key's dogpile marker are
    /// woken.
    pub fn commit(mut self) {
        self.cache.commit_reservation(&self.header, self.begin, false);
        self.committed = true;
    }

    /// Commits like [`commit`](SetTxn::commit), but transfers the internal
    /// pin to a caller-visible [`Item`], so the new payload can be read back
    /// without racing subsequent overwrites.
    pub fn commit_item(mut self) -> Item<'a> {
        self.cache.commit_reservation(&self.header, self.begin, true);
        self.committed = true;

        let item = Item::new(
            self.cache,
            PinnedPayload {
                begin: self.begin,
                key_size: self.header.key_size,
                value_size: self.header.value_size,
                expiry: self.header.expiry,
            },
        );
        drop(self);
        item
    }

    /// Abandons the transaction without installing an index entry.
    /// Equivalent to dropping it.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for SetTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.cache.release_pin(self.begin);
        }
    }
}
