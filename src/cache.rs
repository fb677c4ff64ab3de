//! The cache engine.
//!
//! [`Cache`] owns the two mapped regions, the engine mutex and the background
//! sync worker. The mutex guards the index table, the write cursor, the pin
//! multiset and the hot set; every critical section is short. Payload bytes
//! are read and written outside the mutex: reads under the protection of a
//! pinned [`Item`], writes into reservation ranges that are exclusive to
//! their transaction by construction.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::{
    arena::{DataRegion, Reservation},
    clock,
    config::CacheConfig,
    dogpile::{DeProbe, DogpileTable},
    flusher::Flusher,
    hot::HotSet,
    index::{IndexFile, Slot, HASH_SEED},
    io::{Backing, OpenFileError},
    item::Item,
    record::{total_payload_len, PayloadHeader, PayloadStatus, PAYLOAD_HEADER_LEN},
    txn::SetTxn,
};

// Extra seeds for the keyed fingerprint hash; the primary seed lives in the
// index header. Changing any of these invalidates persisted index files.
const FINGERPRINT_SEED_B: u64 = 0xc2b2_ae3d_27d4_eb4f;
const FINGERPRINT_SEED_C: u64 = 0x1656_67b1_9e37_79f9;
const FINGERPRINT_SEED_D: u64 = 0x27d4_eb2f_1656_67c5;

/// Error that occurred while opening a cache.
#[derive(Debug, Snafu)]
pub enum OpenError {
    /// A backing file named by the configuration is absent (or the
    /// configuration is anonymous) and the open was not forced.
    #[snafu(display("no such cache: backing files absent and open was not forced"))]
    NoSuchCache,

    /// An existing data file's length does not match the configured
    /// `data_file_size`, and the open was not forced.
    ///
    /// Reported, never repaired: the file is left untouched. A forced open
    /// reconciles the length instead, which discards the cache's contents.
    #[snafu(display(
        "data file is {} bytes on disk, configuration expects {}",
        actual,
        expected
    ))]
    GeometryMismatch { actual: u64, expected: u64 },

    /// A general I/O error occurred while opening or mapping the backing
    /// files.
    #[snafu(display("cache I/O error: {}", source))]
    Io { source: io::Error },
}

/// Error that occurred while storing a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
pub enum SetError {
    /// The payload exceeds the data region's capacity, or storing it would
    /// overwrite a range pinned by a live item handle or transaction.
    ///
    /// Pins are the sole back-pressure mechanism: the engine never blocks
    /// waiting for a pin to be released. Retry after dropping handles.
    #[snafu(display("no room left in the data region"))]
    NoRoom,

    /// The key or value size leaves the representable size domain.
    #[snafu(display("key or value size out of domain"))]
    BadSize,
}

/// Outcome of [`Cache::get_de_async`].
pub enum DeAsync<'a> {
    /// The item is present and not within its grace window.
    Found(Item<'a>),
    /// The item is missing (or about to expire) and this caller took the
    /// pending marker: it should compute and store the value.
    NotFound,
    /// Another caller is already computing the value; a blocking wait would
    /// be required to observe it.
    WouldBlock,
}

/// A validated, pinned payload range. Plain data; the pin itself is released
/// through [`Inner::release_pin`], which [`Item`] does on drop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PinnedPayload {
    pub begin: u64,
    pub key_size: u32,
    pub value_size: u32,
    pub expiry: u64,
}

/// State guarded by the engine mutex.
pub(crate) struct Core {
    /// The monotonic write cursor. Mirrored into the index header on every
    /// reservation so a flush persists it.
    cursor: u64,
    /// Live pins: reservation begin-cursor to reference count. The smallest
    /// key is the watermark reservations must not overrun.
    pins: BTreeMap<u64, usize>,
    hot: HotSet,
}

pub(crate) struct Inner {
    pub(crate) config: CacheConfig,
    pub(crate) index: IndexFile,
    pub(crate) data: DataRegion,
    core: Mutex<Core>,
    dogpile: DogpileTable,
    sync_failed: AtomicBool,
    /// Cursor up to which the data region has been flushed.
    synced_cursor: AtomicU64,
}

/// A memory-mapped, in-process key/value cache.
///
/// All operations may be called concurrently from any number of threads.
/// Dropping the cache stops the background sync worker and flushes
/// file-backed state.
pub struct Cache {
    inner: Arc<Inner>,
    flusher: Option<Flusher>,
}

impl Cache {
    /// Opens an existing cache.
    ///
    /// Fails with [`OpenError::NoSuchCache`] if any configured backing file
    /// is absent, and always for anonymous configurations, which have no
    /// files to find. Fails with [`OpenError::GeometryMismatch`], leaving
    /// the file untouched, if the data file's length does not match the
    /// configured `data_file_size`.
    pub fn open(config: &CacheConfig) -> Result<Cache, OpenError> {
        Self::open_with(config.clone(), false)
    }

    /// Opens a cache, creating any missing backing files, or a fresh
    /// anonymous cache when the configuration names no paths.
    pub fn open_or_create(config: &CacheConfig) -> Result<Cache, OpenError> {
        Self::open_with(config.clone(), true)
    }

    pub(crate) fn open_with(config: CacheConfig, force: bool) -> Result<Cache, OpenError> {
        let slot_count = config.max_items_count;
        let index_len = IndexFile::file_len(slot_count);

        let (index_backing, data_backing, fresh) = match (&config.index_file, &config.data_file) {
            (Some(index_path), Some(data_path)) => {
                // The data file's length is only reconciled under force; a
                // non-forced mismatch is reported with the file untouched.
                // It is opened first so that the report precedes any side
                // effect on the index file.
                let data =
                    open_backing_file(data_path, config.data_file_size, force, force)?;
                // The index reconciles its own length even on non-forced
                // opens: a resized index is reset to empty, like any other
                // failed header validation. A recreated or resized data file
                // invalidates every cursor the index holds, so the index
                // starts over with it.
                let index = open_backing_file(index_path, index_len, force, true)?;
                (index.backing, data.backing, index.fresh || data.fresh)
            }
            _ => {
                if !force {
                    return Err(OpenError::NoSuchCache);
                }
                let index = Backing::open_anonymous(index_len).context(IoSnafu)?;
                let data = Backing::open_anonymous(config.data_file_size).context(IoSnafu)?;
                (index, data, true)
            }
        };

        let index = IndexFile::open(index_backing, slot_count, fresh);
        let data = DataRegion::new(data_backing);
        let cursor = index.write_cursor();

        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                cursor,
                pins: BTreeMap::new(),
                // The hot set is byte-capped by the same window that drives
                // compaction: a working set that cannot fit near the head is
                // not worth re-appending.
                hot: HotSet::new(config.hot_items_count, config.hot_data_size),
            }),
            dogpile: DogpileTable::new(config.de_hashtable_size),
            sync_failed: AtomicBool::new(false),
            synced_cursor: AtomicU64::new(cursor),
            config,
            index,
            data,
        });

        let flusher = (inner.data.is_file_backed() && !inner.config.sync_interval.is_zero())
            .then(|| Flusher::spawn(Arc::clone(&inner), inner.config.sync_interval));

        debug!(
            persistent = inner.data.is_file_backed(),
            slot_count,
            data_file_size = inner.data.size(),
            write_cursor = cursor,
            "Opened cache.",
        );

        Ok(Cache { inner, flusher })
    }

    /// Looks up `key`, returning a pinned handle on hit.
    ///
    /// The handle's payload range cannot be overwritten until the handle is
    /// dropped; writes that would need the space fail with
    /// [`SetError::NoRoom`] instead.
    pub fn get(&self, key: &[u8]) -> Option<Item<'_>> {
        let fingerprint = self.inner.fingerprint(key);
        self.inner
            .acquire(fingerprint)
            .map(|payload| Item::new(&self.inner, payload))
    }

    /// Dogpile-aware lookup.
    ///
    /// A missing key (or one expiring within `grace`) is reported as a
    /// miss to exactly one caller per grace window, inviting it to compute
    /// the value. Concurrent callers finding the computation pending are
    /// served the still-resident value if there is one, and otherwise sleep
    /// (bounded by `grace`) until the first caller commits, then re-probe.
    pub fn get_de(&self, key: &[u8], grace: Duration) -> Option<Item<'_>> {
        let fingerprint = self.inner.fingerprint(key);
        self.inner
            .acquire_de(fingerprint, grace)
            .map(|payload| Item::new(&self.inner, payload))
    }

    /// Non-blocking form of [`get_de`](Cache::get_de).
    ///
    /// Where the synchronous form would sleep, this returns
    /// [`DeAsync::WouldBlock`] immediately.
    pub fn get_de_async(&self, key: &[u8], grace: Duration) -> DeAsync<'_> {
        let fingerprint = self.inner.fingerprint(key);
        let now = clock::now_ms();

        let payload = self.inner.acquire(fingerprint);
        if let Some(p) = payload {
            if clock::remaining(p.expiry, now) > grace {
                return DeAsync::Found(Item::new(&self.inner, p));
            }
        }

        let deadline = now.saturating_add(clock::ttl_to_ms(grace));
        match self.inner.dogpile.probe(fingerprint, now, deadline) {
            DeProbe::Marked => {
                if let Some(p) = payload {
                    self.inner.release_pin(p.begin);
                }
                DeAsync::NotFound
            }
            DeProbe::Pending { .. } => match payload {
                Some(p) => DeAsync::Found(Item::new(&self.inner, p)),
                None => DeAsync::WouldBlock,
            },
        }
    }

    /// Stores `value` under `key` with the given time-to-live.
    pub fn set(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), SetError> {
        let mut txn = self.begin_set(key, value.len(), ttl)?;
        txn.value_mut().copy_from_slice(value);
        txn.commit();
        Ok(())
    }

    /// Stores `value` under `key` and returns a pinned handle to the stored
    /// item, so the caller can read it back without racing later overwrites.
    pub fn set_item(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<Item<'_>, SetError> {
        let mut txn = self.begin_set(key, value.len(), ttl)?;
        txn.value_mut().copy_from_slice(value);
        Ok(txn.commit_item())
    }

    /// Begins a two-phase set: reserves space for a value of `value_size`
    /// bytes and returns a transaction exposing the reservation for the
    /// caller to fill. Nothing is visible to lookups until
    /// [`SetTxn::commit`]; dropping the transaction rolls it back.
    pub fn begin_set(
        &self,
        key: &[u8],
        value_size: usize,
        ttl: Duration,
    ) -> Result<SetTxn<'_>, SetError> {
        self.inner.begin_reservation(key, value_size, ttl)
    }

    /// Removes `key`. Returns whether a live entry was found.
    pub fn remove(&self, key: &[u8]) -> bool {
        let fingerprint = self.inner.fingerprint(key);
        let now = clock::now_ms();
        let core = self.inner.core.lock();
        let found = self.inner.index.remove(fingerprint, now);
        drop(core);
        found
    }

    /// Instantly invalidates every entry. The write cursor is not rewound;
    /// old payloads become unreferenced garbage that the cursor laps in due
    /// course.
    pub fn clear(&self) {
        {
            let mut core = self.inner.core.lock();
            self.inner.index.clear();
            core.hot.clear();
        }
        self.inner.dogpile.clear();
        debug!("Cleared cache.");
    }

    /// Flushes file-backed state to disk. A no-op for anonymous caches.
    pub fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    /// Whether any background sync has failed since the cache was opened.
    /// Failures do not poison the cache; this flag is the only trace they
    /// leave.
    pub fn last_sync_failed(&self) -> bool {
        self.inner.sync_failed.load(Ordering::Acquire)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Stop the worker before the final flush so the two cannot interleave.
        self.flusher.take();
        if let Err(error) = self.inner.sync() {
            warn!(%error, "Flush on close failed.");
        }
    }
}

impl Inner {
    pub(crate) fn fingerprint(&self, key: &[u8]) -> u64 {
        seahash::hash_seeded(
            key,
            HASH_SEED,
            FINGERPRINT_SEED_B,
            FINGERPRINT_SEED_C,
            FINGERPRINT_SEED_D,
        )
    }

    /// Looks up and pins the payload for `fingerprint`.
    pub(crate) fn acquire(&self, fingerprint: u64) -> Option<PinnedPayload> {
        let now = clock::now_ms();
        let mut core = self.core.lock();

        let Some(slot) = self.index.lookup(fingerprint, now) else {
            metrics::counter!("mmcache_misses_total", 1);
            return None;
        };

        let Some(header) = self.validate(&core, &slot) else {
            // The entry points at lapped or foreign bytes; logically erase it.
            self.index.erase(fingerprint);
            metrics::counter!("mmcache_misses_total", 1);
            return None;
        };

        let was_hot = core.hot.touch(fingerprint, slot.payload_len);
        let mut begin = slot.cursor;
        if self.should_compact(&core, &slot, was_hot) {
            if let Some(compacted) = self.compact(&mut core, &slot, now) {
                begin = compacted;
            }
        }

        *core.pins.entry(begin).or_insert(0) += 1;
        metrics::counter!("mmcache_hits_total", 1);

        Some(PinnedPayload {
            begin,
            key_size: header.key_size,
            value_size: header.value_size,
            expiry: slot.expiry,
        })
    }

    /// The synchronous dogpile-aware lookup. See [`Cache::get_de`].
    pub(crate) fn acquire_de(&self, fingerprint: u64, grace: Duration) -> Option<PinnedPayload> {
        let grace_ms = clock::ttl_to_ms(grace);
        let overall_deadline = clock::now_ms().saturating_add(grace_ms);

        loop {
            let now = clock::now_ms();
            let payload = self.acquire(fingerprint);
            if let Some(p) = &payload {
                if clock::remaining(p.expiry, now) > grace {
                    return payload;
                }
            }

            // Missing, or expiring within the grace window.
            match self
                .dogpile
                .probe(fingerprint, now, now.saturating_add(grace_ms))
            {
                DeProbe::Marked => {
                    // This caller owns the recomputation; report a miss. A
                    // near-expiry item that was acquired above is unpinned
                    // again, since the caller is expected to overwrite it.
                    if let Some(p) = payload {
                        self.release_pin(p.begin);
                    }
                    return None;
                }
                DeProbe::Pending { deadline } => {
                    if payload.is_some() {
                        // Stale but resident: serve it while the refresh is
                        // in flight.
                        return payload;
                    }
                    let until = deadline.min(overall_deadline);
                    if now >= until {
                        // Waited out the whole grace period; give up and let
                        // this caller compute too.
                        return None;
                    }
                    self.dogpile.wait(fingerprint, now, until);
                }
            }
        }
    }

    /// Reserves space for a payload and writes its header and key echo.
    pub(crate) fn begin_reservation(
        &self,
        key: &[u8],
        value_size: usize,
        ttl: Duration,
    ) -> Result<SetTxn<'_>, SetError> {
        let payload_len = total_payload_len(key.len(), value_size).ok_or(SetError::BadSize)?;
        let fingerprint = self.fingerprint(key);
        let now = clock::now_ms();
        let expiry = clock::expiry_for(now, ttl);

        let reservation = {
            let mut core = self.core.lock();
            let reservation = self.plan(&core, payload_len).ok_or(SetError::NoRoom)?;
            self.apply(&mut core, reservation);
            *core.pins.entry(reservation.begin).or_insert(0) += 1;
            reservation
        };

        // The reserved range is exclusive to this transaction until commit;
        // the header and key echo are filled in outside the lock.
        let header = PayloadHeader {
            fingerprint,
            expiry,
            key_size: key.len() as u32,
            value_size: value_size as u32,
        };
        self.data.write(reservation.begin, &header.encode());
        self.data
            .write(reservation.begin + PAYLOAD_HEADER_LEN as u64, key);

        Ok(SetTxn::new(self, header, reservation.begin))
    }

    /// Installs the index entry for a filled reservation. With `keep_pin`
    /// the internal pin survives (transferred to a caller-visible item);
    /// otherwise it is released here.
    pub(crate) fn commit_reservation(&self, header: &PayloadHeader, begin: u64, keep_pin: bool) {
        let now = clock::now_ms();
        let payload_len = PAYLOAD_HEADER_LEN as u64
            + u64::from(header.key_size)
            + u64::from(header.value_size);

        {
            let mut core = self.core.lock();
            let evicted = self.index.insert(
                Slot {
                    fingerprint: header.fingerprint,
                    cursor: begin,
                    expiry: header.expiry,
                    payload_len,
                },
                now,
            );
            if evicted {
                metrics::counter!("mmcache_index_evictions_total", 1);
            }
            if !keep_pin {
                release_pin_locked(&mut core, begin);
            }
        }

        // Wake anyone serialized behind this key's pending marker.
        self.dogpile.complete(header.fingerprint);
    }

    /// Rewrites a reservation's in-band header; used when a transaction
    /// shrinks its value before commit.
    pub(crate) fn rewrite_header(&self, begin: u64, header: &PayloadHeader) {
        self.data.write(begin, &header.encode());
    }

    pub(crate) fn release_pin(&self, begin: u64) {
        let mut core = self.core.lock();
        release_pin_locked(&mut core, begin);
    }

    /// Re-checks an index entry against the bytes it points at. `None` means
    /// the entry is stale: lapped by the cursor, inconsistent with the
    /// in-band header, or geometrically impossible.
    fn validate(&self, core: &Core, slot: &Slot) -> Option<PayloadHeader> {
        let size = self.data.size();

        let end = slot.cursor.checked_add(slot.payload_len)?;
        if slot.payload_len < PAYLOAD_HEADER_LEN as u64
            || slot.payload_len > size
            || end > core.cursor
            || core.cursor - slot.cursor > size
            || self.data.offset_of(slot.cursor) as u64 + slot.payload_len > size
        {
            return None;
        }

        let mut buf = [0; PAYLOAD_HEADER_LEN];
        self.data.read(slot.cursor, &mut buf);
        let header = PayloadHeader::decode(&buf);
        match header.verify(slot.fingerprint, slot.expiry, slot.payload_len) {
            PayloadStatus::Valid => Some(header),
            PayloadStatus::Stale => None,
        }
    }

    fn should_compact(&self, core: &Core, slot: &Slot, was_hot: bool) -> bool {
        let window = self.config.hot_data_size;
        window > 0
            && core.cursor - slot.cursor > window
            && (self.config.hot_items_count == 0 || was_hot)
    }

    /// Re-appends a hot payload near the write head and repoints its index
    /// entry. Best-effort: skipped when the reservation fails or when the
    /// cursor advance would lap the source bytes mid-copy.
    fn compact(&self, core: &mut Core, slot: &Slot, now: u64) -> Option<u64> {
        let reservation = self.plan(core, slot.payload_len)?;
        if reservation.new_cursor - slot.cursor > self.data.size() {
            return None;
        }

        self.apply(core, reservation);
        self.data.copy(slot.cursor, reservation.begin, slot.payload_len);
        self.index.insert(
            Slot {
                cursor: reservation.begin,
                ..*slot
            },
            now,
        );

        metrics::counter!("mmcache_compactions_total", 1);
        trace!(
            fingerprint = slot.fingerprint,
            from = slot.cursor,
            to = reservation.begin,
            "Re-appended hot payload near the write head.",
        );
        Some(reservation.begin)
    }

    /// Plans a cursor advance of `len` bytes, honoring the hot-cache
    /// residual and the pin watermark. Does not mutate anything.
    fn plan(&self, core: &Core, len: u64) -> Option<Reservation> {
        let max_len = if self.config.hot_data_size > 0 {
            self.data.size() - self.config.hot_data_size
        } else {
            self.data.size()
        };

        let reservation = self.data.plan(core.cursor, len, max_len)?;
        if let Some((&oldest_pin, _)) = core.pins.first_key_value() {
            if reservation.new_cursor - oldest_pin > self.data.size() {
                return None;
            }
        }
        Some(reservation)
    }

    fn apply(&self, core: &mut Core, reservation: Reservation) {
        core.cursor = reservation.new_cursor;
        self.index.set_write_cursor(reservation.new_cursor);
    }

    /// Flushes the dirty cursor window of the data region and the whole
    /// index file.
    pub(crate) fn sync(&self) -> io::Result<()> {
        let cursor = self.core.lock().cursor;
        let synced = self.synced_cursor.load(Ordering::Acquire);

        self.data.flush_window(synced, cursor)?;
        self.index.flush()?;
        self.synced_cursor.store(cursor, Ordering::Release);

        trace!(synced_from = synced, synced_to = cursor, "Flushed cache state.");
        Ok(())
    }

    /// Background-worker flavor of [`sync`](Inner::sync): failures are
    /// recorded, never propagated, so they cannot poison the cache.
    pub(crate) fn background_sync(&self) {
        if let Err(error) = self.sync() {
            warn!(%error, "Background sync failed.");
            metrics::counter!("mmcache_sync_failures_total", 1);
            self.sync_failed.store(true, Ordering::Release);
        }
    }
}

fn release_pin_locked(core: &mut Core, begin: u64) {
    if let Some(count) = core.pins.get_mut(&begin) {
        *count -= 1;
        if *count == 0 {
            core.pins.remove(&begin);
        }
    } else {
        debug_assert!(false, "released a pin that was never acquired");
    }
}

struct OpenedFile {
    backing: Backing,
    fresh: bool,
}

fn open_backing_file(
    path: &std::path::Path,
    len: u64,
    create: bool,
    reconcile: bool,
) -> Result<OpenedFile, OpenError> {
    match Backing::open_file(path, len, create, reconcile) {
        Ok(outcome) => Ok(OpenedFile {
            backing: outcome.backing,
            fresh: outcome.fresh,
        }),
        Err(OpenFileError::Io { source }) if source.kind() == io::ErrorKind::NotFound => {
            Err(OpenError::NoSuchCache)
        }
        Err(OpenFileError::Io { source }) => Err(OpenError::Io { source }),
        Err(OpenFileError::Mismatch { actual, expected }) => {
            Err(OpenError::GeometryMismatch { actual, expected })
        }
    }
}
