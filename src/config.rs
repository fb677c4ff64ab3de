use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::Snafu;

// Defaults are deliberately modest: a cache nobody configured should still be
// useful for a few hundred thousand small items without surprising anyone on
// disk space.
pub const DEFAULT_MAX_ITEMS_COUNT: usize = 64 * 1024;
pub const DEFAULT_DATA_FILE_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_HOT_ITEMS_COUNT: usize = 1024;
pub const DEFAULT_HOT_DATA_SIZE: u64 = 0;
pub const DEFAULT_DE_HASHTABLE_SIZE: usize = 256;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Path to the persistent index file, if any.
    pub(crate) index_file: Option<PathBuf>,

    /// Path to the persistent data file, if any.
    pub(crate) data_file: Option<PathBuf>,

    /// Index slot count, already rounded up to a power of two.
    pub(crate) max_items_count: usize,

    /// Size, in bytes, of the circular data arena.
    pub(crate) data_file_size: u64,

    /// Cap on the hot-cache fingerprint set; zero disables hot tracking.
    pub(crate) hot_items_count: usize,

    /// Cap on hot-cache bytes; zero disables compaction.
    pub(crate) hot_data_size: u64,

    /// Slot count for the dogpile-effect coordinator.
    pub(crate) de_hashtable_size: usize,

    /// Background flush period; zero disables the sync worker.
    pub(crate) sync_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            index_file: None,
            data_file: None,
            max_items_count: DEFAULT_MAX_ITEMS_COUNT,
            data_file_size: DEFAULT_DATA_FILE_SIZE,
            hot_items_count: DEFAULT_HOT_ITEMS_COUNT,
            hot_data_size: DEFAULT_HOT_DATA_SIZE,
            de_hashtable_size: DEFAULT_DE_HASHTABLE_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Returns `true` if the cache is backed by files rather than anonymous
    /// mappings.
    pub fn is_persistent(&self) -> bool {
        self.index_file.is_some()
    }

    /// Deletes the backing files of a persistent cache.
    ///
    /// Files that do not exist are skipped silently, so removing the same
    /// cache twice is not an error. Anonymous configurations are a no-op.
    pub fn remove_files(&self) -> io::Result<()> {
        for path in [self.index_file.as_deref(), self.data_file.as_deref()]
            .into_iter()
            .flatten()
        {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Clone, Debug, Default)]
pub struct CacheConfigBuilder {
    index_file: Option<PathBuf>,
    data_file: Option<PathBuf>,
    max_items_count: Option<usize>,
    data_file_size: Option<u64>,
    hot_items_count: Option<usize>,
    hot_data_size: Option<u64>,
    de_hashtable_size: Option<usize>,
    sync_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Sets the path of the persistent index file.
    ///
    /// Both `index_file` and `data_file` must be set for the cache to be
    /// persistent; setting only one is a build error.
    pub fn index_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.index_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the path of the persistent data file.
    pub fn data_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the maximum number of items the index can address.
    ///
    /// Rounded up to the next power of two. Defaults to 65,536.
    pub fn max_items_count(mut self, count: usize) -> Self {
        self.max_items_count = Some(count);
        self
    }

    /// Sets the size, in bytes, of the circular data arena.
    ///
    /// Values whose combined payload exceeds this size can never be stored.
    /// Defaults to 64MB.
    pub fn data_file_size(mut self, size: u64) -> Self {
        self.data_file_size = Some(size);
        self
    }

    /// Sets the cap on the hot-cache fingerprint set. Zero disables hot-item
    /// tracking, which makes every entry eligible for compaction.
    ///
    /// Defaults to 1,024.
    pub fn hot_items_count(mut self, count: usize) -> Self {
        self.hot_items_count = Some(count);
        self
    }

    /// Sets the byte distance behind the write head within which data counts
    /// as hot. Entries trailing farther than this are re-appended near the
    /// head when read. The same figure budgets the hot set's resident bytes:
    /// when the tracked payloads outgrow it, the coldest fingerprints are
    /// shed and stop being re-appended. Zero disables compaction.
    ///
    /// Defaults to zero.
    pub fn hot_data_size(mut self, size: u64) -> Self {
        self.hot_data_size = Some(size);
        self
    }

    /// Sets the slot count of the dogpile-effect coordinator table.
    ///
    /// Unrelated keys hashing to the same slot occasionally serialize each
    /// other; a few hundred slots are plenty for most workloads. Defaults
    /// to 256.
    pub fn de_hashtable_size(mut self, size: usize) -> Self {
        self.de_hashtable_size = Some(size);
        self
    }

    /// Sets the background flush period for persistent caches.
    ///
    /// The interval effectively controls the acceptable window of data loss:
    /// entries written since the last flush may not survive a process crash.
    /// Zero disables the sync worker entirely, leaving only the flush on
    /// close. Defaults to 10s.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Consumes this builder and constructs a [`CacheConfig`].
    pub fn build(self) -> Result<CacheConfig, BuildError> {
        let max_items_count = self.max_items_count.unwrap_or(DEFAULT_MAX_ITEMS_COUNT);
        let data_file_size = self.data_file_size.unwrap_or(DEFAULT_DATA_FILE_SIZE);
        let hot_items_count = self.hot_items_count.unwrap_or(DEFAULT_HOT_ITEMS_COUNT);
        let hot_data_size = self.hot_data_size.unwrap_or(DEFAULT_HOT_DATA_SIZE);
        let de_hashtable_size = self.de_hashtable_size.unwrap_or(DEFAULT_DE_HASHTABLE_SIZE);
        let sync_interval = self.sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL);

        if max_items_count == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_items_count",
                reason: "cannot be zero".to_string(),
            });
        }

        if data_file_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "data_file_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if usize::try_from(data_file_size).is_err() {
            return Err(BuildError::InvalidParameter {
                param_name: "data_file_size",
                reason: "does not fit the address space".to_string(),
            });
        }

        if hot_data_size >= data_file_size {
            return Err(BuildError::InvalidParameter {
                param_name: "hot_data_size",
                reason: format!("must be smaller than data_file_size ({data_file_size} bytes)"),
            });
        }

        if de_hashtable_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "de_hashtable_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if self.index_file.is_some() != self.data_file.is_some() {
            return Err(BuildError::InvalidParameter {
                param_name: "index_file",
                reason: "index_file and data_file must be set together".to_string(),
            });
        }

        let max_items_count = max_items_count.next_power_of_two();

        Ok(CacheConfig {
            index_file: self.index_file,
            data_file: self.data_file,
            max_items_count,
            data_file_size,
            hot_items_count,
            hot_data_size,
            de_hashtable_size,
            sync_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::CacheConfig;

    #[test]
    fn paths_must_come_in_pairs() {
        let result = CacheConfig::builder().index_file("/tmp/only.index").build();
        assert!(result.is_err());

        let result = CacheConfig::builder().data_file("/tmp/only.data").build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(CacheConfig::builder().data_file_size(0).build().is_err());
        assert!(CacheConfig::builder().max_items_count(0).build().is_err());
        assert!(CacheConfig::builder().de_hashtable_size(0).build().is_err());
        assert!(CacheConfig::builder()
            .data_file_size(1024)
            .hot_data_size(1024)
            .build()
            .is_err());
    }

    proptest! {
        #[test]
        fn slot_count_rounds_to_power_of_two(count in 1usize..1_000_000) {
            let config = CacheConfig::builder()
                .max_items_count(count)
                .build()
                .expect("valid parameters");

            prop_assert!(config.max_items_count.is_power_of_two());
            prop_assert!(config.max_items_count >= count);
            prop_assert!(config.max_items_count < count * 2);
        }

        #[test]
        fn hot_data_size_bounded_by_arena(data in 2u64..1_000_000, hot in 1u64..2_000_000) {
            let result = CacheConfig::builder()
                .data_file_size(data)
                .hot_data_size(hot)
                .build();

            prop_assert_eq!(result.is_ok(), hot < data);
        }
    }
}
