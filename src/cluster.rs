//! Cluster sharding over independent caches.
//!
//! A [`Cluster`] owns `N` caches and routes every key to one of them by a
//! keyed hash. The shard hash uses its own fixed seed, distinct from the
//! index fingerprint seed, so member choice and in-cache slot probing stay
//! decorrelated.

use crate::{
    cache::{Cache, OpenError},
    config::CacheConfig,
};

// Seeds for the shard hash. Unrelated to the fingerprint seeds on purpose.
const SHARD_SEED_A: u64 = 0x8f2e_a1b3_55c6_d9e1;
const SHARD_SEED_B: u64 = 0x1b87_3c5d_9a04_f6e2;
const SHARD_SEED_C: u64 = 0x63a4_29d8_e7b5_0f13;
const SHARD_SEED_D: u64 = 0xd501_76c2_48e9_ab34;

/// A fixed set of caches sharded by key hash.
pub struct Cluster {
    caches: Vec<Cache>,
}

impl Cluster {
    /// Opens every member cache, failing if any backing file is absent.
    pub fn open(configs: &[CacheConfig]) -> Result<Cluster, OpenError> {
        Self::open_with(configs, false)
    }

    /// Opens every member cache, creating missing backing files (and
    /// anonymous members) as needed.
    pub fn open_or_create(configs: &[CacheConfig]) -> Result<Cluster, OpenError> {
        Self::open_with(configs, true)
    }

    /// All-or-nothing open: the first member that fails aborts the whole
    /// open, and members opened so far are closed again on the way out.
    fn open_with(configs: &[CacheConfig], force: bool) -> Result<Cluster, OpenError> {
        if configs.is_empty() {
            return Err(OpenError::NoSuchCache);
        }

        let mut caches = Vec::with_capacity(configs.len());
        for config in configs {
            // Dropping `caches` on the error path closes the members that
            // already opened.
            caches.push(Cache::open_with(config.clone(), force)?);
        }

        debug!(members = caches.len(), "Opened cache cluster.");
        Ok(Cluster { caches })
    }

    /// Number of member caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// The member cache responsible for `key`. Deterministic: the same key
    /// always routes to the same member.
    pub fn get_cache(&self, key: &[u8]) -> &Cache {
        let shard = seahash::hash_seeded(key, SHARD_SEED_A, SHARD_SEED_B, SHARD_SEED_C, SHARD_SEED_D)
            % self.caches.len() as u64;
        &self.caches[shard as usize]
    }

    /// Clears every member cache.
    pub fn clear(&self) {
        for cache in &self.caches {
            cache.clear();
        }
    }
}
