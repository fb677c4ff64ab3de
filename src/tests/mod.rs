use crate::{Cache, CacheConfig, MAX_TTL};

mod basic;
mod concurrency;
mod transactions;

/// Opt-in log output for debugging test failures: run with `TEST_LOG=debug`.
#[allow(dead_code)]
pub(crate) fn trace_init() {
    if std::env::var_os("TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("TEST_LOG"))
            .try_init();
    }
}

/// An anonymous cache with default sizing, for tests that only need behavior.
pub(crate) fn anonymous_cache() -> Cache {
    Cache::open_or_create(&CacheConfig::default()).expect("anonymous cache opens under force")
}

/// An anonymous cache with explicit geometry.
pub(crate) fn sized_cache(max_items: usize, data_size: u64) -> Cache {
    let config = CacheConfig::builder()
        .max_items_count(max_items)
        .data_file_size(data_size)
        .build()
        .expect("valid configuration");
    Cache::open_or_create(&config).expect("anonymous cache opens under force")
}

pub(crate) fn expect_hit(cache: &Cache, key: &[u8], value: &[u8]) {
    let item = cache.get(key).expect("expected a hit");
    assert_eq!(item.key(), key, "stored key echo mismatch");
    assert_eq!(item.value(), value, "stored value mismatch");
}

pub(crate) fn expect_miss(cache: &Cache, key: &[u8]) {
    assert!(cache.get(key).is_none(), "unexpected hit");
}

/// Stores `value` under `key` with no expiration and verifies it reads back.
pub(crate) fn set_and_check(cache: &Cache, key: &[u8], value: &[u8]) {
    cache.set(key, value, MAX_TTL).expect("set succeeds");
    expect_hit(cache, key, value);
}
