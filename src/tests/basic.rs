use std::{thread, time::Duration};

use super::{anonymous_cache, expect_hit, expect_miss, set_and_check, sized_cache};
use crate::{Cache, CacheConfig, OpenError, MAX_TTL};

#[test]
fn anonymous_cache_requires_force() {
    let config = CacheConfig::default();

    assert!(matches!(
        Cache::open(&config),
        Err(OpenError::NoSuchCache)
    ));
    drop(Cache::open_or_create(&config).expect("forced open of anonymous cache"));
}

#[test]
fn item_ops_round_trip() {
    let cache = anonymous_cache();

    for i in 0u64..300 {
        expect_miss(&cache, &i.to_le_bytes());
    }

    for i in 0u64..300 {
        let key = i.to_le_bytes();
        set_and_check(&cache, &key, &key);

        let item = cache
            .set_item(&key, &key, MAX_TTL)
            .expect("set_item succeeds");
        assert_eq!(item.value(), key);
        drop(item);

        assert!(cache.remove(&key), "entry just stored should be removable");
        expect_miss(&cache, &key);
        assert!(!cache.remove(&key), "second remove finds nothing");
    }

    for i in 0u64..300 {
        expect_miss(&cache, &i.to_le_bytes());
    }
}

#[test]
fn zero_length_keys_and_values() {
    let cache = anonymous_cache();

    set_and_check(&cache, b"", b"qwerty");
    set_and_check(&cache, b"abc", b"");
    set_and_check(&cache, b"", b"");
}

#[test]
fn entries_expire_lazily() {
    let cache = anonymous_cache();

    cache
        .set(b"aaa", b"1234", Duration::from_millis(200))
        .expect("set succeeds");
    expect_hit(&cache, b"aaa", b"1234");

    thread::sleep(Duration::from_millis(300));
    expect_miss(&cache, b"aaa");
}

#[test]
fn ttl_is_visible_on_the_item() {
    let cache = anonymous_cache();

    cache
        .set(b"k", b"v", Duration::from_secs(3600))
        .expect("set succeeds");
    let item = cache.get(b"k").expect("hit");
    assert!(item.ttl() <= Duration::from_secs(3600));
    assert!(item.ttl() > Duration::from_secs(3500));

    cache.set(b"forever", b"v", MAX_TTL).expect("set succeeds");
    let item = cache.get(b"forever").expect("hit");
    assert_eq!(item.ttl(), MAX_TTL);
}

#[test]
fn clear_invalidates_everything() {
    let cache = sized_cache(1000, 128 * 1024);

    for i in 0u64..500 {
        let key = i.to_le_bytes();
        set_and_check(&cache, &key, &key);
    }

    cache.clear();

    for i in 0u64..500 {
        expect_miss(&cache, &i.to_le_bytes());
    }

    // The cache accepts new writes after a clear.
    set_and_check(&cache, b"fresh", b"start");
}

#[test]
fn overlapped_acquisitions_of_one_key() {
    let cache = anonymous_cache();
    let key = b"aaaabbb";
    let value = b"payload!";

    let added: Vec<_> = (0..100)
        .map(|_| {
            cache
                .set_item(key, value, MAX_TTL)
                .expect("set_item succeeds")
        })
        .collect();

    let obtained: Vec<_> = (0..100)
        .map(|_| cache.get(key).expect("hit while handles are live"))
        .collect();

    for item in added.iter().chain(obtained.iter()) {
        assert_eq!(item.value(), value);
    }

    // Release in an order unrelated to acquisition.
    for item in obtained.into_iter().rev() {
        drop(item);
    }
    drop(added);

    expect_hit(&cache, key, value);
}
