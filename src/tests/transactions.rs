use super::{anonymous_cache, expect_hit, expect_miss};
use crate::{SetError, MAX_TTL};

#[test]
fn rollback_leaves_no_entry() {
    let cache = anonymous_cache();

    let txn = cache
        .begin_set(b"abc", 6, MAX_TTL)
        .expect("reservation succeeds");

    // Nothing is visible while the transaction is in flight.
    expect_miss(&cache, b"abc");

    txn.rollback();
    expect_miss(&cache, b"abc");
}

#[test]
fn dropping_an_unfinished_transaction_rolls_back() {
    let cache = anonymous_cache();

    {
        let mut txn = cache
            .begin_set(b"abc", 6, MAX_TTL)
            .expect("reservation succeeds");
        txn.value_mut().copy_from_slice(b"qwerty");
    }

    expect_miss(&cache, b"abc");
}

#[test]
fn commit_makes_the_entry_visible() {
    let cache = anonymous_cache();

    let mut txn = cache
        .begin_set(b"abc", 6, MAX_TTL)
        .expect("reservation succeeds");
    assert_eq!(txn.value_size(), 6);
    txn.value_mut().copy_from_slice(b"qwerty");
    txn.commit();

    expect_hit(&cache, b"abc", b"qwerty");
}

#[test]
fn commit_item_transfers_the_pin() {
    let cache = anonymous_cache();

    let mut txn = cache
        .begin_set(b"abc", 6, MAX_TTL)
        .expect("reservation succeeds");
    txn.value_mut().copy_from_slice(b"qwerty");

    let item = txn.commit_item();
    assert_eq!(item.key(), b"abc");
    assert_eq!(item.value(), b"qwerty");
    drop(item);

    expect_hit(&cache, b"abc", b"qwerty");
}

#[test]
fn update_value_size_shrinks_the_reservation() {
    let cache = anonymous_cache();

    let mut txn = cache
        .begin_set(b"abc", 16, MAX_TTL)
        .expect("reservation succeeds");
    txn.value_mut()[..6].copy_from_slice(b"qwerty");

    txn.update_value_size(6);
    assert_eq!(txn.value_size(), 6);

    // Growing back is ignored.
    txn.update_value_size(16);
    assert_eq!(txn.value_size(), 6);

    txn.commit();
    expect_hit(&cache, b"abc", b"qwerty");
}

#[test]
fn oversized_dimensions_are_rejected() {
    let cache = anonymous_cache();

    assert_eq!(
        cache.begin_set(b"abc", usize::MAX, MAX_TTL).err(),
        Some(SetError::BadSize),
    );
    assert_eq!(
        cache.begin_set(b"abc", usize::MAX / 2, MAX_TTL).err(),
        Some(SetError::BadSize),
    );
}

#[test]
fn zero_sized_value_transaction() {
    let cache = anonymous_cache();

    let mut txn = cache
        .begin_set(b"empty", 0, MAX_TTL)
        .expect("reservation succeeds");
    assert!(txn.value_mut().is_empty());
    txn.commit();

    expect_hit(&cache, b"empty", b"");
}

#[test]
fn interleaved_transactions_stay_isolated() {
    let cache = anonymous_cache();

    let mut txn1 = cache
        .begin_set(b"foo", 6, MAX_TTL)
        .expect("first reservation succeeds");
    let mut txn2 = cache
        .begin_set(b"barz", 5, MAX_TTL)
        .expect("second reservation succeeds");

    txn1.value_mut().copy_from_slice(b"123456");
    txn2.value_mut().copy_from_slice(b"qwert");

    expect_miss(&cache, b"foo");
    expect_miss(&cache, b"barz");

    let item1 = txn1.commit_item();
    let item2 = txn2.commit_item();

    assert_eq!(item1.value(), b"123456");
    assert_eq!(item2.value(), b"qwert");
    drop((item1, item2));

    expect_hit(&cache, b"foo", b"123456");
    expect_hit(&cache, b"barz", b"qwert");
}
