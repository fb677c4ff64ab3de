use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Expiration timestamp that never expires.
pub(crate) const NEVER: u64 = u64::MAX;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Expirations are stored as absolute wall-clock timestamps so that persisted
/// entries keep their meaning across process restarts. A clock before the
/// epoch collapses to zero, which merely expires everything.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Converts a TTL into milliseconds, saturating at [`NEVER`].
pub(crate) fn ttl_to_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(NEVER)
}

/// Absolute expiration for an item stored now with the given TTL.
pub(crate) fn expiry_for(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl_to_ms(ttl))
}

/// Remaining lifetime of an entry expiring at `expiry`.
pub(crate) fn remaining(expiry: u64, now: u64) -> Duration {
    if expiry == NEVER {
        Duration::MAX
    } else {
        Duration::from_millis(expiry.saturating_sub(now))
    }
}
