/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `since_unix_ms` lies more than `max_age_ms` before `now_unix_ms`.
/// A zero `max_age_ms` disables expiry.
pub fn is_older_than(since_unix_ms: u64, max_age_ms: u64, now_unix_ms: u64) -> bool {
    if max_age_ms == 0 {
        return false;
    }
    now_unix_ms.saturating_sub(since_unix_ms) > max_age_ms
}
