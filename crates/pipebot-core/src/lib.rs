//! Low-level helpers shared by pipebot crates.
//!
//! Provides versioned JSON state files, unix time helpers, and the HTTP retry
//! primitives used by the Bitbucket and Slack API clients.

pub mod http_retry;
pub mod state_file;
pub mod time_utils;

pub use http_retry::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
pub use state_file::{load_state, save_state, StateFileError, VersionedState};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_older_than};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_time_helpers_agree_on_seconds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn unit_is_older_than_treats_zero_max_age_as_unbounded() {
        assert!(!is_older_than(0, 0, 10_000));
        assert!(is_older_than(1_000, 500, 2_000));
        assert!(!is_older_than(1_000, 5_000, 2_000));
    }
}
