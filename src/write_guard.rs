//! Process-wide write discipline for outbound register writes.
//!
//! Every write that reaches the field bus passes through [`WriteGuard`]: it
//! dedupes unchanged values, enforces a minimum interval per register, and
//! caps the total number of accepted writes in any rolling one-second
//! window. The guard's lock is held across the actual write, making it the
//! single serialization point for writes across all units.

use crate::error::EdgeError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const MIN_INTERVAL_PER_REGISTER: Duration = Duration::from_millis(250);
const MAX_WRITES_PER_SEC: u32 = 5;

struct GuardState {
    last_value: HashMap<u16, i32>,
    last_write_ts: HashMap<u16, Instant>,
    window_start: Option<Instant>,
    window_count: u32,
}

impl GuardState {
    fn new() -> Self {
        Self {
            last_value: HashMap::new(),
            last_write_ts: HashMap::new(),
            window_start: None,
            window_count: 0,
        }
    }
}

/// Outcome of a guarded write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write action ran and the register's last-known value was updated.
    Accepted,
    /// The value was identical to the last accepted write.
    DedupedUnchanged,
    /// Less than the minimum interval has elapsed since the last write to this register.
    ThrottledInterval,
    /// The global rolling rate cap has been reached.
    ThrottledRateLimit,
}

impl WriteOutcome {
    /// Whether the underlying write action was actually invoked.
    pub fn was_accepted(self) -> bool {
        matches!(self, WriteOutcome::Accepted)
    }
}

static GUARD: Lazy<Mutex<GuardState>> = Lazy::new(|| Mutex::new(GuardState::new()));

/// Process-wide write-discipline singleton.
///
/// This mirrors a resource class shared by every unit's field-bus adapter:
/// the write budget is global, not per-unit, so the guard itself has no
/// per-instance state.
pub struct WriteGuard;

impl WriteGuard {
    /// Attempt a guarded write to `address`. `write_fn` runs while the
    /// guard's lock is held, so it is only invoked when the write is
    /// accepted; if it returns an error the value is *not* latched, so the
    /// next attempt is retried rather than silently dropped.
    pub async fn attempt<F, Fut>(address: u16, value: i32, write_fn: F) -> Result<WriteOutcome, EdgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), EdgeError>>,
    {
        let mut state = GUARD.lock().await;
        let now = Instant::now();

        match state.window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(1) => {}
            _ => {
                state.window_start = Some(now);
                state.window_count = 0;
            }
        }

        if state.last_value.get(&address) == Some(&value) {
            return Ok(WriteOutcome::DedupedUnchanged);
        }

        if let Some(last_ts) = state.last_write_ts.get(&address) {
            if now.duration_since(*last_ts) < MIN_INTERVAL_PER_REGISTER {
                return Ok(WriteOutcome::ThrottledInterval);
            }
        }

        if state.window_count >= MAX_WRITES_PER_SEC {
            return Ok(WriteOutcome::ThrottledRateLimit);
        }

        write_fn().await?;

        state.last_value.insert(address, value);
        state.last_write_ts.insert(address, now);
        state.window_count += 1;
        Ok(WriteOutcome::Accepted)
    }

    /// Test-only: clear all guard state so tests don't interfere with each other.
    #[cfg(test)]
    pub async fn reset_for_test() {
        let mut state = GUARD.lock().await;
        *state = GuardState::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    // The guard is a process-wide singleton; serialize tests against it.
    static TEST_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

    #[tokio::test]
    async fn test_dedup_same_value() {
        let _guard = TEST_LOCK.lock().await;
        WriteGuard::reset_for_test().await;

        let first = WriteGuard::attempt(100, 7, || async { Ok(()) }).await.unwrap();
        assert_eq!(first, WriteOutcome::Accepted);

        let second = WriteGuard::attempt(100, 7, || async { Ok(()) }).await.unwrap();
        assert_eq!(second, WriteOutcome::DedupedUnchanged);
    }

    #[tokio::test]
    async fn test_interval_throttle_then_accept() {
        let _guard = TEST_LOCK.lock().await;
        WriteGuard::reset_for_test().await;

        WriteGuard::attempt(101, 1, || async { Ok(()) }).await.unwrap();
        let throttled = WriteGuard::attempt(101, 2, || async { Ok(()) }).await.unwrap();
        assert_eq!(throttled, WriteOutcome::ThrottledInterval);

        tokio::time::sleep(Duration::from_millis(260)).await;
        let accepted = WriteGuard::attempt(101, 2, || async { Ok(()) }).await.unwrap();
        assert_eq!(accepted, WriteOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_global_rate_cap() {
        let _guard = TEST_LOCK.lock().await;
        WriteGuard::reset_for_test().await;

        for addr in 200..205u16 {
            let outcome = WriteGuard::attempt(addr, 1, || async { Ok(()) }).await.unwrap();
            assert_eq!(outcome, WriteOutcome::Accepted);
        }
        // A 6th distinct register in the same window should be rate limited.
        let sixth = WriteGuard::attempt(205, 1, || async { Ok(()) }).await.unwrap();
        assert_eq!(sixth, WriteOutcome::ThrottledRateLimit);
    }

    #[tokio::test]
    async fn test_write_error_does_not_latch() {
        let _guard = TEST_LOCK.lock().await;
        WriteGuard::reset_for_test().await;

        let result = WriteGuard::attempt(300, 9, || async { Err(EdgeError::field_bus("boom")) }).await;
        assert!(result.is_err());

        // Since the failed write never latched, the same value is retried (accepted) next time.
        let retry = WriteGuard::attempt(300, 9, || async { Ok(()) }).await.unwrap();
        assert_eq!(retry, WriteOutcome::Accepted);
    }
}
