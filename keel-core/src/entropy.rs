//! Cheap entropy for timeout jitter and request tokens.
//!
//! Raft only needs enough randomness to break election ties and to key
//! in-flight requests, so a hash of the monotonic-ish system clock mixed
//! with a process-wide counter is sufficient. No cryptographic strength
//! is implied anywhere these values are used.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A 64-bit token. Distinct across calls within a process even when the
/// clock does not advance between them.
pub fn random_u64() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    SEQUENCE.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    hasher.finish()
}

/// A duration drawn from `[min, max)`. Returns `min` when the range is
/// empty.
pub fn duration_in_range(min: Duration, max: Duration) -> Duration {
    let span = max.as_millis().saturating_sub(min.as_millis());
    if span == 0 {
        return min;
    }
    let offset = random_u64() % span as u64;
    min + Duration::from_millis(offset)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_distinct() {
        let a = random_u64();
        let b = random_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn duration_stays_in_range() {
        let min = Duration::from_millis(250);
        let max = Duration::from_millis(400);
        for _ in 0..100 {
            let d = duration_in_range(min, max);
            assert!(d >= min && d < max, "jitter {d:?} outside [{min:?}, {max:?})");
        }
    }

    #[test]
    fn empty_range_returns_min() {
        let d = duration_in_range(Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(d, Duration::from_millis(50));
    }
}
