//! Monotonic sequence numbers that order materializations per user.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use daffodil_core::Sequence;

/// Hands out strictly increasing sequences, tracking wall-clock microseconds
/// when the clock is ahead of the last value issued.
#[derive(Debug)]
pub struct SequenceSource {
    last: AtomicU64,
}

impl SequenceSource {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Every sequence issued will be greater than `floor`.
    pub fn starting_after(floor: u64) -> Self {
        Self {
            last: AtomicU64::new(floor),
        }
    }

    pub fn next(&self) -> Sequence {
        let now = now_micros();
        let mut issued = 0;
        // fetch_update only fails when the closure returns None.
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                issued = prev.saturating_add(1).max(now);
                Some(issued)
            });
        Sequence(issued)
    }

    pub fn last_issued(&self) -> Sequence {
        Sequence(self.last.load(Ordering::SeqCst))
    }
}

impl Default for SequenceSource {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let source = SequenceSource::new();
        let mut prev = source.next();
        for _ in 0..1000 {
            let next = source.next();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(source.last_issued(), prev);
    }

    #[test]
    fn test_seeded_from_clock() {
        let before = now_micros();
        let seq = SequenceSource::new().next();
        assert!(seq.0 >= before);
    }

    #[test]
    fn test_floor_ahead_of_clock() {
        let floor = now_micros() + 10_000_000;
        let source = SequenceSource::starting_after(floor);
        assert_eq!(source.next(), Sequence(floor + 1));
        assert_eq!(source.next(), Sequence(floor + 2));
    }

    #[test]
    fn test_unique_across_threads() {
        let source = Arc::new(SequenceSource::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = source.clone();
                std::thread::spawn(move || (0..500).map(|_| source.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq));
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
