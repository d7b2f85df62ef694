//! Trailing-edge throttle over a push stream

use std::time::{Duration, Instant};

/// Folding of two consecutive stream items into one
pub trait Coalesce {
    /// Combine `self` with the `newer` item that followed it
    fn coalesce(self, newer: Self) -> Self;
}

/// Trailing-edge throttle
///
/// The first item after a quiet window passes straight through. Items that
/// arrive inside the window are folded into one pending item, released by
/// [`poll`](Self::poll) once the window has elapsed or by [`flush`](Self::flush).
/// Time is passed in so callers decide where ticks come from.
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_release: Option<Instant>,
    pending: Option<T>,
}

impl<T: Coalesce> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_release: None,
            pending: None,
        }
    }

    /// Offer an item; returns it (possibly coalesced) if it may go out now
    pub fn offer(&mut self, item: T, now: Instant) -> Option<T> {
        let item = match self.pending.take() {
            Some(pending) => pending.coalesce(item),
            None => item,
        };

        if self.is_open(now) {
            self.last_release = Some(now);
            Some(item)
        } else {
            self.pending = Some(item);
            None
        }
    }

    /// Release the pending item if its window has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_none() || !self.is_open(now) {
            return None;
        }
        self.last_release = Some(now);
        self.pending.take()
    }

    /// Release the pending item regardless of the window
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending item becomes releasable
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(match self.last_release {
            Some(at) => at + self.window,
            None => Instant::now(),
        })
    }

    fn is_open(&self, now: Instant) -> bool {
        match self.last_release {
            Some(at) => now.saturating_duration_since(at) >= self.window,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Batch(Vec<u32>);

    impl Coalesce for Batch {
        fn coalesce(mut self, newer: Self) -> Self {
            self.0.extend(newer.0);
            self
        }
    }

    #[test]
    fn test_first_item_passes_immediately() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let now = Instant::now();
        assert_eq!(throttle.offer(Batch(vec![1]), now), Some(Batch(vec![1])));
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_burst_is_coalesced_on_trailing_edge() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(throttle.offer(Batch(vec![1]), start).is_some());
        assert!(throttle.offer(Batch(vec![2]), start + Duration::from_millis(10)).is_none());
        assert!(throttle.offer(Batch(vec![3]), start + Duration::from_millis(20)).is_none());

        assert!(throttle.poll(start + Duration::from_millis(30)).is_none());
        assert_eq!(
            throttle.deadline(),
            Some(start + Duration::from_millis(50))
        );
        assert_eq!(
            throttle.poll(start + Duration::from_millis(50)),
            Some(Batch(vec![2, 3]))
        );
        assert!(throttle.poll(start + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn test_offer_after_window_releases_accumulated() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();

        throttle.offer(Batch(vec![1]), start);
        throttle.offer(Batch(vec![2]), start + Duration::from_millis(10));
        let released = throttle.offer(Batch(vec![3]), start + Duration::from_millis(60));

        assert_eq!(released, Some(Batch(vec![2, 3])));
    }

    #[test]
    fn test_flush_ignores_window() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        let start = Instant::now();

        throttle.offer(Batch(vec![1]), start);
        throttle.offer(Batch(vec![2]), start);
        assert_eq!(throttle.flush(), Some(Batch(vec![2])));
        assert_eq!(throttle.flush(), None);
    }
}
