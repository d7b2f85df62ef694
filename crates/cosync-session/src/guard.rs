//! Cooperative re-entrancy guard

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Boolean guard with skip-if-held semantics.
///
/// Clones share the same flag. It never blocks: a second entry while the
/// flag is up is skipped and reported as `None`.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyGuard {
    held: Arc<AtomicBool>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless the guard is already held
    pub fn try_run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _release = Release(&self.held);
        Some(f())
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

// Drops the flag even if `f` unwinds
struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_when_free() {
        let guard = ReentrancyGuard::new();
        assert_eq!(guard.try_run(|| 7), Some(7));
        assert!(!guard.is_held());
    }

    #[test]
    fn test_nested_entry_is_skipped() {
        let guard = ReentrancyGuard::new();
        let inner = guard.clone();

        let outcome = guard.try_run(|| {
            assert!(inner.is_held());
            inner.try_run(|| "inner")
        });

        assert_eq!(outcome, Some(None));
        assert_eq!(guard.try_run(|| "again"), Some("again"));
    }

    #[test]
    fn test_released_after_panic() {
        let guard = ReentrancyGuard::new();
        let cloned = guard.clone();
        let result = std::panic::catch_unwind(move || {
            cloned.try_run(|| panic!("boom"));
        });

        assert!(result.is_err());
        assert!(!guard.is_held());
    }
}
