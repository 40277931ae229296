//! Cooperative progress and cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Shared progress handle.
///
/// Builders and the frame loop report status through it and poll
/// `is_cancelled` at milestones; cancelling never interrupts a path mid-bounce.
#[derive(Debug, Default)]
pub struct Progress {
    cancelled: AtomicBool,
    completed: AtomicU64,
    total: AtomicU64,
    status: Mutex<String>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        log::debug!("{}", status);
        *self.status.lock() = status;
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    pub fn add_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    /// Fraction of work done in [0, 1].
    pub fn fraction(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (self.completed.load(Ordering::Relaxed) as f32 / total as f32).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction_and_cancel() {
        let progress = Progress::new();
        assert_eq!(progress.fraction(), 0.0);
        progress.set_total(4);
        progress.add_completed(1);
        assert!((progress.fraction() - 0.25).abs() < 1e-6);

        assert!(!progress.is_cancelled());
        progress.cancel();
        assert!(progress.is_cancelled());

        progress.set_status("Building BVH");
        assert_eq!(progress.status(), "Building BVH");
    }
}
