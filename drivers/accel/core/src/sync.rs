//! # Synchronization Primitives
//!
//! Generation-counter wait queue used by the blocking paths of the page pool
//! and the command queues.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// WAIT QUEUE
// =============================================================================

/// Wait queue for blocking until a condition holds
///
/// Wakers bump a generation counter; waiters re-check their condition each
/// time the generation moves. The condition is always re-evaluated after the
/// generation is sampled, so a wake between the check and the wait is never
/// lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    /// Bumped on every wake
    generation: AtomicU64,
    /// Threads currently inside `wait_until`
    waiters: AtomicUsize,
}

impl WaitQueue {
    /// Create an empty wait queue
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Wake every waiter
    #[inline]
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Current generation, for readiness polling
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of threads currently blocked
    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Block until `cond` returns true
    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        loop {
            let seen = self.generation();
            if cond() {
                break;
            }
            while self.generation() == seen {
                relax();
            }
        }
        self.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

#[inline]
fn relax() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            std::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn test_ready_condition_returns_immediately() {
        let wq = WaitQueue::new();
        wq.wait_until(|| true);
        assert_eq!(wq.waiters(), 0);
    }

    #[test]
    fn test_wake_from_other_thread() {
        let wq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waker = {
            let wq = wq.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                flag.store(true, Ordering::Release);
                wq.wake_all();
            })
        };

        wq.wait_until(|| flag.load(Ordering::Acquire));
        assert!(flag.load(Ordering::Acquire));
        waker.join().unwrap();
    }

    #[test]
    fn test_generation_moves_on_wake() {
        let wq = WaitQueue::new();
        let before = wq.generation();
        wq.wake_all();
        assert_eq!(wq.generation(), before + 1);
    }
}
