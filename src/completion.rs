//! The `CompletionSignal` collaborator and a default single-shot latch.
//!
//! The execution engine calls [`CompletionSignal::count_down`] exactly once,
//! from the terminal stage's last exiting worker. [`CountdownLatch`] is the
//! crate's default implementation, built the same way as
//! [`crate::queue::BoundedQueue`]: a flag under a mutex, `notify_all` on
//! the transition.

use std::sync::{Condvar, Mutex};

/// External collaborator observing pipeline drain.
///
/// `wait` may be called from any number of threads, including before
/// `count_down` has fired.
pub trait CompletionSignal: Send + Sync {
    /// Signals that the awaited condition has occurred. Implementations
    /// should tolerate being called more than once — the pipeline calls it
    /// exactly once, but a defensive implementation should not misbehave if
    /// a caller reuses it elsewhere.
    fn count_down(&self);

    /// Blocks the calling thread until `count_down` has been called.
    /// Returns immediately if it already has.
    fn wait(&self);
}

/// A single-count latch: `count_down` flips it from pending to done;
/// `wait` blocks until that happens.
pub struct CountdownLatch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CountdownLatch {
    /// Creates a new latch. The `count` parameter is retained for API
    /// symmetry with a classic `CountDownLatch`, but this implementation is
    /// single-shot: the first `count_down` call always completes it,
    /// regardless of `count`.
    #[must_use]
    pub fn new(_count: usize) -> Self {
        Self { done: Mutex::new(false), condvar: Condvar::new() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CountdownLatch {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CompletionSignal for CountdownLatch {
    fn count_down(&self) {
        let mut guard = self.lock();
        if *guard {
            return;
        }
        *guard = true;
        drop(guard);
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.lock();
        while !*guard {
            guard = match self.condvar.wait(guard) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}
