#![allow(clippy::missing_errors_doc)]

//! Thread-safe bounded FIFO queue with blocking and non-blocking variants.
//!
//! This is the sole inter-stage transport used by the pipeline execution
//! engine, but it is also usable standalone as a general-purpose bounded
//! MPMC queue.
//!
//! **Complexity**
//! - `try_push`, `nonblocking_push`, `wait_push`, `push`, `try_pop`,
//!   `nonblocking_pop`, `wait_pop`, and `value_pop` complete in `O(1)`.
//! - `clear` is `O(n)` where `n` is the number of buffered elements.
//!
//! **Panic Safety**
//! - [`BoundedQueue::new`] panics when constructed with a zero capacity.
//! - Internal mutex poisoning is recovered transparently, so a panic while
//!   holding the lock in one thread does not wedge the queue for everyone
//!   else.
//!
//! **Thread Safety**
//! - All operations take `&self`; the queue is `Clone` (an `Arc` handle) and
//!   may be shared freely across producer and consumer threads.
//! - Blocking operations use `std::sync::Condvar` with `while` wait loops,
//!   guarding against spurious wakeups.
//!
//! **Semantics of `close()`**
//! - Closing the queue rejects new pushes immediately and wakes every
//!   waiter.
//! - Pending pops drain buffered items first; only once the queue is both
//!   closed and empty do pops report `Closed`.
//! - The operation is idempotent.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::QueueError;

/// Outcome of a queue operation.
///
/// Every push and pop variant reports one of these five values; which
/// subset is reachable depends on the operation (see the table in the
/// module's operations below).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// The value was transferred.
    Success,
    /// No value was available; the queue is still open.
    Empty,
    /// No slot was available; the queue is still open.
    Full,
    /// The internal mutex could not be acquired without waiting
    /// (`nonblocking_*` variants only).
    Busy,
    /// The queue is closed. Further pushes are rejected; pops continue to
    /// drain remaining values before switching to this status.
    Closed,
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    waiting_producers: usize,
    waiting_consumers: usize,
}

struct State<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> State<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                waiting_producers: 0,
                waiting_consumers: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, Inner<T>>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }

    fn wait_not_full<'a>(&self, guard: MutexGuard<'a, Inner<T>>) -> MutexGuard<'a, Inner<T>> {
        match self.not_full.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_not_empty<'a>(&self, guard: MutexGuard<'a, Inner<T>>) -> MutexGuard<'a, Inner<T>> {
        match self.not_empty.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Thread-safe, `Arc`-backed bounded FIFO queue.
///
/// ```
/// use std::thread;
///
/// use pulsearc_pipeline::queue::{BoundedQueue, QueueStatus};
///
/// let queue = BoundedQueue::new(2);
/// queue.push(1).unwrap();
///
/// let worker = {
///     let queue = queue.clone();
///     thread::spawn(move || queue.value_pop().unwrap())
/// };
///
/// queue.push(2).unwrap();
/// queue.close();
///
/// assert_eq!(worker.join().unwrap(), 1);
/// let (status, value) = queue.try_pop();
/// assert_eq!((status, value), (QueueStatus::Success, Some(2)));
/// let (status, value) = queue.try_pop();
/// assert_eq!((status, value), (QueueStatus::Closed, None));
/// ```
pub struct BoundedQueue<T> {
    state: Arc<State<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a new queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be greater than zero");
        Self { state: Arc::new(State::new(capacity)) }
    }

    /// Maximum number of elements the queue can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Current number of buffered elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// `true` when the queue holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let guard = self.state.lock();
        guard.queue.len() == guard.capacity
    }

    /// `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Removes all buffered elements, waking any waiting producer.
    pub fn clear(&self) {
        let mut guard = self.state.lock();
        let was_full = guard.queue.len() == guard.capacity;
        guard.queue.clear();
        drop(guard);
        if was_full {
            self.state.not_full.notify_all();
        }
    }

    /// Closes the queue and wakes every waiter.
    ///
    /// Idempotent: once closed, repeat calls have no effect.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;
        drop(guard);
        trace!("bounded queue closed");
        self.state.not_full.notify_all();
        self.state.not_empty.notify_all();
    }

    /// Pushes a value, blocking until space is available or the queue
    /// closes. Returns `Err(QueueError::Closed)` in the latter case — this
    /// is an "unconditional intent" operation, per the crate's error-vs-
    /// status split.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut guard = self.state.lock();
        loop {
            if guard.closed {
                return Err(QueueError::Closed);
            }
            if guard.queue.len() < guard.capacity {
                guard.queue.push_back(item);
                let wake = guard.waiting_consumers > 0;
                drop(guard);
                if wake {
                    self.state.not_empty.notify_one();
                }
                return Ok(());
            }
            guard.waiting_producers += 1;
            guard = self.state.wait_not_full(guard);
            guard.waiting_producers -= 1;
        }
    }

    /// Pops a value, blocking until one is available or the queue is both
    /// closed and empty. This is the "unconditional intent" counterpart to
    /// `push`: it returns the value directly and raises
    /// `Err(QueueError::Closed)` instead of an `Empty`/`Closed` status.
    pub fn value_pop(&self) -> Result<T, QueueError> {
        match self.wait_pop() {
            (QueueStatus::Success, Some(item)) => Ok(item),
            (QueueStatus::Closed, None) => Err(QueueError::Closed),
            (status, _) => unreachable!("wait_pop returned an impossible outcome: {status:?}"),
        }
    }

    /// Pops a value, blocking until one is available or the queue is both
    /// closed and empty. Reports a status rather than raising an error.
    #[must_use]
    pub fn wait_pop(&self) -> (QueueStatus, Option<T>) {
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.queue.pop_front() {
                let wake = guard.waiting_producers > 0;
                drop(guard);
                if wake {
                    self.state.not_full.notify_one();
                }
                return (QueueStatus::Success, Some(item));
            }
            if guard.closed {
                return (QueueStatus::Closed, None);
            }
            guard.waiting_consumers += 1;
            guard = self.state.wait_not_empty(guard);
            guard.waiting_consumers -= 1;
        }
    }

    /// Pushes a value, blocking until space is available or the queue
    /// closes. Reports a status rather than raising an error; on closure
    /// the item is handed back to the caller.
    #[must_use]
    pub fn wait_push(&self, item: T) -> (QueueStatus, Option<T>) {
        let mut guard = self.state.lock();
        loop {
            if guard.closed {
                return (QueueStatus::Closed, Some(item));
            }
            if guard.queue.len() < guard.capacity {
                guard.queue.push_back(item);
                let wake = guard.waiting_consumers > 0;
                drop(guard);
                if wake {
                    self.state.not_empty.notify_one();
                }
                return (QueueStatus::Success, None);
            }
            guard.waiting_producers += 1;
            guard = self.state.wait_not_full(guard);
            guard.waiting_producers -= 1;
        }
    }

    /// Attempts to pop a value without blocking if the value isn't
    /// immediately available, but still acquires the mutex (may briefly
    /// contend with another thread holding it).
    #[must_use]
    pub fn try_pop(&self) -> (QueueStatus, Option<T>) {
        let mut guard = self.state.lock();
        if let Some(item) = guard.queue.pop_front() {
            let wake = guard.waiting_producers > 0;
            drop(guard);
            if wake {
                self.state.not_full.notify_one();
            }
            return (QueueStatus::Success, Some(item));
        }
        if guard.closed {
            return (QueueStatus::Closed, None);
        }
        (QueueStatus::Empty, None)
    }

    /// Attempts to push a value without blocking if capacity isn't
    /// immediately available, but still acquires the mutex.
    #[must_use]
    pub fn try_push(&self, item: T) -> (QueueStatus, Option<T>) {
        let mut guard = self.state.lock();
        if guard.closed {
            return (QueueStatus::Closed, Some(item));
        }
        if guard.queue.len() >= guard.capacity {
            return (QueueStatus::Full, Some(item));
        }
        guard.queue.push_back(item);
        let wake = guard.waiting_consumers > 0;
        drop(guard);
        if wake {
            self.state.not_empty.notify_one();
        }
        (QueueStatus::Success, None)
    }

    /// Attempts to pop a value without ever blocking on the mutex itself:
    /// if the lock is contended, returns `Busy` immediately instead of
    /// waiting for it.
    #[must_use]
    pub fn nonblocking_pop(&self) -> (QueueStatus, Option<T>) {
        let Some(mut guard) = self.state.try_lock() else {
            return (QueueStatus::Busy, None);
        };
        if let Some(item) = guard.queue.pop_front() {
            let wake = guard.waiting_producers > 0;
            drop(guard);
            if wake {
                self.state.not_full.notify_one();
            }
            return (QueueStatus::Success, Some(item));
        }
        if guard.closed {
            return (QueueStatus::Closed, None);
        }
        (QueueStatus::Empty, None)
    }

    /// Attempts to push a value without ever blocking on the mutex itself:
    /// if the lock is contended, returns `Busy` immediately instead of
    /// waiting for it.
    #[must_use]
    pub fn nonblocking_push(&self, item: T) -> (QueueStatus, Option<T>) {
        let Some(mut guard) = self.state.try_lock() else {
            return (QueueStatus::Busy, Some(item));
        };
        if guard.closed {
            return (QueueStatus::Closed, Some(item));
        }
        if guard.queue.len() >= guard.capacity {
            return (QueueStatus::Full, Some(item));
        }
        guard.queue.push_back(item);
        let wake = guard.waiting_consumers > 0;
        drop(guard);
        if wake {
            self.state.not_empty.notify_one();
        }
        (QueueStatus::Success, None)
    }

    /// Pops a value, blocking for at most `timeout`.
    #[must_use]
    pub fn pop_timeout(&self, timeout: Duration) -> (QueueStatus, Option<T>) {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.queue.pop_front() {
                let wake = guard.waiting_producers > 0;
                drop(guard);
                if wake {
                    self.state.not_full.notify_one();
                }
                return (QueueStatus::Success, Some(item));
            }
            if guard.closed {
                return (QueueStatus::Closed, None);
            }
            let remaining = deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::MAX);
            if remaining.is_zero() {
                return (QueueStatus::Empty, None);
            }
            guard.waiting_consumers += 1;
            let (g, timed_out) = match self.state.not_empty.wait_timeout(guard, remaining) {
                Ok((guard, result)) => (guard, result.timed_out()),
                Err(poisoned) => {
                    let (guard, result) = poisoned.into_inner();
                    (guard, result.timed_out())
                }
            };
            guard = g;
            guard.waiting_consumers -= 1;
            if timed_out && guard.queue.is_empty() && !guard.closed {
                return (QueueStatus::Empty, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    #[should_panic(expected = "BoundedQueue capacity must be greater than zero")]
    fn new_panics_on_zero_capacity() {
        let _ = BoundedQueue::<usize>::new(0);
    }

    #[test]
    fn state_introspection_helpers() {
        let queue = BoundedQueue::new(2);
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert!(!queue.is_closed());
        assert_eq!(queue.try_pop(), (QueueStatus::Empty, None));

        queue.push(10).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
        assert!(!queue.is_full());

        queue.push(20).unwrap();
        assert!(queue.is_full());

        assert_eq!(queue.try_pop(), (QueueStatus::Success, Some(10)));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.value_pop().unwrap(), 20);
        assert!(queue.is_empty());

        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.value_pop().unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let queue = BoundedQueue::new(4);
        for value in 0..4 {
            queue.push(value).unwrap();
        }
        queue.close();
        let mut observed = Vec::new();
        while let (QueueStatus::Success, Some(value)) = queue.try_pop() {
            observed.push(value);
        }
        assert_eq!(observed, vec![0, 1, 2, 3]);
    }

    #[test]
    fn try_push_reports_full_then_closed() {
        let queue = BoundedQueue::<i32>::new(1);
        assert_eq!(queue.try_push(1), (QueueStatus::Success, None));
        assert_eq!(queue.try_push(2), (QueueStatus::Full, Some(2)));

        assert_eq!(queue.try_pop(), (QueueStatus::Success, Some(1)));
        queue.close();
        assert_eq!(queue.try_push(3), (QueueStatus::Closed, Some(3)));
    }

    #[test]
    fn nonblocking_pop_reports_busy_under_contention() {
        let queue = Arc::new(BoundedQueue::<i32>::new(1));
        queue.push(1).unwrap();

        let held = Arc::clone(&queue);
        let guard_thread = thread::spawn(move || {
            let _guard = held.state.lock();
            thread::sleep(Duration::from_millis(50));
        });

        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.nonblocking_pop(), (QueueStatus::Busy, None));
        guard_thread.join().unwrap();
    }

    #[test]
    fn close_unblocks_waiters() {
        let queue = Arc::new(BoundedQueue::<i32>::new(1));
        queue.push(1).unwrap();

        let blocked_push = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(blocked_push.join().unwrap(), Err(QueueError::Closed));
        assert_eq!(queue.value_pop().unwrap(), 1);
        assert_eq!(queue.value_pop().unwrap_err(), QueueError::Closed);

        let queue = Arc::new(BoundedQueue::<i32>::new(1));
        let blocked_pop = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.value_pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(blocked_pop.join().unwrap().unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn pop_timeout_returns_empty_when_nothing_arrives() {
        let queue = BoundedQueue::<i32>::new(1);
        let (status, value) = queue.pop_timeout(Duration::from_millis(10));
        assert_eq!(status, QueueStatus::Empty);
        assert!(value.is_none());
    }

    #[test]
    fn clear_unblocks_waiting_producer() {
        let queue = Arc::new(BoundedQueue::<i32>::new(1));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        queue.clear();
        producer.join().unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.value_pop().unwrap(), 2);
        assert!(!queue.is_closed());
    }

    #[test]
    fn mpmc_producers_consumers() {
        let queue = Arc::new(BoundedQueue::new(8));
        let producers = 4;
        let items_per_producer = 50;
        let total = producers * items_per_producer;

        let mut producer_handles = Vec::new();
        for id in 0..producers {
            let queue = Arc::clone(&queue);
            producer_handles.push(thread::spawn(move || {
                for offset in 0..items_per_producer {
                    queue.push((id, offset)).unwrap();
                }
            }));
        }

        let consumed = Arc::new(AtomicUsize::new(0));
        let mut consumer_handles = Vec::new();
        for _ in 0..producers {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            consumer_handles.push(thread::spawn(move || {
                while queue.value_pop().is_ok() {
                    if consumed.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                        break;
                    }
                }
            }));
        }

        for handle in producer_handles {
            handle.join().unwrap();
        }
        queue.close();
        for handle in consumer_handles {
            handle.join().unwrap();
        }

        assert_eq!(consumed.load(Ordering::SeqCst), total);
    }

    /// A panic while holding the queue's mutex must not permanently wedge
    /// subsequent operations on that queue (property 12).
    #[test]
    fn poisoned_mutex_recovers() {
        let queue = Arc::new(BoundedQueue::<i32>::new(2));
        let panicking = Arc::clone(&queue);
        let _ = thread::spawn(move || {
            let _guard = panicking.state.lock();
            panic!("deliberate poison for test");
        })
        .join();

        assert!(queue.push(1).is_ok());
        assert_eq!(queue.value_pop().unwrap(), 1);
    }
}
