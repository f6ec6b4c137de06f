//! Pipeline composition and the execution engine.
//!
//! A [`Pipeline`] is an ordered, non-empty chain of [`Stage`]s built up by
//! repeated composition with `|`. Its `In`/`Out` type parameters directly
//! encode where it sits in the classification lattice (Open / Sourced /
//! Sinked / Runnable) — no separate marker type is needed, and illegal
//! compositions are rejected by the type checker before any stage is ever
//! erased for storage.
//!
//! Internally, stages are boxed into `Box<dyn ErasedStage>` so a single
//! `Vec` can hold a heterogeneous chain; this is the "dynamic dispatch
//! through a uniform interface" the design explicitly allows, since every
//! endpoint type was already checked statically at the point each stage was
//! composed in.
//!
//! **Failure propagation.** A stage function that panics closes that
//! worker's downstream queue (as always) but also its own upstream boundary
//! queue, so a producer blocked pushing into a now-abandoned queue is woken
//! rather than left hanging. The close cascades hop by hop: each stage that
//! observes a push failure reacts the same way, unwinding all the way back
//! to the source. A shared `cancelled` flag, checked between popping a value
//! and applying the stage function, lets the remaining workers of a failed
//! stage stop picking up new work without waiting to discover it via a
//! failed push.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use crate::completion::{CompletionSignal, CountdownLatch};
use crate::error::PipelineError;
use crate::queue::BoundedQueue;
use crate::stage::Stage;
use crate::worker_pool::WorkerPool;

/// Default capacity used for queues allocated between adjacent stages,
/// unless overridden with [`Pipeline::with_queue_capacity`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// A boxed unit of work submitted to the pool for one stage worker.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// An ordered, non-empty chain of stages with matching adjacent types.
///
/// Built via [`filter`], [`source`], or [`consume`] and composed with `|`.
/// Immutable once constructed except through the builder methods
/// ([`Pipeline::parallel`], [`Pipeline::with_queue_capacity`],
/// [`Pipeline::on_end`]), each of which consumes and returns `self`.
pub struct Pipeline<In, Out> {
    stages: Vec<Box<dyn ErasedStage>>,
    apply_fn: Option<Arc<dyn Fn(In) -> Out + Send + Sync>>,
    queue_capacity: usize,
    on_end: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Builds an Open pipeline of one `Filter` stage from a pure function.
pub fn filter<In, Out, F>(f: F) -> Pipeline<In, Out>
where
    F: Fn(In) -> Out + Send + Sync + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    let f: Arc<dyn Fn(In) -> Out + Send + Sync> = Arc::new(f);
    let stage = Stage::Filter { name: None, f: Arc::clone(&f), parallelism: 1 };
    Pipeline {
        stages: vec![Box::new(stage)],
        apply_fn: Some(f),
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        on_end: None,
    }
}

/// Builds a Sourced pipeline of one `Source` stage, fed by an externally
/// owned queue.
pub fn source<Out>(queue: BoundedQueue<Out>) -> Pipeline<(), Out>
where
    Out: Send + 'static,
{
    Pipeline {
        stages: vec![Box::new(Stage::source(queue))],
        apply_fn: None,
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        on_end: None,
    }
}

/// Builds a Sinked pipeline of one `Consumer` stage from a sink function.
pub fn consume<In, F>(f: F) -> Pipeline<In, ()>
where
    F: Fn(In) + Send + Sync + 'static,
    In: Send + 'static,
{
    Pipeline {
        stages: vec![Box::new(Stage::consume(f))],
        apply_fn: None,
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        on_end: None,
    }
}

impl<In, Out> Pipeline<In, Out> {
    /// Runs `input` synchronously through every composed stage function,
    /// without spawning workers or allocating queues.
    ///
    /// # Panics
    ///
    /// Panics if any stage composed into this pipeline was a `Source` or
    /// `Consumer` rather than a `Filter` — `apply` only threads a value
    /// through pure transforms.
    pub fn apply(&self, input: In) -> Out {
        match &self.apply_fn {
            Some(f) => f(input),
            None => panic!("apply requires a pipeline composed entirely of Filter stages"),
        }
    }

    /// Marks the most recently composed stage to run with `k` workers.
    ///
    /// # Panics
    ///
    /// Panics if `k == 0`.
    #[must_use]
    pub fn parallel(mut self, k: usize) -> Self {
        assert!(k > 0, "stage parallelism must be at least 1");
        if let Some(stage) = self.stages.last_mut() {
            stage.set_parallelism(k);
        }
        self
    }

    /// Attaches a diagnostic name to the most recently composed stage, used
    /// in tracing spans and in `PipelineError::StageFailure`.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.set_name(name.into());
        }
        self
    }

    /// Overrides the capacity used for queues this pipeline's `run`
    /// allocates between adjacent stages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than zero");
        self.queue_capacity = capacity;
        self
    }

    /// Attaches a callback fired once the pipeline drains, in addition to
    /// (not instead of) the completion signal returned by
    /// [`PipelineHandle::wait`].
    #[must_use]
    pub fn on_end<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_end = Some(Arc::new(handler));
        self
    }

    /// Number of stages composed into this pipeline so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

impl Pipeline<(), ()> {
    /// Spawns this pipeline's workers onto `pool` and returns a handle for
    /// observing completion and errors. Consumes `self`: a pipeline is
    /// single-use once run.
    #[instrument(skip_all, fields(stages = self.stages.len()))]
    #[must_use]
    pub fn run(self, pool: &dyn WorkerPool) -> PipelineHandle {
        let stage_count = self.stages.len();
        assert!(stage_count > 0, "a pipeline must contain at least one stage");

        let queues: Vec<Box<dyn ErasedQueue>> = self
            .stages
            .iter()
            .take(stage_count - 1)
            .map(|stage| stage.new_output_queue(self.queue_capacity))
            .collect();

        let error_slot: Arc<Mutex<Option<PipelineError>>> = Arc::new(Mutex::new(None));
        let completion: Arc<dyn CompletionSignal> = Arc::new(CountdownLatch::new(1));
        let cancelled: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let on_end = self.on_end;

        for (index, stage) in self.stages.into_iter().enumerate() {
            let is_terminal = index + 1 == stage_count;
            let upstream = if index == 0 { None } else { Some(queues[index - 1].clone_any()) };
            let downstream = if is_terminal { None } else { Some(queues[index].clone_any()) };

            let on_last_exit: Arc<dyn Fn() + Send + Sync> = if is_terminal {
                let completion = Arc::clone(&completion);
                let on_end = on_end.clone();
                Arc::new(move || {
                    debug!("pipeline drained");
                    completion.count_down();
                    if let Some(handler) = &on_end {
                        handler();
                    }
                })
            } else {
                Arc::new(|| {})
            };

            stage.spawn(
                pool,
                upstream,
                downstream,
                Arc::clone(&error_slot),
                Arc::clone(&cancelled),
                on_last_exit,
            );
        }

        PipelineHandle { completion, error_slot }
    }
}

impl<In, Mid, Out> std::ops::BitOr<Pipeline<Mid, Out>> for Pipeline<In, Mid>
where
    In: 'static,
    Mid: 'static,
    Out: 'static,
{
    type Output = Pipeline<In, Out>;

    fn bitor(self, rhs: Pipeline<Mid, Out>) -> Self::Output {
        let mut stages = self.stages;
        stages.extend(rhs.stages);

        let apply_fn = match (self.apply_fn, rhs.apply_fn) {
            (Some(f), Some(g)) => {
                let composed: Arc<dyn Fn(In) -> Out + Send + Sync> = Arc::new(move |x: In| g(f(x)));
                Some(composed)
            }
            _ => None,
        };

        Pipeline {
            stages,
            apply_fn,
            queue_capacity: self.queue_capacity,
            on_end: self.on_end.or(rhs.on_end),
        }
    }
}

/// Handle to a running pipeline, returned promptly by [`Pipeline::run`].
pub struct PipelineHandle {
    completion: Arc<dyn CompletionSignal>,
    error_slot: Arc<Mutex<Option<PipelineError>>>,
}

impl PipelineHandle {
    /// Blocks until the pipeline has drained (the terminal stage's last
    /// worker has exited).
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Returns the first stage failure recorded during execution, if any.
    /// First-write-wins: if multiple stages panic, only the first one
    /// observed is retained.
    #[must_use]
    pub fn first_error(&self) -> Option<PipelineError> {
        let guard = match self.error_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }
}

/// Internal handle to a boundary queue, erased over its element type so a
/// single `Vec` can hold one per stage boundary.
trait ErasedQueue: Send {
    fn clone_any(&self) -> Box<dyn Any + Send>;
}

impl<T: Send + 'static> ErasedQueue for BoundedQueue<T> {
    fn clone_any(&self) -> Box<dyn Any + Send> {
        Box::new(self.clone())
    }
}

/// Internal, type-erased view of a [`Stage`], used for heterogeneous
/// storage in [`Pipeline`]. Endpoint types were already checked statically
/// at the point each stage was composed in — erasure only happens for
/// storage and dispatch, never to bypass a type check.
trait ErasedStage: Send {
    fn set_parallelism(&mut self, k: usize);
    fn set_name(&mut self, name: String);
    fn new_output_queue(&self, capacity: usize) -> Box<dyn ErasedQueue>;
    fn spawn(
        self: Box<Self>,
        pool: &dyn WorkerPool,
        upstream: Option<Box<dyn Any + Send>>,
        downstream: Option<Box<dyn Any + Send>>,
        error_slot: Arc<Mutex<Option<PipelineError>>>,
        cancelled: Arc<AtomicBool>,
        on_last_exit: Arc<dyn Fn() + Send + Sync>,
    );
}

/// Pulls the boundary queue out of its type-erased box.
///
/// `run` always allocates exactly one queue per non-terminal boundary and
/// hands the matching element type to the matching stage, so a missing
/// queue or a downcast mismatch here would mean the engine itself built the
/// wrong wiring — a bug in `run`, not a condition a caller can trigger.
fn take_queue<T: Send + 'static>(boundary: Option<Box<dyn Any + Send>>, role: &str) -> BoundedQueue<T> {
    let boxed = match boundary {
        Some(boxed) => boxed,
        None => unreachable!("{role} queue missing: run() allocates one per boundary"),
    };
    match boxed.downcast::<BoundedQueue<T>>() {
        Ok(queue) => *queue,
        Err(_) => unreachable!("{role} queue element type mismatch: composition already checked types statically"),
    }
}

impl<In, Out> ErasedStage for Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn set_parallelism(&mut self, k: usize) {
        match self {
            Stage::Filter { parallelism, .. }
            | Stage::Source { parallelism, .. }
            | Stage::Consumer { parallelism, .. } => *parallelism = k,
        }
    }

    fn set_name(&mut self, name: String) {
        match self {
            Stage::Filter { name: n, .. }
            | Stage::Source { name: n, .. }
            | Stage::Consumer { name: n, .. } => *n = Some(name),
        }
    }

    fn new_output_queue(&self, capacity: usize) -> Box<dyn ErasedQueue> {
        Box::new(BoundedQueue::<Out>::new(capacity))
    }

    fn spawn(
        self: Box<Self>,
        pool: &dyn WorkerPool,
        upstream: Option<Box<dyn Any + Send>>,
        downstream: Option<Box<dyn Any + Send>>,
        error_slot: Arc<Mutex<Option<PipelineError>>>,
        cancelled: Arc<AtomicBool>,
        on_last_exit: Arc<dyn Fn() + Send + Sync>,
    ) {
        match *self {
            Stage::Filter { name, f, parallelism } => {
                let in_q: BoundedQueue<In> = take_queue(upstream, "upstream");
                let out_q: BoundedQueue<Out> = take_queue(downstream, "downstream");
                let stage_name = name.unwrap_or_else(|| "filter".to_string());
                let remaining = Arc::new(AtomicUsize::new(parallelism));

                for _ in 0..parallelism {
                    let in_q = in_q.clone();
                    let out_q = out_q.clone();
                    let f = Arc::clone(&f);
                    let error_slot = Arc::clone(&error_slot);
                    let cancelled = Arc::clone(&cancelled);
                    let remaining = Arc::clone(&remaining);
                    let on_last_exit = Arc::clone(&on_last_exit);
                    let stage_name = stage_name.clone();
                    pool.submit(Box::new(move || {
                        run_filter_worker(&in_q, &out_q, &f, &stage_name, &error_slot, &cancelled);
                        // Closing our own in-queue, not just the out-queue, wakes an
                        // upstream worker blocked pushing into it once this stage can
                        // no longer drain it (push failure, panic, or cancellation) —
                        // without this the upstream producer hangs forever.
                        in_q.close();
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            out_q.close();
                            on_last_exit();
                        }
                    }) as Task);
                }
            }
            Stage::Source { queue, parallelism, .. } => {
                let out_q: BoundedQueue<Out> = take_queue(downstream, "downstream");
                let remaining = Arc::new(AtomicUsize::new(parallelism));

                for _ in 0..parallelism {
                    let feed = queue.clone();
                    let out_q = out_q.clone();
                    let cancelled = Arc::clone(&cancelled);
                    let remaining = Arc::clone(&remaining);
                    let on_last_exit = Arc::clone(&on_last_exit);
                    pool.submit(Box::new(move || {
                        while let Ok(value) = feed.value_pop() {
                            if cancelled.load(Ordering::Acquire) {
                                break;
                            }
                            if out_q.push(value).is_err() {
                                break;
                            }
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            out_q.close();
                            on_last_exit();
                        }
                    }) as Task);
                }
            }
            Stage::Consumer { name, f, parallelism } => {
                let in_q: BoundedQueue<In> = take_queue(upstream, "upstream");
                let stage_name = name.unwrap_or_else(|| "consumer".to_string());
                let remaining = Arc::new(AtomicUsize::new(parallelism));

                for _ in 0..parallelism {
                    let in_q = in_q.clone();
                    let f = Arc::clone(&f);
                    let error_slot = Arc::clone(&error_slot);
                    let cancelled = Arc::clone(&cancelled);
                    let remaining = Arc::clone(&remaining);
                    let on_last_exit = Arc::clone(&on_last_exit);
                    let stage_name = stage_name.clone();
                    pool.submit(Box::new(move || {
                        run_consumer_worker(&in_q, &f, &stage_name, &error_slot, &cancelled);
                        // Same reasoning as the Filter arm: unblock whatever is
                        // upstream of the terminal stage on failure.
                        in_q.close();
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            on_last_exit();
                        }
                    }) as Task);
                }
            }
        }
    }
}

fn run_filter_worker<In, Out>(
    in_q: &BoundedQueue<In>,
    out_q: &BoundedQueue<Out>,
    f: &Arc<dyn Fn(In) -> Out + Send + Sync>,
    stage_name: &str,
    error_slot: &Arc<Mutex<Option<PipelineError>>>,
    cancelled: &Arc<AtomicBool>,
) {
    loop {
        let Ok(value) = in_q.value_pop() else { break };
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        let f = Arc::clone(f);
        match catch_unwind(AssertUnwindSafe(move || f(value))) {
            Ok(output) => {
                if out_q.push(output).is_err() {
                    break;
                }
            }
            Err(payload) => {
                record_stage_failure(error_slot, cancelled, stage_name, payload);
                break;
            }
        }
    }
}

fn run_consumer_worker<In>(
    in_q: &BoundedQueue<In>,
    f: &Arc<dyn Fn(In) + Send + Sync>,
    stage_name: &str,
    error_slot: &Arc<Mutex<Option<PipelineError>>>,
    cancelled: &Arc<AtomicBool>,
) {
    loop {
        let Ok(value) = in_q.value_pop() else { break };
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        let f = Arc::clone(f);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || f(value))) {
            record_stage_failure(error_slot, cancelled, stage_name, payload);
            break;
        }
    }
}

fn record_stage_failure(
    error_slot: &Arc<Mutex<Option<PipelineError>>>,
    cancelled: &Arc<AtomicBool>,
    stage_name: &str,
    payload: Box<dyn Any + Send>,
) {
    cancelled.store(true, Ordering::Release);

    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "stage panicked with a non-string payload".to_string());

    warn!(stage = stage_name, %message, "stage failed");

    let err = PipelineError::StageFailure { stage: stage_name.to_string(), message };
    let mut guard = match error_slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        *guard = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::worker_pool::ThreadPool;

    #[test]
    fn apply_threads_value_through_composed_filters() {
        let pipeline = filter(|x: i32| x + 1) | filter(|x: i32| x * 2);
        assert_eq!(pipeline.apply(3), 8);
    }

    #[test]
    #[should_panic(expected = "apply requires a pipeline composed entirely of Filter stages")]
    fn apply_panics_when_a_source_is_composed_in() {
        let feed = BoundedQueue::new(1);
        feed.close();
        let pipeline = source(feed) | filter(|x: i32| x + 1);
        let _ = pipeline.apply(());
    }

    #[test]
    fn run_drains_values_from_source_to_consumer() {
        let feed: BoundedQueue<i32> = BoundedQueue::new(4);
        for v in 1..=5 {
            feed.push(v).unwrap();
        }
        feed.close();

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);

        let pipeline = source(feed)
            | filter(|x: i32| x * 10)
            | consume(move |x: i32| sink.lock().unwrap().push(x));

        let pool = ThreadPool::new(4, 8).unwrap();
        let handle = pipeline.run(&pool);
        handle.wait();

        let mut observed = results.lock().unwrap().clone();
        observed.sort_unstable();
        assert_eq!(observed, vec![10, 20, 30, 40, 50]);
        assert!(handle.first_error().is_none());
    }

    #[test]
    fn parallel_stage_processes_every_value_exactly_once() {
        let feed: BoundedQueue<i32> = BoundedQueue::new(8);
        for v in 0..40 {
            feed.push(v).unwrap();
        }
        feed.close();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let pipeline = source(feed)
            | filter(|x: i32| x + 1).parallel(4)
            | consume(move |_x: i32| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let pool = ThreadPool::new(6, 16).unwrap();
        let handle = pipeline.run(&pool);
        handle.wait();

        assert_eq!(seen.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn panicking_stage_surfaces_as_stage_failure_and_still_completes() {
        let feed: BoundedQueue<i32> = BoundedQueue::new(4);
        for v in 0..4 {
            feed.push(v).unwrap();
        }
        feed.close();

        let pipeline = source(feed)
            | filter(|x: i32| {
                if x == 2 {
                    panic!("boom on 2");
                }
                x
            })
            .named("maybe-boom")
            | consume(|_x: i32| {});

        let pool = ThreadPool::new(4, 8).unwrap();
        let handle = pipeline.run(&pool);
        handle.wait();

        match handle.first_error() {
            Some(PipelineError::StageFailure { stage, message }) => {
                assert_eq!(stage, "maybe-boom");
                assert!(message.contains("boom on 2"));
            }
            other => panic!("expected a stage failure, got {other:?}"),
        }
    }

    /// Regression test for a deadlock where a downstream panic left an
    /// upstream producer permanently blocked in `out_q.push`: the source
    /// feeds far more values than both the inter-stage queue capacity and
    /// the feed queue itself can hold, so most of them are still in flight
    /// when the filter panics. Without closing the filter's own in-queue
    /// (and, transitively, the source noticing `cancelled`), the source
    /// worker would never return and `ThreadPool::drop` would hang joining
    /// it.
    #[test]
    fn downstream_panic_with_input_exceeding_queue_capacity_does_not_deadlock() {
        let feed: BoundedQueue<i32> = BoundedQueue::new(2);
        let feeder = {
            let feed = feed.clone();
            std::thread::spawn(move || {
                for v in 0..200 {
                    if feed.push(v).is_err() {
                        break;
                    }
                }
                feed.close();
            })
        };

        let pipeline = source(feed)
            | filter(|x: i32| {
                if x == 5 {
                    panic!("boom on 5");
                }
                x
            })
            .named("maybe-boom")
            | consume(|_x: i32| {});
        let pipeline = pipeline.with_queue_capacity(2);

        let pool = ThreadPool::new(3, 4).unwrap();
        let handle = pipeline.run(&pool);
        handle.wait();

        match handle.first_error() {
            Some(PipelineError::StageFailure { stage, .. }) => assert_eq!(stage, "maybe-boom"),
            other => panic!("expected a stage failure, got {other:?}"),
        }

        feeder.join().unwrap();
        drop(pool);
    }

    #[test]
    fn on_end_fires_alongside_completion_signal() {
        let feed: BoundedQueue<i32> = BoundedQueue::new(2);
        feed.push(1).unwrap();
        feed.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);

        let pipeline =
            (source(feed) | consume(|_x: i32| {})).on_end(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            });

        let pool = ThreadPool::new(2, 4).unwrap();
        let handle = pipeline.run(&pool);
        handle.wait();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
