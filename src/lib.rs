#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

//! A typed, composable, concurrent pipeline library.
//!
//! Build a chain of [`Stage`]s — `Filter`, `Source`, `Consumer` — with the
//! `filter`/`source`/`consume` constructors, join them end-to-end with `|`,
//! and run the result on a [`WorkerPool`] once it is *Runnable* (both
//! sourced and sinked):
//!
//! ```
//! use pulsearc_pipeline::{consume, filter, queue::BoundedQueue, source, worker_pool::ThreadPool};
//!
//! let feed: BoundedQueue<i32> = BoundedQueue::new(4);
//! for v in 1..=3 {
//!     feed.push(v).unwrap();
//! }
//! feed.close();
//!
//! let pipeline = source(feed) | filter(|x: i32| x * 2) | consume(|x: i32| println!("{x}"));
//!
//! let pool = ThreadPool::new(2, 4).unwrap();
//! let handle = pipeline.run(&pool);
//! handle.wait();
//! assert!(handle.first_error().is_none());
//! ```
//!
//! An *Open* pipeline (composed entirely of `Filter` stages) can also be run
//! synchronously, with no queues or workers at all:
//!
//! ```
//! use pulsearc_pipeline::filter;
//!
//! let pipeline = filter(|x: i32| x + 1) | filter(|x: i32| x * 2);
//! assert_eq!(pipeline.apply(3), 8);
//! ```
//!
//! See [`queue`] for the bounded MPMC transport that underlies every
//! inter-stage handoff, and [`error`] for how stage panics and queue closure
//! surface to a caller.

pub mod completion;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod worker_pool;

pub use completion::{CompletionSignal, CountdownLatch};
pub use error::{ErrorClassification, ErrorSeverity, PipelineError, QueueError};
pub use pipeline::{consume, filter, source, Pipeline, PipelineHandle, DEFAULT_QUEUE_CAPACITY};
pub use queue::{BoundedQueue, QueueStatus};
pub use stage::Stage;
pub use worker_pool::{ThreadPool, WorkerPool};
