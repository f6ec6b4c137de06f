//! The stage abstraction: the three kinds of node a pipeline can be built
//! from.
//!
//! A `Stage` is a tagged enum rather than a trait-object hierarchy — there
//! are exactly three shapes a node can take, and a closed enum lets the
//! composition algebra in [`crate::pipeline`] match on them exhaustively
//! instead of downcasting.

use std::sync::Arc;

use crate::queue::BoundedQueue;

/// One processing node in a pipeline.
///
/// `Filter` carries a pure function; `Source` and `Consumer` are only
/// constructible through [`Stage::source`] and [`Stage::consume`], which fix
/// `In`/`Out` to `()` at the type level rather than asserting it at
/// runtime.
pub enum Stage<In, Out> {
    /// Transforms `In` into `Out` by applying a function.
    Filter {
        /// Optional diagnostic name, surfaced in tracing spans and in
        /// `PipelineError::StageFailure`.
        name: Option<String>,
        /// The transform itself.
        f: Arc<dyn Fn(In) -> Out + Send + Sync>,
        /// Worker count for this stage, set via `.parallel(k)`.
        parallelism: usize,
    },
    /// Feeds values in from an externally owned queue. Only constructible
    /// with `In = ()`.
    Source {
        /// Optional diagnostic name.
        name: Option<String>,
        /// The upstream queue this stage forwards from.
        queue: BoundedQueue<Out>,
        /// Worker count (almost always 1 — see [`Stage::source`]'s docs).
        parallelism: usize,
    },
    /// Applies a sink function and produces nothing. Only constructible
    /// with `Out = ()`.
    Consumer {
        /// Optional diagnostic name.
        name: Option<String>,
        /// The sink function.
        f: Arc<dyn Fn(In) + Send + Sync>,
        /// Worker count for this stage, set via `.parallel(k)`.
        parallelism: usize,
    },
}

impl<In, Out> Stage<In, Out> {
    /// Builds a `Filter` stage from a pure function.
    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(In) -> Out + Send + Sync + 'static,
    {
        Stage::Filter { name: None, f: Arc::new(f), parallelism: 1 }
    }

    /// Returns this stage's diagnostic name, or a positional placeholder
    /// if none was set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Stage::Filter { name, .. } | Stage::Source { name, .. } | Stage::Consumer { name, .. } => {
                name.as_deref()
            }
        }
    }

    /// Attaches a diagnostic name, used in tracing spans and stage-failure
    /// messages.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Stage::Filter { name: n, .. }
            | Stage::Source { name: n, .. }
            | Stage::Consumer { name: n, .. } => *n = Some(name.into()),
        }
        self
    }

    /// Worker count configured for this stage.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        match self {
            Stage::Filter { parallelism, .. }
            | Stage::Source { parallelism, .. }
            | Stage::Consumer { parallelism, .. } => *parallelism,
        }
    }

    /// Returns a new stage with `k` workers instead of the default one.
    ///
    /// # Panics
    ///
    /// Panics if `k == 0` — `Stage::parallel(0)` is a programmer error, the
    /// same treatment `BoundedQueue::new(0)` gets.
    #[must_use]
    pub fn parallel(mut self, k: usize) -> Self {
        assert!(k > 0, "stage parallelism must be at least 1");
        match &mut self {
            Stage::Filter { parallelism, .. }
            | Stage::Source { parallelism, .. }
            | Stage::Consumer { parallelism, .. } => *parallelism = k,
        }
        self
    }
}

impl<Out> Stage<(), Out> {
    /// Builds a `Source` stage from an externally owned queue.
    ///
    /// Parallelism greater than 1 on a `Source` means several workers
    /// racing to pop the same upstream queue and push into the same
    /// downstream queue — legal, but it reorders values; most callers want
    /// the default of 1.
    pub fn source(queue: BoundedQueue<Out>) -> Self {
        Stage::Source { name: None, queue, parallelism: 1 }
    }
}

impl<In> Stage<In, ()> {
    /// Builds a `Consumer` stage from a sink function.
    pub fn consume<F>(f: F) -> Self
    where
        F: Fn(In) + Send + Sync + 'static,
    {
        Stage::Consumer { name: None, f: Arc::new(f), parallelism: 1 }
    }
}
