//! Task submission and lifecycle core for an asynchronous tasks API.
//!
//! This crate owns the parts of a "submit work, poll for the result" system
//! that need real design: task identity, submission idempotency, persisted
//! state transitions, and at-least-once dispatch to competing workers with an
//! exactly-once *visible* effect.
//!
//! # Overview
//!
//! A task moves through a small state machine
//! (`PENDING` -> `PROCESSING` -> `COMPLETED`/`FAILED`). Every transition is a
//! compare-and-set on the stored record, so independent processes can race on
//! the same task and exactly one of them wins. Duplicate submissions are
//! collapsed by an idempotency index whose only write primitive is an atomic
//! create-if-absent.
//!
//! # Module Organization
//!
//! - [`types`] - Status enum and the request/response views a transport maps
//! - [`domain`] - [`TaskRecord`], the persisted representation of a task
//! - [`store`] - Storage backends and the CAS-guarded [`store::TaskStore`]
//! - [`idempotency`] - Idempotency key -> task id index
//! - [`queue`] - Competing-consumers work queue seam
//! - [`dispatcher`] - Persist-then-enqueue delivery and the stale requeue sweep
//! - [`runner`] - Claim / execute / complete / fail, plus the worker loop
//! - [`lifecycle`] - Submission algorithm, status lookup, stale recovery
//! - [`config`] and [`runtime`] - Typed configuration and component wiring
//! - [`retry`] - Backoff helper for transient storage failures
//! - [`error`] - [`TaskError`] taxonomy

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod idempotency;
pub mod lifecycle;
#[cfg(feature = "logging")]
pub mod logging;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod store;
pub mod types;

// Re-exports for ergonomic access
pub use config::{ConfigError, TasksConfig};
pub use dispatcher::Dispatcher;
pub use domain::{TaskRecord, TransitionFields};
pub use error::TaskError;
pub use idempotency::{IdempotencyIndex, Reservation};
pub use lifecycle::LifecycleController;
pub use queue::{QueueEntry, WorkQueue};
pub use runner::{handler_fn, ExecutionRunner, ProcessOutcome, TaskHandler};
pub use runtime::{RuntimeError, SweepReport, TaskRuntime};
pub use store::TaskStore;
pub use types::*;
