//! Component wiring from a [`TasksConfig`].
//!
//! [`TaskRuntime::from_config`] is the single place where backends are
//! chosen and connected. Every component receives its collaborators as
//! explicit handles; nothing is looked up from a global.
//!
//! ```rust,no_run
//! use async_tasks::{handler_fn, TaskRuntime, TasksConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TasksConfig::load()?;
//! let runtime = TaskRuntime::from_config(&config, handler_fn(|p| async move { Ok(p) })).await?;
//!
//! let shutdown = CancellationToken::new();
//! let mut handles = runtime.spawn_workers(shutdown.clone());
//! handles.push(runtime.spawn_sweeper(shutdown.clone()));
//!
//! tokio::signal::ctrl_c().await?;
//! shutdown.cancel();
//! for handle in handles {
//!     handle.await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, TasksConfig};
use crate::dispatcher::Dispatcher;
use crate::error::TaskError;
use crate::idempotency::{BackendIdempotencyIndex, IdempotencyIndex};
use crate::lifecycle::LifecycleController;
use crate::queue::{InMemoryWorkQueue, QueueError, WorkQueue};
use crate::runner::{ExecutionRunner, TaskHandler};
use crate::store::{GenericTaskStore, InMemoryBackend, StorageBackend, StorageError, TaskStore};

/// Errors raised while building a [`TaskRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The storage backend could not be reached.
    #[error("storage backend unavailable: {0}")]
    Storage(#[from] StorageError),

    /// The work queue could not be reached.
    #[error("work queue unavailable: {0}")]
    Queue(#[from] QueueError),

    /// A backend was requested that this build does not include.
    #[error("backend '{0}' is not compiled in (enable the `redis` feature)")]
    Unsupported(String),
}

/// Result of one [`TaskRuntime::sweep_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `PENDING` tasks re-published.
    pub requeued: usize,
    /// `PROCESSING` tasks handed back to `PENDING`.
    pub recovered: usize,
}

/// Every component of the task system, connected.
pub struct TaskRuntime {
    config: TasksConfig,
    store: Arc<dyn TaskStore>,
    index: Arc<dyn IdempotencyIndex>,
    queue: Arc<dyn WorkQueue>,
    dispatcher: Arc<Dispatcher>,
    controller: Arc<LifecycleController>,
    runner: Arc<ExecutionRunner>,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

async fn build_backend(config: &TasksConfig) -> Result<Arc<dyn StorageBackend>, RuntimeError> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "redis")]
        "redis" => {
            let backend = crate::store::redis::RedisBackend::new(&config.storage.redis_url)
                .await?
                .with_prefix(config.storage.key_prefix.clone());
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "redis"))]
        "redis" => Err(RuntimeError::Unsupported("redis".to_string())),
        other => Err(ConfigError::Invalid(format!("unknown storage backend '{other}'")).into()),
    }
}

async fn build_queue(config: &TasksConfig) -> Result<Arc<dyn WorkQueue>, RuntimeError> {
    match config.queue.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryWorkQueue::new())),
        #[cfg(feature = "redis")]
        "redis" => {
            let queue = crate::queue::redis::RedisWorkQueue::new(&config.queue.redis_url)
                .await?
                .with_queue_name(config.queue.queue_name.clone());
            Ok(Arc::new(queue))
        },
        #[cfg(not(feature = "redis"))]
        "redis" => Err(RuntimeError::Unsupported("redis".to_string())),
        other => Err(ConfigError::Invalid(format!("unknown queue backend '{other}'")).into()),
    }
}

impl TaskRuntime {
    /// Connects the configured backends and wires every component.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Config`] if the configuration does not validate.
    /// - [`RuntimeError::Storage`] / [`RuntimeError::Queue`] if a Redis
    ///   backend cannot be reached.
    /// - [`RuntimeError::Unsupported`] if Redis is requested without the
    ///   `redis` feature.
    pub async fn from_config(
        config: &TasksConfig,
        handler: impl TaskHandler + 'static,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let backend = build_backend(config).await?;
        let queue = build_queue(config).await?;

        // Records and keys share one backend under different namespaces.
        let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(Arc::clone(&backend)));
        let index: Arc<dyn IdempotencyIndex> = Arc::new(BackendIdempotencyIndex::new(backend));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&queue),
        ));
        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&dispatcher),
        ));
        let runner = Arc::new(
            ExecutionRunner::new(Arc::clone(&store), Arc::clone(&queue), Arc::new(handler))
                .with_retry(config.retry.clone())
                .with_idle_wait(config.worker.idle_backoff()),
        );

        tracing::info!(
            storage = %config.storage.backend,
            queue = %config.queue.backend,
            workers = config.worker.concurrency,
            "task runtime ready"
        );

        Ok(Self {
            config: config.clone(),
            store,
            index,
            queue,
            dispatcher,
            controller,
            runner,
        })
    }

    /// The configuration this runtime was built from.
    pub fn config(&self) -> &TasksConfig {
        &self.config
    }

    /// Submission and status lookup.
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Claim, execute and the worker loop.
    pub fn runner(&self) -> &Arc<ExecutionRunner> {
        &self.runner
    }

    /// Enqueue and the requeue sweep.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The idempotency index.
    pub fn index(&self) -> &Arc<dyn IdempotencyIndex> {
        &self.index
    }

    /// The work queue.
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Spawns `worker.concurrency` workers that stop when `shutdown` fires.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.runner
            .spawn_workers(self.config.worker.concurrency, shutdown)
    }

    /// Runs the requeue and recovery sweeps once with the configured
    /// thresholds.
    ///
    /// # Errors
    ///
    /// [`TaskError::TransientStorage`] if the store or queue is unreachable.
    pub async fn sweep_once(&self) -> Result<SweepReport, TaskError> {
        let recovered = self
            .controller
            .recover_stale(self.config.sweep.processing_timeout())
            .await?;
        let requeued = self
            .controller
            .requeue_stale(self.config.sweep.requeue_after())
            .await?;
        Ok(SweepReport {
            requeued,
            recovered,
        })
    }

    /// Spawns a task that calls [`sweep_once`](Self::sweep_once) every
    /// `sweep.interval_secs` until `shutdown` fires.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let sweep = self.config.sweep.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                if let Err(e) = controller.recover_stale(sweep.processing_timeout()).await {
                    tracing::warn!(error = %e, "recovery sweep failed");
                }
                match controller.requeue_stale(sweep.requeue_after()).await {
                    Ok(0) => {},
                    Ok(n) => tracing::info!(requeued = n, "requeue sweep finished"),
                    Err(e) => tracing::warn!(error = %e, "requeue sweep failed"),
                }
            }
            tracing::debug!("sweeper stopped");
        })
    }
}
