//! The Supervisor owns every long-running service of the engine: the
//! dispatcher, the scheduler and its timers, and the metrics collector. It
//! wires them together, watches their health through a `JoinSet`, and
//! orchestrates graceful shutdown on SIGINT/SIGTERM or on the death of a
//! critical task.

use std::sync::Arc;

use thiserror::Error;
use tokio::signal;
use tokio::task::JoinSet;

use crate::block::BlockAssembler;
use crate::context::{AppContext, AppContextError};
use crate::fetcher::dispatcher::{BlockDispatcher, SingleDispatcher};
use crate::fetcher::worker::WorkerDispatcher;
use crate::fetcher::{FetchScheduler, MemoryGate};
use crate::indexer::{HandlerRuntime, IndexerService};
use crate::persistence::traits::StateRepository;
use crate::store::StoreService;
use crate::unfinalized::UnfinalizedTracker;

/// Represents the set of errors that can occur during the supervisor's
/// operation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A context was not provided to the `SupervisorBuilder`.
    #[error("Missing application context for Supervisor")]
    MissingContext,

    /// A store was not provided to the `SupervisorBuilder`.
    #[error("Missing store service for Supervisor")]
    MissingStore,

    /// A handler runtime was not provided to the `SupervisorBuilder`.
    #[error("Missing handler runtime for Supervisor")]
    MissingRuntime,

    /// Context initialization failed.
    #[error(transparent)]
    Context(#[from] AppContextError),
}

enum Dispatcher {
    Single(Arc<SingleDispatcher>),
    Workers(Arc<WorkerDispatcher>),
}

impl Dispatcher {
    fn as_dyn(&self) -> Arc<dyn BlockDispatcher> {
        match self {
            Self::Single(d) => Arc::clone(d) as Arc<dyn BlockDispatcher>,
            Self::Workers(d) => Arc::clone(d) as Arc<dyn BlockDispatcher>,
        }
    }

    fn memory_gate(&self) -> Option<Arc<MemoryGate>> {
        match self {
            Self::Single(_) => None,
            Self::Workers(d) => Some(d.memory_gate()),
        }
    }
}

/// The primary runtime manager for the engine.
pub struct Supervisor {
    context: AppContext,
    store: Arc<dyn StoreService>,
    runtime: Arc<dyn HandlerRuntime>,
    join_set: JoinSet<()>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Returns a new `SupervisorBuilder`, the public entry point for
    /// creating a supervisor.
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    /// Starts every service and runs until shutdown.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let token = self.context.token.clone();

        // Listen for shutdown signals.
        let signal_token = token.clone();
        self.join_set.spawn(async move {
            let ctrl_c = signal::ctrl_c();
            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to register SIGTERM handler.");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT received, initiating graceful shutdown."),
                _ = terminate => tracing::info!("SIGTERM received, initiating graceful shutdown."),
                _ = signal_token.cancelled() => {}
            }
            signal_token.cancel();
        });

        let metrics_collector = self.context.metrics.spawn_collector(&self.context.events);

        let config = Arc::clone(&self.context.config);
        let unfinalized_tracker =
            config.unfinalized_blocks.then(|| Arc::new(UnfinalizedTracker::new()));

        let assembler = BlockAssembler::new(config.fetch_concurrency);
        let indexer = Arc::new(IndexerService::new(
            Arc::clone(&self.context.project),
            Arc::clone(&self.context.pool),
            Arc::clone(&self.store),
            Arc::clone(&self.runtime),
            unfinalized_tracker.clone(),
        ));

        let queue_capacity = (config.batch_size * 3) as usize;
        let dispatcher = if config.workers == 0 {
            Dispatcher::Single(SingleDispatcher::new(
                queue_capacity,
                config.fetch_concurrency,
                Arc::clone(&self.context.pool),
                assembler,
                indexer,
                Arc::clone(&self.context.project),
                Arc::clone(&self.store),
                self.context.repository.clone(),
                self.context.dictionary.clone(),
                self.context.events.clone(),
            ))
        } else {
            Dispatcher::Workers(WorkerDispatcher::new(
                config.workers,
                queue_capacity,
                config.fetch_concurrency,
                Arc::clone(&self.context.pool),
                assembler,
                indexer,
                Arc::clone(&self.context.project),
                Arc::clone(&self.store),
                self.context.repository.clone(),
                self.context.dictionary.clone(),
                self.context.events.clone(),
                token.clone(),
            ))
        };
        // Resume exactly where the last run committed.
        let resume_from = self.context.init_height.checked_sub(1);
        match &dispatcher {
            Dispatcher::Single(d) => d.init_latest_buffered(resume_from),
            Dispatcher::Workers(d) => d.init_latest_buffered(resume_from),
        }

        // The dispatcher processing loop; a fatal error here tears the
        // whole engine down.
        let dispatch_token = token.clone();
        match &dispatcher {
            Dispatcher::Single(d) => {
                let d = Arc::clone(d);
                self.join_set.spawn(async move {
                    if let Err(e) = d.run(dispatch_token.clone()).await {
                        tracing::error!(error = %e, "Block dispatcher failed; shutting down.");
                        dispatch_token.cancel();
                    }
                });
            }
            Dispatcher::Workers(d) => {
                let d = Arc::clone(d);
                self.join_set.spawn(async move {
                    if let Err(e) = d.run(dispatch_token.clone()).await {
                        tracing::error!(error = %e, "Worker dispatcher failed; shutting down.");
                        dispatch_token.cancel();
                    }
                });
            }
        }

        let scheduler = FetchScheduler::new(
            config,
            Arc::clone(&self.context.project),
            Arc::clone(&self.context.pool),
            self.context.dictionary.clone(),
            dispatcher.as_dyn(),
            unfinalized_tracker,
            dispatcher.memory_gate(),
            self.context.events.clone(),
            self.context.init_height,
        );
        self.join_set.spawn(Arc::clone(&scheduler).run(token.clone()));
        self.join_set.spawn(Arc::clone(&scheduler).run_finalized_poller(token.clone()));
        self.join_set.spawn(Arc::clone(&scheduler).run_best_poller(token.clone()));
        self.join_set.spawn(Arc::clone(&scheduler).run_batch_scale_timer(token.clone()));

        tracing::info!("All services started.");

        // Supervise until shutdown; a terminated critical task cancels the
        // rest.
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::info!("Supervisor cancellation signal received, shutting down...");
                    break;
                }

                Some(result) = self.join_set.join_next() => {
                    if let Err(e) = result {
                        tracing::error!("A critical task failed: {e:?}. Initiating shutdown.");
                        token.cancel();
                    }
                }
            }
        }

        // Graceful shutdown: drain tasks within the configured timeout.
        let shutdown_timeout = self.context.config.shutdown_timeout;
        if tokio::time::timeout(shutdown_timeout, self.join_set.shutdown()).await.is_err() {
            tracing::warn!(
                "Tasks did not complete within {:?}. Continuing shutdown.",
                shutdown_timeout
            );
        }
        metrics_collector.abort();

        match self
            .context
            .repository
            .last_processed_height(self.context.project.chain())
            .await
        {
            Ok(Some(height)) => {
                tracing::info!(last_processed_height = height, "Final state recorded.")
            }
            Ok(None) => tracing::info!("Final state: no blocks processed yet."),
            Err(e) => tracing::warn!(error = %e, "Could not read final state during shutdown."),
        }

        tracing::info!("Supervisor shutdown complete.");
        Ok(())
    }
}

/// Assembles a [`Supervisor`] from its required components.
#[derive(Default)]
pub struct SupervisorBuilder {
    context: Option<AppContext>,
    store: Option<Arc<dyn StoreService>>,
    runtime: Option<Arc<dyn HandlerRuntime>>,
}

impl SupervisorBuilder {
    /// Sets the initialized application context.
    pub fn context(mut self, context: AppContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the entity store implementation.
    pub fn store(mut self, store: Arc<dyn StoreService>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the handler runtime implementation.
    pub fn runtime(mut self, runtime: Arc<dyn HandlerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the supervisor.
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        Ok(Supervisor {
            context: self.context.ok_or(SupervisorError::MissingContext)?,
            store: self.store.ok_or(SupervisorError::MissingStore)?,
            runtime: self.runtime.ok_or(SupervisorError::MissingRuntime)?,
            join_set: JoinSet::new(),
        })
    }
}
