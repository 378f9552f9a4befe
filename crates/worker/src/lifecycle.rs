// Worker lifecycle
//
// Owns the backend session and the execution pool for one worker run:
// connect, register the fixed handler set, run the dispatch loop, and tear
// everything down in order whatever way the run ends.
//
// Decision: errors are caught once at the outermost level of `run`, logged
// with their full chain, and turned into a LifecycleOutcome; nothing is
// re-raised to the caller.
// Decision: teardown order is pool drain, then backend close, then the
// secondary resource manager. The manager is shut down exactly once, even
// when the run future is dropped mid-flight.
// Decision: once the shutdown signal fires, the dispatch loop gets
// `shutdown_timeout` to stop before the run is reported failed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use maap_core::{Logger, WorkerSettings};
use maap_durable::backend::{BackendAddress, BackendConnector, TaskQueueBackend};
use maap_durable::engine::{HandlerRegistry, RegistryError};
use maap_durable::worker::{ExecutionPool, PollerConfig, Worker, WorkerConfig};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{ACTIVITY_TYPES, WORKFLOW_TYPES};

/// One-shot builder of the handler set
pub type Registrar = Box<dyn FnOnce() -> Result<HandlerRegistry, RegistryError> + Send>;

/// External handle torn down when the worker stops
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str {
        "resource manager"
    }

    /// Release everything the manager holds
    ///
    /// Failures are the manager's to log; teardown never fails the run.
    async fn shutdown(&self);
}

// ============================================================================
// State machine
// ============================================================================

/// Lifecycle states
///
/// ```text
/// Created → Connecting → Registering → Running ─┬────────────→ ShuttingDown → Terminated
///    │          │             │           │     └→ Error ─────────↑
///    │          └─────────────┴───────────┴──→ Error | Cancelled ─┤
///    └──────────────────────────────────────────→ Cancelled ──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Connecting,
    Registering,
    Running,
    Error,
    Cancelled,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Registering)
                | (Registering, Running)
                | (Connecting | Registering | Running, Error)
                | (Created | Connecting | Registering | Running, Cancelled)
                | (Created | Connecting | Registering | Running | Error | Cancelled, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Running => "running",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug)]
pub enum LifecycleOutcome {
    /// The dispatch loop returned on its own
    Stopped,
    /// The shutdown signal interrupted the run
    Cancelled,
    /// Startup or the dispatch loop failed; already logged
    Failed { error: anyhow::Error },
}

impl LifecycleOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

// ============================================================================
// Teardown guard
// ============================================================================

/// Drains the pool, then releases the backend session and the resource
/// manager, exactly once
///
/// The lifecycle calls [`TeardownGuard::teardown`] on every orderly exit.
/// If the guard is dropped before that, for example because the run future
/// was dropped, the same teardown is spawned onto the current runtime.
pub struct TeardownGuard {
    pool: Option<Arc<ExecutionPool>>,
    drain_timeout: Duration,
    backend: Option<Arc<dyn TaskQueueBackend>>,
    manager: Option<Arc<dyn ResourceManager>>,
}

impl TeardownGuard {
    pub fn new(manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            pool: None,
            drain_timeout: Duration::ZERO,
            backend: None,
            manager: Some(manager),
        }
    }

    /// Drain this pool, for at most `drain_timeout`, before anything closes
    pub fn track_pool(&mut self, pool: Arc<ExecutionPool>, drain_timeout: Duration) {
        self.pool = Some(pool);
        self.drain_timeout = drain_timeout;
    }

    /// Close this backend session as part of teardown
    pub fn track_backend(&mut self, backend: Arc<dyn TaskQueueBackend>) {
        self.backend = Some(backend);
    }

    /// Whether the manager teardown has already been started
    pub fn is_done(&self) -> bool {
        self.manager.is_none()
    }

    /// Drain the pool, close the backend, then shut the manager down
    pub async fn teardown(&mut self) {
        teardown(
            self.pool.take(),
            self.drain_timeout,
            self.backend.take(),
            self.manager.take(),
        )
        .await;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.manager.is_none() && self.backend.is_none() && self.pool.is_none() {
            return;
        }

        let pool = self.pool.take();
        let backend = self.backend.take();
        let manager = self.manager.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Worker run dropped before teardown, tearing down in background");
                handle.spawn(teardown(pool, self.drain_timeout, backend, manager));
            }
            Err(_) => error!("No runtime available, resource teardown skipped"),
        }
    }
}

async fn teardown(
    pool: Option<Arc<ExecutionPool>>,
    drain_timeout: Duration,
    backend: Option<Arc<dyn TaskQueueBackend>>,
    manager: Option<Arc<dyn ResourceManager>>,
) {
    if let Some(pool) = pool {
        if let Err(e) = pool.release(drain_timeout).await {
            warn!(error = %e, "Execution pool did not drain cleanly");
        }
    }

    if let Some(backend) = backend {
        match backend.close().await {
            Ok(()) => debug!("Backend connection closed"),
            Err(e) => warn!(error = %e, "Failed to close backend connection"),
        }
    }

    if let Some(manager) = manager {
        info!(manager = manager.name(), "Shutting down resource manager");
        manager.shutdown().await;
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Drives one worker run from connection to teardown
///
/// ```ignore
/// let lifecycle = WorkerLifecycle::new(settings, connector, registrar, manager, logger);
/// let mut state = lifecycle.subscribe();
/// let outcome = lifecycle.run(tokio::signal::ctrl_c().map(|_| ())).await;
/// ```
pub struct WorkerLifecycle {
    settings: WorkerSettings,
    connector: Arc<dyn BackendConnector>,
    registrar: Mutex<Option<Registrar>>,
    manager: Arc<dyn ResourceManager>,
    logger: Logger,
    workflow_types: &'static [&'static str],
    activity_types: &'static [&'static str],
    poller: PollerConfig,
    max_consecutive_poll_failures: Option<u32>,
    state: watch::Sender<LifecycleState>,
}

impl WorkerLifecycle {
    pub fn new<R>(
        settings: WorkerSettings,
        connector: Arc<dyn BackendConnector>,
        registrar: R,
        manager: Arc<dyn ResourceManager>,
        logger: Logger,
    ) -> Self
    where
        R: FnOnce() -> Result<HandlerRegistry, RegistryError> + Send + 'static,
    {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            settings,
            connector,
            registrar: Mutex::new(Some(Box::new(registrar))),
            manager,
            logger,
            workflow_types: WORKFLOW_TYPES,
            activity_types: ACTIVITY_TYPES,
            poller: PollerConfig::default(),
            max_consecutive_poll_failures: None,
            state,
        }
    }

    /// Override the identities that must resolve before the loop starts
    pub fn with_identities(
        mut self,
        workflow_types: &'static [&'static str],
        activity_types: &'static [&'static str],
    ) -> Self {
        self.workflow_types = workflow_types;
        self.activity_types = activity_types;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_max_consecutive_poll_failures(mut self, max: u32) -> Self {
        self.max_consecutive_poll_failures = Some(max);
        self
    }

    /// Watch lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Run the worker until it stops, fails or `shutdown_signal` resolves
    ///
    /// Teardown runs on every path before this returns.
    pub async fn run<F>(self, shutdown_signal: F) -> LifecycleOutcome
    where
        F: Future<Output = ()> + Send,
    {
        let mut guard = TeardownGuard::new(self.manager.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let registrar = self.registrar.lock().take();

        let outcome = {
            let start = self.start(registrar, &mut guard, stop_rx);
            tokio::pin!(start);
            tokio::pin!(shutdown_signal);

            tokio::select! {
                biased;

                result = start.as_mut() => match result {
                    Ok(()) => LifecycleOutcome::Stopped,
                    Err(error) => {
                        self.transition(LifecycleState::Error);
                        self.report_failure(&error);
                        LifecycleOutcome::Failed { error }
                    }
                },
                _ = shutdown_signal.as_mut() => {
                    self.logger.info("Shutdown signal received, stopping worker");
                    let was_running = self.state() == LifecycleState::Running;
                    self.transition(LifecycleState::Cancelled);

                    if was_running {
                        let _ = stop_tx.send(true);
                        let timeout = self.settings.shutdown_timeout;
                        match tokio::time::timeout(timeout, start.as_mut()).await {
                            Ok(Ok(())) => LifecycleOutcome::Cancelled,
                            Ok(Err(error)) => {
                                self.report_failure(&error);
                                LifecycleOutcome::Failed { error }
                            }
                            Err(_) => {
                                let error = anyhow!("dispatch loop did not stop within {timeout:?}");
                                self.report_failure(&error);
                                LifecycleOutcome::Failed { error }
                            }
                        }
                    } else {
                        LifecycleOutcome::Cancelled
                    }
                }
            }
        };

        self.shutdown(&mut guard).await;
        outcome
    }

    async fn start(
        &self,
        registrar: Option<Registrar>,
        guard: &mut TeardownGuard,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let settings = &self.settings;

        self.transition(LifecycleState::Connecting);
        let target = settings.backend_address();
        self.logger.info(format!("Connecting to backend at {target}"));

        let address = BackendAddress::new(&settings.backend_host, settings.backend_port)
            .with_context(|| format!("invalid backend address {target}"))?;
        let backend = self
            .connector
            .connect(&address)
            .await
            .context("backend connection failed")?;
        guard.track_backend(backend.clone());

        self.transition(LifecycleState::Registering);
        self.logger
            .info(format!("Starting worker on task queue {}", settings.task_queue));

        let pool = Arc::new(ExecutionPool::new(settings.max_concurrent_activities));
        guard.track_pool(pool.clone(), settings.shutdown_timeout);

        let registrar = registrar.context("handler registrar already consumed")?;
        let registry = registrar().context("failed to build handler registry")?;
        registry
            .ensure_resolvable(self.workflow_types, self.activity_types)
            .context("handler registry is incomplete")?;

        let mut config = WorkerConfig::new(settings.worker_id.clone(), settings.task_queue.clone())
            .with_poller(self.poller.clone());
        if let Some(max) = self.max_consecutive_poll_failures {
            config = config.with_max_consecutive_poll_failures(max);
        }
        let worker = Worker::new(backend, Arc::new(registry), config);

        self.logger.ainfo("Worker starting...").await;
        self.transition(LifecycleState::Running);

        worker
            .run(&pool, stop_rx)
            .await
            .context("worker run loop failed")
    }

    async fn shutdown(&self, guard: &mut TeardownGuard) {
        self.transition(LifecycleState::ShuttingDown);
        guard.teardown().await;

        self.transition(LifecycleState::Terminated);
        info!(worker_id = %self.settings.worker_id, "Worker lifecycle terminated");
    }

    fn report_failure(&self, err: &anyhow::Error) {
        self.logger.error(format!("Worker failed: {err:?}"));
        error!(error = %err, details = ?err, "Worker lifecycle failed");
    }

    fn transition(&self, next: LifecycleState) {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Lifecycle transition");
                *current = next;
                true
            } else {
                warn!(from = %current, to = %next, "Ignoring invalid lifecycle transition");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ResourceManager for Counting {
        async fn shutdown(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use LifecycleState::*;

        let path = [Created, Connecting, Registering, Running, ShuttingDown, Terminated];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_transitions() {
        use LifecycleState::*;

        assert!(Connecting.can_transition_to(Error));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Error.can_transition_to(ShuttingDown));
        assert!(Cancelled.can_transition_to(ShuttingDown));
        assert!(Registering.can_transition_to(ShuttingDown));
        assert!(Created.can_transition_to(Cancelled));
        assert!(Created.can_transition_to(ShuttingDown));
    }

    #[test]
    fn test_illegal_transitions() {
        use LifecycleState::*;

        assert!(!Created.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(Connecting));
        assert!(!Terminated.can_transition_to(ShuttingDown));
        assert!(!Error.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Error));
        assert!(!Created.can_transition_to(Error));
        assert!(Terminated.is_terminal());
    }

    #[tokio::test]
    async fn test_guard_tears_down_once() {
        let manager = Arc::new(Counting(AtomicUsize::new(0)));
        let mut guard = TeardownGuard::new(manager.clone());

        guard.teardown().await;
        assert!(guard.is_done());
        guard.teardown().await;
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(manager.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_spawns_teardown() {
        let manager = Arc::new(Counting(AtomicUsize::new(0)));
        drop(TeardownGuard::new(manager.clone()));

        for _ in 0..10 {
            if manager.0.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_drains_pool_before_manager() {
        let manager = Arc::new(Counting(AtomicUsize::new(0)));
        let pool = Arc::new(ExecutionPool::new(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let finished = finished.clone();
            pool.submit(async move {
                let _ = release_rx.await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        let mut guard = TeardownGuard::new(manager.clone());
        guard.track_pool(pool.clone(), Duration::from_secs(2));
        drop(guard);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.is_closed());
        assert_eq!(manager.0.load(Ordering::SeqCst), 0);

        let _ = release_tx.send(());
        for _ in 0..100 {
            if manager.0.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(manager.0.load(Ordering::SeqCst), 1);
    }
}
