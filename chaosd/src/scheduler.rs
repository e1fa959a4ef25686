//! Chaos run lifecycle.
//!
//! [`ChaosScheduler`] owns the run state machine
//! (`Stopped -> Starting -> Running -> Stopping -> Stopped`), persists every
//! transition through a [`StateStore`], and drives an [`IterationExecutor`]
//! in a background task until the run's time or iteration budget is spent,
//! a stop is requested, or a run-fatal error occurs.
//!
//! All mutations of run state happen under one lock acquired with a bounded
//! wait. Every run ends with exactly one Stopped event, written by the run
//! task itself.

use crate::cluster::ClusterClients;
use crate::error::ChaosError;
use crate::events::EventStream;
use crate::executor::{IterationExecutor, IterationOutcome};
use crate::retry::RetryPolicy;
use crate::safety::{FatalHandler, ProcessAbort, SafetyAssertion, SafetyAssertionConfig};
use crate::state_store::{MemoryStateStore, StateStore};
use crate::telemetry::TelemetrySink;
use chaos_common::{
    ChaosEvent, ChaosParameters, ChaosStatus, ClusterError, ConfigError, ContextFlags,
    DEFAULT_RUN_ID, EngineConfig, FailoverPolicy, RunState, StopReason, TelemetryId,
};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Collaborators for a scheduler.
pub struct SchedulerDeps {
    pub clients: ClusterClients,
    pub store: Arc<dyn StateStore>,
    /// Created from `EngineConfig::max_events` when unset.
    pub events: Option<EventStream>,
    pub telemetry: TelemetrySink,
    pub fatal_handler: Arc<dyn FatalHandler>,
}

impl SchedulerDeps {
    /// In-memory state store, default telemetry, aborting fatal handler.
    pub fn new(clients: ClusterClients) -> Self {
        Self {
            clients,
            store: Arc::new(MemoryStateStore::new()),
            events: None,
            telemetry: TelemetrySink::default(),
            fatal_handler: Arc::new(ProcessAbort),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal_handler = handler;
        self
    }
}

#[derive(Clone)]
pub struct ChaosScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    controller_id: Uuid,
    config: EngineConfig,
    clients: ClusterClients,
    store: Arc<dyn StateStore>,
    events: EventStream,
    telemetry: TelemetrySink,
    fatal_handler: Arc<dyn FatalHandler>,
    shared: Mutex<Shared>,
    status: watch::Sender<RunState>,
}

struct Shared {
    state: RunState,
    run: Option<ActiveRun>,
}

struct ActiveRun {
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<StopReason>>,
    task: JoinHandle<()>,
}

impl ChaosScheduler {
    /// Open a scheduler over persisted state.
    ///
    /// A persisted active run cannot belong to this fresh controller, so it
    /// is reset to `Stopped` rather than resumed.
    pub async fn open(config: EngineConfig, deps: SchedulerDeps) -> Result<Self, ChaosError> {
        let controller_id = Uuid::new_v4();
        let events = deps
            .events
            .unwrap_or_else(|| EventStream::new(config.max_events));
        let mut state = deps.store.load().await?.unwrap_or_default();

        if state.is_orphaned(controller_id) {
            deps.telemetry.record(
                TelemetryId::ChaosSchedulerStateResetOnRestart,
                format!(
                    "run '{}' was {} at iteration {} with no live controller; resetting to stopped",
                    state.run_id, state.status, state.iteration
                ),
            );
            let already_stopped = events.last().is_some_and(|r| r.event.is_stopped());
            if !already_stopped {
                events.append(ChaosEvent::test_error(
                    "Chaos state was reset because the previous run did not stop cleanly.",
                ));
                events.append(ChaosEvent::stopped(StopReason::SystemCannotRestart));
            }
            state.transition(ChaosStatus::Stopped);
            state.controller_id = None;
            deps.store.save(&state).await?;
        }

        info!(
            controller_id = %controller_id,
            status = %state.status,
            run_id = %state.run_id,
            "Chaos scheduler opened"
        );

        let (status, _) = watch::channel(state.clone());
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                controller_id,
                config,
                clients: deps.clients,
                store: deps.store,
                events,
                telemetry: deps.telemetry,
                fatal_handler: deps.fatal_handler,
                shared: Mutex::new(Shared { state, run: None }),
                status,
            }),
        })
    }

    pub fn controller_id(&self) -> Uuid {
        self.inner.controller_id
    }

    /// Last durable run state.
    pub fn status(&self) -> RunState {
        self.inner.status.borrow().clone()
    }

    /// Follow durable state changes.
    pub fn watch_status(&self) -> watch::Receiver<RunState> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.inner.telemetry
    }

    /// Start a run under the default run id.
    pub async fn start(&self, params: ChaosParameters) -> Result<(), ChaosError> {
        self.start_with_run_id(DEFAULT_RUN_ID, params).await
    }

    /// Validate `params` and start a run.
    ///
    /// Parameter errors are returned before the cluster is contacted.
    pub async fn start_with_run_id(
        &self,
        run_id: &str,
        params: ChaosParameters,
    ) -> Result<(), ChaosError> {
        let flags = params.validate()?;
        let inner = &self.inner;
        let mut shared = inner.lock_shared().await?;
        if shared.state.status.is_active() {
            return Err(ChaosError::AlreadyRunning);
        }

        inner.validate_filter_against_cluster(&params, &flags).await?;

        let previous = std::mem::replace(
            &mut shared.state,
            RunState {
                run_id: run_id.to_string(),
                status: ChaosStatus::Starting,
                iteration: 0,
                started_at: Some(chrono::Utc::now()),
                elapsed: Duration::ZERO,
                time_to_run: params.time_to_run,
                controller_id: Some(inner.controller_id),
                last_updated: chrono::Utc::now(),
                parameters: Some(params.clone()),
            },
        );
        if let Err(e) = inner.commit(&mut shared).await {
            shared.state = previous;
            return Err(e);
        }
        inner.events.append(ChaosEvent::started(&params));

        // The run task persists state again on its first iteration.
        shared.state.transition(ChaosStatus::Running);
        if let Err(e) = inner.commit(&mut shared).await {
            warn!(error = %e, "Failed to persist running state");
        }

        let cancel = CancellationToken::new();
        let stop_reason = Arc::new(OnceLock::new());
        let executor = IterationExecutor::new(
            params.clone(),
            flags,
            inner.config.clone(),
            inner.clients.clone(),
            inner.events.clone(),
            inner.telemetry.clone(),
            SafetyAssertion::with_handler(
                SafetyAssertionConfig::new(inner.config.engine_assert_enabled, flags.forced_assert),
                inner.fatal_handler.clone(),
            ),
        );

        let span = info_span!("chaos_run", run_id = %run_id);
        let task = tokio::spawn(
            inner
                .clone()
                .run_loop(executor, params, flags, cancel.clone(), stop_reason.clone())
                .instrument(span),
        );
        shared.run = Some(ActiveRun {
            cancel,
            stop_reason,
            task,
        });

        info!(run_id, "Chaos run started");
        Ok(())
    }

    /// Stop the active run and wait for it to finish. No-op when stopped.
    pub async fn stop(&self) -> Result<(), ChaosError> {
        let inner = &self.inner;
        let task = {
            let mut shared = inner.lock_shared().await?;
            if !shared.state.status.is_active() {
                debug!("Stop requested with no active run");
                return Ok(());
            }
            if shared.state.status != ChaosStatus::Stopping {
                shared.state.transition(ChaosStatus::Stopping);
                inner.commit(&mut shared).await?;
            }
            match shared.run.take() {
                Some(run) => {
                    let _ = run.stop_reason.set(StopReason::UserInitiated);
                    run.cancel.cancel();
                    Some(run.task)
                }
                None => None,
            }
        };

        info!("Chaos stop requested");
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!(error = %e, "Chaos run task failed");
                }
            }
            None => self.wait_until_stopped().await,
        }
        Ok(())
    }

    /// Resolve once the durable status is `Stopped`.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|s| s.status == ChaosStatus::Stopped).await;
    }
}

impl SchedulerInner {
    /// Acquire the state lock, retrying bounded waits.
    async fn lock_shared(&self) -> Result<MutexGuard<'_, Shared>, ChaosError> {
        let attempts = self.config.scheduler_lock_retries + 1;
        for attempt in 1..=attempts {
            match timeout(self.config.scheduler_lock_wait, self.shared.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => warn!(attempt, attempts, "Scheduler lock is contended"),
            }
        }
        self.telemetry.record(
            TelemetryId::ChaosSchedulerLockAcquisitionTimeout,
            format!(
                "scheduler lock not acquired within {:?} after {attempts} attempts",
                self.config.scheduler_lock_wait
            ),
        );
        Err(ChaosError::LockTimeout { attempts })
    }

    /// Persist the current state, then publish it.
    async fn commit(&self, shared: &mut Shared) -> Result<(), ChaosError> {
        self.store.save(&shared.state).await?;
        self.status.send_replace(shared.state.clone());
        Ok(())
    }

    /// Every included node type must exist in the cluster.
    async fn validate_filter_against_cluster(
        &self,
        params: &ChaosParameters,
        flags: &ContextFlags,
    ) -> Result<(), ChaosError> {
        let Some(filter) = &params.target_filter else {
            return Ok(());
        };
        if flags.disable_target_filter_validation || filter.include_node_types.is_empty() {
            return Ok(());
        }

        let query = self.clients.query.clone();
        let nodes = RetryPolicy::from_config(&self.config)
            .execute(
                "GetNodeList",
                |request_timeout| {
                    let query = query.clone();
                    async move { query.get_node_list(request_timeout).await }
                },
                ClusterError::is_retryable,
                self.config.max_snapshot_retries,
                self.config.snapshot_operation_timeout,
                &CancellationToken::new(),
            )
            .await?;

        let known: BTreeSet<&str> = nodes.iter().map(|n| n.node_type.as_str()).collect();
        if let Some(missing) = filter
            .include_node_types
            .iter()
            .find(|t| !known.contains(t.as_str()))
        {
            return Err(ConfigError::InvalidTargetFilter(format!(
                "node type '{missing}' does not exist in the cluster"
            ))
            .into());
        }
        Ok(())
    }

    async fn run_loop(
        self: Arc<Self>,
        mut executor: IterationExecutor,
        params: ChaosParameters,
        flags: ContextFlags,
        cancel: CancellationToken,
        stop_reason: Arc<OnceLock<StopReason>>,
    ) {
        let started = Instant::now();
        let timer = spawn_auto_stop(params.time_to_run, cancel.clone(), stop_reason.clone());

        let mut completed: u64 = 0;
        let budget_spent =
            |completed: u64| params.max_iterations.is_some_and(|max| completed >= max);

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::UserInitiated;
            }
            if started.elapsed() >= params.time_to_run {
                break StopReason::TimeToRunElapsed;
            }
            if budget_spent(completed) {
                break StopReason::IterationBudgetReached;
            }
            let Some(iteration) = self.record_iteration(started.elapsed()).await else {
                self.pause(self.config.scheduler_cycle_wait, &cancel).await;
                continue;
            };

            let span = info_span!("iteration", iteration);
            match executor.run_iteration(&cancel).instrument(span).await {
                Ok(IterationOutcome::ValidationFailed)
                    if flags.failover_after_faults == FailoverPolicy::Halt =>
                {
                    break StopReason::ValidationFailureHalt;
                }
                Ok(IterationOutcome::Cancelled) => continue,
                Ok(outcome) => debug!(iteration, ?outcome, "Iteration finished"),
                Err(e) => {
                    error!(iteration, error = %e, "Run-fatal error");
                    self.events.append(ChaosEvent::test_error(&format!(
                        "Chaos run stopped by a run-fatal error: {e}"
                    )));
                    break StopReason::RunFatal;
                }
            }

            completed += 1;
            if budget_spent(completed) {
                continue;
            }
            // Polling tick, then the configured pause between iterations.
            if self.pause(self.config.scheduler_cycle_wait, &cancel).await {
                self.pause(params.wait_time_between_iterations, &cancel).await;
            }
        };

        // An earlier stop request or timer expiry wins over the loop's reason.
        let reason = *stop_reason.get_or_init(|| reason);
        cancel.cancel();
        if let Err(e) = timer.await {
            warn!(error = %e, "Auto-stop timer task failed");
        }
        self.finish(reason, started.elapsed()).await;
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Bump and persist the iteration counter. `None` if the lock or the
    /// store is unavailable; the loop retries on its next tick.
    async fn record_iteration(&self, elapsed: Duration) -> Option<u64> {
        let mut shared = match self.lock_shared().await {
            Ok(shared) => shared,
            Err(e) => {
                warn!(error = %e, "Skipping iteration: state lock unavailable");
                return None;
            }
        };
        shared.state.iteration += 1;
        shared.state.elapsed = elapsed;
        shared.state.last_updated = chrono::Utc::now();
        let iteration = shared.state.iteration;
        if let Err(e) = self.commit(&mut shared).await {
            warn!(error = %e, "Skipping iteration: run state not persisted");
            shared.state.iteration -= 1;
            return None;
        }
        Some(iteration)
    }

    /// Emit the run's single Stopped event and persist the final state.
    async fn finish(&self, reason: StopReason, elapsed: Duration) {
        let mut shared = match self.lock_shared().await {
            Ok(shared) => shared,
            Err(e) => {
                warn!(error = %e, "Waiting without bound to record run stop");
                self.shared.lock().await
            }
        };
        self.events.append(ChaosEvent::stopped(reason));
        shared.state.elapsed = elapsed;
        shared.state.controller_id = None;
        shared.state.transition(ChaosStatus::Stopped);
        shared.run = None;
        if let Err(e) = self.store.save(&shared.state).await {
            error!(error = %e, "Failed to persist stopped run state");
        }
        self.status.send_replace(shared.state.clone());
        info!(
            reason = %reason,
            iterations = shared.state.iteration,
            "Chaos run stopped: {}",
            reason.message()
        );
    }
}

/// Cancel the run when its time budget elapses.
fn spawn_auto_stop(
    time_to_run: Duration,
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<StopReason>>,
) -> JoinHandle<()> {
    let deadline = Instant::now().checked_add(time_to_run);
    tokio::spawn(async move {
        let Some(deadline) = deadline else {
            cancel.cancelled().await;
            return;
        };
        tokio::select! {
            _ = sleep_until(deadline) => {
                if stop_reason.set(StopReason::TimeToRunElapsed).is_ok() {
                    info!("Time to run elapsed; stopping chaos");
                }
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}
