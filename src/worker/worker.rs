//! Periodic execution of one unit's actions, with bounded error counting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FatalReason, UnitError, WorkerError};
use crate::worker::state::WorkerState;
use crate::worker::unit::Unit;

/// Errors tolerated before a worker gives up. The next one is fatal.
pub const MAX_WORKER_ERRORS: usize = 10;

/// Default time `stop` waits for the loop to confirm termination.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole milliseconds of `period`, saturating.
pub(crate) fn as_millis(period: Duration) -> u64 {
    u64::try_from(period.as_millis()).unwrap_or(u64::MAX)
}

/// Shared between the worker and its run loop.
#[derive(Debug)]
struct WorkerStatus {
    state: WorkerState,
    error_count: usize,
    exceptions: Vec<String>,
    error_kinds: Vec<&'static str>,
    next_cycle_at: Option<Instant>,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            state: WorkerState::Constructed,
            error_count: 0,
            exceptions: Vec::new(),
            error_kinds: Vec::new(),
            next_cycle_at: None,
        }
    }

    fn transition(&mut self, worker: &str, target: WorkerState) {
        if !self.state.can_transition_to(&target) {
            tracing::debug!(worker = %worker, from = %self.state, to = %target, "Unexpected worker state transition");
        }
        self.state = target;
    }
}

/// Point-in-time view of a worker, for status displays.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSummary {
    pub name: String,
    pub period_secs: f64,
    /// Seconds until the next cycle starts, if one is scheduled.
    pub remaining_secs: Option<f64>,
    pub error_count: usize,
    pub error_kinds: Vec<&'static str>,
    pub state: WorkerState,
}

/// Runs a [`Unit`]'s actions in its own task, once per period.
pub struct Worker<U: Unit> {
    name: String,
    params: U::Params,
    actions: Vec<U::Action>,
    unit: Arc<Mutex<U>>,
    /// Milliseconds, so sub-second periods survive.
    period_ms: Arc<AtomicU64>,
    initial_delay: Duration,
    stop_timeout: Duration,
    status: Arc<std::sync::Mutex<WorkerStatus>>,
    exit: CancellationToken,
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl<U: Unit> Worker<U> {
    /// Build the unit and resolve its actions.
    ///
    /// A period under one millisecond is refused. Actions the unit does not
    /// expose are logged and skipped. Without an
    /// explicit initial delay a random one in 4..=8 seconds is used, never
    /// longer than the period.
    pub fn new(
        period: Duration,
        params: U::Params,
        actions: &[U::Action],
        initial_delay: Option<Duration>,
    ) -> Result<Self, WorkerError> {
        let name = U::NAME.to_string();
        if as_millis(period) == 0 {
            return Err(WorkerError::InvalidPeriod { worker: name, period });
        }
        let unit = U::build(&params).map_err(|source| WorkerError::Build {
            worker: name.clone(),
            source,
        })?;

        let capabilities = U::capabilities();
        let actions = actions
            .iter()
            .copied()
            .filter(|action| {
                let known = capabilities.contains(action);
                if !known {
                    tracing::warn!(worker = %name, action = ?action, "Cannot gather action from unit, skipping");
                }
                known
            })
            .collect();

        let initial_delay = initial_delay
            .unwrap_or_else(|| Duration::from_secs(rand::thread_rng().gen_range(4..=8)))
            .min(period);

        Ok(Self {
            name,
            params,
            actions,
            unit: Arc::new(Mutex::new(unit)),
            period_ms: Arc::new(AtomicU64::new(as_millis(period))),
            initial_delay,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            status: Arc::new(std::sync::Mutex::new(WorkerStatus::new())),
            exit: CancellationToken::new(),
            handle: None,
        })
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[U::Action] {
        &self.actions
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    /// Takes effect from the next cycle on. No floor is enforced here.
    pub fn set_period(&mut self, period: Duration) {
        self.period_ms.store(as_millis(period), Ordering::Relaxed);
    }

    /// Shared handle on the unit. Stays valid across `reset_worker`.
    pub fn unit(&self) -> Arc<Mutex<U>> {
        self.unit.clone()
    }

    fn status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WorkerState {
        self.status().state.clone()
    }

    pub fn error_count(&self) -> usize {
        self.status().error_count
    }

    /// Messages of every error recorded since the last reset.
    pub fn exceptions(&self) -> Vec<String> {
        self.status().exceptions.clone()
    }

    /// Task alive and not in the failed state.
    pub fn is_running(&self) -> bool {
        let alive = self.handle.as_ref().is_some_and(|h| !h.is_finished());
        alive && !self.status().state.is_failed()
    }

    /// Spawn the run loop. Does not block.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!(worker = %self.name, "Worker already running");
            return;
        }
        if self.status().state.is_failed() {
            tracing::warn!(worker = %self.name, "Worker failed, reset it before starting");
            return;
        }

        self.exit = CancellationToken::new();
        self.status().transition(&self.name, WorkerState::Running);

        let run = RunLoop {
            name: self.name.clone(),
            unit: self.unit.clone(),
            actions: self.actions.clone(),
            period_ms: self.period_ms.clone(),
            initial_delay: self.initial_delay,
            status: self.status.clone(),
            exit: self.exit.clone(),
        };
        self.handle = Some(tokio::spawn(run.run()));
        tracing::info!(worker = %self.name, "Worker started");
    }

    /// Request exit and wait up to the stop timeout for the loop to end.
    ///
    /// Returns `false` when termination could not be confirmed; the task may
    /// still be running an action.
    pub async fn stop(&mut self) -> bool {
        self.exit.cancel();
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };

        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(joined) => {
                match joined {
                    Ok(Ok(())) => tracing::info!(worker = %self.name, "Worker stopped"),
                    Ok(Err(e)) => tracing::info!(worker = %self.name, error = %e, "Stopped a failed worker"),
                    Err(e) => tracing::error!(worker = %self.name, error = %e, "Worker task panicked"),
                }
                self.handle = None;
                true
            }
            Err(_) => {
                let err = WorkerError::StopTimeout {
                    worker: self.name.clone(),
                    timeout: self.stop_timeout,
                };
                tracing::warn!("{err}");
                false
            }
        }
    }

    /// Rebuild the unit in place, optionally from new parameters.
    ///
    /// The swap happens under the unit lock, so it waits for a running cycle
    /// to finish. Error counters are cleared. On a build failure the previous
    /// unit and parameters are kept.
    pub async fn reset_worker(
        &mut self,
        new_params: Option<U::Params>,
        start: bool,
    ) -> Result<(), WorkerError> {
        let params = new_params.unwrap_or_else(|| self.params.clone());
        let fresh = U::build(&params).map_err(|source| WorkerError::Build {
            worker: self.name.clone(),
            source,
        })?;

        *self.unit.lock().await = fresh;
        self.params = params;

        let running = self.is_running();
        {
            let mut status = self.status();
            status.error_count = 0;
            status.exceptions.clear();
            status.error_kinds.clear();
            if !running {
                status.transition(&self.name, WorkerState::Constructed);
            }
        }
        tracing::info!(worker = %self.name, "Worker unit rebuilt");

        if start && !running {
            self.start();
        }
        Ok(())
    }

    pub fn summary(&self) -> WorkerSummary {
        let status = self.status();
        let remaining_secs = status
            .next_cycle_at
            .filter(|_| status.state == WorkerState::Running)
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs_f64());
        WorkerSummary {
            name: self.name.clone(),
            period_secs: self.period().as_secs_f64(),
            remaining_secs,
            error_count: status.error_count,
            error_kinds: status.error_kinds.clone(),
            state: status.state.clone(),
        }
    }
}

/// Everything the spawned task needs, detached from the `Worker`.
struct RunLoop<U: Unit> {
    name: String,
    unit: Arc<Mutex<U>>,
    actions: Vec<U::Action>,
    period_ms: Arc<AtomicU64>,
    initial_delay: Duration,
    status: Arc<std::sync::Mutex<WorkerStatus>>,
    exit: CancellationToken,
}

impl<U: Unit> RunLoop<U> {
    fn status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self) -> Result<(), WorkerError> {
        tracing::info!(worker = %self.name, "Entering main loop");
        let mut wait = self.initial_delay;
        self.status().next_cycle_at = Some(Instant::now() + wait);

        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let started = Instant::now();
            self.run_cycle().await?;
            let elapsed = started.elapsed();

            let period = Duration::from_millis(self.period_ms.load(Ordering::Relaxed));
            wait = period.saturating_sub(elapsed);
            self.status().next_cycle_at = Some(Instant::now() + wait);
            tracing::info!(
                worker = %self.name,
                "Actions run in {:.3}s, next iteration in {:.3}s",
                elapsed.as_secs_f64(),
                wait.as_secs_f64()
            );
        }

        self.status().transition(&self.name, WorkerState::Stopped);
        tracing::info!(worker = %self.name, "Exiting loop");
        Ok(())
    }

    async fn run_cycle(&self) -> Result<(), WorkerError> {
        let mut unit = self.unit.lock().await;
        for &action in &self.actions {
            tracing::debug!(worker = %self.name, action = ?action, "Running action");
            match unit.perform(action).await {
                Ok(()) => tracing::debug!(worker = %self.name, action = ?action, "Finished action"),
                Err(e) => self.process_error(action, e)?,
            }
        }
        Ok(())
    }

    /// Count the error. Fatal on an exit request or past the error budget.
    fn process_error(&self, action: U::Action, error: UnitError) -> Result<(), WorkerError> {
        let is_exit = error.is_exit();
        if is_exit {
            tracing::warn!(worker = %self.name, error = %error, "Worker exiting");
        } else {
            tracing::error!(worker = %self.name, action = ?action, error = ?error, "Error running action");
        }

        let mut status = self.status();
        status.error_count += 1;
        status.exceptions.push(format!("{action:?}: {error}"));
        status.error_kinds.push(error.kind());

        let reason = if is_exit {
            FatalReason::ExitRequested
        } else if status.error_count > MAX_WORKER_ERRORS {
            FatalReason::TooManyErrors
        } else {
            return Ok(());
        };

        let causes = status.exceptions.clone();
        status.transition(&self.name, WorkerState::Failed(causes.clone()));
        let err = WorkerError::Fatal {
            worker: self.name.clone(),
            reason,
            causes,
        };
        tracing::error!("{err}");
        Err(err)
    }
}
