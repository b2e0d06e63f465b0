//! Main agent loop.
//!
//! The Agent struct, its constructor, the controlled startup, the main run
//! loop and the handling of Nuvla responses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::coe::CoeClient;
use crate::commissioner::{Commissioner, CommissionerAction, CommissionerParams};
use crate::config::AgentSettings;
use crate::error::Error;
use crate::monitor::MonitorContext;
use crate::nuvla::{NuvlaApi, NuvlaResponse};
use crate::status::{StatusHandler, StatusSender};
use crate::telemetry::{Telemetry, TelemetryAction, TelemetryParams, TelemetryPayload, payload_diff};
use crate::timed_actions::{ActionHandler, ActionSummary, TimedAction};
use crate::worker::{WorkerManager, WorkerSummary};

const STATUS_MODULE: &str = "Agent";

/// Delay before the telemetry worker's first health check.
const TELEMETRY_INITIAL_DELAY: Duration = Duration::from_secs(8);

const WATCH_WORKERS_PERIOD: Duration = Duration::from_secs(45);

const COMMISSIONER_PERIOD: Duration = Duration::from_secs(60);
const COMMISSIONER_INITIAL_DELAY: Duration = Duration::from_secs(3);

/// Telemetry field whose support enables the COE resources monitor.
const COE_RESOURCES_FIELD: &str = "coe-resources";

/// Periodic operations run by the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOp {
    Heartbeat,
    Telemetry,
    WatchWorkers,
}

/// External collaborators of the agent.
pub struct AgentDeps {
    pub nuvla: Arc<dyn NuvlaApi>,
    pub coe: Arc<dyn CoeClient>,
}

/// The NuvlaEdge agent: owns the workers and drives the periodic actions.
pub struct Agent {
    deps: AgentDeps,
    worker_manager: WorkerManager,
    action_handler: ActionHandler<AgentOp>,
    status_handler: StatusHandler,
    status: StatusSender,
    /// Last payload accepted by Nuvla.
    telemetry_payload: TelemetryPayload,
    telemetry_period: Duration,
    heartbeat_period: Duration,
    exit: CancellationToken,
}

impl Agent {
    /// Register the workers and the periodic actions. Nothing runs yet.
    pub fn new(settings: &AgentSettings, deps: AgentDeps) -> Result<Self, Error> {
        let status_handler = StatusHandler::new();
        let status = status_handler.sender();

        let mut context = MonitorContext::new(deps.coe.clone());
        context.host_fs = settings.host_fs.clone();
        context.shared_data_volume = settings.shared_data_volume.clone();
        context.coe_resources_supported = deps.nuvla.supports_telemetry_field(COE_RESOURCES_FIELD);
        let commissioner = CommissionerParams {
            coe: deps.coe.clone(),
            nuvla: deps.nuvla.clone(),
            status: status.clone(),
            edge_status: context.edge_status.clone(),
            nuvlaedge_uuid: settings.nuvlaedge_uuid.clone(),
            commissioning_file: settings.commissioning_file(),
        };
        let mut params = TelemetryParams::new(context, status.clone(), settings.telemetry_period);
        params.excluded_monitors = settings.excluded_monitors.clone();

        let mut worker_manager = WorkerManager::with_stop_timeout(settings.worker_stop_timeout);
        worker_manager.add_worker::<Telemetry>(
            settings.telemetry_period,
            params,
            &[TelemetryAction::Run],
            Some(TELEMETRY_INITIAL_DELAY),
        )?;
        worker_manager.add_worker::<Commissioner>(
            COMMISSIONER_PERIOD,
            commissioner,
            &[CommissionerAction::Run],
            Some(COMMISSIONER_INITIAL_DELAY),
        )?;

        let mut agent = Self {
            deps,
            worker_manager,
            action_handler: ActionHandler::default(),
            status_handler,
            status,
            telemetry_payload: TelemetryPayload::default(),
            telemetry_period: settings.telemetry_period,
            heartbeat_period: settings.heartbeat_period,
            exit: CancellationToken::new(),
        };
        agent.init_actions();
        agent.status.starting(STATUS_MODULE, "");
        Ok(agent)
    }

    fn init_actions(&mut self) {
        self.action_handler.add(
            TimedAction::new("heartbeat", self.heartbeat_period, || AgentOp::Heartbeat)
                .with_remaining_time(self.heartbeat_period),
        );
        self.action_handler.add(
            TimedAction::new("telemetry", self.telemetry_period, || AgentOp::Telemetry)
                .with_remaining_time(self.telemetry_period),
        );
        self.action_handler.add(
            TimedAction::new("watch_workers", WATCH_WORKERS_PERIOD, || AgentOp::WatchWorkers)
                .with_remaining_time(WATCH_WORKERS_PERIOD),
        );
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn telemetry_period(&self) -> Duration {
        self.telemetry_period
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_period
    }

    pub fn worker_manager(&self) -> &WorkerManager {
        &self.worker_manager
    }

    pub fn workers_summary(&self) -> Vec<WorkerSummary> {
        self.worker_manager.summary()
    }

    pub fn actions_summary(&self) -> Vec<ActionSummary> {
        self.action_handler.summary()
    }

    /// Last payload accepted by Nuvla.
    pub fn telemetry_payload(&self) -> &TelemetryPayload {
        &self.telemetry_payload
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn stop(&self) {
        self.exit.cancel();
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Gather metrics from every monitor once, commission what they found and
    /// push the first telemetry.
    pub async fn run_controlled_startup(&mut self) -> Result<(), Error> {
        let Some(telemetry) = self.worker_manager.unit::<Telemetry>() else {
            tracing::warn!("Telemetry not found in controlled startup...");
            return Ok(());
        };
        telemetry.lock().await.run_once().await;

        if let Some(commissioner) = self.worker_manager.unit::<Commissioner>() {
            commissioner.lock().await.run().await;
        }

        if let Some(response) = self.telemetry().await? {
            self.process_response(response, "telemetry").await;
        }
        Ok(())
    }

    // ── Main loop ───────────────────────────────────────────────────

    /// Start the workers and run the periodic actions until stopped.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.worker_manager.start();

        let mut next_cycle_in = self.action_handler.sleep_time()?;
        tracing::debug!(
            "Starting agent with action {} in {:.2}s",
            self.action_handler.next()?.name(),
            next_cycle_in.as_secs_f64()
        );

        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => {
                    tracing::info!("Exit requested, leaving agent loop");
                    break;
                }
                _ = tokio::time::sleep(next_cycle_in) => {}
            }

            self.status.running(STATUS_MODULE, "");
            let start_cycle = Instant::now();

            let next_action = self.action_handler.next()?;
            let name = next_action.name().to_string();
            let period = next_action.period();
            let Some(op) = next_action.call() else {
                next_cycle_in = self.action_handler.sleep_time()?;
                continue;
            };

            // A late action gets one more period before it is dropped.
            let outcome = {
                let action = self.dispatch(op);
                tokio::pin!(action);
                match tokio::time::timeout(period, &mut action).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        tracing::warn!(
                            action = %name,
                            "Action didn't execute in time ({:.0}s timeout), waiting one more period",
                            period.as_secs_f64()
                        );
                        tokio::time::timeout(period, &mut action).await.ok()
                    }
                }
            };
            let response = match outcome {
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    tracing::error!(action = %name, error = %e, "Error while running action");
                    self.status.warning(STATUS_MODULE, format!("{name} failed: {e}"));
                    None
                }
                None => {
                    tracing::warn!(action = %name, "Action didn't execute in time twice, dropping it");
                    self.status.warning(STATUS_MODULE, format!("{name} timed out"));
                    None
                }
            };

            if let Some(response) = response {
                self.process_response(response, &name).await;
            }

            next_cycle_in = self
                .action_handler
                .action_finished(start_cycle.elapsed(), &name)?;
        }
        Ok(())
    }

    /// Stop every worker and monitor. Returns whether all workers confirmed.
    pub async fn shutdown(&mut self) -> bool {
        tracing::info!("Agent shutting down...");
        if let Some(telemetry) = self.worker_manager.unit::<Telemetry>() {
            telemetry.lock().await.stop_monitors();
        }
        let stopped = self.worker_manager.stop().await;
        self.status.stopped(STATUS_MODULE, "");
        stopped
    }

    async fn dispatch(&mut self, op: AgentOp) -> Result<Option<NuvlaResponse>, Error> {
        match op {
            AgentOp::Heartbeat => self.heartbeat().await,
            AgentOp::Telemetry => self.telemetry().await,
            AgentOp::WatchWorkers => {
                self.watch_workers().await;
                Ok(None)
            }
        }
    }

    // ── Actions ─────────────────────────────────────────────────────

    async fn heartbeat(&mut self) -> Result<Option<NuvlaResponse>, Error> {
        tracing::info!("Executing heartbeat...");
        let response = self.deps.nuvla.heartbeat().await?;
        tracing::info!("Executing heartbeat... Success");
        self.status.running(STATUS_MODULE, "");
        Ok(Some(response))
    }

    /// Send the fields that changed since the last accepted payload.
    async fn telemetry(&mut self) -> Result<Option<NuvlaResponse>, Error> {
        tracing::info!("Executing telemetry...");
        let Some(telemetry) = self.worker_manager.unit::<Telemetry>() else {
            tracing::warn!("Telemetry worker not registered");
            return Ok(None);
        };
        let mut new_telemetry = telemetry.lock().await.get_telemetry();

        let (status, notes) = self.status_handler.get_status(self.deps.coe.as_ref()).await;
        tracing::info!(?status, ?notes, "Status gathered");
        new_telemetry.status = Some(status);
        new_telemetry.status_notes = Some(notes);

        let (to_send, to_delete) = payload_diff(&self.telemetry_payload, &new_telemetry);
        let mut data = new_telemetry.to_json_map();
        data.retain(|key, _| to_send.contains(key));

        let response = self
            .deps
            .nuvla
            .telemetry(data, to_delete.into_iter().collect())
            .await?;
        tracing::info!("Executing telemetry... Success");

        self.telemetry_payload = new_telemetry;
        self.status.running(STATUS_MODULE, "");
        Ok(Some(response))
    }

    async fn watch_workers(&mut self) {
        let summary = self.worker_manager.summary();
        tracing::info!(workers = ?summary, "Workers status");

        let healed = self.worker_manager.heal_workers().await;
        if healed > 0 {
            tracing::warn!(healed, "Workers restarted");
            // A rebuilt telemetry unit starts from its registration period.
            if let Some(telemetry) = self.worker_manager.unit::<Telemetry>() {
                telemetry.lock().await.set_period(self.telemetry_period);
            }
        }
    }

    // ── Responses ───────────────────────────────────────────────────

    async fn process_response(&mut self, response: NuvlaResponse, operation: &str) {
        tracing::info!("{} jobs received from operation: {}", response.jobs.len(), operation);
        for job in &response.jobs {
            tracing::info!(job = %job, "No job launcher available, job left to Nuvla");
        }

        if let Some(last_update) = &response.doc_last_updated {
            tracing::debug!(last_update = %last_update, "NuvlaEdge resource last updated");
        }

        if let Some(refresh) = response.refresh_interval.map(Duration::from_secs) {
            if refresh != self.telemetry_period {
                self.update_telemetry_period(refresh).await;
            }
        }
        if let Some(heartbeat) = response.heartbeat_interval.map(Duration::from_secs) {
            if heartbeat != self.heartbeat_period && !heartbeat.is_zero() {
                tracing::info!(
                    "Heartbeat period has changed from {} to {}",
                    self.heartbeat_period.as_secs(),
                    heartbeat.as_secs()
                );
                self.heartbeat_period = heartbeat;
                self.action_handler.edit_period("heartbeat", heartbeat);
            }
        }
    }

    /// Keep the telemetry worker, its monitors and the telemetry action in step.
    async fn update_telemetry_period(&mut self, period: Duration) {
        tracing::info!(
            "Telemetry period has changed from {} to {}",
            self.telemetry_period.as_secs(),
            period.as_secs()
        );
        if !self.worker_manager.edit_period_of::<Telemetry>(period) {
            return;
        }
        self.telemetry_period = period;
        if let Some(telemetry) = self.worker_manager.unit::<Telemetry>() {
            telemetry.lock().await.set_period(period);
        }
        self.action_handler.edit_period("telemetry", period);
    }
}
