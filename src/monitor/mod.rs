//! Periodic telemetry producers.
//!
//! A [`Monitor`] knows how to refresh its data and project it into a
//! telemetry fragment. [`MonitorHandle`] runs one monitor in its own task,
//! contains its failures and hands fragments to the aggregator through a
//! [`ReportChannel`].

pub mod channel;
pub mod components;
pub mod registry;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::coe::CoeClient;
use crate::telemetry::TelemetryPayload;
use crate::worker::as_millis;

pub use channel::ReportChannel;
pub use registry::{MonitorRegistration, builtin_monitors};

#[async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;

    /// Disabled monitors are neither run nor health-checked.
    fn enabled(&self) -> bool {
        true
    }

    /// Refresh the monitor's data from the host, the COE or the filesystem.
    async fn update_data(&mut self) -> anyhow::Result<()>;

    /// Write the monitor's data into `payload`. Only owned fields are set.
    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()>;
}

/// Cluster facts the monitors discover and the commissioner waits for.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EdgeStatus {
    pub node_id: Option<String>,
    pub orchestrator: Option<String>,
}

/// What a monitor may use when it is built.
#[derive(Clone)]
pub struct MonitorContext {
    pub coe_client: Arc<dyn CoeClient>,
    pub excluded_monitors: Vec<String>,
    pub edge_status: Arc<RwLock<EdgeStatus>>,
    /// Whether Nuvla accepts the `coe-resources` telemetry field.
    pub coe_resources_supported: bool,
    pub host_fs: PathBuf,
    /// Files shared with the other NuvlaEdge components.
    pub shared_data_volume: PathBuf,
}

impl MonitorContext {
    pub fn new(coe_client: Arc<dyn CoeClient>) -> Self {
        Self {
            coe_client,
            excluded_monitors: Vec::new(),
            edge_status: Arc::new(RwLock::new(EdgeStatus::default())),
            coe_resources_supported: false,
            host_fs: PathBuf::from("/rootfs"),
            shared_data_volume: PathBuf::from("/var/lib/nuvlaedge/"),
        }
    }

    /// Apply `f` to the shared edge status.
    pub fn publish_edge_status(&self, f: impl FnOnce(&mut EdgeStatus)) {
        let mut status = self.edge_status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    pub fn edge_status(&self) -> EdgeStatus {
        self.edge_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The monitor together with its pending fragment.
struct MonitorCore {
    monitor: Box<dyn Monitor>,
    telemetry_data: TelemetryPayload,
}

struct MonitorShared {
    name: String,
    core: Mutex<MonitorCore>,
    channel: ReportChannel,
    period_ms: AtomicU64,
    last_update: StdMutex<Instant>,
    last_process_duration: StdMutex<Option<Duration>>,
}

impl MonitorShared {
    fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    fn since_last_update(&self) -> Duration {
        self.last_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn send(&self, core: &mut MonitorCore) {
        let fragment = std::mem::take(&mut core.telemetry_data);
        self.channel.publish(&self.name, fragment);
    }

    async fn run_update_data(&self) {
        let started = Instant::now();
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = started;

        let mut core = self.core.lock().await;
        let result = match core.monitor.update_data().await {
            Ok(()) => {
                let MonitorCore {
                    monitor,
                    telemetry_data,
                } = &mut *core;
                monitor.populate_telemetry_payload(telemetry_data)
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.send(&mut core),
            Err(e) => {
                tracing::error!(monitor = %self.name, error = ?e, "Something went wrong updating monitor")
            }
        }
        drop(core);

        *self
            .last_process_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(started.elapsed());
    }

    async fn run(self: Arc<Self>, exit: CancellationToken) {
        // The first pass usually ran synchronously at startup.
        let mut wait = (self.period() / 2).saturating_sub(self.since_last_update());

        loop {
            tokio::select! {
                biased;
                _ = exit.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.run_update_data().await;

            let period = self.period();
            wait = match period.checked_sub(self.since_last_update()) {
                Some(wait) => wait,
                None => {
                    tracing::warn!(
                        monitor = %self.name,
                        period_secs = period.as_secs_f64(),
                        "Monitor took too long to complete"
                    );
                    Duration::ZERO
                }
            };
            tracing::debug!(monitor = %self.name, "Waiting for {:.2} seconds", wait.as_secs_f64());
        }
        tracing::debug!(monitor = %self.name, "Monitor loop exited");
    }
}

/// Runs one monitor on its own task.
pub struct MonitorHandle {
    enabled: bool,
    shared: Arc<MonitorShared>,
    exit: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn new(monitor: Box<dyn Monitor>, period: Duration) -> Self {
        let name = monitor.name().to_string();
        let enabled = monitor.enabled();
        Self {
            enabled,
            shared: Arc::new(MonitorShared {
                name,
                core: Mutex::new(MonitorCore {
                    monitor,
                    telemetry_data: TelemetryPayload::default(),
                }),
                channel: ReportChannel::new(),
                period_ms: AtomicU64::new(as_millis(period)),
                last_update: StdMutex::new(Instant::now()),
                last_process_duration: StdMutex::new(None),
            }),
            exit: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    pub fn set_period(&self, period: Duration) {
        tracing::debug!(monitor = %self.name(), period_secs = period.as_secs_f64(), "Setting monitor period");
        self.shared.period_ms.store(as_millis(period), Ordering::Relaxed);
    }

    pub fn last_process_duration(&self) -> Option<Duration> {
        *self
            .shared
            .last_process_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report_channel(&self) -> &ReportChannel {
        &self.shared.channel
    }

    /// The fragment being built. Empty right after each hand-off.
    pub async fn telemetry_data(&self) -> TelemetryPayload {
        self.shared.core.lock().await.telemetry_data.clone()
    }

    /// Update, populate and publish once. Failures are logged and swallowed.
    pub async fn run_update_data(&self) {
        self.shared.run_update_data().await;
    }

    /// Publish the current fragment and start a fresh one.
    pub async fn send_telemetry_data(&self) {
        let mut core = self.shared.core.lock().await;
        self.shared.send(&mut core);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn was_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self) {
        if !self.enabled {
            tracing::debug!(monitor = %self.name(), "Monitor disabled, not starting");
            return;
        }
        if self.is_running() {
            return;
        }
        self.exit = CancellationToken::new();
        let shared = self.shared.clone();
        self.handle = Some(tokio::spawn(shared.run(self.exit.clone())));
        tracing::info!(monitor = %self.name(), "Monitor started");
    }

    /// Ask the loop to exit. Does not wait.
    pub fn stop(&self) {
        self.exit.cancel();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}
