//! Telemetry aggregation.
//!
//! [`Telemetry`] owns one [`MonitorHandle`] per active monitor, drains their
//! fragments without blocking and merges them into one [`TelemetryPayload`].
//! It is itself a supervised [`Unit`]: its periodic action checks monitor
//! health and recreates monitors whose task died.

pub mod payload;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::UnitError;
use crate::monitor::{MonitorContext, MonitorHandle, MonitorRegistration, builtin_monitors};
use crate::status::StatusSender;
use crate::worker::Unit;

pub use payload::{TelemetryPayload, map_diff, payload_diff};

const STATUS_MODULE: &str = "Telemetry";

/// Split a comma-separated exclusion list, tolerating quotes and blanks.
pub fn parse_excluded_monitors(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.replace(['\'', '"'], "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// `resources_monitor` is excluded by `resources`.
fn is_excluded(monitor: &str, excluded: &[String]) -> bool {
    let prefix = monitor.rsplit_once('_').map_or(monitor, |(prefix, _)| prefix);
    excluded.iter().any(|e| e == prefix)
}

#[derive(Clone)]
pub struct TelemetryParams {
    pub context: MonitorContext,
    /// Raw comma-separated exclusion list.
    pub excluded_monitors: Option<String>,
    pub status: StatusSender,
    pub period: Duration,
    pub registry: &'static [MonitorRegistration],
}

impl TelemetryParams {
    pub fn new(context: MonitorContext, status: StatusSender, period: Duration) -> Self {
        Self {
            context,
            excluded_monitors: None,
            status,
            period,
            registry: builtin_monitors(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryAction {
    /// Report running and check monitor health.
    Run,
}

pub struct Telemetry {
    context: MonitorContext,
    status: StatusSender,
    period: Duration,
    registry: &'static [MonitorRegistration],
    monitors: BTreeMap<String, MonitorHandle>,
    local_telemetry: TelemetryPayload,
    last_telemetry: TelemetryPayload,
}

impl Telemetry {
    pub fn new(params: &TelemetryParams) -> Self {
        tracing::info!("Creating Telemetry object...");
        let mut context = params.context.clone();
        context.excluded_monitors = parse_excluded_monitors(params.excluded_monitors.as_deref());
        if !context.excluded_monitors.is_empty() {
            tracing::info!(excluded = ?context.excluded_monitors, "Excluded monitors received in Telemetry");
        }

        let mut telemetry = Self {
            context,
            status: params.status.clone(),
            period: params.period,
            registry: params.registry,
            monitors: BTreeMap::new(),
            local_telemetry: TelemetryPayload::default(),
            last_telemetry: TelemetryPayload::default(),
        };
        telemetry.initialize_monitors();
        telemetry.status.starting(STATUS_MODULE, "");
        telemetry
    }

    fn initialize_monitors(&mut self) {
        for registration in self.registry {
            if is_excluded(registration.name, &self.context.excluded_monitors) {
                tracing::info!(monitor = registration.name, "Monitor excluded");
                continue;
            }
            let monitor = MonitorHandle::new((registration.build)(&self.context), self.period);
            if monitor.enabled() {
                self.monitors.insert(registration.name.to_string(), monitor);
            } else {
                tracing::info!(monitor = registration.name, "Monitor disabled");
            }
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Propagate a new period to every monitor.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
        for monitor in self.monitors.values() {
            monitor.set_period(period);
        }
    }

    pub fn monitor_names(&self) -> Vec<&str> {
        self.monitors.keys().map(String::as_str).collect()
    }

    pub fn monitor(&self, name: &str) -> Option<&MonitorHandle> {
        self.monitors.get(name)
    }

    /// Previous merged snapshot.
    pub fn last_telemetry(&self) -> &TelemetryPayload {
        &self.last_telemetry
    }

    /// Run every monitor once in sequence, then start the enabled ones.
    pub async fn run_once(&mut self) {
        tracing::info!("Gathering metrics from monitors...");
        let started = std::time::Instant::now();
        for monitor in self.monitors.values_mut() {
            monitor.run_update_data().await;
            tracing::info!(
                monitor = %monitor.name(),
                "Metrics updated in {:.3}s",
                monitor.last_process_duration().unwrap_or_default().as_secs_f64()
            );
            if monitor.enabled() {
                monitor.start();
            }
        }
        tracing::info!("Metrics updated in {:.3}s", started.elapsed().as_secs_f64());
    }

    /// Drain every monitor's pending fragment into a fresh local document.
    ///
    /// Returns a note for each monitor that produced nothing since the last
    /// collection.
    pub fn collect_monitor_metrics(&mut self) -> String {
        self.local_telemetry = TelemetryPayload::default();
        let mut report = String::new();
        for monitor in self.monitors.values() {
            if !monitor.enabled() {
                tracing::info!(monitor = %monitor.name(), "Monitor is disabled");
                continue;
            }
            match monitor.report_channel().try_take() {
                Some(fragment) => self.local_telemetry.merge(fragment),
                None => {
                    tracing::warn!(
                        monitor = %monitor.name(),
                        "Monitor didn't send any metrics in the last {} seconds",
                        self.period.as_secs()
                    );
                    report.push_str(&format!("\tMonitor {} not sending metrics\n", monitor.name()));
                }
            }
        }
        report
    }

    /// Start monitors never started and recreate those whose task died.
    ///
    /// Returns how many monitors were (re)created.
    pub fn check_monitors_health(&mut self) -> usize {
        let mut recreated = 0;
        for registration in self.registry {
            let Some(current) = self.monitors.get_mut(registration.name) else {
                continue;
            };
            if !current.enabled() {
                tracing::info!(monitor = registration.name, "Monitor is disabled, no need to check health");
                continue;
            }
            if current.is_running() {
                tracing::debug!(monitor = registration.name, "Monitor task is alive");
                continue;
            }

            if current.was_started() {
                tracing::info!(monitor = registration.name, "Recreating monitor task");
            } else {
                tracing::info!(monitor = registration.name, "Creating monitor task");
            }
            let mut fresh = MonitorHandle::new((registration.build)(&self.context), self.period);
            fresh.start();
            *current = fresh;
            recreated += 1;
        }

        let durations: BTreeMap<_, _> = self
            .monitors
            .iter()
            .map(|(name, m)| (name.as_str(), m.last_process_duration()))
            .collect();
        tracing::debug!(?durations, "Monitors processing duration");
        recreated
    }

    /// Collect, stamp and return a snapshot of the merged telemetry.
    pub fn get_telemetry(&mut self) -> TelemetryPayload {
        let report = self.collect_monitor_metrics();
        self.local_telemetry.current_time = Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        self.status.running(STATUS_MODULE, report);
        self.last_telemetry = self.local_telemetry.clone();
        self.local_telemetry.clone()
    }

    pub fn run(&mut self) {
        self.status.running(STATUS_MODULE, "");
        tracing::debug!("Telemetry health check started");
        self.check_monitors_health();
    }

    /// Stop every monitor task.
    pub fn stop_monitors(&self) {
        for monitor in self.monitors.values() {
            monitor.stop();
        }
    }
}

#[async_trait]
impl Unit for Telemetry {
    type Params = TelemetryParams;
    type Action = TelemetryAction;
    const NAME: &'static str = "Telemetry";

    fn build(params: &TelemetryParams) -> Result<Self, UnitError> {
        Ok(Self::new(params))
    }

    fn capabilities() -> &'static [TelemetryAction] {
        &[TelemetryAction::Run]
    }

    async fn perform(&mut self, action: TelemetryAction) -> Result<(), UnitError> {
        match action {
            TelemetryAction::Run => self.run(),
        }
        Ok(())
    }
}
