//! Module status reporting and the derived NuvlaEdge state.
//!
//! Components push [`StatusReport`]s through a [`StatusSender`] without ever
//! blocking. The [`StatusHandler`] drains them when telemetry is assembled and
//! folds the latest report per module into one [`EdgeState`] plus notes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::coe::CoeClient;

/// Reports older than this are forgotten.
pub const STATUS_TIMEOUT: chrono::TimeDelta = chrono::TimeDelta::hours(1);

/// Capacity of the status channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Overall NuvlaEdge state sent with telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeState {
    Operational,
    Degraded,
    Unknown,
}

/// State a single module reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    Starting,
    Running,
    Stopped,
    Warning,
    Failing,
    Failed,
    Unknown,
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Warning => "WARNING",
            Self::Failing => "FAILING",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub origin_module: String,
    pub module_status: ModuleStatus,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

impl StatusReport {
    pub fn new(origin_module: impl Into<String>, module_status: ModuleStatus, message: impl Into<String>) -> Self {
        Self {
            origin_module: origin_module.into(),
            module_status,
            date: Utc::now(),
            message: message.into(),
        }
    }
}

/// Cloneable, non-blocking sender side of the status channel.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<StatusReport>,
}

impl StatusSender {
    /// Queue a report. Dropped with a warning when the channel is full.
    pub fn send(&self, module: &str, status: ModuleStatus, message: impl Into<String>) {
        let report = StatusReport::new(module, status, message);
        if let Err(e) = self.tx.try_send(report) {
            tracing::warn!(module = %module, error = %e, "Status report dropped");
        }
    }

    pub fn starting(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Starting, message);
    }

    pub fn running(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Running, message);
    }

    pub fn stopped(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Stopped, message);
    }

    pub fn warning(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Warning, message);
    }

    pub fn failing(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Failing, message);
    }

    pub fn failed(&self, module: &str, message: impl Into<String>) {
        self.send(module, ModuleStatus::Failed, message);
    }
}

/// Collects module reports and derives the NuvlaEdge state.
pub struct StatusHandler {
    rx: mpsc::Receiver<StatusReport>,
    tx: StatusSender,
    module_reports: BTreeMap<String, StatusReport>,
    status: EdgeState,
    notes: Vec<String>,
}

impl StatusHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            rx,
            tx: StatusSender { tx },
            module_reports: BTreeMap::new(),
            status: EdgeState::Unknown,
            notes: Vec::new(),
        }
    }

    /// A sender for components to report through.
    pub fn sender(&self) -> StatusSender {
        self.tx.clone()
    }

    pub fn add_module(&mut self, report: StatusReport) {
        self.module_reports.insert(report.origin_module.clone(), report);
    }

    pub fn remove_module(&mut self, name: &str) {
        self.module_reports.remove(name);
    }

    /// Drain pending reports and recompute state and notes as of `now`.
    pub fn update_status(&mut self, now: DateTime<Utc>) {
        while let Ok(report) = self.rx.try_recv() {
            self.add_module(report);
        }

        self.module_reports.retain(|name, report| {
            let fresh = now - report.date <= STATUS_TIMEOUT;
            if !fresh {
                tracing::debug!(module = %name, "Removing stale status report");
            }
            fresh
        });

        let mut status = EdgeState::Unknown;
        let mut notes = Vec::with_capacity(self.module_reports.len());
        for (name, report) in &self.module_reports {
            match report.module_status {
                ModuleStatus::Failing | ModuleStatus::Failed => status = EdgeState::Degraded,
                ModuleStatus::Starting | ModuleStatus::Running | ModuleStatus::Stopped
                    if status != EdgeState::Degraded =>
                {
                    status = EdgeState::Operational
                }
                _ => {}
            }

            let age = (now - report.date).num_seconds().max(0);
            let message = if report.message.is_empty() {
                String::new()
            } else {
                format!(" - {}", report.message)
            };
            notes.push(format!(
                "{name:<16} - {age:<6}s: {status:<9}{message}",
                status = report.module_status.to_string()
            ));
        }

        self.status = status;
        self.notes = notes;
    }

    /// Current state and notes, including issues reported by the COE.
    pub async fn get_status(&mut self, coe: &dyn CoeClient) -> (EdgeState, Vec<String>) {
        let (errors, _warnings) = coe.read_system_issues().await;
        if !errors.is_empty() {
            let message = errors.join("\n");
            tracing::warn!("COE is reporting errors: {message}");
            self.tx.failing("COE", message);
        }

        self.update_status(Utc::now());
        (self.status, self.notes.clone())
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::new()
    }
}
