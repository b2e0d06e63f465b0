//! Results of the security scanner, read from the shared volume.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

/// Most severe entries reported to Nuvla.
const MAX_REPORTED: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VulnerabilitiesSummary {
    pub total: usize,
    pub affected_products: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VulnerabilitiesData {
    pub summary: VulnerabilitiesSummary,
    pub items: Vec<Value>,
}

pub struct VulnerabilitiesMonitor {
    file: PathBuf,
    data: Option<VulnerabilitiesData>,
}

/// `-1` marks an entry the scanner could not score.
fn score(item: &Value) -> Option<f64> {
    item.get("vulnerability-score")
        .and_then(Value::as_f64)
        .filter(|s| *s != -1.0)
}

fn summarize(items: Vec<Value>) -> Option<VulnerabilitiesData> {
    if items.is_empty() {
        return None;
    }
    let scores: Vec<f64> = items.iter().filter_map(score).collect();
    let average_score = (!scores.is_empty())
        .then(|| (scores.iter().sum::<f64>() / scores.len() as f64 * 100.0).round() / 100.0);
    let affected_products: BTreeSet<String> = items
        .iter()
        .map(|v| v.get("product").and_then(Value::as_str).unwrap_or("unknown").to_string())
        .collect();

    let total = items.len();
    let mut items = items;
    items.sort_by(|a, b| {
        let key = |v: &Value| v.get("vulnerability-score").and_then(Value::as_f64).unwrap_or(0.0);
        key(b).total_cmp(&key(a))
    });
    items.truncate(MAX_REPORTED);

    Some(VulnerabilitiesData {
        summary: VulnerabilitiesSummary {
            total,
            affected_products: affected_products.into_iter().collect(),
            average_score,
        },
        items,
    })
}

impl VulnerabilitiesMonitor {
    pub const NAME: &'static str = "vulnerabilities_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        Self {
            file: ctx.shared_data_volume.join("vulnerabilities"),
            data: None,
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn data(&self) -> Option<&VulnerabilitiesData> {
        self.data.as_ref()
    }
}

#[async_trait]
impl Monitor for VulnerabilitiesMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        let raw = match tokio::fs::read_to_string(&self.file).await {
            Ok(raw) if !raw.trim().is_empty() => raw,
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.file.display(), "No vulnerabilities scan yet");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let items: Vec<Value> = serde_json::from_str(&raw)?;
        if let Some(data) = summarize(items) {
            self.data = Some(data);
        }
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        if let Some(data) = &self.data {
            payload.vulnerabilities = Some(serde_json::to_value(data)?);
        }
        Ok(())
    }
}
