//! Cluster membership and raw orchestrator resources.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::coe::CoeClient;
use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoeResourcesData {
    pub orchestrator: String,
    pub node_id: Option<String>,
    pub cluster_id: Option<String>,
    pub cluster_managers: Vec<String>,
    pub cluster_nodes: Vec<String>,
    /// Raw resources keyed by kind.
    pub raw: Map<String, Value>,
}

pub struct CoeResourcesMonitor {
    ctx: MonitorContext,
    coe: Arc<dyn CoeClient>,
    enabled: bool,
    data: CoeResourcesData,
}

impl CoeResourcesMonitor {
    pub const NAME: &'static str = "coe_resources_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        let enabled = ctx.coe_resources_supported;
        if !enabled {
            tracing::info!(monitor = Self::NAME, "coe-resources not supported by Nuvla, disabling");
        }
        Self {
            ctx: ctx.clone(),
            coe: ctx.coe_client.clone(),
            enabled,
            data: CoeResourcesData::default(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn data(&self) -> &CoeResourcesData {
        &self.data
    }

    async fn raw_resources(&self) -> Map<String, Value> {
        let mut raw = Map::new();
        for &kind in self.coe.raw_resource_kinds() {
            match self.coe.list_raw_resources(kind).await {
                Ok(items) => {
                    raw.insert(kind.to_string(), Value::Array(items));
                }
                Err(e) => {
                    tracing::error!(monitor = Self::NAME, kind = kind, error = %e, "Failed to list raw resources");
                }
            }
        }
        raw
    }
}

#[async_trait]
impl Monitor for CoeResourcesMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        let orchestrator = self.coe.orchestrator().to_string();
        self.data = CoeResourcesData {
            node_id: self.coe.node_id().await,
            cluster_id: self.coe.cluster_id().await,
            cluster_managers: self.coe.get_cluster_managers().await?,
            cluster_nodes: self.coe.list_nodes().await?,
            raw: self.raw_resources().await,
            orchestrator,
        };

        let data = &self.data;
        self.ctx.publish_edge_status(|status| {
            status.node_id = data.node_id.clone();
            status.orchestrator = Some(data.orchestrator.clone());
        });
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        let data = &self.data;
        payload.orchestrator = Some(data.orchestrator.clone());
        payload.node_id = data.node_id.clone();
        payload.cluster_id = data.cluster_id.clone();
        payload.cluster_managers = (!data.cluster_managers.is_empty()).then(|| data.cluster_managers.clone());
        payload.cluster_nodes = (!data.cluster_nodes.is_empty()).then(|| data.cluster_nodes.clone());

        if !data.raw.is_empty() {
            let mut coe_resources = Map::new();
            coe_resources.insert(data.orchestrator.clone(), Value::Object(data.raw.clone()));
            payload.coe_resources = Some(Value::Object(coe_resources));
        }
        Ok(())
    }
}
