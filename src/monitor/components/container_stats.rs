//! Container statistics, engine version and this node's place in the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::coe::CoeClient;
use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClusterStatus {
    pub node_id: Option<String>,
    pub orchestrator: Option<String>,
    /// `manager` or `worker`.
    pub cluster_node_role: Option<String>,
    pub cluster_id: Option<String>,
    pub cluster_managers: Vec<String>,
    /// Only known on managers.
    pub cluster_nodes: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContainerStatsData {
    pub containers: Vec<Value>,
    pub docker_server_version: Option<String>,
    pub kubelet_version: Option<String>,
    pub cluster: ClusterStatus,
}

pub struct ContainerStatsMonitor {
    ctx: MonitorContext,
    coe: Arc<dyn CoeClient>,
    data: ContainerStatsData,
}

impl ContainerStatsMonitor {
    pub const NAME: &'static str = "container_stats_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        Self {
            ctx: ctx.clone(),
            coe: ctx.coe_client.clone(),
            data: ContainerStatsData::default(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn data(&self) -> &ContainerStatsData {
        &self.data
    }

    async fn cluster_status(&self) -> anyhow::Result<ClusterStatus> {
        let node_id = self.coe.node_id().await;
        let cluster_managers = self.coe.get_cluster_managers().await?;
        let is_manager = node_id
            .as_ref()
            .is_some_and(|id| cluster_managers.contains(id));

        let mut status = ClusterStatus {
            cluster_id: self.coe.cluster_id().await,
            ..Default::default()
        };
        if node_id.is_some() {
            status.orchestrator = Some(self.coe.orchestrator().to_string());
            status.cluster_node_role = Some(if is_manager { "manager" } else { "worker" }.to_string());
        }
        if is_manager {
            status.cluster_nodes = self.coe.list_nodes().await?;
        }
        status.node_id = node_id;
        status.cluster_managers = cluster_managers;
        Ok(status)
    }
}

#[async_trait]
impl Monitor for ContainerStatsMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        let containers = self.coe.collect_container_metrics().await?;
        let version = self.coe.engine_version().await;
        let (docker_server_version, kubelet_version) = match self.coe.orchestrator() {
            "docker" => (version, None),
            "kubernetes" => (None, version),
            _ => (None, None),
        };

        self.data = ContainerStatsData {
            containers,
            docker_server_version,
            kubelet_version,
            cluster: self.cluster_status().await?,
        };

        let cluster = &self.data.cluster;
        self.ctx.publish_edge_status(|status| {
            status.node_id = cluster.node_id.clone();
            status.orchestrator = cluster.orchestrator.clone();
        });
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        let data = &self.data;
        let mut resources = Map::new();
        resources.insert("container-stats".into(), Value::Array(data.containers.clone()));
        payload.resources = Some(Value::Object(resources));
        payload.docker_server_version = data.docker_server_version.clone();
        payload.kubelet_version = data.kubelet_version.clone();

        let cluster = &data.cluster;
        payload.node_id = cluster.node_id.clone();
        payload.orchestrator = cluster.orchestrator.clone();
        payload.cluster_node_role = cluster.cluster_node_role.clone();
        payload.cluster_id = cluster.cluster_id.clone();
        payload.cluster_managers =
            (!cluster.cluster_managers.is_empty()).then(|| cluster.cluster_managers.clone());
        payload.cluster_nodes = (!cluster.cluster_nodes.is_empty()).then(|| cluster.cluster_nodes.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coe::StandaloneHost;
    use crate::error::CoeError;
    use serde_json::json;

    /// A two-node swarm seen from `node`.
    struct Swarm {
        node: &'static str,
    }

    #[async_trait]
    impl CoeClient for Swarm {
        fn orchestrator(&self) -> &str {
            "docker"
        }
        async fn engine_version(&self) -> Option<String> {
            Some("27.3.1".into())
        }
        async fn node_id(&self) -> Option<String> {
            Some(self.node.into())
        }
        async fn cluster_id(&self) -> Option<String> {
            Some("swarm-1".into())
        }
        async fn list_nodes(&self) -> Result<Vec<String>, CoeError> {
            Ok(vec!["node-1".into(), "node-2".into()])
        }
        async fn get_cluster_managers(&self) -> Result<Vec<String>, CoeError> {
            Ok(vec!["node-1".into()])
        }
        async fn hostname(&self) -> Option<String> {
            None
        }
        async fn host_os(&self) -> String {
            "linux".into()
        }
        async fn host_architecture(&self) -> String {
            "x86_64".into()
        }
        async fn container_plugins(&self) -> Vec<String> {
            Vec::new()
        }
        async fn nuvlaedge_components(&self) -> Vec<String> {
            Vec::new()
        }
        async fn collect_container_metrics(&self) -> Result<Vec<Value>, CoeError> {
            Ok(vec![json!({"id": "c1", "name": "agent", "cpu-usage": 1.5})])
        }
        async fn read_system_issues(&self) -> (Vec<String>, Vec<String>) {
            (Vec::new(), Vec::new())
        }
    }

    #[tokio::test]
    async fn manager_reports_containers_and_whole_cluster() {
        let ctx = MonitorContext::new(Arc::new(Swarm { node: "node-1" }));
        let mut monitor = ContainerStatsMonitor::new(&ctx);
        monitor.update_data().await.unwrap();

        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        assert_eq!(payload.resources.unwrap()["container-stats"][0]["id"], "c1");
        assert_eq!(payload.docker_server_version.as_deref(), Some("27.3.1"));
        assert!(payload.kubelet_version.is_none());
        assert_eq!(payload.cluster_node_role.as_deref(), Some("manager"));
        assert_eq!(payload.cluster_nodes.map(|n| n.len()), Some(2));
        assert_eq!(ctx.edge_status().node_id.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn worker_does_not_list_cluster_nodes() {
        let ctx = MonitorContext::new(Arc::new(Swarm { node: "node-2" }));
        let mut monitor = ContainerStatsMonitor::new(&ctx);
        monitor.update_data().await.unwrap();

        let cluster = &monitor.data().cluster;
        assert_eq!(cluster.cluster_node_role.as_deref(), Some("worker"));
        assert!(cluster.cluster_nodes.is_empty());
        assert_eq!(cluster.cluster_managers, vec!["node-1"]);
    }

    #[tokio::test]
    async fn standalone_host_has_no_containers_or_role() {
        let ctx = MonitorContext::new(Arc::new(StandaloneHost::new()));
        let mut monitor = ContainerStatsMonitor::new(&ctx);
        monitor.update_data().await.unwrap();

        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        assert_eq!(payload.resources.unwrap()["container-stats"], json!([]));
        assert!(payload.cluster_node_role.is_none());
        assert!(payload.docker_server_version.is_none());
        assert!(ctx.edge_status().node_id.is_none());
    }
}
