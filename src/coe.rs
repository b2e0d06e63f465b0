//! Container orchestration engine (COE) client contract.
//!
//! Monitors and the status handler only see the [`CoeClient`] trait. The
//! binary ships [`StandaloneHost`], which answers from the local host and
//! reports no cluster.

use async_trait::async_trait;
use serde_json::Value;
use sysinfo::System;

use crate::error::CoeError;

#[async_trait]
pub trait CoeClient: Send + Sync {
    /// `docker`, `kubernetes` or `standalone`.
    fn orchestrator(&self) -> &str;

    async fn engine_version(&self) -> Option<String>;

    async fn node_id(&self) -> Option<String>;

    async fn cluster_id(&self) -> Option<String>;

    async fn list_nodes(&self) -> Result<Vec<String>, CoeError>;

    async fn get_cluster_managers(&self) -> Result<Vec<String>, CoeError>;

    async fn hostname(&self) -> Option<String>;

    async fn host_os(&self) -> String;

    async fn host_architecture(&self) -> String;

    async fn container_plugins(&self) -> Vec<String>;

    /// Names of the NuvlaEdge components currently deployed.
    async fn nuvlaedge_components(&self) -> Vec<String>;

    /// Resource kinds `list_raw_resources` understands.
    fn raw_resource_kinds(&self) -> &[&'static str] {
        &[]
    }

    async fn list_raw_resources(&self, kind: &str) -> Result<Vec<Value>, CoeError> {
        Err(CoeError::Unsupported(format!("list {kind}")))
    }

    /// Per-container usage figures, one JSON object per container.
    async fn collect_container_metrics(&self) -> Result<Vec<Value>, CoeError> {
        Ok(Vec::new())
    }

    /// Errors and warnings the engine reports about itself.
    async fn read_system_issues(&self) -> (Vec<String>, Vec<String>);
}

/// Host-only client used when no orchestrator is available.
#[derive(Debug, Default)]
pub struct StandaloneHost;

impl StandaloneHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CoeClient for StandaloneHost {
    fn orchestrator(&self) -> &str {
        "standalone"
    }

    async fn engine_version(&self) -> Option<String> {
        Some(env!("CARGO_PKG_VERSION").to_string())
    }

    async fn node_id(&self) -> Option<String> {
        None
    }

    async fn cluster_id(&self) -> Option<String> {
        None
    }

    async fn list_nodes(&self) -> Result<Vec<String>, CoeError> {
        Ok(Vec::new())
    }

    async fn get_cluster_managers(&self) -> Result<Vec<String>, CoeError> {
        Ok(Vec::new())
    }

    async fn hostname(&self) -> Option<String> {
        System::host_name()
    }

    async fn host_os(&self) -> String {
        System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string())
    }

    async fn host_architecture(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    async fn container_plugins(&self) -> Vec<String> {
        Vec::new()
    }

    async fn nuvlaedge_components(&self) -> Vec<String> {
        vec!["agent".to_string()]
    }

    async fn read_system_issues(&self) -> (Vec<String>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}
