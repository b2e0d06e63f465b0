//! NuvlaEdge deployment and host identity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use sysinfo::System;

use crate::coe::CoeClient;
use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NuvlaEdgeInfo {
    pub engine_version: Option<String>,
    pub operating_system: Option<String>,
    pub architecture: Option<String>,
    pub hostname: Option<String>,
    pub last_boot: Option<String>,
    pub container_plugins: Vec<String>,
    pub components: Vec<String>,
}

pub struct NuvlaEdgeInfoMonitor {
    coe: Arc<dyn CoeClient>,
    data: NuvlaEdgeInfo,
}

impl NuvlaEdgeInfoMonitor {
    pub const NAME: &'static str = "nuvlaedge_info_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        Self {
            coe: ctx.coe_client.clone(),
            data: NuvlaEdgeInfo::default(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn data(&self) -> &NuvlaEdgeInfo {
        &self.data
    }
}

fn last_boot() -> Option<String> {
    let boot = i64::try_from(System::boot_time()).ok()?;
    DateTime::from_timestamp(boot, 0).map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

#[async_trait]
impl Monitor for NuvlaEdgeInfoMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        self.data = NuvlaEdgeInfo {
            engine_version: self.coe.engine_version().await,
            operating_system: Some(self.coe.host_os().await),
            architecture: Some(self.coe.host_architecture().await),
            hostname: self.coe.hostname().await,
            last_boot: last_boot(),
            container_plugins: self.coe.container_plugins().await,
            components: self.coe.nuvlaedge_components().await,
        };
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        let data = &self.data;
        payload.nuvlabox_engine_version = data.engine_version.clone();
        payload.operating_system = data.operating_system.clone();
        payload.architecture = data.architecture.clone();
        payload.hostname = data.hostname.clone();
        payload.last_boot = data.last_boot.clone();
        payload.container_plugins = Some(data.container_plugins.clone());
        payload.components = (!data.components.is_empty()).then(|| data.components.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coe::StandaloneHost;

    #[tokio::test]
    async fn fills_identity_fields() {
        let ctx = MonitorContext::new(Arc::new(StandaloneHost::new()));
        let mut monitor = NuvlaEdgeInfoMonitor::new(&ctx);
        monitor.update_data().await.unwrap();

        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        assert_eq!(
            payload.architecture.as_deref(),
            Some(std::env::consts::ARCH)
        );
        assert_eq!(payload.components, Some(vec!["agent".to_string()]));
        assert!(payload.resources.is_none());
        assert_eq!(
            payload.nuvlabox_engine_version.as_deref(),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }
}
