//! Host CPU, memory and disk usage.

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CpuData {
    pub capacity: usize,
    /// 15 minute load average.
    pub load: f64,
    pub load_1: f64,
    pub load_5: f64,
    pub topic: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryData {
    /// MiB
    pub capacity: u64,
    /// MiB
    pub used: u64,
    pub topic: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskData {
    pub device: String,
    /// Bytes
    pub capacity: u64,
    /// Bytes
    pub used: u64,
    pub topic: &'static str,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResourcesData {
    pub cpu: Option<CpuData>,
    pub ram: Option<MemoryData>,
    pub disks: Vec<DiskData>,
}

pub struct ResourcesMonitor {
    system: System,
    data: ResourcesData,
}

impl ResourcesMonitor {
    pub const NAME: &'static str = "resources_monitor";

    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system,
            data: ResourcesData::default(),
        }
    }

    pub fn boxed(_ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new())
    }

    pub fn data(&self) -> &ResourcesData {
        &self.data
    }

    fn cpu(&mut self) -> CpuData {
        self.system.refresh_cpu_all();
        let load = System::load_average();
        CpuData {
            capacity: self.system.cpus().len(),
            load: load.fifteen,
            load_1: load.one,
            load_5: load.five,
            topic: "cpu",
        }
    }

    fn memory(&mut self) -> MemoryData {
        self.system.refresh_memory();
        MemoryData {
            capacity: self.system.total_memory() / MIB,
            used: self.system.used_memory() / MIB,
            topic: "ram",
        }
    }

    fn disks() -> Vec<DiskData> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| DiskData {
                device: d.name().to_string_lossy().into_owned(),
                capacity: d.total_space(),
                used: d.total_space().saturating_sub(d.available_space()),
                topic: "disks",
            })
            .collect()
    }
}

impl Default for ResourcesMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Monitor for ResourcesMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        self.data = ResourcesData {
            cpu: Some(self.cpu()),
            ram: Some(self.memory()),
            disks: Self::disks(),
        };
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        let mut resources = serde_json::Map::new();
        if !self.data.disks.is_empty() {
            resources.insert("disks".into(), serde_json::to_value(&self.data.disks)?);
        }
        if let Some(cpu) = &self.data.cpu {
            resources.insert("cpu".into(), serde_json::to_value(cpu)?);
        }
        if let Some(ram) = &self.data.ram {
            resources.insert("ram".into(), serde_json::to_value(ram)?);
        }

        if !resources.is_empty() {
            payload.resources = Some(serde_json::Value::Object(resources));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_data_leaves_resources_unset() {
        let monitor = ResourcesMonitor::new();
        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        assert!(payload.resources.is_none());
    }

    #[tokio::test]
    async fn reports_cpu_and_ram() {
        let mut monitor = ResourcesMonitor::new();
        monitor.update_data().await.unwrap();
        assert!(monitor.data().cpu.as_ref().unwrap().capacity > 0);

        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        let resources = payload.resources.unwrap();
        assert_eq!(resources["cpu"]["topic"], "cpu");
        assert!(resources["cpu"].get("load-1").is_some());
        assert!(resources["ram"]["capacity"].as_u64().unwrap() > 0);
    }
}
