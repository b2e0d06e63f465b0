//! Thermal zone temperatures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sysinfo::Components;

use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemperatureZone {
    pub thermal_zone: String,
    /// Degrees Celsius
    pub value: f64,
}

pub struct TemperatureMonitor {
    thermal_path: PathBuf,
    zones: BTreeMap<String, TemperatureZone>,
}

fn first_token(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.split_whitespace().next().map(str::to_string)
}

impl TemperatureMonitor {
    pub const NAME: &'static str = "temperature_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        Self {
            thermal_path: ctx.host_fs.join("sys/devices/virtual/thermal"),
            zones: BTreeMap::new(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn zones(&self) -> impl Iterator<Item = &TemperatureZone> {
        self.zones.values()
    }

    fn update(&mut self, zone: String, value: f64) {
        self.zones.insert(
            zone.clone(),
            TemperatureZone {
                thermal_zone: zone,
                value,
            },
        );
    }

    /// `thermal*/type` names the zone, `thermal*/temp` holds millidegrees.
    fn read_thermal_zones(&mut self) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(&self.thermal_path)? {
            let dir = entry?.path();
            let is_zone = dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("thermal"));
            if !is_zone {
                continue;
            }

            let (Some(zone), Some(raw)) = (first_token(&dir.join("type")), first_token(&dir.join("temp")))
            else {
                tracing::warn!(zone = %dir.display(), "Thermal zone name or temperature missing");
                continue;
            };
            match raw.parse::<f64>() {
                Ok(millis) => self.update(zone, millis / 1000.0),
                Err(e) => tracing::warn!(zone = %zone, value = %raw, error = %e, "Cannot convert temperature"),
            }
        }
        Ok(())
    }

    fn read_sensors(&mut self) {
        let components = Components::new_with_refreshed_list();
        for component in components.list() {
            if let Some(celsius) = component.temperature() {
                self.update(component.label().to_string(), f64::from(celsius));
            }
        }
    }
}

#[async_trait]
impl Monitor for TemperatureMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        if self.thermal_path.exists() {
            self.read_thermal_zones()
        } else {
            self.read_sensors();
            Ok(())
        }
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        if self.zones.is_empty() {
            return Ok(());
        }
        let zones = self
            .zones
            .values()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;
        payload.temperatures = Some(zones);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coe::StandaloneHost;
    use std::sync::Arc;

    fn zone(root: &Path, dir: &str, kind: &str, temp: &str) {
        let path = root.join("sys/devices/virtual/thermal").join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("type"), format!("{kind}\n")).unwrap();
        std::fs::write(path.join("temp"), format!("{temp}\n")).unwrap();
    }

    #[tokio::test]
    async fn reads_zones_in_degrees() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "thermal_zone0", "x86_pkg_temp", "45500");
        zone(dir.path(), "thermal_zone1", "acpitz", "not-a-number");
        // Cooling devices share the directory and are ignored.
        std::fs::create_dir_all(dir.path().join("sys/devices/virtual/thermal/cooling_device0"))
            .unwrap();

        let mut ctx = MonitorContext::new(Arc::new(StandaloneHost::new()));
        ctx.host_fs = dir.path().to_path_buf();
        let mut monitor = TemperatureMonitor::new(&ctx);
        monitor.update_data().await.unwrap();

        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        let zones = payload.temperatures.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0]["thermal-zone"], "x86_pkg_temp");
        assert_eq!(zones[0]["value"], 45.5);
    }

    #[tokio::test]
    async fn empty_zone_directory_leaves_field_unset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/devices/virtual/thermal")).unwrap();
        let mut ctx = MonitorContext::new(Arc::new(StandaloneHost::new()));
        ctx.host_fs = dir.path().to_path_buf();

        let mut monitor = TemperatureMonitor::new(&ctx);
        monitor.update_data().await.unwrap();
        let mut payload = TelemetryPayload::default();
        monitor.populate_telemetry_payload(&mut payload).unwrap();
        assert!(payload.temperatures.is_none());
    }
}
