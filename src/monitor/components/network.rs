//! Network interfaces, their addresses and traffic counters.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sysinfo::Networks;

use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceTraffic {
    pub interface: String,
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NetworkData {
    /// Interface carrying the default route.
    pub default_gw: Option<String>,
    /// First IPv4 address of the default gateway interface.
    pub local_ip: Option<String>,
    pub interfaces: BTreeMap<String, Vec<IpAddr>>,
    pub traffic: Vec<InterfaceTraffic>,
}

pub struct NetworkMonitor {
    host_fs: PathBuf,
    networks: Networks,
    data: NetworkData,
}

fn read_counter(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Interface of the `00000000` destination in a `/proc/net/route` table.
fn default_route_interface(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        (fields.next()? == "00000000").then(|| iface.to_string())
    })
}

impl NetworkMonitor {
    pub const NAME: &'static str = "network_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        Self {
            host_fs: ctx.host_fs.clone(),
            networks: Networks::new(),
            data: NetworkData::default(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn data(&self) -> &NetworkData {
        &self.data
    }

    /// Counters under `sys/class/net/<iface>/statistics`. Interfaces missing
    /// either counter are skipped.
    fn read_traffic(&self) -> Vec<InterfaceTraffic> {
        let sysfs_net = self.host_fs.join("sys/class/net");
        let Ok(entries) = std::fs::read_dir(&sysfs_net) else {
            tracing::warn!(path = %sysfs_net.display(), "Cannot find network information for this device");
            return Vec::new();
        };
        let mut traffic: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let interface = e.file_name().into_string().ok()?;
                let stats = e.path().join("statistics");
                Some(InterfaceTraffic {
                    bytes_received: read_counter(&stats.join("rx_bytes"))?,
                    bytes_transmitted: read_counter(&stats.join("tx_bytes"))?,
                    interface,
                })
            })
            .collect();
        traffic.sort_by(|a, b| a.interface.cmp(&b.interface));
        traffic
    }

    fn read_default_gw(&self) -> Option<String> {
        let table = std::fs::read_to_string(self.host_fs.join("proc/net/route")).ok()?;
        default_route_interface(&table)
    }

    fn read_addresses(&mut self) -> BTreeMap<String, Vec<IpAddr>> {
        self.networks.refresh(true);
        self.networks
            .list()
            .iter()
            .map(|(name, data)| {
                let ips = data.ip_networks().iter().map(|n| n.addr).collect();
                (name.clone(), ips)
            })
            .collect()
    }
}

#[async_trait]
impl Monitor for NetworkMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        let interfaces = self.read_addresses();
        let default_gw = self.read_default_gw();
        let local_ip = default_gw
            .as_ref()
            .and_then(|gw| interfaces.get(gw))
            .and_then(|ips| ips.iter().find(|ip| ip.is_ipv4()))
            .map(IpAddr::to_string);

        self.data = NetworkData {
            default_gw,
            local_ip,
            interfaces,
            traffic: self.read_traffic(),
        };
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        let data = &self.data;
        let interfaces: Vec<Value> = data
            .interfaces
            .iter()
            .map(|(name, ips)| {
                let ips: Vec<Value> = ips.iter().map(|ip| json!({"address": ip.to_string()})).collect();
                json!({"interface": name, "ips": ips})
            })
            .collect();

        let mut network = Map::new();
        if let Some(gw) = &data.default_gw {
            network.insert("default-gw".into(), Value::String(gw.clone()));
        }
        network.insert(
            "ips".into(),
            json!({"local": data.local_ip.clone().unwrap_or_default()}),
        );
        network.insert("interfaces".into(), Value::Array(interfaces));
        payload.network = Some(Value::Object(network));
        payload.ip = data.local_ip.clone();

        if !data.traffic.is_empty() {
            let mut resources = Map::new();
            resources.insert("net-stats".into(), serde_json::to_value(&data.traffic)?);
            payload.resources = Some(Value::Object(resources));
        }
        Ok(())
    }
}
