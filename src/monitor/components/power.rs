//! Power rails exposed by INA3221 monitors on NVIDIA Jetson boards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::monitor::{Monitor, MonitorContext};
use crate::telemetry::TelemetryPayload;

struct Board {
    i2c_addresses: &'static [&'static str],
    channels_path: &'static [&'static str],
}

struct Driver {
    name: &'static str,
    channels: usize,
    boards: &'static [Board],
}

static DRIVERS: &[Driver] = &[Driver {
    name: "ina3221x",
    channels: 3,
    boards: &[
        // agx_xavier
        Board {
            i2c_addresses: &["1-0040", "1-0041"],
            channels_path: &["1-0040/iio:device0", "1-0041/iio:device1"],
        },
        // xavier_nx
        Board {
            i2c_addresses: &["7-0040"],
            channels_path: &["7-0040/iio:device0"],
        },
        // nano
        Board {
            i2c_addresses: &["6-0040"],
            channels_path: &["6-0040/iio:device0"],
        },
        // tx1
        Board {
            i2c_addresses: &["1-0040"],
            channels_path: &["1-0040/iio:device0"],
        },
        // tx1 dev kit
        Board {
            i2c_addresses: &["1-0042", "1-0043"],
            channels_path: &["1-0042/iio:device2", "1-0043/iio:device3"],
        },
        // tx2
        Board {
            i2c_addresses: &["0-0040", "0-0041"],
            channels_path: &["0-0040/iio:device0", "0-0041/iio:device1"],
        },
        // tx2 dev kit
        Board {
            i2c_addresses: &["0-0042", "0-0043"],
            channels_path: &["0-0042/iio:device2", "0-0043/iio:device3"],
        },
    ],
}];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PowerEntry {
    pub metric_name: String,
    pub energy_consumption: f64,
    pub unit: &'static str,
}

pub struct PowerMonitor {
    host_fs: PathBuf,
    drivers: Vec<&'static Driver>,
    entries: BTreeMap<String, PowerEntry>,
}

/// `<bus>-<4 digit address>`, e.g. `1-0040`.
fn is_i2c_address(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 6
        && bytes[0].is_ascii_digit()
        && bytes[1] == b'-'
        && bytes[2..].iter().all(u8::is_ascii_digit)
}

fn read_first_token(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content.split_whitespace().next().map(str::to_string)
}

impl PowerMonitor {
    pub const NAME: &'static str = "power_monitor";

    pub fn new(ctx: &MonitorContext) -> Self {
        let host_fs = ctx.host_fs.clone();
        let drivers: Vec<_> = DRIVERS
            .iter()
            .filter(|d| driver_path(&host_fs, d.name).exists())
            .collect();
        if drivers.is_empty() {
            tracing::info!(monitor = Self::NAME, "No power driver supported, disabling");
        }
        Self {
            host_fs,
            drivers,
            entries: BTreeMap::new(),
        }
    }

    pub fn boxed(ctx: &MonitorContext) -> Box<dyn Monitor> {
        Box::new(Self::new(ctx))
    }

    pub fn entries(&self) -> impl Iterator<Item = &PowerEntry> {
        self.entries.values()
    }

    fn read_driver(&self, driver: &Driver) -> Vec<PowerEntry> {
        let root = driver_path(&self.host_fs, driver.name);
        let Ok(dir) = std::fs::read_dir(&root) else {
            tracing::warn!(path = %root.display(), "Power driver path disappeared");
            return Vec::new();
        };
        let found: Vec<String> = dir
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| is_i2c_address(n))
            .collect();

        let mut powers = Vec::new();
        for board in driver.boards {
            if !board.i2c_addresses.iter().all(|a| found.iter().any(|f| f == a)) {
                continue;
            }
            for channels_path in board.channels_path {
                let folder = root.join(channels_path);
                for channel in 0..driver.channels {
                    powers.extend(read_channel(&folder, channel));
                }
            }
        }
        powers
    }
}

fn driver_path(host_fs: &Path, driver: &str) -> PathBuf {
    host_fs.join("sys/bus/i2c/drivers").join(driver)
}

/// Current, voltage, power and critical current limit of one rail. All four
/// files must exist.
fn read_channel(folder: &Path, channel: usize) -> Vec<PowerEntry> {
    let Some(rail) = read_first_token(&folder.join(format!("rail_name_{channel}"))) else {
        tracing::debug!(folder = %folder.display(), channel, "No rail name for power channel");
        return Vec::new();
    };

    let metrics = [
        (format!("in_current{channel}_input"), "current", "mA"),
        (format!("in_voltage{channel}_input"), "voltage", "mV"),
        (format!("in_power{channel}_input"), "power", "mW"),
        (format!("crit_current_limit_{channel}"), "critical_current_limit", "mA"),
    ];
    if !metrics.iter().all(|(file, _, _)| folder.join(file).exists()) {
        tracing::debug!(folder = %folder.display(), channel, "Power metric files missing, skipping");
        return Vec::new();
    }

    metrics
        .iter()
        .filter_map(|(file, suffix, unit)| {
            let value = read_first_token(&folder.join(file))?.parse::<f64>().ok()?;
            Some(PowerEntry {
                metric_name: format!("{rail}_{suffix}"),
                energy_consumption: value,
                unit: *unit,
            })
        })
        .collect()
}

#[async_trait]
impl Monitor for PowerMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn enabled(&self) -> bool {
        !self.drivers.is_empty()
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        for &driver in &self.drivers {
            for entry in self.read_driver(driver) {
                self.entries.insert(entry.metric_name.clone(), entry);
            }
        }
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let entries: Vec<_> = self.entries.values().collect();
        let mut resources = serde_json::Map::new();
        resources.insert("power-consumption".into(), serde_json::to_value(entries)?);
        payload.resources = Some(serde_json::Value::Object(resources));
        Ok(())
    }
}
