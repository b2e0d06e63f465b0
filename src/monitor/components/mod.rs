//! Built-in monitors.

pub mod coe_resources;
pub mod container_stats;
pub mod network;
pub mod nuvlaedge_info;
pub mod power;
pub mod resources;
pub mod temperature;
pub mod vulnerabilities;

pub use coe_resources::CoeResourcesMonitor;
pub use container_stats::ContainerStatsMonitor;
pub use network::NetworkMonitor;
pub use nuvlaedge_info::NuvlaEdgeInfoMonitor;
pub use power::PowerMonitor;
pub use resources::ResourcesMonitor;
pub use temperature::TemperatureMonitor;
pub use vulnerabilities::VulnerabilitiesMonitor;
