//! Static table of the monitors the agent knows how to build.

use crate::monitor::components::{
    CoeResourcesMonitor, ContainerStatsMonitor, NetworkMonitor, NuvlaEdgeInfoMonitor, PowerMonitor,
    ResourcesMonitor, TemperatureMonitor, VulnerabilitiesMonitor,
};
use crate::monitor::{Monitor, MonitorContext};

/// A named monitor constructor.
#[derive(Clone, Copy)]
pub struct MonitorRegistration {
    /// Always ends in `_monitor`; the part before is what exclusion matches.
    pub name: &'static str,
    pub build: fn(&MonitorContext) -> Box<dyn Monitor>,
}

impl std::fmt::Debug for MonitorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistration")
            .field("name", &self.name)
            .finish()
    }
}

static BUILTIN_MONITORS: [MonitorRegistration; 8] = [
    MonitorRegistration {
        name: NuvlaEdgeInfoMonitor::NAME,
        build: NuvlaEdgeInfoMonitor::boxed,
    },
    MonitorRegistration {
        name: ResourcesMonitor::NAME,
        build: ResourcesMonitor::boxed,
    },
    MonitorRegistration {
        name: CoeResourcesMonitor::NAME,
        build: CoeResourcesMonitor::boxed,
    },
    MonitorRegistration {
        name: PowerMonitor::NAME,
        build: PowerMonitor::boxed,
    },
    MonitorRegistration {
        name: ContainerStatsMonitor::NAME,
        build: ContainerStatsMonitor::boxed,
    },
    MonitorRegistration {
        name: NetworkMonitor::NAME,
        build: NetworkMonitor::boxed,
    },
    MonitorRegistration {
        name: TemperatureMonitor::NAME,
        build: TemperatureMonitor::boxed,
    },
    MonitorRegistration {
        name: VulnerabilitiesMonitor::NAME,
        build: VulnerabilitiesMonitor::boxed,
    },
];

pub fn builtin_monitors() -> &'static [MonitorRegistration] {
    &BUILTIN_MONITORS
}
