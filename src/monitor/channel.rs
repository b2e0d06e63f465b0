//! Single-slot hand-off between a monitor and the telemetry aggregator.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::telemetry::TelemetryPayload;

/// Holds at most one pending fragment. Publishing never blocks; an
/// unconsumed fragment is replaced by the newer one.
#[derive(Debug, Default)]
pub struct ReportChannel {
    slot: Mutex<Option<TelemetryPayload>>,
}

impl ReportChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<TelemetryPayload>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `fragment`, discarding any pending one. Returns whether a
    /// fragment was discarded.
    pub fn publish(&self, monitor: &str, fragment: TelemetryPayload) -> bool {
        let discarded = self.slot().replace(fragment).is_some();
        if discarded {
            tracing::warn!(
                monitor = %monitor,
                "Telemetry channel data not being consumed on time. Discarding old data"
            );
        }
        discarded
    }

    /// Take the pending fragment, if any.
    pub fn try_take(&self) -> Option<TelemetryPayload> {
        self.slot().take()
    }

    pub fn is_full(&self) -> bool {
        self.slot().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(host: &str) -> TelemetryPayload {
        TelemetryPayload {
            hostname: Some(host.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn newest_fragment_wins() {
        let channel = ReportChannel::new();
        assert!(!channel.publish("m", fragment("first")));
        assert!(channel.is_full());
        assert!(channel.publish("m", fragment("second")));

        let taken = channel.try_take().unwrap();
        assert_eq!(taken.hostname.as_deref(), Some("second"));
        assert!(channel.try_take().is_none());
        assert!(!channel.is_full());
    }
}
