//! The telemetry document and its merge/diff rules.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::EdgeState;

/// Telemetry sent to Nuvla. Every field is optional; a monitor fills in only
/// the fields it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EdgeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_notes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nuvlabox_engine_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_boot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperatures: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_server_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_managers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_nodes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_node_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_plugins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubelet_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub coe_resources: Option<Value>,
}

macro_rules! take_set_fields {
    ($dst:ident, $src:ident, [$($field:ident),* $(,)?]) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )*
    };
}

impl TelemetryPayload {
    /// Copy every field set in `other` over `self`. Last writer wins.
    ///
    /// `resources` is shared by several monitors, so its top-level keys are
    /// merged instead of replaced.
    pub fn merge(&mut self, mut other: TelemetryPayload) {
        if let Some(theirs) = other.resources.take() {
            match (&mut self.resources, theirs) {
                (Some(Value::Object(mine)), Value::Object(theirs)) => mine.extend(theirs),
                (slot, theirs) => *slot = Some(theirs),
            }
        }

        take_set_fields!(self, other, [
            status,
            status_notes,
            current_time,
            components,
            nuvlabox_engine_version,
            last_boot,
            vulnerabilities,
            network,
            temperatures,
            operating_system,
            architecture,
            ip,
            hostname,
            docker_server_version,
            node_id,
            cluster_id,
            cluster_managers,
            cluster_nodes,
            cluster_node_role,
            orchestrator,
            container_plugins,
            kubelet_version,
            coe_resources,
        ]);
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Serialized form with unset fields omitted.
    pub fn to_json_map(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Fields to send and fields to delete when moving from `old` to `new`.
///
/// A field is sent when `new` sets it to a value different from `old`. A field
/// is deleted when `old` had it and `new` does not.
pub fn payload_diff(
    old: &TelemetryPayload,
    new: &TelemetryPayload,
) -> (BTreeSet<String>, BTreeSet<String>) {
    map_diff(&old.to_json_map(), &new.to_json_map())
}

/// [`payload_diff`] over already serialized documents.
pub fn map_diff(
    old: &serde_json::Map<String, Value>,
    new: &serde_json::Map<String, Value>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let to_send = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    let to_delete = old
        .keys()
        .filter(|key| !new.contains_key(*key))
        .cloned()
        .collect();
    (to_send, to_delete)
}
