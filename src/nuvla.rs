//! Nuvla API contract and an offline implementation.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NuvlaError;

/// What Nuvla answers to a telemetry or heartbeat request.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NuvlaResponse {
    #[serde(default)]
    pub jobs: Vec<String>,
    pub doc_last_updated: Option<String>,
    /// Seconds between telemetry reports requested by Nuvla.
    pub refresh_interval: Option<u64>,
    /// Seconds between heartbeats requested by Nuvla.
    pub heartbeat_interval: Option<u64>,
}

#[async_trait]
pub trait NuvlaApi: Send + Sync {
    /// Send changed telemetry fields and the names of fields to remove.
    async fn telemetry(
        &self,
        data: Map<String, Value>,
        attributes_to_delete: Vec<String>,
    ) -> Result<NuvlaResponse, NuvlaError>;

    async fn heartbeat(&self) -> Result<NuvlaResponse, NuvlaError>;

    /// Send changed commissioning attributes. `removed` lists the attributes
    /// no longer present.
    async fn commission(&self, payload: Map<String, Value>) -> Result<(), NuvlaError>;

    /// Whether the NuvlaEdge status resource accepts `field`.
    fn supports_telemetry_field(&self, field: &str) -> bool;
}

/// Keeps the status document on local disk instead of talking to Nuvla.
pub struct OfflineNuvla {
    status_file: PathBuf,
}

impl OfflineNuvla {
    pub fn new(status_file: impl Into<PathBuf>) -> Self {
        Self {
            status_file: status_file.into(),
        }
    }

    /// The status document as last written, empty when none exists yet.
    pub fn read_status(&self) -> Result<Map<String, Value>, NuvlaError> {
        match std::fs::read_to_string(&self.status_file) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_status(&self, status: &Map<String, Value>) -> Result<(), NuvlaError> {
        if let Some(parent) = self.status_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.status_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(status)?)?;
        std::fs::rename(&tmp, &self.status_file)?;
        Ok(())
    }
}

#[async_trait]
impl NuvlaApi for OfflineNuvla {
    async fn telemetry(
        &self,
        data: Map<String, Value>,
        attributes_to_delete: Vec<String>,
    ) -> Result<NuvlaResponse, NuvlaError> {
        let mut status = self.read_status()?;
        for key in &attributes_to_delete {
            status.remove(key);
        }
        let updated = data.len();
        status.extend(data);
        self.write_status(&status)?;
        tracing::debug!(
            path = %self.status_file.display(),
            updated,
            deleted = attributes_to_delete.len(),
            "Status document written"
        );
        Ok(NuvlaResponse::default())
    }

    async fn heartbeat(&self) -> Result<NuvlaResponse, NuvlaError> {
        Ok(NuvlaResponse::default())
    }

    async fn commission(&self, payload: Map<String, Value>) -> Result<(), NuvlaError> {
        let fields: Vec<_> = payload.keys().collect();
        tracing::info!(?fields, "No Nuvla connection, commission kept locally");
        Ok(())
    }

    /// The local document takes any field.
    fn supports_telemetry_field(&self, _field: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn telemetry_updates_and_deletes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let nuvla = OfflineNuvla::new(dir.path().join("shared/nuvlaedge-status.json"));
        assert!(nuvla.read_status().unwrap().is_empty());

        nuvla
            .telemetry(map(json!({"hostname": "edge", "node-id": "n1"})), Vec::new())
            .await
            .unwrap();
        nuvla
            .telemetry(map(json!({"hostname": "edge-2"})), vec!["node-id".into()])
            .await
            .unwrap();

        let status = nuvla.read_status().unwrap();
        assert_eq!(status.get("hostname"), Some(&json!("edge-2")));
        assert!(!status.contains_key("node-id"));
    }

    #[tokio::test]
    async fn heartbeat_has_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let nuvla = OfflineNuvla::new(dir.path().join("status.json"));
        assert_eq!(nuvla.heartbeat().await.unwrap(), NuvlaResponse::default());
    }

    #[tokio::test]
    async fn offline_commission_is_accepted_and_fields_supported() {
        let dir = tempfile::tempdir().unwrap();
        let nuvla = OfflineNuvla::new(dir.path().join("status.json"));
        nuvla
            .commission(map(json!({"capabilities": ["NUVLA_HEARTBEAT"]})))
            .await
            .unwrap();
        assert!(nuvla.supports_telemetry_field("coe-resources"));
        // Commissioning does not touch the status document.
        assert!(nuvla.read_status().unwrap().is_empty());
    }

    #[test]
    fn response_uses_nuvla_field_names() {
        let response: NuvlaResponse = serde_json::from_value(json!({
            "jobs": ["job/1"],
            "doc-last-updated": "2024-01-01T00:00:00Z",
            "refresh-interval": 90
        }))
        .unwrap();
        assert_eq!(response.jobs, vec!["job/1"]);
        assert_eq!(response.refresh_interval, Some(90));
        assert_eq!(response.heartbeat_interval, None);
    }
}
