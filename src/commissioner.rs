//! Commissioning: tells Nuvla what this NuvlaEdge can do and which cluster it
//! manages.
//!
//! Every run rebuilds the attributes from the orchestrator, compares them with
//! the last set Nuvla accepted and sends only what changed. The accepted set is
//! kept on disk so a restart does not commission everything again.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coe::CoeClient;
use crate::error::{CoeError, NuvlaError, UnitError};
use crate::monitor::EdgeStatus;
use crate::nuvla::NuvlaApi;
use crate::status::StatusSender;
use crate::telemetry::map_diff;
use crate::worker::Unit;

const STATUS_MODULE: &str = "Commissioner";

/// Capabilities every agent offers.
pub const CAPABILITIES: [&str; 2] = ["NUVLA_HEARTBEAT", "NUVLA_JOB_PULL"];

/// Attributes of the commission operation.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommissioningAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_orchestrator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_managers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_workers: Option<Vec<String>>,
}

impl CommissioningAttributes {
    fn to_json_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// The changed attributes plus a `removed` list of the ones that disappeared.
/// `None` when nothing changed.
pub fn commission_payload(
    last: &CommissioningAttributes,
    current: &CommissioningAttributes,
) -> Option<Map<String, Value>> {
    let last = last.to_json_map();
    let mut payload = current.to_json_map();
    let (changed, removed) = map_diff(&last, &payload);
    if changed.is_empty() && removed.is_empty() {
        return None;
    }

    payload.retain(|key, _| changed.contains(key));
    if !removed.is_empty() {
        payload.insert(
            "removed".into(),
            Value::Array(removed.into_iter().map(Value::String).collect()),
        );
    }
    Some(payload)
}

#[derive(Clone)]
pub struct CommissionerParams {
    pub coe: Arc<dyn CoeClient>,
    pub nuvla: Arc<dyn NuvlaApi>,
    pub status: StatusSender,
    /// Shared with the monitors, which discover the node id.
    pub edge_status: Arc<RwLock<EdgeStatus>>,
    pub nuvlaedge_uuid: Option<String>,
    /// Where the last accepted attributes are kept.
    pub commissioning_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionerAction {
    Run,
}

pub struct Commissioner {
    params: CommissionerParams,
    last_payload: CommissioningAttributes,
}

impl Commissioner {
    pub fn new(params: &CommissionerParams) -> Self {
        tracing::info!("Creating commissioner object...");
        let commissioner = Self {
            last_payload: load_commission(&params.commissioning_file),
            params: params.clone(),
        };
        commissioner.params.status.starting(STATUS_MODULE, "");
        commissioner
    }

    /// Attributes last accepted by Nuvla.
    pub fn last_payload(&self) -> &CommissioningAttributes {
        &self.last_payload
    }

    /// Commission whatever changed since the last accepted attributes.
    ///
    /// Returns whether anything was sent and accepted.
    pub async fn run(&mut self) -> bool {
        tracing::info!("Running Commissioning checks");
        self.params.status.running(STATUS_MODULE, "");

        let current = self.current_attributes().await;
        let Some(payload) = commission_payload(&self.last_payload, &current) else {
            tracing::info!("Nothing to commission, system configuration remains the same.");
            return false;
        };

        let fields: Vec<String> = payload.keys().cloned().collect();
        tracing::info!(?fields, "Commissioning data has changed, commissioning...");
        match self.params.nuvla.commission(payload).await {
            Ok(()) => {
                self.last_payload = current;
                if let Err(e) = self.save_commission() {
                    tracing::warn!(path = %self.params.commissioning_file.display(), error = %e, "Could not save commissioned data");
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Commissioning failed, will retry next cycle");
                self.params.status.warning(STATUS_MODULE, format!("Commission failed: {e}"));
                false
            }
        }
    }

    async fn current_attributes(&self) -> CommissioningAttributes {
        let mut current = CommissioningAttributes {
            capabilities: Some(CAPABILITIES.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        };

        // Cluster data waits until telemetry has found the node.
        let edge = self
            .params
            .edge_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(node_id) = edge.node_id else {
            tracing::info!("Cluster data not yet pushed to telemetry. Waiting to commission it");
            return current;
        };

        match self.cluster_info(&node_id, edge.orchestrator.as_deref()).await {
            Ok(Some(cluster)) => {
                current.cluster_id = cluster.cluster_id;
                current.cluster_orchestrator = cluster.cluster_orchestrator;
                current.cluster_managers = cluster.cluster_managers;
                current.cluster_workers = cluster.cluster_workers;
            }
            Ok(None) => tracing::debug!(node = %node_id, "Not a cluster manager, no cluster data"),
            Err(e) => tracing::warn!(error = %e, "Could not gather cluster information"),
        }
        current
    }

    /// Cluster attributes, only known on a manager node.
    async fn cluster_info(
        &self,
        node_id: &str,
        orchestrator: Option<&str>,
    ) -> Result<Option<CommissioningAttributes>, CoeError> {
        let coe = &self.params.coe;
        let managers = coe.get_cluster_managers().await?;
        if !managers.iter().any(|m| m == node_id) {
            return Ok(None);
        }

        let workers = coe
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| !managers.contains(n))
            .collect();
        let cluster_id = match coe.cluster_id().await {
            Some(id) => id,
            None => format!(
                "cluster_{}",
                self.params.nuvlaedge_uuid.as_deref().unwrap_or("unknown")
            ),
        };
        let orchestrator = match orchestrator.unwrap_or_else(|| coe.orchestrator()) {
            "docker" => "swarm",
            other => other,
        };

        Ok(Some(CommissioningAttributes {
            cluster_id: Some(cluster_id),
            cluster_orchestrator: Some(orchestrator.to_string()),
            cluster_managers: Some(managers),
            cluster_workers: Some(workers),
            ..Default::default()
        }))
    }

    fn save_commission(&self) -> Result<(), NuvlaError> {
        let path = &self.params.commissioning_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&self.last_payload)?)?;
        Ok(())
    }
}

/// Previously accepted attributes, empty when none were saved or the file is
/// unreadable.
fn load_commission(path: &std::path::Path) -> CommissioningAttributes {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CommissioningAttributes::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read previous commission");
            return CommissioningAttributes::default();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Previous commission is not valid, ignoring it");
        CommissioningAttributes::default()
    })
}

#[async_trait]
impl Unit for Commissioner {
    type Params = CommissionerParams;
    type Action = CommissionerAction;
    const NAME: &'static str = "Commissioner";

    fn build(params: &CommissionerParams) -> Result<Self, UnitError> {
        Ok(Self::new(params))
    }

    fn capabilities() -> &'static [CommissionerAction] {
        &[CommissionerAction::Run]
    }

    async fn perform(&mut self, action: CommissionerAction) -> Result<(), UnitError> {
        match action {
            CommissionerAction::Run => {
                self.run().await;
            }
        }
        Ok(())
    }
}
