//! End-to-end tests: agent loop, commissioning, telemetry supervision and
//! monitor healing, all on a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use nuvlaedge::agent::{Agent, AgentDeps};
use nuvlaedge::coe::StandaloneHost;
use nuvlaedge::config::AgentSettings;
use nuvlaedge::error::NuvlaError;
use nuvlaedge::monitor::{Monitor, MonitorContext, MonitorRegistration};
use nuvlaedge::nuvla::{NuvlaApi, NuvlaResponse};
use nuvlaedge::status::StatusHandler;
use nuvlaedge::telemetry::{Telemetry, TelemetryAction, TelemetryParams, TelemetryPayload};
use nuvlaedge::worker::WorkerManager;

#[derive(Default)]
struct RecordingNuvla {
    telemetry: Mutex<Vec<(Map<String, Value>, Vec<String>)>>,
    commissions: Mutex<Vec<Map<String, Value>>>,
    heartbeats: AtomicUsize,
    refresh_interval: Option<u64>,
    heartbeat_interval: Option<u64>,
    /// How long each heartbeat takes to answer.
    heartbeat_delay: Duration,
    unsupported_fields: Vec<&'static str>,
}

#[async_trait]
impl NuvlaApi for RecordingNuvla {
    async fn telemetry(
        &self,
        data: Map<String, Value>,
        attributes_to_delete: Vec<String>,
    ) -> Result<NuvlaResponse, NuvlaError> {
        self.telemetry.lock().unwrap().push((data, attributes_to_delete));
        Ok(NuvlaResponse {
            refresh_interval: self.refresh_interval,
            ..Default::default()
        })
    }

    async fn heartbeat(&self) -> Result<NuvlaResponse, NuvlaError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.heartbeat_delay).await;
        Ok(NuvlaResponse {
            jobs: vec!["job/abc".into()],
            heartbeat_interval: self.heartbeat_interval,
            ..Default::default()
        })
    }

    async fn commission(&self, payload: Map<String, Value>) -> Result<(), NuvlaError> {
        self.commissions.lock().unwrap().push(payload);
        Ok(())
    }

    fn supports_telemetry_field(&self, field: &str) -> bool {
        !self.unsupported_fields.contains(&field)
    }
}

fn settings(host_fs: &std::path::Path) -> AgentSettings {
    AgentSettings {
        nuvlaedge_uuid: Some("nuvlabox/0001".into()),
        host_fs: host_fs.to_path_buf(),
        shared_data_volume: host_fs.join("shared"),
        ..Default::default()
    }
}

fn deps(nuvla: Arc<RecordingNuvla>) -> AgentDeps {
    AgentDeps {
        nuvla,
        coe: Arc::new(StandaloneHost::new()),
    }
}

#[tokio::test(start_paused = true)]
async fn controlled_startup_sends_telemetry_and_applies_refresh_interval() {
    let host_fs = tempfile::tempdir().unwrap();
    let nuvla = Arc::new(RecordingNuvla {
        refresh_interval: Some(90),
        ..Default::default()
    });
    let mut agent = Agent::new(&settings(host_fs.path()), deps(nuvla.clone())).unwrap();
    agent.run_controlled_startup().await.unwrap();

    {
        let sent = nuvla.telemetry.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (data, deleted) = &sent[0];
        assert!(data.contains_key("current-time"));
        assert_eq!(data["status"], "OPERATIONAL");
        assert!(data["status-notes"].as_array().is_some_and(|n| !n.is_empty()));
        assert!(deleted.is_empty());
    }
    assert!(agent.telemetry_payload().current_time.is_some());

    // Commissioned once during startup, capabilities only on a standalone host.
    {
        let commissions = nuvla.commissions.lock().unwrap();
        assert_eq!(commissions.len(), 1);
        assert_eq!(
            commissions[0]["capabilities"],
            serde_json::json!(["NUVLA_HEARTBEAT", "NUVLA_JOB_PULL"])
        );
        assert!(!commissions[0].contains_key("cluster-id"));
    }
    assert!(host_fs.path().join("shared/commission_data.json").exists());

    assert_eq!(agent.telemetry_period(), Duration::from_secs(90));
    assert_eq!(
        agent.worker_manager().period("Telemetry"),
        Some(Duration::from_secs(90))
    );
    let telemetry_action = agent
        .actions_summary()
        .into_iter()
        .find(|a| a.name == "telemetry")
        .unwrap();
    assert_eq!(telemetry_action.period_secs, 90.0);

    assert!(agent.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn run_loop_sends_heartbeats_until_stopped() {
    let host_fs = tempfile::tempdir().unwrap();
    let nuvla = Arc::new(RecordingNuvla::default());
    let mut agent = Agent::new(&settings(host_fs.path()), deps(nuvla.clone())).unwrap();
    let exit = agent.exit_token();

    let handle = tokio::spawn(async move {
        let result = agent.run().await;
        (agent, result)
    });

    tokio::time::sleep(Duration::from_secs(50)).await;
    exit.cancel();
    let (mut agent, result) = handle.await.unwrap();
    result.unwrap();

    // Heartbeats at 20s and 40s; telemetry not due before 60s.
    assert_eq!(nuvla.heartbeats.load(Ordering::SeqCst), 2);
    assert!(nuvla.telemetry.lock().unwrap().is_empty());
    assert!(agent.worker_manager().is_running("Telemetry"));
    assert!(agent.worker_manager().is_running("Commissioner"));

    // The commissioner's first cycle at 3s; its next one at 63s.
    assert_eq!(nuvla.commissions.lock().unwrap().len(), 1);

    let workers = agent.workers_summary();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].name, "Commissioner");
    assert_eq!(workers[0].period_secs, 60.0);
    assert!(workers.iter().all(|w| w.error_count == 0));

    assert!(agent.shutdown().await);
    assert!(!agent.worker_manager().is_running("Telemetry"));
    assert!(!agent.worker_manager().is_running("Commissioner"));
}

async fn telemetry_monitors(agent: &Agent) -> Vec<String> {
    let telemetry = agent.worker_manager().unit::<Telemetry>().unwrap();
    let names = telemetry
        .lock()
        .await
        .monitor_names()
        .into_iter()
        .map(String::from)
        .collect();
    names
}

#[tokio::test]
async fn coe_resources_monitor_follows_nuvla_support() {
    let host_fs = tempfile::tempdir().unwrap();

    let supported = Arc::new(RecordingNuvla::default());
    let agent = Agent::new(&settings(host_fs.path()), deps(supported)).unwrap();
    let names = telemetry_monitors(&agent).await;
    assert!(names.iter().any(|n| n == "coe_resources_monitor"));
    assert!(names.iter().any(|n| n == "container_stats_monitor"));
    assert!(names.iter().any(|n| n == "vulnerabilities_monitor"));

    let unsupported = Arc::new(RecordingNuvla {
        unsupported_fields: vec!["coe-resources"],
        ..Default::default()
    });
    let agent = Agent::new(&settings(host_fs.path()), deps(unsupported)).unwrap();
    let names = telemetry_monitors(&agent).await;
    assert!(!names.iter().any(|n| n == "coe_resources_monitor"));
    assert!(names.iter().any(|n| n == "resources_monitor"));
}

async fn run_for(mut agent: Agent, duration: Duration) -> Agent {
    let exit = agent.exit_token();
    let handle = tokio::spawn(async move {
        let result = agent.run().await;
        (agent, result)
    });
    tokio::time::sleep(duration).await;
    exit.cancel();
    let (agent, result) = handle.await.unwrap();
    result.unwrap();
    agent
}

#[tokio::test(start_paused = true)]
async fn late_heartbeat_gets_one_more_period() {
    let host_fs = tempfile::tempdir().unwrap();
    // Sent at 20s, answered at 50s: past the 20s timeout, within the retry.
    let nuvla = Arc::new(RecordingNuvla {
        heartbeat_delay: Duration::from_secs(30),
        heartbeat_interval: Some(25),
        ..Default::default()
    });
    let agent = Agent::new(&settings(host_fs.path()), deps(nuvla.clone())).unwrap();
    let mut agent = run_for(agent, Duration::from_secs(55)).await;

    assert_eq!(agent.heartbeat_period(), Duration::from_secs(25));
    assert!(agent.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_late_twice_is_dropped() {
    let host_fs = tempfile::tempdir().unwrap();
    // Sent at 20s, still pending at 60s when the retry runs out.
    let nuvla = Arc::new(RecordingNuvla {
        heartbeat_delay: Duration::from_secs(45),
        heartbeat_interval: Some(25),
        ..Default::default()
    });
    let agent = Agent::new(&settings(host_fs.path()), deps(nuvla.clone())).unwrap();
    let mut agent = run_for(agent, Duration::from_secs(65)).await;

    assert_eq!(agent.heartbeat_period(), Duration::from_secs(20));
    assert!(nuvla.heartbeats.load(Ordering::SeqCst) >= 1);
    assert!(agent.shutdown().await);
}

struct Beacon;

#[async_trait]
impl Monitor for Beacon {
    fn name(&self) -> &str {
        "beacon_monitor"
    }

    async fn update_data(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn populate_telemetry_payload(&self, payload: &mut TelemetryPayload) -> anyhow::Result<()> {
        payload.hostname = Some("beacon".into());
        Ok(())
    }
}

fn beacon(_: &MonitorContext) -> Box<dyn Monitor> {
    Box::new(Beacon)
}

static BEACON_REGISTRY: [MonitorRegistration; 1] = [MonitorRegistration {
    name: "beacon_monitor",
    build: beacon,
}];

#[tokio::test(start_paused = true)]
async fn supervised_telemetry_starts_and_heals_monitors() {
    let status = StatusHandler::new();
    let context = MonitorContext::new(Arc::new(StandaloneHost::new()));
    let mut params = TelemetryParams::new(context, status.sender(), Duration::from_secs(15));
    params.registry = &BEACON_REGISTRY;

    let mut manager = WorkerManager::new();
    assert!(
        manager
            .add_worker::<Telemetry>(
                Duration::from_secs(15),
                params,
                &[TelemetryAction::Run],
                Some(Duration::from_secs(1)),
            )
            .unwrap()
    );
    manager.start();
    let telemetry = manager.unit::<Telemetry>().unwrap();

    // First health check at 1s starts the monitor.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(telemetry.lock().await.monitor("beacon_monitor").unwrap().is_running());

    // Its first update lands half a period after start.
    tokio::time::sleep(Duration::from_secs(8)).await;
    let snapshot = telemetry.lock().await.get_telemetry();
    assert_eq!(snapshot.hostname.as_deref(), Some("beacon"));

    telemetry.lock().await.monitor("beacon_monitor").unwrap().stop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!telemetry.lock().await.monitor("beacon_monitor").unwrap().is_running());

    // Next health check at 16s recreates it.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(telemetry.lock().await.monitor("beacon_monitor").unwrap().is_running());

    telemetry.lock().await.stop_monitors();
    assert!(manager.stop().await);
}
