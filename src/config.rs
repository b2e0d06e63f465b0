//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Agent settings, read from the environment at startup.
#[derive(Debug)]
pub struct AgentSettings {
    /// NuvlaEdge identifier (`nuvlabox/<uuid>`). Optional once credentials exist.
    pub nuvlaedge_uuid: Option<String>,
    /// Nuvla endpoint host.
    pub nuvla_endpoint: String,
    /// API key credential.
    pub api_key: Option<String>,
    /// API secret credential.
    pub api_secret: Option<SecretString>,
    /// Comma-separated monitor names to exclude (quotes tolerated).
    pub excluded_monitors: Option<String>,
    /// Directory holding the agent's persisted state.
    pub shared_data_volume: PathBuf,
    /// Mount point of the host filesystem inside the agent container.
    pub host_fs: PathBuf,
    /// Telemetry (refresh) interval.
    pub telemetry_period: Duration,
    /// Heartbeat interval.
    pub heartbeat_period: Duration,
    /// How long `stop` waits for a worker task to confirm termination.
    pub worker_stop_timeout: Duration,
    /// When set, logs are also written to a daily rolling file here.
    pub logging_directory: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            nuvlaedge_uuid: None,
            nuvla_endpoint: "nuvla.io".to_string(),
            api_key: None,
            api_secret: None,
            excluded_monitors: None,
            shared_data_volume: PathBuf::from("/var/lib/nuvlaedge/"),
            host_fs: PathBuf::from("/rootfs"),
            telemetry_period: Duration::from_secs(60),
            heartbeat_period: Duration::from_secs(20),
            worker_stop_timeout: Duration::from_secs(10),
            logging_directory: None,
        }
    }
}

impl AgentSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            nuvlaedge_uuid: get("NUVLAEDGE_UUID").or_else(|| get("NUVLABOX_UUID")),
            nuvla_endpoint: get("NUVLA_ENDPOINT").unwrap_or(defaults.nuvla_endpoint),
            api_key: get("NUVLAEDGE_API_KEY"),
            api_secret: get("NUVLAEDGE_API_SECRET").map(SecretString::from),
            excluded_monitors: get("NUVLAEDGE_EXCLUDED_MONITORS"),
            shared_data_volume: get("NUVLAEDGE_SHARED_DATA_VOLUME")
                .or_else(|| get("SHARED_DATA_VOLUME"))
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_data_volume),
            host_fs: get("HOST_FS").map(PathBuf::from).unwrap_or(defaults.host_fs),
            telemetry_period: secs(
                "NUVLAEDGE_TELEMETRY_PERIOD",
                get("NUVLAEDGE_TELEMETRY_PERIOD"),
                defaults.telemetry_period,
            )?,
            heartbeat_period: secs(
                "NUVLAEDGE_HEARTBEAT_PERIOD",
                get("NUVLAEDGE_HEARTBEAT_PERIOD"),
                defaults.heartbeat_period,
            )?,
            worker_stop_timeout: secs(
                "NUVLAEDGE_WORKER_STOP_TIMEOUT",
                get("NUVLAEDGE_WORKER_STOP_TIMEOUT"),
                defaults.worker_stop_timeout,
            )?,
            logging_directory: get("NUVLAEDGE_LOGGING_DIRECTORY").map(PathBuf::from),
        };

        if settings.nuvlaedge_uuid.is_none() && !settings.has_credentials() {
            return Err(ConfigError::MissingRequired {
                key: "NUVLAEDGE_UUID".to_string(),
                hint: "Set NUVLAEDGE_UUID or provide NUVLAEDGE_API_KEY and NUVLAEDGE_API_SECRET"
                    .to_string(),
            });
        }

        Ok(settings)
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    /// File where the last known NuvlaEdge status document is kept.
    pub fn status_file(&self) -> PathBuf {
        self.shared_data_volume.join("nuvlaedge-status.json")
    }

    /// File where the last accepted commission is kept.
    pub fn commissioning_file(&self) -> PathBuf {
        self.shared_data_volume.join("commission_data.json")
    }
}

fn secs(key: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a number of seconds: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}
