use std::sync::Arc;

use nuvlaedge::agent::{Agent, AgentDeps};
use nuvlaedge::coe::StandaloneHost;
use nuvlaedge::config::AgentSettings;
use nuvlaedge::nuvla::OfflineNuvla;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = AgentSettings::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export NUVLAEDGE_UUID=nuvlabox/<uuid>");
        std::process::exit(1);
    });

    // Initialize tracing; keep the guard alive so file logs are flushed.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &settings.logging_directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("NuvlaEdge agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   NuvlaEdge: {}",
        settings.nuvlaedge_uuid.as_deref().unwrap_or("(from credentials)")
    );
    eprintln!("   Nuvla endpoint: {}", settings.nuvla_endpoint);
    eprintln!("   Status file: {}", settings.status_file().display());
    eprintln!(
        "   Telemetry every {}s, heartbeat every {}s",
        settings.telemetry_period.as_secs(),
        settings.heartbeat_period.as_secs()
    );
    if let Some(excluded) = &settings.excluded_monitors {
        eprintln!("   Excluded monitors: {excluded}");
    }
    if let Some(dir) = &settings.logging_directory {
        eprintln!("   Logs: {}", dir.display());
    }

    let deps = AgentDeps {
        nuvla: Arc::new(OfflineNuvla::new(settings.status_file())),
        coe: Arc::new(StandaloneHost::new()),
    };
    let mut agent = Agent::new(&settings, deps)?;
    agent.run_controlled_startup().await?;

    let exit = agent.exit_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down...");
            exit.cancel();
        }
    });

    let result = agent.run().await;
    if !agent.shutdown().await {
        tracing::warn!("Some workers did not confirm termination");
    }
    result?;
    Ok(())
}
