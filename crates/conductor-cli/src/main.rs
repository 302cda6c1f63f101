mod heartbeat;

use clap::{Parser, Subcommand};
use conductor_gateway::GatewayServer;
use conductor_orchestrator::{Orchestrator, OrchestratorConfig};
use heartbeat::HeartbeatAgent;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: agent orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the config file and print the effective settings
    Check,
}

#[derive(Deserialize, Default)]
struct ConductorConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    orchestrator: OrchestratorConfig,
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

/// Load the config file. A missing file yields the defaults.
async fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => toml::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e)
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(ConductorConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            let orchestrator = Arc::new(Orchestrator::new(config.orchestrator));
            orchestrator
                .register_agent(Arc::new(HeartbeatAgent::new()))
                .await?;
            orchestrator.initialize().await?;

            let app = GatewayServer::build(orchestrator.clone());
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            info!("Conductor gateway listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutdown signal received");
                })
                .await?;

            orchestrator.shutdown().await;
        }
        Commands::Check => {
            println!("Config OK: {}", cli.config.display());
            println!("  server: {}:{}", config.server.host, config.server.port);
            let retry = &config.orchestrator.retry;
            println!(
                "  retry: max_retries={} backoff_base_ms={} backoff_max_ms={}",
                retry.max_retries, retry.backoff_base_ms, retry.backoff_max_ms
            );
            println!(
                "  max_delegation_depth={} max_error_log_entries={} max_recent_failures={}",
                config.orchestrator.max_delegation_depth,
                config.orchestrator.max_error_log_entries,
                config.orchestrator.max_recent_failures
            );
        }
    }

    Ok(())
}
