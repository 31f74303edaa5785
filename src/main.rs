//! Agent Backplane - multi-tenant container execution for coding agents
//!
//! The daemon provisions one Linux container per authenticated user, then
//! brokers streamed agent queries, interactive PTY sessions, and workspace
//! file operations against it over a WebSocket multiplex.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agent_backplane::agent::{AgentBroker, Provider};
use agent_backplane::config::Configuration;
use agent_backplane::container::ContainerManager;
use agent_backplane::database::Database;
use agent_backplane::pty::PtyBroker;
use agent_backplane::router::{self, AppState, WriterRegistry};
use agent_backplane::workspace::FileGateway;

#[derive(Parser)]
#[command(name = "agent-backplane")]
#[command(about = "Container execution backplane for coding agents")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agent_backplane={}", log_level).into()),
        )
        .init();

    info!("Starting Agent Backplane v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&cli.config).await {
        error!("Backplane error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Data directory: {}", config.system.data_directory.display());
    info!("  Runtime image: {}", config.docker.image);

    let db = Arc::new(Database::open(&config.system.database_path)?);

    let docker = connect_docker()?;
    match docker.ping().await {
        Ok(_) => info!("Docker daemon reachable"),
        Err(e) => warn!("Docker daemon not reachable yet: {}", e),
    }

    let manager = Arc::new(ContainerManager::new(docker, config.clone(), db));

    // Align registry records with the live runtime before serving clients
    manager.reconcile().await;

    let shutdown = CancellationToken::new();
    let reaper = manager.spawn_reaper(shutdown.clone());

    let state = AppState {
        config: config.clone(),
        manager: manager.clone(),
        claude: Arc::new(AgentBroker::new(
            Provider::Claude,
            manager.clone(),
            config.clone(),
        )),
        cursor: Arc::new(AgentBroker::new(
            Provider::Cursor,
            manager.clone(),
            config.clone(),
        )),
        codex: Arc::new(AgentBroker::new(
            Provider::Codex,
            manager.clone(),
            config.clone(),
        )),
        pty: Arc::new(PtyBroker::new(manager.clone(), config.clone())),
        files: Arc::new(FileGateway::new(manager.clone(), config.clone())),
        writers: Arc::new(WriterRegistry::new()),
    };

    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    info!("Listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install CTRL+C handler: {}", e);
                return;
            }
            warn!("Received shutdown signal");
            shutdown_signal.cancel();
        })
        .await?;

    reaper.abort();
    info!("Backplane stopped");
    Ok(())
}

/// Connect to the Docker daemon, honoring DOCKER_HOST when set
fn connect_docker() -> std::result::Result<bollard::Docker, bollard::errors::Error> {
    match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("tcp://") || host.starts_with("http") => {
            bollard::Docker::connect_with_http_defaults()
        }
        Ok(_) => bollard::Docker::connect_with_socket_defaults(),
        Err(_) => bollard::Docker::connect_with_local_defaults(),
    }
}
