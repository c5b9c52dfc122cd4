//! Gateway entry point: CLI flags, config resolution, logging, serving.

mod server;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use luagate_mcp::{
    core::DownstreamTransport, CapabilityStore, GatewayConfig, GatewayMetrics, MetaToolDispatcher,
    UpstreamManager,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use server::GatewayDeps;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;

#[derive(Parser, Debug)]
#[command(
    name = "luagate",
    version,
    about = "Lua-scripted gateway and aggregator for MCP servers"
)]
struct Cli {
    /// Print the active configuration file path and exit
    #[arg(short = 'c', long = "config-path")]
    config_path: bool,
}

/// `CONFIG_PATH` wins over the platform config directory.
fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("luagate")
        .join("config.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path();

    if cli.config_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    // stdout carries MCP framing in stdio mode; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = GatewayConfig::from_file(&config_path).await?;
    config.apply_env_overrides()?;
    info!(
        config_path = %config_path.display(),
        clients = config.mcp_clients.len(),
        "Configuration loaded"
    );

    let capabilities = Arc::new(CapabilityStore::new());
    let metrics = Arc::new(GatewayMetrics::new());
    let manager = UpstreamManager::new(Arc::clone(&capabilities), Arc::clone(&metrics));
    let dispatcher = Arc::new(MetaToolDispatcher::new(
        Arc::clone(&manager),
        Arc::clone(&metrics),
    ));

    let config = Arc::new(config);
    let deps = GatewayDeps {
        config: Arc::clone(&config),
        manager,
        dispatcher,
        capabilities,
    };

    match config.transport {
        DownstreamTransport::Stdio => server::serve_stdio(deps).await,
        DownstreamTransport::Http => {
            let host = config.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = config.port.unwrap_or(DEFAULT_PORT);
            server::serve_http(deps, &host, port).await
        }
    }
}
