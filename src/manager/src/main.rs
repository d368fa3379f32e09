use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use common::cli::{CommonArgs, CommonCommands, utils};
use common::metadata;

use manager::collector::Collector;
use manager::filestore::FileStore;
use manager::sweeper::Sweeper;
use manager::{ManagerState, router};

#[derive(Parser)]
#[command(name = "cbscope-manager")]
#[command(about = "cbscope snapshot control plane - registers clusters for scraping")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<ManagerCommands>,
}

#[derive(Subcommand)]
enum ManagerCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for ManagerCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = utils::load_config(&cli.common)?;
    utils::init_logging(&cli.common, &config);

    let command = cli.command.unwrap_or_default();
    let ManagerCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }

    log::info!("Starting cbscope manager service");

    if !config.agent.is_vmagent() {
        bail!(
            "Unsupported agent type: {}. Only vmagent is supported",
            config.agent.kind
        );
    }

    let directory = Path::new(&config.agent.directory);
    if !directory.exists() {
        std::fs::create_dir_all(directory).with_context(|| {
            format!("Failed to create scrape directory {}", directory.display())
        })?;
        log::info!("Created scrape directory {}", directory.display());
    }

    let metadata = metadata::connect(&config).await;
    let state = ManagerState {
        files: Arc::new(FileStore::new(directory)),
        metadata: metadata.clone(),
        collector: Arc::new(Collector::new().context("Failed to build collector HTTP client")?),
        agent_type: config.agent.kind.clone(),
    };

    let sweeper_handle = Sweeper::from_config(&config, metadata).spawn();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("Snapshot control API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .context("HTTP server error")?;

    log::info!("Shutting down manager service");
    sweeper_handle.abort();
    log::info!("Manager service stopped gracefully");

    Ok(())
}
