use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use common::cli::{CommonArgs, CommonCommands, utils};
use common::couchbase::QueryClient;
use common::metadata;

use querier::{QuerierState, router};

#[derive(Parser)]
#[command(name = "cbscope-querier")]
#[command(about = "cbscope query plane - snapshot views, metric rows, and PromQL over SQL++")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<QuerierCommands>,
}

#[derive(Subcommand)]
enum QuerierCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for QuerierCommands {
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
    let QuerierCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }

    log::info!("Starting cbscope querier service");

    // The query plane keeps serving (with 503s) when the backend is down at
    // boot; a restart picks it up again.
    let executor = match QueryClient::new(&config.metadata) {
        Ok(client) => match client.ping().await {
            Ok(()) => {
                log::info!(
                    "Connected to query service at {}:{}",
                    config.metadata.host,
                    config.metadata.query_port
                );
                Some(Arc::new(client))
            }
            Err(err) => {
                log::warn!("Query service is unreachable, metric endpoints disabled: {err}");
                None
            }
        },
        Err(err) => {
            log::warn!("Failed to build query client, metric endpoints disabled: {err}");
            None
        }
    };

    let state = QuerierState {
        executor,
        metadata: metadata::connect(&config).await,
        ts_keyspace: config.timeseries.keyspace.clone(),
        metadata_keyspace: config.metadata.keyspace(),
    };

    let addr = format!("{}:{}", config.querier.host, config.querier.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("Query-plane API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .context("HTTP server error")?;

    log::info!("Querier service stopped gracefully");

    Ok(())
}
