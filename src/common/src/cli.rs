use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by both cbscope binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,

    #[arg(
        value_name = "section.field=value",
        help = "Configuration overrides applied after the config file"
    )]
    pub overrides: Vec<String>,
}

/// Common subcommands available for both services
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result, bail};

    /// Initialize logging from CLI flags, falling back to the configured level
    pub fn init_logging(args: &CommonArgs, config: &Configuration) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            &config.logging.level
        };

        if std::env::var("RUST_LOG").is_err() {
            // SAFETY: setting RUST_LOG before any threads read it is safe
            unsafe {
                std::env::set_var("RUST_LOG", level);
            }
        }
        tracing_subscriber::fmt::init();
    }

    /// Parse dotted `section.field=value` override arguments into a nested
    /// value tree that figment can merge over the config file.
    pub fn parse_overrides(overrides: &[String]) -> Result<serde_json::Value> {
        let mut root = serde_json::Map::new();

        for raw in overrides {
            let (path, value) = raw
                .split_once('=')
                .with_context(|| format!("invalid override '{raw}' (expected section.field=value)"))?;

            let segments: Vec<&str> = path.split('.').collect();
            if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
                bail!("invalid override path '{path}' (expected section.field)");
            }

            // Values stay strings; figment coerces them during extraction,
            // the same way its Env provider does.
            let leaf = serde_json::Value::String(value.to_string());

            let mut node = &mut root;
            for segment in &segments[..segments.len() - 1] {
                node = node
                    .entry(segment.to_string())
                    .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
                    .as_object_mut()
                    .with_context(|| format!("override path '{path}' conflicts with a scalar"))?;
            }
            node.insert(segments[segments.len() - 1].to_string(), leaf);
        }

        Ok(serde_json::Value::Object(root))
    }

    /// Load configuration with optional path and override arguments from CLI
    pub fn load_config(args: &CommonArgs) -> Result<Configuration> {
        if let Some(path) = &args.config {
            log::info!("Loading configuration from: {}", path.display());
        }
        let overrides = parse_overrides(&args.overrides)?;
        Configuration::load_with_overrides(args.config.as_deref(), &overrides)
            .context("Failed to load configuration")
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("cbscope Configuration:");
            println!("======================");
            println!("Manager listener: {}:{}", config.server.host, config.server.port);
            println!(
                "Querier listener: {}:{}",
                config.querier.host, config.querier.port
            );
            println!("Agent type: {}", config.agent.kind);
            println!("Scrape directory: {}", config.agent.directory);
            println!("Sweep interval: {:?}", config.manager.effective_interval());
            println!(
                "Stale threshold: {:?}",
                config.manager.effective_stale_threshold()
            );
            if config.metadata.enabled {
                println!(
                    "Metadata store: {} (bucket {})",
                    config.metadata.host, config.metadata.bucket
                );
            } else {
                println!("Metadata store: disabled");
            }
            println!("Time-series keyspace: {}", config.timeseries.keyspace);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if !config.agent.is_vmagent() {
            bail!(
                "Unsupported agent type: {}. Only vmagent is supported",
                config.agent.kind
            );
        }

        if config.agent.directory.is_empty() {
            bail!("Agent directory cannot be empty");
        }

        if config.metadata.enabled && config.metadata.host.is_empty() {
            bail!("Metadata host cannot be empty when metadata is enabled");
        }

        if config.timeseries.keyspace.is_empty() {
            bail!("Time-series keyspace cannot be empty");
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Resolves when SIGINT or SIGTERM is received; used as the HTTP
    /// servers' graceful-shutdown trigger.
    pub async fn shutdown_signal() {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    /// Handle common CLI commands that don't require starting services
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }
}
