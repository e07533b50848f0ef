//! Cadence — follow-up journey executor for email/SMS sequences.
//!
//! `serve` starts the HTTP trigger and operator API; `run-once` executes a
//! single batch and prints the report, for cron-style invocation.

use std::sync::Arc;

use anyhow::Context;
use cadence_api::{ApiServer, AppState};
use cadence_channels::ProviderGateway;
use cadence_core::config::AppConfig;
use cadence_core::event_bus::tracing_sink;
use cadence_journey::{BatchExecutor, EnrollmentControls, MemoryStore};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Follow-up journey executor for email and SMS sequences")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CADENCE__NODE_ID")]
    node_id: Option<String>,

    /// Default batch limit (overrides config)
    #[arg(long, env = "CADENCE__EXECUTOR__BATCH_LIMIT")]
    batch_limit: Option<usize>,

    /// Seed the in-memory store with a demo business, sequence and customers
    #[arg(long, default_value_t = false)]
    seed_demo: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve {
        /// HTTP port (overrides config)
        #[arg(long, env = "CADENCE__API__HTTP_PORT")]
        http_port: Option<u16>,
    },
    /// Execute one batch of due enrollments and exit
    RunOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_journey=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Cadence starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(limit) = cli.batch_limit {
        config.executor.batch_limit = limit;
    }
    let command = cli.command.unwrap_or(Command::Serve { http_port: None });
    if let Command::Serve {
        http_port: Some(port),
    } = command
    {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        batch_limit = config.executor.batch_limit,
        on_send_failure = ?config.executor.on_send_failure,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    if cli.seed_demo {
        let seed = store
            .seed_demo_data(chrono::Utc::now())
            .context("seeding demo data")?;
        info!(sequence_id = %seed.sequence_id, enrollments = seed.enrollment_ids.len(), "Demo data loaded");
    }

    let events = tracing_sink();
    let gateway = ProviderGateway::from_config(&config.channels);
    let executor = Arc::new(
        BatchExecutor::from_config(&config, gateway)
            .context("building journey executor")?
            .with_event_sink(events.clone()),
    );

    match command {
        Command::RunOnce => {
            let report = executor
                .execute_batch(store.as_ref(), chrono::Utc::now(), config.executor.batch_limit)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve { .. } => {
            let state = AppState::new(
                store,
                executor,
                Arc::new(EnrollmentControls::new().with_event_sink(events)),
                config.executor.batch_limit,
                config.node_id.clone(),
            );
            let api_server = ApiServer::new(config.clone(), state);

            if config.metrics.enabled {
                if let Err(e) = api_server.start_metrics() {
                    error!(error = %e, "Failed to start metrics exporter");
                }
            }

            info!("Cadence is ready to serve traffic");

            api_server.start_http().await?;
        }
    }

    Ok(())
}
