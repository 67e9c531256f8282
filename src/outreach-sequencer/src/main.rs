//! Outreach Sequencer: segment-based email sequences for leads and customers.
//!
//! `trigger` feeds trigger events into the orchestrator, `worker` executes due
//! steps until interrupted, `cancel` stops a running sequence.

mod services;

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outreach_core::config::AppConfig;
use outreach_core::types::{CampaignType, DelayMode, TriggerEvent};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::services::{start_metrics, Services};

#[derive(Parser, Debug)]
#[command(name = "outreach-sequencer")]
#[command(about = "Segment-based outreach sequence scheduler")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID", global = true)]
    node_id: Option<String>,

    /// Delay table unit: `production` (hours) or `accelerated` (minutes)
    #[arg(long, env = "OUTREACH__SEQUENCER__MODE", value_parser = parse_mode, global = true)]
    mode: Option<DelayMode>,

    /// Use Redis for the CRM store and step queue (overrides config)
    #[arg(long, global = true)]
    redis: bool,

    /// Prometheus exporter port; enables the exporter
    #[arg(long, env = "OUTREACH__METRICS__PORT", global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle trigger events from a file or stdin (one JSON object per line,
    /// or a JSON array)
    Trigger {
        /// Input file; stdin when omitted or `-`
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
    /// Execute due steps until interrupted
    Worker {
        /// Trigger events to handle before polling starts
        #[arg(long)]
        triggers: Option<PathBuf>,
    },
    /// Cancel an active sequence
    Cancel {
        #[arg(long)]
        email: String,
        #[arg(long, value_parser = parse_campaign)]
        campaign: CampaignType,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

fn parse_mode(raw: &str) -> Result<DelayMode, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "production" => Ok(DelayMode::Production),
        "accelerated" => Ok(DelayMode::Accelerated),
        other => Err(format!("unknown mode '{other}', expected production or accelerated")),
    }
}

fn parse_campaign(raw: &str) -> Result<CampaignType, String> {
    raw.parse().map_err(|e: outreach_core::OutreachError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach=info,outreach_sequencer=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(mode) = cli.mode {
        config.sequencer.mode = mode;
    }
    if cli.redis {
        config.redis.enabled = true;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        mode = ?config.sequencer.mode,
        redis = config.redis.enabled,
        clickhouse = config.clickhouse.enabled,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config.metrics) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let services = Services::build(&config).await?;

    match cli.command {
        Command::Trigger { file } => {
            let events = read_events(file.as_ref())?;
            handle_triggers(&services, &events).await;
        }
        Command::Worker { triggers } => {
            if let Some(path) = triggers {
                let events = read_events(Some(&path))?;
                handle_triggers(&services, &events).await;
            }
            run_worker(services).await?;
        }
        Command::Cancel {
            email,
            campaign,
            reason,
        } => {
            let cancelled = services
                .orchestrator
                .cancel_sequence(&email, campaign, &reason)
                .await?;
            println!("{}", serde_json::json!({ "email": email, "campaign": campaign, "cancelled": cancelled }));
        }
    }

    Ok(())
}

/// Each outcome is printed as one JSON line; failures are logged and the
/// remaining events still run.
async fn handle_triggers(services: &Services, events: &[TriggerEvent]) {
    for event in events {
        match services.orchestrator.handle_trigger(event).await {
            Ok(outcome) => match serde_json::to_string(&outcome) {
                Ok(line) => println!("{line}"),
                Err(e) => error!(error = %e, "Failed to serialize outcome"),
            },
            Err(e) => {
                error!(email = %event.email, campaign = %event.campaign_type, error = %e, "Trigger failed");
            }
        }
    }
}

async fn run_worker(services: Services) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = services.worker;
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}

fn read_events(path: Option<&PathBuf>) -> anyhow::Result<Vec<TriggerEvent>> {
    let raw = match path {
        Some(p) if p.as_os_str() != "-" => std::fs::read_to_string(p)?,
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    parse_events(&raw)
}

fn parse_events(raw: &str) -> anyhow::Result<Vec<TriggerEvent>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}
