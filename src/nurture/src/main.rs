//! Nurture: lifecycle email workflow engine.
//!
//! Loads workflow definitions and contacts, starts the metrics exporter and
//! runs the due-execution scheduler until interrupted.

mod mailer;
mod notify;
mod webhook;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use nurture_core::collaborators::Collaborators;
use nurture_core::memory::{InMemoryContactStore, InMemoryPurchaseStore, StaticContentGenerator};
use nurture_core::types::{Contact, ContactFilter};
use nurture_core::{AppConfig, EngineError};
use nurture_engine::types::WorkflowDefinition;
use nurture_engine::WorkflowEngine;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::mailer::LogMailer;
use crate::notify::ChatNotifier;
use crate::webhook::HttpWebhookCaller;

#[derive(Parser, Debug)]
#[command(name = "nurture")]
#[command(about = "Lifecycle email workflow engine")]
#[command(version)]
struct Cli {
    /// Config file; NURTURE__* environment variables take precedence
    #[arg(long, env = "NURTURE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "NURTURE__NODE_ID")]
    node_id: Option<String>,

    /// Sweep interval in milliseconds (overrides config)
    #[arg(long, env = "NURTURE__SCHEDULER__SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "NURTURE__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// JSON array of workflow definitions to create and activate at startup
    #[arg(long)]
    workflows: Option<PathBuf>,

    /// JSON array of contacts to seed the contact store with
    #[arg(long)]
    contacts: Option<PathBuf>,

    /// Enroll every seeded contact into every activated workflow
    #[arg(long, default_value_t = false)]
    enroll_all: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "nurture=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Nurture starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.sweep_interval_ms {
        config.scheduler.sweep_interval_ms = interval;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        sweep_interval_ms = config.scheduler.sweep_interval_ms,
        batch_size = config.scheduler.batch_size,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let contacts = Arc::new(InMemoryContactStore::new());
    if let Some(path) = &cli.contacts {
        let seeded: Vec<Contact> = read_json(path)?;
        info!(count = seeded.len(), "Seeding contacts");
        for contact in seeded {
            contacts.insert(contact);
        }
    }

    let mailer = Arc::new(LogMailer);
    let collaborators = Collaborators {
        contacts,
        purchases: Arc::new(InMemoryPurchaseStore::new()),
        mailer: mailer.clone(),
        notifier: Arc::new(ChatNotifier::new(
            config.notify.clone(),
            config.webhook.timeout_ms,
            mailer,
        )?),
        webhooks: Arc::new(HttpWebhookCaller::new(config.webhook.timeout_ms)?),
        content: Some(Arc::new(StaticContentGenerator::new())),
    };

    let engine = WorkflowEngine::new(&config, collaborators);

    if let Some(path) = &cli.workflows {
        let definitions: Vec<WorkflowDefinition> = read_json(path)?;
        for definition in definitions {
            load_workflow(&engine, definition);
        }
    }

    if cli.enroll_all {
        for workflow in engine.list_workflows().into_iter().filter(|w| w.is_active) {
            match engine.enroll_all_by_filter(workflow.id, ContactFilter::All).await {
                Ok(report) => info!(
                    workflow = %workflow.name,
                    enrolled = report.enrolled,
                    skipped = report.skipped,
                    errors = report.errors.len(),
                    "Bulk enrollment finished"
                ),
                Err(e) => error!(workflow = %workflow.name, error = %e, "Bulk enrollment failed"),
            }
        }
    }

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(engine.scheduler().run(shutdown.clone()));

    info!("Nurture is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    scheduler.await?;

    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn load_workflow(engine: &WorkflowEngine, definition: WorkflowDefinition) {
    let name = definition.name.clone();
    let created = match engine.create_workflow(definition) {
        Ok(created) => created,
        Err(e) => {
            error!(workflow = %name, error = %e, "Failed to create workflow");
            return;
        }
    };
    match engine.activate(created.id) {
        Ok(_) => info!(workflow = %name, id = %created.id, "Workflow activated"),
        Err(EngineError::Validation(errors)) => {
            for issue in &errors {
                warn!(workflow = %name, node = ?issue.node_id, edge = ?issue.edge_id, "{}", issue.message);
            }
            warn!(workflow = %name, problems = errors.len(), "Workflow left inactive");
        }
        Err(e) => error!(workflow = %name, error = %e, "Failed to activate workflow"),
    }
}
