//! Wires the configured backends into the orchestrator and the worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use outreach_analytics::ClickHouseSink;
use outreach_channels::{
    ChatNotifier, EmailProvider, FallbackCatalog, NoopNotifier, RecordingEmailProvider,
    SendGridProvider, SlackNotifier, TemplateLibrary,
};
use outreach_core::config::{AppConfig, MetricsConfig};
use outreach_core::event_bus::{noop_sink, EventSink};
use outreach_crm::{CrmClient, CrmSequenceStore, InMemoryCrm, RedisCrm, SequenceStore};
use outreach_journey::{
    catalog, DelayCalculator, DueStepWorker, SequenceOrchestrator, StepExecutor, StepScheduler,
};
use outreach_queue::{InMemoryStepQueue, RedisStepQueue, StepQueue};
use tracing::{error, info, warn};

pub struct Services {
    pub orchestrator: Arc<SequenceOrchestrator>,
    pub worker: DueStepWorker,
}

impl Services {
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let (crm, queue): (Arc<dyn CrmClient>, Arc<dyn StepQueue>) = if config.redis.enabled {
            (
                Arc::new(RedisCrm::new(&config.redis).await?),
                Arc::new(RedisStepQueue::new(&config.redis).await?),
            )
        } else {
            warn!("Redis disabled, using in-memory CRM and step queue");
            (Arc::new(InMemoryCrm::new()), Arc::new(InMemoryStepQueue::new()))
        };
        let store: Arc<dyn SequenceStore> = Arc::new(CrmSequenceStore::new(crm, config.retry.clone()));

        let sink = event_sink(config).await;

        let library = Arc::new(TemplateLibrary::new());
        let seeded = catalog::seed_library(&library);
        info!(templates = seeded, "Template library loaded");

        let email: Arc<dyn EmailProvider> = if config.sendgrid.api_key.is_empty() {
            warn!("No SendGrid API key configured, emails will be recorded, not sent");
            Arc::new(RecordingEmailProvider::new())
        } else {
            Arc::new(SendGridProvider::new(config.sendgrid.clone())?)
        };

        let notifier: Arc<dyn ChatNotifier> = match &config.alerts.slack_webhook_url {
            Some(url) if !url.is_empty() => Arc::new(SlackNotifier::new(url.clone())?),
            _ => Arc::new(NoopNotifier),
        };

        let scheduler = StepScheduler::new(
            queue.clone(),
            store.clone(),
            DelayCalculator::new(config.sequencer.mode),
            config.retry.clone(),
        )
        .with_event_sink(sink.clone());

        let orchestrator = Arc::new(
            SequenceOrchestrator::new(store.clone(), scheduler, notifier)
                .with_signal_policy(config.signals.clone())
                .with_alert_segment(config.sequencer.alert_segment)
                .with_event_sink(sink.clone()),
        );

        let executor = Arc::new(
            StepExecutor::new(
                store,
                library,
                FallbackCatalog::with_defaults(),
                email,
                config.retry.clone(),
            )
            .with_event_sink(sink),
        );

        let worker = DueStepWorker::new(queue, executor, config.retry.clone())
            .with_batch_size(config.sequencer.batch_size)
            .with_poll_interval(Duration::from_millis(config.sequencer.poll_interval_ms));

        Ok(Self { orchestrator, worker })
    }
}

async fn event_sink(config: &AppConfig) -> Arc<dyn EventSink> {
    if !config.clickhouse.enabled {
        return noop_sink();
    }
    match ClickHouseSink::new(&config.clickhouse, config.node_id.clone()).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "Failed to connect to ClickHouse, delivery analytics disabled");
            noop_sink()
        }
    }
}

pub fn start_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder
        .with_http_listener(SocketAddr::new(config.host.parse()?, config.port))
        .install()?;

    info!(port = config.port, "Metrics exporter started");
    Ok(())
}
