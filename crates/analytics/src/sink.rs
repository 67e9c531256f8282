//! Asynchronous delivery-event sink that batches events and writes to ClickHouse.
//! Emission never blocks: events go through a bounded channel and are
//! dropped (and counted) when it is full.

use outreach_core::config::ClickHouseConfig;
use outreach_core::event_bus::EventSink;
use outreach_core::types::DeliveryEvent;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 100_000;

pub struct ClickHouseSink {
    sender: mpsc::Sender<DeliveryEvent>,
    node_id: String,
}

impl ClickHouseSink {
    /// Create the sink and spawn the background writer.
    pub async fn new(config: &ClickHouseConfig, node_id: String) -> anyhow::Result<Self> {
        let (sender, receiver) = mpsc::channel::<DeliveryEvent>(CHANNEL_CAPACITY);

        let writer = BatchWriter::new(config).await?;
        let batch_size = config.batch_size.max(1);
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms);

        tokio::spawn(async move {
            writer.run(receiver, batch_size, flush_interval).await;
        });

        info!(database = %config.database, "Delivery analytics sink initialized with ClickHouse backend");

        Ok(Self::with_sender(sender, node_id))
    }

    fn with_sender(sender: mpsc::Sender<DeliveryEvent>, node_id: String) -> Self {
        Self { sender, node_id }
    }
}

impl EventSink for ClickHouseSink {
    fn emit(&self, mut event: DeliveryEvent) {
        event.node_id = self.node_id.clone();
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("analytics.dropped").increment(1);
            warn!("Delivery event dropped: {}", e);
        } else {
            metrics::counter!("analytics.queued").increment(1);
        }
    }
}

struct BatchWriter {
    client: clickhouse::Client,
}

impl BatchWriter {
    async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        Self::ensure_schema(&client).await?;

        Ok(Self { client })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS delivery_events (
                    event_id UUID,
                    event_type LowCardinality(String),
                    email String,
                    campaign_type LowCardinality(String),
                    step_index Nullable(UInt32),
                    segment Nullable(String),
                    template_id Nullable(String),
                    message_id Nullable(String),
                    error Nullable(String),
                    node_id String,
                    timestamp DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (timestamp, campaign_type, event_type)
                PARTITION BY toYYYYMM(timestamp)
                TTL toDateTime(timestamp) + INTERVAL 180 DAY",
            )
            .execute()
            .await?;

        info!("ClickHouse delivery_events schema verified");
        Ok(())
    }

    /// Runs until every sender is dropped, then flushes what is left.
    async fn run(
        self,
        mut receiver: mpsc::Receiver<DeliveryEvent>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) {
        let mut buffer: Vec<DeliveryEvent> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer).await;
                        }
                        debug!("Delivery event channel closed, writer stopping");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<DeliveryEvent>) {
        let count = buffer.len();
        debug!(count = count, "Flushing delivery events to ClickHouse");

        let Some(insert_sql) = insert_statement(buffer) else {
            buffer.clear();
            return;
        };

        match self.client.query(&insert_sql).execute().await {
            Ok(_) => {
                metrics::counter!("analytics.flushed").increment(count as u64);
                debug!(count = count, "Delivery events flushed");
            }
            Err(e) => {
                metrics::counter!("analytics.flush_errors").increment(1);
                error!(error = %e, count = count, "Failed to flush delivery events");
            }
        }

        buffer.clear();
    }
}

/// NDJSON insert for a batch, or `None` when nothing serialized.
fn insert_statement(events: &[DeliveryEvent]) -> Option<String> {
    let rows: Vec<String> = events
        .iter()
        .filter_map(|e| serde_json::to_string(e).ok())
        .collect();

    if rows.is_empty() {
        return None;
    }

    Some(format!(
        "INSERT INTO delivery_events SETTINGS date_time_input_format = 'best_effort' FORMAT JSONEachRow {}",
        rows.join("\n")
    ))
}
