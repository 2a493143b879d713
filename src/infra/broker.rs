use std::time::Duration;

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

use crate::infra::circuit_breaker::CircuitBreaker;

pub const TRACKING_EXCHANGE: &str = "tracking_data_exchange";
pub const ALARM_EXCHANGE: &str = "alarm_exchange";
pub const DLX_EXCHANGE: &str = "dlx_tracking_data";
pub const INVALID_DATA_QUEUE: &str = "invalid_data_queue";
pub const ALARM_ROUTING_KEY: &str = "alarm.notification";

const PUBLISH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
}

impl BrokerConfig {
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.virtual_host
        )
    }
}

/// One consumable queue's declaration arguments (§4.1 queue configuration).
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: &'static str,
    pub binding: &'static str,
    pub dlq_routing_key: &'static str,
    pub message_ttl_ms: i64,
    pub max_length: i64,
    pub max_priority: Option<u8>,
}

pub const TRACKDATA_QUEUE: QueueSpec = QueueSpec {
    name: "trackdata_queue",
    binding: "tracking.*.trackdata",
    dlq_routing_key: "dlq_tracking_data",
    message_ttl_ms: 86_400_000,
    max_length: 1_000_000,
    max_priority: None,
};

pub const ALARMS_QUEUE: QueueSpec = QueueSpec {
    name: "alarms_queue",
    binding: "tracking.*.alarm",
    dlq_routing_key: "dlq_alarms",
    message_ttl_ms: 86_400_000,
    max_length: 500_000,
    max_priority: Some(10),
};

pub const EVENTS_QUEUE: QueueSpec = QueueSpec {
    name: "events_queue",
    binding: "tracking.*.event",
    dlq_routing_key: "dlq_events",
    message_ttl_ms: 86_400_000,
    max_length: 500_000,
    max_priority: None,
};

/// Metric engine input: same routing as trackdata, separate consumer group.
pub const METRICS_QUEUE: QueueSpec = QueueSpec {
    name: "metrics_queue",
    binding: "tracking.*.trackdata",
    dlq_routing_key: "dlq_metrics",
    message_ttl_ms: 86_400_000,
    max_length: 1_000_000,
    max_priority: None,
};

struct State {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

/// Auto-reconnecting AMQP endpoint. Channel-level failures recreate only the
/// channel while the connection is still open; connection failures rebuild
/// both. Topology is redeclared after every reconnect.
pub struct Broker {
    config: BrokerConfig,
    state: Mutex<State>,
    pub breaker: CircuitBreaker,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State { connection: None, channel: None }),
            breaker: CircuitBreaker::with_defaults("rabbitmq"),
        }
    }

    /// Get a usable channel, (re)connecting as needed.
    pub async fn channel(&self) -> anyhow::Result<Channel> {
        let mut state = self.state.lock().await;
        if let Some(ch) = &state.channel {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
            state.channel = None;
        }
        // Cheaper recovery first: reuse the connection when it is still open.
        if let Some(conn) = &state.connection {
            if conn.status().connected() {
                let ch = conn.create_channel().await?;
                ch.confirm_select(ConfirmSelectOptions::default()).await?;
                state.channel = Some(ch.clone());
                tracing::info!("rabbitmq channel recreated on existing connection");
                return Ok(ch);
            }
            state.connection = None;
        }
        let conn = Connection::connect(&self.config.amqp_uri(), ConnectionProperties::default()).await?;
        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;
        state.connection = Some(conn);
        state.channel = Some(ch.clone());
        tracing::info!("connected to rabbitmq at {}:{}", self.config.host, self.config.port);
        Ok(ch)
    }

    /// Declare the ingestion topology: tracking exchange, the dead-letter
    /// exchange with its dlq queues, and the given consumable queues.
    pub async fn declare_tracking_topology(&self, queues: &[&QueueSpec]) -> anyhow::Result<Channel> {
        let ch = self.channel().await?;
        ch.exchange_declare(
            TRACKING_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
        ch.exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
        for spec in queues {
            let dlq_name = spec.dlq_routing_key;
            ch.queue_declare(
                dlq_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
            ch.queue_bind(
                dlq_name,
                DLX_EXCHANGE,
                spec.dlq_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

            let mut args = FieldTable::default();
            args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongLongInt(spec.message_ttl_ms));
            args.insert(ShortString::from("x-max-length"), AMQPValue::LongLongInt(spec.max_length));
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(DLX_EXCHANGE.into()),
            );
            args.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(spec.dlq_routing_key.into()),
            );
            // Disk-first storage so a backlog does not balloon broker memory.
            args.insert(ShortString::from("x-queue-mode"), AMQPValue::LongString("lazy".into()));
            if let Some(p) = spec.max_priority {
                args.insert(ShortString::from("x-max-priority"), AMQPValue::LongInt(p as i32));
            }
            ch.queue_declare(
                spec.name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                args,
            )
            .await?;
            ch.queue_bind(
                spec.name,
                TRACKING_EXCHANGE,
                spec.binding,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
            tracing::info!("declared queue {} bound to {}", spec.name, spec.binding);
        }
        Ok(ch)
    }

    pub async fn declare_alarm_exchange(&self) -> anyhow::Result<()> {
        let ch = self.channel().await?;
        ch.exchange_declare(
            ALARM_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn declare_invalid_data_queue(&self) -> anyhow::Result<()> {
        let ch = self.channel().await?;
        ch.queue_declare(
            INVALID_DATA_QUEUE,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    /// Publish with persistent delivery and wait for the broker confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> anyhow::Result<()> {
        let properties = properties.with_delivery_mode(2);
        self.breaker
            .call(|| async {
                let ch = self.channel().await?;
                let confirm = ch
                    .basic_publish(
                        exchange,
                        routing_key,
                        BasicPublishOptions::default(),
                        body,
                        properties.clone(),
                    )
                    .await?;
                tokio::time::timeout(PUBLISH_CONFIRM_TIMEOUT, confirm)
                    .await
                    .map_err(|_| anyhow::anyhow!("publish confirm timed out"))??;
                Ok(())
            })
            .await
            .map_err(anyhow::Error::from)
    }

    /// Publish a tracking record the way the parsers do:
    /// `tracking.<vendor>.<record_type>` on the tracking exchange.
    pub async fn publish_tracking_record(
        &self,
        vendor: &str,
        record_type: &str,
        message_id: &str,
        body: &[u8],
    ) -> anyhow::Result<()> {
        let routing_key = format!("tracking.{vendor}.{record_type}");
        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(message_id.to_string()));
        self.publish(TRACKING_EXCHANGE, &routing_key, body, props).await
    }

    /// Publish `{record, reason}` to the invalid-data queue via the default
    /// exchange. Fire-and-forget at call sites.
    pub async fn publish_invalid_data(
        &self,
        record: &serde_json::Value,
        reason: &str,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "record": record, "reason": reason }))?;
        self.publish("", INVALID_DATA_QUEUE, &body, BasicProperties::default()).await
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(ch) = state.channel.take() {
            let _ = ch.close(200, "shutdown").await;
        }
        if let Some(conn) = state.connection.take() {
            let _ = conn.close(200, "shutdown").await;
        }
    }
}
