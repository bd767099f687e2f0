//! Kafka producer backed by librdkafka.
//!
//! [`KafkaBroker`] wraps a `ThreadedProducer`: `send` enqueues into
//! librdkafka's local queue (polled by a background thread) and `flush`
//! waits for outstanding deliveries up to a timeout. When the local queue is
//! full, `send` waits asynchronously for room instead of failing immediately,
//! which is the relay's only source of backpressure. Failed deliveries are
//! counted by [`DeliveryContext`] and make `flush` fail.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use serde::Deserialize;

use super::Broker;
use crate::error::RelayError;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Acknowledgment level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    /// Fire and forget.
    None,
    /// Partition leader only.
    Leader,
    /// Every in-sync replica.
    #[default]
    All,
}

impl Acks {
    /// Returns the rdkafka configuration string.
    pub fn as_rdkafka_str(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_rdkafka_str())
    }
}

/// Compression codec for produced batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Returns the rdkafka configuration string.
    pub fn as_rdkafka_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: Vec<String>,
    pub acks: Acks,
    pub compression: Compression,
    pub linger_ms: u64,
    pub queue_full_timeout: Duration,
    /// Additional rdkafka client properties (pass-through).
    pub properties: HashMap<String, String>,
}

impl KafkaSettings {
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            acks: Acks::All,
            compression: Compression::None,
            linger_ms: 5,
            queue_full_timeout: Duration::from_secs(60),
            properties: HashMap::new(),
        }
    }

    /// Builds an rdkafka [`ClientConfig`] from these settings.
    ///
    /// Pass-through properties are applied last and can override anything.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers.join(","))
            .set("acks", self.acks.as_rdkafka_str())
            .set("compression.type", self.compression.as_rdkafka_str())
            .set("linger.ms", self.linger_ms.to_string());

        for (key, value) in &self.properties {
            config.set(key, value);
        }

        config
    }
}

/// Producer context that records deliveries librdkafka gave up on.
///
/// The count only grows: once a message is lost, every later flush fails so
/// no checkpoint can move past it. A restart replays from the last saved
/// position.
#[derive(Debug, Default)]
pub struct DeliveryContext {
    failed: AtomicU64,
}

impl DeliveryContext {
    fn record_failure(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Deliveries that failed since the producer was created.
    pub fn failed_deliveries(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RelayError> {
        match self.failed_deliveries() {
            0 => Ok(()),
            failed => Err(RelayError::BrokerFlush(format!(
                "{} message(s) could not be delivered, holding the checkpoint until restart",
                failed
            ))),
        }
    }
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        _delivery_opaque: Self::DeliveryOpaque,
    ) {
        if let Err((err, message)) = delivery_result {
            let failed = self.record_failure();
            tracing::error!(
                topic = message.topic(),
                partition = message.partition(),
                failed,
                "Kafka delivery failed: {}",
                err
            );
        }
    }
}

/// [`Broker`] implementation publishing to Kafka.
pub struct KafkaBroker {
    producer: ThreadedProducer<DeliveryContext>,
    queue_full_timeout: Duration,
}

impl KafkaBroker {
    /// Create the producer. librdkafka connects lazily, so this only fails
    /// on invalid configuration.
    pub fn connect(settings: &KafkaSettings) -> Result<Self, RelayError> {
        let producer: ThreadedProducer<DeliveryContext> = settings
            .to_client_config()
            .create_with_context(DeliveryContext::default())
            .map_err(|err| RelayError::BrokerConnect(err.to_string()))?;

        tracing::info!(
            brokers = %settings.bootstrap_servers.join(","),
            acks = %settings.acks,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            queue_full_timeout: settings.queue_full_timeout,
        })
    }

    pub fn failed_deliveries(&self) -> u64 {
        self.producer.context().failed_deliveries()
    }
}

impl Broker for KafkaBroker {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let deadline = Instant::now() + self.queue_full_timeout;

        loop {
            let record = BaseRecord::<(), [u8]>::to(topic).payload(payload.as_slice());
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {}
                Err((err, _)) => {
                    return Err(RelayError::Publish {
                        topic: topic.to_string(),
                        reason: err.to_string(),
                    })
                }
            }

            if Instant::now() >= deadline {
                return Err(RelayError::Publish {
                    topic: topic.to_string(),
                    reason: format!(
                        "local producer queue still full after {:?}",
                        self.queue_full_timeout
                    ),
                });
            }
            tracing::debug!(topic, "producer queue full, waiting for deliveries");
            // Yields to the supervisor, so signals are still handled under backpressure.
            tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), RelayError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|err| RelayError::BrokerFlush(err.to_string()))?;
        self.producer.context().check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_carries_settings() {
        let mut settings = KafkaSettings::new(vec!["k1:9092".into(), "k2:9092".into()]);
        settings.acks = Acks::Leader;
        settings.compression = Compression::Zstd;
        let config = settings.to_client_config();
        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("acks"), Some("1"));
        assert_eq!(config.get("compression.type"), Some("zstd"));
        assert_eq!(config.get("linger.ms"), Some("5"));
    }

    #[test]
    fn pass_through_properties_override_defaults() {
        let mut settings = KafkaSettings::new(vec!["k1:9092".into()]);
        settings
            .properties
            .insert("linger.ms".to_string(), "50".to_string());
        settings
            .properties
            .insert("client.id".to_string(), "binlog-relay".to_string());
        let config = settings.to_client_config();
        assert_eq!(config.get("linger.ms"), Some("50"));
        assert_eq!(config.get("client.id"), Some("binlog-relay"));
    }

    #[test]
    fn failed_deliveries_fail_every_later_check() {
        let context = DeliveryContext::default();
        assert!(context.check().is_ok());

        assert_eq!(context.record_failure(), 1);
        assert!(matches!(context.check(), Err(RelayError::BrokerFlush(_))));
        // Still failing: the lost message was never redelivered.
        assert!(context.check().is_err());
        assert_eq!(context.failed_deliveries(), 1);
    }

    #[test]
    fn acks_strings() {
        assert_eq!(Acks::None.as_rdkafka_str(), "0");
        assert_eq!(Acks::All.to_string(), "all");
    }
}
