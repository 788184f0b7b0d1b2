//! rdkafka-backed record source, offset committer and dead-letter producer

use crate::config::IngestConfig;
use crate::consumer::record::{InboundRecord, OffsetCommitter};
use crate::consumer::registrar::TopicRegistration;
use crate::consumer::source::{RecordSource, RecordSourceFactory};
use crate::error::{IngestError, IngestResult};
use crate::pipeline::dead_letter::{DeadLetter, DeadLetterSink};
use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on a dead-letter delivery; the failed record's commit waits on it
const DEAD_LETTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates one subscribed `StreamConsumer` per registration
#[derive(Debug, Clone)]
pub struct KafkaSourceFactory {
    config: IngestConfig,
}

impl KafkaSourceFactory {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    fn client_config(&self, group_id: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("auto.offset.reset", &self.config.auto_offset_reset);

        // validated against ALLOWED_KAFKA_PROPS at startup
        for (key, value) in &self.config.kafka_properties {
            client_config.set(key, value);
        }
        client_config
    }
}

impl RecordSourceFactory for KafkaSourceFactory {
    fn create(&self, registration: &TopicRegistration) -> IngestResult<Arc<dyn RecordSource>> {
        let consumer: StreamConsumer = self.client_config(&registration.group_id).create()?;
        consumer.subscribe(&[registration.topic.as_str()])?;

        if let Some(url) = &self.config.schema_registry_url {
            debug!(topic = %registration.topic, schema_registry = %url, "Schema registry configured");
        }
        info!(
            topic = %registration.topic,
            group_id = %registration.group_id,
            "Subscribed Kafka consumer"
        );

        let consumer = Arc::new(consumer);
        Ok(Arc::new(KafkaRecordSource {
            topic: registration.topic.clone(),
            committer: Arc::new(KafkaCommitter {
                consumer: consumer.clone(),
            }),
            consumer,
        }))
    }
}

/// Commits single offsets synchronously on the blocking pool
#[derive(Clone)]
pub struct KafkaCommitter {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> IngestResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;

        let consumer = self.consumer.clone();
        let committed = tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| IngestError::Channel(format!("commit task failed: {}", e)))?;

        committed.map_err(|e| IngestError::Commit {
            topic: topic.to_string(),
            partition,
            offset,
            reason: e.to_string(),
        })
    }
}

/// A single topic's `StreamConsumer`
pub struct KafkaRecordSource {
    topic: String,
    consumer: Arc<StreamConsumer>,
    committer: Arc<KafkaCommitter>,
}

impl KafkaRecordSource {
    fn to_record(&self, message: &BorrowedMessage<'_>) -> InboundRecord {
        InboundRecord::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.key().map(<[u8]>::to_vec),
            message.payload().map(<[u8]>::to_vec),
            self.committer.clone(),
        )
    }

    fn set_paused(&self, paused: bool) -> IngestResult<()> {
        let assignment = self.consumer.assignment()?;
        if paused {
            self.consumer.pause(&assignment)?;
        } else {
            self.consumer.resume(&assignment)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_records: usize, timeout: Duration) -> IngestResult<Vec<InboundRecord>> {
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(message) => message?,
        };

        let mut records = Vec::with_capacity(max_records);
        records.push(self.to_record(&first));

        while records.len() < max_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(self.to_record(&message)),
                Some(Err(e)) => {
                    warn!(topic = %self.topic, "Error draining batch: {}", e);
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    async fn pause(&self) -> IngestResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> IngestResult<()> {
        self.set_paused(false)
    }

    /// Keep serving the group session while paused. A message that slips
    /// through (for example from a freshly assigned partition) is rewound so
    /// it is fetched again after resume.
    async fn idle(&self, timeout: Duration) -> IngestResult<()> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(()),
            Ok(message) => message?,
        };

        let (topic, partition, offset) = (
            message.topic().to_string(),
            message.partition(),
            message.offset(),
        );
        drop(message);

        self.consumer
            .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        self.set_paused(true)
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        debug!(topic = %self.topic, "Kafka consumer unsubscribed");
    }
}

/// Produces dead letters to a Kafka topic
#[derive(Clone)]
pub struct KafkaDeadLetterProducer {
    producer: Arc<FutureProducer>,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterProducer {
    pub fn new(config: &IngestConfig, topic: impl Into<String>) -> IngestResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set(
                "message.timeout.ms",
                DEAD_LETTER_TIMEOUT.as_millis().to_string(),
            )
            .create()?;

        let topic = topic.into();
        info!("Created dead-letter producer for topic: {}", topic);
        Ok(Self {
            producer: Arc::new(producer),
            topic,
            timeout: DEAD_LETTER_TIMEOUT,
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterProducer {
    async fn send(&self, letter: DeadLetter) -> IngestResult<()> {
        let header_values = letter.headers();
        let mut headers = OwnedHeaders::new();
        for (key, value) in &header_values {
            headers = headers.insert(Header {
                key: *key,
                value: Some(value.as_bytes()),
            });
        }

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&self.topic).headers(headers);
        if let Some(key) = letter.key.as_deref() {
            record = record.key(key);
        }
        if let Some(payload) = letter.payload.as_deref() {
            record = record.payload(payload);
        }

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    "Record sent to dead-letter topic: {}, partition: {}, offset: {}",
                    self.topic, partition, offset
                );
                Ok(())
            }
            Err((e, _)) => {
                error!("Failed to send record to dead-letter topic: {}", e);
                Err(IngestError::Broker(format!("dead-letter send failed: {}", e)))
            }
        }
    }
}
