use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, KafkaOptions, StreamResource};
use crate::errors::{KafkaError, SourceError};
use crate::source::{
    PartitionId, PartitionReceiver, Record, RuntimeInfo, StartPosition, StreamClient,
};

/// Event hubs accept any SASL PLAIN login whose user is this literal and whose
/// password is the connection string.
const CONNECTION_STRING_USER: &str = "$ConnectionString";

/// Once a batch has its first record, wait at most this long for each
/// further record that is not already buffered.
const BATCH_LINGER: Duration = Duration::from_millis(5);

/// Upper bound on the up-front allocation for one batch.
const BATCH_PREALLOC: usize = 256;

/// Client for a stream resource reachable over the Kafka protocol.
pub struct KafkaStreamClient {
    client_config: ClientConfig,
    topic: String,
    metadata: Arc<BaseConsumer>,
    metadata_timeout: Duration,
    receive_timeout: Duration,
}

pub struct KafkaPartitionReceiver {
    consumer: StreamConsumer,
    topic: String,
    partition: PartitionId,
    receive_timeout: Duration,
    /// Error seen after part of a batch was already collected.
    pending: Option<SourceError>,
    closed: bool,
}

/// Translates the resource and transport options into librdkafka settings.
pub fn build_client_config(
    resource: &StreamResource,
    options: &KafkaOptions,
    consumer_group: &str,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("group.id", consumer_group)
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("session.timeout.ms", "6000");

    match &options.bootstrap_servers {
        Some(servers) => {
            client_config.set("bootstrap.servers", servers).set(
                "security.protocol",
                options.security_protocol.as_deref().unwrap_or("PLAINTEXT"),
            );
            if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
                client_config.set("sasl.mechanisms", sasl_mechanisms);
            }
            if let Some(sasl_username) = &options.sasl_username {
                client_config.set("sasl.username", sasl_username);
            }
            if let Some(sasl_password) = &options.sasl_password {
                client_config.set("sasl.password", sasl_password);
            }
        }
        None => {
            client_config
                .set("bootstrap.servers", resource.kafka_endpoint())
                .set(
                    "security.protocol",
                    options.security_protocol.as_deref().unwrap_or("SASL_SSL"),
                )
                .set(
                    "sasl.mechanisms",
                    options.sasl_mechanisms.as_deref().unwrap_or("PLAIN"),
                )
                .set("sasl.username", CONNECTION_STRING_USER)
                .set("sasl.password", resource.connection_string());
        }
    }

    if let Some(timeout) = options.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

impl KafkaStreamClient {
    /// Creates the client. librdkafka connects lazily, so bad credentials
    /// surface on the first metadata request rather than here.
    pub fn connect(config: &ConsumerConfig) -> Result<Self, KafkaError> {
        let client_config = build_client_config(
            &config.resource,
            &config.kafka,
            &config.polling.consumer_group,
        );

        let metadata: BaseConsumer =
            client_config
                .create()
                .map_err(|e| KafkaError::ConsumerCreation {
                    reason: e.to_string(),
                })?;

        info!(
            topic = %config.resource.name,
            endpoint = %client_config.get("bootstrap.servers").unwrap_or_default(),
            "Created stream client"
        );

        Ok(Self {
            client_config,
            topic: config.resource.name.clone(),
            metadata: Arc::new(metadata),
            metadata_timeout: Duration::from_millis(config.kafka.metadata_timeout_ms),
            receive_timeout: config.polling.receive_timeout(),
        })
    }
}

impl StreamClient for KafkaStreamClient {
    type Receiver = KafkaPartitionReceiver;

    async fn runtime_info(&self) -> Result<RuntimeInfo, SourceError> {
        let consumer = Arc::clone(&self.metadata);
        let topic = self.topic.clone();
        let fetch_timeout = self.metadata_timeout;

        // fetch_metadata blocks the calling thread for up to the timeout.
        let mut partition_ids =
            tokio::task::spawn_blocking(move || fetch_partition_ids(&consumer, &topic, fetch_timeout))
                .await
                .map_err(|e| SourceError::connection(e.to_string()))??;
        partition_ids.sort();

        info!(
            topic = %self.topic,
            partitions = partition_ids.len(),
            "Fetched runtime information"
        );

        Ok(RuntimeInfo {
            resource: self.topic.clone(),
            partition_ids,
        })
    }

    fn create_receiver(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> Result<KafkaPartitionReceiver, SourceError> {
        let consumer: StreamConsumer = self.client_config.create().map_err(|e| {
            SourceError::connection(KafkaError::ConsumerCreation {
                reason: e.to_string(),
            })
        })?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition.0, to_offset(start))
            .and_then(|_| consumer.assign(&tpl))
            .map_err(|e| {
                let assignment = KafkaError::Assignment {
                    topic: self.topic.clone(),
                    partition,
                    reason: e.to_string(),
                };
                classify(assignment, &e)
            })?;

        debug!(topic = %self.topic, partition = %partition, ?start, "Assigned partition receiver");

        Ok(KafkaPartitionReceiver {
            consumer,
            topic: self.topic.clone(),
            partition,
            receive_timeout: self.receive_timeout,
            pending: None,
            closed: false,
        })
    }
}

impl PartitionReceiver for KafkaPartitionReceiver {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    async fn receive(&mut self, max_count: usize) -> Result<Vec<Record>, SourceError> {
        if let Some(error) = self.pending.take() {
            return Err(error);
        }

        let mut records = Vec::with_capacity(max_count.min(BATCH_PREALLOC));
        let deadline = Instant::now() + self.receive_timeout;
        let mut stream = self.consumer.stream();

        while records.len() < max_count {
            let wait = if records.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                BATCH_LINGER
            };

            match timeout(wait, stream.next()).await {
                Ok(Some(Ok(message))) => records.push(convert_message(self.partition, &message)),
                Ok(Some(Err(e))) => {
                    let error = classify(
                        KafkaError::Consumption {
                            reason: e.to_string(),
                        },
                        &e,
                    );
                    if records.is_empty() {
                        return Err(error);
                    }
                    // rdkafka reports an error once; keep it for the next receive.
                    warn!(partition = %self.partition, error = %e, "Receive error after partial batch");
                    self.pending = Some(error);
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if !records.is_empty() {
            debug!(
                topic = %self.topic,
                partition = %self.partition,
                count = records.len(),
                "Received batch"
            );
        }

        Ok(records)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.consumer.unassign().map_err(|e| {
            SourceError::connection(KafkaError::Assignment {
                topic: self.topic.clone(),
                partition: self.partition,
                reason: e.to_string(),
            })
        })
    }
}

fn fetch_partition_ids(
    consumer: &BaseConsumer,
    topic: &str,
    fetch_timeout: Duration,
) -> Result<Vec<PartitionId>, SourceError> {
    let metadata = consumer
        .fetch_metadata(Some(topic), fetch_timeout)
        .map_err(|e| classify(metadata_error(topic, &e), &e))?;

    let topic_metadata = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .ok_or_else(|| {
            SourceError::unrecoverable(metadata_error(topic, &format!("topic {topic} not found")))
        })?;

    if let Some(err) = topic_metadata.error() {
        let code = RDKafkaErrorCode::from(err);
        return Err(SourceError::unrecoverable(metadata_error(topic, &code)));
    }

    Ok(topic_metadata
        .partitions()
        .iter()
        .map(|p| PartitionId(p.id()))
        .collect())
}

fn to_offset(start: StartPosition) -> Offset {
    match start {
        StartPosition::StartOfStream => Offset::Beginning,
        StartPosition::EndOfStream => Offset::End,
        StartPosition::Offset(offset) => Offset::Offset(offset),
    }
}

fn convert_message(partition: PartitionId, message: &BorrowedMessage<'_>) -> Record {
    Record {
        partition,
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        enqueued_at: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

fn metadata_error(topic: &str, reason: &dyn std::fmt::Display) -> KafkaError {
    KafkaError::Metadata {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

/// Credential and topology errors will not heal by retrying; everything else
/// is treated as transient.
fn classify(error: KafkaError, cause: &RdKafkaError) -> SourceError {
    match cause.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition,
        ) => SourceError::unrecoverable(error),
        _ => SourceError::transient(error),
    }
}
