//! Kafka binding using rdkafka, a [`MessageStream`] to feed a
//! [`RegistryConsumer`](crate::async_impl::consumer::RegistryConsumer) and a producer publishing
//! [`AvroEvent`]s.
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Deserialize;
use tracing::{debug, info};

use crate::async_impl::avro::KafkaAvroCodec;
use crate::async_impl::consumer::{
    ConsumerConfig, ConsumerError, InitialOffset, MessageHeader, MessageStream, RawMessage,
};
use crate::avro_common::AvroEvent;
use crate::error::{ErrorKind, SRCError};

/// Messages from a subscribed consumer group. Offsets are only committed through
/// [`MessageStream::commit`], auto commit is disabled.
pub struct KafkaMessageStream {
    consumer: StreamConsumer,
}

impl KafkaMessageStream {
    pub fn new(config: &ConsumerConfig) -> Result<KafkaMessageStream, SRCError> {
        let consumer: StreamConsumer = consumer_client_config(config).create().map_err(|e| {
            SRCError::non_retryable_with_cause(
                ErrorKind::Transport,
                e,
                "could not create kafka consumer",
            )
        })?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            SRCError::non_retryable_with_cause(
                ErrorKind::Transport,
                e,
                "could not subscribe to topics",
            )
        })?;
        info!(
            brokers = %config.brokers.join(","),
            group_id = %config.group_id,
            topics = ?config.topics,
            "kafka consumer subscribed"
        );
        Ok(KafkaMessageStream { consumer })
    }

}

fn consumer_client_config(config: &ConsumerConfig) -> ClientConfig {
    let offset_reset = match config.initial_offset {
        InitialOffset::Oldest => "earliest",
        InitialOffset::Newest => "latest",
    };
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", offset_reset)
        .set(
            "session.timeout.ms",
            config.processing_timeout().as_millis().to_string(),
        );
    client_config
}

fn to_raw(m: &BorrowedMessage<'_>) -> RawMessage {
    let headers = match m.headers() {
        Some(headers) => headers
            .iter()
            .map(|h| MessageHeader {
                key: String::from(h.key),
                value: h
                    .value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default(),
            })
            .collect(),
        None => vec![],
    };
    RawMessage {
        topic: String::from(m.topic()),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(<[u8]>::to_vec),
        payload: m.payload().map(<[u8]>::to_vec),
        timestamp: m.timestamp().to_millis(),
        headers,
    }
}

/// The committed offset is the one of the next message to read.
fn offsets_to_commit(message: &RawMessage) -> Result<TopicPartitionList, SRCError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(
        &message.topic,
        message.partition,
        Offset::Offset(message.offset + 1),
    )
    .map_err(|e| SRCError::non_retryable_with_cause(ErrorKind::Commit, e, "invalid offset"))?;
    Ok(tpl)
}

impl MessageStream for KafkaMessageStream {
    /// The stream of a kafka consumer never ends.
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<RawMessage, SRCError>>> {
        async move {
            let result = match self.consumer.recv().await {
                Ok(m) => Ok(to_raw(&m)),
                Err(e) => Err(SRCError::retryable_with_cause(
                    ErrorKind::Transport,
                    e,
                    "could not receive message",
                )),
            };
            Some(result)
        }
        .boxed()
    }

    /// Hands the offset to librdkafka without waiting for the broker to acknowledge it. A failed
    /// commit is covered by the commit of a later message.
    fn commit<'a>(&'a mut self, message: &'a RawMessage) -> BoxFuture<'a, Result<(), SRCError>> {
        async move {
            let tpl = offsets_to_commit(message)?;
            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| {
                    SRCError::retryable_with_cause(ErrorKind::Commit, e, "could not commit offset")
                })
        }
        .boxed()
    }
}

/// Configuration of an [`EventRegistryProducer`], from the environment with the `SR_PRODUCER_`
/// prefix.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub client_id: String,
    pub max_retries: u32,
    /// `0`, `1` or `all`.
    pub required_acks: String,
    pub send_timeout_seconds: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            brokers: vec![String::from("localhost:9092")],
            topic: String::new(),
            client_id: String::from("rdkafka"),
            max_retries: 3,
            required_acks: String::from("all"),
            send_timeout_seconds: 10,
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Result<ProducerConfig, ConsumerError> {
        ProducerConfig::from_vars(std::env::vars())
    }

    fn from_vars<I>(vars: I) -> Result<ProducerConfig, ConsumerError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("SR_PRODUCER_").from_iter(vars)?)
    }
}

fn producer_client_config(config: &ProducerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id)
        .set("retries", config.max_retries.to_string())
        .set("acks", &config.required_acks);
    client_config
}

/// Encodes events with the registered schema of their subject, and sends them keyed by their id.
#[derive(Clone)]
pub struct EventRegistryProducer {
    producer: FutureProducer,
    codec: KafkaAvroCodec,
    topic: String,
    timeout: Duration,
}

impl EventRegistryProducer {
    pub fn new(
        config: &ProducerConfig,
        codec: KafkaAvroCodec,
    ) -> Result<EventRegistryProducer, SRCError> {
        let producer: FutureProducer = producer_client_config(config).create().map_err(|e| {
            SRCError::non_retryable_with_cause(
                ErrorKind::Transport,
                e,
                "could not create kafka producer",
            )
        })?;
        Ok(EventRegistryProducer {
            producer,
            codec,
            topic: config.topic.clone(),
            timeout: Duration::from_secs(config.send_timeout_seconds),
        })
    }

    pub async fn publish<E: AvroEvent + ?Sized>(&self, event: &E) -> Result<(), SRCError> {
        let payload = self.codec.encode(event).await?;
        let key = event.id();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| {
                SRCError::retryable_with_cause(
                    ErrorKind::Transport,
                    e,
                    "could not send message to kafka",
                )
            })?;
        debug!(topic = %self.topic, key = %key, "published event");
        Ok(())
    }
}
