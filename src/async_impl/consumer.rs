//! Consuming framed Avro messages from a stream, handing the decoded events to a handler.
//!
//! A [`RegistryConsumer`] pulls raw messages from a [`MessageStream`], decodes them with a
//! [`KafkaAvroCodec`] and calls the event handler until it returns `true`. In between calls it
//! waits with an exponential backoff. After each message the offset is committed, also for
//! messages that could not be decoded, or that were discarded after too many retries.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use apache_avro::from_value;
use apache_avro::types::Value;
use futures::future::BoxFuture;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::async_impl::avro::KafkaAvroCodec;
use crate::avro_common::{FieldMap, FromAvroValue};
use crate::error::SRCError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: String,
    pub value: String,
}

/// A message as it comes from the stream, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// `None` for a tombstone.
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the unix epoch.
    pub timestamp: Option<i64>,
    pub headers: Vec<MessageHeader>,
}

/// A decoded message as handed to the event handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub key: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub subject: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: Option<i64>,
    pub headers: Vec<MessageHeader>,
    pub event: FieldMap,
}

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("field {0} is not in the event")]
    Missing(String),
    #[error("field {field} is not of type {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("event could not be deserialized: {0}")]
    Deserialize(String),
}

impl ConsumerMessage {
    fn new(raw: &RawMessage, subject: String, event: FieldMap) -> ConsumerMessage {
        ConsumerMessage {
            key: raw.key.clone(),
            topic: raw.topic.clone(),
            partition: raw.partition,
            offset: raw.offset,
            subject,
            timestamp: raw.timestamp,
            headers: raw.headers.clone(),
            event,
        }
    }

    /// Gets a single field of the event.
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use apache_avro::types::Value;
    /// use schema_registry_stream::async_impl::consumer::{ConsumerMessage, FieldError};
    ///
    /// let message = ConsumerMessage {
    ///     key: None,
    ///     topic: String::from("words"),
    ///     partition: 0,
    ///     offset: 4,
    ///     subject: String::from("words"),
    ///     timestamp: None,
    ///     headers: vec![],
    ///     event: HashMap::from([(String::from("Word"), Value::String(String::from("Palabro")))]),
    /// };
    /// assert_eq!(message.field::<String>("Word"), Ok(String::from("Palabro")));
    /// assert_eq!(message.field::<String>("Other"), Err(FieldError::Missing(String::from("Other"))));
    /// ```
    pub fn field<T: FromAvroValue>(&self, name: &str) -> Result<T, FieldError> {
        let value = self
            .event
            .get(name)
            .ok_or_else(|| FieldError::Missing(String::from(name)))?;
        T::from_avro_value(value).ok_or_else(|| FieldError::WrongType {
            field: String::from(name),
            expected: T::TYPE_NAME,
        })
    }

    /// Deserializes the whole event into a struct, matching fields by name.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, FieldError> {
        let record = Value::Record(
            self.event
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        from_value::<T>(&record).map_err(|e| FieldError::Deserialize(e.to_string()))
    }

    pub fn key_lossy(&self) -> String {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }
}

/// Everything that is passed to the error handler, and what can end [`RegistryConsumer::read_messages`].
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("received error from kafka: {0}")]
    Stream(SRCError),
    #[error("could not decode message: {0}")]
    Decode(SRCError),
    #[error("unexpected message format for subject: {subject}")]
    UnexpectedFormat { subject: String },
    /// The handler didn't succeed within the max number of retries, the message is committed
    /// anyway.
    #[error(
        "discarded message: key: {}, topic: {}, partition: {}, offset: {}",
        .0.key_lossy(),
        .0.topic,
        .0.partition,
        .0.offset
    )]
    Discarded(Box<ConsumerMessage>),
    #[error("could not commit message: {0}")]
    Commit(SRCError),
    #[error("too many errors in a row: {0}")]
    TooManyErrors(usize),
    #[error("message stream closed")]
    StreamClosed,
    #[error("invalid consumer config: {0}")]
    Config(#[from] envy::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

/// What to do with a message that can't be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Report it to the error handler and commit it.
    #[default]
    CommitAndContinue,
    /// Stop consuming, returning the error without committing.
    Stop,
}

/// Configuration of a consumer. All values have a default, so from the environment only the ones
/// that differ need to be set, like `SR_CONSUMER_BROKERS=localhost:9092` and
/// `SR_CONSUMER_TOPICS=words,heartbeats`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<String>,
    pub initial_offset: InitialOffset,
    pub processing_timeout_seconds: u64,
    /// Number of stream errors in a row that ends the consumer, 0 to disable.
    pub error_threshold: usize,
    /// 0 for infinite retries.
    pub max_retries: u32,
    /// Max seconds to sleep between retries.
    pub max_interval_seconds: u64,
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            brokers: vec![],
            group_id: String::new(),
            topics: vec![],
            initial_offset: InitialOffset::Oldest,
            processing_timeout_seconds: 10,
            error_threshold: 10,
            max_retries: 0,
            max_interval_seconds: 30,
            decode_failure_policy: DecodeFailurePolicy::CommitAndContinue,
        }
    }
}

impl ConsumerConfig {
    /// Reads the config from environment variables prefixed with `SR_CONSUMER_`.
    pub fn from_env() -> Result<ConsumerConfig, ConsumerError> {
        ConsumerConfig::from_vars(std::env::vars())
    }

    fn from_vars<I>(vars: I) -> Result<ConsumerConfig, ConsumerError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("SR_CONSUMER_").from_iter(vars)?)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }
}

/// Source of raw messages, and the place to commit them to.
pub trait MessageStream: Send {
    /// The next message or error, `None` when the stream has ended.
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<RawMessage, SRCError>>>;

    /// Marks the message as processed, so it's not read again after a restart.
    fn commit<'a>(&'a mut self, message: &'a RawMessage) -> BoxFuture<'a, Result<(), SRCError>>;
}

/// Gets the decoded message, returns whether it should be committed.
pub type EventHandler = Box<dyn FnMut(&ConsumerMessage) -> bool + Send>;
/// Gets everything that went wrong but didn't stop the consumer. A panic in the handler is
/// caught and logged.
pub type ErrorHandler = Box<dyn Fn(&ConsumerError) + Send + Sync>;

/// Delays between handler calls for the same message. Each delay is `2^retry` seconds plus up to
/// 10%, never more than the max interval. Once the max interval is reached it stays there.
pub(crate) struct Backoff {
    max_interval: Duration,
    retries: u32,
    capped: bool,
}

impl Backoff {
    pub(crate) fn new(max_interval_seconds: u64) -> Backoff {
        Backoff {
            max_interval: Duration::from_secs(max_interval_seconds),
            retries: 0,
            capped: false,
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        if self.capped {
            return self.max_interval;
        }
        let base = 2f64.powi(self.retries.min(i32::MAX as u32) as i32);
        let secs = base + base * rand::rng().random_range(0.0..0.1);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) if delay <= self.max_interval => delay,
            _ => {
                self.capped = true;
                self.max_interval
            }
        }
    }
}

enum Disposition {
    Commit,
    Skip,
    Cancelled,
}

/// Resolves once the value in the channel is `true`. When the sender is gone it never resolves.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await
    }
}

pub struct RegistryConsumer<S> {
    stream: S,
    codec: KafkaAvroCodec,
    config: ConsumerConfig,
    event_handler: EventHandler,
    error_handler: ErrorHandler,
}

impl<S: MessageStream> RegistryConsumer<S> {
    /// Creates a consumer that commits every message, and logs errors at warn level.
    pub fn new(stream: S, codec: KafkaAvroCodec, config: ConsumerConfig) -> RegistryConsumer<S> {
        RegistryConsumer {
            stream,
            codec,
            config,
            event_handler: Box::new(|_| true),
            error_handler: Box::new(|e| warn!(error = %e, "consumer error")),
        }
    }

    pub fn with_event_handler<F>(mut self, handler: F) -> RegistryConsumer<S>
    where
        F: FnMut(&ConsumerMessage) -> bool + Send + 'static,
    {
        self.event_handler = Box::new(handler);
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> RegistryConsumer<S>
    where
        F: Fn(&ConsumerError) + Send + Sync + 'static,
    {
        self.error_handler = Box::new(handler);
        self
    }

    /// Reads messages, decodes them and hands them to the event handler. Only returns when the
    /// shutdown value becomes `true`, when the stream ends, or with a fatal error.
    ///
    /// A message is committed when the handler returns `true`, when it was discarded after the
    /// max number of retries, or when it couldn't be decoded and the policy is to continue.
    /// Cancelling while waiting to retry a message doesn't commit it.
    pub async fn read_messages(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        info!(topics = ?self.config.topics, "consumer started");
        let mut errors_in_row = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => None,
                next = self.stream.next_message() => Some(next),
            };
            let raw = match next {
                None => break,
                Some(None) => return Err(ConsumerError::StreamClosed),
                Some(Some(Err(e))) => {
                    errors_in_row += 1;
                    let threshold = self.config.error_threshold;
                    if threshold > 0 && errors_in_row >= threshold {
                        error!(errors = errors_in_row, error = %e, "too many errors in a row");
                        return Err(ConsumerError::TooManyErrors(errors_in_row));
                    }
                    self.report(&ConsumerError::Stream(e));
                    continue;
                }
                Some(Some(Ok(raw))) => raw,
            };
            match self.process(&raw, &mut shutdown, &mut errors_in_row).await? {
                Disposition::Commit => self.commit(&raw).await,
                Disposition::Skip => {}
                Disposition::Cancelled => break,
            }
        }
        info!("consumer stopped");
        Ok(())
    }

    async fn process(
        &mut self,
        raw: &RawMessage,
        shutdown: &mut watch::Receiver<bool>,
        errors_in_row: &mut usize,
    ) -> Result<Disposition, ConsumerError> {
        let payload = match &raw.payload {
            Some(p) => p,
            None => {
                debug!(topic = %raw.topic, partition = raw.partition, offset = raw.offset, "skipping tombstone");
                return Ok(Disposition::Skip);
            }
        };
        let decoded = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return Ok(Disposition::Cancelled),
            decoded = self.codec.decode(payload) => decoded,
        };
        let decoded = match decoded {
            Ok(v) => v,
            Err(e) => return self.decode_failed(ConsumerError::Decode(e)),
        };
        *errors_in_row = 0;
        let subject = decoded.subject.clone();
        let event = match decoded.into_field_map() {
            Some(v) => v,
            None => return self.decode_failed(ConsumerError::UnexpectedFormat { subject }),
        };
        let message = ConsumerMessage::new(raw, subject, event);
        Ok(self.dispatch(message, shutdown).await)
    }

    fn decode_failed(&self, err: ConsumerError) -> Result<Disposition, ConsumerError> {
        match self.config.decode_failure_policy {
            DecodeFailurePolicy::CommitAndContinue => {
                self.report(&err);
                Ok(Disposition::Commit)
            }
            DecodeFailurePolicy::Stop => Err(err),
        }
    }

    async fn dispatch(
        &mut self,
        message: ConsumerMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disposition {
        let mut backoff = Backoff::new(self.config.max_interval_seconds);
        loop {
            if (self.event_handler)(&message) {
                return Disposition::Commit;
            }
            let max_retries = self.config.max_retries;
            if max_retries > 0 && backoff.retries() >= max_retries {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    retry = backoff.retries(),
                    "discarding message"
                );
                self.report(&ConsumerError::Discarded(Box::new(message)));
                return Disposition::Commit;
            }
            let delay = backoff.next_delay();
            debug!(
                offset = message.offset,
                retry = backoff.retries(),
                delay_ms = delay.as_millis() as u64,
                "handler asked to retry"
            );
            let stop = tokio::select! {
                biased;
                _ = cancelled(shutdown) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stop {
                return Disposition::Cancelled;
            }
        }
    }

    async fn commit(&mut self, raw: &RawMessage) {
        match self.stream.commit(raw).await {
            Ok(()) => debug!(
                topic = %raw.topic,
                partition = raw.partition,
                offset = raw.offset,
                "committed message"
            ),
            Err(e) => self.report(&ConsumerError::Commit(e)),
        }
    }

    fn report(&self, err: &ConsumerError) {
        if catch_unwind(AssertUnwindSafe(|| (self.error_handler)(err))).is_err() {
            error!(error = %err, "error handler panicked");
        }
    }
}
