use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};

use schema_registry_stream::async_impl::avro::KafkaAvroCodec;
use schema_registry_stream::async_impl::consumer::{
    ConsumerConfig, ConsumerMessage, MessageStream, RawMessage, RegistryConsumer,
};
use schema_registry_stream::async_impl::mock_registry::InMemoryRegistry;
use schema_registry_stream::async_impl::registry_client::SchemaRegistryClient;
use schema_registry_stream::avro_common::{AvroEvent, CacheCodec, FieldMap};
use schema_registry_stream::cache::CacheSchemaRegistry;
use schema_registry_stream::envelope::EnvelopeFormat;
use schema_registry_stream::error::SRCError;
use test_utils::{timings_schema, word_schema, Timings, Word};

struct WordWasRead(String);

impl AvroEvent for WordWasRead {
    fn schema(&self) -> &str {
        word_schema()
    }

    fn subject(&self) -> &str {
        "ddd:words:read"
    }

    fn to_field_map(&self) -> FieldMap {
        HashMap::from([(String::from("Word"), Value::String(self.0.clone()))])
    }

    fn id(&self) -> String {
        self.0.clone()
    }
}

struct TimingsMeasured {
    id: i64,
    host: Option<String>,
}

impl AvroEvent for TimingsMeasured {
    fn schema(&self) -> &str {
        timings_schema()
    }

    fn subject(&self) -> &str {
        "timings"
    }

    fn to_field_map(&self) -> FieldMap {
        let host = match &self.host {
            Some(h) => Value::Union(1, Box::new(Value::String(h.clone()))),
            None => Value::Union(0, Box::new(Value::Null)),
        };
        HashMap::from([
            (String::from("id"), Value::Long(self.id)),
            (
                String::from("timings"),
                Value::Array(vec![Value::Long(12), Value::Long(30)]),
            ),
            (
                String::from("tags"),
                Value::Array(vec![Value::String(String::from("eu"))]),
            ),
            (String::from("host"), host),
        ])
    }

    fn id(&self) -> String {
        self.id.to_string()
    }
}

/// Stands in for a topic with a single partition.
struct Topic {
    rx: mpsc::UnboundedReceiver<Result<RawMessage, SRCError>>,
    committed: Arc<Mutex<Vec<i64>>>,
}

impl MessageStream for Topic {
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<RawMessage, SRCError>>> {
        self.rx.recv().boxed()
    }

    fn commit<'a>(&'a mut self, message: &'a RawMessage) -> BoxFuture<'a, Result<(), SRCError>> {
        async move {
            self.committed.lock().unwrap().push(message.offset + 1);
            Ok(())
        }
        .boxed()
    }
}

fn record(offset: i64, key: String, payload: Vec<u8>) -> RawMessage {
    RawMessage {
        topic: String::from("events"),
        partition: 0,
        offset,
        key: Some(key.into_bytes()),
        payload: Some(payload),
        timestamp: None,
        headers: vec![],
    }
}

#[tokio::test]
async fn produce_and_consume_with_shared_caches() {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = SchemaRegistryClient::new(registry.clone(), Arc::new(CacheSchemaRegistry::new()));
    let codec = KafkaAvroCodec::new(client, Arc::new(CacheCodec::new()));

    let (tx, rx) = mpsc::unbounded_channel();
    let words = ["Palabro", "Woord", "Mot"];
    for (offset, word) in words.iter().enumerate() {
        let event = WordWasRead(String::from(*word));
        let bytes = codec.encode(&event).await.unwrap();
        tx.send(Ok(record(offset as i64, event.id(), bytes))).unwrap();
    }

    let committed = Arc::new(Mutex::new(vec![]));
    let topic = Topic {
        rx,
        committed: committed.clone(),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let received = Arc::new(Mutex::new(vec![]));
    let received_in_handler = received.clone();
    let mut consumer = RegistryConsumer::new(topic, codec.clone(), ConsumerConfig::default())
        .with_event_handler(move |m: &ConsumerMessage| {
            let mut received = received_in_handler.lock().unwrap();
            received.push(m.deserialize::<Word>().unwrap());
            if received.len() == 3 {
                shutdown_tx.send(true).unwrap();
            }
            true
        });

    consumer.read_messages(shutdown_rx).await.unwrap();

    let received: Vec<String> = received.lock().unwrap().iter().map(|w| w.word.clone()).collect();
    assert_eq!(received, vec!["Palabro", "Woord", "Mot"]);
    assert_eq!(*committed.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(registry.register_calls(), 1);
    assert_eq!(registry.fetch_calls(), 0);
    assert_eq!(registry.versions("ddd:words:read").len(), 1);
}

#[tokio::test]
async fn consumer_with_own_cache_fetches_once() {
    let registry = Arc::new(InMemoryRegistry::new());
    let producer_codec = KafkaAvroCodec::new(
        SchemaRegistryClient::with_transport(registry.clone()),
        Arc::new(CacheCodec::new()),
    )
    .with_format(EnvelopeFormat::Plain);
    let consumer_codec = KafkaAvroCodec::new(
        SchemaRegistryClient::with_transport(registry.clone()),
        Arc::new(CacheCodec::new()),
    )
    .with_format(EnvelopeFormat::Plain);

    let (tx, rx) = mpsc::unbounded_channel();
    for id in 0..4 {
        let event = TimingsMeasured {
            id,
            host: if id % 2 == 0 {
                Some(String::from("web-1"))
            } else {
                None
            },
        };
        let bytes = producer_codec.encode(&event).await.unwrap();
        tx.send(Ok(record(id, event.id(), bytes))).unwrap();
    }
    drop(tx);

    let topic = Topic {
        rx,
        committed: Arc::new(Mutex::new(vec![])),
    };
    let received = Arc::new(Mutex::new(vec![]));
    let received_in_handler = received.clone();
    let mut consumer = RegistryConsumer::new(topic, consumer_codec, ConsumerConfig::default())
        .with_event_handler(move |m: &ConsumerMessage| {
            assert_eq!(m.subject, "ly.stealth.kafka.metrics.Timings");
            assert_eq!(m.field::<Vec<String>>("tags"), Ok(vec![String::from("eu")]));
            let host = m.field::<Option<String>>("host").unwrap();
            let timings = m.deserialize::<Timings>().unwrap();
            received_in_handler.lock().unwrap().push((host, timings));
            true
        });

    assert!(consumer.read_messages(watch::channel(false).1).await.is_err());

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 4);
    assert_eq!(received[0].0, Some(String::from("web-1")));
    assert_eq!(received[1].0, None);
    assert_eq!(
        received[2].1,
        Timings {
            id: 2,
            timings: vec![12, 30],
            tags: vec![String::from("eu")],
            host: Some(String::from("web-1")),
        }
    );
    assert_eq!(registry.register_calls(), 1);
    assert_eq!(registry.fetch_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_encoders_register_once() {
    let registry = Arc::new(InMemoryRegistry::new().with_delay(Duration::from_millis(20)));
    let codec = KafkaAvroCodec::new(
        SchemaRegistryClient::with_transport(registry.clone()),
        Arc::new(CacheCodec::new()),
    );

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let codec = codec.clone();
            tokio::spawn(async move { codec.encode(&WordWasRead(format!("word{}", i))).await })
        })
        .collect();

    let mut ids = vec![];
    for handle in handles {
        let bytes = handle.await.unwrap().unwrap();
        ids.push(bytes[4]);
    }
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(registry.register_calls(), 1);
    assert_eq!(codec.registry().cache().subject_schema_count(), 1);
}
