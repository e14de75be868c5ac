use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use apache_avro::types::Value;
use tokio::sync::watch;

use schema_registry_stream::async_impl::avro::KafkaAvroCodec;
use schema_registry_stream::async_impl::consumer::{ConsumerConfig, RegistryConsumer};
use schema_registry_stream::async_impl::kafka::{
    EventRegistryProducer, KafkaMessageStream, ProducerConfig,
};
use schema_registry_stream::async_impl::registry_client::SchemaRegistryClient;
use schema_registry_stream::async_impl::schema_registry::SrSettings;
use schema_registry_stream::avro_common::{AvroEvent, CacheCodec, FieldMap};
use test_utils::word_schema;

fn get_schema_registry_url() -> String {
    String::from("http://localhost:8081")
}

fn get_brokers() -> String {
    String::from("127.0.0.1:9092")
}

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

#[tokio::test]
async fn publish_and_consume_word() {
    let topic = format!(
        "words-{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis()
    );
    let codec = KafkaAvroCodec::new(
        SchemaRegistryClient::with_transport(Arc::new(SrSettings::new(get_schema_registry_url()))),
        Arc::new(CacheCodec::new()),
    );
    let producer_config = ProducerConfig {
        brokers: vec![get_brokers()],
        topic: topic.clone(),
        ..ProducerConfig::default()
    };
    let producer = EventRegistryProducer::new(&producer_config, codec.clone()).unwrap();
    producer
        .publish(&WordWasRead(String::from("Palabro")))
        .await
        .unwrap();

    let consumer_config = ConsumerConfig {
        brokers: vec![get_brokers()],
        group_id: topic.clone(),
        topics: vec![topic],
        ..ConsumerConfig::default()
    };
    let stream = KafkaMessageStream::new(&consumer_config).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer = RegistryConsumer::new(stream, codec, consumer_config).with_event_handler(
        move |m| {
            assert_eq!(m.key_lossy(), "Palabro");
            assert_eq!(m.subject, "ddd:words:read");
            assert_eq!(m.field::<String>("Word"), Ok(String::from("Palabro")));
            shutdown_tx.send(true).unwrap();
            true
        },
    );

    consumer.read_messages(shutdown_rx).await.unwrap();
}
