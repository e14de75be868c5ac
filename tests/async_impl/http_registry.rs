use std::sync::Arc;

use apache_avro::types::Value;
use mockito::Server;

use schema_registry_stream::async_impl::avro::KafkaAvroCodec;
use schema_registry_stream::async_impl::registry_client::SchemaRegistryClient;
use schema_registry_stream::async_impl::schema_registry::SrSettings;
use schema_registry_stream::avro_common::CacheCodec;
use schema_registry_stream::cache::CacheSchemaRegistry;
use schema_registry_stream::error::ErrorKind;
use test_utils::{get_register_body, get_schema_body, heartbeat_schema, Heartbeat};

fn codec(url: String, cache: Arc<CacheSchemaRegistry>) -> KafkaAvroCodec {
    let transport = Arc::new(SrSettings::new_builder(url).no_proxy().build().unwrap());
    KafkaAvroCodec::new(
        SchemaRegistryClient::new(transport, cache),
        Arc::new(CacheCodec::new()),
    )
}

#[tokio::test]
async fn registers_once_and_never_fetches_own_schema() {
    let mut server = Server::new_async().await;
    let post = server
        .mock("POST", "/subjects/heartbeat/versions")
        .with_status(200)
        .with_header("content-type", "application/vnd.schemaregistry.v1+json")
        .with_body(get_register_body(4))
        .expect(1)
        .create_async()
        .await;
    let get = server
        .mock("GET", "/schemas/ids/4?deleted=true")
        .expect(0)
        .create_async()
        .await;

    let cache = Arc::new(CacheSchemaRegistry::new());
    let producer = codec(server.url(), cache.clone());
    let consumer = codec(server.url(), cache);

    for beat in 0..3 {
        let bytes = producer
            .encode_struct("heartbeat", heartbeat_schema(), Heartbeat { beat })
            .await
            .unwrap();
        let result = consumer.decode(&bytes).await.unwrap();
        assert_eq!(result.schema_id, 4);
        assert_eq!(
            result.value,
            Value::Record(vec![(String::from("beat"), Value::Long(beat))])
        );
    }

    post.assert_async().await;
    get.assert_async().await;
}

#[tokio::test]
async fn fetches_unknown_id_once() {
    let mut server = Server::new_async().await;
    let get = server
        .mock("GET", "/schemas/ids/7?deleted=true")
        .with_status(200)
        .with_header("content-type", "application/vnd.schemaregistry.v1+json")
        .with_body(get_schema_body(heartbeat_schema()))
        .expect(1)
        .create_async()
        .await;

    let consumer = codec(server.url(), Arc::new(CacheSchemaRegistry::new()));
    let bytes = [0, 0, 0, 0, 7, 2, 104, 98, 6];

    for _ in 0..3 {
        let result = consumer.decode(&bytes).await.unwrap();
        assert_eq!(result.subject, "hb");
    }

    get.assert_async().await;
}

#[tokio::test]
async fn lookup_failure_is_not_cached() {
    let mut server = Server::new_async().await;
    let missing = server
        .mock("GET", "/schemas/ids/9?deleted=true")
        .with_status(404)
        .with_header("content-type", "application/vnd.schemaregistry.v1+json")
        .with_body(r#"{"error_code":40403,"message":"Schema not found"}"#)
        .expect(2)
        .create_async()
        .await;

    let consumer = codec(server.url(), Arc::new(CacheSchemaRegistry::new()));
    let bytes = [0, 0, 0, 0, 9, 0, 6];

    for _ in 0..2 {
        let err = consumer.decode(&bytes).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaLookup);
        assert!(!err.retriable);
    }

    missing.assert_async().await;
}
