pub mod avro;
pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock_registry;
pub mod registry_client;
pub mod schema_registry;
