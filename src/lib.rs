//! Produce and consume Avro messages whose schema is kept in a [confluent schema-registry].
//!
//! Messages carry the id of their schema instead of the schema itself. The bytes start with a
//! magic byte, the big endian id, and by default the subject the schema was registered under,
//! followed by the Avro binary encoding of the event.
//!
//! Ids and schemas are cached in a [`CacheSchemaRegistry`](cache::CacheSchemaRegistry), compiled
//! schemas in a [`CacheCodec`](avro_common::CacheCodec). Both are created once and shared by every
//! codec, producer and consumer configured with them. Concurrent first calls for the same id or
//! schema share one call to the schema registry. Failed calls are never cached.
//!
//! A [`RegistryConsumer`](async_impl::consumer::RegistryConsumer) decodes messages from a stream
//! and hands them to an event handler, retrying with an exponential backoff as long as the handler
//! doesn't want to commit the message.
//!
//! Resulting errors are [`SRCError`](error::SRCError), besides the error they also contain a
//! retriable flag, in some cases, like when the network fails it might be worth to retry the same
//! function. The codec itself doesn't do retries.
//!
//! The `kafka` feature adds an rdkafka backed stream and producer.
//!
//! [confluent schema-registry]: https://docs.confluent.io/current/schema-registry/docs/index.html
pub mod async_impl;
pub mod avro_common;
pub mod cache;
pub mod envelope;
pub mod error;
pub mod schema_registry_common;
