//! Encoding and decoding of Avro messages framed with the id of their schema.
//!
//! The schema id is resolved through a [`SchemaRegistryClient`], compiled schemas are shared
//! through a [`CacheCodec`]. Both can be shared between many codecs, producers and consumers,
//! clones of a [`KafkaAvroCodec`] share them too.
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use apache_avro::types::Value;
//! use schema_registry_stream::async_impl::avro::KafkaAvroCodec;
//! use schema_registry_stream::async_impl::mock_registry::InMemoryRegistry;
//! use schema_registry_stream::async_impl::registry_client::SchemaRegistryClient;
//! use schema_registry_stream::avro_common::{AvroEvent, CacheCodec, FieldMap};
//!
//! struct Heartbeat {
//!     beat: i64,
//! }
//!
//! impl AvroEvent for Heartbeat {
//!     fn schema(&self) -> &str {
//!         r#"{"type":"record","name":"Heartbeat","namespace":"nl.openweb.data","fields":[{"name":"beat","type":"long"}]}"#
//!     }
//!     fn subject(&self) -> &str {
//!         "heartbeat"
//!     }
//!     fn to_field_map(&self) -> FieldMap {
//!         HashMap::from([(String::from("beat"), Value::Long(self.beat))])
//!     }
//!     fn id(&self) -> String {
//!         self.beat.to_string()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = SchemaRegistryClient::with_transport(Arc::new(InMemoryRegistry::new()));
//! let codec = KafkaAvroCodec::new(registry, Arc::new(CacheCodec::new()));
//!
//! let bytes = codec.encode(&Heartbeat { beat: 3 }).await.unwrap();
//! assert_eq!(bytes, vec![0, 0, 0, 0, 1, 9, 104, 101, 97, 114, 116, 98, 101, 97, 116, 6]);
//!
//! let result = codec.decode(&bytes).await.unwrap();
//! assert_eq!(result.subject, "heartbeat");
//! assert_eq!(result.value, Value::Record(vec![(String::from("beat"), Value::Long(3))]));
//! # }
//! ```
use std::sync::Arc;

use apache_avro::types::Value;
use serde::ser::Serialize;
use tracing::debug;

use crate::async_impl::registry_client::SchemaRegistryClient;
use crate::avro_common::{
    bytes_to_value, fields_to_bytes, get_full_name, item_to_bytes, value_into_field_map, AvroEvent,
    CacheCodec, FieldMap,
};
use crate::envelope::{
    check_subject_len, parse_envelope, read_id, write_envelope, EnvelopeFormat,
};
use crate::error::{ErrorKind, SRCError};

/// The result of decoding framed bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeResult {
    pub schema_id: u32,
    /// The embedded subject, or for the plain format the full name of the record schema.
    pub subject: String,
    pub value: Value,
}

impl DecodeResult {
    /// The decoded fields, `None` when the value isn't a record.
    pub fn into_field_map(self) -> Option<FieldMap> {
        value_into_field_map(self.value)
    }
}

#[derive(Clone)]
pub struct KafkaAvroCodec {
    registry: SchemaRegistryClient,
    codecs: Arc<CacheCodec>,
    format: EnvelopeFormat,
}

impl KafkaAvroCodec {
    /// Creates a codec embedding the subject in the framing.
    pub fn new(registry: SchemaRegistryClient, codecs: Arc<CacheCodec>) -> KafkaAvroCodec {
        KafkaAvroCodec {
            registry,
            codecs,
            format: EnvelopeFormat::default(),
        }
    }

    pub fn with_format(mut self, format: EnvelopeFormat) -> KafkaAvroCodec {
        self.format = format;
        self
    }

    pub fn registry(&self) -> &SchemaRegistryClient {
        &self.registry
    }

    /// Registers the schema of the event under its subject, and frames the Avro bytes of its
    /// fields with the id.
    pub async fn encode<E: AvroEvent + ?Sized>(&self, event: &E) -> Result<Vec<u8>, SRCError> {
        let subject = event.subject();
        let schema = event.schema();
        let id = self.register(subject, schema).await?;
        let codec = self.codecs.get(schema).await?;
        let payload = fields_to_bytes(&codec, &event.to_field_map())?;
        self.frame(id, subject, &payload)
    }

    /// Like [`encode`](KafkaAvroCodec::encode), but takes the values from an item implementing
    /// serialize. The item must resolve to the schema.
    pub async fn encode_struct(
        &self,
        subject: &str,
        schema: &str,
        item: impl Serialize,
    ) -> Result<Vec<u8>, SRCError> {
        let id = self.register(subject, schema).await?;
        let codec = self.codecs.get(schema).await?;
        let payload = item_to_bytes(&codec, item)?;
        self.frame(id, subject, &payload)
    }

    /// Reads the id, gets the schema for it, and then reads the rest of the framing and decodes
    /// the remaining bytes with that schema.
    pub async fn decode(&self, bytes: &[u8]) -> Result<DecodeResult, SRCError> {
        let id = read_id(bytes, self.format)?;
        let schema = self.registry.fetch_by_id(id).await.map_err(|e| {
            SRCError::wrap(
                ErrorKind::SchemaLookup,
                e,
                &format!("could not get schema for id {}", id),
            )
        })?;
        let envelope = parse_envelope(bytes, self.format)?;
        let codec = self.codecs.get(&schema).await?;
        let value = bytes_to_value(&codec, envelope.payload)?;
        let subject = match envelope.subject {
            Some(s) => s.into_owned(),
            None => get_full_name(&codec).unwrap_or_default(),
        };
        Ok(DecodeResult {
            schema_id: envelope.id,
            subject,
            value,
        })
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<u32, SRCError> {
        let id = self
            .registry
            .register(subject, schema)
            .await
            .map_err(|e| {
                SRCError::wrap(
                    ErrorKind::Registration,
                    e,
                    &format!("could not register schema for subject {}", subject),
                )
            })?;
        if self.format == EnvelopeFormat::WithSubject {
            check_subject_len(subject)?;
        }
        Ok(id)
    }

    fn frame(&self, id: u32, subject: &str, payload: &[u8]) -> Result<Vec<u8>, SRCError> {
        debug!(subject = %subject, schema_id = id, "encoded message");
        match self.format {
            EnvelopeFormat::WithSubject => write_envelope(id, Some(subject), payload),
            EnvelopeFormat::Plain => write_envelope(id, None, payload),
        }
    }
}
