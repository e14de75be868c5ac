use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use apache_avro::schema::{Name, Schema};
use apache_avro::types::{Record, Value};
use apache_avro::{from_avro_datum, to_avro_datum, to_value};
use serde::ser::Serialize;
use tracing::debug;

use crate::cache::OnceMap;
use crate::error::{ErrorKind, SRCError};

/// Decoded record fields by name, also the form in which an [`AvroEvent`] hands over its data.
pub type FieldMap = HashMap<String, Value>;

/// Something that can be written to kafka with a registered schema.
///
/// The schema is registered under the subject, the id is used as key of the kafka record and is
/// not part of the encoded bytes.
pub trait AvroEvent {
    fn schema(&self) -> &str;
    fn subject(&self) -> &str;
    fn to_field_map(&self) -> FieldMap;
    fn id(&self) -> String;
}

/// Compiled schemas by their exact schema string. Parsing a schema happens at most once per
/// distinct string, also when many tasks ask for it at the same time. A schema that fails to
/// parse is not stored, asking again will parse again and fail again.
pub struct CacheCodec {
    codecs: OnceMap<String, Arc<Schema>>,
}

impl Default for CacheCodec {
    fn default() -> Self {
        CacheCodec::new()
    }
}

impl CacheCodec {
    pub fn new() -> CacheCodec {
        CacheCodec {
            codecs: OnceMap::new(),
        }
    }

    pub async fn get(&self, schema: &str) -> Result<Arc<Schema>, SRCError> {
        self.codecs
            .get_or_try_init(schema, || async { compile(schema) })
            .await
    }

    /// Number of compiled schemas.
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile(schema: &str) -> Result<Arc<Schema>, SRCError> {
    debug!(schema_len = schema.len(), "compiling avro schema");
    Schema::parse_str(schema).map(Arc::new).map_err(|e| {
        SRCError::non_retryable_with_cause(ErrorKind::Schema, e, "Could not parse schema")
    })
}

fn to_bytes(schema: &Schema, record: Value) -> Result<Vec<u8>, SRCError> {
    to_avro_datum(schema, record).map_err(|e| {
        SRCError::non_retryable_with_cause(ErrorKind::Encoding, e, "Could not get Avro bytes")
    })
}

/// Using the schema with a map of values the values will be correctly serialized according to
/// the avro specification. Fields not in the schema are ignored, fields missing from the map fail
/// unless the schema allows null.
pub(crate) fn fields_to_bytes(schema: &Schema, fields: &FieldMap) -> Result<Vec<u8>, SRCError> {
    let mut record = match Record::new(schema) {
        Some(v) => v,
        None => {
            return Err(SRCError::non_retryable_without_cause(
                ErrorKind::Encoding,
                "Could not create record from schema",
            ));
        }
    };
    for (name, value) in fields {
        record.put(name, value.clone())
    }
    to_bytes(schema, Value::from(record))
}

/// Using the schema with an item implementing serialize the item will be correctly serialized
/// according to the avro specification.
pub(crate) fn item_to_bytes(schema: &Schema, item: impl Serialize) -> Result<Vec<u8>, SRCError> {
    let value = to_value(item).map_err(|e| {
        SRCError::non_retryable_with_cause(
            ErrorKind::Encoding,
            e,
            "Could not transform to apache_avro value",
        )
    })?;
    match value.resolve(schema) {
        Ok(v) => to_bytes(schema, v),
        Err(e) => Err(SRCError::non_retryable_with_cause(
            ErrorKind::Encoding,
            e,
            "Failed to resolve",
        )),
    }
}

/// Decodes the bytes with the schema. Bytes that run out in the middle of a value can still decode
/// to a value with nulls in it, so the result is checked against the schema.
pub(crate) fn bytes_to_value(schema: &Schema, bytes: &[u8]) -> Result<Value, SRCError> {
    let mut reader = Cursor::new(bytes);
    let value = from_avro_datum(schema, &mut reader, None).map_err(|e| {
        SRCError::non_retryable_with_cause(
            ErrorKind::Decoding,
            e,
            "Could not transform bytes using schema",
        )
    })?;
    if !value.validate(schema) {
        return Err(SRCError::non_retryable_without_cause(
            ErrorKind::Decoding,
            "Decoded value does not match the schema",
        ));
    }
    Ok(value)
}

/// Turns a decoded record into a map of its fields, any other value gives `None`.
pub fn value_into_field_map(value: Value) -> Option<FieldMap> {
    match value {
        Value::Record(fields) => Some(fields.into_iter().collect()),
        _ => None,
    }
}

pub(crate) fn get_name(schema: &Schema) -> Option<Name> {
    match schema {
        Schema::Record(record) => Some(record.name.clone()),
        _ => None,
    }
}

/// Name of a record schema including the namespace, like `nl.openweb.data.Heartbeat`.
pub(crate) fn get_full_name(schema: &Schema) -> Option<String> {
    get_name(schema).map(|n| match n.namespace {
        None => n.name,
        Some(ns) => format!("{}.{}", ns, n.name),
    })
}

/// Typed access to a single decoded field.
pub trait FromAvroValue: Sized {
    /// Name used in errors when the value has a different type.
    const TYPE_NAME: &'static str;

    fn from_avro_value(value: &Value) -> Option<Self>;
}

fn unwrap_union(value: &Value) -> &Value {
    match value {
        Value::Union(_, inner) => inner,
        v => v,
    }
}

impl FromAvroValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::String(s) | Value::Enum(_, s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromAvroValue for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromAvroValue for i32 {
    const TYPE_NAME: &'static str = "int";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Int(i) | Value::Date(i) | Value::TimeMillis(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromAvroValue for i64 {
    const TYPE_NAME: &'static str = "long";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Long(l)
            | Value::TimeMicros(l)
            | Value::TimestampMillis(l)
            | Value::TimestampMicros(l) => Some(*l),
            Value::Int(i) => Some(i64::from(*i)),
            _ => None,
        }
    }
}

impl FromAvroValue for f32 {
    const TYPE_NAME: &'static str = "float";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl FromAvroValue for f64 {
    const TYPE_NAME: &'static str = "double";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Double(d) => Some(*d),
            Value::Float(f) => Some(f64::from(*f)),
            _ => None,
        }
    }
}

impl FromAvroValue for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Bytes(b) | Value::Fixed(_, b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromAvroValue for Vec<String> {
    const TYPE_NAME: &'static str = "array of strings";

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Array(items) => items.iter().map(String::from_avro_value).collect(),
            _ => None,
        }
    }
}

/// A nullable field, both a plain null and the null branch of a union give `Some(None)`.
impl<T: FromAvroValue> FromAvroValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_avro_value(value: &Value) -> Option<Self> {
        match unwrap_union(value) {
            Value::Null => Some(None),
            v => T::from_avro_value(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use apache_avro::types::Value;
    use apache_avro::Schema;

    use test_utils::{heartbeat_schema, timings_schema, word_schema, Heartbeat};

    use crate::avro_common::{
        bytes_to_value, fields_to_bytes, get_full_name, get_name, item_to_bytes, value_into_field_map,
        CacheCodec, FromAvroValue,
    };
    use crate::error::ErrorKind;

    #[test]
    fn fields_to_bytes_no_record() {
        let result = fields_to_bytes(&Schema::Boolean, &HashMap::new());
        assert_eq!(result.unwrap_err().error, "Could not create record from schema")
    }

    #[test]
    fn fields_to_bytes_wrong_type() {
        let schema = Schema::parse_str(word_schema()).unwrap();
        let fields = HashMap::from([(String::from("Word"), Value::Long(3))]);
        let err = fields_to_bytes(&schema, &fields).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Encoding);
        assert_eq!(err.error, "Could not get Avro bytes")
    }

    #[test]
    fn fields_to_bytes_missing_field() {
        let schema = Schema::parse_str(word_schema()).unwrap();
        let err = fields_to_bytes(&schema, &HashMap::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Encoding);
    }

    #[test]
    fn item_to_bytes_heartbeat() {
        let schema = Schema::parse_str(heartbeat_schema()).unwrap();
        let bytes = item_to_bytes(&schema, Heartbeat { beat: 3 }).unwrap();
        assert_eq!(bytes, vec![6])
    }

    #[test]
    fn item_to_bytes_no_transfer_wrong() {
        let schema = Schema::parse_str(word_schema()).unwrap();
        let err = item_to_bytes(&schema, Heartbeat { beat: 3 }).unwrap_err();
        assert_eq!(err.error, "Failed to resolve")
    }

    #[test]
    fn bytes_to_value_heartbeat() {
        let schema = Schema::parse_str(heartbeat_schema()).unwrap();
        let value = bytes_to_value(&schema, &[6]).unwrap();
        assert_eq!(
            value,
            Value::Record(vec![(String::from("beat"), Value::Long(3))])
        );
        let fields = value_into_field_map(value).unwrap();
        assert_eq!(fields.get("beat"), Some(&Value::Long(3)));
    }

    #[test]
    fn bytes_to_value_malformed() {
        let schema = Schema::parse_str(word_schema()).unwrap();
        let err = bytes_to_value(&schema, &[40, 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decoding);
        assert_eq!(err.error, "Decoded value does not match the schema");
    }

    #[test]
    fn bytes_to_value_with_union() {
        let schema = Schema::parse_str(timings_schema()).unwrap();
        let bytes = [2, 4, 24, 60, 0, 0, 0];
        let value = bytes_to_value(&schema, &bytes).unwrap();
        let fields = value_into_field_map(value).unwrap();
        assert_eq!(fields.get("id"), Some(&Value::Long(1)));
        assert_eq!(
            fields.get("host"),
            Some(&Value::Union(0, Box::new(Value::Null)))
        );
    }

    #[test]
    fn no_field_map_for_primitive() {
        assert_eq!(value_into_field_map(Value::Long(3)), None)
    }

    #[test]
    fn name_of_record() {
        let schema = Schema::parse_str(heartbeat_schema()).unwrap();
        assert_eq!(get_name(&schema).unwrap().name, "Heartbeat");
        assert_eq!(
            get_full_name(&schema),
            Some(String::from("nl.openweb.data.Heartbeat"))
        );
        assert_eq!(get_full_name(&Schema::String), None);
    }

    #[test]
    fn typed_values() {
        assert_eq!(
            String::from_avro_value(&Value::String(String::from("a"))),
            Some(String::from("a"))
        );
        assert_eq!(i64::from_avro_value(&Value::Int(3)), Some(3));
        assert_eq!(i32::from_avro_value(&Value::Long(3)), None);
        assert_eq!(f64::from_avro_value(&Value::Float(0.5)), Some(0.5));
        assert_eq!(
            Vec::<String>::from_avro_value(&Value::Array(vec![
                Value::String(String::from("a")),
                Value::String(String::from("b")),
            ])),
            Some(vec![String::from("a"), String::from("b")])
        );
        assert_eq!(
            Option::<String>::from_avro_value(&Value::Union(0, Box::new(Value::Null))),
            Some(None)
        );
        assert_eq!(
            Option::<bool>::from_avro_value(&Value::Union(1, Box::new(Value::Boolean(true)))),
            Some(Some(true))
        );
    }

    #[tokio::test]
    async fn codec_compiled_once() {
        let codecs = CacheCodec::new();
        let first = codecs.get(word_schema()).await.unwrap();
        let second = codecs.get(word_schema()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(codecs.len(), 1);
    }

    #[tokio::test]
    async fn codec_failure_not_cached() {
        let codecs = CacheCodec::new();
        let first = codecs.get(r#"{"type":"nope"}"#).await.unwrap_err();
        let second = codecs.get(r#"{"type":"nope"}"#).await.unwrap_err();
        assert_eq!(first.kind, ErrorKind::Schema);
        assert_eq!(first, second);
        assert!(codecs.is_empty());
    }
}
