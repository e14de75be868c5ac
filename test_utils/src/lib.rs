use serde::{Deserialize, Serialize};
use serde_json::json;

/// Body the schema registry answers with after registering a schema.
pub fn get_register_body(id: u32) -> String {
    json!({ "id": id }).to_string()
}

/// Body the schema registry answers with when getting a schema by id.
pub fn get_schema_body(schema: &str) -> String {
    json!({ "schema": schema }).to_string()
}

pub fn heartbeat_schema() -> &'static str {
    r#"{"type":"record","name":"Heartbeat","namespace":"nl.openweb.data","fields":[{"name":"beat","type":"long"}]}"#
}

pub fn word_schema() -> &'static str {
    r#"{"type":"record","name":"words","doc":"Just words","namespace":"com.avro.kafka.golang","fields":[{"type":"string","name":"Word"}]}"#
}

/// A record with a nullable field and an array, for typed field access.
pub fn timings_schema() -> &'static str {
    r#"{"type":"record","name":"Timings","namespace":"ly.stealth.kafka.metrics","fields":[{"name":"id","type":"long"},{"name":"timings","type":{"type":"array","items":"long"}},{"name":"tags","type":{"type":"array","items":"string"}},{"name":"host","type":["null","string"],"default":null}]}"#
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct Heartbeat {
    pub beat: i64,
}

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Word {
    #[serde(rename = "Word")]
    pub word: String,
}

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Timings {
    pub id: i64,
    pub timings: Vec<i64>,
    pub tags: Vec<String>,
    pub host: Option<String>,
}
