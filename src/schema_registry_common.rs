//! Contains structs and functions to deal with the schema registry rest api, so stuff dealing with
//! the requests to and the responses from the schema registry.
use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone)]
pub(crate) enum SrAuthorization {
    None,
    Token(String),
    Basic(String, Option<String>),
}

impl fmt::Debug for SrAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SrAuthorization::None => write!(f, "None"),
            SrAuthorization::Token(_) => write!(f, "Token"),
            SrAuthorization::Basic(_, _) => write!(f, "Basic"),
        }
    }
}

/// Response of the schema registry, only the fields this crate uses. Registering returns just
/// the id, fetching by id just the schema.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawRegisteredSchema {
    pub id: Option<u32>,
    pub schema: Option<String>,
}

/// Error body the schema registry sends back with a non successful status.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RawError {
    pub error_code: u32,
    pub message: String,
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SrCall<'a> {
    GetById(u32),
    PostNew(&'a str, &'a str),
}

pub(crate) fn url_for_call(call: &SrCall, base_url: &str) -> String {
    match call {
        SrCall::GetById(id) => format!("{}/schemas/ids/{}?deleted=true", base_url, id),
        SrCall::PostNew(subject, _) => {
            // Use escape sequences instead of slashes in the subject
            format!(
                "{}/subjects/{}/versions",
                base_url,
                subject.replace('/', "%2F")
            )
        }
    }
}

/// Body used to register an avro schema.
pub(crate) fn get_body(schema: &str) -> String {
    let mut root_element = Map::new();
    root_element.insert(String::from("schema"), Value::String(String::from(schema)));
    root_element.insert(
        String::from("schemaType"),
        Value::String(String::from("AVRO")),
    );
    Value::Object(root_element).to_string()
}
