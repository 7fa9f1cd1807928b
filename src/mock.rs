//! Mock value model.
//!
//! A mock may be a programmatic handler, a `{request?, response}` descriptor,
//! arbitrary JSON data rendered verbatim, or a sequence of any of these. The
//! shape of a loaded value is resolved once here, at load time, so request
//! dispatch only switches on the tag.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::matcher::{MockRequest, Predicate};

/// Outcome of invoking a handler mock.
#[derive(Debug, Clone)]
pub enum HandlerVerdict {
    /// The handler declined; try the next candidate.
    Next,
    /// The handler produced a response.
    Respond(ResponseSpec),
}

/// Arguments passed to a handler mock.
#[derive(Debug)]
pub struct HandlerArgs<'a> {
    /// The request target as received, including any query string.
    pub url: &'a str,
    /// The registry location the handler was resolved at.
    pub location: &'a str,
    /// The observed request.
    pub request: &'a MockRequest,
}

/// A programmatic mock, registered through the library API.
pub type MockHandler = Arc<dyn Fn(HandlerArgs<'_>) -> HandlerVerdict + Send + Sync>;

/// One loaded mock value.
#[derive(Clone)]
pub enum MockValue {
    /// Invocable mock; decides per request whether it responds.
    Handler(MockHandler),
    /// Structured `{request?, response}` mock.
    Descriptor(MockDescriptor),
    /// Arbitrary JSON data, served verbatim at its exact location.
    Literal(Value),
    /// Ordered alternatives, tried first to last.
    Sequence(Vec<MockValue>),
}

impl fmt::Debug for MockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockValue::Handler(_) => f.write_str("Handler(..)"),
            MockValue::Descriptor(d) => f.debug_tuple("Descriptor").field(d).finish(),
            MockValue::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            MockValue::Sequence(s) => f.debug_tuple("Sequence").field(s).finish(),
        }
    }
}

impl MockValue {
    /// Interpret loaded JSON/YAML content as a mock value.
    ///
    /// Arrays become sequences, mappings whose keys are exactly `response`
    /// (plus optionally `request`) become descriptors, and everything else is
    /// literal data. A mapping that looks like a descriptor but fails to
    /// parse as one is demoted to literal data.
    pub fn interpret(value: Value) -> MockValue {
        match value {
            Value::Array(items) => {
                MockValue::Sequence(items.into_iter().map(MockValue::interpret).collect())
            }
            Value::Object(ref map) if is_descriptor_shape(map) => {
                match MockDescriptor::from_map(map) {
                    Ok(descriptor) => MockValue::Descriptor(descriptor),
                    Err(reason) => {
                        tracing::debug!(%reason, "descriptor-shaped value did not parse; treating as literal data");
                        MockValue::Literal(value)
                    }
                }
            }
            other => MockValue::Literal(other),
        }
    }

    /// Wrap raw file bytes into a GET descriptor, with the content type
    /// inferred from the file path.
    pub fn from_raw(route: &str, bytes: Vec<u8>) -> MockValue {
        let mut request = BTreeMap::new();
        request.insert(
            "method".to_string(),
            Predicate::Literal(Value::String("GET".to_string())),
        );

        let headers = mime_guess::from_path(Path::new(route))
            .first_raw()
            .map(|mime| {
                let mut headers = BTreeMap::new();
                headers.insert("content-type".to_string(), mime.to_string());
                headers
            });

        MockValue::Descriptor(MockDescriptor {
            request: Some(Predicate::All(request)),
            response: ResponseSpec {
                headers,
                body: Some(ResponseBody::Bytes(bytes)),
                ..ResponseSpec::default()
            },
        })
    }
}

fn is_descriptor_shape(map: &serde_json::Map<String, Value>) -> bool {
    map.contains_key("response") && map.keys().all(|k| k == "request" || k == "response")
}

/// A structured mock: an optional request predicate and a response to render.
#[derive(Debug, Clone)]
pub struct MockDescriptor {
    pub request: Option<Predicate>,
    pub response: ResponseSpec,
}

impl MockDescriptor {
    fn from_map(map: &serde_json::Map<String, Value>) -> Result<Self, String> {
        let request = match map.get("request") {
            Some(node) => Some(Predicate::compile(node).map_err(|e| e.to_string())?),
            None => None,
        };
        let response = map
            .get("response")
            .cloned()
            .ok_or_else(|| "missing response".to_string())?;
        let response: ResponseSpec =
            serde_json::from_value(response).map_err(|e| e.to_string())?;
        Ok(Self { request, response })
    }
}

/// The response half of a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailers: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,

    /// Delay in milliseconds before the response is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_respond: Option<u64>,
}

/// A response body: verbatim text or bytes, or JSON-serialized data.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

/// Key marking a JSON mapping as a base64-encoded binary body.
const BASE64_KEY: &str = "base64";

impl ResponseBody {
    fn from_value(value: Value) -> Result<Self, String> {
        if let Value::String(text) = value {
            return Ok(ResponseBody::Text(text));
        }
        if let Value::Object(ref map) = value {
            if map.len() == 1 {
                if let Some(Value::String(encoded)) = map.get(BASE64_KEY) {
                    use base64::Engine;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| format!("invalid base64 body: {e}"))?;
                    return Ok(ResponseBody::Bytes(bytes));
                }
            }
        }
        Ok(ResponseBody::Json(value))
    }
}

impl<'de> Deserialize<'de> for ResponseBody {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        ResponseBody::from_value(value).map_err(D::Error::custom)
    }
}

impl Serialize for ResponseBody {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        match self {
            ResponseBody::Text(text) => serializer.serialize_str(text),
            ResponseBody::Json(value) => value.serialize(serializer),
            ResponseBody::Bytes(bytes) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    BASE64_KEY.to_string(),
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
                );
                Value::Object(map).serialize(serializer)
            }
        }
    }
}
