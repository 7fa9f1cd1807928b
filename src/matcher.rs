//! Request predicate matching.
//!
//! A predicate is a nested value matched structurally against a view of the
//! observed request. The matcher for each node is chosen by the node's shape:
//! scalars compare with strict equality, `{"$regex": "..."}` nodes test the
//! stringified target, mappings descend key by key, and sequences match
//! element by element at the same index. Every key and element must match.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri, Version};

/// Programmatic predicate, registered through the library API.
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A compiled request predicate.
///
/// The shape dispatch happens once, at load time; request handling only walks
/// the compiled tree.
#[derive(Clone)]
pub enum Predicate {
    /// Strict equality against the target value. A missing target key is
    /// treated as `null`.
    Literal(Value),
    /// Regex test against the stringified target. Non-scalar or missing
    /// targets never match.
    Pattern(Regex),
    /// Programmatic predicate; its boolean result decides the match.
    Test(PredicateFn),
    /// Every key must match the same key of the target.
    All(BTreeMap<String, Predicate>),
    /// Element `i` must match target element `i`.
    Each(Vec<Predicate>),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Predicate::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Predicate::Test(_) => f.write_str("Test(..)"),
            Predicate::All(map) => f.debug_tuple("All").field(map).finish(),
            Predicate::Each(seq) => f.debug_tuple("Each").field(seq).finish(),
        }
    }
}

/// Key marking a JSON mapping as a regex pattern node.
const REGEX_KEY: &str = "$regex";

impl Predicate {
    /// Compile a JSON value into a predicate tree.
    ///
    /// Fails only when a `$regex` pattern does not compile.
    pub fn compile(value: &Value) -> Result<Self, regex::Error> {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(pattern)) = map.get(REGEX_KEY) {
                        return Ok(Predicate::Pattern(Regex::new(pattern)?));
                    }
                }
                let mut compiled = BTreeMap::new();
                for (key, node) in map {
                    compiled.insert(key.clone(), Predicate::compile(node)?);
                }
                Ok(Predicate::All(compiled))
            }
            Value::Array(items) => {
                let compiled = items
                    .iter()
                    .map(Predicate::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Predicate::Each(compiled))
            }
            other => Ok(Predicate::Literal(other.clone())),
        }
    }

    /// Match this predicate against a target value.
    pub fn matches(&self, target: &Value) -> bool {
        match self {
            Predicate::Literal(expected) => expected == target,
            Predicate::Pattern(re) => match stringify_scalar(target) {
                Some(text) => re.is_match(&text),
                None => false,
            },
            Predicate::Test(test) => test(target),
            Predicate::All(map) => map
                .iter()
                .all(|(key, node)| node.matches(target.get(key).unwrap_or(&Value::Null))),
            Predicate::Each(seq) => seq
                .iter()
                .enumerate()
                .all(|(i, node)| node.matches(target.get(i).unwrap_or(&Value::Null))),
        }
    }
}

fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// The observed properties of an inbound request, captured once per request
/// and shared by the matcher and by handler mocks.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// HTTP method, upper-case.
    pub method: String,
    /// The request target as received, including any query string.
    pub url: String,
    /// The resolved route path (no query string).
    pub path: String,
    /// Headers with lower-cased names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
    /// `"1.1"`, `"2"`, ...
    pub http_version: String,
}

impl MockRequest {
    pub fn from_parts(method: &Method, uri: &Uri, version: Version, headers: &HeaderMap) -> Self {
        let mut collected: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let text = String::from_utf8_lossy(value.as_bytes()).to_string();
            collected
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&text);
                })
                .or_insert(text);
        }

        let url = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| uri.path().to_string());

        Self {
            method: method.as_str().to_string(),
            url,
            path: uri.path().to_string(),
            headers: collected,
            http_version: version_label(version),
        }
    }

    /// Build one of the two comparison views of this request.
    ///
    /// The raw view exposes the request target as received; the routed view
    /// substitutes the resolved route path for `url`, so predicates can match
    /// on either.
    fn view(&self, routed: bool) -> Value {
        let headers: serde_json::Map<String, Value> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        serde_json::json!({
            "method": self.method,
            "url": if routed { &self.path } else { &self.url },
            "headers": headers,
            "httpVersion": self.http_version,
        })
    }
}

fn version_label(version: Version) -> String {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "",
    }
    .to_string()
}

/// Match a predicate against a request.
///
/// The match succeeds when either view of the request satisfies the
/// predicate: the raw view or the routed view.
pub fn request_matches(predicate: &Predicate, request: &MockRequest) -> bool {
    predicate.matches(&request.view(false)) || predicate.matches(&request.view(true))
}
