//! Rendering a response spec into concrete wire pieces.
//!
//! Rendering is pure: it produces status, headers, body bytes and trailers
//! without touching the transport. Invalid specs (bad status code, bad
//! header names) are errors the dispatcher treats as "this mock does not
//! apply".

use axum::body::Bytes;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, TRAILER};
use axum::http::{HeaderMap, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::mock::{ResponseBody, ResponseSpec};

/// A custom status message carried in response extensions.
///
/// hyper's HTTP/1 server and HTTP/2 do not transmit custom reason phrases;
/// the message stays observable to in-process consumers.
#[derive(Debug, Clone)]
pub struct StatusMessage(pub String);

/// A fully rendered response, ready to be written.
#[derive(Debug)]
pub struct Rendered {
    pub status: StatusCode,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
    /// Time to wait before the response is written.
    pub delay: Duration,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid status code {0}")]
    Status(u16),
    #[error("invalid header `{0}`")]
    Header(String),
    #[error("unserializable body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Render a descriptor's response spec.
pub fn render(spec: &ResponseSpec) -> Result<Rendered, RenderError> {
    let status = match spec.status_code {
        Some(code) => StatusCode::from_u16(code).map_err(|_| RenderError::Status(code))?,
        None => StatusCode::OK,
    };

    let mut headers = HeaderMap::new();
    if let Some(spec_headers) = &spec.headers {
        extend_headers(&mut headers, spec_headers)?;
    }

    let trailers = match &spec.trailers {
        Some(spec_trailers) if !spec_trailers.is_empty() => {
            // Announce the trailer names up front.
            let names = spec_trailers.keys().cloned().collect::<Vec<_>>().join(", ");
            headers.insert(
                TRAILER,
                HeaderValue::from_str(&names).map_err(|_| RenderError::Header(names.clone()))?,
            );
            let mut map = HeaderMap::new();
            extend_headers(&mut map, spec_trailers)?;
            Some(map)
        }
        _ => None,
    };

    let body = match &spec.body {
        Some(ResponseBody::Text(text)) => Bytes::from(text.clone()),
        Some(ResponseBody::Bytes(bytes)) => Bytes::from(bytes.clone()),
        Some(ResponseBody::Json(value)) => Bytes::from(serde_json::to_string_pretty(value)?),
        None => Bytes::new(),
    };

    Ok(Rendered {
        status,
        status_message: spec.status_message.clone(),
        headers,
        body,
        trailers,
        delay: Duration::from_millis(spec.time_to_respond.unwrap_or(0)),
    })
}

/// Render literal JSON data: pretty-printed, served as `application/json`.
pub fn render_literal(value: &serde_json::Value) -> Result<Rendered, RenderError> {
    let body = serde_json::to_string_pretty(value)?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(Rendered {
        status: StatusCode::OK,
        status_message: None,
        headers,
        body: Bytes::from(body),
        trailers: None,
        delay: Duration::ZERO,
    })
}

/// The terminal fallback: 404 with body `Not Found`.
pub fn render_not_found() -> Rendered {
    Rendered {
        status: StatusCode::NOT_FOUND,
        status_message: None,
        headers: HeaderMap::new(),
        body: Bytes::from_static(b"Not Found"),
        trailers: None,
        delay: Duration::ZERO,
    }
}

fn extend_headers(
    headers: &mut HeaderMap,
    source: &BTreeMap<String, String>,
) -> Result<(), RenderError> {
    for (name, value) in source {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RenderError::Header(name.clone()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| RenderError::Header(name.clone()))?;
        headers.insert(header_name, header_value);
    }
    Ok(())
}
