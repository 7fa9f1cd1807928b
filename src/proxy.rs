//! Pass-through proxying for unmatched requests.
//!
//! Configured prefixes compile to `^prefix` patterns over the request URL.
//! The first matching rule rewrites the URL with its template and the
//! request is forwarded upstream, response piped back verbatim.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use regex::Regex;
use tracing::debug;

use crate::error::Error;

/// One compiled proxy rule.
#[derive(Debug, Clone)]
pub struct ProxyRule {
    pattern: Regex,
    template: String,
}

impl ProxyRule {
    /// Rewrite a request URL into its upstream destination.
    fn destination(&self, url: &str) -> String {
        self.pattern.replace(url, self.template.as_str()).into_owned()
    }
}

/// Matches request URLs against upstream templates and forwards them.
pub struct ProxyDispatch {
    rules: Vec<ProxyRule>,
    client: Client<HttpConnector, Body>,
}

impl ProxyDispatch {
    /// Compile the configured prefix -> template mapping.
    ///
    /// Only keys starting with `/` participate; key order (sorted) decides
    /// precedence. Returns `None` when no rules are configured.
    pub fn from_config(proxy_apis: &BTreeMap<String, String>) -> Result<Option<Self>, Error> {
        let mut rules = Vec::new();
        for (prefix, template) in proxy_apis {
            if !prefix.starts_with('/') {
                continue;
            }
            let pattern =
                Regex::new(&format!("^{prefix}")).map_err(|source| Error::ProxyPattern {
                    pattern: prefix.clone(),
                    source,
                })?;
            rules.push(ProxyRule {
                pattern,
                template: template.clone(),
            });
        }

        if rules.is_empty() {
            return Ok(None);
        }

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Some(Self { rules, client }))
    }

    /// The first rule whose pattern matches the request URL.
    pub fn matches(&self, url: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(url))
    }

    /// Forward the request upstream and return the piped-back response.
    pub async fn forward(
        &self,
        rule: &ProxyRule,
        request: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        let url = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let destination = rule.destination(&url);
        let uri: Uri = destination
            .parse()
            .map_err(|err| Error::Proxy(format!("invalid upstream url {destination}: {err}")))?;

        debug!(%url, upstream = %uri, "forwarding to upstream");

        let (parts, body) = request.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);
        for (name, value) in parts.headers.iter() {
            // The client derives Host from the upstream authority.
            if name != HOST {
                builder = builder.header(name, value);
            }
        }
        let upstream_request = builder
            .body(body)
            .map_err(|err| Error::Proxy(err.to_string()))?;

        let response = self
            .client
            .request(upstream_request)
            .await
            .map_err(|err| Error::Proxy(err.to_string()))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}
