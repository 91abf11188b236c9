//! Tracking-service HTTP transport
//!
//! Issues authenticated GET requests against `{server}/api/v1.0/{resource}`
//! and decodes the service's page envelope:
//!
//! ```text
//! {"data": {"results": [...], "next": "https://.../?page=2"}}   paginated
//! {"data": [...]}                                              unpaginated list
//! {"data": {...}}                                              single object
//! ```
//!
//! The `next` URL already embeds the query, so continuation requests are
//! sent verbatim. Transient failures are retried with exponential backoff
//! until the retry budget is spent.

use super::backoff::ExponentialBackoff;
use super::{Page, QueryParams, RawRecord, Transport, TransportError};
use crate::config::ClientConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    client: reqwest::Client,
    service_root: String,
    token: Option<String>,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            service_root: config.service_root(),
            token: config.token.clone(),
            max_retries: config.max_retries,
        })
    }

    fn resource_url(&self, resource_path: &str) -> String {
        format!(
            "{}/{}",
            self.service_root.trim_end_matches('/'),
            resource_path.trim_start_matches('/')
        )
    }

    async fn fetch_once(
        &self,
        url: &str,
        params: Option<&QueryParams>,
    ) -> Result<Page, TransportError> {
        let mut request = self.client.get(url);
        if let Some(params) = params {
            request = request.query(params);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;

        if let Some(err) = TransportError::from_status(response.status().as_u16()) {
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        decode_page(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_page(
        &self,
        resource_path: &str,
        params: &QueryParams,
        continuation: Option<&str>,
    ) -> Result<Page, TransportError> {
        let (url, params) = match continuation {
            Some(next) => (next.to_string(), None),
            None => (self.resource_url(resource_path), Some(params)),
        };

        let mut backoff = ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF, self.max_retries);
        let url = url.as_str();

        retry_transient(&mut backoff, resource_path, || self.fetch_once(url, params)).await
    }
}

/// Repeat `attempt` while it fails transiently and the backoff budget lasts.
///
/// Client errors return after one attempt. Once the budget is spent the last
/// transient error is returned as terminal.
pub async fn retry_transient<T, F, Fut>(
    backoff: &mut ExponentialBackoff,
    label: &str,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  {} failed: {}", label, e);
                if backoff.sleep().await.is_err() {
                    log::error!("❌ {} gave up after {} retries: {}", label, backoff.attempts(), e);
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        return TransportError::Decode(err.to_string());
    }
    if let Some(status) = err.status() {
        if let Some(classified) = TransportError::from_status(status.as_u16()) {
            return classified;
        }
    }
    TransportError::Network(err.to_string())
}

/// Decode the service envelope into a `Page`
pub fn decode_page(body: Value) -> Result<Page, TransportError> {
    let inner = match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    };

    match inner {
        Value::Object(mut map) if map.contains_key("results") => {
            let next = match map.remove("next") {
                Some(Value::String(next)) if !next.is_empty() => Some(next),
                _ => None,
            };
            let results = map.remove("results").unwrap_or(Value::Null);
            Ok(Page::new(into_records(results)?, next))
        }
        Value::Array(_) => Ok(Page::last(into_records(inner)?)),
        Value::Object(map) => Ok(Page::last(vec![map])),
        Value::Null => Ok(Page::default()),
        other => Err(TransportError::Decode(format!(
            "unexpected response body: {}",
            other
        ))),
    }
}

fn into_records(value: Value) -> Result<Vec<RawRecord>, TransportError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(TransportError::Decode(format!("record is not an object: {}", other))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(TransportError::Decode(format!("results is not a list: {}", other))),
    }
}
