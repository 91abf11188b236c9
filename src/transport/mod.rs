//! Transport boundary
//!
//! A `Transport` performs one authenticated request for one page of a
//! resource. Retrying transient failures is the transport's job; callers
//! only see the terminal outcome.
//!
//! ## Implementations
//!
//! - `http::HttpTransport` - reqwest client against the tracking service
//! - test suites provide scripted in-memory transports

pub mod backoff;
pub mod http;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub use http::HttpTransport;

/// Untyped record exactly as decoded from the service
pub type RawRecord = Map<String, Value>;

/// Ordered query parameters; a name may repeat (`patrol_type=a&patrol_type=b`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to a single value, replacing any previous values
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.pairs.push((name, value.into()));
    }

    /// Add one more value for `name`
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.pairs.retain(|(n, _)| n != name);
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&String> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.pairs.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Distinct names in first-seen order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.pairs {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Every name present in `other` takes all of `other`'s values
    pub fn merge(&mut self, other: QueryParams) {
        for name in other.names() {
            self.remove(name);
        }
        self.pairs.extend(other.pairs);
    }
}

/// One decoded page of a paginated collection
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Continuation token, `None` at end of stream
    pub next: Option<String>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, next: Option<String>) -> Self {
        Self { records, next }
    }

    pub fn last(records: Vec<RawRecord>) -> Self {
        Self { records, next: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("resource not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("server error (status {0})")]
    ServerError(u16),

    /// Any other 4xx status
    #[error("request rejected (status {0})")]
    ClientStatus(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Malformed or unauthorized request; never retried
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized
                | TransportError::NotFound
                | TransportError::ClientStatus(_)
                | TransportError::Decode(_)
        )
    }

    /// Rate limiting, overload or connection failure; retried by the transport
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::RateLimited | TransportError::ServerError(_) | TransportError::Network(_)
        )
    }

    /// Classify an HTTP status code. Returns `None` for success codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=399 => None,
            401 | 403 => Some(TransportError::Unauthorized),
            404 => Some(TransportError::NotFound),
            429 => Some(TransportError::RateLimited),
            400..=499 => Some(TransportError::ClientStatus(status)),
            _ => Some(TransportError::ServerError(status)),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch one page of `resource_path`.
    ///
    /// `continuation` is `None` for the first page and the previous page's
    /// `next` token afterwards.
    async fn fetch_page(
        &self,
        resource_path: &str,
        params: &QueryParams,
        continuation: Option<&str>,
    ) -> Result<Page, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &T {
    async fn fetch_page(
        &self,
        resource_path: &str,
        params: &QueryParams,
        continuation: Option<&str>,
    ) -> Result<Page, TransportError> {
        (**self).fetch_page(resource_path, params, continuation).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch_page(
        &self,
        resource_path: &str,
        params: &QueryParams,
        continuation: Option<&str>,
    ) -> Result<Page, TransportError> {
        (**self).fetch_page(resource_path, params, continuation).await
    }
}
