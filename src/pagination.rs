//! Cursor-based paginated fetcher
//!
//! A `PaginatedFetcher` turns repeated `Transport::fetch_page` calls into one
//! lazy sequence of records. At most one page is buffered at a time.
//!
//! ```text
//! Start ──fetch──► Next(token) ──fetch──► ... ──► Exhausted
//!   │                                              ▲
//!   └──────── error / no token / empty page ───────┘
//! ```

use crate::transport::{QueryParams, RawRecord, Transport, TransportError};
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::num::NonZeroUsize;

/// One logical paginated collection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
    path: String,
    params: QueryParams,
    page_size: Option<NonZeroUsize>,
}

impl ResourceQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: QueryParams::new(),
            page_size: None,
        }
    }

    pub fn with_params(mut self, params: QueryParams) -> Self {
        self.params.merge(params);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_page_size(mut self, page_size: NonZeroUsize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn page_size(&self) -> Option<NonZeroUsize> {
        self.page_size
    }

    /// Parameters as sent to the transport, `page_size` included
    pub fn params(&self) -> QueryParams {
        let mut params = self.params.clone();
        if let Some(size) = self.page_size {
            params.insert("page_size".to_string(), size.to_string());
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Start,
    Next(String),
    Exhausted,
}

pub struct PaginatedFetcher<T: Transport> {
    transport: T,
    query: ResourceQuery,
    params: QueryParams,
    state: CursorState,
    buffer: VecDeque<RawRecord>,
    pages_fetched: usize,
}

impl<T: Transport> PaginatedFetcher<T> {
    pub fn new(transport: T, query: ResourceQuery) -> Self {
        let params = query.params();
        Self {
            transport,
            query,
            params,
            state: CursorState::Start,
            buffer: VecDeque::new(),
            pages_fetched: 0,
        }
    }

    pub fn query(&self) -> &ResourceQuery {
        &self.query
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// True once the final page has been drained or an error was surfaced
    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted && self.buffer.is_empty()
    }

    /// Next record, fetching the next page when the buffered one is drained.
    ///
    /// Returns `None` at end of stream. An error is returned once and moves
    /// the cursor to its terminal state.
    pub async fn next_record(&mut self) -> Option<Result<RawRecord, TransportError>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }

            let continuation = match &self.state {
                CursorState::Exhausted => return None,
                CursorState::Start => None,
                CursorState::Next(token) => Some(token.clone()),
            };

            let result = self
                .transport
                .fetch_page(self.query.path(), &self.params, continuation.as_deref())
                .await;

            match result {
                Ok(page) => {
                    self.pages_fetched += 1;
                    log::debug!(
                        "📄 {} page {}: {} records",
                        self.query.path(),
                        self.pages_fetched,
                        page.records.len()
                    );

                    self.state = match page.next {
                        Some(next) if !page.records.is_empty() => CursorState::Next(next),
                        _ => CursorState::Exhausted,
                    };
                    self.buffer.extend(page.records);
                }
                Err(e) => {
                    self.state = CursorState::Exhausted;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Drain the whole sequence, stopping at the first error
    pub async fn collect_all(mut self) -> Result<Vec<RawRecord>, TransportError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await {
            records.push(record?);
        }
        Ok(records)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<RawRecord, TransportError>> {
        stream::unfold(self, |mut fetcher| async move {
            let item = fetcher.next_record().await?;
            Some((item, fetcher))
        })
    }
}
