//! Tracking-service client facade
//!
//! Owns the configuration, the shared transport, the process-wide
//! concurrency gate and the normalizer. Every listing goes through a
//! `PaginatedFetcher`; `get_patrol_observations` runs the patrol aggregator.

use crate::aggregator::{observations_query, AggregatedResult, PatrolAggregator};
use crate::config::{ClientConfig, DEFAULT_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::gate::ConcurrencyGate;
use crate::normalizer::{flatten_record, Normalizer};
use crate::pagination::{PaginatedFetcher, ResourceQuery};
use crate::patrol::{Patrol, PatrolFilter};
use crate::transport::{HttpTransport, QueryParams, RawRecord, Transport};
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Record with nested objects flattened into `parent__child` keys
pub type FlatRecord = BTreeMap<String, Value>;

pub const DEFAULT_SUBJECT_COLOR: &str = "#ff0000";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceQuery {
    pub manufacturer_id: Option<String>,
    pub provider_key: Option<String>,
    pub provider: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectQuery {
    pub include_inactive: Option<bool>,
    /// west, south, east, north
    pub bbox: Option<(f64, f64, f64, f64)>,
    pub subject_group_id: Option<String>,
    pub subject_group_name: Option<String>,
    pub name: Option<String>,
    pub updated_since: Option<DateTime<Utc>>,
    pub updated_until: Option<DateTime<Utc>>,
    pub tracks: Option<bool>,
    /// Subject ids, sent comma-delimited
    pub id: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Display colour derived from `additional.rgb`
    pub hex: String,
    pub fields: FlatRecord,
}

impl Subject {
    pub fn from_record(record: &RawRecord) -> Self {
        let rgb = record
            .get("additional")
            .and_then(|additional| additional.get("rgb"))
            .and_then(Value::as_str);

        Self {
            id: record.get("id").and_then(Value::as_str).map(str::to_string),
            name: record.get("name").and_then(Value::as_str).map(str::to_string),
            hex: rgb.and_then(rgb_to_hex).unwrap_or_else(|| DEFAULT_SUBJECT_COLOR.to_string()),
            fields: flatten_record(record),
        }
    }
}

/// `"200, 70, 146"` → `"#c84692"`
pub fn rgb_to_hex(rgb: &str) -> Option<String> {
    let channels = rgb
        .split(',')
        .map(|c| c.trim().parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    if channels.len() != 3 {
        return None;
    }
    Some(format!("#{}", hex::encode(channels)))
}

pub struct TrackingClient<T: Transport> {
    config: ClientConfig,
    transport: Arc<T>,
    gate: ConcurrencyGate,
    normalizer: Normalizer,
}

impl TrackingClient<HttpTransport> {
    /// Client over the HTTP transport
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport + 'static> TrackingClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let gate = ConcurrencyGate::new(config.concurrency_limit);
        let normalizer = Normalizer::new(config.target_timezone);
        Self {
            config,
            transport: Arc::new(transport),
            gate,
            normalizer,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    fn page_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.config.page_size)
            .or_else(|| NonZeroUsize::new(DEFAULT_PAGE_SIZE))
            .unwrap_or(NonZeroUsize::MIN)
    }

    async fn fetch_all(&self, query: ResourceQuery) -> Result<Vec<RawRecord>> {
        Ok(PaginatedFetcher::new(self.transport.clone(), query).collect_all().await?)
    }

    pub async fn get_sources(&self, query: &SourceQuery, extra: &QueryParams) -> Result<Vec<FlatRecord>> {
        let mut params = QueryParams::new();
        set(&mut params, "manufacturer_id", query.manufacturer_id.clone());
        set(&mut params, "provider_key", query.provider_key.clone());
        set(&mut params, "provider", query.provider.clone());
        set(&mut params, "id", query.id.clone());

        let resource = ResourceQuery::new("sources/")
            .with_params(merge_params(params, extra))
            .with_page_size(self.page_size());

        let records = self.fetch_all(resource).await?;
        Ok(records.iter().map(flatten_record).collect())
    }

    pub async fn get_subjects(&self, query: &SubjectQuery, extra: &QueryParams) -> Result<Vec<Subject>> {
        if query.subject_group_id.is_some() && query.subject_group_name.is_some() {
            return Err(Error::InvalidArgument(
                "subject_group_id and subject_group_name are mutually exclusive".to_string(),
            ));
        }

        let subject_group = match &query.subject_group_name {
            Some(name) => Some(self.resolve_subject_group(name).await?),
            None => query.subject_group_id.clone(),
        };

        let mut params = QueryParams::new();
        set(&mut params, "include_inactive", query.include_inactive.map(|b| b.to_string()));
        set(
            &mut params,
            "bbox",
            query.bbox.map(|(w, s, e, n)| format!("{},{},{},{}", w, s, e, n)),
        );
        set(&mut params, "subject_group", subject_group);
        set(&mut params, "name", query.name.clone());
        set(&mut params, "updated_since", query.updated_since.map(format_time));
        set(&mut params, "updated_until", query.updated_until.map(format_time));
        set(&mut params, "tracks", query.tracks.map(|b| b.to_string()));
        if !query.id.is_empty() {
            params.insert("id".to_string(), query.id.join(","));
        }

        let resource = ResourceQuery::new("subjects/")
            .with_params(merge_params(params, extra))
            .with_page_size(self.page_size());

        let records = self.fetch_all(resource).await?;
        Ok(records.iter().map(Subject::from_record).collect())
    }

    async fn resolve_subject_group(&self, name: &str) -> Result<String> {
        let resource = ResourceQuery::new("subjectgroups/")
            .with_param("group_name", name)
            .with_param("include_inactive", "true")
            .with_param("include_hidden", "true")
            .with_param("flat", "true");

        let mut fetcher = PaginatedFetcher::new(self.transport.clone(), resource);
        let first = match fetcher.next_record().await {
            Some(record) => record?,
            None => return Err(Error::SubjectGroupNotFound(name.to_string())),
        };

        first
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::SubjectGroupNotFound(name.to_string()))
    }

    pub async fn get_subjectsources(
        &self,
        subjects: Option<&str>,
        sources: Option<&str>,
        extra: &QueryParams,
    ) -> Result<Vec<FlatRecord>> {
        let mut params = QueryParams::new();
        set(&mut params, "subjects", subjects.map(str::to_string));
        set(&mut params, "sources", sources.map(str::to_string));

        let resource = ResourceQuery::new("subjectsources/").with_params(merge_params(params, extra));
        let records = self.fetch_all(resource).await?;
        Ok(records.iter().map(flatten_record).collect())
    }

    pub async fn get_patrols(&self, filter: &PatrolFilter) -> Result<Vec<Patrol>> {
        let (patrols, _) = self.aggregator().fetch_patrols(filter).await?;
        Ok(patrols)
    }

    /// Lazy record sequence for one subject; `end = None` leaves the range open
    pub fn get_subject_observations(
        &self,
        subject_id: &str,
        start: &str,
        end: Option<&str>,
    ) -> PaginatedFetcher<Arc<T>> {
        PaginatedFetcher::new(
            self.transport.clone(),
            observations_query(subject_id, start, end, self.page_size()),
        )
    }

    /// Observations of every leader of every eligible segment of the patrols
    /// matching `filter`, with the client's configured zone and bound
    pub async fn get_patrol_observations(
        &self,
        filter: &PatrolFilter,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResult> {
        self.get_patrol_observations_with(filter, &ObservationOptions::default(), cancel)
            .await
    }

    /// Same as `get_patrol_observations`, with per-call overrides
    pub async fn get_patrol_observations_with(
        &self,
        filter: &PatrolFilter,
        options: &ObservationOptions,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResult> {
        self.aggregator_with(options)?.run(filter, cancel).await
    }

    pub fn aggregator(&self) -> PatrolAggregator<T> {
        PatrolAggregator::new(
            self.transport.clone(),
            self.gate.clone(),
            self.normalizer,
            self.page_size(),
            self.config.unit_timeout,
        )
    }

    /// Aggregator for one call. A concurrency override bounds this call's
    /// simultaneous units; the client-wide gate still caps the total.
    pub fn aggregator_with(&self, options: &ObservationOptions) -> Result<PatrolAggregator<T>> {
        let normalizer = options
            .target_timezone
            .map(Normalizer::new)
            .unwrap_or(self.normalizer);

        let aggregator = PatrolAggregator::new(
            self.transport.clone(),
            self.gate.clone(),
            normalizer,
            self.page_size(),
            self.config.unit_timeout,
        );

        match options.concurrency_limit {
            Some(0) => Err(Error::InvalidArgument(
                "concurrency_limit must be positive".to_string(),
            )),
            Some(limit) => Ok(aggregator.with_workers(limit)),
            None => Ok(aggregator),
        }
    }
}

/// Per-call overrides for `get_patrol_observations_with`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObservationOptions {
    pub target_timezone: Option<Tz>,
    pub concurrency_limit: Option<usize>,
}

impl ObservationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timezone(mut self, tz: Tz) -> Self {
        self.target_timezone = Some(tz);
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }
}

fn set(params: &mut QueryParams, name: &str, value: Option<String>) {
    if let Some(value) = value {
        params.insert(name.to_string(), value);
    }
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Standard parameters win over extras with the same name
fn merge_params(standard: QueryParams, extra: &QueryParams) -> QueryParams {
    for name in extra.names() {
        log::warn!("⚠️  {} is a non-standard parameter. Results may be unexpected.", name);
    }
    let mut merged = extra.clone();
    merged.merge(standard);
    merged
}
