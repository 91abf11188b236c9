//! Patrol aggregator - fan-out/fan-in of per-segment observation queries
//!
//! ## Flow
//!
//! ```text
//! activity/patrols (one PaginatedFetcher)
//!     ↓
//! eligible segments → SegmentQuery queue
//!     ↓
//! worker pool (N workers, each unit: gate → fetch → normalize → sort)
//!     ↓ mpsc<SegmentOutcome>
//! single-writer reducer → AggregatedResult
//! ```
//!
//! Per unit: `Pending → Gate-Waiting → Fetching → Normalizing → Done`, or
//! `Failed` from the fetch step. A failed unit contributes nothing and is
//! recorded in `Diagnostics::failures`; it never aborts its siblings.
//! Cancellation aborts every outstanding unit and discards partial results.

use crate::error::{Error, Result};
use crate::gate::ConcurrencyGate;
use crate::normalizer::{DroppedRecord, Normalizer, Observation};
use crate::pagination::{PaginatedFetcher, ResourceQuery};
use crate::patrol::{Patrol, PatrolFilter, SegmentQuery};
use crate::relocations::{AssembleError, RelocationAssembler, RelocationKeys};
use crate::transport::{Transport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const PATROLS_RESOURCE: &str = "activity/patrols";
pub const OBSERVATIONS_RESOURCE: &str = "observations/";

/// Observation query for one subject over a time range
pub fn observations_query(
    subject_id: &str,
    since: &str,
    until: Option<&str>,
    page_size: NonZeroUsize,
) -> ResourceQuery {
    let mut query = ResourceQuery::new(OBSERVATIONS_RESOURCE)
        .with_param("subject_id", subject_id)
        .with_param("since", since)
        .with_page_size(page_size);
    if let Some(until) = until {
        query = query.with_param("until", until);
    }
    query
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Transport(TransportError),
    /// The service returned no records for the segment
    Empty,
    /// Every record was dropped by the normalizer
    AllRecordsDropped { dropped: usize },
    Timeout(Duration),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(e) => write!(f, "{}", e),
            FailureReason::Empty => write!(f, "no observations returned"),
            FailureReason::AllRecordsDropped { dropped } => {
                write!(f, "all {} records failed normalization", dropped)
            }
            FailureReason::Timeout(limit) => write!(f, "exceeded {}s deadline", limit.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFailure {
    pub query: SegmentQuery,
    pub reason: FailureReason,
}

/// Sorted observations for one segment's subject
#[derive(Debug, Clone)]
pub struct SubjectTrack {
    pub query: SegmentQuery,
    pub observations: Vec<Observation>,
    pub dropped: Vec<DroppedRecord>,
}

#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    Success(SubjectTrack),
    Failure(SegmentFailure),
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub patrols: usize,
    /// Patrol records that could not be decoded
    pub malformed_patrols: usize,
    pub eligible_segments: usize,
    pub skipped_segments: usize,
    pub succeeded_units: usize,
    pub failures: Vec<SegmentFailure>,
    pub dropped_records: Vec<DroppedRecord>,
}

/// Merged observations, grouped by subject and ordered within each group
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    observations: Vec<Observation>,
    diagnostics: Diagnostics,
    keys: RelocationKeys,
}

impl AggregatedResult {
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn keys(&self) -> &RelocationKeys {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Distinct subject ids in merge order
    pub fn subjects(&self) -> Vec<&str> {
        let mut subjects: Vec<&str> = Vec::new();
        for obs in &self.observations {
            if !subjects.contains(&obs.subject_id.as_str()) {
                subjects.push(&obs.subject_id);
            }
        }
        subjects
    }

    pub fn into_parts(self) -> (Vec<Observation>, Diagnostics) {
        (self.observations, self.diagnostics)
    }

    /// Hand the observations to an assembler; the result is consumed
    pub fn into_relocations<A: RelocationAssembler>(
        self,
        assembler: &A,
    ) -> std::result::Result<A::Output, AssembleError> {
        assembler.assemble(&self.keys, self.observations)
    }
}

/// Shared, read-only context for every unit of one aggregation
struct UnitContext<T: Transport> {
    transport: Arc<T>,
    gate: ConcurrencyGate,
    normalizer: Normalizer,
    page_size: NonZeroUsize,
    unit_timeout: Duration,
}

pub struct PatrolAggregator<T: Transport> {
    ctx: Arc<UnitContext<T>>,
    workers: usize,
}

impl<T: Transport + 'static> PatrolAggregator<T> {
    pub fn new(
        transport: Arc<T>,
        gate: ConcurrencyGate,
        normalizer: Normalizer,
        page_size: NonZeroUsize,
        unit_timeout: Duration,
    ) -> Self {
        let workers = gate.limit();
        Self {
            ctx: Arc::new(UnitContext {
                transport,
                gate,
                normalizer,
                page_size,
                unit_timeout,
            }),
            workers,
        }
    }

    /// Number of concurrently scheduled units (defaults to the gate limit)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// List patrols matching `filter` and aggregate their segment observations.
    ///
    /// Fails only when the listing fails, matches nothing, or `cancel` fires.
    pub async fn run(&self, filter: &PatrolFilter, cancel: &CancellationToken) -> Result<AggregatedResult> {
        let started = Instant::now();
        log::info!("🚀 Aggregating patrol observations");

        let (patrols, malformed) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            listed = self.fetch_patrols(filter) => listed?,
        };

        if patrols.is_empty() {
            log::warn!("⚠️  No patrols matched the filter");
            return Err(Error::NoMatchingPatrols);
        }

        let mut result = self.aggregate(patrols, cancel).await?;
        result.diagnostics.malformed_patrols = malformed;

        log::info!(
            "✅ Aggregation complete: {} observations, {} subjects, {} failed units | {}ms",
            result.len(),
            result.subjects().len(),
            result.diagnostics.failures.len(),
            started.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Fetch the flat patrol listing. Undecodable patrols are counted and skipped.
    pub async fn fetch_patrols(&self, filter: &PatrolFilter) -> Result<(Vec<Patrol>, usize)> {
        let query = ResourceQuery::new(PATROLS_RESOURCE)
            .with_params(filter.to_params())
            .with_page_size(self.ctx.page_size);
        let mut fetcher = PaginatedFetcher::new(self.ctx.transport.clone(), query);

        let mut patrols = Vec::new();
        let mut malformed = 0;
        while let Some(record) = fetcher.next_record().await {
            let record = record.map_err(Error::PatrolListing)?;
            match Patrol::from_record(record) {
                Ok(patrol) => patrols.push(patrol),
                Err(e) => {
                    malformed += 1;
                    log::warn!("⚠️  Skipping undecodable patrol: {}", e);
                }
            }
        }

        log::info!("   ├─ Patrols: {} ({} undecodable)", patrols.len(), malformed);
        Ok((patrols, malformed))
    }

    /// Fan out over every eligible segment of `patrols` and merge the results
    pub async fn aggregate(&self, patrols: Vec<Patrol>, cancel: &CancellationToken) -> Result<AggregatedResult> {
        let mut diagnostics = Diagnostics {
            patrols: patrols.len(),
            ..Diagnostics::default()
        };

        let mut queue = VecDeque::new();
        for patrol in &patrols {
            let queries = patrol.segment_queries();
            diagnostics.skipped_segments += patrol.patrol_segments.len() - queries.len();
            queue.extend(queries);
        }
        diagnostics.eligible_segments = queue.len();

        log::info!(
            "   ├─ Segments: {} eligible, {} skipped",
            diagnostics.eligible_segments,
            diagnostics.skipped_segments
        );

        let workers = self.workers.min(queue.len());
        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel::<SegmentOutcome>(workers.max(1));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(self.ctx.clone(), queue.clone(), tx.clone(), cancel.clone()));
        }
        drop(tx);

        log::info!("   └─ Units: {} across {} workers", diagnostics.eligible_segments, workers);

        let mut groups = SubjectGroups::default();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    pool.abort_all();
                    log::warn!("⚠️  Aggregation cancelled, discarding partial results");
                    return Err(Error::Cancelled);
                }

                outcome = rx.recv() => match outcome {
                    Some(SegmentOutcome::Success(track)) => {
                        log::debug!(
                            "✅ {} → {} observations ({} dropped)",
                            track.query,
                            track.observations.len(),
                            track.dropped.len()
                        );
                        diagnostics.succeeded_units += 1;
                        diagnostics.dropped_records.extend(track.dropped);
                        groups.add(track.observations);
                    }
                    Some(SegmentOutcome::Failure(failure)) => {
                        log::warn!(
                            "⚠️  Getting observations for {} failed: {}",
                            failure.query,
                            failure.reason
                        );
                        diagnostics.failures.push(failure);
                    }
                    // Every worker has exited
                    None => break,
                },
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                log::error!("❌ Aggregation worker failed: {}", e);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(AggregatedResult {
            observations: groups.into_observations(),
            diagnostics,
            keys: RelocationKeys::default(),
        })
    }
}

/// Reducer state: one run per subject, in first-seen order.
///
/// A subject leading several segments gets their runs merged by
/// `recorded_at`; equal timestamps keep arrival order.
#[derive(Debug, Default)]
struct SubjectGroups {
    order: Vec<String>,
    runs: HashMap<String, Vec<Observation>>,
}

impl SubjectGroups {
    /// `observations` are one unit's output: a single subject, already sorted
    fn add(&mut self, observations: Vec<Observation>) {
        let Some(subject) = observations.first().map(|obs| obs.subject_id.clone()) else {
            return;
        };

        match self.runs.get_mut(&subject) {
            Some(run) => {
                run.extend(observations);
                // Stable sort over two sorted runs is a merge
                run.sort_by_key(|obs| obs.recorded_at);
            }
            None => {
                self.order.push(subject.clone());
                self.runs.insert(subject, observations);
            }
        }
    }

    fn into_observations(mut self) -> Vec<Observation> {
        self.order
            .iter()
            .filter_map(|subject| self.runs.remove(subject))
            .flatten()
            .collect()
    }
}

async fn worker<T: Transport>(
    ctx: Arc<UnitContext<T>>,
    queue: Arc<Mutex<VecDeque<SegmentQuery>>>,
    tx: mpsc::Sender<SegmentOutcome>,
    cancel: CancellationToken,
) {
    loop {
        let next = match queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => return,
        };
        let Some(query) = next else {
            return;
        };

        let Some(outcome) = run_unit(&ctx, query, &cancel).await else {
            return;
        };

        if tx.send(outcome).await.is_err() {
            // Reducer is gone
            return;
        }
    }
}

/// Run one segment unit under the unit deadline. `None` means cancelled.
async fn run_unit<T: Transport>(
    ctx: &UnitContext<T>,
    query: SegmentQuery,
    cancel: &CancellationToken,
) -> Option<SegmentOutcome> {
    let deadline = ctx.unit_timeout;

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        timed = tokio::time::timeout(deadline, fetch_segment(ctx, &query, cancel)) => match timed {
            Ok(outcome) => outcome?,
            Err(_) => Err(FailureReason::Timeout(deadline)),
        },
    };

    Some(match outcome {
        Ok(track) => SegmentOutcome::Success(track),
        Err(reason) => SegmentOutcome::Failure(SegmentFailure { query, reason }),
    })
}

async fn fetch_segment<T: Transport>(
    ctx: &UnitContext<T>,
    query: &SegmentQuery,
    cancel: &CancellationToken,
) -> Option<std::result::Result<SubjectTrack, FailureReason>> {
    log::debug!("⏳ {} waiting for gate", query);
    let permit = ctx.gate.acquire(cancel).await.ok()?;

    log::debug!("📡 {} fetching", query);
    let resource = observations_query(&query.subject_id, &query.start, query.end.as_deref(), ctx.page_size);
    let fetched = PaginatedFetcher::new(ctx.transport.clone(), resource)
        .collect_all()
        .await;
    drop(permit);

    let records = match fetched {
        Ok(records) => records,
        Err(e) => return Some(Err(FailureReason::Transport(e))),
    };
    if records.is_empty() {
        return Some(Err(FailureReason::Empty));
    }

    let total = records.len();
    let batch = ctx.normalizer.normalize_batch(&query.subject_id, records);
    if batch.observations.is_empty() {
        return Some(Err(FailureReason::AllRecordsDropped { dropped: total }));
    }

    let mut observations = batch.observations;
    observations.sort_by_key(|obs| obs.recorded_at);

    Some(Ok(SubjectTrack {
        query: query.clone(),
        observations,
        dropped: batch.dropped,
    }))
}
