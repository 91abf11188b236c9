//! Scripted in-memory transport for integration tests
//!
//! Routes are the resource path, except `observations/` which is routed per
//! `subject_id` as `observations/<subject_id>`. A script registered under
//! `observations/<subject_id>@<since>` (see [`segment_route`]) takes precedence
//! for that one segment. Continuation tokens are page indices. Unknown routes
//! answer with a single empty page.

#![allow(dead_code)]

use async_trait::async_trait;
use patrolflow::transport::{Page, QueryParams, RawRecord, Transport, TransportError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Script {
    pages: Vec<Vec<RawRecord>>,
    failure: Option<TransportError>,
    /// Fail only from this page index onwards
    fail_from: usize,
    delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub route: String,
    pub params: QueryParams,
    pub continuation: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, route: &str, update: impl FnOnce(&mut Script)) {
        let mut scripts = self.scripts.lock().unwrap();
        update(scripts.entry(route.to_string()).or_default());
    }

    pub fn with_pages(self, route: &str, pages: Vec<Vec<Value>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|page| page.into_iter().map(into_record).collect())
            .collect();
        self.script(route, |s| s.pages = pages);
        self
    }

    pub fn with_failure(self, route: &str, error: TransportError) -> Self {
        self.with_failure_from(route, 0, error)
    }

    pub fn with_failure_from(self, route: &str, page: usize, error: TransportError) -> Self {
        self.script(route, |s| {
            s.failure = Some(error);
            s.fail_from = page;
        });
        self
    }

    /// Delay applied to every page request on `route`
    pub fn with_delay(self, route: &str, delay: Duration) -> Self {
        self.script(route, |s| s.delay = delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, prefix: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.route.starts_with(prefix))
            .collect()
    }

    /// Highest number of simultaneous page requests observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn route_of(path: &str, params: &QueryParams) -> String {
    match (path, params.get("subject_id")) {
        ("observations/", Some(subject)) => format!("observations/{}", subject),
        _ => path.to_string(),
    }
}

/// Route of a single segment, `observations/<subject_id>@<since>`
pub fn segment_route(route: &str, since: &str) -> String {
    format!("{}@{}", route, since)
}

fn into_record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("scripted record must be an object, got {}", other),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch_page(
        &self,
        resource_path: &str,
        params: &QueryParams,
        continuation: Option<&str>,
    ) -> Result<Page, TransportError> {
        let route = route_of(resource_path, params);
        self.calls.lock().unwrap().push(Call {
            route: route.clone(),
            params: params.clone(),
            continuation: continuation.map(str::to_string),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let script = {
            let scripts = self.scripts.lock().unwrap();
            params
                .get("since")
                .and_then(|since| scripts.get(&segment_route(&route, since)))
                .or_else(|| scripts.get(&route))
                .cloned()
                .unwrap_or_default()
        };
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        let index: usize = continuation.map(|t| t.parse().unwrap()).unwrap_or(0);
        if let Some(error) = script.failure {
            if index >= script.fail_from {
                return Err(error);
            }
        }

        let records = script.pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < script.pages.len()).then(|| (index + 1).to_string());
        Ok(Page::new(records, next))
    }
}

/// Patrol with one segment per `(leader, start, end)`
pub fn patrol(id: &str, segments: &[(Option<&str>, Option<&str>, Option<&str>)]) -> Value {
    let segments: Vec<Value> = segments
        .iter()
        .enumerate()
        .map(|(i, (leader, start, end))| {
            json!({
                "id": format!("{}-seg-{}", id, i),
                "patrol_type": "routine_patrol",
                "leader": leader.map(|l| json!({"id": l, "name": format!("Ranger {}", l)})),
                "time_range": {"start_time": start, "end_time": end},
            })
        })
        .collect();

    json!({
        "id": id,
        "serial_number": 14150,
        "state": "done",
        "patrol_segments": segments,
    })
}

pub fn observation(id: &str, recorded_at: &str, longitude: f64, latitude: f64) -> Value {
    json!({
        "id": id,
        "recorded_at": recorded_at,
        "created_at": recorded_at,
        "location": {"longitude": longitude, "latitude": latitude},
        "source": "src-1",
        "exclusion_flags": 0,
    })
}

pub const START: &str = "2024-05-24T11:01:06+03:00";
pub const END: &str = "2024-05-24T11:33:00+03:00";
