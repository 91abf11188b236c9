//! Patrol model and patrol listing filter
//!
//! Patrols arrive from `activity/patrols` shaped like:
//!
//! ```text
//! {"id": "ea2b9c29-...", "serial_number": 14150, "state": "done",
//!  "patrol_segments": [{"id": "751a5d54-...", "patrol_type": "routine_patrol",
//!                       "leader": {"id": "e146c97b-...", "name": "..."},
//!                       "time_range": {"start_time": "2024-05-24T11:01:06+03:00",
//!                                      "end_time": "2024-05-24T11:33:00+03:00"}}]}
//! ```
//!
//! Only the fields needed to discover segment queries are modelled.

use crate::transport::{QueryParams, RawRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Patrol {
    pub id: String,
    #[serde(default)]
    pub serial_number: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub patrol_segments: Vec<PatrolSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PatrolSegment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub patrol_type: Option<String>,
    #[serde(default)]
    pub leader: Option<Leader>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Leader {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start_time: Option<String>,
    /// `None` while the segment is ongoing
    #[serde(default)]
    pub end_time: Option<String>,
}

/// Observation query for one eligible patrol segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentQuery {
    pub patrol_id: String,
    pub segment_id: Option<String>,
    pub subject_id: String,
    pub start: String,
    pub end: Option<String>,
}

impl fmt::Display for SegmentQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject_id={} start_time={} end_time={}",
            self.subject_id,
            self.start,
            self.end.as_deref().unwrap_or("<open>")
        )
    }
}

impl Patrol {
    pub fn from_record(record: RawRecord) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(record))
    }

    /// Segment queries for every eligible segment, in segment order
    pub fn segment_queries(&self) -> Vec<SegmentQuery> {
        self.patrol_segments
            .iter()
            .filter_map(|segment| segment.query(&self.id))
            .collect()
    }
}

impl PatrolSegment {
    fn leader_id(&self) -> Option<&str> {
        self.leader.as_ref()?.id.as_deref().filter(|id| !id.is_empty())
    }

    fn start_time(&self) -> Option<&str> {
        self.time_range.as_ref()?.start_time.as_deref().filter(|t| !t.is_empty())
    }

    fn end_time(&self) -> Option<&str> {
        self.time_range.as_ref()?.end_time.as_deref().filter(|t| !t.is_empty())
    }

    /// A segment without a leader or a start time is skipped, not an error
    pub fn is_eligible(&self) -> bool {
        self.leader_id().is_some() && self.start_time().is_some()
    }

    pub fn query(&self, patrol_id: &str) -> Option<SegmentQuery> {
        Some(SegmentQuery {
            patrol_id: patrol_id.to_string(),
            segment_id: self.id.clone(),
            subject_id: self.leader_id()?.to_string(),
            start: self.start_time()?.to_string(),
            end: self.end_time().map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatrolState {
    Scheduled,
    Active,
    Overdue,
    Done,
    Cancelled,
}

impl PatrolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatrolState::Scheduled => "scheduled",
            PatrolState::Active => "active",
            PatrolState::Overdue => "overdue",
            PatrolState::Done => "done",
            PatrolState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Some(PatrolState::Scheduled),
            "active" => Some(PatrolState::Active),
            "overdue" => Some(PatrolState::Overdue),
            "done" => Some(PatrolState::Done),
            "cancelled" => Some(PatrolState::Cancelled),
            _ => None,
        }
    }
}

/// Filter over top-level patrols
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatrolFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Patrol type ids
    pub patrol_types: Vec<String>,
    pub status: Vec<PatrolState>,
}

impl PatrolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn patrol_type(mut self, patrol_type: impl Into<String>) -> Self {
        self.patrol_types.push(patrol_type.into());
        self
    }

    pub fn status(mut self, state: PatrolState) -> Self {
        self.status.push(state);
        self
    }

    /// Query parameters for `activity/patrols`.
    ///
    /// The date range and patrol types travel in a JSON `filter` parameter.
    /// `status` is sent comma-separated and each patrol type as its own
    /// repeated `patrol_type` parameter.
    pub fn to_params(&self) -> QueryParams {
        let mut params = QueryParams::new();

        if !self.status.is_empty() {
            let status: Vec<&str> = self.status.iter().map(PatrolState::as_str).collect();
            params.insert("status".to_string(), status.join(","));
        }
        for patrol_type in &self.patrol_types {
            params.append("patrol_type", patrol_type.as_str());
        }
        params.insert("return_data".to_string(), "true".to_string());

        let mut date_range = Map::new();
        if let Some(since) = self.since {
            date_range.insert("lower".to_string(), json!(since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(until) = self.until {
            date_range.insert("upper".to_string(), json!(until.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let filter = json!({
            "date_range": date_range,
            "patrol_type": self.patrol_types,
        });
        params.insert("filter".to_string(), filter.to_string());

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn patrol_json() -> Value {
        json!({
            "id": "ea2b9c29-a9f1-4a32-9634-962690d96618",
            "serial_number": 14150,
            "state": "done",
            "title": "End of foot patrol",
            "files": [],
            "patrol_segments": [
                {
                    "id": "seg-1",
                    "patrol_type": "routine_motorbike_patrol",
                    "leader": {"id": "e146c97b-912b-430c-95b2-4e9c3a2186c6", "name": "Ranger"},
                    "time_range": {"start_time": "2024-05-24T11:01:06+03:00", "end_time": "2024-05-24T11:33:00+03:00"},
                    "start_location": {"latitude": -4.09, "longitude": 39.46}
                },
                {
                    "id": "seg-2",
                    "leader": null,
                    "time_range": {"start_time": "2024-05-24T12:00:00+03:00", "end_time": null}
                },
                {
                    "id": "seg-3",
                    "leader": {"id": "leader-3"},
                    "time_range": {"start_time": null, "end_time": null}
                },
                {
                    "id": "seg-4",
                    "leader": {"id": "leader-4"},
                    "time_range": {"start_time": "2024-05-24T13:00:00+03:00"}
                }
            ]
        })
    }

    #[test]
    fn test_parse_patrol_record() {
        let patrol = Patrol::from_record(patrol_json().as_object().unwrap().clone()).unwrap();
        assert_eq!(patrol.serial_number, Some(14150));
        assert_eq!(patrol.patrol_segments.len(), 4);
    }

    #[test]
    fn test_segments_without_leader_or_start_are_skipped() {
        let patrol = Patrol::from_record(patrol_json().as_object().unwrap().clone()).unwrap();
        let queries = patrol.segment_queries();

        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].subject_id, "e146c97b-912b-430c-95b2-4e9c3a2186c6");
        assert_eq!(queries[0].end.as_deref(), Some("2024-05-24T11:33:00+03:00"));
        assert_eq!(queries[1].subject_id, "leader-4");
        assert!(queries[1].end.is_none());
        assert!(!patrol.patrol_segments[1].is_eligible());
        assert!(!patrol.patrol_segments[2].is_eligible());
    }

    #[test]
    fn test_filter_params() {
        let filter = PatrolFilter::new()
            .since(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .patrol_type("pt-1")
            .patrol_type("pt-2")
            .status(PatrolState::Done)
            .status(PatrolState::Active);

        let params = filter.to_params();
        assert_eq!(params.get("status").map(String::as_str), Some("done,active"));
        assert_eq!(params.get_all("patrol_type"), vec!["pt-1", "pt-2"]);
        assert_eq!(params.get("return_data").map(String::as_str), Some("true"));

        let parsed: Value = serde_json::from_str(params.get("filter").unwrap()).unwrap();
        assert_eq!(parsed["date_range"]["lower"], json!("2024-05-01T00:00:00Z"));
        assert!(parsed["date_range"].get("upper").is_none());
        assert_eq!(parsed["patrol_type"], json!(["pt-1", "pt-2"]));
    }

    #[test]
    fn test_empty_filter_still_sends_filter_json() {
        let params = PatrolFilter::new().to_params();
        assert!(!params.contains_key("status"));
        let parsed: Value = serde_json::from_str(params.get("filter").unwrap()).unwrap();
        assert_eq!(parsed, json!({"date_range": {}, "patrol_type": []}));
    }

    #[test]
    fn test_patrol_state_round_trip_names() {
        assert_eq!(PatrolState::from_str("Done"), Some(PatrolState::Done));
        assert_eq!(PatrolState::from_str("unknown"), None);
        assert_eq!(PatrolState::Overdue.as_str(), "overdue");
    }
}
