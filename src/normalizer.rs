//! Raw record normalization into canonical observations
//!
//! Pure transformation, no I/O:
//! - `recorded_at` / `created_at` parsed (RFC 3339, or naive as UTC) and
//!   converted to the target zone
//! - `location` converted to a `Point`, either `[lon, lat]` or
//!   `{"longitude": .., "latitude": ..}`; the representation is detected once
//!   per batch from its first record
//! - remaining fields flattened into `extra` with `__` separated keys
//!
//! A record with an unparsable `recorded_at` or an unusable location is
//! dropped and reported in `NormalizedBatch::dropped`. An unparsable
//! `created_at` is kept as `None` (unknown).

use crate::transport::RawRecord;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const FLATTEN_SEPARATOR: &str = "__";

const CORE_FIELDS: [&str; 5] = ["id", "recorded_at", "created_at", "location", "subject_id"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub longitude: f64,
    pub latitude: f64,
}

/// How a batch encodes its `location` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationFormat {
    /// `[longitude, latitude]`
    Pair,
    /// `{"longitude": .., "latitude": ..}`
    Named,
}

impl LocationFormat {
    /// Detect from one record; anything but an array is treated as named
    pub fn detect(record: &RawRecord) -> Self {
        match record.get("location") {
            Some(Value::Array(_)) => LocationFormat::Pair,
            _ => LocationFormat::Named,
        }
    }

    pub fn extract(&self, location: Option<&Value>) -> Option<Point> {
        let (longitude, latitude) = match (self, location?) {
            (LocationFormat::Pair, Value::Array(pair)) => (pair.first()?, pair.get(1)?),
            (LocationFormat::Named, Value::Object(map)) => (map.get("longitude")?, map.get("latitude")?),
            _ => return None,
        };

        let point = Point {
            longitude: longitude.as_f64()?,
            latitude: latitude.as_f64()?,
        };
        (point.longitude.is_finite() && point.latitude.is_finite()).then_some(point)
    }
}

/// Canonical observation record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub subject_id: String,
    pub id: Option<String>,
    pub recorded_at: DateTime<Tz>,
    /// `None` when the service value could not be parsed
    pub created_at: Option<DateTime<Tz>>,
    pub geometry: Point,
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidRecordedAt,
    MissingLocation,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::InvalidRecordedAt => write!(f, "invalid recorded_at"),
            DropReason::MissingLocation => write!(f, "missing or malformed location"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRecord {
    pub id: Option<String>,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub observations: Vec<Observation>,
    pub dropped: Vec<DroppedRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    target: Tz,
}

impl Normalizer {
    pub fn new(target: Tz) -> Self {
        Self { target }
    }

    pub fn target(&self) -> Tz {
        self.target
    }

    /// Parse a raw timestamp value and convert it to the target zone
    pub fn coerce_timestamp(&self, value: Option<&Value>) -> Option<DateTime<Tz>> {
        match value? {
            Value::String(raw) => parse_timestamp(raw).map(|dt| dt.with_timezone(&self.target)),
            _ => None,
        }
    }

    /// Normalize one record with an already-detected location format
    pub fn normalize(
        &self,
        subject_id: &str,
        record: &RawRecord,
        format: LocationFormat,
    ) -> Result<Observation, DropReason> {
        let recorded_at = self
            .coerce_timestamp(record.get("recorded_at"))
            .ok_or(DropReason::InvalidRecordedAt)?;

        let geometry = format
            .extract(record.get("location"))
            .ok_or(DropReason::MissingLocation)?;

        let extra = flatten_record(record)
            .into_iter()
            .filter(|(key, _)| !is_core_field(key))
            .collect();

        Ok(Observation {
            subject_id: subject_id.to_string(),
            id: record_id(record),
            recorded_at,
            created_at: self.coerce_timestamp(record.get("created_at")),
            geometry,
            extra,
        })
    }

    /// Normalize a homogeneous batch from one resource call
    pub fn normalize_batch(&self, subject_id: &str, records: Vec<RawRecord>) -> NormalizedBatch {
        let Some(first) = records.first() else {
            return NormalizedBatch::default();
        };
        let format = LocationFormat::detect(first);

        let mut batch = NormalizedBatch {
            observations: Vec::with_capacity(records.len()),
            dropped: Vec::new(),
        };

        for record in &records {
            match self.normalize(subject_id, record, format) {
                Ok(observation) => batch.observations.push(observation),
                Err(reason) => {
                    let id = record_id(record);
                    log::debug!(
                        "🗑️  Dropped record {} for subject {}: {}",
                        id.as_deref().unwrap_or("<no id>"),
                        subject_id,
                        reason
                    );
                    batch.dropped.push(DroppedRecord { id, reason });
                }
            }
        }

        batch
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

/// Parse RFC 3339 (any offset, colon optional) or a naive ISO timestamp taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    // Space separator, or an offset without a colon (`+0300`)
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

/// Flatten nested objects into `parent__child` keys. Arrays are kept as values.
pub fn flatten_record(record: &RawRecord) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    flatten_into(&mut flat, None, record);
    flat
}

fn flatten_into(flat: &mut BTreeMap<String, Value>, prefix: Option<&str>, map: &Map<String, Value>) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, FLATTEN_SEPARATOR, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) if !nested.is_empty() => flatten_into(flat, Some(&name), nested),
            other => {
                flat.insert(name, other.clone());
            }
        }
    }
}

fn is_core_field(key: &str) -> bool {
    CORE_FIELDS
        .iter()
        .any(|core| key == *core || key.starts_with(&format!("{}{}", core, FLATTEN_SEPARATOR)))
}

fn record_id(record: &RawRecord) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
