//! Relocation assembly boundary
//!
//! The aggregator hands its merged observations, together with the
//! grouping / unique-id / time key names, to a `RelocationAssembler`.
//! `RelocationsAssembler` is the default implementation producing an
//! ordered location series per subject.

use crate::normalizer::{Observation, Point};
use chrono::{DateTime, SecondsFormat};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub const EXTRA_PREFIX: &str = "extra__";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("no observations to assemble")]
    EmptyInput,

    #[error("time key `{0}` is absent")]
    MissingTimeKey(String),

    #[error("grouping key `{0}` is absent")]
    MissingGroupKey(String),
}

/// Column names agreed between the aggregator and the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationKeys {
    pub groupby: String,
    pub uuid: String,
    pub time: String,
}

impl Default for RelocationKeys {
    fn default() -> Self {
        Self {
            groupby: "subject_id".to_string(),
            uuid: "id".to_string(),
            time: "recorded_at".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relocation {
    pub groupby_col: String,
    pub id: Option<String>,
    pub fixtime: DateTime<Tz>,
    pub geometry: Point,
    pub junk_status: bool,
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Relocations {
    relocations: Vec<Relocation>,
}

impl Relocations {
    pub fn len(&self) -> usize {
        self.relocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relocation> {
        self.relocations.iter()
    }

    /// Distinct group values in first-seen order
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for relocation in &self.relocations {
            if !groups.contains(&relocation.groupby_col.as_str()) {
                groups.push(&relocation.groupby_col);
            }
        }
        groups
    }

    pub fn group<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Relocation> + 'a {
        self.relocations.iter().filter(move |r| r.groupby_col == key)
    }

    pub fn into_vec(self) -> Vec<Relocation> {
        self.relocations
    }
}

pub trait RelocationAssembler {
    type Output;

    fn assemble(
        &self,
        keys: &RelocationKeys,
        observations: Vec<Observation>,
    ) -> Result<Self::Output, AssembleError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelocationsAssembler;

impl RelocationAssembler for RelocationsAssembler {
    type Output = Relocations;

    fn assemble(
        &self,
        keys: &RelocationKeys,
        observations: Vec<Observation>,
    ) -> Result<Relocations, AssembleError> {
        if observations.is_empty() {
            return Err(AssembleError::EmptyInput);
        }

        let relocations = observations
            .into_iter()
            .map(|obs| to_relocation(keys, obs))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Relocations { relocations })
    }
}

fn to_relocation(keys: &RelocationKeys, obs: Observation) -> Result<Relocation, AssembleError> {
    let fixtime = match keys.time.as_str() {
        "recorded_at" => obs.recorded_at,
        "created_at" => obs
            .created_at
            .ok_or_else(|| AssembleError::MissingTimeKey(keys.time.clone()))?,
        _ => return Err(AssembleError::MissingTimeKey(keys.time.clone())),
    };

    let groupby_col = match keys.groupby.as_str() {
        "subject_id" => obs.subject_id.clone(),
        other => obs
            .extra
            .get(other)
            .and_then(value_as_string)
            .ok_or_else(|| AssembleError::MissingGroupKey(keys.groupby.clone()))?,
    };

    let id = match keys.uuid.as_str() {
        "id" => obs.id.clone(),
        other => obs.extra.get(other).and_then(value_as_string),
    };

    let mut extra: BTreeMap<String, Value> = obs
        .extra
        .into_iter()
        .map(|(key, value)| (format!("{}{}", EXTRA_PREFIX, key), value))
        .collect();
    extra.insert(format!("{}subject_id", EXTRA_PREFIX), Value::String(obs.subject_id));
    for (name, value) in [("recorded_at", Some(obs.recorded_at)), ("created_at", obs.created_at)] {
        if name != keys.time {
            let value = value
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .unwrap_or(Value::Null);
            extra.insert(format!("{}{}", EXTRA_PREFIX, name), value);
        }
    }

    Ok(Relocation {
        groupby_col,
        id,
        fixtime,
        geometry: obs.geometry,
        junk_status: false,
        extra,
    })
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
