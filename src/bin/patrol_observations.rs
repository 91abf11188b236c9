//! Patrol Observations - fetch every patrol leader's track for a time window
//!
//! Usage:
//!   cargo run --release --bin patrol_observations
//!
//! Environment variables:
//!   ER_SERVER / ER_TOKEN - tracking service and bearer token (required)
//!   ER_SINCE / ER_UNTIL - patrol date range (RFC 3339, optional)
//!   ER_PATROL_TYPE - comma-separated patrol type ids (optional)
//!   ER_STATUS - comma-separated patrol states (optional)
//!   ER_OUTPUT_PATH - JSONL output file (optional, summary is logged otherwise)
//!   ER_PAGE_SIZE, ER_CONCURRENCY_LIMIT, ER_TIMEZONE, ER_UNIT_TIMEOUT_SECS,
//!   ER_MAX_RETRIES, ER_REQUEST_TIMEOUT_SECS - see `ClientConfig`

use chrono::{DateTime, Utc};
use dotenv::dotenv;
use log::{error, info, warn};
use patrolflow::normalizer::parse_timestamp;
use patrolflow::output::{JsonlRelocationWriter, RelocationSink};
use patrolflow::{ClientConfig, PatrolFilter, PatrolState, RelocationsAssembler, TrackingClient};
use std::env;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Patrol Observations");

    let config = ClientConfig::from_env()?;
    let filter = filter_from_env()?;

    info!("   ├─ Server: {}", config.server);
    info!("   ├─ Page size: {}", config.page_size);
    info!("   ├─ Concurrency limit: {}", config.concurrency_limit);
    info!("   ├─ Time zone: {}", config.target_timezone);
    info!("   └─ Unit timeout: {}s", config.unit_timeout.as_secs());

    let client = TrackingClient::connect(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⚠️  Ctrl-C received, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = match client.get_patrol_observations(&filter, &cancel).await {
        Ok(result) => result,
        Err(e) => {
            error!("❌ Aggregation failed: {}", e);
            return Err(e.into());
        }
    };

    let diagnostics = result.diagnostics().clone();
    info!("📊 Patrols: {}", diagnostics.patrols);
    info!("   ├─ Segments: {} eligible, {} skipped", diagnostics.eligible_segments, diagnostics.skipped_segments);
    info!("   ├─ Units: {} ok, {} failed", diagnostics.succeeded_units, diagnostics.failures.len());
    info!("   └─ Dropped records: {}", diagnostics.dropped_records.len());

    if result.is_empty() {
        warn!("⚠️  No observations retrieved");
        return Ok(());
    }

    let relocations = result.into_relocations(&RelocationsAssembler)?;

    match env::var("ER_OUTPUT_PATH") {
        Ok(path) => {
            let mut writer = JsonlRelocationWriter::new(&path)?;
            let written = writer.write_all(&relocations).await?;
            info!("✅ Wrote {} relocations to {}", written, path);
        }
        Err(_) => {
            for subject in relocations.groups() {
                info!("   {} → {} relocations", subject, relocations.group(subject).count());
            }
        }
    }

    Ok(())
}

fn filter_from_env() -> Result<PatrolFilter, String> {
    let mut filter = PatrolFilter::new();

    if let Some(since) = time_var("ER_SINCE")? {
        filter = filter.since(since);
    }
    if let Some(until) = time_var("ER_UNTIL")? {
        filter = filter.until(until);
    }
    for patrol_type in list_var("ER_PATROL_TYPE") {
        filter = filter.patrol_type(patrol_type);
    }
    for state in list_var("ER_STATUS") {
        let state = PatrolState::from_str(&state).ok_or_else(|| format!("ER_STATUS: unknown state `{}`", state))?;
        filter = filter.status(state);
    }

    Ok(filter)
}

fn time_var(name: &str) -> Result<Option<DateTime<Utc>>, String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_timestamp(raw.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .ok_or_else(|| format!("{}: cannot parse `{}`", name, raw)),
        _ => Ok(None),
    }
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
