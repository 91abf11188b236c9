//! patrolflow - concurrent patrol telemetry retrieval
//!
//! Walks cursor-paginated tracking-service resources, fans out one
//! observation fetch per eligible patrol segment under a shared
//! concurrency bound, normalizes the raw records and merges them into a
//! subject-grouped, time-ordered result.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod normalizer;
pub mod output;
pub mod pagination;
pub mod patrol;
pub mod relocations;
pub mod transport;

pub use aggregator::{AggregatedResult, Diagnostics, FailureReason, PatrolAggregator, SegmentFailure};
pub use client::{ObservationOptions, TrackingClient};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use gate::ConcurrencyGate;
pub use normalizer::{Normalizer, Observation};
pub use pagination::{PaginatedFetcher, ResourceQuery};
pub use patrol::{Patrol, PatrolFilter, PatrolState};
pub use relocations::{RelocationAssembler, RelocationKeys, Relocations, RelocationsAssembler};
pub use transport::{Page, Transport, TransportError};
