//! Crate-level error taxonomy
//!
//! Only fatal conditions surface as `Error`. Per-segment failures are
//! reported through `aggregator::SegmentOutcome` and dropped records through
//! `normalizer::NormalizedBatch`, never through this type.

use crate::relocations::AssembleError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The patrol filter matched zero patrols
    #[error("no patrols matched the filter")]
    NoMatchingPatrols,

    /// The top-level patrol listing failed
    #[error("patrol listing failed: {0}")]
    PatrolListing(#[source] TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("aggregation cancelled")]
    Cancelled,

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error("subject group `{0}` not found")]
    SubjectGroupNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
