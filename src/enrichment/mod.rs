//! Metadata enrichment.
//!
//! Each record is looked up in an external metadata API and scored from the
//! answer. The API is slow and unreliable, so every request goes through one
//! shared [`rate_limit::RateLimiter`] and one shared [`breaker::CircuitBreaker`],
//! failures degrade to heuristic scoring instead of failing the run, and
//! terminal results are checkpointed so an interrupted run never pays for the
//! same record twice.

pub mod breaker;
pub mod checkpoint;
pub mod client;
pub mod pipeline;
pub mod rate_limit;
pub mod state;

pub use client::{
    FetchError,
    FetchOutcome,
    HttpMetadataSource,
    MetadataSource,
    PaperQuery,
    ResilientClient,
};
pub use pipeline::{EnrichmentPipeline, EnrichmentReport};
pub use state::{EnrichmentState, FallbackReason};
