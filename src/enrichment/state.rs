use serde::{Deserialize, Serialize};

use super::client::FetchOutcome;
use crate::{
    quality::{self, PaperSignals, QualityAssessment},
    record::Record,
};

/// Why a record was scored heuristically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    /// The circuit breaker was open.
    BreakerOpen,
    /// Retries were exhausted or the API rejected the request.
    RequestFailed,
    /// The API answered but knows nothing about the paper.
    NoMatch,
    /// The run was configured not to use the network.
    Offline,
}

/// Per-record enrichment lifecycle:
/// `Pending -> Requested -> {Enriched, FailedFallback}`.
///
/// Terminal states carry everything needed to apply the result, so a
/// checkpoint is just a map of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum EnrichmentState {
    Pending,
    Requested,
    Enriched {
        signals: PaperSignals,
        quality: QualityAssessment,
    },
    FailedFallback {
        reason: FallbackReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        quality: QualityAssessment,
    },
}

impl EnrichmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrichmentState::Enriched { .. }
                | EnrichmentState::FailedFallback { .. }
        )
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, EnrichmentState::FailedFallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            EnrichmentState::FailedFallback { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn quality(&self) -> Option<&QualityAssessment> {
        match self {
            EnrichmentState::Enriched { quality, .. }
            | EnrichmentState::FailedFallback { quality, .. } => Some(quality),
            _ => None,
        }
    }

    /// `Pending -> Requested`. Any other state is returned unchanged.
    pub fn request(self) -> Self {
        match self {
            EnrichmentState::Pending => EnrichmentState::Requested,
            other => other,
        }
    }

    /// `Requested -> Enriched | FailedFallback`. Any other state is returned
    /// unchanged.
    pub fn resolve(
        self,
        outcome: FetchOutcome,
        record: &Record,
        current_year: i32,
    ) -> Self {
        if !matches!(self, EnrichmentState::Requested) {
            return self;
        }
        match outcome {
            FetchOutcome::Found(signals) => EnrichmentState::Enriched {
                quality: quality::assess(record, Some(&signals), current_year),
                signals,
            },
            FetchOutcome::NoMatch => {
                Self::fallback(record, FallbackReason::NoMatch, None, current_year)
            }
            FetchOutcome::BreakerOpen => Self::fallback(
                record,
                FallbackReason::BreakerOpen,
                None,
                current_year,
            ),
            FetchOutcome::Failed(e) => Self::fallback(
                record,
                FallbackReason::RequestFailed,
                Some(e.to_string()),
                current_year,
            ),
        }
    }

    /// Terminal heuristic state, straight from any state.
    pub fn fallback(
        record: &Record,
        reason: FallbackReason,
        detail: Option<String>,
        current_year: i32,
    ) -> Self {
        EnrichmentState::FailedFallback {
            reason,
            detail,
            quality: quality::heuristic(record, current_year),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        enrichment::client::FetchError,
        quality::ScoreMode,
        record::tests::sample_record,
    };

    const YEAR: i32 = 2025;

    #[test]
    fn happy_path() {
        let record = sample_record(1, "a.md");
        let state = EnrichmentState::Pending.request();
        assert_eq!(state, EnrichmentState::Requested);
        assert!(!state.is_terminal());

        let state = state.resolve(
            FetchOutcome::Found(PaperSignals {
                citation_count: Some(10),
                ..PaperSignals::default()
            }),
            &record,
            YEAR,
        );
        assert!(state.is_terminal());
        assert!(!state.is_degraded());
        assert_eq!(state.quality().unwrap().mode, ScoreMode::Enriched);
    }

    #[test]
    fn every_failure_falls_back_to_heuristic() {
        let record = sample_record(1, "a.md");
        for outcome in [
            FetchOutcome::NoMatch,
            FetchOutcome::BreakerOpen,
            FetchOutcome::Failed(FetchError::Timeout),
        ] {
            let state = EnrichmentState::Requested.resolve(outcome, &record, YEAR);
            assert!(state.is_degraded());
            assert_eq!(state.quality().unwrap().mode, ScoreMode::Heuristic);
        }
    }

    #[test]
    fn resolve_only_applies_to_requested() {
        let record = sample_record(1, "a.md");
        let state = EnrichmentState::Pending.resolve(FetchOutcome::NoMatch, &record, YEAR);
        assert_eq!(state, EnrichmentState::Pending);
    }

    #[test]
    fn serializes_with_a_tag() {
        let record = sample_record(1, "a.md");
        let state = EnrichmentState::Requested.resolve(
            FetchOutcome::Failed(FetchError::Fatal("HTTP 401".into())),
            &record,
            YEAR,
        );
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed-fallback");
        assert_eq!(json["reason"], "request-failed");

        let back: EnrichmentState = serde_json::from_value(json).unwrap();
        assert!(back.is_degraded());
        let (a, b) = (back.quality().unwrap(), state.quality().unwrap());
        assert!((a.score - b.score).abs() < 1e-9);
        assert_eq!(a.explanation, b.explanation);
    }
}
