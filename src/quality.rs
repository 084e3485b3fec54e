//! Quality scoring.
//!
//! A score is the weighted sum of a fixed table of factors, each valued in
//! `0.0..=1.0`. Two tables exist: the heuristic one uses only fields already
//! on the record, the enriched one also uses signals fetched from the
//! metadata API. Both sum to 100, so scores from either mode share a scale.
//!
//! Everything here is pure; the current year is passed in.

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::record::{Record, StudyType};

/// Signals the metadata API can attach to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperSignals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_author_h_index: Option<u32>,
}

/// Which factor table produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreMode {
    Enriched,
    Heuristic,
}

impl ScoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreMode::Enriched => "enriched",
            ScoreMode::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Factor {
    StudyDesign,
    Recency,
    SampleSize,
    FullText,
    Citations,
    Venue,
    AuthorImpact,
}

impl Factor {
    pub fn label(self) -> &'static str {
        match self {
            Factor::StudyDesign => "study design",
            Factor::Recency => "recency",
            Factor::SampleSize => "sample size",
            Factor::FullText => "full text",
            Factor::Citations => "citations",
            Factor::Venue => "venue",
            Factor::AuthorImpact => "author impact",
        }
    }
}

/// One row of a factor table.
#[derive(Debug, Clone, Copy)]
pub struct WeightedFactor {
    pub factor: Factor,
    pub weight: f64,
}

const fn wf(factor: Factor, weight: f64) -> WeightedFactor {
    WeightedFactor { factor, weight }
}

pub const HEURISTIC_FACTORS: &[WeightedFactor] = &[
    wf(Factor::StudyDesign, 40.0),
    wf(Factor::Recency, 20.0),
    wf(Factor::SampleSize, 25.0),
    wf(Factor::FullText, 15.0),
];

pub const ENRICHED_FACTORS: &[WeightedFactor] = &[
    wf(Factor::StudyDesign, 30.0),
    wf(Factor::Recency, 10.0),
    wf(Factor::SampleSize, 15.0),
    wf(Factor::FullText, 5.0),
    wf(Factor::Citations, 20.0),
    wf(Factor::Venue, 10.0),
    wf(Factor::AuthorImpact, 10.0),
];

/// Venues valued above an ordinary journal. Matched case-insensitively as
/// substrings of the venue name.
const HIGH_IMPACT_VENUES: &[&str] = &[
    "nature",
    "science",
    "lancet",
    "new england journal of medicine",
    "nejm",
    "jama",
    "bmj",
    "cell",
    "cochrane",
];

/// How much one factor contributed to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: Factor,
    pub weight: f64,
    /// Normalised factor value in `0.0..=1.0`.
    pub value: f64,
    /// `weight * value`.
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// 0 to 100, rounded to one decimal.
    pub score: f64,
    pub mode: ScoreMode,
    pub breakdown: Vec<FactorContribution>,
    pub explanation: String,
}

pub fn current_year() -> i32 {
    chrono::Utc::now().year()
}

/// Score a record from its own fields only.
pub fn heuristic(record: &Record, current_year: i32) -> QualityAssessment {
    assess(record, None, current_year)
}

/// Score a record, using the enriched table when `signals` are present.
pub fn assess(
    record: &Record,
    signals: Option<&PaperSignals>,
    current_year: i32,
) -> QualityAssessment {
    let (mode, table) = match signals {
        Some(_) => (ScoreMode::Enriched, ENRICHED_FACTORS),
        None => (ScoreMode::Heuristic, HEURISTIC_FACTORS),
    };
    let empty = PaperSignals::default();
    let signals = signals.unwrap_or(&empty);

    let breakdown: Vec<FactorContribution> = table
        .iter()
        .map(|wf| {
            let value = factor_value(wf.factor, record, signals, current_year)
                .clamp(0.0, 1.0);
            FactorContribution {
                factor: wf.factor,
                weight: wf.weight,
                value,
                points: wf.weight * value,
            }
        })
        .collect();

    let total: f64 = breakdown.iter().map(|c| c.points).sum();
    let score = (total * 10.0).round() / 10.0;
    let explanation = explain(mode, score, &breakdown);

    QualityAssessment {
        score,
        mode,
        breakdown,
        explanation,
    }
}

fn factor_value(
    factor: Factor,
    record: &Record,
    signals: &PaperSignals,
    current_year: i32,
) -> f64 {
    match factor {
        Factor::StudyDesign => study_design_value(record.study_type),
        Factor::Recency => recency_value(record.year, current_year),
        Factor::SampleSize => record.sample_size.map_or(0.0, |n| {
            // Saturates at 10,000 participants.
            ((n as f64) + 1.0).log10() / 4.0
        }),
        Factor::FullText => {
            if record.has_full_text {
                1.0
            } else {
                0.0
            }
        }
        Factor::Citations => signals.citation_count.map_or(0.0, |c| {
            // Saturates at 1,000 citations.
            (c as f64).ln_1p() / 1000f64.ln_1p()
        }),
        Factor::Venue => match signals.venue.as_deref().map(str::trim) {
            None | Some("") => 0.0,
            Some(venue) => {
                let venue = venue.to_lowercase();
                if HIGH_IMPACT_VENUES.iter().any(|v| venue.contains(v)) {
                    1.0
                } else {
                    0.5
                }
            }
        },
        Factor::AuthorImpact => signals
            .max_author_h_index
            .map_or(0.0, |h| f64::from(h) / 40.0),
    }
}

fn study_design_value(study_type: StudyType) -> f64 {
    match study_type {
        StudyType::MetaAnalysis => 1.0,
        StudyType::SystematicReview => 0.95,
        StudyType::Rct => 0.85,
        StudyType::Guideline => 0.8,
        StudyType::Cohort => 0.65,
        StudyType::CaseControl => 0.55,
        StudyType::CrossSectional => 0.45,
        StudyType::Review => 0.4,
        StudyType::CaseReport => 0.25,
        StudyType::Other => 0.2,
    }
}

/// Full marks up to two years old, falling linearly to 0.1 at thirty.
fn recency_value(year: Option<i32>, current_year: i32) -> f64 {
    let Some(year) = year else {
        return 0.3;
    };
    let age = f64::from((current_year - year).max(0));
    if age <= 2.0 {
        1.0
    } else {
        (1.0 - (age - 2.0) / 28.0 * 0.9).max(0.1)
    }
}

fn explain(mode: ScoreMode, score: f64, breakdown: &[FactorContribution]) -> String {
    let mut ranked: Vec<&FactorContribution> =
        breakdown.iter().filter(|c| c.points > 0.0).collect();
    ranked.sort_by(|a, b| b.points.total_cmp(&a.points));

    let top: Vec<String> = ranked
        .iter()
        .take(3)
        .map(|c| format!("{} {:.1}/{:.0}", c.factor.label(), c.points, c.weight))
        .collect();

    if top.is_empty() {
        format!("{} score {score:.1}/100; no factor contributed", mode.as_str())
    } else {
        format!(
            "{} score {score:.1}/100; strongest factors: {}",
            mode.as_str(),
            top.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_record;

    const YEAR: i32 = 2025;

    #[test]
    fn factor_tables_sum_to_one_hundred() {
        for table in [HEURISTIC_FACTORS, ENRICHED_FACTORS] {
            let total: f64 = table.iter().map(|f| f.weight).sum();
            assert!((total - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn heuristic_uses_only_record_fields() {
        let record = sample_record(1, "a.md");
        let q = heuristic(&record, YEAR);
        assert_eq!(q.mode, ScoreMode::Heuristic);
        assert_eq!(q.breakdown.len(), HEURISTIC_FACTORS.len());
        assert!(q.breakdown.iter().all(|c| !matches!(
            c.factor,
            Factor::Citations | Factor::Venue | Factor::AuthorImpact
        )));
        assert!(q.explanation.starts_with("heuristic score"));
    }

    #[test]
    fn breakdown_adds_up_to_score() {
        let record = sample_record(1, "a.md");
        let q = heuristic(&record, YEAR);
        let total: f64 = q.breakdown.iter().map(|c| c.points).sum();
        assert!((q.score - total).abs() <= 0.05);
        assert!((0.0..=100.0).contains(&q.score));
    }

    #[test]
    fn stronger_design_scores_higher() {
        let mut meta = sample_record(1, "a.md");
        meta.study_type = StudyType::MetaAnalysis;
        let mut case = sample_record(2, "b.md");
        case.study_type = StudyType::CaseReport;

        assert!(heuristic(&meta, YEAR).score > heuristic(&case, YEAR).score);
    }

    #[test]
    fn enriched_mode_counts_external_signals() {
        let record = sample_record(1, "a.md");
        let signals = PaperSignals {
            citation_count: Some(1000),
            venue: Some("The Lancet".into()),
            max_author_h_index: Some(80),
        };
        let q = assess(&record, Some(&signals), YEAR);
        assert_eq!(q.mode, ScoreMode::Enriched);

        let citations = q
            .breakdown
            .iter()
            .find(|c| c.factor == Factor::Citations)
            .unwrap();
        assert!((citations.value - 1.0).abs() < 1e-9);
        let author = q
            .breakdown
            .iter()
            .find(|c| c.factor == Factor::AuthorImpact)
            .unwrap();
        assert_eq!(author.value, 1.0);
    }

    #[test]
    fn empty_signals_still_enriched_mode() {
        let record = sample_record(1, "a.md");
        let q = assess(&record, Some(&PaperSignals::default()), YEAR);
        assert_eq!(q.mode, ScoreMode::Enriched);
        let venue = q.breakdown.iter().find(|c| c.factor == Factor::Venue).unwrap();
        assert_eq!(venue.points, 0.0);
    }

    #[test]
    fn recency_curve() {
        assert_eq!(recency_value(Some(YEAR), YEAR), 1.0);
        assert_eq!(recency_value(Some(YEAR + 3), YEAR), 1.0);
        assert_eq!(recency_value(None, YEAR), 0.3);
        assert!((recency_value(Some(YEAR - 30), YEAR) - 0.1).abs() < 1e-9);
        assert_eq!(recency_value(Some(1900), YEAR), 0.1);
        assert!(recency_value(Some(YEAR - 5), YEAR) > recency_value(Some(YEAR - 10), YEAR));
    }

    #[test]
    fn scoring_is_deterministic() {
        let record = sample_record(4, "d.md");
        assert_eq!(heuristic(&record, YEAR), heuristic(&record, YEAR));
    }
}
