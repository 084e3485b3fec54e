//! Built-in corpus for `litbase seed`: a handful of short study summaries
//! that exercise every classification and most normalized fields.

use crate::library::MemoryLibrary;

pub const DEMO_LIBRARY_NAME: &str = "demo";

/// Fixed modification time so seeded knowledge bases are reproducible.
const DEMO_MTIME: u64 = 1_704_067_200;

const DEMO_DOCUMENTS: &[(&str, &str)] = &[
    (
        "statins-meta-analysis.md",
        "# Statin therapy and major vascular events: a meta-analysis\n\n\
         Authors: Baigent C, Blackwell L, Emberson J\n\
         Published 2010. doi:10.1016/S0140-6736(10)61350-5\n\n\
         ## Abstract\n\n\
         We pooled individual data from 26 randomised trials (n = 169138) to \
         estimate the effect of more intensive statin regimens on major \
         vascular events. Each 1 mmol/L reduction in LDL cholesterol reduced \
         the annual rate of major vascular events by about a fifth.\n",
    ),
    (
        "exercise-back-pain-rct.md",
        "# Supervised exercise for chronic low back pain: a randomized \
         controlled trial\n\n\
         Authors: Hayden JA, van Tulder MW\n\
         Year: 2019\n\n\
         ## Abstract\n\n\
         In this randomized controlled trial 240 participants with chronic \
         low back pain were allocated to twelve weeks of supervised exercise \
         therapy or usual care. Pain intensity improved more with exercise.\n",
    ),
    (
        "mindfulness-anxiety-review.md",
        "# Mindfulness-based interventions for anxiety: a systematic review\n\n\
         Authors: Hofmann SG, Sawyer AT\n\
         2021\n\n\
         ## Abstract\n\n\
         A systematic review of 39 studies of mindfulness-based therapy in \
         adults with anxiety symptoms. Effects were moderate and robust \
         across study designs.\n",
    ),
    (
        "coffee-cohort.md",
        "# Coffee consumption and all-cause mortality: a prospective cohort\n\n\
         Authors: Freedman ND, Park Y\n\
         2012\n\n\
         A prospective cohort study following 402260 participants for \
         thirteen years. Coffee drinking was inversely associated with total \
         mortality after adjustment for smoking.\n",
    ),
    (
        "rare-reaction-case-report.md",
        "# Anaphylaxis after a contrast agent: a case report\n\n\
         2018\n\n\
         We describe a single patient who developed anaphylaxis minutes \
         after intravenous contrast administration.\n",
    ),
    (
        "hypertension-guideline.md",
        "# Clinical practice guideline for the management of hypertension\n\n\
         2020\n\n\
         This guideline gives recommendations on blood pressure targets, \
         lifestyle measures and first-line drug therapy in adults.\n",
    ),
    (
        "sleep-notes.txt",
        "Notes on sleep hygiene\n\n\
         Keep a regular schedule, limit screens before bed and avoid caffeine \
         late in the day.\n",
    ),
];

/// A library holding the demo corpus.
pub fn demo_library() -> MemoryLibrary {
    let library = MemoryLibrary::new(DEMO_LIBRARY_NAME);
    for (key, text) in DEMO_DOCUMENTS {
        library.insert(key, text, DEMO_MTIME);
    }
    library
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{library::SourceLibrary, normalize::normalize, record::StudyType};

    #[test]
    fn every_document_extracts() {
        let library = demo_library();
        let snapshot = library.snapshot().unwrap();
        assert_eq!(snapshot.len(), DEMO_DOCUMENTS.len());
        for doc in &snapshot {
            assert!(!library.extract(&doc.key).unwrap().trim().is_empty());
        }
    }

    #[test]
    fn corpus_covers_several_study_types() {
        let library = demo_library();
        let types: std::collections::HashSet<StudyType> = library
            .snapshot()
            .unwrap()
            .iter()
            .map(|doc| {
                let text = library.extract(&doc.key).unwrap();
                normalize(&text, &doc.key).study_type
            })
            .collect();
        assert!(types.len() >= 4);
        assert!(types.contains(&StudyType::MetaAnalysis));
    }
}
