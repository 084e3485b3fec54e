//! Read-only queries against the committed knowledge base.

use serde::Serialize;

use crate::{
    data_dir::DataDir,
    doc_id::RecordId,
    embedding::Embedder,
    error::{Error, Result},
    index::{Generation, open_generation},
    record::{Record, RecordStore, StudyType},
};

/// One ranked record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub score: f32,
    pub id: RecordId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub study_type: StudyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub key: String,
}

/// The committed records and index generation, as a search sees them.
///
/// Opening never writes; a sync running at the same time only becomes
/// visible once it has committed.
#[derive(Debug)]
pub struct KnowledgeBase {
    store: RecordStore,
    generation: Generation,
}

impl KnowledgeBase {
    pub fn open(data_dir: &DataDir) -> Result<Self> {
        let store = RecordStore::load(&data_dir.metadata_file())?;
        let generation = match store.index_generation {
            Some(number) => open_generation(&data_dir.index_dir()?, number)?,
            None => Generation::default(),
        };
        generation.verify(&store.ids())?;
        Ok(Self { store, generation })
    }

    pub fn records(&self) -> &RecordStore {
        &self.store
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Rank records by similarity to `query`.
    ///
    /// The query must be embedded by the model the index was built with.
    pub fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<SearchHit>> {
        if let Some(indexed) = &self.store.model_id
            && indexed != embedder.model_id()
        {
            return Err(Error::ModelMismatch {
                indexed: indexed.clone(),
                requested: embedder.model_id().to_string(),
            });
        }
        if self.generation.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let query_vector = embedder
            .embed(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("no vector for query".into()))?;

        let hits = self
            .generation
            .search(&query_vector, limit)?
            .into_iter()
            .filter(|n| n.score >= min_score)
            .filter_map(|n| self.store.get(n.id).map(|r| (n.score, r)))
            .enumerate()
            .map(|(i, (score, record))| hit(i + 1, score, record))
            .collect();
        Ok(hits)
    }
}

fn hit(rank: usize, score: f32, record: &Record) -> SearchHit {
    SearchHit {
        rank,
        score,
        id: record.id,
        title: record.title.clone(),
        year: record.year,
        study_type: record.study_type,
        quality: record.quality.as_ref().map(|q| q.score),
        key: record.identity.key.clone(),
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results found.");
        return;
    }

    for h in hits {
        let year = h.year.map(|y| format!(" ({y})")).unwrap_or_default();
        println!(
            "{:>3}. [{:.3}] #{} {}{}",
            h.rank, h.score, h.id, h.title, year
        );
        let quality = h
            .quality
            .map(|q| format!("quality {q:.1}"))
            .unwrap_or_else(|| "unscored".to_string());
        println!("     {} | {} | {}", h.study_type, quality, h.key);
    }
    println!("\n{} result(s)", hits.len());
}

#[derive(Serialize)]
struct JsonResults<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchHit],
}

/// Format results as JSON output.
pub fn format_json(hits: &[SearchHit], query: &str) -> Result<()> {
    let out = JsonResults {
        query,
        result_count: hits.len(),
        results: hits,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::HashingEmbedder,
        index::IndexMaintainer,
        record::tests::sample_record,
    };

    /// A knowledge base with three records embedded by the hashing model.
    fn setup() -> (tempfile::TempDir, DataDir) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let embedder = HashingEmbedder::default();

        let texts = [
            "statins reduce cardiovascular events in older adults",
            "exercise therapy for chronic low back pain",
            "mindfulness meditation and anxiety symptoms",
        ];
        let mut store = RecordStore::default();
        let mut index =
            IndexMaintainer::open(&data_dir.index_dir().unwrap(), None).unwrap();
        for text in texts {
            let id = store.allocate_id();
            let mut record = sample_record(id.value(), &format!("{id}.md"));
            record.title = text.to_string();
            let vector = embedder.embed(&[text.to_string()]).unwrap().remove(0);
            index.append(id, &vector).unwrap();
            store.upsert(record);
        }
        store.model_id = Some(embedder.model_id().to_string());
        store.index_generation = Some(index.stage().unwrap());
        store.save(&data_dir.metadata_file()).unwrap();
        (tmp, data_dir)
    }

    #[test]
    fn finds_the_closest_record_first() {
        let (_tmp, data_dir) = setup();
        let kb = KnowledgeBase::open(&data_dir).unwrap();
        let embedder = HashingEmbedder::default();
        let hits = kb
            .search(&embedder, "low back pain exercise", 3, 0.0)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, RecordId::new(2));
        assert_eq!(hits[0].rank, 1);
    }

    #[test]
    fn limit_and_min_score_apply() {
        let (_tmp, data_dir) = setup();
        let kb = KnowledgeBase::open(&data_dir).unwrap();
        let embedder = HashingEmbedder::default();
        assert_eq!(kb.search(&embedder, "pain", 1, 0.0).unwrap().len(), 1);
        assert!(kb.search(&embedder, "pain", 3, 2.0).unwrap().is_empty());
    }

    #[test]
    fn other_model_is_refused() {
        let (_tmp, data_dir) = setup();
        let kb = KnowledgeBase::open(&data_dir).unwrap();

        let mut store = RecordStore::load(&data_dir.metadata_file()).unwrap();
        store.model_id = Some("someone/else".into());
        store.save(&data_dir.metadata_file()).unwrap();
        let kb_other = KnowledgeBase::open(&data_dir).unwrap();
        assert!(matches!(
            kb_other.search(&HashingEmbedder::default(), "pain", 3, 0.0),
            Err(Error::ModelMismatch { .. })
        ));
        assert!(kb.search(&HashingEmbedder::default(), "pain", 3, 0.0).is_ok());
    }

    #[test]
    fn empty_knowledge_base_returns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let kb = KnowledgeBase::open(&data_dir).unwrap();
        let hits = kb.search(&HashingEmbedder::default(), "x", 5, 0.0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn metadata_naming_missing_records_is_structural() {
        let (_tmp, data_dir) = setup();
        let mut store = RecordStore::load(&data_dir.metadata_file()).unwrap();
        store.records.pop();
        store.save(&data_dir.metadata_file()).unwrap();
        assert!(matches!(
            KnowledgeBase::open(&data_dir),
            Err(Error::Structural(_))
        ));
    }
}
