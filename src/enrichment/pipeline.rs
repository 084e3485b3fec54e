use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info};

use super::{
    checkpoint::{CheckpointEntry, CheckpointWriter},
    client::{PaperQuery, ResilientClient},
    state::{EnrichmentState, FallbackReason},
};
use crate::{
    config::SyncConfig,
    doc_id::RecordId,
    error::Result,
    quality,
    record::Record,
    sync::CancelFlag,
};

#[derive(Debug, Default)]
pub struct EnrichmentReport {
    /// Terminal state of every record that finished, resumed ones included.
    pub results: BTreeMap<RecordId, EnrichmentState>,
    /// Records scored from the API by this run.
    pub enriched: usize,
    /// Records that fell back to the heuristic score in this run.
    pub degraded: usize,
    /// Degraded records that never reached the API because the circuit
    /// breaker was open.
    pub breaker_open: usize,
    /// Records taken from an earlier run's checkpoint. Not counted in
    /// `enriched` or `degraded`.
    pub resumed: usize,
    /// The run stopped early; `results` is a subset of the input.
    pub cancelled: bool,
}

/// Enriches records in checkpointed batches on a bounded set of tokio
/// tasks. Owns the checkpoint file for its run.
pub struct EnrichmentPipeline {
    /// `None` scores everything heuristically without touching the network.
    client: Option<Arc<ResilientClient>>,
    workers: usize,
    checkpoint_every: usize,
    checkpoint: CheckpointWriter,
    cancel: CancelFlag,
    current_year: i32,
}

impl EnrichmentPipeline {
    pub fn new(
        client: Option<Arc<ResilientClient>>,
        config: &SyncConfig,
        checkpoint_path: Option<PathBuf>,
        cancel: CancelFlag,
    ) -> Result<Self> {
        Ok(Self {
            client,
            workers: config.enrichment_workers.max(1),
            checkpoint_every: config.checkpoint_every.max(1),
            checkpoint: CheckpointWriter::open(checkpoint_path)?,
            cancel,
            current_year: quality::current_year(),
        })
    }

    /// Score against a fixed year instead of the current one.
    pub fn with_year(mut self, year: i32) -> Self {
        self.current_year = year;
        self
    }

    /// Bring every record to a terminal state, resuming from the checkpoint.
    ///
    /// Cancellation is honoured between batches: requests already in flight
    /// finish and are checkpointed first.
    pub async fn run(&self, records: &[Record]) -> Result<EnrichmentReport> {
        let wanted: HashMap<RecordId, &str> = records
            .iter()
            .map(|r| (r.id, r.content_hash.as_str()))
            .collect();
        self.checkpoint
            .retain(|id, entry| {
                wanted.get(&id).is_some_and(|hash| *hash == entry.content_hash)
            })
            .await;

        let done = self.checkpoint.snapshot().await;
        let mut report = EnrichmentReport {
            resumed: done.len(),
            ..EnrichmentReport::default()
        };
        if report.resumed > 0 {
            info!(
                resumed = report.resumed,
                "resuming enrichment from checkpoint"
            );
        }

        let pending: Vec<&Record> = records
            .iter()
            .filter(|r| !done.contains_key(&r.id))
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.workers));

        for batch in pending.chunks(self.checkpoint_every) {
            if self.cancel.is_cancelled() {
                info!("enrichment cancelled, progress is checkpointed");
                report.cancelled = true;
                break;
            }

            let mut tasks = JoinSet::new();
            for record in batch {
                let record = (*record).clone();
                let client = self.client.clone();
                let semaphore = Arc::clone(&semaphore);
                let year = self.current_year;
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let state = enrich_one(client.as_deref(), &record, year).await;
                    (record.id, record.content_hash, state)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (id, content_hash, state) = joined?;
                self.checkpoint
                    .record(id, CheckpointEntry {
                        content_hash,
                        state,
                    })
                    .await;
            }
            self.checkpoint.flush().await?;
        }

        for (id, entry) in self.checkpoint.snapshot().await {
            if !done.contains_key(&id) {
                if entry.state.fallback_reason()
                    == Some(FallbackReason::BreakerOpen)
                {
                    report.breaker_open += 1;
                }
                if entry.state.is_degraded() {
                    report.degraded += 1;
                } else {
                    report.enriched += 1;
                }
            }
            report.results.insert(id, entry.state);
        }
        Ok(report)
    }

    /// Drop the checkpoint once the run's results are committed.
    pub async fn finish(&self) -> Result<()> {
        self.checkpoint.clear().await
    }
}

async fn enrich_one(
    client: Option<&ResilientClient>,
    record: &Record,
    current_year: i32,
) -> EnrichmentState {
    let Some(client) = client else {
        return EnrichmentState::fallback(
            record,
            FallbackReason::Offline,
            None,
            current_year,
        );
    };

    let state = EnrichmentState::Pending.request();
    debug!(record = %record.id, "requesting metadata");
    let outcome = client.fetch(&PaperQuery::for_record(record)).await;
    state.resolve(outcome, record, current_year)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        enrichment::client::{FetchError, FetchResult, MetadataSource},
        quality::{PaperSignals, ScoreMode},
        record::tests::sample_record,
    };

    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        always_fail: bool,
        /// Raise the flag once this many calls have been made.
        cancel_after: Option<(usize, CancelFlag)>,
    }

    #[async_trait]
    impl MetadataSource for FakeSource {
        async fn fetch(&self, _query: &PaperQuery) -> FetchResult<Option<PaperSignals>> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some((after, flag)) = &self.cancel_after
                && calls >= *after
            {
                flag.cancel();
            }
            if self.always_fail {
                Err(FetchError::Transient("down".into()))
            } else {
                Ok(Some(PaperSignals {
                    citation_count: Some(5),
                    ..PaperSignals::default()
                }))
            }
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            requests_per_second: 1000.0,
            burst: 100,
            max_retries: 1,
            initial_backoff_ms: 10,
            max_backoff_ms: 20_000,
            checkpoint_every: 2,
            enrichment_workers: 2,
            ..SyncConfig::default()
        }
    }

    fn records(n: u64) -> Vec<Record> {
        (1..=n).map(|i| sample_record(i, &format!("{i}.md"))).collect()
    }

    fn pipeline(
        source: Arc<FakeSource>,
        checkpoint: Option<PathBuf>,
        cancel: CancelFlag,
    ) -> EnrichmentPipeline {
        let config = config();
        let client = ResilientClient::from_config(source, &config);
        EnrichmentPipeline::new(Some(Arc::new(client)), &config, checkpoint, cancel)
            .unwrap()
            .with_year(2025)
    }

    #[tokio::test(start_paused = true)]
    async fn enriches_every_record() {
        let source = Arc::new(FakeSource::default());
        let pipeline = pipeline(source.clone(), None, CancelFlag::default());

        let report = pipeline.run(&records(5)).await.unwrap();
        assert_eq!(report.results.len(), 5);
        assert_eq!(report.enriched, 5);
        assert_eq!(report.degraded, 0);
        assert!(!report.cancelled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert!(report
            .results
            .values()
            .all(|s| s.quality().unwrap().mode == ScoreMode::Enriched));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_workers() {
        let source = Arc::new(FakeSource::default());
        let mut config = config();
        config.checkpoint_every = 10;
        let client = ResilientClient::from_config(source.clone(), &config);
        let pipeline = EnrichmentPipeline::new(
            Some(Arc::new(client)),
            &config,
            None,
            CancelFlag::default(),
        )
        .unwrap();

        pipeline.run(&records(8)).await.unwrap();
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_api_degrades_every_record() {
        let source = Arc::new(FakeSource {
            always_fail: true,
            ..FakeSource::default()
        });
        let pipeline = pipeline(source, None, CancelFlag::default());

        let report = pipeline.run(&records(12)).await.unwrap();
        assert_eq!(report.results.len(), 12);
        assert_eq!(report.degraded, 12);
        assert!(report
            .results
            .values()
            .all(|s| s.quality().unwrap().mode == ScoreMode::Heuristic));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_never_calls_out() {
        let config = config();
        let pipeline =
            EnrichmentPipeline::new(None, &config, None, CancelFlag::default())
                .unwrap();
        let report = pipeline.run(&records(3)).await.unwrap();
        assert_eq!(report.degraded, 3);
        assert!(report.results.values().all(|s| matches!(
            s,
            EnrichmentState::FailedFallback {
                reason: FallbackReason::Offline,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_cancel_never_repeats_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        let all = records(5);

        // First run: cancelled during the first batch of two.
        let cancel = CancelFlag::default();
        let first = Arc::new(FakeSource {
            cancel_after: Some((1, cancel.clone())),
            ..FakeSource::default()
        });
        let report = pipeline(first.clone(), Some(path.clone()), cancel)
            .run(&all)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.results.len(), 2);
        assert!(path.exists());

        // Second run picks up where the first stopped.
        let second = Arc::new(FakeSource::default());
        let pipeline = pipeline(second.clone(), Some(path.clone()), CancelFlag::default());
        let report = pipeline.run(&all).await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.resumed, 2);
        assert_eq!(report.enriched, 3);
        assert_eq!(report.degraded, 0);
        assert_eq!(report.results.len(), 5);

        let total = first.calls.load(Ordering::SeqCst) + second.calls.load(Ordering::SeqCst);
        assert_eq!(total, 5);

        pipeline.finish().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn changed_record_is_not_resumed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("checkpoint.json");
        let mut all = records(2);

        let source = Arc::new(FakeSource::default());
        pipeline(source.clone(), Some(path.clone()), CancelFlag::default())
            .run(&all)
            .await
            .unwrap();

        all[1].content_hash = "edited".into();
        let source = Arc::new(FakeSource::default());
        let report = pipeline(source.clone(), Some(path), CancelFlag::default())
            .run(&all)
            .await
            .unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
