//! Talking to the external metadata API.
//!
//! [`MetadataSource`] is one raw request. [`ResilientClient`] wraps a source
//! with the shared rate limiter, bounded exponential backoff, a per-call
//! timeout and the shared circuit breaker.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::{ExponentialBackoffBuilder, backoff::Backoff};
use reqwest::{StatusCode, Url, header::RETRY_AFTER};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    breaker::{Admission, BreakerState, CircuitBreaker},
    rate_limit::RateLimiter,
};
use crate::{
    config::SyncConfig,
    error::Result,
    quality::PaperSignals,
    record::Record,
};

/// What the metadata API is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperQuery {
    pub doi: Option<String>,
    pub title: String,
}

impl PaperQuery {
    pub fn for_record(record: &Record) -> Self {
        Self {
            doi: record.doi.clone(),
            title: record.title.clone(),
        }
    }
}

/// Failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("throttled by the metadata API")]
    Throttled { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("request rejected: {0}")]
    Fatal(String),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Fatal(_))
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Look a paper up. `Ok(None)` means the API has no match, which is not
    /// an error.
    async fn fetch(
        &self,
        query: &PaperQuery,
    ) -> FetchResult<Option<PaperSignals>>;
}

const PAPER_FIELDS: &str = "citationCount,venue,authors.hIndex";

#[derive(Debug, Deserialize)]
struct ApiPaper {
    #[serde(rename = "citationCount")]
    citation_count: Option<u64>,
    venue: Option<String>,
    #[serde(default)]
    authors: Vec<ApiAuthor>,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    #[serde(rename = "hIndex")]
    h_index: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiSearch {
    #[serde(default)]
    data: Vec<ApiPaper>,
}

impl From<ApiPaper> for PaperSignals {
    fn from(paper: ApiPaper) -> Self {
        PaperSignals {
            citation_count: paper.citation_count,
            venue: paper.venue.filter(|v| !v.trim().is_empty()),
            max_author_h_index: paper
                .authors
                .iter()
                .filter_map(|a| a.h_index)
                .max(),
        }
    }
}

/// Semantic Scholar Graph API: DOI lookup when a DOI is known, otherwise a
/// one-result title search.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMetadataSource {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("litbase/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> FetchResult<Url> {
        Url::parse_with_params(&format!("{}{path}", self.base_url), params)
            .map_err(|e| FetchError::Fatal(format!("invalid request URL: {e}")))
    }

    async fn get(&self, url: Url) -> FetchResult<Option<reqwest::Response>> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::Throttled { retry_after });
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(format!("HTTP {status}")));
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(
        &self,
        query: &PaperQuery,
    ) -> FetchResult<Option<PaperSignals>> {
        let bad_body = |e: reqwest::Error| {
            FetchError::Transient(format!("unreadable response: {e}"))
        };

        match query.doi.as_deref() {
            Some(doi) => {
                let url = self.url(
                    &format!("/paper/DOI:{doi}"),
                    &[("fields", PAPER_FIELDS)],
                )?;
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                let paper: ApiPaper = response.json().await.map_err(bad_body)?;
                Ok(Some(paper.into()))
            }
            None => {
                let url = self.url(
                    "/paper/search",
                    &[
                        ("query", query.title.as_str()),
                        ("limit", "1"),
                        ("fields", PAPER_FIELDS),
                    ],
                )?;
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                let search: ApiSearch = response.json().await.map_err(bad_body)?;
                Ok(search.data.into_iter().next().map(PaperSignals::from))
            }
        }
    }
}

/// Result of one resilient lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(PaperSignals),
    NoMatch,
    /// The breaker was open; the network was not touched.
    BreakerOpen,
    /// Retries exhausted, or a non-retryable error.
    Failed(FetchError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub throttle_multiplier: f64,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            throttle_multiplier: config.throttle_backoff_multiplier,
            request_timeout: config.request_timeout(),
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delay before the next attempt. Throttling waits longer than a generic
    /// failure, and never less than the server's `Retry-After`.
    fn delay(&self, base: Duration, error: &FetchError) -> Duration {
        let delay = match error {
            FetchError::Throttled { retry_after } => {
                // `f64::max` drops NaN, so the factor is at least 1.
                let factor = self.throttle_multiplier.max(1.0);
                let stretched =
                    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                        .unwrap_or(self.max_backoff);
                retry_after.map_or(stretched, |after| stretched.max(after))
            }
            _ => base,
        };
        delay.min(self.max_backoff)
    }
}

/// A metadata source behind the shared limiter and breaker.
pub struct ResilientClient {
    source: Arc<dyn MetadataSource>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            limiter,
            breaker,
            policy,
        }
    }

    pub fn from_config(
        source: Arc<dyn MetadataSource>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(
            source,
            RateLimiter::new(config.requests_per_second, config.burst),
            CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
            RetryPolicy::from_config(config),
        )
    }

    /// HTTP client against the configured API.
    pub fn http(config: &SyncConfig) -> Result<Self> {
        let source = HttpMetadataSource::new(
            &config.api_base_url,
            config.api_key.clone(),
            config.request_timeout(),
        )?;
        Ok(Self::from_config(Arc::new(source), config))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Look a paper up, retrying transient failures.
    ///
    /// One call counts as one success or failure towards the breaker,
    /// however many attempts it took.
    pub async fn fetch(&self, query: &PaperQuery) -> FetchOutcome {
        let attempts = match self.breaker.admit() {
            Admission::Rejected => return FetchOutcome::BreakerOpen,
            Admission::Trial => 1,
            Admission::Allowed => self.policy.max_retries + 1,
        };

        let mut backoff = self.policy.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let result = tokio::time::timeout(
                self.policy.request_timeout,
                self.source.fetch(query),
            )
            .await
            .unwrap_or(Err(FetchError::Timeout));

            let error = match result {
                Ok(found) => {
                    self.breaker.record_success();
                    return found.map_or(FetchOutcome::NoMatch, FetchOutcome::Found);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= attempts {
                debug!(attempt, error = %error, "metadata lookup failed");
                self.breaker.record_failure();
                return FetchOutcome::Failed(error);
            }

            let base = backoff.next_backoff().unwrap_or(self.policy.max_backoff);
            let delay = self.policy.delay(base, &error);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "metadata request failed, retrying"
            );
            tokio::time::sleep(delay).await;

            // Another worker may have tripped the breaker meanwhile.
            if self.breaker.state() == BreakerState::Open {
                return FetchOutcome::BreakerOpen;
            }
        }
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("policy", &self.policy)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use wiremock::{
        Mock,
        MockServer,
        ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use super::*;

    /// Replays scripted responses, then succeeds with empty signals.
    struct Scripted {
        responses: Mutex<Vec<FetchResult<Option<PaperSignals>>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(
            mut responses: Vec<FetchResult<Option<PaperSignals>>>,
        ) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for Scripted {
        async fn fetch(
            &self,
            _query: &PaperQuery,
        ) -> FetchResult<Option<PaperSignals>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(Some(PaperSignals::default())))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            throttle_multiplier: 4.0,
            request_timeout: Duration::from_secs(1),
        }
    }

    fn client(source: Arc<dyn MetadataSource>, threshold: u32) -> ResilientClient {
        ResilientClient::new(
            source,
            RateLimiter::new(1000.0, 10),
            CircuitBreaker::new(threshold, Duration::from_secs(60)),
            policy(),
        )
    }

    fn query() -> PaperQuery {
        PaperQuery {
            doi: Some("10.1000/xyz".into()),
            title: "A study".into(),
        }
    }

    #[test]
    fn throttling_backs_off_longer_than_transient_failure() {
        let policy = policy();
        let base = Duration::from_millis(200);
        let transient = policy.delay(base, &FetchError::Transient("x".into()));
        let throttled = policy.delay(base, &FetchError::Throttled { retry_after: None });
        assert_eq!(transient, base);
        assert_eq!(throttled, Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = policy();
        let throttled = policy.delay(
            Duration::from_secs(4),
            &FetchError::Throttled {
                retry_after: Some(Duration::from_secs(600)),
            },
        );
        assert_eq!(throttled, policy.max_backoff);
    }

    #[test]
    fn unusable_throttle_multiplier_never_panics() {
        let base = Duration::from_millis(200);
        let throttled = FetchError::Throttled { retry_after: None };
        for multiplier in [-1.0, 0.0, f64::NAN, f64::INFINITY, 1e300] {
            let policy = RetryPolicy {
                throttle_multiplier: multiplier,
                ..policy()
            };
            let delay = policy.delay(base, &throttled);
            assert!(delay >= base, "multiplier {multiplier} gave {delay:?}");
            assert!(delay <= policy.max_backoff);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let source = Scripted::new(vec![
            Err(FetchError::Transient("boom".into())),
            Err(FetchError::Throttled { retry_after: None }),
            Ok(Some(PaperSignals {
                citation_count: Some(7),
                ..PaperSignals::default()
            })),
        ]);
        let client = client(source.clone(), 5);

        let outcome = client.fetch(&query()).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Found(PaperSignals { citation_count: Some(7), .. })
        ));
        assert_eq!(source.calls(), 3);
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_is_bounded() {
        let source = Scripted::new(vec![
            Err(FetchError::Transient("1".into())),
            Err(FetchError::Transient("2".into())),
            Err(FetchError::Transient("3".into())),
            Err(FetchError::Transient("4".into())),
            Err(FetchError::Transient("5".into())),
        ]);
        let client = client(source.clone(), 5);

        let outcome = client.fetch(&query()).await;
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Transient(_))));
        // One attempt plus three retries.
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let source = Scripted::new(vec![Err(FetchError::Fatal("HTTP 401".into()))]);
        let client = client(source.clone(), 5);

        assert!(matches!(
            client.fetch(&query()).await,
            FetchOutcome::Failed(FetchError::Fatal(_))
        ));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answer_is_no_match() {
        let source = Scripted::new(vec![Ok(None)]);
        let client = client(source, 1);
        assert_eq!(client.fetch(&query()).await, FetchOutcome::NoMatch);
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_skips_the_network() {
        let source = Scripted::new(vec![
            Err(FetchError::Fatal("a".into())),
            Err(FetchError::Fatal("b".into())),
        ]);
        let client = client(source.clone(), 2);

        client.fetch(&query()).await;
        client.fetch(&query()).await;
        assert_eq!(client.breaker().state(), BreakerState::Open);

        assert_eq!(client.fetch(&query()).await, FetchOutcome::BreakerOpen);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        struct Slow;

        #[async_trait]
        impl MetadataSource for Slow {
            async fn fetch(
                &self,
                _query: &PaperQuery,
            ) -> FetchResult<Option<PaperSignals>> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            }
        }

        let client = client(Arc::new(Slow), 5);
        assert_eq!(
            client.fetch(&query()).await,
            FetchOutcome::Failed(FetchError::Timeout)
        );
    }

    fn http_source(server: &MockServer) -> HttpMetadataSource {
        HttpMetadataSource::new(&server.uri(), Some("key".into()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn http_doi_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1000/xyz"))
            .and(query_param("fields", PAPER_FIELDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "paperId": "abc",
                "citationCount": 42,
                "venue": "BMJ",
                "authors": [{"hIndex": 12}, {"hIndex": 30}, {"hIndex": null}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let signals = http_source(&server).fetch(&query()).await.unwrap().unwrap();
        assert_eq!(signals.citation_count, Some(42));
        assert_eq!(signals.venue.as_deref(), Some("BMJ"));
        assert_eq!(signals.max_author_h_index, Some(30));
    }

    #[tokio::test]
    async fn http_title_search_without_doi() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("query", "A study"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 0,
                "data": []
            })))
            .mount(&server)
            .await;

        let query = PaperQuery {
            doi: None,
            title: "A study".into(),
        };
        assert_eq!(http_source(&server).fetch(&query).await, Ok(None));
    }

    #[tokio::test]
    async fn http_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1/throttled"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/DOI:10.1/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let source = http_source(&server);
        let doi = |d: &str| PaperQuery {
            doi: Some(format!("10.1/{d}")),
            title: String::new(),
        };

        assert_eq!(source.fetch(&doi("missing")).await, Ok(None));
        assert_eq!(
            source.fetch(&doi("throttled")).await,
            Err(FetchError::Throttled {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert!(matches!(
            source.fetch(&doi("down")).await,
            Err(FetchError::Transient(_))
        ));
        assert!(matches!(
            source.fetch(&doi("denied")).await,
            Err(FetchError::Fatal(_))
        ));
    }
}
