//! Run configuration.
//!
//! Every knob has a default so a knowledge base works without a config file.
//! An optional `config.toml` in the data directory overrides the defaults,
//! and the CLI overrides a handful of fields on top of that.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    embedding::HASHING_MODEL_ID,
    error::{Error, Result},
};

pub const MODEL_ENV_VAR: &str = "LITBASE_MODEL";
pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const DEFAULT_API_BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Steady-state request rate against the metadata API.
    pub requests_per_second: f64,
    /// Tokens the limiter may accumulate while idle.
    pub burst: u32,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Backoff multiplier applied on top of the normal delay when the API
    /// answers with a throttling response.
    pub throttle_backoff_multiplier: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Write an enrichment checkpoint after this many terminal records.
    pub checkpoint_every: usize,
    pub enrichment_workers: usize,
    /// Size of the rayon pool used for embedding; 0 picks the rayon default.
    pub embedding_workers: usize,
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Never touch the network; every record gets a heuristic score.
    pub offline: bool,
    /// Library directory used when the CLI is not given one.
    pub library: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst: 1,
            request_timeout_secs: 10,
            max_retries: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            throttle_backoff_multiplier: 4.0,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 60,
            checkpoint_every: 50,
            enrichment_workers: 4,
            embedding_workers: 0,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            model: std::env::var(MODEL_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string()),
            offline: false,
            library: None,
        }
    }
}

impl SyncConfig {
    /// Load `config.toml` if it exists, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for demo/seed runs: offline, deterministic embedder.
    pub fn demo() -> Self {
        Self {
            model: HASHING_MODEL_ID.to_string(),
            offline: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.requests_per_second > 0.0) {
            return Err(Error::Config(
                "requests_per_second must be positive".into(),
            ));
        }
        if !self.throttle_backoff_multiplier.is_finite()
            || self.throttle_backoff_multiplier < 1.0
        {
            return Err(Error::Config(format!(
                "throttle_backoff_multiplier must be a finite number of at \
                 least 1.0, got {}",
                self.throttle_backoff_multiplier
            )));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::Config("checkpoint_every must be at least 1".into()));
        }
        if self.enrichment_workers == 0 {
            return Err(Error::Config(
                "enrichment_workers must be at least 1".into(),
            ));
        }
        // A single call must always time out before the longest backoff,
        // otherwise one hung request dominates the per-record latency bound.
        if self.request_timeout() >= self.max_backoff() {
            return Err(Error::Config(format!(
                "request_timeout_secs ({}s) must be shorter than \
                 max_backoff_ms ({}ms)",
                self.request_timeout_secs, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.checkpoint_every, 50);
        assert_eq!(config.breaker_failure_threshold, 5);
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "requests_per_second = 0.5\ncheckpoint_every = 10\noffline = true\n",
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.requests_per_second, 0.5);
        assert_eq!(config.checkpoint_every, 10);
        assert!(config.offline);
        assert_eq!(config.max_retries, 4);
    }

    #[test]
    fn rejects_timeout_longer_than_backoff_ceiling() {
        let config = SyncConfig {
            request_timeout_secs: 60,
            max_backoff_ms: 1_000,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_rate() {
        let config = SyncConfig {
            requests_per_second: 0.0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unusable_throttle_multiplier() {
        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = SyncConfig {
                throttle_backoff_multiplier: multiplier,
                ..SyncConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "accepted {multiplier}"
            );
        }
        let config = SyncConfig {
            throttle_backoff_multiplier: 1.0,
            ..SyncConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn negative_multiplier_in_file_is_rejected_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "throttle_backoff_multiplier = -1.0\n").unwrap();
        assert!(matches!(SyncConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "checkpoint_every = \"lots\"").unwrap();
        assert!(matches!(
            SyncConfig::load(&path),
            Err(Error::ConfigFile(_))
        ));
    }

    #[test]
    fn demo_is_offline_and_deterministic() {
        let config = SyncConfig::demo();
        assert!(config.offline);
        assert_eq!(config.model, HASHING_MODEL_ID);
    }
}
