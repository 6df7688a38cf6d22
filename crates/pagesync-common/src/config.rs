use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Remote API connection configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bearer credential for the integration.
    pub token: String,
    pub base_url: Url,
    /// Value of the `Notion-Version` header.
    pub notion_version: String,
    /// Per-request timeout applied by the HTTP client.
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.notion.com";
    pub const DEFAULT_VERSION: &'static str = "2022-06-28";

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: Url::parse(Self::DEFAULT_BASE_URL).expect("default base URL is valid"),
            notion_version: Self::DEFAULT_VERSION.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required env vars:
    /// - `NOTION_TOKEN`: integration secret
    ///
    /// Optional env vars:
    /// - `NOTION_BASE_URL`: API root (default: https://api.notion.com)
    /// - `NOTION_VERSION`: API version header (default: 2022-06-28)
    /// - `NOTION_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let token =
            std::env::var("NOTION_TOKEN").map_err(|_| ConfigError::MissingEnv { var: "NOTION_TOKEN" })?;

        let mut config = Self::new(token);

        if let Ok(base) = std::env::var("NOTION_BASE_URL") {
            config.base_url = Url::parse(&base).map_err(|e| ConfigError::UrlParse {
                url: base.clone(),
                message: e.to_string(),
            })?;
        }

        if let Ok(version) = std::env::var("NOTION_VERSION") {
            config.notion_version = version;
        }

        if let Some(secs) = env_parse::<u64>("NOTION_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Knobs controlling one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Refuse the whole sync when it would delete a block with discussions.
    pub cancel_on_discussion: bool,
    /// Attempts per remote call for transient failures, the first one included.
    pub max_retries: u32,
    pub upload_poll_interval_ms: u64,
    /// Upper bound on waiting for an upload to reach a terminal status.
    pub upload_timeout_ms: u64,
    /// Worker pool width for independent network calls.
    pub max_concurrency: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            cancel_on_discussion: false,
            max_retries: 5,
            upload_poll_interval_ms: 500,
            upload_timeout_ms: 300_000, // 5 minutes
            max_concurrency: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl SyncPolicy {
    /// Defaults overlaid with `PAGESYNC_*` environment variables.
    ///
    /// - `PAGESYNC_CANCEL_ON_DISCUSSION`: `true`/`false`
    /// - `PAGESYNC_MAX_RETRIES`
    /// - `PAGESYNC_UPLOAD_POLL_INTERVAL_MS`
    /// - `PAGESYNC_UPLOAD_TIMEOUT_MS`
    /// - `PAGESYNC_MAX_CONCURRENCY`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut policy = Self::default();
        if let Some(v) = env_parse("PAGESYNC_CANCEL_ON_DISCUSSION")? {
            policy.cancel_on_discussion = v;
        }
        if let Some(v) = env_parse("PAGESYNC_MAX_RETRIES")? {
            policy.max_retries = v;
        }
        if let Some(v) = env_parse("PAGESYNC_UPLOAD_POLL_INTERVAL_MS")? {
            policy.upload_poll_interval_ms = v;
        }
        if let Some(v) = env_parse("PAGESYNC_UPLOAD_TIMEOUT_MS")? {
            policy.upload_timeout_ms = v;
        }
        if let Some(v) = env_parse("PAGESYNC_MAX_CONCURRENCY")? {
            policy.max_concurrency = v;
        }
        Ok(policy)
    }

    pub fn upload_poll_interval(&self) -> Duration {
        Duration::from_millis(self.upload_poll_interval_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Pool width, never zero.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
