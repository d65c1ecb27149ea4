use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use cisync_adapters::{DEFAULT_BAMBOOHR_BASE_URL, DEFAULT_SURVEYS_URL};
use cisync_core::FileNameConvention;
use cisync_http::RateLimit;

/// Knobs the reconciliation engine reads. Passed into [`crate::SyncService`] explicitly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub file_category_id: u64,
    pub processed_status_id: u64,
    pub file_names: FileNameConvention,
    pub prefilter_applicants: bool,
    pub max_pages: usize,
    pub apply_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            file_category_id: 308,
            processed_status_id: 20,
            file_names: FileNameConvention::default(),
            prefilter_applicants: true,
            max_pages: 10_000,
            apply_concurrency: 4,
        }
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub engine: EngineConfig,
    pub bamboohr_domain: String,
    pub bamboohr_api_key: String,
    pub bamboohr_base_url: String,
    pub culture_index_api_key: String,
    pub surveys_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
    /// Requests per second across both remotes; unlimited when unset.
    pub rate_limit_per_sec: Option<u32>,
    pub rate_limit_burst: Option<u32>,
    pub user_agent: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Required keys must be present and
    /// non-blank; malformed optional values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvLookup(lookup);
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            file_category_id: env
                .parsed("CISYNC_FILE_CATEGORY_ID")
                .unwrap_or(defaults.file_category_id),
            processed_status_id: env
                .parsed("CISYNC_PROCESSED_STATUS_ID")
                .unwrap_or(defaults.processed_status_id),
            file_names: env
                .get("CISYNC_FILE_PREFIX")
                .map(FileNameConvention::new)
                .unwrap_or(defaults.file_names),
            prefilter_applicants: env
                .flag("CISYNC_PREFILTER_APPLICANTS")
                .unwrap_or(defaults.prefilter_applicants),
            max_pages: env
                .parsed("CISYNC_MAX_PAGES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_pages),
            apply_concurrency: env
                .parsed("CISYNC_APPLY_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.apply_concurrency),
        };

        Ok(Self {
            engine,
            bamboohr_domain: env.required("BAMBOOHR_DOMAIN")?,
            bamboohr_api_key: env.required("BAMBOOHR_API_KEY")?,
            bamboohr_base_url: env
                .get("BAMBOOHR_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BAMBOOHR_BASE_URL.to_string()),
            culture_index_api_key: env.required("CULTURE_INDEX_API_KEY")?,
            surveys_url: env
                .get("CULTURE_INDEX_SURVEYS_URL")
                .unwrap_or_else(|| DEFAULT_SURVEYS_URL.to_string()),
            scheduler_enabled: env.flag("CISYNC_SCHEDULER_ENABLED").unwrap_or(false),
            sync_cron: env
                .get("CISYNC_SYNC_CRON")
                .unwrap_or_else(|| "0 0 * * * *".to_string()),
            http_timeout_secs: env.parsed("CISYNC_HTTP_TIMEOUT_SECS").unwrap_or(30),
            rate_limit_per_sec: env
                .parsed("CISYNC_RATE_LIMIT_PER_SEC")
                .filter(|n: &u32| *n > 0),
            rate_limit_burst: env
                .parsed("CISYNC_RATE_LIMIT_BURST")
                .filter(|n: &u32| *n > 0),
            user_agent: env
                .get("CISYNC_USER_AGENT")
                .unwrap_or_else(|| "cisync/0.1".to_string()),
            web_port: env.parsed("PORT").unwrap_or(3000),
        })
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit_per_sec.map(|per_second| RateLimit {
            per_second,
            burst: self.rate_limit_burst.unwrap_or(per_second),
        })
    }
}

struct EnvLookup<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvLookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        match self.get(key) {
            Some(value) => Ok(value),
            None => bail!("missing required environment variable {key}"),
        }
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Known true/false words only; anything else reads as unset.
    fn flag(&self, key: &str) -> Option<bool> {
        self.get(key)
            .and_then(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("engine", &self.engine)
            .field("bamboohr_domain", &self.bamboohr_domain)
            .field("bamboohr_api_key", &"<redacted>")
            .field("bamboohr_base_url", &self.bamboohr_base_url)
            .field("culture_index_api_key", &"<redacted>")
            .field("surveys_url", &self.surveys_url)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("user_agent", &self.user_agent)
            .field("web_port", &self.web_port)
            .finish()
    }
}
