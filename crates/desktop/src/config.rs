//! Runtime configuration, read from `TILLSYNC_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "http://localhost:9000/apix/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Delivery retry policy for outbox records: `attempts` tries, sleeping
/// `attempt × base_delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL every endpoint path is joined onto; always ends with `/`.
    pub api_url: Url,
    pub auth_token: Option<String>,
    /// `None` selects the per-user application data directory.
    pub db_path: Option<PathBuf>,
    pub probe_host: String,
    pub probe_url: Url,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub connectivity_interval: Duration,
    pub offline_recheck: Duration,
    pub fetch_interval: Duration,
    pub bulk_page_size: u32,
    pub delta_page_size: u32,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = parse_base_url(
            "TILLSYNC_API_URL",
            get("TILLSYNC_API_URL").as_deref().unwrap_or(DEFAULT_API_URL),
        )?;

        let (probe_host, probe_url) = match get("TILLSYNC_PROBE_HOST") {
            Some(host) => {
                let url = Url::parse(&format!("https://{host}/")).map_err(|e| ConfigError::Invalid {
                    var: "TILLSYNC_PROBE_HOST",
                    reason: e.to_string(),
                })?;
                (host, url)
            }
            None => {
                let host = api_url
                    .host_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::Invalid {
                        var: "TILLSYNC_API_URL",
                        reason: "URL has no host".to_string(),
                    })?;
                let mut root = api_url.clone();
                root.set_path("/");
                root.set_query(None);
                (host, root)
            }
        };

        let millis = |var: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(parse_number(var, get(var), default)?))
        };

        let retry = RetryPolicy {
            attempts: parse_number("TILLSYNC_RETRY_ATTEMPTS", get("TILLSYNC_RETRY_ATTEMPTS"), 3)?,
            base_delay: millis("TILLSYNC_RETRY_BASE_DELAY_MS", 1000)?,
        };
        if retry.attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "TILLSYNC_RETRY_ATTEMPTS",
                reason: "at least one attempt is required".to_string(),
            });
        }

        Ok(Self {
            api_url,
            auth_token: get("TILLSYNC_AUTH_TOKEN"),
            db_path: get("TILLSYNC_DB_PATH").map(PathBuf::from),
            probe_host,
            probe_url,
            probe_timeout: millis("TILLSYNC_PROBE_TIMEOUT_MS", 5_000)?,
            request_timeout: millis("TILLSYNC_REQUEST_TIMEOUT_MS", 30_000)?,
            connectivity_interval: millis("TILLSYNC_CONNECTIVITY_INTERVAL_MS", 3_000)?,
            offline_recheck: millis("TILLSYNC_OFFLINE_RECHECK_MS", 1_000)?,
            fetch_interval: millis("TILLSYNC_FETCH_INTERVAL_MS", 60_000)?,
            bulk_page_size: positive("TILLSYNC_BULK_PAGE_SIZE", get("TILLSYNC_BULK_PAGE_SIZE"), 1000)?,
            delta_page_size: positive("TILLSYNC_DELTA_PAGE_SIZE", get("TILLSYNC_DELTA_PAGE_SIZE"), 200)?,
            retry,
        })
    }
}

fn parse_base_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let mut text = raw.to_string();
    if !text.ends_with('/') {
        text.push('/');
    }
    let url = Url::parse(&text).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            var,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

fn parse_number<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(text) => text.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: format!("'{text}': {e}"),
        }),
    }
}

fn positive(var: &'static str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match parse_number(var, raw, default)? {
        0 => Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}
