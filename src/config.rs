//! Configuration types for course-dl
//!
//! The whole pipeline is driven by one explicit [`Config`] value passed to the
//! entry point. Nothing reads global defaults mid-traversal.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Remote API endpoints and request shaping
///
/// Endpoint values are path templates joined onto `base_url`. Placeholders in
/// braces (`{org}`, `{token}`, `{content_id}`) are substituted per call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the content-management API (required)
    #[serde(default)]
    pub base_url: String,

    /// Public landing page of an organization (default: "https://{org}.courses.store")
    #[serde(default = "default_landing_url")]
    pub landing_url: String,

    /// Pattern locating the catalog token in the landing page; capture group 1 is the token
    #[serde(default = "default_token_pattern")]
    pub token_pattern: String,

    /// Org code -> org id lookup
    #[serde(default = "default_org_path")]
    pub org_path: String,

    /// Challenge issuance
    #[serde(default = "default_challenge_path")]
    pub challenge_path: String,

    /// Challenge verification
    #[serde(default = "default_verify_path")]
    pub verify_path: String,

    /// Secondary long-lived user token (None = skip the call)
    #[serde(default = "default_user_token_path")]
    pub user_token_path: Option<String>,

    /// Catalog listing by catalog token
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Per-course token lookup
    #[serde(default = "default_course_info_path")]
    pub course_info_path: String,

    /// Folder/content listing by course token
    #[serde(default = "default_listing_path")]
    pub listing_path: String,

    /// Download resolution by content id
    #[serde(default = "default_resolve_path")]
    pub resolve_path: String,

    /// Header carrying the session credential on authorized calls
    #[serde(default = "default_session_header")]
    pub session_header: String,

    /// Static headers sent with every API call
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Timeout applied to every remote call (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            landing_url: default_landing_url(),
            token_pattern: default_token_pattern(),
            org_path: default_org_path(),
            challenge_path: default_challenge_path(),
            verify_path: default_verify_path(),
            user_token_path: default_user_token_path(),
            catalog_path: default_catalog_path(),
            course_info_path: default_course_info_path(),
            listing_path: default_listing_path(),
            resolve_path: default_resolve_path(),
            session_header: default_session_header(),
            headers: HashMap::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Authentication lifetimes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// How long an issued challenge stays usable (default: 10 minutes)
    #[serde(default = "default_challenge_ttl", with = "duration_serde")]
    pub challenge_ttl: Duration,

    /// How long a verified session is considered valid (default: 24 hours)
    #[serde(default = "default_session_ttl", with = "duration_serde")]
    pub session_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: default_challenge_ttl(),
            session_ttl: default_session_ttl(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Shared request budget
///
/// The origin enforces one quota across every call type, so one bucket guards
/// auth, discovery, catalog, listing, resolution and transfer requests alike.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window (0 = unlimited, default: 60)
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Window length (default: 60 seconds)
    #[serde(default = "default_window", with = "duration_ms_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window: default_window(),
        }
    }
}

/// Folder traversal settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Concurrent folder expansions (default: 4)
    #[serde(default = "default_expansion_concurrency")]
    pub expansion_concurrency: usize,

    /// Maximum folder depth below the course root (default: 32)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Items requested per listing page (default: 500)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            expansion_concurrency: default_expansion_concurrency(),
            max_depth: default_max_depth(),
            page_size: default_page_size(),
        }
    }
}

/// Resolution and byte transfer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory tree that receives delivered files (default: "./downloads")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Content-addressed cache directory (default: "./cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Concurrent resolution workers (default: 4)
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,

    /// Concurrent transfer workers (default: 3)
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Capacity of the queues between stages (default: 64)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Write buffer size for streamed bodies (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How long a resolved URL is reused (default: 10 minutes)
    #[serde(default = "default_resolution_ttl", with = "duration_serde")]
    pub resolution_ttl: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            resolve_concurrency: default_resolve_concurrency(),
            download_concurrency: default_download_concurrency(),
            queue_capacity: default_queue_capacity(),
            chunk_size: default_chunk_size(),
            resolution_ttl: default_resolution_ttl(),
        }
    }
}

/// Main configuration for the retrieval pipeline
///
/// Fields are organized into logical sub-configs:
/// - [`api`](ApiConfig) — endpoints, headers, request timeout
/// - [`auth`](AuthConfig) — challenge and session lifetimes
/// - [`retry`](RetryConfig) — backoff policy shared by every client
/// - [`rate_limit`](RateLimitConfig) — request budget shared by every client
/// - [`traversal`](TraversalConfig) — folder walk concurrency and bounds
/// - [`download`](DownloadConfig) — resolution/transfer pools and directories
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote API endpoints
    #[serde(default)]
    pub api: ApiConfig,

    /// Authentication lifetimes
    #[serde(default)]
    pub auth: AuthConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shared request budget
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Folder traversal
    #[serde(default)]
    pub traversal: TraversalConfig,

    /// Resolution and transfer
    #[serde(default)]
    pub download: DownloadConfig,
}

impl Config {
    /// Create a configuration pointing at the given API base URL with defaults elsewhere
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check that the configuration can drive a pipeline
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(config_error("API base URL is required", "api.base_url"));
        }
        url::Url::parse(&self.api.base_url).map_err(|e| {
            config_error(format!("invalid API base URL: {e}"), "api.base_url")
        })?;
        if !self.api.landing_url.contains("{org}") {
            return Err(config_error(
                "landing URL must contain an {org} placeholder",
                "api.landing_url",
            ));
        }
        match regex::Regex::new(&self.api.token_pattern) {
            Ok(re) if re.captures_len() >= 2 => {}
            Ok(_) => {
                return Err(config_error(
                    "token pattern needs a capture group",
                    "api.token_pattern",
                ));
            }
            Err(e) => {
                return Err(config_error(
                    format!("invalid token pattern: {e}"),
                    "api.token_pattern",
                ));
            }
        }
        if self.api.request_timeout.is_zero() {
            return Err(config_error(
                "request timeout must be positive",
                "api.request_timeout",
            ));
        }
        let positive = [
            (
                self.traversal.expansion_concurrency,
                "traversal.expansion_concurrency",
            ),
            (self.traversal.page_size, "traversal.page_size"),
            (
                self.download.resolve_concurrency,
                "download.resolve_concurrency",
            ),
            (
                self.download.download_concurrency,
                "download.download_concurrency",
            ),
            (self.download.queue_capacity, "download.queue_capacity"),
            (self.download.chunk_size, "download.chunk_size"),
        ];
        for (value, key) in positive {
            if value == 0 {
                return Err(config_error("value must be greater than zero", key));
            }
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(config_error(
                format!("backoff multiplier must be a finite number >= 1.0, got {multiplier}"),
                "retry.backoff_multiplier",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "initial retry delay must not exceed the maximum delay",
                "retry.initial_delay",
            ));
        }
        if self.rate_limit.requests_per_window > 0 && self.rate_limit.window.is_zero() {
            return Err(config_error(
                "rate limit window must be positive when a budget is set",
                "rate_limit.window",
            ));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

fn default_landing_url() -> String {
    "https://{org}.courses.store".to_string()
}

fn default_token_pattern() -> String {
    r#""hash":"([^"]+)""#.to_string()
}

fn default_org_path() -> String {
    "/v2/orgs/{org}".to_string()
}

fn default_challenge_path() -> String {
    "/v2/otp/generate".to_string()
}

fn default_verify_path() -> String {
    "/v2/users/verify".to_string()
}

fn default_user_token_path() -> Option<String> {
    Some("/analytics-api/v1/session/token".to_string())
}

fn default_catalog_path() -> String {
    "/v2/course/preview/similar/{token}".to_string()
}

fn default_course_info_path() -> String {
    "/v2/course/preview/org/info".to_string()
}

fn default_listing_path() -> String {
    "/v2/course/preview/content/list/{token}".to_string()
}

fn default_resolve_path() -> String {
    "/v2/course/preview/document/download/{content_id}".to_string()
}

fn default_session_header() -> String {
    "x-access-token".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_challenge_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_expansion_concurrency() -> usize {
    4
}

fn default_max_depth() -> usize {
    32
}

fn default_page_size() -> usize {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_resolve_concurrency() -> usize {
    4
}

fn default_download_concurrency() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    64
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_resolution_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for backoff and window knobs)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
