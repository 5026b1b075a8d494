//! Shared HTTP plumbing for every remote call
//!
//! [`ApiClient`] is an immutable value: static headers are fixed when it is
//! built and the session credential is attached per call, so there is no
//! shared mutable header state. Every request waits on the shared
//! [`RateLimiter`], carries the configured timeout, and non-success statuses
//! are classified into [`CallError`] once, here.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::retry::IsRetryable;
use crate::types::Session;

/// Longest response body kept in an error for diagnostics
const MAX_ERROR_BODY: usize = 512;

/// A failed remote call, classified
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The request timed out
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or was dropped
    #[error("connection failed: {0}")]
    Connect(String),

    /// The origin answered with a non-success status
    #[error("HTTP {status}")]
    Status {
        /// Status code
        status: u16,
        /// Parsed `Retry-After` header
        retry_after: Option<Duration>,
        /// Start of the response body
        body: String,
    },

    /// The response body did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),

    /// A URL could not be built
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl CallError {
    /// HTTP status, when the origin answered
    pub fn status(&self) -> Option<u16> {
        match self {
            CallError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the body of a status error mentions `needle` (case-insensitive)
    pub fn body_mentions(&self, needle: &str) -> bool {
        match self {
            CallError::Status { body, .. } => {
                body.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CallError::Timeout
        } else if err.is_decode() {
            CallError::Decode(err.to_string())
        } else {
            // Connect, request and body errors all leave the call unanswered
            CallError::Connect(err.to_string())
        }
    }
}

impl IsRetryable for CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::Timeout | CallError::Connect(_) => true,
            CallError::Status { status, .. } => *status == 429 || *status >= 500,
            CallError::Decode(_) | CallError::InvalidUrl(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// HTTP client shared by all pipeline components (cheap to clone)
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    api: Arc<ApiConfig>,
    limiter: RateLimiter,
}

impl ApiClient {
    /// Build a client from configuration and a shared limiter
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid base URL or header, and
    /// [`Error::Network`] if the underlying client cannot be built.
    pub fn new(config: &Config, limiter: RateLimiter) -> Result<Self> {
        let mut base = Url::parse(&config.api.base_url).map_err(|e| Error::Config {
            message: format!("invalid API base URL: {e}"),
            key: Some("api.base_url".to_string()),
        })?;
        // Endpoint paths are joined relative to the base path
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.api.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::Config {
                    message: format!("invalid header name '{name}': {e}"),
                    key: Some("api.headers".to_string()),
                }
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| Error::Config {
                message: format!("invalid value for header '{name}': {e}"),
                key: Some("api.headers".to_string()),
            })?;
            headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.api.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            api: Arc::new(config.api.clone()),
            limiter,
        })
    }

    /// Endpoint configuration
    pub fn api(&self) -> &ApiConfig {
        &self.api
    }

    /// The shared request limiter
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Build an API URL from a path template, substituting `{name}` placeholders
    pub fn endpoint(
        &self,
        template: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<Url, CallError> {
        let path = fill_template(template, params);
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| CallError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Public landing page URL for an organization
    pub fn landing_url(&self, org_code: &str) -> std::result::Result<Url, CallError> {
        let url = fill_template(&self.api.landing_url, &[("org", org_code)]);
        Url::parse(&url).map_err(|e| CallError::InvalidUrl(format!("{url}: {e}")))
    }

    /// GET a JSON document
    pub async fn get_json(
        &self,
        url: Url,
        query: &[(&str, String)],
        session: Option<&Session>,
        headers: &[(&str, String)],
    ) -> std::result::Result<Value, CallError> {
        let mut request = self.http.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = self.send(self.authorize(request, session)).await?;
        decode_json(response).await
    }

    /// POST a JSON body and decode the JSON answer
    pub async fn post_json(
        &self,
        url: Url,
        body: &Value,
        session: Option<&Session>,
    ) -> std::result::Result<Value, CallError> {
        let request = self.http.post(url).json(body);
        let response = self.send(self.authorize(request, session)).await?;
        decode_json(response).await
    }

    /// GET a text document (landing pages)
    pub async fn get_text(&self, url: Url) -> std::result::Result<String, CallError> {
        let response = self.send(self.http.get(url)).await?;
        response.text().await.map_err(CallError::from_reqwest)
    }

    /// GET a URL for streaming; the caller reads the body
    pub async fn get_stream(&self, url: &str) -> std::result::Result<reqwest::Response, CallError> {
        let url = Url::parse(url).map_err(|e| CallError::InvalidUrl(format!("{url}: {e}")))?;
        self.send(self.http.get(url)).await
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        session: Option<&Session>,
    ) -> reqwest::RequestBuilder {
        match session {
            Some(session) => request.header(self.api.session_header.as_str(), session.credential()),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, CallError> {
        self.limiter.acquire().await;

        let response = request
            .timeout(self.api.request_timeout)
            .send()
            .await
            .map_err(CallError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        tracing::debug!(status = status.as_u16(), "Remote call returned non-success status");
        Err(CallError::Status {
            status: status.as_u16(),
            retry_after,
            body,
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("limiter", &self.limiter)
            .finish()
    }
}

/// The `data` member of the `{ "status", "data" }` envelope (Null when absent)
pub fn data_of(value: &Value) -> &Value {
    value.get("data").unwrap_or(&Value::Null)
}

/// Read an integer id that may be encoded as a number or a numeric string
pub fn id_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn decode_json(response: reqwest::Response) -> std::result::Result<Value, CallError> {
    let bytes = response.bytes().await.map_err(CallError::from_reqwest)?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| CallError::Decode(e.to_string()))
}

fn fill_template(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in params {
        let encoded = urlencoding::encode(value);
        out = out.replace(&format!("{{{name}}}"), &encoded);
    }
    out
}

/// Parse a `Retry-After` header given in whole seconds
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ApiClient {
        let mut config = Config::with_base_url(server.uri());
        config
            .api
            .headers
            .insert("api-version".to_string(), "52".to_string());
        ApiClient::new(&config, RateLimiter::unlimited()).unwrap()
    }

    #[test]
    fn test_fill_template_encodes_values() {
        assert_eq!(
            fill_template("/v2/orgs/{org}", &[("org", "a b")]),
            "/v2/orgs/a%20b"
        );
        assert_eq!(
            fill_template("/x/{token}/{token}", &[("token", "t")]),
            "/x/t/t"
        );
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_id_of_accepts_numbers_and_strings() {
        assert_eq!(id_of(&serde_json::json!(42)), Some(42));
        assert_eq!(id_of(&serde_json::json!("64802601")), Some(64802601));
        assert_eq!(id_of(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_call_error_classification() {
        let throttled = CallError::Status {
            status: 429,
            retry_after: Some(Duration::from_secs(2)),
            body: String::new(),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));

        let unavailable = CallError::Status {
            status: 503,
            retry_after: None,
            body: String::new(),
        };
        assert!(unavailable.is_retryable());

        let forbidden = CallError::Status {
            status: 403,
            retry_after: None,
            body: "Limit Exceeded".into(),
        };
        assert!(!forbidden.is_retryable());
        assert!(forbidden.body_mentions("limit exceeded"));
        assert!(CallError::Timeout.is_retryable());
        assert!(!CallError::Decode("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_get_json_sends_static_and_session_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orgs/abc"))
            .and(header("api-version", "52"))
            .and(header("x-access-token", "tok"))
            .and(query_param("limit", "5"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"orgId": 42}})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let now = chrono::Utc::now();
        let session = Session {
            session_id: "tok".into(),
            org_id: crate::types::OrgId(42),
            identifier: "me".into(),
            issued_at: now,
            expires_at: now,
            user_token: None,
        };
        let url = client.endpoint("/v2/orgs/{org}", &[("org", "abc")]).unwrap();
        let value = client
            .get_json(url, &[("limit", "5".to_string())], Some(&session), &[])
            .await
            .unwrap();
        assert_eq!(id_of(&data_of(&value)["orgId"]), Some(42));
        assert_eq!(client.limiter().granted(), 1);
    }

    #[tokio::test]
    async fn test_status_error_carries_retry_after_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/busy"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let url = client.endpoint("/busy", &[]).unwrap();
        let err = client
            .post_json(url, &serde_json::json!({}), None)
            .await
            .unwrap_err();
        match err {
            CallError::Status {
                status,
                retry_after,
                body,
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
                assert_eq!(body, "slow down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut config = Config::with_base_url(server.uri());
        config.api.request_timeout = Duration::from_millis(50);
        let client = ApiClient::new(&config, RateLimiter::unlimited()).unwrap();
        let url = client.endpoint("/slow", &[]).unwrap();
        let err = client.get_json(url, &[], None, &[]).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout), "got {err:?}");
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let mut config = Config::with_base_url("http://localhost");
        config
            .api
            .headers
            .insert("bad header".to_string(), "x".to_string());
        let err = ApiClient::new(&config, RateLimiter::unlimited()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
