//! Challenge/response authentication
//!
//! [`CredentialBroker`] resolves an organization code, issues a one-time-code
//! challenge to an identifier and exchanges the code for a [`Session`]. No call
//! here is retried automatically: quota exhaustion comes back to the caller as
//! [`AuthError::RateLimited`] with the origin's requested wait.

use chrono::Utc;
use serde_json::{Value, json};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::http::{ApiClient, CallError, data_of, id_of};
use crate::types::{ChallengeHandle, OrgId, Session};

/// Source of one-time codes (an external mailbox, a human, a test double)
#[async_trait::async_trait]
pub trait OneTimeCodeSource: Send + Sync {
    /// Wait for the next code delivered to `identifier`; `None` when no code arrives
    async fn next_code(&self, identifier: &str) -> Option<String>;
}

/// Executes the challenge/response flow and yields sessions
#[derive(Debug, Clone)]
pub struct CredentialBroker {
    client: ApiClient,
    auth: AuthConfig,
}

impl CredentialBroker {
    /// Create a broker on top of a shared API client
    pub fn new(client: ApiClient, auth: AuthConfig) -> Self {
        Self { client, auth }
    }

    /// Resolve an organization code to its internal id
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidOrg`] when the origin does not know the code.
    pub async fn resolve_org(&self, org_code: &str) -> Result<OrgId, AuthError> {
        let url = self
            .client
            .endpoint(&self.client.api().org_path, &[("org", org_code)])
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let value = match self.client.get_json(url, &[], None, &[]).await {
            Ok(value) => value,
            Err(e) => {
                return Err(match e.status() {
                    Some(status) if (400..500).contains(&status) && status != 429 => {
                        AuthError::InvalidOrg {
                            org_code: org_code.to_string(),
                        }
                    }
                    _ => rate_limit_or_unavailable(e),
                });
            }
        };

        if !status_is_success(&value) {
            return Err(AuthError::InvalidOrg {
                org_code: org_code.to_string(),
            });
        }
        id_of(&data_of(&value)["orgId"])
            .map(OrgId)
            .ok_or_else(|| AuthError::InvalidOrg {
                org_code: org_code.to_string(),
            })
    }

    /// Issue a one-time-code challenge to `identifier`
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidOrg`] if `org_code` does not resolve
    /// - [`AuthError::RateLimited`] if the origin signals quota exhaustion
    pub async fn request_challenge(
        &self,
        org_code: &str,
        identifier: &str,
    ) -> Result<ChallengeHandle, AuthError> {
        let org_id = self.resolve_org(org_code).await?;

        let url = self
            .client
            .endpoint(&self.client.api().challenge_path, &[])
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let body = json!({
            "orgCode": org_code,
            "orgId": org_id.get(),
            "email": identifier,
            "identifier": identifier,
            "viaEmail": "1",
            "viaSms": "0",
            "retry": 0,
            "otpCount": 0,
            "source": "web",
        });

        let value = self
            .client
            .post_json(url, &body, None)
            .await
            .map_err(rate_limit_or_unavailable)?;

        let challenge_id = data_of(&value)["sessionId"]
            .as_str()
            .map(str::to_string)
            .or_else(|| id_of(&data_of(&value)["sessionId"]).map(|id| id.to_string()))
            .ok_or_else(|| {
                AuthError::Unavailable("challenge response did not carry a session id".into())
            })?;

        let issued_at = Utc::now();
        tracing::info!(org_code, org_id = org_id.get(), "One-time-code challenge issued");
        Ok(ChallengeHandle {
            challenge_id,
            org_code: org_code.to_string(),
            org_id,
            identifier: identifier.to_string(),
            issued_at,
            expires_at: issued_at + to_chrono(self.auth.challenge_ttl),
        })
    }

    /// Submit a code for a pending challenge
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCode`]: the caller may retry with another code
    /// - [`AuthError::ChallengeExpired`]: a new challenge must be requested
    /// - [`AuthError::RateLimited`]: returned immediately, never retried here
    pub async fn resolve_challenge(
        &self,
        handle: &ChallengeHandle,
        code: &str,
    ) -> Result<Session, AuthError> {
        if handle.is_expired(Utc::now()) {
            return Err(AuthError::ChallengeExpired);
        }

        let url = self
            .client
            .endpoint(&self.client.api().verify_path, &[])
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let body = json!({
            "otp": code.trim(),
            "sessionId": handle.challenge_id,
            "orgId": handle.org_id.get(),
            "email": handle.identifier,
            "fingerprintId": "course-dl",
        });

        let value = self
            .client
            .post_json(url, &body, None)
            .await
            .map_err(classify_verify_failure)?;

        if !status_is_success(&value) {
            return Err(AuthError::InvalidCode);
        }

        let verified_token = data_of(&value)["token"].as_str().map(str::to_string);
        let user_token = match self.fetch_user_token().await {
            Some(token) => Some(token),
            None => verified_token,
        };

        let issued_at = Utc::now();
        tracing::info!(org_id = handle.org_id.get(), "Challenge resolved, session issued");
        Ok(Session {
            session_id: handle.challenge_id.clone(),
            org_id: handle.org_id,
            identifier: handle.identifier.clone(),
            issued_at,
            expires_at: issued_at + to_chrono(self.auth.session_ttl),
            user_token,
        })
    }

    /// Run the whole flow, pulling codes from `codes`
    ///
    /// Rejected codes are retried up to `attempt_budget` submissions; an expired
    /// challenge is reissued once. Rate limiting is surfaced immediately.
    pub async fn authenticate(
        &self,
        org_code: &str,
        identifier: &str,
        codes: &dyn OneTimeCodeSource,
        attempt_budget: u32,
    ) -> Result<Session, AuthError> {
        let mut handle = self.request_challenge(org_code, identifier).await?;
        let mut reissued = false;
        let mut attempts = 0;

        while attempts < attempt_budget {
            let code = codes
                .next_code(identifier)
                .await
                .ok_or_else(|| AuthError::CodeUnavailable {
                    identifier: identifier.to_string(),
                })?;
            attempts += 1;

            match self.resolve_challenge(&handle, &code).await {
                Ok(session) => return Ok(session),
                Err(AuthError::InvalidCode) => {
                    tracing::warn!(attempt = attempts, attempt_budget, "One-time code rejected");
                }
                Err(AuthError::ChallengeExpired) if !reissued => {
                    tracing::warn!("Challenge expired, requesting a new one");
                    reissued = true;
                    handle = self.request_challenge(org_code, identifier).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AuthError::AttemptsExhausted { attempts })
    }

    /// Exchange for a longer-lived user token; failure leaves the session without one
    async fn fetch_user_token(&self) -> Option<String> {
        let path = self.client.api().user_token_path.as_deref()?;
        let url = self.client.endpoint(path, &[]).ok()?;
        let body = json!({ "source": 50, "source_app": "classplus" });
        match self.client.post_json(url, &body, None).await {
            Ok(value) => data_of(&value)["token"].as_str().map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "User token request failed, continuing with session id");
                None
            }
        }
    }
}

/// Envelopes without a `status` member count as success
fn status_is_success(value: &Value) -> bool {
    match value.get("status").and_then(Value::as_str) {
        Some(status) => status.eq_ignore_ascii_case("success"),
        None => true,
    }
}

fn is_quota_signal(err: &CallError) -> bool {
    match err.status() {
        Some(429) => true,
        Some(403) => err.body_mentions("limit exceeded"),
        _ => false,
    }
}

fn rate_limit_or_unavailable(err: CallError) -> AuthError {
    if is_quota_signal(&err) {
        AuthError::RateLimited {
            retry_after: crate::retry::IsRetryable::retry_after(&err),
        }
    } else {
        AuthError::Unavailable(err.to_string())
    }
}

fn classify_verify_failure(err: CallError) -> AuthError {
    if is_quota_signal(&err) {
        return rate_limit_or_unavailable(err);
    }
    match err.status() {
        Some(410) => AuthError::ChallengeExpired,
        Some(status) if (400..500).contains(&status) => {
            if err.body_mentions("expired") {
                AuthError::ChallengeExpired
            } else {
                AuthError::InvalidCode
            }
        }
        _ => AuthError::Unavailable(err.to_string()),
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rate_limiter::RateLimiter;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedCodes(Mutex<VecDeque<String>>);

    impl ScriptedCodes {
        fn new(codes: &[&str]) -> Self {
            Self(Mutex::new(codes.iter().map(|c| c.to_string()).collect()))
        }
    }

    #[async_trait::async_trait]
    impl OneTimeCodeSource for ScriptedCodes {
        async fn next_code(&self, _identifier: &str) -> Option<String> {
            self.0.lock().await.pop_front()
        }
    }

    fn broker_for(server: &MockServer) -> CredentialBroker {
        let mut config = Config::with_base_url(server.uri());
        config.api.user_token_path = Some("/session/token".into());
        let client = ApiClient::new(&config, RateLimiter::unlimited()).unwrap();
        CredentialBroker::new(client, config.auth)
    }

    async fn mount_org(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/orgs/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "success", "data": {"orgId": 42}}),
            ))
            .mount(server)
            .await;
    }

    async fn mount_challenge(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v2/otp/generate"))
            .and(body_partial_json(json!({"orgId": 42, "email": "me@example.com"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success", "data": {"sessionId": "ch-1"}})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_resolve_org_success() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        let broker = broker_for(&server);
        assert_eq!(broker.resolve_org("abc").await.unwrap(), OrgId(42));
    }

    #[tokio::test]
    async fn test_unknown_org_is_invalid_org() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orgs/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let err = broker
            .request_challenge("nope", "me@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidOrg { ref org_code } if org_code == "nope"));
    }

    #[tokio::test]
    async fn test_request_challenge_returns_handle() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        mount_challenge(&server).await;

        let broker = broker_for(&server);
        let handle = broker
            .request_challenge("abc", "me@example.com")
            .await
            .unwrap();
        assert_eq!(handle.challenge_id, "ch-1");
        assert_eq!(handle.org_id, OrgId(42));
        assert!(handle.expires_at > handle.issued_at);
    }

    #[tokio::test]
    async fn test_challenge_quota_is_surfaced_not_retried() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/otp/generate"))
            .respond_with(ResponseTemplate::new(403).set_body_string("OTP limit exceeded"))
            .expect(1)
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let err = broker
            .request_challenge("abc", "me@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { retry_after: None }));
    }

    #[tokio::test]
    async fn test_verify_rate_limit_returns_control_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
            .expect(1)
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let handle = test_handle(Utc::now() + chrono::Duration::minutes(5));

        let start = std::time::Instant::now();
        let err = broker.resolve_challenge(&handle, "123456").await.unwrap_err();
        match err {
            AuthError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(5)))
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // No internal sleep before handing control back
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_verify_classifies_invalid_and_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .and(body_partial_json(json!({"otp": "000000"})))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid OTP"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .and(body_partial_json(json!({"otp": "999999"})))
            .respond_with(ResponseTemplate::new(400).set_body_string("OTP has expired"))
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let handle = test_handle(Utc::now() + chrono::Duration::minutes(5));

        let err = broker.resolve_challenge(&handle, "000000").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));

        let err = broker.resolve_challenge(&handle, "999999").await.unwrap_err();
        assert!(matches!(err, AuthError::ChallengeExpired));
    }

    #[tokio::test]
    async fn test_locally_expired_handle_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let handle = test_handle(Utc::now() - chrono::Duration::seconds(1));
        let err = broker.resolve_challenge(&handle, "123456").await.unwrap_err();
        assert!(matches!(err, AuthError::ChallengeExpired));
    }

    #[tokio::test]
    async fn test_authenticate_retries_rejected_code_within_budget() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        mount_challenge(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .and(body_partial_json(json!({"otp": "111111"})))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid OTP"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .and(body_partial_json(json!({"otp": "222222", "sessionId": "ch-1"})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"status": "success", "data": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"token": "user-tok"}})),
            )
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let codes = ScriptedCodes::new(&["111111", "222222"]);
        let session = broker
            .authenticate("abc", "me@example.com", &codes, 3)
            .await
            .unwrap();

        assert_eq!(session.session_id, "ch-1");
        assert_eq!(session.org_id, OrgId(42));
        assert_eq!(session.user_token.as_deref(), Some("user-tok"));
        assert!(!session.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn test_authenticate_exhausts_budget() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        mount_challenge(&server).await;
        Mock::given(method("POST"))
            .and(path("/v2/users/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid OTP"))
            .expect(2)
            .mount(&server)
            .await;

        let broker = broker_for(&server);
        let codes = ScriptedCodes::new(&["1", "2", "3", "4"]);
        let err = broker
            .authenticate("abc", "me@example.com", &codes, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AttemptsExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_authenticate_without_codes() {
        let server = MockServer::start().await;
        mount_org(&server).await;
        mount_challenge(&server).await;

        let broker = broker_for(&server);
        let codes = ScriptedCodes::new(&[]);
        let err = broker
            .authenticate("abc", "me@example.com", &codes, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CodeUnavailable { .. }));
    }

    fn test_handle(expires_at: chrono::DateTime<Utc>) -> ChallengeHandle {
        ChallengeHandle {
            challenge_id: "ch-1".into(),
            org_code: "abc".into(),
            org_id: OrgId(42),
            identifier: "me@example.com".into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }
}
