//! Test configuration helpers pointing a pipeline at a mock origin

use chrono::Utc;
use course_dl::{Config, OrgId, Pipeline, Session};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wiremock::MockServer;

/// Configuration aimed at `server`, writing below `root`
///
/// Retries are fast and the request budget is unlimited so tests run quickly.
pub fn test_config(server: &MockServer, root: &Path) -> Config {
    let mut config = Config::with_base_url(server.uri());
    config.api.landing_url = format!("{}/site/{{org}}", server.uri());
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.max_attempts = 3;
    config.rate_limit.requests_per_window = 0;
    config.download.output_dir = output_dir(root);
    config.download.cache_dir = root.join("cache");
    config
}

/// Where [`test_config`] delivers files
pub fn output_dir(root: &Path) -> PathBuf {
    root.join("output")
}

/// Pipeline built from [`test_config`]
pub fn create_test_pipeline(server: &MockServer, root: &Path) -> Pipeline {
    match Pipeline::new(test_config(server, root)) {
        Ok(pipeline) => pipeline,
        Err(e) => panic!("test configuration rejected: {e}"),
    }
}

/// A session valid for the next hour
pub fn live_session() -> Session {
    let now = Utc::now();
    Session {
        session_id: "sess-1".to_string(),
        org_id: OrgId(42),
        identifier: "me@example.com".to_string(),
        issued_at: now,
        expires_at: now + chrono::Duration::hours(1),
        user_token: Some("user-tok".to_string()),
    }
}
