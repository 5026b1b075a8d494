//! Download resolution
//!
//! Turns a leaf content id into a fetchable URL. Resolved URLs can expire on the
//! origin side, so they are cached for a bounded time only.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ResolutionError;
use crate::http::{ApiClient, CallError, data_of};
use crate::retry::with_retry;
use crate::types::{ContentId, ContentNode, ResolvedTarget, Session};

/// Resolves content ids to URLs with a TTL cache
#[derive(Debug)]
pub struct DownloadResolver {
    client: ApiClient,
    retry: RetryConfig,
    ttl: Duration,
    cache: Mutex<HashMap<ContentId, ResolvedTarget>>,
}

impl DownloadResolver {
    /// Create a resolver whose cached targets stay valid for `ttl`
    pub fn new(client: ApiClient, retry: RetryConfig, ttl: Duration) -> Self {
        Self {
            client,
            retry,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `content_id`, from the cache when a fresh target exists
    ///
    /// `NotFound`, `Forbidden` and `Malformed` are returned at once; transient
    /// failures go through the shared retry policy first.
    pub async fn resolve(
        &self,
        content_id: ContentId,
        session: &Session,
    ) -> Result<ResolvedTarget, ResolutionError> {
        if let Some(target) = self.cached(content_id) {
            tracing::trace!(content_id = content_id.get(), "Resolution cache hit");
            return Ok(target);
        }

        let target = with_retry(&self.retry, || self.request(content_id, session)).await?;
        self.store(target.clone());
        tracing::debug!(content_id = content_id.get(), "Content resolved");
        Ok(target)
    }

    /// Resolve a leaf node, using the URL carried by its listing when present
    pub async fn resolve_node(
        &self,
        node: &ContentNode,
        session: &Session,
    ) -> Result<ResolvedTarget, ResolutionError> {
        let Some(raw_url) = &node.raw_url else {
            return self.resolve(node.id, session).await;
        };

        if let Some(target) = self.cached(node.id) {
            return Ok(target);
        }
        url::Url::parse(raw_url).map_err(|e| ResolutionError::Malformed {
            content_id: node.id,
            reason: format!("listing URL is invalid: {e}"),
        })?;

        let target = ResolvedTarget {
            content_id: node.id,
            url: raw_url.clone(),
            resolved_at: Utc::now(),
        };
        self.store(target.clone());
        Ok(target)
    }

    /// Number of cached targets (fresh or not)
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn cached(&self, content_id: ContentId) -> Option<ResolvedTarget> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(&content_id)
            .filter(|target| target.is_fresh(self.ttl, Utc::now()))
            .cloned()
    }

    fn store(&self, target: ResolvedTarget) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(target.content_id, target);
    }

    async fn request(
        &self,
        content_id: ContentId,
        session: &Session,
    ) -> Result<ResolvedTarget, ResolutionError> {
        let id = content_id.to_string();
        let url = self
            .client
            .endpoint(&self.client.api().resolve_path, &[("content_id", id.as_str())])
            .map_err(|e| ResolutionError::Malformed {
                content_id,
                reason: e.to_string(),
            })?;

        let value = self
            .client
            .get_json(url, &[], Some(session), &[])
            .await
            .map_err(|e| classify(content_id, e))?;

        let url = data_of(&value)["url"]
            .as_str()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ResolutionError::Malformed {
                content_id,
                reason: "response carried no download URL".into(),
            })?;
        url::Url::parse(url).map_err(|e| ResolutionError::Malformed {
            content_id,
            reason: format!("download URL is invalid: {e}"),
        })?;

        Ok(ResolvedTarget {
            content_id,
            url: url.to_string(),
            resolved_at: Utc::now(),
        })
    }
}

fn classify(content_id: ContentId, err: CallError) -> ResolutionError {
    match err {
        CallError::Status { status, .. } if status == 401 || status == 403 => {
            ResolutionError::Forbidden { content_id }
        }
        CallError::Status { status, .. } if status != 429 && (400..500).contains(&status) => {
            ResolutionError::NotFound { content_id }
        }
        CallError::Status {
            status,
            retry_after,
            ..
        } => ResolutionError::Transient {
            content_id,
            reason: format!("HTTP {status}"),
            retry_after,
        },
        CallError::Timeout | CallError::Connect(_) => ResolutionError::Transient {
            content_id,
            reason: err.to_string(),
            retry_after: None,
        },
        CallError::Decode(reason) | CallError::InvalidUrl(reason) => {
            ResolutionError::Malformed { content_id, reason }
        }
    }
}
