//! Error types for course-dl
//!
//! This module provides the error taxonomy for the retrieval pipeline:
//! - Domain-specific error types (auth, discovery, traversal, resolution, download)
//! - A top-level [`Error`] that every domain error converts into
//! - Machine-readable error codes used in the final [`DownloadReport`](crate::types::DownloadReport)
//!
//! Propagation policy: [`AuthError`] and [`DiscoveryError`] are fatal to a run.
//! [`TraversalError`] and permanent [`ResolutionError`]s are recorded per node.
//! [`DownloadError`] is retried under the shared policy before being recorded.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ContentId, CourseId, FolderId};

/// Result type alias for course-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for course-dl
///
/// Each variant wraps one stage of the pipeline or a lower-level failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "api.base_url")
        key: Option<String>,
    },

    /// Authentication failed
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Catalog token or course token could not be discovered
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Folder expansion failed
    #[error("traversal error: {0}")]
    Traversal(#[from] TraversalError),

    /// Download location could not be resolved
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Byte transfer failed
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session is past its expiry time
    #[error("session expired at {expired_at}")]
    SessionExpired {
        /// When the session stopped being valid
        expired_at: chrono::DateTime<chrono::Utc>,
    },
}

impl Error {
    /// Machine-readable error code used in reports
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Auth(e) => e.code(),
            Error::Discovery(e) => e.code(),
            Error::Traversal(e) => e.code(),
            Error::Resolution(e) => e.code(),
            Error::Download(e) => e.code(),
            Error::Io(_) => "io",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::SessionExpired { .. } => "session_expired",
        }
    }
}

/// Authentication (challenge/response) errors
///
/// None of these are retried automatically. `InvalidCode` may be retried by the
/// caller with a different code; `ChallengeExpired` requires a new challenge.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The organization code does not resolve to an organization id
    #[error("organization code '{org_code}' could not be resolved")]
    InvalidOrg {
        /// The organization code that was looked up
        org_code: String,
    },

    /// The origin signalled quota exhaustion
    #[error("rate limited by origin{}", fmt_retry_after(.retry_after))]
    RateLimited {
        /// How long the origin asked us to wait, when it said
        retry_after: Option<Duration>,
    },

    /// The challenge is no longer valid and must be reacquired
    #[error("challenge expired")]
    ChallengeExpired,

    /// The submitted one-time code was rejected
    #[error("invalid one-time code")]
    InvalidCode,

    /// The caller's attempt budget ran out while codes kept being rejected
    #[error("no valid code after {attempts} attempts")]
    AttemptsExhausted {
        /// Number of codes that were submitted
        attempts: u32,
    },

    /// The one-time-code collaborator produced no code
    #[error("no one-time code received for {identifier}")]
    CodeUnavailable {
        /// Identifier the code was expected for
        identifier: String,
    },

    /// The origin could not be reached or answered with an unexpected shape
    #[error("authentication endpoint unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidOrg { .. } => "auth.invalid_org",
            AuthError::RateLimited { .. } => "auth.rate_limited",
            AuthError::ChallengeExpired => "auth.challenge_expired",
            AuthError::InvalidCode => "auth.invalid_code",
            AuthError::AttemptsExhausted { .. } => "auth.attempts_exhausted",
            AuthError::CodeUnavailable { .. } => "auth.code_unavailable",
            AuthError::Unavailable(_) => "auth.unavailable",
        }
    }
}

/// Catalog discovery errors (fatal to the run)
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The landing page did not contain a catalog token
    #[error("catalog token not found for organization '{org_code}': {reason}")]
    TokenNotFound {
        /// The organization whose landing page was fetched
        org_code: String,
        /// Why the token was not found (missing pattern, HTTP status, transport failure)
        reason: String,
    },

    /// The catalog listing call failed
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The per-course access token could not be obtained
    #[error("course token not found for course {course_id}: {reason}")]
    CourseTokenNotFound {
        /// Course whose token was requested
        course_id: CourseId,
        /// Why the lookup failed
        reason: String,
    },
}

impl DiscoveryError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            DiscoveryError::TokenNotFound { .. } => "discovery.token_not_found",
            DiscoveryError::CatalogUnavailable(_) => "discovery.catalog_unavailable",
            DiscoveryError::CourseTokenNotFound { .. } => "discovery.course_token_not_found",
        }
    }
}

/// Folder traversal errors (recorded per folder, never fatal)
#[derive(Debug, Clone, Error)]
pub enum TraversalError {
    /// The folder listing could not be fetched or decoded
    #[error("folder {folder_id} unavailable: {reason}")]
    FolderUnavailable {
        /// Folder whose listing failed
        folder_id: FolderId,
        /// Why the listing failed
        reason: String,
    },

    /// The folder lies deeper than the configured maximum depth
    #[error("folder {folder_id} at depth {depth} exceeds maximum depth {max_depth}")]
    DepthExceeded {
        /// Folder that was not expanded
        folder_id: FolderId,
        /// Depth the folder was found at
        depth: usize,
        /// Configured maximum depth
        max_depth: usize,
    },
}

impl TraversalError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            TraversalError::FolderUnavailable { .. } => "traversal.folder_unavailable",
            TraversalError::DepthExceeded { .. } => "traversal.depth_exceeded",
        }
    }

    /// The folder this error belongs to
    pub fn folder_id(&self) -> FolderId {
        match self {
            TraversalError::FolderUnavailable { folder_id, .. }
            | TraversalError::DepthExceeded { folder_id, .. } => *folder_id,
        }
    }
}

/// Download-location resolution errors
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    /// The content does not exist (permanent)
    #[error("content {content_id} not found")]
    NotFound {
        /// Content that was resolved
        content_id: ContentId,
    },

    /// The session is not entitled to this content (permanent)
    #[error("access to content {content_id} forbidden")]
    Forbidden {
        /// Content that was resolved
        content_id: ContentId,
    },

    /// Network failure, timeout, 5xx or 429 (retryable)
    #[error("transient failure resolving content {content_id}: {reason}")]
    Transient {
        /// Content that was resolved
        content_id: ContentId,
        /// What went wrong
        reason: String,
        /// Explicit wait requested by the origin
        retry_after: Option<Duration>,
    },

    /// The response did not have the expected structure (permanent)
    #[error("malformed resolution response for content {content_id}: {reason}")]
    Malformed {
        /// Content that was resolved
        content_id: ContentId,
        /// What was wrong with the response
        reason: String,
    },
}

impl ResolutionError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ResolutionError::NotFound { .. } => "resolution.not_found",
            ResolutionError::Forbidden { .. } => "resolution.forbidden",
            ResolutionError::Transient { .. } => "resolution.transient",
            ResolutionError::Malformed { .. } => "resolution.malformed",
        }
    }

    /// Whether the failure is permanent for this content item
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ResolutionError::Transient { .. })
    }
}

/// Byte transfer errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection failure, timeout, 5xx or 429 while transferring
    #[error("network error: {reason}")]
    NetworkError {
        /// What went wrong
        reason: String,
        /// Explicit wait requested by the origin
        retry_after: Option<Duration>,
    },

    /// The origin refused the transfer with a permanent 4xx status
    #[error("transfer rejected with HTTP {status}")]
    Rejected {
        /// HTTP status code
        status: u16,
    },

    /// Local filesystem failure
    #[error("disk error at {path}: {source}")]
    DiskError {
        /// Path being written or moved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The number of bytes received differs from the declared size
    #[error("size mismatch: expected {expected} bytes, received {actual} bytes")]
    SizeMismatch {
        /// Declared content length
        expected: u64,
        /// Bytes actually written
        actual: u64,
    },

    /// Not enough free space for the declared size
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required
        required: u64,
        /// Number of bytes available
        available: u64,
    },

    /// The resolved URL cannot be requested at all
    #[error("invalid transfer target: {reason}")]
    InvalidTarget {
        /// Why the target is unusable
        reason: String,
    },

    /// The transfer was cancelled and its temporary file removed
    #[error("transfer cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::NetworkError { .. } => "download.network",
            DownloadError::Rejected { .. } => "download.rejected",
            DownloadError::DiskError { .. } => "download.disk",
            DownloadError::SizeMismatch { .. } => "download.size_mismatch",
            DownloadError::InsufficientSpace { .. } => "download.insufficient_space",
            DownloadError::InvalidTarget { .. } => "download.invalid_target",
            DownloadError::Cancelled => "download.cancelled",
        }
    }

    pub(crate) fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::DiskError {
            path: path.into(),
            source,
        }
    }
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}
