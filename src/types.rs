//! Core types for course-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

id_type!(
    /// Internal organization identifier (resolved from an org code)
    OrgId
);
id_type!(
    /// Course identifier within the catalog
    CourseId
);
id_type!(
    /// Folder identifier within a course tree
    FolderId
);
id_type!(
    /// Content node identifier, unique within a course
    ContentId
);

impl FolderId {
    /// The implicit root folder of every course
    pub const ROOT: FolderId = FolderId(0);
}

impl From<ContentId> for FolderId {
    fn from(id: ContentId) -> Self {
        FolderId(id.0)
    }
}

/// An authenticated session
///
/// Never mutated; a new session replaces an expired one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Server-issued session id (the verified challenge id)
    pub session_id: String,
    /// Organization the session belongs to
    pub org_id: OrgId,
    /// Identifier (e.g. email) the session was issued to
    pub identifier: String,
    /// When the session was issued
    pub issued_at: DateTime<Utc>,
    /// When the session stops being valid
    pub expires_at: DateTime<Utc>,
    /// Longer-lived user token, when the secondary call succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

impl Session {
    /// Whether the session is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Credential sent on authorized calls (user token when present)
    pub fn credential(&self) -> &str {
        self.user_token.as_deref().unwrap_or(&self.session_id)
    }
}

/// A pending one-time-code challenge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeHandle {
    /// Server-issued challenge id
    pub challenge_id: String,
    /// Organization code the challenge was requested for
    pub org_code: String,
    /// Resolved organization id
    pub org_id: OrgId,
    /// Identifier the code was sent to
    pub identifier: String,
    /// When the challenge was issued
    pub issued_at: DateTime<Utc>,
    /// When the challenge can no longer be resolved
    pub expires_at: DateTime<Utc>,
}

impl ChallengeHandle {
    /// Whether the challenge is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Opaque catalog token scoped to one organization
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogToken(String);

impl CatalogToken {
    /// Wrap a raw token value
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CatalogToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "CatalogToken({prefix}…)")
    }
}

/// A course as listed in the catalog
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Course id
    pub id: CourseId,
    /// Display name
    pub name: String,
    /// Listed price
    pub price: f64,
}

/// Everything needed to list a course's folders
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseAccess {
    /// Course id
    pub course_id: CourseId,
    /// Course display name (root of the output tree)
    pub name: String,
    /// Per-course listing token
    pub token: String,
}

/// Kind of a content node, decoded once from the wire `contentType` code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "lowercase")]
pub enum ContentKind {
    /// A folder that must be expanded
    Folder,
    /// A downloadable document
    Document,
    /// A test/quiz
    Test,
    /// Any other content type (kept so callers can account for it)
    Unknown(i64),
}

impl ContentKind {
    /// Decode a wire `contentType` code
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ContentKind::Folder,
            3 => ContentKind::Document,
            4 => ContentKind::Test,
            other => ContentKind::Unknown(other),
        }
    }

    /// Whether nodes of this kind are leaves
    pub fn is_leaf(&self) -> bool {
        !matches!(self, ContentKind::Folder)
    }
}

/// A node in a course tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNode {
    /// Node id
    pub id: ContentId,
    /// Display name
    pub name: String,
    /// Folder the node was listed in
    pub parent_folder_id: FolderId,
    /// Decoded kind
    pub kind: ContentKind,
    /// Direct URL carried by the listing, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
    /// Names of the folders between the course root and this node
    #[serde(default)]
    pub path: Vec<String>,
}

impl ContentNode {
    /// Whether this node is a leaf content item
    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }
}

/// A resolved, fetchable location for a content item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// Content the URL belongs to
    pub content_id: ContentId,
    /// Fetchable URL
    pub url: String,
    /// When the URL was obtained
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedTarget {
    /// Whether the target is still within `ttl` of its resolution at `now`
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now < self.resolved_at + ttl,
            Err(_) => true,
        }
    }
}

/// Status of a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for resolution
    Pending,
    /// Resolution in progress
    Resolving,
    /// Transfer in progress
    Downloading,
    /// File delivered
    Complete,
    /// Terminal failure
    Failed,
}

/// One download per leaf content id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Leaf content id
    pub content_id: ContentId,
    /// Leaf display name
    pub name: String,
    /// Where the delivered file goes
    pub destination: PathBuf,
    /// Current status
    pub status: TaskStatus,
    /// Transfer attempts made so far
    pub attempts: u32,
    /// Last error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DownloadTask {
    /// Create a pending task
    pub fn new(content_id: ContentId, name: impl Into<String>, destination: PathBuf) -> Self {
        Self {
            content_id,
            name: name.into(),
            destination,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Stable fingerprint of a resolved URL (hex SHA-256)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a URL
    pub fn of_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hex representation (also the cache file name)
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached resource on disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint of the URL the bytes came from
    pub fingerprint: Fingerprint,
    /// Cached file
    pub local_path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
}

/// Event emitted during a pipeline run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A course was selected for retrieval
    CourseSelected {
        /// Course id
        course_id: CourseId,
        /// Course name
        name: String,
    },

    /// A folder listing finished
    FolderExpanded {
        /// Folder id
        folder_id: FolderId,
        /// Number of children listed
        children: usize,
    },

    /// A folder listing failed and its branch was skipped
    FolderFailed {
        /// Folder id
        folder_id: FolderId,
        /// Error message
        error: String,
    },

    /// A leaf was resolved to a URL
    Resolved {
        /// Content id
        content_id: ContentId,
    },

    /// Transfer progress
    Progress {
        /// Content id
        content_id: ContentId,
        /// Bytes written so far
        bytes_done: u64,
        /// Declared size, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
    },

    /// A file was delivered
    DownloadComplete {
        /// Content id
        content_id: ContentId,
        /// Destination path
        path: PathBuf,
        /// Whether the bytes came from the cache
        from_cache: bool,
    },

    /// A leaf failed terminally
    DownloadFailed {
        /// Content id
        content_id: ContentId,
        /// Error message
        error: String,
    },

    /// The run finished
    Finished {
        /// Completed leaf count
        completed: usize,
        /// Failed leaf count
        failed: usize,
    },
}

/// A delivered leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedItem {
    /// Content id
    pub content_id: ContentId,
    /// Leaf name
    pub name: String,
    /// Destination path
    pub path: PathBuf,
    /// Whether the bytes came from the cache
    pub from_cache: bool,
}

/// A leaf that failed or was skipped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Content id
    pub content_id: ContentId,
    /// Leaf name
    pub name: String,
    /// Machine-readable code
    pub code: String,
    /// Human-readable reason
    pub reason: String,
}

/// A folder whose branch could not be traversed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalFailure {
    /// Folder id
    pub folder_id: FolderId,
    /// Machine-readable code
    pub code: String,
    /// Human-readable reason
    pub reason: String,
}

/// Structured outcome of a pipeline run
///
/// This is the only thing that crosses the pipeline boundary; errors are folded
/// into it rather than propagated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    /// Number of delivered leaves
    pub completed_count: usize,
    /// Delivered leaves
    pub completed: Vec<CompletedItem>,
    /// Leaves that failed terminally
    pub failed_items: Vec<FailedItem>,
    /// Leaves that were not attempted (unsupported kinds)
    pub skipped_items: Vec<FailedItem>,
    /// Folders whose branches were skipped
    pub traversal_failures: Vec<TraversalFailure>,
    /// Error that aborted the run, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    /// Whether the run was cancelled
    pub cancelled: bool,
}

impl DownloadReport {
    /// Whether every attempted leaf was delivered and nothing fatal happened
    pub fn is_success(&self) -> bool {
        self.fatal_error.is_none() && self.failed_items.is_empty() && !self.cancelled
    }
}
