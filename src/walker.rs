//! Course tree traversal
//!
//! [`ContentTreeWalker`] flattens a course's folder tree into its leaf content
//! items. Expansion is breadth-first, one depth level at a time, with a bounded
//! number of listings in flight. Folder ids are marked visited when they are
//! first queued for a level, so a folder referenced from several parents (or
//! from its own subtree) is listed exactly once. With a leaf sink attached,
//! each level's new leaves are handed on in id order as soon as that level is
//! finished, so downstream work can start before the whole tree is known.
//!
//! The listing call sits behind the [`ContentSource`] trait; [`HttpContentSource`]
//! is the remote implementation.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, TraversalConfig};
use crate::error::TraversalError;
use crate::http::{ApiClient, data_of, id_of};
use crate::retry::with_retry;
use crate::types::{ContentId, ContentKind, ContentNode, CourseAccess, Event, FolderId, Session};

/// Lists the direct children of one folder
#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    /// List every child of `folder` (all pages)
    ///
    /// Returned nodes carry `parent_folder_id = folder`; the walker fills in `path`.
    async fn list_folder(
        &self,
        course: &CourseAccess,
        folder: FolderId,
        session: &Session,
    ) -> Result<Vec<ContentNode>, TraversalError>;
}

/// Remote folder listing with paging and the shared retry policy
#[derive(Debug, Clone)]
pub struct HttpContentSource {
    client: ApiClient,
    retry: RetryConfig,
    page_size: usize,
}

impl HttpContentSource {
    /// Create a source listing `page_size` children per call
    pub fn new(client: ApiClient, retry: RetryConfig, page_size: usize) -> Self {
        Self {
            client,
            retry,
            page_size: page_size.max(1),
        }
    }

    async fn fetch_page(
        &self,
        course: &CourseAccess,
        folder: FolderId,
        session: &Session,
        offset: usize,
    ) -> Result<Vec<Value>, TraversalError> {
        let unavailable = |reason: String| TraversalError::FolderUnavailable {
            folder_id: folder,
            reason,
        };

        let url = self
            .client
            .endpoint(&self.client.api().listing_path, &[("token", course.token.as_str())])
            .map_err(|e| unavailable(e.to_string()))?;
        let query = [
            ("folderId", folder.to_string()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ];

        let value = with_retry(&self.retry, || {
            self.client
                .get_json(url.clone(), &query, Some(session), &[])
        })
        .await
        .map_err(|e| unavailable(e.to_string()))?;

        match data_of(&value) {
            Value::Array(items) => Ok(items.clone()),
            Value::Null => Ok(Vec::new()),
            _ => Err(unavailable("listing data is not an array".into())),
        }
    }
}

#[async_trait::async_trait]
impl ContentSource for HttpContentSource {
    async fn list_folder(
        &self,
        course: &CourseAccess,
        folder: FolderId,
        session: &Session,
    ) -> Result<Vec<ContentNode>, TraversalError> {
        let mut children = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0;

        loop {
            let page = self.fetch_page(course, folder, session, offset).await?;
            let page_len = page.len();
            let mut fresh = 0;

            for item in &page {
                let Some(node) = decode_child(item, folder) else {
                    tracing::warn!(folder_id = folder.get(), item = %item, "Skipping listing entry without an id");
                    continue;
                };
                if seen.insert(node.id) {
                    fresh += 1;
                    children.push(node);
                }
            }

            // A short page ends the listing; so does a page with nothing new,
            // which means the origin ignored the offset.
            if page_len < self.page_size || fresh == 0 {
                break;
            }
            offset += page_len;
        }

        Ok(children)
    }
}

fn decode_child(item: &Value, parent: FolderId) -> Option<ContentNode> {
    let id = id_of(&item["id"])?;
    let name = match item["name"].as_str().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("content-{id}"),
    };
    let kind = ContentKind::from_code(id_of(&item["contentType"]).unwrap_or(0));
    let raw_url = item["url"]
        .as_str()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    Some(ContentNode {
        id: ContentId(id),
        name,
        parent_folder_id: parent,
        kind,
        raw_url,
        path: Vec::new(),
    })
}

/// Result of walking one course
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Leaf nodes, one per content id, ordered by id
    pub leaves: Vec<ContentNode>,
    /// Folders whose branch was skipped
    pub failures: Vec<TraversalError>,
    /// Number of folders listed successfully
    pub expanded: usize,
    /// Whether cancellation stopped the walk before the queue drained
    pub cancelled: bool,
}

/// A folder waiting to be listed
struct PendingFolder {
    id: FolderId,
    depth: usize,
    path: Vec<String>,
}

/// Breadth-first walker over a course tree
pub struct ContentTreeWalker {
    source: Arc<dyn ContentSource>,
    concurrency: usize,
    max_depth: usize,
    events: Option<broadcast::Sender<Event>>,
    sink: Option<mpsc::Sender<ContentNode>>,
    cancel: CancellationToken,
}

impl ContentTreeWalker {
    /// Create a walker over `source`
    pub fn new(source: Arc<dyn ContentSource>, config: &TraversalConfig) -> Self {
        Self {
            source,
            concurrency: config.expansion_concurrency.max(1),
            max_depth: config.max_depth,
            events: None,
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Emit folder events on `events`
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Send each leaf to `sink` once its depth level is finished
    ///
    /// A leaf found at depth `d` cannot be displaced by a deeper route, so it is
    /// final when level `d` completes. The sink closes when the walker is dropped.
    pub fn with_leaf_sink(mut self, sink: mpsc::Sender<ContentNode>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stop starting new listings once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Enumerate every leaf of `course`
    ///
    /// Folders are expanded one depth level at a time and each level's
    /// listings are processed in path order, so a folder reachable by several
    /// routes is always attributed to its shallowest, smallest path whatever
    /// the worker count. A failed folder is recorded in
    /// [`WalkOutcome::failures`] and its branch skipped; siblings continue.
    /// Listings already in flight when the walk is cancelled are allowed to
    /// finish.
    pub async fn walk(&self, course: &CourseAccess, session: &Session) -> WalkOutcome {
        let mut outcome = WalkOutcome::default();
        let mut visited: HashSet<FolderId> = HashSet::from([FolderId::ROOT]);
        let mut too_deep: HashSet<FolderId> = HashSet::new();
        let mut leaves: HashMap<ContentId, (usize, ContentNode)> = HashMap::new();
        let mut level = vec![PendingFolder {
            id: FolderId::ROOT,
            depth: 0,
            path: Vec::new(),
        }];

        tracing::info!(
            course_id = course.course_id.get(),
            concurrency = self.concurrency,
            max_depth = self.max_depth,
            "Walking course tree"
        );

        while !level.is_empty() {
            let (mut listed, unstarted) = self.expand_level(course, session, level).await;
            listed.sort_by(|(a, _), (b, _)| (&a.path, a.id).cmp(&(&b.path, b.id)));

            let mut next = Vec::new();
            let mut fresh = BTreeSet::new();
            for (folder, result) in listed {
                let children = match result {
                    Ok(children) => children,
                    Err(e) => {
                        tracing::warn!(folder_id = folder.id.get(), error = %e, "Folder listing failed, skipping branch");
                        self.emit(Event::FolderFailed {
                            folder_id: folder.id,
                            error: e.to_string(),
                        });
                        outcome.failures.push(e);
                        continue;
                    }
                };

                outcome.expanded += 1;
                self.emit(Event::FolderExpanded {
                    folder_id: folder.id,
                    children: children.len(),
                });
                tracing::debug!(folder_id = folder.id.get(), children = children.len(), depth = folder.depth, "Folder expanded");

                for mut node in children {
                    node.parent_folder_id = folder.id;
                    node.path = folder.path.clone();

                    if node.is_leaf() {
                        let id = node.id;
                        if keep_shallowest(&mut leaves, folder.depth, node) {
                            fresh.insert(id);
                        }
                        continue;
                    }

                    let child_id = FolderId::from(node.id);
                    if visited.contains(&child_id) {
                        tracing::debug!(folder_id = child_id.get(), "Folder already visited");
                        continue;
                    }

                    // Levels run in depth order, so no shallower route can follow
                    let depth = folder.depth + 1;
                    if depth > self.max_depth {
                        if too_deep.insert(child_id) {
                            let err = TraversalError::DepthExceeded {
                                folder_id: child_id,
                                depth,
                                max_depth: self.max_depth,
                            };
                            tracing::warn!(folder_id = child_id.get(), depth, "Maximum depth reached, not expanding");
                            self.emit(Event::FolderFailed {
                                folder_id: child_id,
                                error: err.to_string(),
                            });
                            outcome.failures.push(err);
                        }
                        continue;
                    }

                    visited.insert(child_id);
                    let mut path = folder.path.clone();
                    path.push(node.name);
                    next.push(PendingFolder {
                        id: child_id,
                        depth,
                        path,
                    });
                }
            }

            if !self.publish(&leaves, fresh).await && self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if self.cancel.is_cancelled() && (unstarted > 0 || !next.is_empty()) {
                outcome.cancelled = true;
                break;
            }
            level = next;
        }

        outcome.leaves = leaves.into_values().map(|(_, node)| node).collect();
        outcome.leaves.sort_by_key(|node| node.id);

        tracing::info!(
            course_id = course.course_id.get(),
            leaves = outcome.leaves.len(),
            expanded = outcome.expanded,
            failures = outcome.failures.len(),
            cancelled = outcome.cancelled,
            "Course tree walked"
        );
        outcome
    }

    /// List every folder of one level with at most `concurrency` calls in flight
    ///
    /// Returns the finished listings and how many folders were never started
    /// because the walk was cancelled.
    async fn expand_level(
        &self,
        course: &CourseAccess,
        session: &Session,
        level: Vec<PendingFolder>,
    ) -> (Vec<(PendingFolder, Result<Vec<ContentNode>, TraversalError>)>, usize) {
        let mut pending = VecDeque::from(level);
        let mut in_flight = FuturesUnordered::new();
        let mut listed = Vec::new();

        loop {
            while in_flight.len() < self.concurrency && !self.cancel.is_cancelled() {
                let Some(folder) = pending.pop_front() else {
                    break;
                };
                let source = &self.source;
                in_flight.push(async move {
                    let result = source.list_folder(course, folder.id, session).await;
                    (folder, result)
                });
            }

            match in_flight.next().await {
                Some(done) => listed.push(done),
                None => break,
            }
        }

        (listed, pending.len())
    }

    /// Hand `fresh` leaves to the sink in id order
    ///
    /// Returns `false` when delivery stopped early (cancelled or sink closed).
    async fn publish(
        &self,
        leaves: &HashMap<ContentId, (usize, ContentNode)>,
        fresh: BTreeSet<ContentId>,
    ) -> bool {
        let Some(sink) = &self.sink else {
            return true;
        };
        for id in fresh {
            let Some((_, node)) = leaves.get(&id) else {
                continue;
            };
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = sink.send(node.clone()) => sent.is_ok(),
            };
            if !sent {
                return false;
            }
        }
        true
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            // No subscribers is fine
            events.send(event).ok();
        }
    }
}

/// Keep one node per id: the shallowest, then lexicographically smallest path
///
/// Returns whether `node` was kept.
fn keep_shallowest(
    leaves: &mut HashMap<ContentId, (usize, ContentNode)>,
    depth: usize,
    node: ContentNode,
) -> bool {
    match leaves.get(&node.id) {
        Some((kept_depth, kept)) if (*kept_depth, &kept.path) <= (depth, &node.path) => false,
        _ => {
            leaves.insert(node.id, (depth, node));
            true
        }
    }
}
