//! Pipeline entry point
//!
//! [`Pipeline::run`] chains discovery, catalog selection, traversal, resolution
//! and transfer for one organization and always returns a [`DownloadReport`].
//!
//! Leaves flow through bounded queues:
//!
//! ```text
//! walker -> [leaf queue] -> [resolve queue] -> resolve workers -> [fetch queue] -> fetch workers
//!                                                    |                                  |
//!                                                    +-------> results <---------------+
//! ```
//!
//! The walker hands on each depth level's leaves as soon as that level is
//! listed, so resolution and transfer overlap with the rest of the walk. The
//! worker pools are started once per run and shared by every course.
//!
//! Cancelling the pipeline's token stops every stage from taking new work.
//! Leaves that never reached a result are reported as failed with reason
//! `cancelled`.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialBroker;
use crate::catalog::{CatalogClient, CourseFilter};
use crate::config::Config;
use crate::discovery::HashResolver;
use crate::error::{DownloadError, Error, Result};
use crate::fetcher::{ContentCache, Fetcher};
use crate::http::ApiClient;
use crate::rate_limiter::RateLimiter;
use crate::resolver::DownloadResolver;
use crate::types::{
    CatalogEntry, CompletedItem, ContentId, ContentKind, ContentNode, CourseAccess, DownloadReport,
    DownloadTask, Event, FailedItem, ResolvedTarget, Session, TaskStatus, TraversalFailure,
};
use crate::utils::{claim_destination, destination_for};
use crate::walker::{ContentTreeWalker, HttpContentSource, WalkOutcome};

/// Event channel capacity; slow subscribers miss events rather than stall the run
const EVENT_CAPACITY: usize = 1024;

/// Code and reason recorded for leaves stopped by cancellation
const CANCELLED: &str = "cancelled";

/// What to retrieve
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Organization code
    pub org_code: String,
    /// Authenticated session
    pub session: Session,
    /// Which catalog entries to retrieve
    pub filter: CourseFilter,
    /// Catalog page size
    pub catalog_limit: usize,
}

impl RunRequest {
    /// Retrieve every course of `org_code` visible in the first 100 catalog entries
    pub fn new(org_code: impl Into<String>, session: Session) -> Self {
        Self {
            org_code: org_code.into(),
            session,
            filter: CourseFilter::All,
            catalog_limit: 100,
        }
    }

    /// Restrict the run to matching courses
    pub fn with_filter(mut self, filter: CourseFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// The retrieval pipeline for one configuration
pub struct Pipeline {
    config: Arc<Config>,
    client: ApiClient,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate `config` and build the shared client and rate limiter
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::new(&config.rate_limit);
        let client = ApiClient::new(&config, limiter)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            client,
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Broker sharing this pipeline's client and request budget
    pub fn credential_broker(&self) -> CredentialBroker {
        CredentialBroker::new(self.client.clone(), self.config.auth.clone())
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Run events as a [`futures::Stream`]
    pub fn event_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Token that cancels this pipeline (see [`crate::cancel_on_signal`])
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop taking new work
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Retrieve everything `request` selects
    ///
    /// Never fails: authentication and discovery problems land in
    /// [`DownloadReport::fatal_error`], per-folder and per-leaf problems in the
    /// report's failure lists.
    pub async fn run(&self, request: RunRequest) -> DownloadReport {
        let mut report = DownloadReport::default();

        if let Err(e) = self.execute(&request, &mut report).await {
            tracing::error!(org_code = %request.org_code, error = %e, code = e.code(), "Run aborted");
            report.fatal_error = Some(e.to_string());
        }

        report.cancelled |= self.cancel.is_cancelled();
        report.completed.sort_by_key(|item| item.content_id);
        report.failed_items.sort_by_key(|item| item.content_id);
        report.skipped_items.sort_by_key(|item| item.content_id);
        report.completed_count = report.completed.len();

        self.emit(Event::Finished {
            completed: report.completed_count,
            failed: report.failed_items.len(),
        });
        tracing::info!(
            org_code = %request.org_code,
            completed = report.completed_count,
            failed = report.failed_items.len(),
            skipped = report.skipped_items.len(),
            traversal_failures = report.traversal_failures.len(),
            cancelled = report.cancelled,
            "Run finished"
        );
        report
    }

    async fn execute(&self, request: &RunRequest, report: &mut DownloadReport) -> Result<()> {
        ensure_live(&request.session)?;

        let token = HashResolver::new(self.client.clone())?
            .resolve_catalog_token(&request.org_code)
            .await?;

        let catalog = CatalogClient::new(self.client.clone(), self.config.retry.clone());
        let listing = catalog.list_courses(&token, request.catalog_limit).await?;
        let selected: Vec<_> = request.filter.apply(listing).collect();
        if selected.is_empty() {
            tracing::warn!(org_code = %request.org_code, "No catalog entry selected");
            return Ok(());
        }

        let download = &self.config.download;
        let cache = Arc::new(ContentCache::open(&download.cache_dir).await?);
        let stages = Stages {
            resolver: Arc::new(DownloadResolver::new(
                self.client.clone(),
                self.config.retry.clone(),
                download.resolution_ttl,
            )),
            fetcher: Arc::new(
                Fetcher::new(
                    self.client.clone(),
                    cache,
                    self.config.retry.clone(),
                    download.chunk_size,
                )
                .with_events(self.events.clone())
                .with_cancellation(self.cancel.clone()),
            ),
        };

        let (resolve_tx, resolve_rx) = mpsc::channel::<Job>(download.queue_capacity);
        let (workers, results) = self.spawn_workers(resolve_rx, &request.session, &stages);

        let mut pending = HashMap::new();
        let fed = self
            .feed_courses(selected, &catalog, request, &resolve_tx, &mut pending, report)
            .await;
        drop(resolve_tx);

        self.collect(workers, results, pending, report).await;
        fed
    }

    /// Walk each selected course, queueing leaves for resolution level by level
    async fn feed_courses(
        &self,
        selected: Vec<CatalogEntry>,
        catalog: &CatalogClient,
        request: &RunRequest,
        resolve_tx: &mpsc::Sender<Job>,
        pending: &mut HashMap<ContentId, String>,
        report: &mut DownloadReport,
    ) -> Result<()> {
        let mut claimed_paths = HashSet::new();
        let mut seen_leaves = HashSet::new();

        for entry in selected {
            if self.cancel.is_cancelled() {
                break;
            }
            ensure_live(&request.session)?;

            let course = catalog.open_course(&entry, &request.org_code).await?;
            self.emit(Event::CourseSelected {
                course_id: course.course_id,
                name: course.name.clone(),
            });

            let (leaf_tx, leaf_rx) = mpsc::channel(self.config.download.queue_capacity);
            let walk = self.walk_course(&course, &request.session, leaf_tx);
            let feed = async {
                // Owned here so a stopped feed closes the leaf queue
                let mut leaf_rx = leaf_rx;
                while let Some(node) = leaf_rx.recv().await {
                    let Some(job) =
                        self.prepare_job(&course, node, report, &mut seen_leaves, &mut claimed_paths)
                    else {
                        continue;
                    };
                    pending.insert(job.node.id, job.node.name.clone());

                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => false,
                        sent = resolve_tx.send(job) => sent.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
            };
            let (outcome, ()) = tokio::join!(walk, feed);

            report.cancelled |= outcome.cancelled;
            report
                .traversal_failures
                .extend(outcome.failures.iter().map(|e| TraversalFailure {
                    folder_id: e.folder_id(),
                    code: e.code().to_string(),
                    reason: e.to_string(),
                }));
        }

        Ok(())
    }

    /// Walk one course, sending its leaves to `leaves` as each depth level completes
    async fn walk_course(
        &self,
        course: &CourseAccess,
        session: &Session,
        leaves: mpsc::Sender<ContentNode>,
    ) -> WalkOutcome {
        let source = HttpContentSource::new(
            self.client.clone(),
            self.config.retry.clone(),
            self.config.traversal.page_size,
        );
        let walker = ContentTreeWalker::new(Arc::new(source), &self.config.traversal)
            .with_events(self.events.clone())
            .with_leaf_sink(leaves)
            .with_cancellation(self.cancel.clone());
        walker.walk(course, session).await
    }

    /// Turn a walked leaf into a job, or record why it is skipped
    ///
    /// Leaves already seen in this run (from an earlier course or level) yield nothing.
    fn prepare_job(
        &self,
        course: &CourseAccess,
        node: ContentNode,
        report: &mut DownloadReport,
        seen_leaves: &mut HashSet<ContentId>,
        claimed_paths: &mut HashSet<std::path::PathBuf>,
    ) -> Option<Job> {
        if !seen_leaves.insert(node.id) {
            return None;
        }
        if let ContentKind::Unknown(code) = node.kind {
            report.skipped_items.push(FailedItem {
                content_id: node.id,
                name: node.name.clone(),
                code: "unsupported".to_string(),
                reason: format!("unsupported content type {code}"),
            });
            return None;
        }

        let destination = claim_destination(
            destination_for(&self.config.download.output_dir, &course.name, &node),
            claimed_paths,
        );
        let task = DownloadTask::new(node.id, node.name.clone(), destination);
        Some(Job { node, task })
    }

    /// Start the resolve and fetch pools reading from `resolve_rx`
    ///
    /// The pools live for the whole run; they stop once the resolve queue is
    /// closed and drained, or on cancellation.
    fn spawn_workers(
        &self,
        resolve_rx: mpsc::Receiver<Job>,
        session: &Session,
        stages: &Stages,
    ) -> (Vec<JoinHandle<()>>, mpsc::UnboundedReceiver<JobResult>) {
        let download = &self.config.download;
        let (fetch_tx, fetch_rx) = mpsc::channel::<(Job, ResolvedTarget)>(download.queue_capacity);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let resolve_rx = Arc::new(Mutex::new(resolve_rx));
        let fetch_rx = Arc::new(Mutex::new(fetch_rx));

        let ctx = WorkerContext {
            session: Arc::new(session.clone()),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            results: results_tx,
        };

        let mut handles = Vec::new();
        for worker_id in 0..download.resolve_concurrency {
            handles.push(tokio::spawn(resolve_worker(
                worker_id,
                Arc::clone(&resolve_rx),
                fetch_tx.clone(),
                Arc::clone(&stages.resolver),
                ctx.clone(),
            )));
        }
        drop(fetch_tx);

        for worker_id in 0..download.download_concurrency {
            handles.push(tokio::spawn(fetch_worker(
                worker_id,
                Arc::clone(&fetch_rx),
                Arc::clone(&stages.fetcher),
                ctx.clone(),
            )));
        }

        (handles, results_rx)
    }

    /// Wait for the pools and fold their results into `report`
    ///
    /// Anything still in `pending` afterwards never reached a result.
    async fn collect(
        &self,
        workers: Vec<JoinHandle<()>>,
        mut results: mpsc::UnboundedReceiver<JobResult>,
        mut pending: HashMap<ContentId, String>,
        report: &mut DownloadReport,
    ) {
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline worker panicked");
            }
        }

        while let Some(result) = results.recv().await {
            match result {
                JobResult::Completed(item) => {
                    pending.remove(&item.content_id);
                    report.completed.push(item);
                }
                JobResult::Failed(item) => {
                    pending.remove(&item.content_id);
                    report.failed_items.push(item);
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        for (content_id, name) in pending {
            let (code, reason) = if cancelled {
                (CANCELLED, CANCELLED.to_string())
            } else {
                ("internal", "worker stopped before finishing".to_string())
            };
            report.failed_items.push(FailedItem {
                content_id,
                name,
                code: code.to_string(),
                reason,
            });
        }
    }

    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}

/// Shared stage components for one run
struct Stages {
    resolver: Arc<DownloadResolver>,
    fetcher: Arc<Fetcher>,
}

/// One leaf on its way through the queues
struct Job {
    node: ContentNode,
    task: DownloadTask,
}

impl Job {
    fn failed(&self, code: &str, reason: String) -> FailedItem {
        FailedItem {
            content_id: self.node.id,
            name: self.node.name.clone(),
            code: code.to_string(),
            reason,
        }
    }
}

enum JobResult {
    Completed(CompletedItem),
    Failed(FailedItem),
}

#[derive(Clone)]
struct WorkerContext {
    session: Arc<Session>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<JobResult>,
}

impl WorkerContext {
    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }

    fn fail(&self, job: &Job, code: &str, reason: String) {
        self.emit(Event::DownloadFailed {
            content_id: job.node.id,
            error: reason.clone(),
        });
        self.results.send(JobResult::Failed(job.failed(code, reason))).ok();
    }
}

/// Take the next item unless the run is cancelled
async fn next_item<T>(queue: &Mutex<mpsc::Receiver<T>>, cancel: &CancellationToken) -> Option<T> {
    if cancel.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = async { queue.lock().await.recv().await } => item,
    }
}

async fn resolve_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    fetch_queue: mpsc::Sender<(Job, ResolvedTarget)>,
    resolver: Arc<DownloadResolver>,
    ctx: WorkerContext,
) {
    tracing::debug!(worker_id, "Resolve worker started");

    while let Some(mut job) = next_item(&queue, &ctx.cancel).await {
        job.task.status = TaskStatus::Resolving;

        let target = match resolver.resolve_node(&job.node, &ctx.session).await {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(content_id = job.node.id.get(), error = %e, "Resolution failed");
                job.task.status = TaskStatus::Failed;
                ctx.fail(&job, e.code(), e.to_string());
                continue;
            }
        };
        ctx.emit(Event::Resolved {
            content_id: job.node.id,
        });

        let queued = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => false,
            sent = fetch_queue.send((job, target)) => sent.is_ok(),
        };
        if !queued {
            break;
        }
    }

    tracing::debug!(worker_id, "Resolve worker stopped");
}

async fn fetch_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<(Job, ResolvedTarget)>>>,
    fetcher: Arc<Fetcher>,
    ctx: WorkerContext,
) {
    tracing::debug!(worker_id, "Fetch worker started");

    while let Some((mut job, target)) = next_item(&queue, &ctx.cancel).await {
        match fetcher.download(&mut job.task, &target).await {
            Ok(outcome) => {
                ctx.emit(Event::DownloadComplete {
                    content_id: job.node.id,
                    path: outcome.path.clone(),
                    from_cache: outcome.from_cache,
                });
                ctx.results
                    .send(JobResult::Completed(CompletedItem {
                        content_id: job.node.id,
                        name: job.node.name.clone(),
                        path: outcome.path,
                        from_cache: outcome.from_cache,
                    }))
                    .ok();
            }
            Err(DownloadError::Cancelled) => {
                ctx.fail(&job, CANCELLED, CANCELLED.to_string());
            }
            Err(e) => ctx.fail(&job, e.code(), e.to_string()),
        }
    }

    tracing::debug!(worker_id, "Fetch worker stopped");
}

fn ensure_live(session: &Session) -> Result<()> {
    if session.is_expired(Utc::now()) {
        return Err(Error::SessionExpired {
            expired_at: session.expires_at,
        });
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrgId;
    use tempfile::TempDir;
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(valid_for: chrono::Duration) -> Session {
        let now = Utc::now();
        Session {
            session_id: "sess".into(),
            org_id: OrgId(42),
            identifier: "me@example.com".into(),
            issued_at: now - chrono::Duration::hours(1),
            expires_at: now + valid_for,
            user_token: None,
        }
    }

    fn pipeline_for(server: &MockServer, dir: &TempDir) -> Pipeline {
        let mut config = Config::with_base_url(server.uri());
        config.api.landing_url = format!("{}/site/{{org}}", server.uri());
        config.download.output_dir = dir.path().join("out");
        config.download.cache_dir = dir.path().join("cache");
        Pipeline::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::with_base_url("http://localhost");
        config.download.queue_capacity = 0;
        assert!(matches!(Pipeline::new(config), Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_expired_session_is_fatal_without_calls() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let pipeline = pipeline_for(&server, &dir);
        let mut events = pipeline.subscribe();

        let report = pipeline
            .run(RunRequest::new("abc", session(-chrono::Duration::minutes(1))))
            .await;

        assert!(report.fatal_error.unwrap().contains("session expired"));
        assert_eq!(report.completed_count, 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Finished { completed: 0, failed: 0 }
        ));
    }

    #[tokio::test]
    async fn test_event_stream_yields_run_events() {
        use futures::StreamExt;

        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline_for(&server, &dir);
        let mut stream = pipeline.event_stream();

        pipeline
            .run(RunRequest::new("abc", session(-chrono::Duration::minutes(1))))
            .await;

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::Finished { completed: 0, failed: 0 }));
    }

    #[tokio::test]
    async fn test_missing_catalog_token_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let report = pipeline_for(&server, &dir)
            .run(RunRequest::new("abc", session(chrono::Duration::hours(1))))
            .await;

        let fatal = report.fatal_error.unwrap();
        assert!(fatal.contains("catalog token not found"), "{fatal}");
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_reports_cancellation() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let pipeline = pipeline_for(&server, &dir);
        pipeline.cancel();

        // Cancellation does not skip the session check, so use an expired one
        // to avoid any network call
        let report = pipeline
            .run(RunRequest::new("abc", session(-chrono::Duration::minutes(1))))
            .await;
        assert!(report.cancelled);
        assert!(!report.is_success());
    }
}
