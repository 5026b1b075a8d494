//! Byte transfer with a content-addressed cache
//!
//! [`Fetcher::download`] delivers one resolved target to its task's destination.
//! Work on a given URL fingerprint is serialized, so concurrent tasks that alias
//! the same URL cause a single network transfer; the others copy from the cache.
//!
//! Nothing is ever written directly to a final path. Transfers stream into
//! `<cache>/<fingerprint>.part` and deliveries into a hidden `.part` file next
//! to the destination, each renamed into place only when complete. A
//! [`TempFile`] guard removes the temporary file on every other exit, including
//! cancellation dropping the transfer future mid-stream.

mod cache;

pub use cache::{ContentCache, FingerprintGuard};

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::DownloadError;
use crate::http::{ApiClient, CallError};
use crate::retry::with_retry;
use crate::types::{ContentId, DownloadTask, Event, Fingerprint, ResolvedTarget, TaskStatus};
use crate::utils::get_available_space;

/// A delivered file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Destination the file was delivered to
    pub path: PathBuf,
    /// File size in bytes
    pub bytes: u64,
    /// Whether the bytes came from the cache instead of the network
    pub from_cache: bool,
}

/// Streams resolved targets to disk through the shared cache
pub struct Fetcher {
    client: ApiClient,
    cache: Arc<ContentCache>,
    retry: RetryConfig,
    chunk_size: usize,
    events: Option<broadcast::Sender<Event>>,
    cancel: CancellationToken,
}

impl Fetcher {
    /// Create a fetcher writing in `chunk_size` blocks
    pub fn new(
        client: ApiClient,
        cache: Arc<ContentCache>,
        retry: RetryConfig,
        chunk_size: usize,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            chunk_size: chunk_size.max(1),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Emit progress events on `events`
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Abort transfers when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The shared cache
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Deliver `target` to `task.destination`
    ///
    /// Updates the task's status, attempt count and last error. Transient
    /// network failures and short bodies are retried with the shared policy.
    pub async fn download(
        &self,
        task: &mut DownloadTask,
        target: &ResolvedTarget,
    ) -> Result<FetchOutcome, DownloadError> {
        task.status = TaskStatus::Downloading;
        let mut attempts = 0;

        let result = tokio::select! {
            result = self.deliver(task.content_id, &task.destination, target, &mut attempts) => result,
            _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
        };

        task.attempts += attempts;
        match &result {
            Ok(outcome) => {
                task.status = TaskStatus::Complete;
                task.last_error = None;
                tracing::info!(
                    content_id = task.content_id.get(),
                    path = %outcome.path.display(),
                    bytes = outcome.bytes,
                    from_cache = outcome.from_cache,
                    "Download complete"
                );
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.last_error = Some(e.to_string());
                tracing::warn!(content_id = task.content_id.get(), error = %e, attempts = task.attempts, "Download failed");
            }
        }
        result
    }

    async fn deliver(
        &self,
        content_id: ContentId,
        destination: &Path,
        target: &ResolvedTarget,
        attempts: &mut u32,
    ) -> Result<FetchOutcome, DownloadError> {
        let fingerprint = Fingerprint::of_url(&target.url);
        let _held = self.cache.lock(&fingerprint).await;

        if let Some(entry) = self.cache.lookup(&fingerprint).await {
            tracing::debug!(content_id = content_id.get(), fingerprint = %fingerprint, "Cache hit");
            materialize(&entry.local_path, destination).await?;
            return Ok(FetchOutcome {
                path: destination.to_path_buf(),
                bytes: entry.size_bytes,
                from_cache: true,
            });
        }

        let bytes = with_retry(&self.retry, || {
            *attempts += 1;
            self.transfer(content_id, &target.url, &fingerprint)
        })
        .await?;

        let entry = self.cache.insert(fingerprint, bytes).await?;
        materialize(&entry.local_path, destination).await?;
        Ok(FetchOutcome {
            path: destination.to_path_buf(),
            bytes,
            from_cache: false,
        })
    }

    /// Stream `url` into the cache, returning the stored size
    async fn transfer(
        &self,
        content_id: ContentId,
        url: &str,
        fingerprint: &Fingerprint,
    ) -> Result<u64, DownloadError> {
        let response = self.client.get_stream(url).await.map_err(classify)?;
        let declared = response.content_length();
        if let Some(required) = declared {
            self.ensure_space(required)?;
        }

        let temp_path = self.cache.temp_path(fingerprint);
        let guard = TempFile::new(temp_path.clone());
        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| DownloadError::disk(&temp_path, e))?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut reported: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::NetworkError {
                reason: e.to_string(),
                retry_after: None,
            })?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::disk(&temp_path, e))?;
            written += chunk.len() as u64;

            if written - reported >= self.chunk_size as u64 {
                reported = written;
                self.progress(content_id, written, declared);
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| DownloadError::disk(&temp_path, e))?;
        drop(writer);
        if written != reported {
            self.progress(content_id, written, declared);
        }

        check_size(declared, written)?;

        let blob_path = self.cache.blob_path(fingerprint);
        tokio::fs::rename(&temp_path, &blob_path)
            .await
            .map_err(|e| DownloadError::disk(&blob_path, e))?;
        guard.keep();
        Ok(written)
    }

    fn ensure_space(&self, required: u64) -> Result<(), DownloadError> {
        match get_available_space(self.cache.dir()) {
            Ok(available) if available < required => {
                Err(DownloadError::InsufficientSpace {
                    required,
                    available,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "Free space unknown, continuing");
                Ok(())
            }
        }
    }

    fn progress(&self, content_id: ContentId, bytes_done: u64, bytes_total: Option<u64>) {
        if let Some(events) = &self.events {
            events
                .send(Event::Progress {
                    content_id,
                    bytes_done,
                    bytes_total,
                })
                .ok();
        }
    }
}

/// Copy a cached file to `destination` through a sibling temporary file
async fn materialize(source: &Path, destination: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::disk(parent, e))?;
    }

    let temp_path = sibling_temp_path(destination);
    let guard = TempFile::new(temp_path.clone());
    tokio::fs::copy(source, &temp_path)
        .await
        .map_err(|e| DownloadError::disk(&temp_path, e))?;
    tokio::fs::rename(&temp_path, destination)
        .await
        .map_err(|e| DownloadError::disk(destination, e))?;
    guard.keep();
    Ok(())
}

/// `dir/.name.part` for `dir/name`
fn sibling_temp_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!(".{name}.part"))
}

fn check_size(declared: Option<u64>, written: u64) -> Result<(), DownloadError> {
    match declared {
        Some(expected) if expected != written => Err(DownloadError::SizeMismatch {
            expected,
            actual: written,
        }),
        _ => Ok(()),
    }
}

fn classify(err: CallError) -> DownloadError {
    match err {
        CallError::Status {
            status,
            retry_after,
            ..
        } if status == 429 || status >= 500 => DownloadError::NetworkError {
            reason: format!("HTTP {status}"),
            retry_after,
        },
        CallError::Status { status, .. } => DownloadError::Rejected { status },
        CallError::Timeout | CallError::Connect(_) | CallError::Decode(_) => {
            DownloadError::NetworkError {
                reason: err.to_string(),
                retry_after: None,
            }
        }
        CallError::InvalidUrl(reason) => DownloadError::InvalidTarget { reason },
    }
}

/// Removes a temporary file when dropped unless [`TempFile::keep`] was called
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The file was renamed into place; leave it alone
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rate_limiter::RateLimiter;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use walkdir::WalkDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetcher_in(dir: &TempDir, chunk_size: usize) -> Fetcher {
        let mut config = Config::with_base_url("http://127.0.0.1");
        config.retry.initial_delay = Duration::from_millis(5);
        config.retry.max_attempts = 2;
        let client = ApiClient::new(&config, RateLimiter::unlimited()).unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("cache")).await.unwrap());
        Fetcher::new(client, cache, config.retry, chunk_size)
    }

    fn target(id: i64, url: String) -> ResolvedTarget {
        ResolvedTarget {
            content_id: ContentId(id),
            url,
            resolved_at: Utc::now(),
        }
    }

    fn task(dir: &TempDir, id: i64, name: &str) -> DownloadTask {
        DownloadTask::new(ContentId(id), name, dir.path().join("out").join(name))
    }

    fn partial_files(dir: &TempDir) -> Vec<PathBuf> {
        WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
            .collect()
    }

    #[tokio::test]
    async fn test_same_url_transfers_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 body".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_in(&dir, 4).await;
        let url = format!("{}/files/a.pdf", server.uri());

        let mut first = task(&dir, 1, "first.pdf");
        let outcome = fetcher.download(&mut first, &target(1, url.clone())).await.unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(outcome.bytes, 13);
        assert_eq!(first.status, TaskStatus::Complete);
        assert_eq!(first.attempts, 1);

        // A different content id aliasing the same URL
        let mut second = task(&dir, 2, "second.pdf");
        let outcome = fetcher.download(&mut second, &target(2, url)).await.unwrap();
        assert!(outcome.from_cache);
        assert_eq!(second.attempts, 0);

        assert_eq!(fetcher.cache().len().await, 1);
        assert_eq!(std::fs::read(&first.destination).unwrap(), b"%PDF-1.4 body");
        assert_eq!(std::fs::read(&second.destination).unwrap(), b"%PDF-1.4 body");
        assert!(partial_files(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_aliases_transfer_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/shared.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![7u8; 4096])
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_in(&dir, 1024).await;
        let url = format!("{}/files/shared.pdf", server.uri());

        let mut a = task(&dir, 1, "a.pdf");
        let mut b = task(&dir, 2, "b.pdf");
        let (ta, tb) = (target(1, url.clone()), target(2, url));
        let (ra, rb) = tokio::join!(fetcher.download(&mut a, &ta), fetcher.download(&mut b, &tb));

        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_ne!(ra.from_cache, rb.from_cache);
        assert_eq!(std::fs::read(&a.destination).unwrap().len(), 4096);
        assert_eq!(std::fs::read(&b.destination).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/missing.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_in(&dir, 16).await;
        let mut t = task(&dir, 3, "missing.pdf");
        let err = fetcher
            .download(&mut t, &target(3, format!("{}/files/missing.pdf", server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Rejected { status: 404 }));
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.last_error.is_some());
        assert!(!t.destination.exists());
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/flaky.pdf"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/flaky.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let fetcher = fetcher_in(&dir, 16).await;
        let mut t = task(&dir, 4, "flaky.pdf");
        fetcher
            .download(&mut t, &target(4, format!("{}/files/flaky.pdf", server.uri())))
            .await
            .unwrap();
        assert_eq!(t.attempts, 2);
        assert_eq!(std::fs::read(&t.destination).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_progress_events_reach_total() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/big.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10_000]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(1024);
        let fetcher = fetcher_in(&dir, 1000).await.with_events(tx);
        let mut t = task(&dir, 5, "big.pdf");
        fetcher
            .download(&mut t, &target(5, format!("{}/files/big.pdf", server.uri())))
            .await
            .unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::Progress {
                bytes_done,
                bytes_total,
                ..
            } = event
            {
                last = Some((bytes_done, bytes_total));
            }
        }
        assert_eq!(last, Some((10_000, Some(10_000))));
    }

    /// Serves a response that declares a large body, sends a few bytes, then stalls
    async fn stalling_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n")
                        .await;
                    let _ = socket.write_all(&[b'x'; 64]).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        format!("http://{addr}/stall.pdf")
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_leaves_no_partial_file() {
        let url = stalling_server().await;
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let fetcher = fetcher_in(&dir, 16)
            .await
            .with_events(tx)
            .with_cancellation(cancel.clone());

        let canceller = tokio::spawn(async move {
            // Cancel once bytes have started landing on disk
            while let Ok(event) = rx.recv().await {
                if matches!(event, Event::Progress { .. }) {
                    cancel.cancel();
                    break;
                }
            }
        });

        let mut t = task(&dir, 6, "stall.pdf");
        let err = fetcher.download(&mut t, &target(6, url)).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(!t.destination.exists());
        assert!(partial_files(&dir).is_empty());
        assert!(fetcher.cache().is_empty().await);
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(None, 10).is_ok());
        assert!(check_size(Some(10), 10).is_ok());
        assert!(matches!(
            check_size(Some(10), 4),
            Err(DownloadError::SizeMismatch { expected: 10, actual: 4 })
        ));
    }

    #[test]
    fn test_classify_transfer_errors() {
        let status = |status| CallError::Status {
            status,
            retry_after: None,
            body: String::new(),
        };
        assert!(matches!(classify(status(502)), DownloadError::NetworkError { .. }));
        assert!(matches!(classify(status(429)), DownloadError::NetworkError { .. }));
        assert!(matches!(classify(status(403)), DownloadError::Rejected { status: 403 }));
        assert!(matches!(
            classify(CallError::InvalidUrl("x".into())),
            DownloadError::InvalidTarget { .. }
        ));
    }

    #[test]
    fn test_temp_guard_removes_file_unless_kept() {
        let dir = TempDir::new().unwrap();
        let dropped = dir.path().join("a.part");
        let kept = dir.path().join("b.part");
        std::fs::write(&dropped, b"x").unwrap();
        std::fs::write(&kept, b"x").unwrap();

        drop(TempFile::new(dropped.clone()));
        TempFile::new(kept.clone()).keep();

        assert!(!dropped.exists());
        assert!(kept.exists());
    }

    #[test]
    fn test_sibling_temp_path_is_hidden() {
        assert_eq!(
            sibling_temp_path(Path::new("/out/c/Intro.pdf")),
            PathBuf::from("/out/c/.Intro.pdf.part")
        );
    }
}
