//! Custom test assertions for integration tests

use course_dl::Event;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// Every regular file below `dir`, relative to it, sorted
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

/// Assert that `path` holds exactly `expected`
pub fn assert_file_contents(path: &Path, expected: &[u8]) {
    match std::fs::read(path) {
        Ok(actual) => assert_eq!(actual, expected, "unexpected contents in {}", path.display()),
        Err(e) => panic!("{} not readable: {e}", path.display()),
    }
}

/// Assert that no partially written file is left below `dir`
pub fn assert_no_partial_files(dir: &Path) {
    let partial: Vec<_> = files_under(dir)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "part" || ext == "tmp"))
        .collect();
    assert!(partial.is_empty(), "partial files left behind: {partial:?}");
}

/// Drain events until `Finished` (or `timeout`)
pub async fn collect_events_until_finished(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let finished = matches!(event, Event::Finished { .. });
            collected.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    collected
}
