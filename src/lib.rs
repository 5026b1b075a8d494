//! # course-dl
//!
//! Backend library that authenticates against a hosted course platform,
//! discovers an organization's course catalog, walks each selected course's
//! folder tree and downloads every document it finds.
//!
//! ## Design Philosophy
//!
//! course-dl is designed to be:
//! - **Bounded** - one request budget and fixed worker pools for every stage
//! - **Resumable** - transfers land in a content-addressed cache, so a rerun skips finished files
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use course_dl::{Config, OneTimeCodeSource, Pipeline, RunRequest};
//!
//! struct Prompt;
//!
//! #[async_trait::async_trait]
//! impl OneTimeCodeSource for Prompt {
//!     async fn next_code(&self, _identifier: &str) -> Option<String> {
//!         let mut line = String::new();
//!         std::io::stdin().read_line(&mut line).ok()?;
//!         Some(line.trim().to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::new(Config::with_base_url("https://api.example.com"))?;
//!
//!     let session = pipeline
//!         .credential_broker()
//!         .authenticate("abc", "me@example.com", &Prompt, 3)
//!         .await?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     tokio::spawn(course_dl::cancel_on_signal(pipeline.cancellation_token()));
//!
//!     let report = pipeline.run(RunRequest::new("abc", session)).await;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Challenge/response authentication
pub mod auth;
/// Course catalog listing and selection
pub mod catalog;
/// Configuration types
pub mod config;
/// Landing-page catalog token discovery
pub mod discovery;
/// Error types
pub mod error;
/// Byte transfer into the content cache
pub mod fetcher;
/// Shared HTTP client
pub mod http;
/// End-to-end retrieval pipeline
pub mod pipeline;
/// Shared request budget
pub mod rate_limiter;
/// Leaf content resolution
pub mod resolver;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Folder tree traversal
pub mod walker;

// Re-export commonly used types
pub use auth::{CredentialBroker, OneTimeCodeSource};
pub use catalog::CourseFilter;
pub use config::Config;
pub use error::{
    AuthError, DiscoveryError, DownloadError, Error, ResolutionError, Result, TraversalError,
};
pub use pipeline::{Pipeline, RunRequest};
pub use types::{
    CatalogEntry, ContentId, ContentKind, ContentNode, CourseId, DownloadReport, Event, FolderId,
    OrgId, Session,
};

/// Cancel `token` when the process receives a termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns early, without cancelling, if the token is cancelled elsewhere first.
///
/// # Example
///
/// ```no_run
/// use course_dl::{Config, Pipeline, cancel_on_signal};
///
/// # async fn example() -> course_dl::Result<()> {
/// let pipeline = Pipeline::new(Config::default())?;
/// tokio::spawn(cancel_on_signal(pipeline.cancellation_token()));
/// # Ok(())
/// # }
/// ```
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = wait_for_signal() => {
            tracing::info!("Cancelling run");
            token.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
