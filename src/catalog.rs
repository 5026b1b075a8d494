//! Course catalog lookup
//!
//! [`CatalogClient`] lists the courses reachable through a catalog token and
//! exchanges a selected entry for the per-course token that content listing
//! calls require. Selection itself is a pure [`CourseFilter`] over the listing.

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashSet;

use crate::config::RetryConfig;
use crate::error::{DiscoveryError, Error, Result};
use crate::http::{ApiClient, data_of, id_of};
use crate::retry::with_retry;
use crate::types::{CatalogEntry, CatalogToken, CourseAccess, CourseId};

/// Header naming the organization site a course-info lookup is made for
const SITE_HEADER: &str = "tutorWebsiteDomain";

/// Catalog listing and course access
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: ApiClient,
    retry: RetryConfig,
}

impl CatalogClient {
    /// Create a catalog client
    pub fn new(client: ApiClient, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Fetch one page of at most `limit` catalog entries
    ///
    /// The returned listing decodes entries as it is iterated and cannot be
    /// restarted. An empty listing is not an error.
    pub async fn list_courses(
        &self,
        token: &CatalogToken,
        limit: usize,
    ) -> std::result::Result<CourseListing, DiscoveryError> {
        let url = self
            .client
            .endpoint(&self.client.api().catalog_path, &[("token", token.as_str())])
            .map_err(|e| DiscoveryError::CatalogUnavailable(e.to_string()))?;
        let query = [("limit", limit.to_string())];

        let value = with_retry(&self.retry, || {
            self.client.get_json(url.clone(), &query, None, &[])
        })
        .await
        .map_err(|e| DiscoveryError::CatalogUnavailable(e.to_string()))?;

        let raw = match &data_of(&value)["coursesData"] {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => {
                return Err(DiscoveryError::CatalogUnavailable(format!(
                    "expected a course array, got {}",
                    json_kind(other)
                )));
            }
        };

        tracing::debug!(entries = raw.len(), limit, "Catalog page received");
        Ok(CourseListing {
            raw: raw.into_iter().take(limit),
        })
    }

    /// Obtain the access token for a catalog entry
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::CourseTokenNotFound`] when the lookup fails or the
    /// response carries no token.
    pub async fn open_course(
        &self,
        entry: &CatalogEntry,
        org_code: &str,
    ) -> std::result::Result<CourseAccess, DiscoveryError> {
        let not_found = |reason: String| DiscoveryError::CourseTokenNotFound {
            course_id: entry.id,
            reason,
        };

        let url = self
            .client
            .endpoint(&self.client.api().course_info_path, &[])
            .map_err(|e| not_found(e.to_string()))?;
        let site = self
            .client
            .landing_url(org_code)
            .map_err(|e| not_found(e.to_string()))?;
        let query = [("courseId", entry.id.to_string())];
        let headers = [(SITE_HEADER, site.to_string())];

        let value = with_retry(&self.retry, || {
            self.client.get_json(url.clone(), &query, None, &headers)
        })
        .await
        .map_err(|e| not_found(e.to_string()))?;

        let token = data_of(&value)["hash"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| not_found("response carried no course token".into()))?;

        tracing::info!(course_id = entry.id.get(), name = %entry.name, "Course opened");
        Ok(CourseAccess {
            course_id: entry.id,
            name: entry.name.clone(),
            token: token.to_string(),
        })
    }
}

/// A single catalog page, decoded lazily
///
/// Entries without a usable id are skipped with a warning.
#[derive(Debug)]
pub struct CourseListing {
    raw: std::iter::Take<std::vec::IntoIter<Value>>,
}

impl Iterator for CourseListing {
    type Item = CatalogEntry;

    fn next(&mut self) -> Option<CatalogEntry> {
        for item in self.raw.by_ref() {
            match decode_entry(&item) {
                Some(entry) => return Some(entry),
                None => tracing::warn!(entry = %item, "Skipping catalog entry without an id"),
            }
        }
        None
    }
}

fn decode_entry(item: &Value) -> Option<CatalogEntry> {
    let id = id_of(&item["id"])?;
    let name = item["name"].as_str().unwrap_or_default().trim().to_string();
    let price = price_of(&item["finalPrice"])
        .or_else(|| price_of(&item["price"]))
        .unwrap_or(0.0);
    Some(CatalogEntry {
        id: CourseId(id),
        name,
        price,
    })
}

fn price_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Pure selection over a catalog listing
#[derive(Debug, Clone, Default)]
pub enum CourseFilter {
    /// Every entry
    #[default]
    All,
    /// Entries with one of these ids
    Ids(HashSet<CourseId>),
    /// Entries whose name matches a pattern
    NameMatches(Regex),
}

impl CourseFilter {
    /// Case-insensitive name filter
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern is not a valid regular expression.
    pub fn name_pattern(pattern: &str) -> Result<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .map(CourseFilter::NameMatches)
            .map_err(|e| Error::Config {
                message: format!("invalid course name pattern '{pattern}': {e}"),
                key: Some("course_filter".to_string()),
            })
    }

    /// Whether `entry` is selected
    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        match self {
            CourseFilter::All => true,
            CourseFilter::Ids(ids) => ids.contains(&entry.id),
            CourseFilter::NameMatches(re) => re.is_match(&entry.name),
        }
    }

    /// Keep the selected entries
    pub fn apply<I>(&self, entries: I) -> impl Iterator<Item = CatalogEntry>
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        entries.into_iter().filter(move |e| self.matches(e))
    }
}
