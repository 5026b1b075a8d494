//! Catalog token discovery
//!
//! The catalog token is not exposed through the API. It is embedded in the
//! organization's public landing page and located with a pattern match.

use regex::Regex;

use crate::error::{DiscoveryError, Error, Result};
use crate::http::ApiClient;
use crate::types::CatalogToken;

/// Locates the catalog token for an organization
#[derive(Debug, Clone)]
pub struct HashResolver {
    client: ApiClient,
    pattern: Regex,
}

impl HashResolver {
    /// Create a resolver using the client's configured token pattern
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern does not compile.
    pub fn new(client: ApiClient) -> Result<Self> {
        let pattern = Regex::new(&client.api().token_pattern).map_err(|e| Error::Config {
            message: format!("invalid token pattern: {e}"),
            key: Some("api.token_pattern".to_string()),
        })?;
        Ok(Self { client, pattern })
    }

    /// Fetch the landing page for `org_code` and extract the catalog token
    ///
    /// A missing pattern and a failed fetch both end the attempt with
    /// [`DiscoveryError::TokenNotFound`]; the caller decides whether to try again.
    pub async fn resolve_catalog_token(
        &self,
        org_code: &str,
    ) -> std::result::Result<CatalogToken, DiscoveryError> {
        let not_found = |reason: String| DiscoveryError::TokenNotFound {
            org_code: org_code.to_string(),
            reason,
        };

        let url = self
            .client
            .landing_url(org_code)
            .map_err(|e| not_found(e.to_string()))?;

        let page = self
            .client
            .get_text(url)
            .await
            .map_err(|e| not_found(format!("landing page unavailable: {e}")))?;

        let token = self
            .extract(&page)
            .ok_or_else(|| not_found("token pattern not present in landing page".into()))?;

        tracing::debug!(org_code, token = ?token, "Catalog token discovered");
        Ok(token)
    }

    /// First non-empty capture of the token pattern
    fn extract(&self, page: &str) -> Option<CatalogToken> {
        self.pattern
            .captures_iter(page)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|token| !token.is_empty())
            .map(CatalogToken::new)
    }
}
