//! Where service sources and manifests come from.

use std::fmt;

use async_trait::async_trait;

use crate::deployment::{Manifest, Service};
use crate::error::EngineResult;

mod github;

pub use github::GitHubSource;

pub const MANIFEST_FILE_NAME: &str = "service.json";

/// A service announced by a push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookService {
    pub service: Service,
    pub configuration_url: String,
    pub clone_url: String,
}

#[async_trait]
pub trait SourceProvider: Send + Sync + fmt::Debug {
    /// # Errors
    /// Returns an error when the provider cannot be reached.
    async fn exists(&self, repository: &str) -> EngineResult<bool>;

    /// Extracts the pushed service from a raw webhook body.
    ///
    /// # Errors
    /// Returns an error for malformed payloads, invalid coordinates and private repositories.
    fn service_from_webhook(&self, payload: &[u8]) -> EngineResult<WebhookService>;

    /// Fetches a manifest. Missing or unreachable manifests yield [`Manifest::default`].
    ///
    /// # Errors
    /// Returns an error only when a manifest was found but could not be parsed.
    async fn fetch_manifest(&self, url: &str) -> EngineResult<Manifest>;

    fn clone_url(&self, repository: &str) -> String;

    fn manifest_url(&self, repository: &str, branch: &str) -> String;
}
