use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{SourceProvider, WebhookService, MANIFEST_FILE_NAME};
use crate::config::DockyardConfig;
use crate::deployment::{Manifest, Service};
use crate::error::{EngineError, EngineResult};

const USER_AGENT: &str = "dockyard";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    clone_url: Option<String>,
}

#[derive(Clone)]
pub struct GitHubSource {
    client: reqwest::Client,
    web_base_url: String,
    raw_base_url: String,
    token: Option<String>,
}

impl fmt::Debug for GitHubSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GitHubSource")
            .field("web_base_url", &self.web_base_url)
            .field("raw_base_url", &self.raw_base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl GitHubSource {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &DockyardConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build HTTP client: {error}"))?;

        Ok(Self {
            client,
            web_base_url: config.github_web_base_url(),
            raw_base_url: config.github_raw_base_url(),
            token: config.github_token(),
        })
    }
}

/// Strips `refs/<kind>/` from a pushed ref, keeping slashes inside the branch name.
fn branch_from_ref(git_ref: &str) -> EngineResult<String> {
    let regex = Regex::new(r"^refs/[^/]+/")
        .map_err(|error| anyhow::anyhow!("invalid ref validator: {error}"))?;
    Ok(regex.replace(git_ref, "").into_owned())
}

#[async_trait]
impl SourceProvider for GitHubSource {
    async fn exists(&self, repository: &str) -> EngineResult<bool> {
        let url = format!("{}/{repository}", self.web_base_url);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|error| anyhow::anyhow!("repository lookup failed for {url}: {error}"))?;

        Ok(response.status().is_success())
    }

    fn service_from_webhook(&self, payload: &[u8]) -> EngineResult<WebhookService> {
        let event = serde_json::from_slice::<PushEvent>(payload).map_err(|error| {
            debug!("unparseable push payload: {}", String::from_utf8_lossy(payload));
            EngineError::ConfigurationError(format!("malformed push payload: {error}"))
        })?;

        if event.repository.private {
            return Err(EngineError::ConfigurationError(format!(
                "private repositories are not allowed: {}",
                event.repository.full_name
            )));
        }

        let branch = branch_from_ref(&event.git_ref)?;
        let service = Service::new(&event.repository.full_name, &branch)?;
        let clone_url = event
            .repository
            .clone_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.clone_url(&service.repository));

        Ok(WebhookService {
            configuration_url: self.manifest_url(&service.repository, &service.branch),
            clone_url,
            service,
        })
    }

    async fn fetch_manifest(&self, url: &str) -> EngineResult<Manifest> {
        let mut request = self
            .client
            .get(url)
            .header("Pragma", "no-cache")
            .header("Cache-Control", "no-cache");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                warn!("manifest unreachable at {url}: {error}");
                return Ok(Manifest::default());
            }
        };

        if response.status() != StatusCode::OK {
            info!(
                "no service configuration found at {url} ({})",
                response.status()
            );
            return Ok(Manifest::default());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                warn!("failed reading manifest body from {url}: {error}");
                return Ok(Manifest::default());
            }
        };

        let manifest = Manifest::from_json(&body)?;
        info!("found service configuration at {url}");
        Ok(manifest)
    }

    fn clone_url(&self, repository: &str) -> String {
        format!("{}/{repository}.git", self.web_base_url)
    }

    fn manifest_url(&self, repository: &str, branch: &str) -> String {
        format!(
            "{}/{repository}/{branch}/{MANIFEST_FILE_NAME}",
            self.raw_base_url
        )
    }
}
