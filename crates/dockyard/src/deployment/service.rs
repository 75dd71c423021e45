use std::collections::{BTreeMap, HashSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::deployment::allocator::{self, PortAllocator};
use crate::error::{EngineError, EngineResult};

pub const DEFAULT_BRANCH: &str = "master";

/// Source coordinates of one deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub repository: String,
    pub branch: String,
}

impl Service {
    /// Builds validated coordinates. An empty branch falls back to [`DEFAULT_BRANCH`].
    ///
    /// # Errors
    /// Returns [`EngineError::ConfigurationError`] when either value contains characters
    /// outside the allowlist.
    pub fn new(repository: &str, branch: &str) -> EngineResult<Self> {
        let repository = repository.trim();
        let branch = match branch.trim() {
            "" => DEFAULT_BRANCH,
            branch => branch,
        };

        validate_repository(repository)?;
        validate_branch(branch)?;

        Ok(Self {
            repository: repository.to_string(),
            branch: branch.to_string(),
        })
    }

    #[must_use]
    pub fn id(&self) -> String {
        allocator::service_id(&self.repository, &self.branch)
    }

    #[must_use]
    pub fn container_name(&self) -> String {
        allocator::container_name(&self.id())
    }

    #[must_use]
    pub fn image_name(&self) -> String {
        allocator::image_name(&self.id())
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.branch)
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::ConfigurationError(message.into())
}

/// # Errors
/// Returns an error unless the value looks like `owner/name`.
pub fn validate_repository(repository: &str) -> EngineResult<()> {
    let regex = Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$")
        .map_err(|error| invalid(format!("invalid repository validator: {error}")))?;

    if !regex.is_match(repository) {
        return Err(invalid(format!(
            "repository must look like owner/name: {repository:?}"
        )));
    }

    if repository.split('/').any(|part| part.starts_with('.')) {
        return Err(invalid(format!(
            "repository parts must not start with '.': {repository:?}"
        )));
    }

    Ok(())
}

/// # Errors
/// Returns an error when the branch is empty, contains `..`, or uses characters outside
/// `[A-Za-z0-9._/-]`.
pub fn validate_branch(branch: &str) -> EngineResult<()> {
    let regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/-]*$")
        .map_err(|error| invalid(format!("invalid branch validator: {error}")))?;

    if !regex.is_match(branch) || branch.contains("..") || branch.ends_with('/') {
        return Err(invalid(format!(
            "branch must match ^[A-Za-z0-9_][A-Za-z0-9._/-]*$: {branch:?}"
        )));
    }

    Ok(())
}

/// # Errors
/// Returns an error unless the domain is a lowercase hostname made of dot-separated labels.
pub fn validate_domain(domain: &str) -> EngineResult<()> {
    let regex = Regex::new(
        r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$",
    )
    .map_err(|error| invalid(format!("invalid domain validator: {error}")))?;

    if domain.len() > 253 || !regex.is_match(domain) {
        return Err(invalid(format!("domain must be a plain hostname: {domain:?}")));
    }

    Ok(())
}

/// # Errors
/// Returns an error when the path contains `..` or characters outside `[A-Za-z0-9._/-]`.
pub fn validate_web_socket_path(path: &str) -> EngineResult<()> {
    let regex = Regex::new(r"^[A-Za-z0-9._/-]*$")
        .map_err(|error| invalid(format!("invalid websocket path validator: {error}")))?;

    if !regex.is_match(path) || path.contains("..") {
        return Err(invalid(format!(
            "websocket path must match ^[A-Za-z0-9._/-]*$: {path:?}"
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocket {
    pub path: String,
}

/// One domain or many; `service.json` accepts both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainList {
    One(String),
    Many(Vec<String>),
}

/// Repository-supplied `service.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Manifest {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    pub env: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket: Option<WebSocket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    pub build_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_redirect: Option<bool>,
}

impl Manifest {
    /// Parses a manifest body.
    ///
    /// # Errors
    /// Returns [`EngineError::ConfigurationError`] when the body is not a valid manifest.
    pub fn from_json(body: &str) -> EngineResult<Self> {
        serde_json::from_str(body).map_err(|error| invalid(format!("malformed manifest: {error}")))
    }

    /// Declared domains, trimmed, empty entries dropped, first occurrence kept.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        let raw = match &self.domain {
            None => Vec::new(),
            Some(DomainList::One(domain)) => vec![domain.clone()],
            Some(DomainList::Many(domains)) => domains.clone(),
        };

        let mut seen = HashSet::new();
        raw.into_iter()
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .filter(|domain| seen.insert(domain.clone()))
            .collect()
    }

    /// WebSocket path without leading slashes; `None` when absent or blank.
    #[must_use]
    pub fn web_socket_path(&self) -> Option<String> {
        self.web_socket
            .as_ref()
            .map(|web_socket| web_socket.path.trim().trim_start_matches('/').to_string())
            .filter(|path| !path.is_empty())
    }

    /// Environment with every value rendered as a string; strings are taken verbatim.
    #[must_use]
    pub fn string_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(text) => text.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// Host port, optionally mapped to a different container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Single(u16),
    Mapped(u16, u16),
}

impl PortSpec {
    #[must_use]
    pub fn new(host: u16, container: u16) -> Self {
        if host == container {
            Self::Single(host)
        } else {
            Self::Mapped(host, container)
        }
    }

    #[must_use]
    pub fn host(self) -> u16 {
        match self {
            Self::Single(port) | Self::Mapped(port, _) => port,
        }
    }

    #[must_use]
    pub fn container(self) -> u16 {
        match self {
            Self::Single(port) | Self::Mapped(_, port) => port,
        }
    }

    /// `docker run -p` value bound to loopback.
    #[must_use]
    pub fn publish_arg(self) -> String {
        format!("127.0.0.1:{}:{}", self.host(), self.container())
    }
}

fn default_https_redirect() -> bool {
    true
}

/// Persisted record of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    pub id: String,
    pub repository: String,
    pub branch: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub ports: Vec<PortSpec>,
    pub domains: Vec<String>,
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_socket: Option<WebSocket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default = "default_https_redirect")]
    pub https_redirect: bool,
}

/// Inputs shared by every configuration resolution.
#[derive(Debug)]
pub struct Resolution<'a> {
    pub service_type: String,
    pub base_domain: &'a str,
    pub allocator: &'a PortAllocator,
    /// Host ports owned by other services.
    pub ports_in_use: HashSet<u16>,
}

impl ServiceConfiguration {
    /// Resolves a configuration from a manifest. `existing` keeps identity and ports stable
    /// across rebuilds; everything else follows the manifest.
    ///
    /// # Errors
    /// Returns an error when no free port is left or a declared domain or websocket path
    /// is not safe to write into a proxy site.
    pub fn resolve(
        service: &Service,
        manifest: &Manifest,
        existing: Option<&Self>,
        resolution: Resolution<'_>,
    ) -> EngineResult<Self> {
        let id = service.id();
        let mut domains = manifest.domains();
        for domain in &domains {
            validate_domain(domain)?;
        }
        let web_socket_path = manifest.web_socket_path();
        if let Some(path) = &web_socket_path {
            validate_web_socket_path(path)?;
        }

        let mut reservation = resolution.allocator.reserve(resolution.ports_in_use);

        let primary_host = match existing.and_then(Self::primary_port) {
            Some(port) => {
                reservation.keep(port.host());
                port.host()
            }
            None => reservation.next_port()?,
        };
        let existing_web_socket_port = existing.and_then(Self::web_socket_port);
        if let Some(port) = existing_web_socket_port {
            reservation.keep(port);
        }

        let container_port = manifest.port.unwrap_or(primary_host);
        let mut ports = vec![PortSpec::new(primary_host, container_port)];

        let mut env = manifest.string_env();
        env.insert("PORT".to_string(), container_port.to_string());

        let web_socket = match web_socket_path {
            Some(path) => {
                let port = match existing_web_socket_port {
                    Some(port) => port,
                    None => reservation.next_port()?,
                };
                ports.push(PortSpec::Single(port));
                env.insert("WEBSOCKET_PORT".to_string(), port.to_string());
                Some(WebSocket { path })
            }
            None => {
                env.remove("WEBSOCKET_PORT");
                None
            }
        };

        if domains.is_empty() {
            domains.push(allocator::default_domain(&id, resolution.base_domain));
        }

        Ok(Self {
            id,
            repository: service.repository.clone(),
            branch: service.branch.clone(),
            service_type: resolution.service_type,
            ports,
            domains,
            env,
            web_socket,
            memory: manifest
                .memory
                .as_deref()
                .map(str::trim)
                .filter(|memory| !memory.is_empty())
                .map(ToString::to_string),
            build_args: manifest.build_args.clone(),
            https_redirect: manifest.https_redirect.unwrap_or(true),
        })
    }

    #[must_use]
    pub fn service(&self) -> Service {
        Service {
            repository: self.repository.clone(),
            branch: self.branch.clone(),
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        allocator::container_name(&self.id)
    }

    #[must_use]
    pub fn image_name(&self) -> String {
        allocator::image_name(&self.id)
    }

    #[must_use]
    pub fn primary_port(&self) -> Option<PortSpec> {
        self.ports.first().copied()
    }

    /// Secondary host port, present only while a WebSocket path is configured.
    #[must_use]
    pub fn web_socket_port(&self) -> Option<u16> {
        self.web_socket.as_ref()?;
        self.ports.get(1).map(|port| port.host())
    }

    #[must_use]
    pub fn host_ports(&self) -> Vec<u16> {
        self.ports.iter().map(|port| port.host()).collect()
    }
}

/// Configuration plus the live state derived at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub configuration: ServiceConfiguration,
    pub name: String,
    pub online: bool,
}

impl ServiceStatus {
    #[must_use]
    pub fn new(configuration: ServiceConfiguration, running: &HashSet<String>) -> Self {
        let name = configuration.name();
        let online = running.contains(&name);
        Self {
            configuration,
            name,
            online,
        }
    }
}
