use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/opt/dockyard/config.json";

const DEFAULT_DATA_DIR: &str = "/opt/dockyard/data";
const DEFAULT_DB_FILE_NAME: &str = "dockyard.db";
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:9999";
const DEFAULT_BASE_DOMAIN: &str = "local";
const DEFAULT_ADMIN_KEY_PATH: &str = "/opt/dockyard/.key";
const DEFAULT_DRAIN_TIMEOUT_SECONDS: u64 = 600;

const DEFAULT_IMAGES_DIR: &str = "/opt/dockyard/images";
const DEFAULT_IMAGE_TYPE: &str = "node";
const DEFAULT_MAX_MEMORY: &str = "32m";
const DEFAULT_CPUS: &str = "1";
const DEFAULT_DOCKER_BIN: &str = "docker";

const DEFAULT_NGINX_SITES_DIR: &str = "/opt/dockyard/nginx-sites";
const DEFAULT_NGINX_BIN: &str = "nginx";
const DEFAULT_SERVICE_BIN: &str = "service";

const DEFAULT_CHECKOUT_DIR: &str = "/opt/dockyard/src";

const DEFAULT_GITHUB_WEB_BASE_URL: &str = "https://github.com";
const DEFAULT_GITHUB_RAW_BASE_URL: &str = "https://raw.githubusercontent.com";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DockyardConfig {
    pub data_dir: Option<String>,
    pub database_path: Option<String>,
    pub bind_address: Option<String>,
    pub base_domain: Option<String>,
    pub admin_key_path: Option<String>,
    pub drain_timeout_seconds: Option<u64>,
    pub images: ImagesConfig,
    pub nginx: NginxConfig,
    pub self_update: SelfUpdateConfig,
    pub github: GitHubConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub dir: Option<String>,
    pub default_type: Option<String>,
    pub max_memory: Option<String>,
    pub cpus: Option<String>,
    pub docker_bin: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NginxConfig {
    pub sites_dir: Option<String>,
    pub template_path: Option<String>,
    pub nginx_bin: Option<String>,
    pub service_bin: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelfUpdateConfig {
    pub checkout_dir: Option<String>,
    pub commands: Option<Vec<Vec<String>>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub web_base_url: Option<String>,
    pub raw_base_url: Option<String>,
    pub token: Option<String>,
}

fn trimmed_or(value: Option<&str>, default: &str) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl DockyardConfig {
    /// Loads the JSON config named by `DOCKYARD_CONFIG_PATH`, or defaults when absent.
    ///
    /// # Errors
    ///
    /// This function will return an error if the config file is located but JSON contents cannot be parsed
    pub fn load() -> Result<Self> {
        let config_path = env_value("DOCKYARD_CONFIG_PATH")
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let path = Path::new(&config_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {config_path}"))?;

        let config = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse config JSON: {config_path}"))?;

        Ok(config)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(trimmed_or(self.data_dir.as_deref(), DEFAULT_DATA_DIR))
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(
                || self.data_dir().join(DEFAULT_DB_FILE_NAME),
                PathBuf::from,
            )
    }

    /// Host directory whose per-service subdirectories are bind-mounted into containers.
    #[must_use]
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir().join("services")
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        trimmed_or(self.bind_address.as_deref(), DEFAULT_BIND_ADDRESS)
    }

    #[must_use]
    pub fn base_domain(&self) -> String {
        let configured = self
            .base_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .or_else(|| env_value("DOCKYARD_DOMAIN"))
            .unwrap_or_else(|| DEFAULT_BASE_DOMAIN.to_string());

        configured.trim_end_matches('.').to_ascii_lowercase()
    }

    #[must_use]
    pub fn admin_key_path(&self) -> PathBuf {
        PathBuf::from(trimmed_or(
            self.admin_key_path.as_deref(),
            DEFAULT_ADMIN_KEY_PATH,
        ))
    }

    /// Reads the shared admin secret used to sign administrative requests.
    ///
    /// # Errors
    /// Returns an error if the key file cannot be read or is empty.
    pub fn admin_key(&self) -> Result<String> {
        let path = self.admin_key_path();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read admin key: {}", path.display()))?;
        let key = raw.trim().to_string();
        if key.is_empty() {
            anyhow::bail!("admin key file is empty: {}", path.display());
        }

        Ok(key)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(
            self.drain_timeout_seconds
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECONDS),
        )
    }

    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        PathBuf::from(trimmed_or(self.images.dir.as_deref(), DEFAULT_IMAGES_DIR))
    }

    #[must_use]
    pub fn default_image_type(&self) -> String {
        trimmed_or(self.images.default_type.as_deref(), DEFAULT_IMAGE_TYPE)
    }

    #[must_use]
    pub fn max_memory(&self) -> String {
        self.images
            .max_memory
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .or_else(|| env_value("DOCKYARD_MAX_MEMORY"))
            .unwrap_or_else(|| DEFAULT_MAX_MEMORY.to_string())
    }

    #[must_use]
    pub fn cpus(&self) -> String {
        trimmed_or(self.images.cpus.as_deref(), DEFAULT_CPUS)
    }

    #[must_use]
    pub fn docker_bin(&self) -> String {
        trimmed_or(self.images.docker_bin.as_deref(), DEFAULT_DOCKER_BIN)
    }

    #[must_use]
    pub fn nginx_sites_dir(&self) -> PathBuf {
        PathBuf::from(trimmed_or(
            self.nginx.sites_dir.as_deref(),
            DEFAULT_NGINX_SITES_DIR,
        ))
    }

    #[must_use]
    pub fn nginx_template_path(&self) -> Option<PathBuf> {
        self.nginx
            .template_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    #[must_use]
    pub fn nginx_bin(&self) -> String {
        trimmed_or(self.nginx.nginx_bin.as_deref(), DEFAULT_NGINX_BIN)
    }

    #[must_use]
    pub fn service_bin(&self) -> String {
        trimmed_or(self.nginx.service_bin.as_deref(), DEFAULT_SERVICE_BIN)
    }

    #[must_use]
    pub fn checkout_dir(&self) -> PathBuf {
        PathBuf::from(trimmed_or(
            self.self_update.checkout_dir.as_deref(),
            DEFAULT_CHECKOUT_DIR,
        ))
    }

    /// Commands run in the checkout directory before a self-reload, in order.
    #[must_use]
    pub fn update_commands(&self) -> Vec<Vec<String>> {
        self.self_update
            .commands
            .clone()
            .map(|commands| {
                commands
                    .into_iter()
                    .filter(|command| !command.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| {
                vec![vec![
                    "git".to_string(),
                    "pull".to_string(),
                    "--rebase".to_string(),
                ]]
            })
    }

    #[must_use]
    pub fn github_web_base_url(&self) -> String {
        trimmed_or(
            self.github.web_base_url.as_deref(),
            DEFAULT_GITHUB_WEB_BASE_URL,
        )
        .trim_end_matches('/')
        .to_string()
    }

    #[must_use]
    pub fn github_raw_base_url(&self) -> String {
        trimmed_or(
            self.github.raw_base_url.as_deref(),
            DEFAULT_GITHUB_RAW_BASE_URL,
        )
        .trim_end_matches('/')
        .to_string()
    }

    #[must_use]
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .or_else(|| std::env::var("DOCKYARD_GITHUB_TOKEN").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}
