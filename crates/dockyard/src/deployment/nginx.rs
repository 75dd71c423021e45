use std::path::PathBuf;
use std::sync::Arc;

use regex::{Captures, Regex};
use tracing::{error, info, warn};

use crate::config::DockyardConfig;
use crate::deployment::service::{
    validate_domain, validate_web_socket_path, ServiceConfiguration,
};
use crate::error::EngineResult;
use crate::system::CommandRunner;

const HTTPS_REDIRECT: &str = "return 301 https://$host$request_uri;";

/// Site template used when no template file is configured. `%name%` markers are expanded
/// before `{{variables}}`.
pub const DEFAULT_TEMPLATE: &str = r"server {
    listen 80;
    server_name {{domains}};
    %httpsRedirect%

    location / {
        proxy_http_version 1.1;
        proxy_set_header Host $http_host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_pass http://localhost:{{port}};
    }
    %webSocket%
}

server {
    listen 443 ssl;
    server_name {{domains}};

    location / {
        proxy_http_version 1.1;
        proxy_set_header Host $http_host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto https;
        proxy_pass http://localhost:{{port}};
    }
    %secureWebSocket%
}
";

/// Writes one nginx site per service and reloads nginx.
#[derive(Debug, Clone)]
pub struct NginxConfigurator {
    runner: Arc<dyn CommandRunner>,
    sites_dir: PathBuf,
    template_path: Option<PathBuf>,
    nginx_bin: String,
    service_bin: String,
}

impl NginxConfigurator {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DockyardConfig) -> Self {
        Self {
            runner,
            sites_dir: config.nginx_sites_dir(),
            template_path: config.nginx_template_path(),
            nginx_bin: config.nginx_bin(),
            service_bin: config.service_bin(),
        }
    }

    #[must_use]
    pub fn site_path(&self, id: &str) -> PathBuf {
        self.sites_dir.join(format!("{id}.conf"))
    }

    async fn template(&self) -> EngineResult<String> {
        match &self.template_path {
            Some(path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Ok(DEFAULT_TEMPLATE.to_string()),
        }
    }

    /// Renders and writes `<sites_dir>/<id>.conf`.
    ///
    /// # Errors
    /// Returns an error when the template cannot be read or the site cannot be written.
    pub async fn register_service(
        &self,
        configuration: &ServiceConfiguration,
    ) -> EngineResult<PathBuf> {
        let template = self.template().await?;
        let content = render_site(&template, configuration)?;

        tokio::fs::create_dir_all(&self.sites_dir).await?;
        let path = self.site_path(&configuration.id);
        tokio::fs::write(&path, content).await?;

        info!("wrote site configuration {}", path.display());
        Ok(path)
    }

    /// Deletes the service's site. Returns whether a file was removed.
    ///
    /// # Errors
    /// Returns an error when an existing site cannot be deleted.
    pub async fn unregister_service(
        &self,
        configuration: &ServiceConfiguration,
    ) -> EngineResult<bool> {
        let path = self.site_path(&configuration.id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Deletes every generated `.conf` file and returns how many were removed.
    ///
    /// # Errors
    /// Returns an error when the sites directory cannot be read or a file cannot be deleted.
    pub async fn remove_all_sites(&self) -> EngineResult<usize> {
        if !tokio::fs::try_exists(&self.sites_dir).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.sites_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|extension| extension == "conf") {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Writes the service's site and reloads nginx. When the configuration test fails the
    /// previous site is restored, or the new one removed, and `false` is returned.
    ///
    /// # Errors
    /// Returns an error when the site cannot be rendered, written or restored.
    pub async fn publish_service(
        &self,
        configuration: &ServiceConfiguration,
    ) -> EngineResult<bool> {
        let path = self.site_path(&configuration.id);
        let previous = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };

        self.register_service(configuration).await?;
        if self.test_configuration().await {
            return Ok(self.reload_tested().await);
        }

        if let Some(content) = previous {
            tokio::fs::write(&path, content).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        warn!("rolled back site configuration {}", path.display());
        Ok(false)
    }

    async fn test_configuration(&self) -> bool {
        let test = self
            .runner
            .run_and_log(&self.nginx_bin, &["-t".to_string()], None)
            .await;
        match test {
            Ok(_) => true,
            Err(shell_error) => {
                error!("nginx configuration test failed, not reloading: {shell_error}");
                false
            }
        }
    }

    /// Validates then reloads nginx. Failures are logged and reported as `false`.
    pub async fn reload(&self) -> bool {
        self.test_configuration().await && self.reload_tested().await
    }

    async fn reload_tested(&self) -> bool {
        let args = ["nginx".to_string(), "reload".to_string()];
        match self.runner.run_and_log(&self.service_bin, &args, None).await {
            Ok(_) => true,
            Err(shell_error) => {
                error!("failed to reload nginx: {shell_error}");
                false
            }
        }
    }
}

fn web_socket_block(path: &str, secure: bool) -> String {
    let ssl_server_name = if secure {
        "\n        proxy_ssl_server_name on;"
    } else {
        ""
    };

    format!(
        "location /{path} {{
        proxy_set_header Host $http_host;{ssl_server_name}
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_read_timeout 86400;
        proxy_pass http://localhost:{{{{webSocketPort}}}};
    }}"
    )
}

/// Expands the markers and `{{variables}}` of a site template. Unknown variables render empty.
///
/// # Errors
/// Returns [`crate::error::EngineError::ConfigurationError`] when a domain or the websocket
/// path is not a plain token.
pub fn render_site(template: &str, configuration: &ServiceConfiguration) -> EngineResult<String> {
    for domain in &configuration.domains {
        validate_domain(domain)?;
    }
    if let Some(web_socket) = &configuration.web_socket {
        validate_web_socket_path(&web_socket.path)?;
    }

    let https_redirect = if configuration.https_redirect {
        HTTPS_REDIRECT
    } else {
        ""
    };
    let (web_socket, secure_web_socket) = match &configuration.web_socket {
        Some(web_socket) => (
            web_socket_block(&web_socket.path, false),
            web_socket_block(&web_socket.path, true),
        ),
        None => (String::new(), String::new()),
    };

    let expanded = template
        .replace("%httpsRedirect%", https_redirect)
        .replace("%webSocket%", &web_socket)
        .replace("%secureWebSocket%", &secure_web_socket);

    let port = configuration
        .primary_port()
        .map(|port| port.host().to_string())
        .unwrap_or_default();
    let web_socket_port = configuration
        .web_socket_port()
        .map(|port| port.to_string())
        .unwrap_or_default();
    let domains = configuration.domains.join(" ");
    let name = configuration.name();

    let variables = Regex::new(r"\{\{\s*(\w+)\s*\}\}")
        .map_err(|error| anyhow::anyhow!("invalid template variable pattern: {error}"))?;
    let rendered = variables.replace_all(&expanded, |captures: &Captures<'_>| {
        match &captures[1] {
            "id" => name.clone(),
            "port" => port.clone(),
            "webSocketPort" => web_socket_port.clone(),
            "domains" => domains.clone(),
            _ => String::new(),
        }
    });

    Ok(rendered.into_owned())
}
