use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::DockyardConfig;
use crate::deployment::service::ServiceConfiguration;
use crate::error::{EngineError, EngineResult};
use crate::system::{CommandOutput, CommandRunner, ShellError};

pub const CONTAINER_DATA_DIR: &str = "/opt/data";
const STOP_TIMEOUT_SECONDS: &str = "2";

/// Builds images and runs containers through the docker CLI.
#[derive(Debug, Clone)]
pub struct ImageManager {
    runner: Arc<dyn CommandRunner>,
    docker_bin: String,
    images_dir: PathBuf,
    volumes_dir: PathBuf,
    default_type: String,
    max_memory: String,
    cpus: String,
}

impl ImageManager {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DockyardConfig) -> Self {
        Self {
            runner,
            docker_bin: config.docker_bin(),
            images_dir: config.images_dir(),
            volumes_dir: config.volumes_dir(),
            default_type: config.default_image_type(),
            max_memory: config.max_memory(),
            cpus: config.cpus(),
        }
    }

    /// Service types with a build recipe: every subdirectory of the images directory.
    ///
    /// # Errors
    /// Returns an error if the images directory exists but cannot be listed.
    pub fn available_types(&self) -> EngineResult<BTreeSet<String>> {
        if !self.images_dir.exists() {
            return Ok(BTreeSet::new());
        }

        let mut types = BTreeSet::new();
        for entry in std::fs::read_dir(&self.images_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                types.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(types)
    }

    /// Picks the requested type when it has a recipe, else the configured default.
    ///
    /// # Errors
    /// Returns [`EngineError::ConfigurationError`] when neither has a recipe.
    pub fn resolve_type(&self, requested: Option<&str>) -> EngineResult<String> {
        let available = self.available_types()?;
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());

        if let Some(requested) = requested {
            if available.contains(requested) {
                return Ok(requested.to_string());
            }
            warn!(
                "unknown service type {requested:?}, falling back to {:?}",
                self.default_type
            );
        }

        if available.contains(&self.default_type) {
            return Ok(self.default_type.clone());
        }

        Err(EngineError::ConfigurationError(format!(
            "no build recipe for service type {:?} and no usable default in {}",
            requested.unwrap_or(&self.default_type),
            self.images_dir.display()
        )))
    }

    fn recipe_dir(&self, service_type: &str) -> Option<PathBuf> {
        let plain_name = !service_type.is_empty()
            && !matches!(service_type, "." | "..")
            && !service_type.contains(['/', '\\']);
        let dir = self.images_dir.join(service_type);
        (plain_name && dir.is_dir()).then_some(dir)
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput, ShellError> {
        self.runner.run_and_log(&self.docker_bin, &args, None).await
    }

    /// Builds and tags the service image from its type's recipe directory.
    ///
    /// # Errors
    /// Returns [`EngineError::BuildFailure`] if the type has no recipe or the builder fails.
    pub async fn build_image(
        &self,
        configuration: &ServiceConfiguration,
        clone_url: &str,
    ) -> EngineResult<()> {
        let image = configuration.image_name();
        let Some(recipe) = self.recipe_dir(&configuration.service_type) else {
            return Err(EngineError::BuildFailure {
                image,
                output: format!("invalid service type: {}", configuration.service_type),
            });
        };

        let cache_buster = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        let mut build_args = vec![format!("CACHEBUSTER={cache_buster}")];
        build_args.extend(
            configuration
                .build_args
                .iter()
                .map(|(name, value)| format!("{name}={value}")),
        );
        build_args.push(format!("GIT_URL={clone_url}"));
        build_args.push(format!("GIT_BRANCH={}", configuration.branch));

        let mut args = vec!["build".to_string(), "--quiet".to_string()];
        for build_arg in build_args {
            args.push("--build-arg".to_string());
            args.push(build_arg);
        }
        args.push("-t".to_string());
        args.push(image.clone());
        args.push(recipe.to_string_lossy().into_owned());

        self.docker(args)
            .await
            .map(|_| ())
            .map_err(|error| EngineError::BuildFailure {
                image,
                output: error.stderr(),
            })
    }

    fn volume_dir(&self, configuration: &ServiceConfiguration) -> PathBuf {
        self.volumes_dir.join(&configuration.id)
    }

    /// Replaces any container of the same name with a detached one.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when the old container cannot be stopped or the
    /// new one cannot be started.
    pub async fn run_service(&self, configuration: &ServiceConfiguration) -> EngineResult<()> {
        let name = configuration.name();
        self.stop_service(&name).await?;

        let volume = self.volume_dir(configuration);
        tokio::fs::create_dir_all(&volume).await?;

        let mut args = vec!["run".to_string(), "--rm".to_string(), "-d".to_string()];
        for port in &configuration.ports {
            args.push("-p".to_string());
            args.push(port.publish_arg());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{CONTAINER_DATA_DIR}", volume.display()));
        args.push("--name".to_string());
        args.push(name.clone());
        args.extend(env_args(configuration, true));
        args.push(format!(
            "--memory={}",
            configuration.memory.as_deref().unwrap_or(&self.max_memory)
        ));
        args.push(format!("--cpus={}", self.cpus));
        args.push(configuration.image_name());

        self.docker(args)
            .await
            .map(|_| info!("started container {name}"))
            .map_err(|error| EngineError::RuntimeFailure {
                container: name,
                reason: error.stderr(),
            })
    }

    /// Runs the image in the foreground and returns what it printed.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when the container exits non-zero.
    pub async fn run_foreground(
        &self,
        configuration: &ServiceConfiguration,
    ) -> EngineResult<CommandOutput> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(env_args(configuration, false));
        args.push(configuration.image_name());

        self.docker(args)
            .await
            .map_err(|error| EngineError::RuntimeFailure {
                container: configuration.name(),
                reason: error.stderr(),
            })
    }

    /// Stops the container when running, otherwise clears a stale one. Absent containers are fine.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when docker refuses either step.
    pub async fn stop_service(&self, name: &str) -> EngineResult<()> {
        let running = self.running_containers().await?;

        let args = if running.contains(name) {
            vec![
                "stop".to_string(),
                "--time".to_string(),
                STOP_TIMEOUT_SECONDS.to_string(),
                name.to_string(),
            ]
        } else {
            vec!["rm".to_string(), name.to_string()]
        };

        match self.docker(args).await {
            Ok(_) => Ok(()),
            Err(error) if is_missing_container(&error) => Ok(()),
            Err(error) => Err(EngineError::RuntimeFailure {
                container: name.to_string(),
                reason: error.stderr(),
            }),
        }
    }

    /// Names of the running containers, read live on every call.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when `docker ps` fails.
    pub async fn running_containers(&self) -> EngineResult<HashSet<String>> {
        let args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self
            .runner
            .run(&self.docker_bin, &args, None)
            .await
            .map_err(|error| EngineError::RuntimeFailure {
                container: "*".to_string(),
                reason: error.to_string(),
            })?;

        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().trim_matches('"').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Best-effort image removal.
    pub async fn delete_image(&self, image: &str) {
        if let Err(error) = self.docker(vec!["rmi".to_string(), image.to_string()]).await {
            warn!("failed to delete image {image}: {error}");
        }
    }
}

fn env_args(configuration: &ServiceConfiguration, with_data_dir: bool) -> Vec<String> {
    let mut env = configuration.env.clone();
    if with_data_dir {
        env.insert("DATA_DIR".to_string(), CONTAINER_DATA_DIR.to_string());
    }
    env.insert("GA_TRACKING_ID".to_string(), String::new());

    env.into_iter()
        .flat_map(|(name, value)| ["-e".to_string(), format!("{name}={value}")])
        .collect()
}

fn is_missing_container(error: &ShellError) -> bool {
    error.stderr().to_ascii_lowercase().contains("no such container")
}
