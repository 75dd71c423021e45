//! Service lifecycle: create, build, run, stop, destroy, and status reconciliation.
//!
//! Every build or run sequence holds the process-wide deploy lock. Registry writes and port
//! allocation only happen under it, and shutdown drains by acquiring it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::DockyardConfig;
use crate::db::{Collection, DbClient, SERVICES_COLLECTION};
use crate::deployment::service::Resolution;
use crate::deployment::{
    ImageManager, Manifest, NginxConfigurator, PortAllocator, Service, ServiceConfiguration,
    ServiceStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::source::{SourceProvider, WebhookService};
use crate::system::CommandRunner;

/// Result of one service within a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub repository: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkOutcome {
    fn new(service: &Service, result: EngineResult<()>) -> Self {
        Self {
            repository: service.repository.clone(),
            branch: service.branch.clone(),
            error: result.err().map(|error| error.to_string()),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct ServiceManager {
    services: Collection<ServiceConfiguration>,
    images: ImageManager,
    nginx: NginxConfigurator,
    source: Arc<dyn SourceProvider>,
    allocator: PortAllocator,
    base_domain: String,
    deploy_lock: Mutex<()>,
    background: TaskTracker,
}

impl ServiceManager {
    #[must_use]
    pub fn new(
        services: Collection<ServiceConfiguration>,
        images: ImageManager,
        nginx: NginxConfigurator,
        source: Arc<dyn SourceProvider>,
        base_domain: String,
    ) -> Self {
        Self {
            services,
            images,
            nginx,
            source,
            allocator: PortAllocator::default(),
            base_domain,
            deploy_lock: Mutex::new(()),
            background: TaskTracker::new(),
        }
    }

    /// Wires the engine from config, opening the `services` collection.
    ///
    /// # Errors
    /// Returns an error if the registry cannot be loaded.
    pub async fn from_config(
        config: &DockyardConfig,
        db: &DbClient,
        runner: Arc<dyn CommandRunner>,
        source: Arc<dyn SourceProvider>,
    ) -> EngineResult<Self> {
        let services = db.collection(SERVICES_COLLECTION).await?;
        Ok(Self::new(
            services,
            ImageManager::new(runner.clone(), config),
            NginxConfigurator::new(runner, config),
            source,
            config.base_domain(),
        ))
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn SourceProvider> {
        &self.source
    }

    /// Whether a build or run sequence currently holds the deploy lock.
    #[must_use]
    pub fn is_building(&self) -> bool {
        self.deploy_lock.try_lock().is_err()
    }

    async fn lock(&self) -> EngineResult<MutexGuard<'_, ()>> {
        let guard = self.deploy_lock.lock().await;
        self.services.reload().await?;
        Ok(guard)
    }

    /// Waits for accepted background deploys and the running sequence to finish, then keeps
    /// the lock so no new one starts. Returns `None` when `timeout` elapses first.
    pub async fn drain(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        let deadline = Instant::now() + timeout;
        self.background.close();
        if self.is_building() || !self.background.is_empty() {
            info!(
                "waiting up to {}s for {} queued deploys and the running one",
                timeout.as_secs(),
                self.background.len()
            );
        }

        if tokio::time::timeout_at(deadline, self.background.wait())
            .await
            .is_err()
        {
            warn!("{} queued deploys did not finish in time", self.background.len());
            return None;
        }
        tokio::time::timeout_at(deadline, self.deploy_lock.lock())
            .await
            .ok()
    }

    /// Stores a configuration for `service` unless one exists.
    ///
    /// # Errors
    /// Returns an error when no type recipe is usable or the registry write fails.
    pub async fn create(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        self.create_locked(service, manifest).await
    }

    /// Builds the image and stores the configuration once the build succeeds.
    ///
    /// # Errors
    /// Returns [`EngineError::BuildFailure`] when the builder fails; nothing is stored then.
    pub async fn build(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        self.build_locked(service, manifest, None).await
    }

    /// Builds with one manifest fetch, then replaces the running container.
    ///
    /// # Errors
    /// Returns the build failure, in which case the previous instance keeps running.
    pub async fn deploy(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        self.deploy_locked(service, manifest).await
    }

    /// Replaces the running container and publishes the proxy configuration.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when the container cannot be started.
    pub async fn run_in_background(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        self.run_locked(service, manifest).await
    }

    /// Runs the image in the foreground and returns its output. Nothing is published or stored.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when the container exits non-zero.
    pub async fn run_and_exit(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<String> {
        let _guard = self.lock().await?;
        let configuration = self.configuration_for_run(service, manifest).await?;
        let output = self.images.run_foreground(&configuration).await?;
        Ok(output.stdout)
    }

    /// Stops the container, removes image and site, and forgets the service.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for unknown services.
    pub async fn destroy(&self, service: &Service) -> EngineResult<()> {
        let _guard = self.lock().await?;
        let configuration = self.stored(service).await?;

        info!("destroying {service}");
        self.images.stop_service(&configuration.name()).await?;
        self.images.delete_image(&configuration.image_name()).await;
        if let Err(engine_error) = self.nginx.unregister_service(&configuration).await {
            warn!("failed to remove site for {service}: {engine_error}");
        }
        self.nginx.reload().await;
        self.services.delete(&configuration.id).await?;
        Ok(())
    }

    /// Stops the service's container. Unknown services are a no-op.
    ///
    /// # Errors
    /// Returns [`EngineError::RuntimeFailure`] when docker refuses to stop it.
    pub async fn stop(&self, service: &Service) -> EngineResult<()> {
        let _guard = self.lock().await?;
        info!("stopping {service}");
        self.images.stop_service(&service.container_name()).await
    }

    /// # Errors
    /// Returns an error when stopping or starting fails.
    pub async fn restart(&self, service: &Service) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        self.restart_locked(service).await
    }

    /// Every stored configuration with `online` computed from the live container list.
    ///
    /// # Errors
    /// Returns an error when the registry or `docker ps` cannot be read.
    pub async fn get_status(&self) -> EngineResult<Vec<ServiceStatus>> {
        self.services.reload().await?;
        let running = self.images.running_containers().await?;
        Ok(self
            .services
            .get_all()
            .await
            .into_iter()
            .map(|configuration| ServiceStatus::new(configuration, &running))
            .collect())
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] for unknown services.
    pub async fn get_status_of(&self, service: &Service) -> EngineResult<ServiceStatus> {
        self.services.reload().await?;
        let configuration = self.stored(service).await?;
        let running = self.images.running_containers().await?;
        Ok(ServiceStatus::new(configuration, &running))
    }

    /// Rebuilds and restarts every stored service, continuing past failures.
    ///
    /// # Errors
    /// Returns an error only when the registry cannot be read.
    pub async fn build_all(&self) -> EngineResult<Vec<BulkOutcome>> {
        let _guard = self.lock().await?;
        let mut outcomes = Vec::new();
        for configuration in self.services.get_all().await {
            let service = configuration.service();
            let result = self.deploy_locked(&service, None).await.map(|_| ());
            log_outcome("build", &service, &result);
            outcomes.push(BulkOutcome::new(&service, result));
        }
        Ok(outcomes)
    }

    /// Restarts every stored service, continuing past failures.
    ///
    /// # Errors
    /// Returns an error only when the registry cannot be read.
    pub async fn restart_all(&self) -> EngineResult<Vec<BulkOutcome>> {
        let _guard = self.lock().await?;
        let mut outcomes = Vec::new();
        for configuration in self.services.get_all().await {
            let service = configuration.service();
            let result = self.restart_locked(&service).await.map(|_| ());
            log_outcome("restart", &service, &result);
            outcomes.push(BulkOutcome::new(&service, result));
        }
        Ok(outcomes)
    }

    /// Rewrites every site from the registry and reloads the proxy once.
    /// Returns how many sites were written.
    ///
    /// # Errors
    /// Returns an error when the sites directory cannot be cleared.
    pub async fn reconcile_proxy(&self) -> EngineResult<usize> {
        let _guard = self.lock().await?;
        let removed = self.nginx.remove_all_sites().await?;

        let mut registered = 0;
        for configuration in self.services.get_all().await {
            match self.nginx.register_service(&configuration).await {
                Ok(_) => registered += 1,
                Err(engine_error) => error!(
                    "failed to write site for {}: {engine_error}",
                    configuration.service()
                ),
            }
        }
        self.nginx.reload().await;

        info!("reconciled proxy: removed {removed} sites, wrote {registered}");
        Ok(registered)
    }

    /// Runs [`Self::deploy_from_webhook`] on a tracked task that [`Self::drain`] waits for.
    pub fn deploy_in_background(self: &Arc<Self>, webhook: WebhookService) {
        let manager = Arc::clone(self);
        self.background.spawn(async move {
            match manager.deploy_from_webhook(&webhook).await {
                Ok(configuration) => info!("deployed {} from push", configuration.service()),
                Err(engine_error) => {
                    error!("push deploy of {} failed: {engine_error}", webhook.service);
                }
            }
        });
    }

    /// Builds and runs a pushed service with the manifest at its configuration URL.
    ///
    /// # Errors
    /// Returns an error when the build or the start fails.
    pub async fn deploy_from_webhook(
        &self,
        webhook: &WebhookService,
    ) -> EngineResult<ServiceConfiguration> {
        let _guard = self.lock().await?;
        let service = &webhook.service;
        info!("deploying {service} from push");

        let manifest = self.source.fetch_manifest(&webhook.configuration_url).await?;
        self.build_locked(service, Some(manifest.clone()), Some(&webhook.clone_url))
            .await?;
        self.run_locked(service, Some(manifest)).await
    }

    async fn stored(&self, service: &Service) -> EngineResult<ServiceConfiguration> {
        self.services
            .get(&service.id())
            .await
            .ok_or_else(|| EngineError::not_found("service", service.to_string()))
    }

    async fn resolve_manifest(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<Manifest> {
        match manifest {
            Some(manifest) => Ok(manifest),
            None => {
                let url = self.source.manifest_url(&service.repository, &service.branch);
                self.source.fetch_manifest(&url).await
            }
        }
    }

    async fn resolve_configuration(
        &self,
        service: &Service,
        manifest: &Manifest,
        existing: Option<&ServiceConfiguration>,
    ) -> EngineResult<ServiceConfiguration> {
        let id = service.id();
        let ports_in_use = self
            .services
            .get_all()
            .await
            .iter()
            .filter(|configuration| configuration.id != id)
            .flat_map(ServiceConfiguration::host_ports)
            .collect::<HashSet<_>>();
        let service_type = self.images.resolve_type(manifest.service_type.as_deref())?;

        ServiceConfiguration::resolve(
            service,
            manifest,
            existing,
            Resolution {
                service_type,
                base_domain: &self.base_domain,
                allocator: &self.allocator,
                ports_in_use,
            },
        )
    }

    /// A supplied manifest wins; otherwise the stored configuration is reused as is.
    async fn configuration_for_run(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let existing = self.services.get(&service.id()).await;
        match (manifest, existing) {
            (None, Some(existing)) => Ok(existing),
            (manifest, existing) => {
                let manifest = self.resolve_manifest(service, manifest).await?;
                self.resolve_configuration(service, &manifest, existing.as_ref())
                    .await
            }
        }
    }

    async fn create_locked(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        if let Some(existing) = self.services.get(&service.id()).await {
            return Ok(existing);
        }

        let manifest = self.resolve_manifest(service, manifest).await?;
        let configuration = self.resolve_configuration(service, &manifest, None).await?;
        self.services
            .set(&configuration.id, configuration.clone())
            .await?;
        info!("created {service} as {}", configuration.name());
        Ok(configuration)
    }

    async fn build_locked(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
        clone_url: Option<&str>,
    ) -> EngineResult<ServiceConfiguration> {
        info!("building {service}");
        let manifest = self.resolve_manifest(service, manifest).await?;
        let existing = self.services.get(&service.id()).await;
        let configuration = self
            .resolve_configuration(service, &manifest, existing.as_ref())
            .await?;

        let clone_url = clone_url.map_or_else(
            || self.source.clone_url(&service.repository),
            ToString::to_string,
        );
        self.images.build_image(&configuration, &clone_url).await?;

        self.services
            .set(&configuration.id, configuration.clone())
            .await?;
        info!("built {}", configuration.image_name());
        Ok(configuration)
    }

    async fn run_locked(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        info!("starting {service}");
        let configuration = self.configuration_for_run(service, manifest).await?;
        self.images.run_service(&configuration).await?;

        match self.nginx.publish_service(&configuration).await {
            Ok(true) => {}
            Ok(false) => warn!("proxy site for {service} was not applied"),
            Err(engine_error) => error!("failed to write site for {service}: {engine_error}"),
        }

        self.services
            .set(&configuration.id, configuration.clone())
            .await?;
        Ok(configuration)
    }

    async fn deploy_locked(
        &self,
        service: &Service,
        manifest: Option<Manifest>,
    ) -> EngineResult<ServiceConfiguration> {
        let manifest = self.resolve_manifest(service, manifest).await?;
        self.build_locked(service, Some(manifest.clone()), None)
            .await?;
        self.run_locked(service, Some(manifest)).await
    }

    async fn restart_locked(&self, service: &Service) -> EngineResult<ServiceConfiguration> {
        info!("restarting {service}");
        self.images.stop_service(&service.container_name()).await?;
        self.run_locked(service, None).await
    }
}

fn log_outcome(operation: &str, service: &Service, result: &EngineResult<()>) {
    match result {
        Ok(()) => info!("{operation} of {service} succeeded"),
        Err(engine_error) => error!("{operation} of {service} failed: {engine_error}"),
    }
}

#[cfg(test)]
mod tests;
