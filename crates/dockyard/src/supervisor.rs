//! Process lifecycle for `dockyard serve`: wiring, self-update and graceful shutdown.
//!
//! The process exits after a reload request or a termination signal once the running deploy
//! has drained; restarting it is left to the service manager that launched it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::DockyardConfig;
use crate::db::{DbClient, SERVICE_KEYS_COLLECTION};
use crate::engine::ServiceManager;
use crate::keys::KeyRegistry;
use crate::source::{GitHubSource, SourceProvider};
use crate::system::{CommandRunner, Shell};

/// The engine and key registry opened against the configured database.
#[derive(Debug, Clone)]
pub struct Components {
    pub manager: Arc<ServiceManager>,
    pub keys: Arc<KeyRegistry>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Components {
    /// # Errors
    /// Returns an error if the database or the HTTP client cannot be set up.
    pub async fn open(config: &DockyardConfig) -> Result<Self> {
        let database_path = config.database_path();
        let db = DbClient::initialize(&database_path)
            .await
            .with_context(|| format!("failed to open {}", database_path.display()))?;

        let runner: Arc<dyn CommandRunner> = Arc::new(Shell::new());
        let source: Arc<dyn SourceProvider> = Arc::new(GitHubSource::from_config(config)?);
        let manager = ServiceManager::from_config(config, &db, runner.clone(), source).await?;
        let keys = KeyRegistry::new(db.collection(SERVICE_KEYS_COLLECTION).await?);

        Ok(Self {
            manager: Arc::new(manager),
            keys: Arc::new(keys),
            runner,
        })
    }
}

/// Runs the configured update commands inside the checkout directory.
#[derive(Debug, Clone)]
pub struct SelfUpdater {
    runner: Arc<dyn CommandRunner>,
    checkout_dir: PathBuf,
    commands: Vec<Vec<String>>,
}

impl SelfUpdater {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DockyardConfig) -> Self {
        Self {
            runner,
            checkout_dir: config.checkout_dir(),
            commands: config.update_commands(),
        }
    }

    /// Stops at the first failing command. Returns whether every command succeeded.
    pub async fn update(&self) -> bool {
        for command in &self.commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };

            if let Err(shell_error) = self
                .runner
                .run_and_log(program, args, Some(&self.checkout_dir))
                .await
            {
                error!("self-update stopped: {shell_error}");
                return false;
            }
        }
        true
    }
}

/// Triggers a self-update followed by a graceful shutdown.
#[derive(Debug, Clone)]
pub struct Reloader {
    updater: Arc<SelfUpdater>,
    requested: Arc<Notify>,
}

impl Reloader {
    #[must_use]
    pub fn new(updater: SelfUpdater) -> Self {
        Self {
            updater: Arc::new(updater),
            requested: Arc::new(Notify::new()),
        }
    }

    /// Returns immediately; the update runs in the background and shutdown follows it
    /// whether or not it succeeded.
    pub fn trigger(&self) {
        let reloader = self.clone();
        tokio::spawn(async move {
            if reloader.updater.update().await {
                info!("checkout updated");
            }
            reloader.requested.notify_one();
        });
    }

    /// Resolves once a reload has been triggered and its update has finished.
    pub async fn requested(&self) {
        self.requested.notified().await;
    }
}

/// Serves the HTTP control plane until a signal or reload request, then drains the deploy
/// lock before returning.
///
/// # Errors
/// Returns an error if the admin key, database or listener cannot be set up.
pub async fn serve(config: &DockyardConfig) -> Result<()> {
    let admin_key = config.admin_key()?;
    let components = Components::open(config).await?;
    let reloader = Reloader::new(SelfUpdater::new(components.runner.clone(), config));

    let state = AppState {
        manager: components.manager.clone(),
        keys: components.keys.clone(),
        admin_key: admin_key.into(),
        reloader: reloader.clone(),
    };
    let app = api::router(state);

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;

    info!("database: {}", config.database_path().display());
    info!("listening on {bind_address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(reloader))
        .await?;

    info!("stopped accepting requests");
    let timeout = config.drain_timeout();
    let drained = components.manager.drain(timeout).await;
    if drained.is_none() {
        warn!(
            "deploy still running after {}s, exiting anyway",
            timeout.as_secs()
        );
    }
    Ok(())
}

async fn shutdown_signal(reloader: Reloader) {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {signal_error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!("failed to listen for SIGTERM: {signal_error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
        () = reloader.requested() => info!("reloading"),
    }
}
