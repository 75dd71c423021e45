//! Operator command line. Every verb except `serve` runs once against the local registry and
//! returns the text to print.

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::deployment::service::{validate_repository, DEFAULT_BRANCH};
use crate::deployment::{Service, ServiceStatus};
use crate::engine::BulkOutcome;
use crate::error::EngineError;
use crate::supervisor::Components;

#[derive(Debug, Parser)]
#[command(name = "dockyard")]
#[command(about = "Self-hosted deployment control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the HTTP control plane (default)
    Serve,
    /// Build the image and start the service
    Build(ServiceArgs),
    /// Run the image in the foreground and print its output
    Run(ServiceArgs),
    /// Start the service in the background
    Start(ServiceArgs),
    Stop(ServiceArgs),
    Restart(ServiceArgs),
    /// Stop the service and remove its image, proxy site and record
    Destroy(ServiceArgs),
    /// Print one service's configuration and state as JSON
    Status(ServiceArgs),
    /// Issue the webhook access key of a repository
    CreateKey(RepositoryArgs),
    GetKey(RepositoryArgs),
    DeleteKey(RepositoryArgs),
    /// List services, or a single column of the listing
    #[command(visible_alias = "ls")]
    List {
        #[arg(value_enum)]
        field: Option<ListField>,
    },
    /// Rebuild and restart every service
    BuildAll,
    RestartAll,
    /// Rewrite every proxy site from the registry
    ReconcileProxy,
}

#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Repository as `owner/name`
    pub repository: String,
    #[arg(default_value = DEFAULT_BRANCH)]
    pub branch: String,
}

impl ServiceArgs {
    fn service(&self) -> Result<Service> {
        Ok(Service::new(&self.repository, &self.branch)?)
    }
}

#[derive(Debug, Args)]
pub struct RepositoryArgs {
    pub repository: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListField {
    Online,
    Id,
    Type,
    Origin,
    Key,
}

/// Runs one verb. `serve` is handled by the caller.
///
/// # Errors
/// Returns the engine error of the failed operation.
pub async fn execute(command: Command, components: &Components) -> Result<String> {
    let manager = &components.manager;
    let keys = &components.keys;

    let output = match command {
        Command::Serve => anyhow::bail!("serve is not a one-shot command"),
        Command::Build(args) => {
            let configuration = manager.deploy(&args.service()?, None).await?;
            format!(
                "{} running as {}",
                configuration.service(),
                configuration.name()
            )
        }
        Command::Run(args) => manager.run_and_exit(&args.service()?, None).await?,
        Command::Start(args) => {
            let configuration = manager.run_in_background(&args.service()?, None).await?;
            format!("started {}", configuration.name())
        }
        Command::Stop(args) => {
            manager.stop(&args.service()?).await?;
            String::new()
        }
        Command::Restart(args) => {
            let configuration = manager.restart(&args.service()?).await?;
            format!("restarted {}", configuration.name())
        }
        Command::Destroy(args) => {
            manager.destroy(&args.service()?).await?;
            String::new()
        }
        Command::Status(args) => {
            let status = manager.get_status_of(&args.service()?).await?;
            serde_json::to_string_pretty(&status)?
        }
        Command::CreateKey(args) => {
            validate_repository(&args.repository)?;
            if !manager.source().exists(&args.repository).await? {
                return Err(EngineError::not_found("repository", args.repository).into());
            }
            keys.create_key(&args.repository).await?
        }
        Command::GetKey(args) => keys.get_key(&args.repository).await?,
        Command::DeleteKey(args) => {
            keys.delete_key(&args.repository).await?;
            String::new()
        }
        Command::List { field } => {
            let mut rows = Vec::new();
            for status in manager.get_status().await? {
                let key = keys
                    .get_key(&status.configuration.repository)
                    .await
                    .unwrap_or_default();
                rows.push(ListRow::new(&status, key));
            }
            match field {
                Some(field) => rows
                    .iter()
                    .map(|row| row.field(field))
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => format_table(&rows),
            }
        }
        Command::BuildAll => format_outcomes(&manager.build_all().await?),
        Command::RestartAll => format_outcomes(&manager.restart_all().await?),
        Command::ReconcileProxy => {
            let sites = manager.reconcile_proxy().await?;
            format!("wrote {sites} proxy sites")
        }
    };

    Ok(output)
}

#[derive(Debug)]
struct ListRow {
    online: &'static str,
    id: String,
    service_type: String,
    origin: String,
    key: String,
}

impl ListRow {
    fn new(status: &ServiceStatus, key: String) -> Self {
        let configuration = &status.configuration;
        let origin = if configuration.branch == DEFAULT_BRANCH {
            configuration.repository.clone()
        } else {
            format!("{} {}", configuration.repository, configuration.branch)
        };

        Self {
            online: if status.online { "[v]" } else { "[!]" },
            id: status.name.clone(),
            service_type: configuration.service_type.clone(),
            origin,
            key,
        }
    }

    fn field(&self, field: ListField) -> &str {
        match field {
            ListField::Online => self.online,
            ListField::Id => &self.id,
            ListField::Type => &self.service_type,
            ListField::Origin => &self.origin,
            ListField::Key => &self.key,
        }
    }

    fn columns(&self) -> [&str; 5] {
        [
            self.online,
            &self.id,
            &self.service_type,
            &self.origin,
            &self.key,
        ]
    }
}

fn format_table(rows: &[ListRow]) -> String {
    const HEADER: [&str; 5] = ["---", "Id/Container", "Type", "Origin", "Key"];

    let mut widths = HEADER.map(|column| column.chars().count());
    for row in rows {
        for (width, column) in widths.iter_mut().zip(row.columns()) {
            *width = (*width).max(column.chars().count());
        }
    }

    let render = |columns: [&str; 5]| {
        columns
            .iter()
            .zip(widths)
            .map(|(column, width)| format!("{column:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let separator = widths
        .iter()
        .map(|width| "-".repeat(*width))
        .collect::<Vec<_>>()
        .join("-+-");

    let mut lines = vec![render(HEADER), separator];
    lines.extend(rows.iter().map(|row| render(row.columns())));
    lines.join("\n")
}

fn format_outcomes(outcomes: &[BulkOutcome]) -> String {
    outcomes
        .iter()
        .map(|outcome| match &outcome.error {
            None => format!("[v] {}@{}", outcome.repository, outcome.branch),
            Some(error) => format!("[!] {}@{}: {error}", outcome.repository, outcome.branch),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
