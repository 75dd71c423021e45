use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockyard::cli::{self, Cli, Command};
use dockyard::config::DockyardConfig;
use dockyard::supervisor::{self, Components};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dockyard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = DockyardConfig::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => supervisor::serve(&config).await,
        command => {
            let components = Components::open(&config).await?;
            let output = cli::execute(command, &components).await?;
            if !output.is_empty() {
                println!("{output}");
            }
            Ok(())
        }
    }
}
