use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command \"{command}\" failed with code {code:?}:\n{stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl ShellError {
    /// Captured stderr of a failed command, or the spawn error text.
    #[must_use]
    pub fn stderr(&self) -> String {
        match self {
            Self::Spawn { source, .. } => source.to_string(),
            Self::Failed { stderr, .. } => stderr.clone(),
        }
    }
}

/// Runs external programs with an argument array; never through a shell.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` to completion and captures its output.
    ///
    /// # Errors
    /// Returns [`ShellError::Spawn`] if the program cannot be started and
    /// [`ShellError::Failed`] if it exits unsuccessfully.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ShellError>;

    /// Like [`CommandRunner::run`], logging the command line and a `>> ` prefixed transcript.
    ///
    /// # Errors
    /// Propagates the error from [`CommandRunner::run`] after logging it.
    async fn run_and_log(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ShellError> {
        info!("{}", render_command(program, args));

        match self.run(program, args, cwd).await {
            Ok(output) => {
                let transcript = prefix_transcript(&output.stdout);
                if !transcript.is_empty() {
                    info!("{transcript}");
                }
                Ok(output)
            }
            Err(shell_error) => {
                error!("{shell_error}");
                Err(shell_error)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Shell;

impl Shell {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for Shell {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ShellError> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|source| ShellError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(ShellError::Failed {
                command: render_command(program, args),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[must_use]
pub fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        return program.to_string();
    }

    format!("{program} {}", args.join(" "))
}

fn prefix_transcript(output: &str) -> String {
    output
        .trim()
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| format!(">> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
