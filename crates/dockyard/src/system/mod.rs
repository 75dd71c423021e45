mod shell;

pub use shell::{render_command, CommandOutput, CommandRunner, Shell, ShellError};
