//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};
use tether_core::protocol::SessionId;

/// Keep shells running in the background and reattach to them later.
///
/// A daemon holds every shell in its own pseudo-terminal. Sessions survive
/// the terminal that started them; detach from an attached session with
/// Ctrl-].
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a new session running a shell, or a command under the shell
    #[command(after_help = "\
Examples:
  tether spawn                          # Interactive shell
  tether spawn top                      # Command run via $SHELL -c
  tether spawn make -j8 test            # Arguments are joined with spaces")]
    Spawn(SpawnArgs),

    /// List running sessions
    List(ListArgs),

    /// Attach this terminal to a session (detach with Ctrl-])
    Attach(AttachArgs),

    /// Kill a session's process
    Kill(KillArgs),

    /// Start the daemon process (usually auto-started)
    Daemon,
}

#[derive(Debug, clap::Args)]
pub struct SpawnArgs {
    /// Command and arguments to run (default: an interactive shell)
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SpawnArgs {
    /// The command line sent to the daemon, if any.
    pub fn command_line(&self) -> Option<String> {
        (!self.command.is_empty()).then(|| self.command.join(" "))
    }
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Print the sessions as a JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct AttachArgs {
    /// Session id as printed by `spawn` and `list`
    pub id: SessionId,
}

#[derive(Debug, clap::Args)]
pub struct KillArgs {
    /// Session id as printed by `spawn` and `list`
    pub id: SessionId,
}
