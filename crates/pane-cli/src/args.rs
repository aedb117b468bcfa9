//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

/// A minimal terminal multiplexer.
///
/// Sessions run shells on server-hosted PTYs; clients attach over a
/// per-user Unix socket to view and drive them live. The server is
/// started on demand by the first command that needs one.
#[derive(Debug, Parser)]
#[command(name = "pane", version)]
pub struct Cli {
    /// Write server logs to the runtime directory log file
    #[arg(long, global = true)]
    pub log: bool,

    /// Do not start a server automatically when none is running
    #[arg(long = "no-auto-start", global = true)]
    pub no_auto_start: bool,

    /// Run as the server process (used by auto-start)
    #[arg(long, hide = true)]
    pub server: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the server in the foreground (usually auto-started)
    Server,

    /// Show whether a server is running and which one
    Status,

    /// List every server answering in the runtime directory
    ListServers,

    /// Create a new session
    #[command(after_help = "\
Examples:
  pane create                      # Session running your shell
  pane create build                # Named session
  pane create build -- make -j8    # Named session running a command")]
    Create(CreateArgs),

    /// List sessions
    List,

    /// Attach to a session (ctrl-B d detaches)
    Attach(AttachArgs),

    /// Destroy a session and terminate its child
    Destroy(DestroyArgs),
}

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Human-readable session name
    pub name: Option<String>,

    /// Command to run instead of the default shell
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct AttachArgs {
    /// Session id; may be omitted when exactly one session is running
    pub session_id: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct DestroyArgs {
    /// Session id
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn create_parses_name_and_trailing_command() {
        let cli = Cli::parse_from(["pane", "create", "build", "--", "make", "-j8"]);
        match cli.command {
            Some(Commands::Create(args)) => {
                assert_eq!(args.name.as_deref(), Some("build"));
                assert_eq!(args.command, vec!["make", "-j8"]);
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn hidden_server_flag_parses_without_subcommand() {
        let cli = Cli::parse_from(["pane", "--server", "--log"]);
        assert!(cli.server);
        assert!(cli.log);
        assert!(cli.command.is_none());
    }

    #[test]
    fn global_flags_work_after_subcommands() {
        let cli = Cli::parse_from(["pane", "attach", "--no-auto-start"]);
        assert!(cli.no_auto_start);
        match cli.command {
            Some(Commands::Attach(args)) => assert!(args.session_id.is_none()),
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn destroy_requires_a_session_id() {
        assert!(Cli::try_parse_from(["pane", "destroy"]).is_err());
        let cli = Cli::parse_from(["pane", "destroy", "abc"]);
        match cli.command {
            Some(Commands::Destroy(args)) => assert_eq!(args.session_id, "abc"),
            other => panic!("expected destroy, got {other:?}"),
        }
    }
}
