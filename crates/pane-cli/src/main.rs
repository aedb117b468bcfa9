//! pane CLI and server entry point.

mod args;
mod attach;
mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use pane_core::protocol::{Request, SessionInfo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands};
use crate::daemon::client::list_servers;
use crate::daemon::paths;
use crate::daemon::{ConnectOptions, PaneClient, PaneServer};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log);

    let server_mode = cli.server || matches!(cli.command, Some(Commands::Server));
    if server_mode {
        run_server();
        return;
    }

    if let Err(e) = run_client_command(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Logs go to stderr, or to the runtime-directory log file with
/// `--log` (the only visible output of an auto-started server).
fn init_tracing(to_file: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if to_file {
        match open_log_file() {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("failed to open log file, logging to stderr: {e}"),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_log_file() -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    paths::ensure_runtime_dir()?;
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(paths::log_path())
}

/// Run the server until SIGINT/SIGTERM; dropping it cleans up the
/// socket and PID files.
fn run_server() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = match PaneServer::bind().await {
            Ok(server) => server,
            Err(e) => {
                error!("failed to start server: {e:#}");
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("server error: {e:#}");
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm() => {
                info!("received SIGTERM, shutting down");
            }
        }
        server.shutdown().await;
    });
}

async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn run_client_command(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        anyhow::bail!("no command given; try `pane attach` or `pane --help`");
    };
    let options = ConnectOptions {
        auto_start: !cli.no_auto_start,
        log: cli.log,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(async {
        match command {
            Commands::Server => unreachable!("server mode handled in main"),
            Commands::Status => status(options).await,
            Commands::ListServers => {
                let servers = list_servers().await;
                if servers.is_empty() {
                    println!("No server running");
                } else {
                    for server in servers {
                        println!(
                            "pid {:<8} up since {}  {}",
                            server.pid, server.started_at, server.socket_path
                        );
                    }
                }
                Ok(())
            }
            Commands::Create(args) => {
                let client = PaneClient::connect(options).await?;
                let command_line = (!args.command.is_empty()).then_some(args.command);
                let response = client
                    .request_ok(Request::CreateSession {
                        name: args.name,
                        command_line,
                    })
                    .await?;
                match response.session {
                    Some(session) => print_session_line(&session),
                    None => println!("session created"),
                }
                Ok(())
            }
            Commands::List => {
                let client = PaneClient::connect(options).await?;
                let response = client.request_ok(Request::ListSessions).await?;
                let sessions = response.sessions.unwrap_or_default();
                if sessions.is_empty() {
                    println!("no sessions");
                } else {
                    for session in sessions {
                        print_session_line(&session);
                    }
                }
                Ok(())
            }
            Commands::Attach(args) => attach::run(args.session_id, options).await,
            Commands::Destroy(args) => {
                let client = PaneClient::connect(options).await?;
                let response = client
                    .request_ok(Request::DestroySession {
                        session_id: Some(args.session_id),
                    })
                    .await?;
                println!("{}", response.message.unwrap_or_else(|| "ok".into()));
                Ok(())
            }
        }
    })
}

/// `status` never auto-starts: asking whether a server runs must not
/// make one run.
async fn status(options: ConnectOptions) -> Result<()> {
    let probe = ConnectOptions {
        auto_start: false,
        ..options
    };
    match PaneClient::connect(probe).await {
        Ok(client) => {
            let response = client.request_ok(Request::Ping).await?;
            match response.server {
                Some(server) => println!(
                    "server pid {} up since {} at {}",
                    server.pid, server.started_at, server.socket_path
                ),
                None => println!("server is running"),
            }
            Ok(())
        }
        Err(e) if e.to_string() == "No server running" => {
            println!("No server running");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn print_session_line(session: &SessionInfo) {
    let state = if session.is_running {
        "running".to_string()
    } else {
        match session.last_exit_code {
            Some(code) => format!("exited ({code})"),
            None => "exited".to_string(),
        }
    };
    println!(
        "{}  {:<12} {:<12} pid {:<8} created {}",
        session.id,
        session.name.as_deref().unwrap_or("-"),
        state,
        session
            .process_id
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into()),
        session.created_at
    );
}
