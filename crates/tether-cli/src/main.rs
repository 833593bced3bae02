//! tether CLI and daemon entry point.

mod args;
mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::forward::ForwardOutcome;
use tether_core::protocol::{Reply, Request, SessionEntry, SessionId};
use tracing::{error, info};

use crate::args::{Cli, Commands};
use crate::daemon::cgroup::CgroupMembership;
use crate::daemon::{AttachOutcome, DaemonClient, DaemonServer};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Daemon command runs the server, all other commands are clients
    if let Commands::Daemon = cli.command {
        init_tracing(tracing::Level::INFO);
        run_daemon();
        return;
    }

    // Quiet by default: attach output shares the terminal with the log.
    init_tracing(tracing::Level::WARN);
    match run_client_command(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(default_level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}

/// Run a client command by connecting to the daemon.
///
/// Returns the process exit status: 1 whenever the daemon answered `ERROR`.
fn run_client_command(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        // Connect to daemon (auto-starts if not running)
        let client = DaemonClient::connect().await?;

        match cli.command {
            Commands::Spawn(args) => {
                let request = Request::Spawn {
                    command: args.command_line(),
                };
                Ok(print_replies(&client.request(&request).await?))
            }
            Commands::List(args) => {
                let replies = client.request(&Request::List).await?;
                if args.json {
                    print_json_listing(&replies)
                } else {
                    Ok(print_replies(&replies))
                }
            }
            Commands::Kill(args) => {
                let replies = client.request(&Request::Kill { id: args.id }).await?;
                Ok(print_replies(&replies))
            }
            Commands::Attach(args) => attach(client, args.id).await,
            Commands::Daemon => unreachable!("Daemon command handled separately"),
        }
    })
}

fn print_replies(replies: &[Reply]) -> i32 {
    for reply in replies {
        println!("{}", reply);
    }
    exit_code(replies)
}

fn print_json_listing(replies: &[Reply]) -> Result<i32> {
    if replies.iter().any(Reply::is_error) {
        return Ok(print_replies(replies));
    }
    let entries: Vec<SessionEntry> = replies
        .iter()
        .filter_map(|reply| match reply {
            Reply::Session(entry) => Some(*entry),
            _ => None,
        })
        .collect();
    println!("{}", serde_json::to_string(&entries)?);
    Ok(0)
}

fn exit_code(replies: &[Reply]) -> i32 {
    if replies.iter().any(Reply::is_error) {
        1
    } else {
        0
    }
}

async fn attach(client: DaemonClient, id: SessionId) -> Result<i32> {
    match client.attach(id).await? {
        AttachOutcome::Refused(reply) => Ok(print_replies(&[reply])),
        AttachOutcome::Ended(ForwardOutcome::Detached) => {
            eprintln!("\r\n[detached from session {}]", id);
            Ok(0)
        }
        AttachOutcome::Ended(ForwardOutcome::Closed) => {
            eprintln!("\r\n[session {} closed]", id);
            Ok(0)
        }
    }
}

/// Run the daemon server with graceful signal handling.
///
/// Handles SIGINT (Ctrl+C) and SIGTERM for clean shutdown.
/// The DaemonServer's Drop impl cleans up socket and PID files.
fn run_daemon() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve()) {
        error!("Daemon failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn serve() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    // Join before any session is forked so every child is tracked too.
    let cgroup = CgroupMembership::from_env();

    let result = match DaemonServer::bind().await {
        Ok(server) => {
            let result = server
                .run_until(async {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                    }
                })
                .await;
            // Server is dropped here, triggering cleanup of socket and PID files
            drop(server);
            result
        }
        Err(e) => Err(e),
    };

    if let Some(cgroup) = cgroup {
        cgroup.leave();
    }
    result
}
