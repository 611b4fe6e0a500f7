//! # Control Client Example
//!
//! Talks to a running master over its bus socket.
//!
//! ## Run
//! ```bash
//! cargo run --example ctl -- status
//! cargo run --example ctl -- --socket /tmp/procvisor-demo.sock reload
//! cargo run --example ctl -- get greeting
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use procvisor::{BusClient, ClientOptions, Command, Reply, ServerConfig};

#[derive(Parser)]
#[command(name = "ctl", about = "procvisor control client")]
struct Cli {
    /// Bus socket path (defaults to the demo server's socket).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Reply timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the master and its processes.
    Status,
    /// Gracefully stop the server.
    Stop,
    /// Reload every reloadable worker.
    Reload,
    /// Read a container entry.
    Get { id: String },
    /// Store a JSON container entry.
    Set { id: String, value: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(|| {
        let mut cfg = ServerConfig::default();
        cfg.name = "procvisor-demo".into();
        cfg.socket_path()
    });

    let options = ClientOptions {
        timeout: Some(Duration::from_secs(cli.timeout)),
        ..ClientOptions::default()
    };
    let client = BusClient::connect_with(&socket, options)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;

    match cli.action {
        Action::Status => {
            if let Reply::Server(info) = client.dispatch(Command::GetServerStatus).await? {
                println!(
                    "{} pid={} status={} workers={} processes={}",
                    info.name, info.pid, info.status, info.workers, info.processes
                );
            }
            if let Reply::Supervisor(processes) =
                client.dispatch(Command::GetSupervisorStatus).await?
            {
                for p in processes {
                    let mut flags = Vec::new();
                    if p.detached {
                        flags.push("detached");
                    }
                    if p.blocked {
                        flags.push("blocked");
                    }
                    if !p.reloadable {
                        flags.push("no-reload");
                    }
                    println!(
                        " ├─► {:>7} {:<10} up {:>6.1}s  rss {:>6} KiB  {}",
                        p.pid,
                        p.worker,
                        p.uptime.as_secs_f64(),
                        p.memory / 1024,
                        flags.join(",")
                    );
                }
            }
        }
        Action::Stop => {
            client.dispatch(Command::StopServer).await?;
            println!("stop requested");
        }
        Action::Reload => {
            client.dispatch(Command::ReloadServer).await?;
            println!("reload requested");
        }
        Action::Get { id } => match client.dispatch(Command::ContainerGet { id }).await? {
            Reply::Value(Some(value)) => println!("{value}"),
            other => println!("{other:?}"),
        },
        Action::Set { id, value } => {
            let value = serde_json::from_str(&value)
                .unwrap_or(serde_json::Value::String(value));
            client.dispatch(Command::ContainerSet { id, value }).await?;
            println!("ok");
        }
    }
    Ok(())
}
