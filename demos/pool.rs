//! # Worker Pool Example
//!
//! Runs a master supervising two worker definitions:
//! - `http` ×3: "serves" a request every 200ms and asks to be replaced after ~25 of them;
//! - `cron` ×1: not reloadable, reads a shared value from the master container.
//!
//! ```text
//! master ──► http (3 processes, MaxRequests + OnException)
//!        └─► cron (1 process, reloadable = false)
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=info cargo run --example pool --features logging
//! ```
//! Then, from another terminal:
//! ```bash
//! cargo run --example ctl -- status
//! cargo run --example ctl -- reload
//! cargo run --example ctl -- stop
//! ```

use std::sync::Arc;
use std::time::Duration;

use procvisor::{
    Command, JitterPolicy, LogWriter, MaxRequests, OnException, Reply, Server, ServerConfig,
    TriggerEvent, WorkerContext, WorkerDefinition, WorkerError, WorkerFn,
};
use tracing_subscriber::EnvFilter;

async fn http(ctx: WorkerContext) -> Result<(), WorkerError> {
    let token = ctx.cancellation();
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if ctx.trigger().emit(&TriggerEvent::Request) {
                    tracing::info!(pid = ctx.pid(), "request budget spent, reloading");
                }
            }
        }
    }
}

async fn cron(ctx: WorkerContext) -> Result<(), WorkerError> {
    let Some(bus) = ctx.bus() else {
        return Ok(());
    };
    let token = ctx.cancellation();
    let mut tick = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tick.tick() => {
                let reply = bus
                    .dispatch(Command::ContainerGet { id: "greeting".into() })
                    .await
                    .map_err(|e| WorkerError::fail(e.to_string()))?;
                if let Reply::Value(Some(value)) = reply {
                    tracing::info!(pid = ctx.pid(), %value, "cron tick");
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut cfg = ServerConfig::default();
    cfg.name = "procvisor-demo".into();
    cfg.stop_timeout = Duration::from_secs(3);

    let server = Server::builder(cfg)
        .worker(
            WorkerDefinition::builder("http", WorkerFn::arc(http))
                .count(3)
                .strategy(MaxRequests::with_jitter(25, JitterPolicy::Equal))
                .strategy(OnException::any())
                .build(),
        )
        .worker(
            WorkerDefinition::builder("cron", WorkerFn::arc(cron))
                .reloadable(false)
                .build(),
        )
        .subscriber_all(Arc::new(LogWriter::new()))
        .entry("greeting", serde_json::json!("hello from the master"))
        .build();

    let code = server.run()?;
    std::process::exit(code);
}
