//! # courier
//!
//! Command-line front end: run a bus, or emit one message at a running bus.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier_server::{load_config, Bus, ClientHandle};
use courier_telemetry::{init_telemetry, IncidentQuery, TelemetryConfig};
use serde_json::Value;
use tokio::sync::mpsc;

/// Named-event message bus over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Named-event message bus over WebSocket")]
struct Cli {
    /// Emit JSON log lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a bus until interrupted.
    Serve {
        /// Port to bind (0 for auto-assign).
        #[arg(long, default_value = "9400")]
        port: u16,

        /// JSON config file merged over the defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind (overrides config).
        #[arg(long)]
        host: Option<String>,

        /// Event names re-published to every other peer on receipt.
        #[arg(long = "relay")]
        relays: Vec<String>,
    },
    /// Connect, emit one message, optionally wait for a reply event.
    Emit {
        /// WebSocket URL, e.g. `ws://127.0.0.1:9400/ws`.
        #[arg(long)]
        url: String,

        #[arg(long)]
        event: String,

        /// JSON payload (defaults to null).
        #[arg(long)]
        payload: Option<String>,

        /// Event to wait for after emitting; its payload is printed.
        #[arg(long)]
        wait: Option<String>,

        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(&TelemetryConfig {
        json: cli.log_json,
        ..TelemetryConfig::default()
    });

    match cli.command {
        Command::Serve {
            port,
            config,
            host,
            relays,
        } => {
            let mut config =
                load_config(config.as_deref()).context("failed to load bus config")?;
            if let Some(host) = host {
                config.host = host;
            }
            let bus = Bus::with_diagnostics(config, telemetry.diagnostics());
            for event in &relays {
                let _ = bus.on(event, |message| async move {
                    let report = message.deliver();
                    tracing::debug!(
                        event = message.event_name(),
                        recipients = report.delivered,
                        "relayed"
                    );
                    Ok(())
                });
            }

            let addr = bus.listen(port).await?;
            tracing::info!(%addr, path = %bus.config().path, relays = ?relays, "courier ready");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl+c")?;
            tracing::info!("shutting down");
            bus.shutdown().await;

            if let Some(log) = telemetry.incidents() {
                let recent = log.query(&IncidentQuery {
                    limit: Some(5),
                    ..IncidentQuery::default()
                });
                let kinds: Vec<&str> = recent.iter().map(|i| i.kind).collect();
                tracing::info!(total = log.count(), recent = ?kinds, "incident summary");
            }
        }
        Command::Emit {
            url,
            event,
            payload,
            wait,
            timeout_secs,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => Value::Null,
            };
            let client = ClientHandle::connect(&url).await?;

            let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();
            if let Some(wait) = &wait {
                let _ = client.on(wait, move |message| {
                    let reply_tx = reply_tx.clone();
                    async move {
                        let _ = reply_tx.send(message.payload().clone());
                        Ok(())
                    }
                });
            }

            client.emit(&event, payload)?;

            if let Some(wait) = wait {
                let received =
                    tokio::time::timeout(Duration::from_secs(timeout_secs), reply_rx.recv()).await;
                match received {
                    Ok(Some(payload)) => println!("{}", serde_json::to_string_pretty(&payload)?),
                    Ok(None) => bail!("connection closed before '{wait}' arrived"),
                    Err(_) => bail!("no '{wait}' within {timeout_secs}s"),
                }
            }
            client.close().await;
        }
    }
    Ok(())
}
