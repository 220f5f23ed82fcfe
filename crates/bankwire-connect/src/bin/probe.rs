//! Operator probe for bank connections.

use anyhow::{anyhow, Context, Result};
use bankwire_connect::{BankConnection, ConnectionEvent, NetworksConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bankwire-probe")]
#[command(about = "Check and exercise bank connections", long_about = None)]
struct Cli {
    /// Bank networks file (.toml or .json).
    #[arg(short, long, env = "BANKWIRE_CONFIG", default_value = "/etc/bankwire/networks.toml")]
    config: PathBuf,

    /// Bank network to talk to.
    #[arg(short, long)]
    bank: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, report the peer, disconnect.
    Check,
    /// Send one JSON payload and print the response.
    Send {
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Stay connected and print lifecycle events until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let networks = NetworksConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let endpoint = networks
        .bank(&cli.bank)
        .cloned()
        .ok_or_else(|| anyhow!("bank {} is not configured in {}", cli.bank, cli.config.display()))?;

    let conn = BankConnection::new(endpoint);
    match cli.command {
        Command::Check => check(&conn).await,
        Command::Send { payload, timeout_ms } => send(&conn, &payload, timeout_ms).await,
        Command::Watch => watch(&conn).await,
    }
}

async fn check(conn: &BankConnection) -> Result<()> {
    conn.connect().await?;
    println!(
        "{}: {} ({})",
        conn.name(),
        conn.state(),
        conn.peer().unwrap_or_default()
    );
    conn.disconnect().await?;
    Ok(())
}

async fn send(conn: &BankConnection, payload: &str, timeout_ms: Option<u64>) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("payload is not JSON")?;
    conn.connect().await?;
    let outcome = conn.send(payload, timeout_ms.map(Duration::from_millis)).await;
    conn.disconnect().await?;
    let response = outcome?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn watch(conn: &BankConnection) -> Result<()> {
    let mut events = conn.subscribe();
    conn.connect().await?;
    println!("{}: connected to {}", conn.name(), conn.peer().unwrap_or_default());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::ReconnectionExhausted { attempts, last_error }) => {
                    println!("{}: gave up after {} attempts: {}", conn.name(), attempts, last_error);
                    break;
                }
                Ok(event) => println!("{}: {:?}", conn.name(), event),
                Err(RecvError::Lagged(n)) => println!("{}: {} events dropped", conn.name(), n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stats = conn.heartbeat_stats();
    println!(
        "{}: heartbeats sent={} acked={} missed={} malformed={}",
        conn.name(),
        stats.sent,
        stats.acknowledged,
        stats.missed,
        stats.malformed_frames
    );
    conn.disconnect().await?;
    Ok(())
}
