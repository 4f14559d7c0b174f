use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod backoff;
mod bluetooth;
mod config;
mod connection;
mod delivery;
mod health;
mod hub;
mod manager;
mod messages;
mod mqtt;
mod pipeline;
mod protocol;
mod push;
mod radio;
mod scanner;
mod server;
mod store;
mod webhook;

#[derive(Parser, Debug)]
#[command(version, about = "Bridge a Pixels die to webhooks, WebSocket clients and SQLite")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset, e.g. "debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or(args.log_level))
        .init();

    let config = config::AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("Target device: {}", config.device.name);

    let health = Arc::new(health::Health::default());
    let store = store::SqliteStore::open(config.database_path())
        .with_context(|| format!("opening database {}", config.database_path()))?;
    info!(
        "Database {} holds {} roll event(s)",
        config.database_path(),
        store.count()?
    );
    let (sink, store_worker) =
        store::spawn_persistence(store, config.queue_capacity(), Arc::clone(&health))?;
    let hub = Arc::new(hub::Hub::new(config.queue_capacity(), health).with_persistence(sink));

    let mqtt = config.mqtt.as_ref().map(mqtt::MqttClient::new);

    let radio = Arc::new(bluetooth::BluetoothRadio::first_adapter().await?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(err) => {
                error!("Unable to listen for Ctrl-C: {err}");
                return;
            }
        }
        signal.cancel();
    });

    let core = manager::Manager::new(config, radio, hub, mqtt);
    core.run_loop(shutdown).await?;

    // The hub released its sink on shutdown; wait for queued rows to land.
    if tokio::task::spawn_blocking(move || store_worker.join())
        .await?
        .is_err()
    {
        error!("Persistence worker panicked");
    }

    Ok(())
}
