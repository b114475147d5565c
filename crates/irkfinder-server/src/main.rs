//! # irkfinder-server
//!
//! Daemon that brings up the BLE peripheral and serves the captured identity
//! key over HTTP.
//!
//! ## Running
//!
//! ```bash
//! # Development, without Bluetooth hardware
//! cargo run --package irkfinder-server --no-default-features
//!
//! # Production (needs bluetoothd and access to /var/lib/bluetooth)
//! ./irkfinder-server --config /etc/irkfinder/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use irkfinder_core::{
    event_channel, spawn_bond_poll, BleConfig, BleController, BondDatabase, BondedDeviceStore,
    Config, EventSender, Peripheral, Session,
};
use irkfinder_server::api::create_router;
use irkfinder_server::logging;
use irkfinder_server::state::AppState;
use tokio::net::TcpListener;
use tracing::info;

type Backend = (Arc<dyn BleController>, Arc<dyn BondDatabase>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    logging::init(config.server.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device_name = %config.ble.device_name,
        "Starting irkfinder-server"
    );

    let (events, rx) = event_channel();
    let (controller, bonds) = backend(&config.ble, events).await?;
    let session = Session::new(BondedDeviceStore::new(bonds));

    let peripheral = Peripheral::new(controller, &config.ble, session.clone())?;
    let bring_up = peripheral.subscribe();
    let handler = peripheral.handler();
    peripheral.start().context("BLE bring-up failed")?;
    tokio::spawn(peripheral.run(rx));
    spawn_bond_poll(handler, config.ble.bond_poll_interval());

    let app = create_router(AppState::new(session, bring_up));

    let addr = config.server.socket_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down");
    Ok(())
}

/// Load configuration from `--config <path>`, or the default location.
fn load_config() -> anyhow::Result<Config> {
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => Config::load()?,
        (Some("--config"), Some(path)) => Config::load_from(Path::new(&path))?,
        _ => anyhow::bail!("usage: irkfinder-server [--config <path>]"),
    };
    Ok(config)
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn backend(ble: &BleConfig, events: EventSender) -> anyhow::Result<Backend> {
    use irkfinder_core::{BluezBondDatabase, BluezController};

    let controller = BluezController::new(ble, events)
        .await
        .context("connecting to bluetoothd")?;
    let bonds = BluezBondDatabase::new(&controller, ble.bluez_storage_dir.clone()).await?;
    Ok((Arc::new(controller), Arc::new(bonds)))
}

#[cfg(not(all(feature = "bluetooth", not(feature = "mock-bluetooth"))))]
#[allow(clippy::unused_async)]
async fn backend(_ble: &BleConfig, _events: EventSender) -> anyhow::Result<Backend> {
    use irkfinder_core::{MemoryBondDatabase, MockController};

    tracing::warn!("No Bluetooth backend compiled in; using an in-memory controller");
    Ok((
        Arc::new(MockController::new()),
        Arc::new(MemoryBondDatabase::default()),
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
