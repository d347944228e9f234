//! PulseWatch - reachability monitoring for a small fleet of devices.
//!
//! Probes every configured device once per second, tracks a
//! GREEN/YELLOW/RED status per device, raises repeating alerts while a
//! device stays down, and rotates telemetry out to monthly CSV archives.

mod alerts;
mod config;
mod csvio;
mod db;
mod monitor;
mod notify;
mod probe;
mod scheduler;
mod status;

use config::Config;
use db::Store;
use scheduler::{rotation::RotationManager, Engine};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulsewatch=info".parse()?),
        )
        .init();

    let cfg = Config::load();
    tracing::info!("Starting PulseWatch");
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Store::new(&cfg.db_path)?;
    tracing::info!(
        devices = store.list_devices()?.len(),
        "Database initialized successfully"
    );

    // Notifications are consumed here as log lines; a UI collaborator would
    // take this receiver instead.
    let (notify_tx, mut notify_rx) = notify::channel();
    tokio::spawn(async move {
        while let Some(event) = notify_rx.recv().await {
            match event {
                notify::Notification::AlertFired {
                    device_id,
                    alert_id,
                    severity,
                    ..
                } => tracing::warn!(device_id, alert_id, %severity, "ALERT"),
                notify::Notification::AlertRepeat {
                    device_id,
                    alert_id,
                    severity,
                    ..
                } => tracing::warn!(device_id, alert_id, %severity, "ALERT (repeat)"),
                notify::Notification::StatusChanged {
                    device_id,
                    old,
                    new,
                    ..
                } => tracing::info!(device_id, ?old, %new, "status"),
            }
        }
    });

    let rotation = RotationManager::new(store.clone(), cfg.clone());
    rotation.start();

    let (engine, handle) = Engine::new(store, cfg, notify_tx);
    let engine_task = tokio::spawn(engine.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    handle.stop();
    rotation.stop().await;
    engine_task.await?;

    Ok(())
}
