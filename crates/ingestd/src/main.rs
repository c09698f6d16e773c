//! Redfish telemetry ingest daemon.
//!
//! Consumes service records from the registry, runs one monitor per BMC, and
//! fans every parsed group out onto the telemetry bus. Also answers the
//! `/databus` command surface: snapshot replay, producer listing, producer
//! deletion, terminate.

mod monitor;
mod parse;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pumpkit::BusSettings;
use registry::RegistryClient;
use telebus::{CommandKind, TelemetryBusService};

use crate::monitor::MonitorContext;
use crate::state::{Monitors, Snapshots};

/// Broker dial retry for the ingest side.
const BUS_RETRY: Duration = Duration::from_secs(5);

/// Grace between cancelling a monitor and dropping it from the index.
const DELETE_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let settings = BusSettings::from_env()?;
    let include_alerts = std::env::var("INCLUDE_ALERTS")
        .map(|flag| !flag.is_empty())
        .unwrap_or(false);

    let bus = pumpkit::connect_bus(&settings, "ingestd", BUS_RETRY).await;
    let registry_client = RegistryClient::new(Arc::clone(&bus));
    let bus_service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
    let monitors = Arc::new(Monitors::default());
    let snapshots = Arc::new(Snapshots::default());
    let ctx = Arc::new(MonitorContext {
        bus_service: Arc::clone(&bus_service),
        snapshots: Arc::clone(&snapshots),
        include_alerts,
    });

    // Command surface.
    let (command_tx, mut command_rx) = mpsc::channel(10);
    {
        let service = Arc::clone(&bus_service);
        tokio::spawn(async move {
            if let Err(err) = service.receive_commands(command_tx).await {
                error!(error = %err, "command receiver ended");
            }
        });
    }

    // Service records: subscribe first, then ask for a full replay.
    let mut services = registry_client
        .service_stream()
        .await
        .context("failed to subscribe to service events")?;
    registry_client
        .resend_all()
        .await
        .context("failed to request service replay")?;
    {
        let monitors = Arc::clone(&monitors);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Some(service) = services.recv().await {
                monitor::spawn_monitor(service, &monitors, &ctx).await;
            }
        });
    }

    info!(include_alerts, "redfish telemetry ingest service initialized");

    while let Some(command) = command_rx.recv().await {
        info!(command = ?command.command, "received command");
        match command.command {
            CommandKind::Get => {
                for group in snapshots.all().await {
                    if let Err(err) = bus_service.send_group_to(&group, &command.receive_queue).await
                    {
                        warn!(queue = %command.receive_queue, error = %err, "failed to replay snapshot");
                        break;
                    }
                }
            }
            CommandKind::GetProducers => {
                let producers = monitors.producers().await;
                if let Err(err) = bus_service
                    .send_producers_to(&producers, &command.receive_queue)
                    .await
                {
                    warn!(queue = %command.receive_queue, error = %err, "failed to send producers");
                }
            }
            CommandKind::DeleteProducer => {
                let ip = command.service_ip.clone();
                let Some(cancel) = monitors.cancel_token(&ip).await else {
                    warn!(%ip, "delete for unknown producer");
                    continue;
                };
                cancel.cancel();
                let monitors = Arc::clone(&monitors);
                tokio::spawn(async move {
                    tokio::time::sleep(DELETE_GRACE).await;
                    if let Some(handle) = monitors.remove(&ip).await {
                        handle.task.abort();
                        info!(%ip, "producer removed");
                    }
                });
            }
            CommandKind::Terminate => {
                info!("terminate received, exiting");
                std::process::exit(0);
            }
            CommandKind::Subscribe => {}
        }
    }
    Ok(())
}
