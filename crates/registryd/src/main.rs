//! Durable service registry daemon.
//!
//! Owns the relational record set. On start it replays every stored record
//! onto the event queue, then consumes registration commands. Database
//! errors are logged and the current command skipped; there is no retry
//! loop, the admin surface simply re-issues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pumpkit::BusSettings;
use registry::{Command, CommandKind, PgStore, RegistryService, Service, ServiceStore};
use telebus::TelemetryBusClient;

const BUS_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RawDbSettings {
    #[serde(default)]
    registrydb_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    registrydb_max_pool_size: u32,
}

const fn default_pool_size() -> u32 {
    4
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawDbSettings =
        envy::from_env().context("failed to parse REGISTRYDB_* environment variables")?;
    let database_url = raw
        .registrydb_url
        .or(raw.database_url)
        .context("REGISTRYDB_URL or DATABASE_URL must be set")?;

    // Losing the database at startup is a condition a container restart
    // actually resolves, so it is allowed to be fatal here.
    let store = PgStore::connect(&database_url, raw.registrydb_max_pool_size)
        .await
        .context("failed to open registry database")?;
    store
        .ensure_schema()
        .await
        .context("failed to create services table")?;

    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "registryd", BUS_RETRY).await;
    let service = RegistryService::new(Arc::clone(&bus));
    let telemetry_client = TelemetryBusClient::new(Arc::clone(&bus));

    replay_all(&store, &service).await;

    let (tx, mut rx) = mpsc::channel::<Command>(10);
    {
        tokio::spawn(async move {
            if let Err(err) = service.receive_commands(tx).await {
                error!(error = %err, "registry command receiver ended");
            }
        });
    }
    // A second handle for publishing; the first moved into the receiver task.
    let service = RegistryService::new(Arc::clone(&bus));

    info!("service registry initialized");

    while let Some(command) = rx.recv().await {
        info!(command = ?command.command, "received command");
        match command.command {
            CommandKind::Resend => replay_all(&store, &service).await,
            CommandKind::AddService => {
                let Some(record) = command.service else {
                    warn!("addservice without a service record");
                    continue;
                };
                add_service(&store, &service, record).await;
            }
            CommandKind::DeleteService => {
                let Some(record) = command.service else {
                    warn!("deleteservice without a service record");
                    continue;
                };
                if let Err(err) = store.delete(&record.ip).await {
                    error!(ip = %record.ip, error = %err, "failed to delete service");
                    continue;
                }
                // Tear the live monitor down with the record.
                if let Err(err) = telemetry_client.delete_producer("", &record.ip).await
                {
                    warn!(ip = %record.ip, error = %err, "failed to request producer deletion");
                }
                info!(ip = %record.ip, "service deleted");
            }
            CommandKind::Terminate => {
                info!("terminate received, exiting");
                std::process::exit(0);
            }
        }
    }
    Ok(())
}

async fn replay_all(store: &PgStore, service: &RegistryService) {
    let records = match store.list().await {
        Ok(records) => records,
        Err(err) => {
            error!(error = %err, "failed to list services");
            return;
        }
    };
    info!(count = records.len(), "replaying service records");
    for record in records {
        if let Err(err) = service.send_service(&record).await {
            warn!(ip = %record.ip, error = %err, "failed to publish service event");
        }
    }
}

async fn add_service(store: &PgStore, service: &RegistryService, record: Service) {
    if let Err(err) = record.validate() {
        warn!(ip = %record.ip, error = %err, "rejecting invalid service record");
        return;
    }
    if let Err(err) = store.add(&record).await {
        error!(ip = %record.ip, error = %err, "failed to store service");
        return;
    }
    if let Err(err) = service.send_service(&record).await {
        warn!(ip = %record.ip, error = %err, "failed to publish service event");
    }
    info!(ip = %record.ip, "service added");
}
