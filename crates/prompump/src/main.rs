//! Prometheus scrape pump: keeps the gauge registry current from the
//! `/prometheus` topic and serves it on `/metrics`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use prompump::GaugeRegistry;
use pumpkit::BusSettings;
use telebus::{topics, TelemetryBusClient};

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_port")]
    prometheus_http_port: u16,
}

const fn default_port() -> u16 {
    2112
}

type SharedRegistry = Arc<Mutex<GaugeRegistry>>;

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse PROMETHEUS_* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "prompump", pumpkit::PUMP_RETRY).await;

    let client = TelemetryBusClient::new(bus.clone());
    let mut groups = client
        .group_stream(topics::PROMETHEUS)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::PROMETHEUS).await?;
    client.get(topics::PROMETHEUS).await?;

    let registry: SharedRegistry = Arc::new(Mutex::new(GaugeRegistry::new()));

    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(group) = groups.recv().await {
                registry
                    .lock()
                    .expect("gauge registry lock")
                    .observe_group(&group.values);
            }
            warn!("group stream ended");
        });
    }

    let app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], raw.prometheus_http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "serving scrape endpoint");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics(State(registry): State<SharedRegistry>) -> String {
    registry.lock().expect("gauge registry lock").render()
}
