//! Per-device supervision: one monitor per BMC, owning its Redfish client,
//! its SSE subscriptions, and its cancellation handle.
//!
//! Lifecycle: `Starting → Running → (TelemetryNotFound | ConnectionFailed)`.
//! A device whose client or initial info retrieval fails stays in the index
//! as a `ConnectionFailed` stub so the fleet view can surface it.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use redfish::{Credentials, Payload, StreamEvent};
use registry::{AuthType, Service};
use telebus::{DataGroup, ProducerState, TelemetryBusService};

use crate::parse::{self, DeviceDescriptors};
use crate::state::{MonitorHandle, Monitors, Snapshots};

/// Inactivity window after which a listener is relaunched regardless of what
/// the stream reports.
const WATCHDOG: Duration = Duration::from_secs(5 * 60);

/// Grace applied after a declared connection error, giving a rebooting BMC
/// time to come back.
const RECONNECT_GRACE: Duration = Duration::from_secs(5 * 60);

/// Everything a monitor shares with the rest of the daemon.
pub struct MonitorContext {
    pub bus_service: Arc<TelemetryBusService>,
    pub snapshots: Arc<Snapshots>,
    pub include_alerts: bool,
}

/// Register and launch a monitor for a newly announced service. A second
/// announcement for a live ip is ignored; the index is created at most once
/// per ip for the life of the entry.
pub async fn spawn_monitor(service: Service, monitors: &Arc<Monitors>, ctx: &Arc<MonitorContext>) {
    if monitors.contains(&service.ip).await {
        return;
    }
    info!(ip = %service.ip, "starting monitor for new service");

    let cancel = CancellationToken::new();
    let state = Arc::new(StdRwLock::new(ProducerState::Starting));
    let last_event = Arc::new(StdRwLock::new(Utc::now()));
    let username = service.auth.get("username").cloned().unwrap_or_default();
    let host = service.ip.clone();

    let task = tokio::spawn(run_monitor(
        service.clone(),
        cancel.clone(),
        Arc::clone(&state),
        Arc::clone(&last_event),
        Arc::clone(ctx),
    ));

    monitors
        .insert(
            &service.ip,
            MonitorHandle {
                host,
                username,
                cancel,
                state,
                last_event,
                task,
            },
        )
        .await;
}

struct DeviceMonitor {
    client: redfish::Client,
    device: DeviceDescriptors,
    cancel: CancellationToken,
    state: Arc<StdRwLock<ProducerState>>,
    last_event: Arc<StdRwLock<DateTime<Utc>>>,
    ctx: Arc<MonitorContext>,
}

async fn run_monitor(
    service: Service,
    cancel: CancellationToken,
    state: Arc<StdRwLock<ProducerState>>,
    last_event: Arc<StdRwLock<DateTime<Utc>>>,
    ctx: Arc<MonitorContext>,
) {
    let fail = |why: &str, detail: String| {
        warn!(ip = %service.ip, %detail, "{why}");
        *state.write().expect("producer state lock") = ProducerState::ConnectionFailed;
    };

    let credentials = match service.auth_type {
        AuthType::UsernamePassword => Credentials::Basic {
            username: service.auth.get("username").cloned().unwrap_or_default(),
            password: service.auth.get("password").cloned().unwrap_or_default(),
        },
        AuthType::BearerToken => Credentials::Bearer {
            token: service.auth.get("token").cloned().unwrap_or_default(),
        },
        AuthType::XAuthToken => {
            fail("unsupported auth type for monitor", "x-auth token".to_string());
            return;
        }
    };

    let client = match redfish::Client::connect(&service.ip, credentials).await {
        Ok(client) => client,
        Err(err) => {
            fail("failed to initialize redfish client", err.to_string());
            return;
        }
    };
    let system_id = match client.system_id().await {
        Ok(id) => id,
        Err(err) => {
            fail("failed to get system id", err.to_string());
            return;
        }
    };
    let info = match client.sys_info().await {
        Ok(info) => info,
        Err(err) => {
            fail("failed to get system info", err.to_string());
            return;
        }
    };
    info!(ip = %service.ip, %system_id, firmware = %info.firmware_version, "device identified");

    let monitor = DeviceMonitor {
        client,
        device: DeviceDescriptors {
            system_id,
            host_name: info.host_name,
            model: info.model,
            sku: info.sku,
            fqdn: info.fqdn,
            firmware_version: info.firmware_version,
            image_id: info.active_image_id,
        },
        cancel,
        state,
        last_event,
        ctx,
    };
    monitor.run().await;
}

enum Restart {
    Cancelled,
    ConnectionError,
    IdleTimeout,
    Other,
}

impl DeviceMonitor {
    async fn run(&self) {
        // Telemetry support is mandatory; without it the producer parks in
        // TelemetryNotFound for the admin surface.
        match self.client.get("/redfish/v1").await {
            Ok(root) => match root.field("TelemetryService").await {
                Ok(telemetry) => {
                    self.sync_existing_reports(&telemetry).await;
                }
                Err(_) => {
                    warn!(system = %self.device.system_id, "device has no telemetry service");
                    self.set_state(ProducerState::TelemetryNotFound);
                    return;
                }
            },
            Err(err) => {
                warn!(system = %self.device.system_id, error = %err, "failed to re-read service root");
                self.set_state(ProducerState::ConnectionFailed);
                return;
            }
        }

        self.set_state(ProducerState::Running);

        if self.ctx.include_alerts {
            let alerts = self.clone_for_task();
            tokio::spawn(async move { alerts.alert_loop().await });
        }
        self.metric_loop().await;
    }

    fn clone_for_task(&self) -> Self {
        Self {
            client: self.client.clone(),
            device: self.device.clone(),
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
            last_event: Arc::clone(&self.last_event),
            ctx: Arc::clone(&self.ctx),
        }
    }

    fn set_state(&self, state: ProducerState) {
        *self.state.write().expect("producer state lock") = state;
    }

    fn touch(&self) {
        *self.last_event.write().expect("last event lock") = Utc::now();
    }

    /// Parse every report the device already holds so the snapshot cache is
    /// warm before the first SSE frame arrives.
    async fn sync_existing_reports(&self, telemetry: &Payload) {
        let reports = match telemetry.field("MetricReports").await {
            Ok(reports) => reports,
            Err(err) => {
                warn!(system = %self.device.system_id, error = %err, "failed to list metric reports");
                return;
            }
        };
        let size = reports.collection_size();
        info!(system = %self.device.system_id, count = size, "found existing metric reports");
        for i in 0..size {
            let report = match reports.index(i).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(system = %self.device.system_id, index = i, error = %err, "failed to fetch metric report");
                    continue;
                }
            };
            self.handle_metric_report(&report).await;
        }
    }

    async fn metric_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let attempt = self.cancel.child_token();
            let (tx, mut rx) = mpsc::channel(10);
            let client = self.client.clone();
            let listener_cancel = attempt.clone();
            let listener = tokio::spawn(async move {
                client.listen_for_metric_reports(listener_cancel, tx).await;
            });

            let restart = self.pump(&mut rx, true).await;
            attempt.cancel();
            listener.abort();

            match restart {
                Restart::Cancelled => return,
                Restart::ConnectionError => {
                    info!(system = %self.device.system_id, "connection error, waiting before relaunching metric listener");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_GRACE) => {}
                    }
                }
                Restart::IdleTimeout | Restart::Other => {
                    info!(system = %self.device.system_id, "relaunching metric listener");
                }
            }
        }
    }

    async fn alert_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let attempt = self.cancel.child_token();
            let (tx, mut rx) = mpsc::channel(10);
            let client = self.client.clone();
            let listener_cancel = attempt.clone();
            let listener = tokio::spawn(async move {
                client.listen_for_alerts(listener_cancel, tx).await;
            });

            let restart = self.pump(&mut rx, false).await;
            attempt.cancel();
            listener.abort();

            match restart {
                Restart::Cancelled => return,
                Restart::ConnectionError => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_GRACE) => {}
                    }
                }
                Restart::IdleTimeout | Restart::Other => {
                    info!(system = %self.device.system_id, "relaunching alert listener");
                }
            }
        }
    }

    /// Drain one listener until it closes, the watchdog fires, or we are
    /// cancelled.
    async fn pump(&self, rx: &mut mpsc::Receiver<StreamEvent>, metrics: bool) -> Restart {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Restart::Cancelled,
                _ = tokio::time::sleep(WATCHDOG) => {
                    warn!(system = %self.device.system_id, "no events inside the watchdog window");
                    return Restart::Other;
                }
                event = rx.recv() => match event {
                    None => return Restart::Other,
                    Some(StreamEvent::Closed(err)) if err.is_connection_error() => {
                        warn!(system = %self.device.system_id, error = %err, "listener closed");
                        return Restart::ConnectionError;
                    }
                    Some(StreamEvent::Closed(err)) if err.is_idle_timeout() => {
                        info!(system = %self.device.system_id, "sse idle timeout");
                        return Restart::IdleTimeout;
                    }
                    Some(StreamEvent::Closed(err)) => {
                        warn!(system = %self.device.system_id, error = %err, "listener failed");
                        return Restart::Other;
                    }
                    Some(StreamEvent::Frame { payload, .. }) => {
                        self.touch();
                        if metrics {
                            self.on_metric_frame(&payload).await;
                        } else {
                            self.on_alert_frame(&payload).await;
                        }
                    }
                }
            }
        }
    }

    async fn on_metric_frame(&self, payload: &Payload) {
        let is_report = payload
            .string("@odata.type")
            .map(|t| t.contains(".MetricReport"))
            .unwrap_or(false);
        if !is_report {
            debug!(system = %self.device.system_id, "ignoring sse event that is not a metric report");
            return;
        }
        self.handle_metric_report(payload).await;
    }

    async fn on_alert_frame(&self, payload: &Payload) {
        let is_event = payload
            .string("@odata.type")
            .map(|t| t.contains(".Event"))
            .unwrap_or(false);
        if !is_event {
            debug!(system = %self.device.system_id, "ignoring sse event that is not an alert");
            return;
        }
        match parse::alert(payload.raw(), &self.device) {
            Ok(group) => self.publish(group).await,
            Err(err) => {
                warn!(system = %self.device.system_id, error = %err, "failed to parse alert");
            }
        }
    }

    async fn handle_metric_report(&self, payload: &Payload) {
        let report = match self.materialize_report(payload).await {
            Ok(report) => report,
            Err(err) => {
                warn!(system = %self.device.system_id, error = %err, "failed to resolve metric report values");
                return;
            }
        };
        match parse::metric_report(&report, &self.device) {
            Ok(group) => {
                debug!(system = %self.device.system_id, report = %group.id, values = group.values.len(), "parsed metric report");
                self.publish(group).await;
            }
            Err(err) => {
                warn!(system = %self.device.system_id, error = %err, "failed to parse metric report");
            }
        }
    }

    /// Inline `MetricValues` when the report references them by `@odata.id`.
    async fn materialize_report(&self, payload: &Payload) -> redfish::Result<Value> {
        let mut report = payload.raw().clone();
        if report.get("MetricValues").is_some() {
            let values = payload.field("MetricValues").await?;
            report["MetricValues"] = values.raw().clone();
        }
        Ok(report)
    }

    /// Fan the group out to every registered topic and refresh the snapshot.
    async fn publish(&self, group: DataGroup) {
        self.ctx.bus_service.send_group(&group).await;
        self.ctx.snapshots.record(&group).await;
    }
}
