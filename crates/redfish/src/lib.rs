//! Per-host Redfish HTTP/JSON client with server-sent-event streaming.
//!
//! BMCs generally present self-signed certificates, so certificate
//! verification is disabled per client; operators opt in to verification at
//! the sink side, not here. Authentication is basic or bearer. Event
//! subscriptions go through the service's `ServerSentEventUri` with a filter
//! vocabulary selected by firmware version up front; probing the wrong
//! vocabulary yields 400s that are indistinguishable from connection loss.

pub mod error;
mod payload;
pub mod sse;

pub use error::{Error, Result};
pub use payload::{Node, Payload};
pub use sse::{Frame, FrameParser};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// BMCs drop an SSE connection that has carried no events for about an hour.
pub const SSE_IDLE_CEILING: Duration = Duration::from_secs(60 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SSE_CONNECT_ATTEMPTS: u32 = 5;
const SSE_BACKOFF_START: Duration = Duration::from_secs(5);
const SSE_BACKOFF_CAP: Duration = Duration::from_secs(240);

/// Firmware below this version requires the quoted-literal filter forms.
const LEGACY_FIRMWARE: &str = "4.00.00.00";

#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Credentials::Basic { username, .. } => username,
            Credentials::Bearer { .. } => "",
        }
    }
}

/// Which event stream to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    MetricReport,
    Alert,
}

impl EventFilter {
    fn query(self, firmware_version: &str) -> &'static str {
        let legacy = firmware_version < LEGACY_FIRMWARE;
        match (self, legacy) {
            (Self::MetricReport, false) => "?$filter=EventFormatType%20eq%20MetricReport",
            (Self::MetricReport, true) => "?$filter=EventFormatType%20eq%20%27MetricReport%27",
            (Self::Alert, false) => "?$filter=EventFormatType%20eq%20Event",
            (Self::Alert, true) => "?$filter=EventType%20eq%20%27Alert%27",
        }
    }
}

/// One message on a listener channel: a parsed frame, or the sentinel that
/// closes the stream. After a `Closed` the source is gone and the caller
/// decides the restart policy.
pub enum StreamEvent {
    Frame { id: String, payload: Payload },
    Closed(Error),
}

/// Host descriptors gathered once per device at monitor start.
#[derive(Debug, Clone, Default)]
pub struct SysInfo {
    pub host_name: String,
    pub sku: String,
    pub model: String,
    pub firmware_version: String,
    pub fqdn: String,
    pub active_image_id: String,
}

struct Inner {
    host: String,
    credentials: Credentials,
    http: reqwest::Client,
    firmware_version: RwLock<String>,
    invalid_frames: AtomicU64,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Build a client for `host` and validate it against the service root.
    pub async fn connect(host: &str, credentials: Credentials) -> Result<Self> {
        let host = bracket_ipv6(host);
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| Error::Http {
                uri: "/redfish/v1".to_string(),
                source,
            })?;

        let client = Self {
            inner: Arc::new(Inner {
                host,
                credentials,
                http,
                firmware_version: RwLock::new(String::new()),
                invalid_frames: AtomicU64::new(0),
            }),
        };
        client.get("/redfish/v1").await?;
        Ok(client)
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn username(&self) -> &str {
        self.inner.credentials.username()
    }

    /// How many SSE frames arrived with a body that was not valid JSON.
    pub fn invalid_frames(&self) -> u64 {
        self.inner.invalid_frames.load(Ordering::Relaxed)
    }

    pub fn firmware_version(&self) -> String {
        self.inner
            .firmware_version
            .read()
            .expect("firmware version lock")
            .clone()
    }

    pub fn set_firmware_version(&self, version: &str) {
        *self
            .inner
            .firmware_version
            .write()
            .expect("firmware version lock") = version.to_string();
    }

    /// GET a Redfish URI and decode the body into a [`Payload`].
    pub async fn get(&self, uri: &str) -> Result<Payload> {
        let url = format!("https://{}{}", self.inner.host, uri);
        let response = self
            .request(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| Error::Http {
                uri: uri.to_string(),
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(Error::Status {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|source| Error::Http {
            uri: uri.to_string(),
            source,
        })?;
        let value: Value = serde_json::from_slice(&body).map_err(|source| Error::Body {
            uri: uri.to_string(),
            source,
        })?;
        Ok(Payload::new(self.clone(), value))
    }

    /// The device's stable identifier: Dell OEM `ServiceTag` when present,
    /// otherwise derived from the enclosure chassis.
    pub async fn system_id(&self) -> Result<String> {
        let root = self.get("/redfish/v1").await?;
        if let Some(tag) = root
            .raw()
            .pointer("/Oem/Dell/ServiceTag")
            .and_then(Value::as_str)
            .filter(|tag| !tag.is_empty())
        {
            return Ok(tag.to_string());
        }

        let chassis = root.field("Chassis").await?;
        for i in 0..chassis.collection_size() {
            let Ok(member) = chassis.index(i).await else {
                continue;
            };
            if member.string("ChassisType") != Some("Enclosure") {
                continue;
            }
            if member.string("Name") == Some("Blade Chassis") {
                if let Some(sku) = member.string("SKU").filter(|sku| !sku.is_empty()) {
                    return Ok(sku.to_string());
                }
                // Enclosure without a SKU: fall back to the management NIC MAC.
                let uri = member.string("@odata.id").unwrap_or_default().to_string();
                let attributes = self.get(&format!("{uri}/Attributes")).await?;
                return attributes
                    .raw()
                    .pointer("/Attributes/NIC.1.MACAddress")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or(Error::NoSystemId);
            }
            if let Some(name) = member.string("Name") {
                return Ok(name.to_string());
            }
        }
        Err(Error::NoSystemId)
    }

    /// Host descriptors, with graceful defaulting for absent fields. Also
    /// records the firmware version for subsequent filter selection.
    pub async fn sys_info(&self) -> Result<SysInfo> {
        let mut info = SysInfo::default();

        let system = self
            .get("/redfish/v1/Systems/System.Embedded.1?$select=HostName,SKU,Model")
            .await?;
        info.host_name = system.string("HostName").unwrap_or_default().to_string();
        info.sku = system.string("SKU").unwrap_or_default().to_string();
        info.model = system.string("Model").unwrap_or_default().to_string();

        let nic = self
            .get("/redfish/v1/Managers/iDRAC.Embedded.1/EthernetInterfaces/NIC.1?$select=FQDN")
            .await?;
        info.fqdn = nic.string("FQDN").unwrap_or_default().to_string();

        let manager = self
            .get("/redfish/v1/Managers/iDRAC.Embedded.1?$select=FirmwareVersion,Links")
            .await?;
        info.firmware_version = manager
            .string("FirmwareVersion")
            .unwrap_or_default()
            .to_string();
        if let Some(image) = manager
            .raw()
            .pointer("/Links/ActiveSoftwareImage/@odata.id")
            .and_then(Value::as_str)
        {
            info.active_image_id = image.rsplit('/').next().unwrap_or_default().to_string();
        }

        self.set_firmware_version(&info.firmware_version);
        Ok(info)
    }

    pub async fn listen_for_metric_reports(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<StreamEvent>,
    ) {
        self.listen(EventFilter::MetricReport, cancel, events).await
    }

    pub async fn listen_for_alerts(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<StreamEvent>,
    ) {
        self.listen(EventFilter::Alert, cancel, events).await
    }

    /// Open the filtered SSE stream and forward frames until cancellation or
    /// stream loss. Errors are delivered as a [`StreamEvent::Closed`]
    /// sentinel rather than returned.
    pub async fn listen(
        &self,
        filter: EventFilter,
        cancel: CancellationToken,
        events: mpsc::Sender<StreamEvent>,
    ) {
        if let Err(err) = self.run_stream(filter, &cancel, &events).await {
            let _ = events.send(StreamEvent::Closed(err)).await;
        }
    }

    async fn run_stream(
        &self,
        filter: EventFilter,
        cancel: &CancellationToken,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let root = self.get("/redfish/v1").await?;
        let event_service = root.field("EventService").await?;
        let sse_uri = event_service
            .string("ServerSentEventUri")
            .ok_or(Error::NoSseSupport)?
            .to_string();
        let uri = format!("{}{}", sse_uri, filter.query(&self.firmware_version()));
        debug!(host = %self.inner.host, %uri, "opening sse stream");

        let response = self.open_sse(&uri).await?;
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = FrameParser::new();
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.push(&bytes) {
                            last_frame = Instant::now();
                            match serde_json::from_str(&frame.data) {
                                Ok(value) => {
                                    let event = StreamEvent::Frame {
                                        id: frame.id,
                                        payload: Payload::new(self.clone(), value),
                                    };
                                    if events.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(err) => {
                                    let dropped =
                                        self.inner.invalid_frames.fetch_add(1, Ordering::Relaxed) + 1;
                                    warn!(host = %self.inner.host, error = %err, dropped, "discarding sse frame with invalid JSON body");
                                }
                            }
                        }
                    }
                    Some(Err(err)) => return Err(Error::ConnectionLost(err.to_string())),
                    None => return Err(classify_stream_end(last_frame.elapsed())),
                },
            }
        }
    }

    async fn open_sse(&self, uri: &str) -> Result<reqwest::Response> {
        let url = format!("https://{}{}", self.inner.host, uri);
        let mut delay = SSE_BACKOFF_START;
        for attempt in 1..=SSE_CONNECT_ATTEMPTS {
            match self
                .request(&url)
                .header(header::ACCEPT, "*/*")
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::OK => return Ok(response),
                Ok(response) => {
                    warn!(host = %self.inner.host, status = %response.status(), attempt, "sse subscription rejected");
                }
                Err(err) => {
                    warn!(host = %self.inner.host, error = %err, attempt, "sse connect failed");
                }
            }
            if attempt < SSE_CONNECT_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(SSE_BACKOFF_CAP);
            }
        }
        Err(Error::ConnectionLost(format!(
            "sse connect to {} gave up after {SSE_CONNECT_ATTEMPTS} attempts",
            self.inner.host
        )))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.inner.http.get(url);
        match &self.inner.credentials {
            Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credentials::Bearer { token } => builder.bearer_auth(token),
        }
    }
}

/// EOF on an SSE stream that was quiet past the idle ceiling means the BMC
/// timed the subscription out; anything earlier is a lost connection.
fn classify_stream_end(idle_for: Duration) -> Error {
    if idle_for >= SSE_IDLE_CEILING {
        Error::SseIdleTimeout
    } else {
        Error::ConnectionLost("stream closed by peer".to_string())
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.matches(':').count() >= 2 && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_hosts_are_bracketed_once() {
        assert_eq!(bracket_ipv6("fe80::1"), "[fe80::1]");
        assert_eq!(bracket_ipv6("[fe80::1]"), "[fe80::1]");
        assert_eq!(bracket_ipv6("10.35.0.12"), "10.35.0.12");
        assert_eq!(bracket_ipv6("bmc-42.lab:8443"), "bmc-42.lab:8443");
    }

    #[test]
    fn filters_follow_firmware_vocabulary() {
        assert_eq!(
            EventFilter::MetricReport.query("4.40.00.00"),
            "?$filter=EventFormatType%20eq%20MetricReport"
        );
        assert_eq!(
            EventFilter::MetricReport.query("3.36.00.00"),
            "?$filter=EventFormatType%20eq%20%27MetricReport%27"
        );
        assert_eq!(
            EventFilter::Alert.query("6.00.30.00"),
            "?$filter=EventFormatType%20eq%20Event"
        );
        assert_eq!(
            EventFilter::Alert.query("3.36.00.00"),
            "?$filter=EventType%20eq%20%27Alert%27"
        );
    }

    #[test]
    fn quiet_eof_is_an_idle_timeout() {
        assert!(classify_stream_end(SSE_IDLE_CEILING).is_idle_timeout());
        assert!(
            classify_stream_end(Duration::from_secs(90)).is_connection_error(),
            "an early EOF is a connection error"
        );
    }

    #[test]
    fn bearer_credentials_have_no_username() {
        let basic = Credentials::Basic {
            username: "root".to_string(),
            password: "calvin".to_string(),
        };
        let bearer = Credentials::Bearer {
            token: "abc".to_string(),
        };
        assert_eq!(basic.username(), "root");
        assert_eq!(bearer.username(), "");
    }
}
