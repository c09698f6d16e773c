use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request for {uri} failed: {source}")]
    Http {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{uri} returned status {status}")]
    Status { uri: String, status: u16 },

    #[error("{uri} returned a body that is not valid JSON: {source}")]
    Body {
        uri: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no such element {0}")]
    MissingField(String),

    #[error("no such element {0}")]
    IndexOutOfRange(usize),

    #[error("service does not expose a server-sent event stream")]
    NoSseSupport,

    #[error("unable to determine system id")]
    NoSystemId,

    /// The SSE source went quiet past the idle ceiling and the BMC dropped
    /// the connection. The caller should reconnect immediately.
    #[error("sse idle timeout")]
    SseIdleTimeout,

    /// The connection was lost for any other reason. The caller should give
    /// the BMC time to come back before reconnecting.
    #[error("connection error: {0}")]
    ConnectionLost(String),
}

impl Error {
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, Error::SseIdleTimeout)
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}
