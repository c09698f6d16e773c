//! Shared plumbing for the egress pumps: the bus-addressable config surface,
//! environment bootstrap, broker dialing, and outbound TLS.

pub mod bootstrap;
pub mod config;
pub mod telemetry;

pub use bootstrap::{
    connect_bus, outbound_client, reply_queue, wait_for_required, BusSettings, TlsSettings,
    CONFIG_POLL, PUMP_RETRY,
};
pub use config::{
    ConfigClient, ConfigCommand, ConfigEntry, ConfigMap, ConfigReply, ConfigService, ConfigVerb,
    EntryKind,
};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] wirebus::BusError),

    #[error("invalid config payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unknown property {0}")]
    UnknownProperty(String),

    #[error("failed to write certificate {name}: {source}")]
    CertWrite {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("response stream closed before a reply arrived")]
    StreamClosed,
}
