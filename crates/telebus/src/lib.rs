//! Canonical telemetry model and the bus services that move it.

pub mod model;
pub mod service;

pub use model::{DataGroup, DataProducer, DataValue, EventValue, ProducerState};
pub use service::{
    topics, Command, CommandKind, GroupStream, Response, TelemetryBusClient, TelemetryBusService,
    COMMAND_QUEUE,
};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] wirebus::BusError),

    #[error("invalid bus payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("response stream closed before a reply arrived")]
    StreamClosed,
}
