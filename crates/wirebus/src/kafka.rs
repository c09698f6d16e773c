//! Outbound-only Kafka transport, used by the Kafka pump.
//!
//! Destinations map to topic names by replacing `/` with `_`. Delivery has a
//! 10 s deadline. Broker failures that a reconnect inside this process
//! cannot repair (transport loss, every broker down, delivery deadline
//! blown) terminate the process so an external supervisor restarts it;
//! upstream re-emits, so the restart is idempotent.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::error;

use crate::{Bus, BusError, Result, Subscription};

const SEND_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct KafkaTlsConfig {
    /// Path to the broker CA bundle (PEM). TLS is enabled when set.
    pub ca_location: String,
    /// Optional client certificate/key pair (PEM paths).
    pub client_cert: String,
    pub client_key: String,
    /// Skip hostname verification of the broker certificate.
    pub skip_verify: bool,
}

pub struct KafkaBus {
    producer: FutureProducer,
    partition: i32,
}

impl KafkaBus {
    pub fn connect(broker: &str, partition: i32, tls: Option<&KafkaTlsConfig>) -> Result<Self> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", broker)
            .set("message.timeout.ms", "10000");

        if let Some(tls) = tls.filter(|tls| !tls.ca_location.is_empty()) {
            config
                .set("security.protocol", "ssl")
                .set("ssl.ca.location", &tls.ca_location);
            if !tls.client_cert.is_empty() && !tls.client_key.is_empty() {
                config
                    .set("ssl.certificate.location", &tls.client_cert)
                    .set("ssl.key.location", &tls.client_key);
            }
            if tls.skip_verify {
                config.set("enable.ssl.certificate.verification", "false");
            }
        }

        let producer = config
            .create::<FutureProducer>()
            .map_err(|err| BusError::Connect(err.to_string()))?;

        Ok(Self { producer, partition })
    }

    pub fn topic_for(destination: &str) -> String {
        destination.replace('/', "_")
    }
}

fn is_fatal(err: &KafkaError) -> bool {
    matches!(
        err,
        KafkaError::MessageProduction(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::OperationTimedOut
        )
    )
}

#[async_trait]
impl Bus for KafkaBus {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<()> {
        let topic = Self::topic_for(destination);
        let record = FutureRecord::<(), [u8]>::to(&topic)
            .partition(self.partition)
            .payload(payload);

        match self.producer.send(record, Timeout::After(SEND_DEADLINE)).await {
            Ok(_) => Ok(()),
            Err((err, _)) if is_fatal(&err) => {
                error!(%topic, error = %err, "fatal broker write error, exiting for supervisor restart");
                std::process::exit(1);
            }
            Err((err, _)) => Err(BusError::Transport(err.to_string())),
        }
    }

    async fn subscribe(&self, _destination: &str) -> Result<Subscription> {
        Err(BusError::SubscribeUnsupported)
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(SEND_DEADLINE))
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_map_to_topics() {
        assert_eq!(KafkaBus::topic_for("/databus"), "_databus");
        assert_eq!(KafkaBus::topic_for("/poweredge/metrics"), "_poweredge_metrics");
        assert_eq!(KafkaBus::topic_for("plain"), "plain");
    }

    #[test]
    fn transport_loss_is_fatal_but_queue_full_is_not() {
        assert!(is_fatal(&KafkaError::MessageProduction(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(is_fatal(&KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut
        )));
        assert!(!is_fatal(&KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
        )));
    }
}
