//! Service/client round trips over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use telebus::{
    topics, CommandKind, DataGroup, DataProducer, DataValue, ProducerState, TelemetryBusClient,
    TelemetryBusService,
};
use wirebus::{Bus, MemoryBus};

fn sample_group(report: &str, system: &str) -> DataGroup {
    DataGroup {
        id: report.to_string(),
        system_id: system.to_string(),
        timestamp: "2024-01-01T00:00:00Z".to_string(),
        values: vec![DataValue {
            id: "TemperatureReading".to_string(),
            context: "CPU.Socket.1".to_string(),
            value: "42".to_string(),
            system_id: system.to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// One group published after registration reaches every registered topic
/// subscriber, in publish order per subscriber.
#[tokio::test]
async fn groups_reach_every_registered_topic() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
    let client = TelemetryBusClient::new(Arc::clone(&bus));

    let (commands, _sink) = mpsc::channel(4);
    {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.receive_commands(commands).await });
    }

    let mut otel = client.group_stream(topics::OTEL).await.unwrap();
    let mut influx = client.group_stream(topics::INFLUX).await.unwrap();

    for _ in 0..100 {
        client.subscribe(topics::OTEL).await.unwrap();
        client.subscribe(topics::INFLUX).await.unwrap();
        if service.receivers().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.receivers().len(), 2);

    service.send_group(&sample_group("PowerMetrics", "A")).await;
    service.send_group(&sample_group("NICStatistics", "A")).await;

    assert_eq!(otel.recv().await.unwrap().id, "PowerMetrics");
    assert_eq!(otel.recv().await.unwrap().id, "NICStatistics");
    assert_eq!(influx.recv().await.unwrap().id, "PowerMetrics");
    assert_eq!(influx.recv().await.unwrap().id, "NICStatistics");
}

/// The producer listing answers on the queue named in the command.
#[tokio::test]
async fn producer_listing_round_trips() {
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
    let client = TelemetryBusClient::new(Arc::clone(&bus));

    // Stand-in for the ingest daemon's command handler.
    let (commands, mut rx) = mpsc::channel(4);
    {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.receive_commands(commands).await });
    }
    {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if command.command == CommandKind::GetProducers {
                    let producers = vec![DataProducer {
                        host_name: "10.35.0.12".to_string(),
                        username: "root".to_string(),
                        state: ProducerState::Running,
                        last_event: Utc::now(),
                    }];
                    service
                        .send_producers_to(&producers, &command.receive_queue)
                        .await
                        .unwrap();
                }
            }
        });
    }

    // The handler task subscribes asynchronously; retry until it answers.
    let producers = loop {
        let listed = tokio::time::timeout(
            Duration::from_millis(100),
            client.get_producers("/replies/test-ui"),
        )
        .await;
        if let Ok(Ok(producers)) = listed {
            break producers;
        }
    };
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].host_name, "10.35.0.12");
    assert_eq!(producers[0].state, ProducerState::Running);
}
