//! Process state owned by the ingest daemon: the monitor index and the
//! read-through snapshot cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use telebus::{DataGroup, DataProducer, ProducerState};

/// Handle to one live device monitor. The monitor task owns its Redfish
/// client and subscriptions; the handle owns the cancellation side.
pub struct MonitorHandle {
    pub host: String,
    pub username: String,
    pub cancel: CancellationToken,
    pub state: Arc<StdRwLock<ProducerState>>,
    pub last_event: Arc<StdRwLock<DateTime<Utc>>>,
    pub task: JoinHandle<()>,
}

/// `ip → monitor` index. Mutated only by the service-channel task and the
/// delete path; reads come from the command handler.
#[derive(Default)]
pub struct Monitors {
    inner: RwLock<HashMap<String, MonitorHandle>>,
}

impl Monitors {
    pub async fn contains(&self, ip: &str) -> bool {
        self.inner.read().await.contains_key(ip)
    }

    pub async fn insert(&self, ip: &str, handle: MonitorHandle) {
        self.inner.write().await.insert(ip.to_string(), handle);
    }

    pub async fn cancel_token(&self, ip: &str) -> Option<CancellationToken> {
        self.inner.read().await.get(ip).map(|h| h.cancel.clone())
    }

    pub async fn remove(&self, ip: &str) -> Option<MonitorHandle> {
        self.inner.write().await.remove(ip)
    }

    pub async fn producers(&self) -> Vec<DataProducer> {
        self.inner
            .read()
            .await
            .values()
            .map(|handle| DataProducer {
                host_name: handle.host.clone(),
                username: handle.username.clone(),
                state: *handle.state.read().expect("producer state lock"),
                last_event: *handle.last_event.read().expect("last event lock"),
            })
            .collect()
    }
}

/// `system id → report id → group` cache backing `get` snapshot replies.
/// Writers are the parsers; readers iterate under the read half.
#[derive(Default)]
pub struct Snapshots {
    inner: RwLock<HashMap<String, HashMap<String, DataGroup>>>,
}

impl Snapshots {
    /// Record a freshly parsed group, overwriting the prior report contents.
    pub async fn record(&self, group: &DataGroup) {
        self.inner
            .write()
            .await
            .entry(group.system_id.clone())
            .or_default()
            .insert(group.id.clone(), group.clone());
    }

    pub async fn all(&self) -> Vec<DataGroup> {
        self.inner
            .read()
            .await
            .values()
            .flat_map(|reports| reports.values().cloned())
            .collect()
    }

    pub async fn get(&self, system_id: &str, report_id: &str) -> Option<DataGroup> {
        self.inner
            .read()
            .await
            .get(system_id)
            .and_then(|reports| reports.get(report_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_overwrite_per_report() {
        let snapshots = Snapshots::default();
        let mut group = DataGroup {
            id: "PowerMetrics".to_string(),
            system_id: "7GHX123".to_string(),
            sequence: "1".to_string(),
            ..Default::default()
        };
        snapshots.record(&group).await;
        group.sequence = "2".to_string();
        snapshots.record(&group).await;

        let cached = snapshots.get("7GHX123", "PowerMetrics").await.unwrap();
        assert_eq!(cached.sequence, "2");
        assert_eq!(snapshots.all().await.len(), 1);
    }

    #[tokio::test]
    async fn snapshots_key_by_system_then_report() {
        let snapshots = Snapshots::default();
        for (system, report) in [("A", "r1"), ("A", "r2"), ("B", "r1")] {
            snapshots
                .record(&DataGroup {
                    id: report.to_string(),
                    system_id: system.to_string(),
                    ..Default::default()
                })
                .await;
        }
        assert_eq!(snapshots.all().await.len(), 3);
        assert!(snapshots.get("B", "r1").await.is_some());
        assert!(snapshots.get("B", "r2").await.is_none());
    }
}
