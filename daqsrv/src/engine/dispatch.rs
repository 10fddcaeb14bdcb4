//! Dispatch fan-out: a bounded queue of change events and the single drain
//! task that performs the three per-device effects (realtime-cache update,
//! history append, push publish) in parallel.
//!
//! Ordering contract: within one device, the effects of event `k` complete
//! before those of event `k+1` are dispatched (one drain task, per-device
//! grouping preserves arrival order). Across devices there is no ordering.
//! History and push failures are logged and dropped; they never fail a
//! device cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use daqsrv_protocol::{ChangeEvent, DeviceSnapshot, HistoryRow};

use crate::engine::cache::RealtimeCache;
use crate::sinks::{HistorySink, PushChannel};

pub const QUEUE_CAPACITY: usize = 1024;
const BATCH_LIMIT: usize = 256;

/// One queue element: the change event plus the complete snapshot the
/// owning device task built right after updating its state. Carrying the
/// snapshot keeps the device state single-writer while giving the fan-out
/// the complete (not diffed) view it publishes.
pub struct ChangeNotice {
    pub event: ChangeEvent,
    pub snapshot: Arc<DeviceSnapshot>,
}

pub struct Dispatcher {
    rx: mpsc::Receiver<ChangeNotice>,
    cache: RealtimeCache,
    history: Arc<dyn HistorySink>,
    push: Arc<dyn PushChannel>,
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<ChangeNotice>,
        cache: RealtimeCache,
        history: Arc<dyn HistorySink>,
        push: Arc<dyn PushChannel>,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            rx,
            cache,
            history,
            push,
            pending,
        }
    }

    /// Drain until every sender is gone and the queue is empty. An enqueue
    /// into an idle queue is processed immediately; under load, whatever
    /// accumulated since the last pass is batched together.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < BATCH_LIMIT {
                match self.rx.try_recv() {
                    Ok(x) => batch.push(x),
                    Err(_) => break,
                }
            }
            self.pending.fetch_sub(batch.len(), Ordering::SeqCst);
            self.process(batch).await;
        }
        log::debug!("change queue closed, dispatcher exiting");
    }

    async fn process(&self, batch: Vec<ChangeNotice>) {
        // group by device, preserving arrival order within each group
        let mut groups: Vec<(String, Vec<ChangeNotice>)> = Vec::new();
        for notice in batch {
            let device_id = notice.event.device_id.clone();
            match groups.iter_mut().find(|(id, _)| *id == device_id) {
                Some((_, group)) => group.push(notice),
                None => groups.push((device_id, vec![notice])),
            }
        }

        for (device_id, notices) in groups {
            let snapshot = match notices.last() {
                Some(last) => last.snapshot.clone(),
                None => continue,
            };
            let rows: Vec<HistoryRow> = notices.iter().map(history_row).collect();

            let cache = async {
                self.cache.insert(&device_id, snapshot.clone());
            };
            let history = async {
                if let Err(err) = self.history.append_many(rows).await {
                    log::error!("history append for {} failed: {}", device_id, err);
                }
            };
            let push = async {
                if let Err(err) = self.push.publish_snapshot(&device_id, &snapshot).await {
                    log::warn!("push publish for {} failed: {}", device_id, err);
                }
            };
            tokio::join!(cache, history, push);
        }
    }
}

fn history_row(notice: &ChangeNotice) -> HistoryRow {
    let event = &notice.event;
    let unit = notice
        .snapshot
        .readings
        .iter()
        .find(|x| x.address() == event.address)
        .and_then(|x| x.unit().map(|u| u.to_string()));
    HistoryRow {
        device_id: event.device_id.clone(),
        parameter_name: event.register_name.clone(),
        value: event.new_value.clone(),
        unit,
        timestamp: event.timestamp,
        quality: "good".to_string(),
        source: event.source,
        old_value: event.old_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use daqsrv_protocol::{ChangeSource, DataType, Reading, Result, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHistory {
        rows: Mutex<Vec<HistoryRow>>,
    }

    #[async_trait]
    impl HistorySink for RecordingHistory {
        async fn append_many(&self, rows: Vec<HistoryRow>) -> Result<()> {
            self.rows.lock().unwrap().extend(rows);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPush {
        published: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl PushChannel for RecordingPush {
        async fn publish_snapshot(&self, device_id: &str, snapshot: &DeviceSnapshot) -> Result<()> {
            if self.fail {
                return Err(daqsrv_protocol::Error::internal(anyhow::anyhow!("down")));
            }
            self.published
                .lock()
                .unwrap()
                .push((device_id.to_string(), snapshot.readings.len()));
            Ok(())
        }
    }

    fn snapshot(value: f64) -> Arc<DeviceSnapshot> {
        Arc::new(DeviceSnapshot {
            device_name: "Meter A".to_string(),
            timestamp: Utc::now(),
            readings: vec![Reading::Ok {
                name: "voltage".to_string(),
                address: 200,
                value: Value::Number(value),
                unit: Some("V".to_string()),
                data_type: DataType::Uint16,
            }],
        })
    }

    fn notice(device_id: &str, old: f64, new: f64) -> ChangeNotice {
        ChangeNotice {
            event: ChangeEvent {
                device_id: device_id.to_string(),
                address: 200,
                register_name: "voltage".to_string(),
                old_value: Value::Number(old),
                new_value: Value::Number(new),
                timestamp: Utc::now(),
                source: ChangeSource::Modbus,
            },
            snapshot: snapshot(new),
        }
    }

    #[tokio::test]
    async fn fans_out_to_cache_history_and_push() {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cache = RealtimeCache::new();
        let history = Arc::new(RecordingHistory::default());
        let push = Arc::new(RecordingPush::default());
        let pending = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            rx,
            cache.clone(),
            history.clone(),
            push.clone(),
            pending.clone(),
        );
        let drain = tokio::spawn(dispatcher.run());

        pending.fetch_add(2, Ordering::SeqCst);
        tx.send(notice("dev-1", 10.0, 10.5)).await.unwrap();
        tx.send(notice("dev-1", 10.5, 11.0)).await.unwrap();
        drop(tx);
        drain.await.unwrap();

        assert_eq!(pending.load(Ordering::SeqCst), 0);
        let rows = history.rows.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quality, "good");
        assert_eq!(rows[0].unit.as_deref(), Some("V"));
        assert_eq!(rows[0].old_value, Value::Number(10.0));
        assert_eq!(rows[1].value, Value::Number(11.0));

        // the cache holds the complete snapshot of the latest event
        let cached = cache.get("dev-1").unwrap();
        assert_eq!(cached.readings[0].value(), Value::Number(11.0));
        assert!(!push.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_failures_do_not_stop_the_other_effects() {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cache = RealtimeCache::new();
        let history = Arc::new(RecordingHistory::default());
        let push = Arc::new(RecordingPush {
            fail: true,
            ..Default::default()
        });
        let pending = Arc::new(AtomicUsize::new(0));
        let dispatcher =
            Dispatcher::new(rx, cache.clone(), history.clone(), push, pending.clone());
        let drain = tokio::spawn(dispatcher.run());

        pending.fetch_add(1, Ordering::SeqCst);
        tx.send(notice("dev-1", 1.0, 2.0)).await.unwrap();
        drop(tx);
        drain.await.unwrap();

        assert_eq!(history.rows.lock().unwrap().len(), 1);
        assert!(cache.get("dev-1").is_some());
    }
}
