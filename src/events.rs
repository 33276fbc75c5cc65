//! Run event bus: every emit appends a `run_events` row, then fans out to
//! in-process SSE subscribers. Subscribers are held in a locked map of
//! `run_id -> Vec<(subscription_id, sender)>`; a run with no subscribers
//! left is removed from the map.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::db::events::EventsRepo;
use crate::db::Db;
use crate::ids::new_id;

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub ts: String,
}

type Subscribers = HashMap<String, Vec<(String, mpsc::UnboundedSender<EventEnvelope>)>>;

#[derive(Clone)]
pub struct EventBus {
    repo: EventsRepo,
    subscribers: Arc<Mutex<Subscribers>>,
}

pub struct Subscription {
    pub id: String,
    pub rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl EventBus {
    pub fn new(db: Db) -> Self {
        Self {
            repo: EventsRepo::new(db),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append the event to the run's log and publish to live subscribers.
    pub async fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        tenant_id: &str,
    ) -> anyhow::Result<()> {
        let row = self
            .repo
            .insert(run_id, tenant_id, event_type, &payload.to_string())
            .await?;
        let envelope = EventEnvelope {
            event_type: event_type.to_string(),
            payload,
            ts: row.ts,
        };
        self.publish(run_id, envelope);
        Ok(())
    }

    fn publish(&self, run_id: &str, envelope: EventEnvelope) {
        let senders: Vec<mpsc::UnboundedSender<EventEnvelope>> = {
            let map = self.subscribers.lock();
            match map.get(run_id) {
                Some(subs) => subs.iter().map(|(_, tx)| tx.clone()).collect(),
                None => return,
            }
        };
        for tx in senders {
            if let Err(e) = tx.send(envelope.clone()) {
                error!(run_id, error = %e, "failed to publish event to subscriber");
            }
        }
    }

    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = new_id("sub_");
        self.subscribers
            .lock()
            .entry(run_id.to_string())
            .or_default()
            .push((id.clone(), tx));
        Subscription { id, rx }
    }

    /// Remove one subscription; drops the run entry when it was the last.
    pub fn unsubscribe(&self, run_id: &str, subscription_id: &str) {
        let mut map = self.subscribers.lock();
        if let Some(subs) = map.get_mut(run_id) {
            subs.retain(|(id, _)| id != subscription_id);
            if subs.is_empty() {
                map.remove(run_id);
                debug!(run_id, "removed last subscriber, cleaned up run entry");
            }
        }
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.subscribers.lock().get(run_id).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::runs::RunsRepo;

    async fn bus_with_run() -> (EventBus, String, Db) {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let runs = RunsRepo::new(db.clone());
        let run_id = runs.create("t_default", "PAPER", None, None).await.unwrap();
        (EventBus::new(db.clone()), run_id, db)
    }

    #[tokio::test]
    async fn test_emit_persists_and_publishes() {
        let (bus, run_id, db) = bus_with_run().await;
        let mut sub = bus.subscribe(&run_id);
        bus.emit(&run_id, "RUN_STARTED", serde_json::json!({"run_id": run_id}), "t_default")
            .await
            .unwrap();
        let envelope = sub.rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "RUN_STARTED");
        let rows = EventsRepo::new(db).list_for_run(&run_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "RUN_STARTED");
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_queue() {
        let (bus, run_id, _db) = bus_with_run().await;
        let sub_a = bus.subscribe(&run_id);
        let _sub_b = bus.subscribe(&run_id);
        assert_eq!(bus.subscriber_count(&run_id), 2);
        bus.unsubscribe(&run_id, &sub_a.id);
        assert_eq!(bus.subscriber_count(&run_id), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_cleans_up_run() {
        let (bus, run_id, _db) = bus_with_run().await;
        let sub = bus.subscribe(&run_id);
        bus.unsubscribe(&run_id, &sub.id);
        assert_eq!(bus.subscriber_count(&run_id), 0);
        assert!(bus.subscribers.lock().get(&run_id).is_none());
    }
}
