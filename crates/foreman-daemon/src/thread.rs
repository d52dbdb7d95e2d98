//! Append-only thread message log.
//!
//! Every append is persisted first (the store assigns the sequence) and then
//! published on the thread's bus channel. Both happen under a per-thread
//! lock, so bus order matches sequence order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::bus::{ChannelId, EventPayload, NewEvent, StreamBus};
use crate::storage::{Database, DatabaseError, Sender, ThreadMessage};

pub struct ThreadLog {
    db: Database,
    bus: Arc<StreamBus>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadLog {
    pub fn new(db: Database, bus: Arc<StreamBus>) -> Self {
        Self {
            db,
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(thread_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Forget the thread's lock once nobody holds or waits for it.
    fn release_thread(&self, thread_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(thread_id);
        }
    }

    /// Append a message and publish it.
    pub async fn append(
        &self,
        thread_id: &str,
        sender: Sender,
        role: Option<&str>,
        content: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<ThreadMessage, DatabaseError> {
        let payload = payload.map(serde_json::Value::to_string);
        let guard = self.lock_thread(thread_id).await;
        let message = match self
            .db
            .append_message(thread_id, sender, role, content, payload.as_deref())
            .await
        {
            Ok(message) => message,
            Err(e) => {
                drop(guard);
                self.release_thread(thread_id);
                return Err(e);
            }
        };
        debug!(thread_id, sequence = message.sequence, sender = %sender, "Thread message appended");

        self.bus
            .publish(
                &ChannelId::Thread(thread_id.to_string()),
                NewEvent::new(EventPayload::Message {
                    sequence: message.sequence,
                    sender,
                    role: message.role.clone(),
                    content: message.content.clone(),
                })
                .thread(thread_id),
            )
            .await;
        drop(guard);
        self.release_thread(thread_id);
        Ok(message)
    }

    /// Status line from the orchestrator.
    pub async fn system(
        &self,
        thread_id: &str,
        role: &str,
        content: &str,
    ) -> Result<ThreadMessage, DatabaseError> {
        self.append(thread_id, Sender::System, Some(role), content, None)
            .await
    }

    /// Messages with sequence greater than `after`.
    pub async fn list(
        &self,
        thread_id: &str,
        after: i64,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        self.db.list_messages(thread_id, after).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use foreman_core::config::BusConfig;
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn append_persists_and_publishes() {
        let bus = Arc::new(StreamBus::new(BusConfig::default()));
        let log = ThreadLog::new(Database::open_in_memory().await.unwrap(), Arc::clone(&bus));

        log.system("t1", "architect", "Entered architect phase").await.unwrap();
        log.append("t1", Sender::User, None, "hi", Some(&serde_json::json!({"k": 1})))
            .await
            .unwrap();

        let stored = log.list("t1", 0).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role.as_deref(), Some("architect"));
        assert_eq!(stored[1].payload.as_deref(), Some(r#"{"k":1}"#));

        let events: Vec<_> = bus
            .subscribe(&ChannelId::Thread("t1".into()), None)
            .await
            .take(2)
            .collect()
            .await;
        assert_eq!(
            events[1].payload,
            EventPayload::Message {
                sequence: 2,
                sender: Sender::User,
                role: None,
                content: "hi".into(),
            }
        );
    }

    #[tokio::test]
    async fn concurrent_appends_publish_in_sequence_order() {
        let bus = Arc::new(StreamBus::new(BusConfig::default()));
        let log = Arc::new(ThreadLog::new(
            Database::open_in_memory().await.unwrap(),
            Arc::clone(&bus),
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50 {
            let log = Arc::clone(&log);
            tasks.spawn(async move {
                log.append("t1", Sender::Agent, None, &format!("m{i}"), None)
                    .await
                    .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(5),
            bus.subscribe(&ChannelId::Thread("t1".into()), None)
                .await
                .take(50)
                .collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        let sequences: Vec<i64> = events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Message { sequence, .. } => *sequence,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<_>>());
        assert!(log.locks.lock().unwrap().is_empty());
    }
}
