//! Conductor: drains queued messages and fans them out to subscribers over an
//! in-process broadcast channel.

use std::sync::Arc;
use std::time::Instant;

use async_broadcast::{Receiver, Sender};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::agents::base::{Agent, AgentCore};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::events::{CoordinatorHandle, Event, EventType};
use crate::models::{Message, MessageSource, MessageStatus, MessageType};
use crate::store::EntityStore;

const BROADCAST_CAPACITY: usize = 1000;

pub struct Conductor {
    core: AgentCore,
    store: Arc<dyn EntityStore>,
    bus: CoordinatorHandle,
    sender: Sender<Message>,
    // Keeps the channel open while no subscriber is attached.
    _keepalive: Receiver<Message>,
    started: Instant,
    last_health: std::sync::Mutex<Instant>,
}

impl Conductor {
    pub fn new(store: Arc<dyn EntityStore>, bus: CoordinatorHandle, config: AgentConfig) -> Self {
        let (mut sender, keepalive) = async_broadcast::broadcast(BROADCAST_CAPACITY);
        sender.set_overflow(true);
        let now = Instant::now();
        Self {
            core: AgentCore::new("conductor", config),
            store,
            bus,
            sender,
            _keepalive: keepalive,
            started: now,
            last_health: std::sync::Mutex::new(now),
        }
    }

    /// A live feed of delivered messages. Slow subscribers lose the oldest
    /// entries rather than stalling delivery.
    pub fn subscribe(&self) -> Receiver<Message> {
        self.sender.new_receiver()
    }

    async fn deliver_pending(&self) -> Result<usize> {
        let messages = self
            .store
            .retrieve_messages(MessageStatus::New, self.core.config.message_bulk_size)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }
        let msg_ids: Vec<_> = messages.iter().map(|m| m.msg_id).collect();
        for message in messages {
            debug!(msg_id = message.msg_id, msg_type = ?message.msg_type, "delivering message");
            // Overflow mode drops the oldest entry instead of blocking.
            let _ = self.sender.try_broadcast(message);
        }
        self.store.update_messages(&msg_ids, MessageStatus::Delivered).await?;
        Ok(msg_ids.len())
    }

    async fn maybe_emit_health(&self) -> Result<()> {
        let due = {
            let mut last = self.last_health.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() >= self.core.config.heartbeat_delay {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return Ok(());
        }
        let message = Message::new(
            MessageType::HealthHeartbeat,
            MessageSource::Conductor,
            json!({
                "agent": self.core.name,
                "uptime_secs": self.started.elapsed().as_secs(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        self.store.add_messages(vec![message]).await
    }
}

#[async_trait]
impl Agent for Conductor {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    fn bus(&self) -> &CoordinatorHandle {
        &self.bus
    }

    // The conductor is purely timer-driven.
    fn subscriptions(&self) -> Vec<EventType> {
        vec![]
    }

    async fn handle_event(&self, _event: &Event) -> Result<Vec<Event>> {
        Ok(vec![])
    }

    async fn on_timer(&self) -> Result<()> {
        self.maybe_emit_health().await?;
        loop {
            match self.deliver_pending().await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "message delivery failed");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn conductor(store: Arc<dyn EntityStore>) -> Conductor {
        let bus = CoordinatorHandle::local(CoordinatorConfig::default());
        Conductor::new(store, bus, AgentConfig::default())
    }

    #[tokio::test]
    async fn delivers_new_messages_and_marks_them() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        store
            .add_messages(vec![
                Message::new(MessageType::Work, MessageSource::Clerk, json!({"n": 1})),
                Message::new(MessageType::File, MessageSource::Carrier, json!({"n": 2})),
            ])
            .await
            .unwrap();

        let conductor = conductor(store.clone());
        let mut feed = conductor.subscribe();
        let delivered = conductor.deliver_pending().await.unwrap();
        assert_eq!(delivered, 2);

        let first = feed.try_recv().unwrap();
        let second = feed.try_recv().unwrap();
        assert_eq!(first.msg_content["n"], json!(1));
        assert_eq!(second.msg_content["n"], json!(2));

        let remaining = store.retrieve_messages(MessageStatus::New, 10).await.unwrap();
        assert!(remaining.is_empty());
        let done = store.retrieve_messages(MessageStatus::Delivered, 10).await.unwrap();
        assert_eq!(done.len(), 2);
    }

    #[tokio::test]
    async fn health_message_respects_interval() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let conductor = conductor(store.clone());

        // First tick is within the heartbeat interval of construction.
        conductor.maybe_emit_health().await.unwrap();
        assert!(store.retrieve_messages(MessageStatus::New, 10).await.unwrap().is_empty());

        *conductor.last_health.lock().unwrap() =
            Instant::now() - conductor.core.config.heartbeat_delay;
        conductor.maybe_emit_health().await.unwrap();
        let pending = store.retrieve_messages(MessageStatus::New, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].msg_type, MessageType::HealthHeartbeat);
    }
}
