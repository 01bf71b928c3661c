//! Coordinator: owns the event bus and the lease-based election deciding
//! which instance's bus is authoritative.
//!
//! Election is derived purely from health heartbeats: every coordinator
//! candidate heartbeats under a fixed agent name, and all of them pick the
//! same live candidate deterministically. Queue contents are not durable;
//! after a failover the discovery timers repopulate the new bus from store
//! state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::events::{Event, EventBus, EventType};
use crate::models::{HealthItem, LockOwner};
use crate::store::EntityStore;

pub const COORDINATOR_AGENT: &str = "coordinator";

/// Cloneable handle agents publish to and consume from. In-process it wraps
/// the one shared bus; the election only decides who runs bus maintenance.
#[derive(Clone)]
pub struct CoordinatorHandle {
    bus: Arc<EventBus>,
}

impl CoordinatorHandle {
    pub fn local(config: CoordinatorConfig) -> Self {
        Self { bus: Arc::new(EventBus::new(config)) }
    }

    pub fn send(&self, event: Event) {
        self.bus.send(event);
    }

    pub fn send_bulk(&self, events: Vec<Event>) {
        self.bus.send_bulk(events);
    }

    pub fn get(&self, event_type: EventType, num: usize) -> Vec<Event> {
        self.bus.get(event_type, num)
    }

    pub fn record_report(&self, publisher_id: &str, report: Value) {
        self.bus.record_report(publisher_id, report);
    }

    pub fn queue_len(&self) -> usize {
        self.bus.len()
    }

    pub fn accounts(&self, event_type: EventType) -> crate::events::BusAccounts {
        self.bus.accounts(event_type)
    }

    fn reports(&self) -> std::collections::HashMap<String, Value> {
        self.bus.reports()
    }
}

pub struct Coordinator {
    store: Arc<dyn EntityStore>,
    handle: CoordinatorHandle,
    config: CoordinatorConfig,
    owner: LockOwner,
    stop: AtomicBool,
    leader: AtomicBool,
}

impl Coordinator {
    pub fn new(store: Arc<dyn EntityStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            handle: CoordinatorHandle::local(config.clone()),
            config,
            owner: LockOwner::current(COORDINATOR_AGENT),
            stop: AtomicBool::new(false),
            leader: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn matches(&self, item: &HealthItem) -> bool {
        item.hostname == self.owner.hostname
            && item.pid == self.owner.pid
            && item.thread_id == self.owner.thread_id
    }

    /// One coordination pass: heartbeat, election, bus bookkeeping.
    pub async fn tick(&self) -> Result<()> {
        self.store
            .add_health_item(HealthItem {
                agent: COORDINATOR_AGENT.to_string(),
                hostname: self.owner.hostname.clone(),
                pid: self.owner.pid,
                thread_id: self.owner.thread_id,
                thread_name: COORDINATOR_AGENT.to_string(),
                payload: None,
                updated_at: chrono::Utc::now(),
            })
            .await?;
        self.store
            .clean_health(self.config.coordination_interval_delay * 2, &[])
            .await?;

        // Liveness window: a heartbeat older than two intervals is dead.
        let selected = self
            .store
            .select_agent(COORDINATOR_AGENT, self.config.coordination_interval_delay * 2)
            .await?;
        let is_leader = self.matches(&selected);
        let was_leader = self.leader.swap(is_leader, Ordering::SeqCst);
        if is_leader != was_leader {
            info!(
                hostname = %selected.hostname,
                pid = selected.pid,
                is_leader,
                "coordinator election changed"
            );
            // Queued events died with the old leader; reset poll stamps so
            // the discovery timers repopulate the queue from store state.
            if is_leader {
                self.store.clean_next_poll_at().await?;
            }
        }

        if is_leader {
            let reports = self.handle.reports();
            debug!(agents = reports.len(), queued = self.handle.queue_len(), "bus state");
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while !self.stop.load(Ordering::SeqCst) {
                if let Err(err) = self.tick().await {
                    warn!(error = %err, "coordination tick failed");
                }
                let slice = std::time::Duration::from_millis(100);
                let deadline =
                    std::time::Instant::now() + self.config.coordination_interval_delay;
                while !self.stop.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
                    tokio::time::sleep(slice).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn single_candidate_becomes_leader() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store, CoordinatorConfig::default());
        coordinator.tick().await.unwrap();
        assert!(coordinator.is_leader());
    }

    #[tokio::test]
    async fn earlier_candidate_wins_election() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        // A rival on a host sorting before ours is already registered.
        store
            .add_health_item(HealthItem {
                agent: COORDINATOR_AGENT.into(),
                hostname: "".into(),
                pid: 1,
                thread_id: 1,
                thread_name: COORDINATOR_AGENT.into(),
                payload: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let coordinator = Coordinator::new(store, CoordinatorConfig::default());
        coordinator.tick().await.unwrap();
        assert!(!coordinator.is_leader());
    }

    #[tokio::test]
    async fn stale_leader_is_replaced() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        store
            .add_health_item(HealthItem {
                agent: COORDINATOR_AGENT.into(),
                hostname: "".into(),
                pid: 1,
                thread_id: 1,
                thread_name: COORDINATOR_AGENT.into(),
                payload: None,
                updated_at: Utc::now() - chrono::Duration::hours(2),
            })
            .await
            .unwrap();
        let mut config = CoordinatorConfig::default();
        config.coordination_interval_delay = Duration::from_secs(60);
        let coordinator = Coordinator::new(store, config);
        coordinator.tick().await.unwrap();
        assert!(coordinator.is_leader());
    }
}
