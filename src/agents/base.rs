//! Shared agent harness: worker pool, dispatch loop, timers, heartbeat.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{CascadeError, Result};
use crate::events::{CoordinatorHandle, Event, EventType};
use crate::models::{HealthItem, LockOwner};
use crate::store::EntityStore;

pub struct AgentCore {
    pub name: String,
    pub kind: &'static str,
    pub owner: LockOwner,
    pub config: AgentConfig,
    stop: AtomicBool,
    workers: Arc<Semaphore>,
    processed: AtomicU64,
}

impl AgentCore {
    pub fn new(kind: &'static str, config: AgentConfig) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{kind}-{}", &suffix[..8]);
        Self {
            name,
            kind,
            owner: LockOwner::current(kind),
            workers: Arc::new(Semaphore::new(config.max_number_workers)),
            config,
            stop: AtomicBool::new(false),
            processed: AtomicU64::new(0),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn free_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn is_ok_to_run_more(&self) -> bool {
        self.free_workers() > 0
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_number_workers - self.free_workers()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Sleep `period` in small slices so a stop request takes effect quickly.
    pub async fn wait(&self, period: Duration) {
        let slice = Duration::from_millis(100);
        let deadline = Instant::now() + period;
        while !self.is_stopped() && Instant::now() < deadline {
            tokio::time::sleep(slice.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn core(&self) -> &AgentCore;
    fn store(&self) -> &Arc<dyn EntityStore>;
    fn bus(&self) -> &CoordinatorHandle;

    /// Event types this agent consumes.
    fn subscriptions(&self) -> Vec<EventType>;

    /// Handle one event; returned events are published as follow-ups.
    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>>;

    /// One discovery pass: claim eligible rows and emit events for them.
    async fn on_timer(&self) -> Result<()>;
}

/// Drive `agent` until its core is stopped: dispatch, discovery and
/// heartbeat loops, each isolated so one failing tick never kills the agent.
pub fn spawn_agent(agent: Arc<dyn Agent>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(dispatch_loop(agent.clone())),
        tokio::spawn(timer_loop(agent.clone())),
        tokio::spawn(heartbeat_loop(agent)),
    ]
}

async fn dispatch_loop(agent: Arc<dyn Agent>) {
    let subscriptions = agent.subscriptions();
    info!(agent = %agent.core().name, ?subscriptions, "dispatch loop started");
    while !agent.core().is_stopped() {
        for event_type in &subscriptions {
            let core = agent.core();
            if !core.is_ok_to_run_more() {
                break;
            }
            // Leave headroom: never pull more than half the free workers.
            let pull = (core.free_workers() / 2).max(1);
            let events = agent.bus().get(*event_type, pull);
            for event in events {
                let permit = match core.workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let agent = agent.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let cap = agent.core().config.max_worker_exec_time;
                    let event_type = event.event_type;
                    let id = event.event_id();
                    match tokio::time::timeout(cap, dispatch_one(&*agent, event)).await {
                        Ok(()) => {
                            agent.core().processed.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                agent = %agent.core().name,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "event handled"
                            );
                        }
                        Err(_) => {
                            // Hung handler: drop it and free the worker; the
                            // discovery poll regenerates the event.
                            error!(
                                agent = %agent.core().name,
                                ?event_type,
                                id,
                                cap_ms = cap.as_millis() as u64,
                                "event handler exceeded max exec time, aborted"
                            );
                        }
                    }
                    drop(permit);
                });
            }
        }
        agent.core().wait(agent.core().config.event_interval_delay).await;
    }
    info!(agent = %agent.core().name, "dispatch loop stopped");
}

async fn dispatch_one(agent: &dyn Agent, mut event: Event) {
    match agent.handle_event(&event).await {
        Ok(followups) => {
            if !followups.is_empty() {
                agent.bus().send_bulk(followups);
            }
        }
        Err(CascadeError::Locked { kind, id }) => {
            // Someone else holds the row; come back later.
            debug!(agent = %agent.core().name, kind, id, "target locked, requeueing");
            event.requeue();
            agent.bus().send(event);
        }
        Err(err) => {
            error!(
                agent = %agent.core().name,
                event_type = ?event.event_type,
                id = event.event_id(),
                error = %err,
                "event handler failed"
            );
        }
    }
}

async fn timer_loop(agent: Arc<dyn Agent>) {
    while !agent.core().is_stopped() {
        let started = Instant::now();
        if let Err(err) = agent.on_timer().await {
            // Total error capture: a failing tick is logged, never fatal.
            error!(agent = %agent.core().name, error = %err, "discovery tick failed");
        }
        agent.bus().record_report(
            &agent.core().name,
            json!({
                "agent": agent.core().kind,
                "processed": agent.core().processed(),
                "active_workers": agent.core().active_workers(),
                "last_tick_ms": started.elapsed().as_millis() as u64,
            }),
        );
        agent.core().wait(agent.core().config.poll_period).await;
    }
}

async fn heartbeat_loop(agent: Arc<dyn Agent>) {
    let mut last_lock_clean = Instant::now();
    while !agent.core().is_stopped() {
        if let Err(err) = health_heartbeat(&*agent).await {
            warn!(agent = %agent.core().name, error = %err, "heartbeat failed");
        }
        if last_lock_clean.elapsed() >= agent.core().config.clean_locks_period {
            last_lock_clean = Instant::now();
            match agent.store().clean_locking(agent.core().config.clean_locks_period).await {
                Ok(released) if released > 0 => {
                    warn!(agent = %agent.core().name, released, "released stale locks");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(agent = %agent.core().name, error = %err, "lock cleaning failed");
                }
            }
        }
        agent.core().wait(agent.core().config.heartbeat_delay).await;
    }
}

/// Upsert this agent's health record and reap records of processes that are
/// provably gone. The liveness set backs lock reaping and election.
pub async fn health_heartbeat(agent: &dyn Agent) -> Result<()> {
    let core = agent.core();
    agent
        .store()
        .add_health_item(HealthItem {
            agent: core.kind.to_string(),
            hostname: core.owner.hostname.clone(),
            pid: core.owner.pid,
            thread_id: core.owner.thread_id,
            thread_name: core.name.clone(),
            payload: Some(json!({ "num_active_workers": core.active_workers() })),
            updated_at: chrono::Utc::now(),
        })
        .await?;

    let items = agent.store().retrieve_health_items().await?;
    let dead = dead_local_pids(&items);
    // Three missed heartbeats before a record counts as stale; a single
    // delayed beat must not get a live worker's locks reaped.
    let cleaned = agent.store().clean_health(core.config.heartbeat_delay * 3, &dead).await?;
    if cleaned > 0 {
        debug!(agent = %core.name, cleaned, "reaped stale health records");
    }
    Ok(())
}

/// Pids registered from this host whose process no longer exists.
fn dead_local_pids(items: &[HealthItem]) -> Vec<u32> {
    let hostname = crate::models::local_hostname();
    let own_pid = std::process::id();
    items
        .iter()
        .filter(|item| item.hostname == hostname && item.pid != own_pid)
        .map(|item| item.pid)
        .filter(|pid| !pid_alive(*pid))
        .collect()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Grown poll delay after a retried failure, with the retry counter applied.
pub fn backoff_poll(config: &AgentConfig, current: Duration, retries: u32) -> Duration {
    let mut period = config.grow_poll_period(current);
    for _ in 1..retries {
        period = config.grow_poll_period(period);
    }
    period
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::events::EventSubject;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct EchoAgent {
        core: AgentCore,
        store: Arc<dyn EntityStore>,
        bus: CoordinatorHandle,
        seen: Mutex<Vec<u64>>,
        lock_first: AtomicBool,
        hang_first: AtomicBool,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn core(&self) -> &AgentCore {
            &self.core
        }
        fn store(&self) -> &Arc<dyn EntityStore> {
            &self.store
        }
        fn bus(&self) -> &CoordinatorHandle {
            &self.bus
        }
        fn subscriptions(&self) -> Vec<EventType> {
            vec![EventType::Test]
        }
        async fn handle_event(&self, event: &Event) -> Result<Vec<Event>> {
            if self.lock_first.swap(false, Ordering::SeqCst) {
                return Err(CascadeError::locked("request", event.event_id()));
            }
            if self.hang_first.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.seen.lock().unwrap().push(event.event_id());
            Ok(vec![])
        }
        async fn on_timer(&self) -> Result<()> {
            Ok(())
        }
    }

    fn echo_agent(lock_first: bool) -> (Arc<EchoAgent>, CoordinatorHandle) {
        let mut config = AgentConfig::default();
        config.event_interval_delay = Duration::from_millis(10);
        config.poll_period = Duration::from_millis(50);
        echo_agent_with(lock_first, config)
    }

    fn echo_agent_with(
        lock_first: bool,
        config: AgentConfig,
    ) -> (Arc<EchoAgent>, CoordinatorHandle) {
        let mut bus_config = CoordinatorConfig::default();
        bus_config.interval_delay = Duration::from_millis(50);
        let bus = CoordinatorHandle::local(bus_config);
        let agent = Arc::new(EchoAgent {
            core: AgentCore::new("echo", config),
            store: Arc::new(MemoryStore::new()),
            bus: bus.clone(),
            seen: Mutex::new(Vec::new()),
            lock_first: AtomicBool::new(lock_first),
            hang_first: AtomicBool::new(false),
        });
        (agent, bus)
    }

    #[tokio::test]
    async fn dispatch_handles_published_events() {
        let (agent, bus) = echo_agent(false);
        let handles = spawn_agent(agent.clone());
        for i in 1..=3 {
            bus.send(Event::new("test", EventType::Test, EventSubject::Generic(i)));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        agent.core().stop();
        for handle in handles {
            handle.await.unwrap();
        }
        let mut seen = agent.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn locked_events_are_requeued_and_retried() {
        let (agent, bus) = echo_agent(true);
        let handles = spawn_agent(agent.clone());
        bus.send(Event::new("test", EventType::Test, EventSubject::Generic(9)));
        // The first attempt hits the lock; the requeued event lands after the
        // backoff delay has elapsed.
        tokio::time::sleep(Duration::from_secs(1)).await;
        agent.core().stop();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(agent.seen.lock().unwrap().clone(), vec![9]);
    }

    #[tokio::test]
    async fn hung_handlers_are_cut_off_and_free_the_worker() {
        let mut config = AgentConfig::default();
        config.event_interval_delay = Duration::from_millis(10);
        config.poll_period = Duration::from_millis(50);
        // A single worker: if the hung handler kept its permit past the
        // cap, the second event could never run.
        config.max_number_workers = 1;
        config.max_worker_exec_time = Duration::from_millis(100);
        let (agent, bus) = echo_agent_with(false, config);
        agent.hang_first.store(true, Ordering::SeqCst);
        let handles = spawn_agent(agent.clone());
        bus.send(Event::new("test", EventType::Test, EventSubject::Generic(1)));
        bus.send(Event::new("test", EventType::Test, EventSubject::Generic(2)));
        tokio::time::sleep(Duration::from_millis(600)).await;
        agent.core().stop();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(agent.seen.lock().unwrap().clone(), vec![2]);
    }

    #[tokio::test]
    async fn heartbeat_registers_health() {
        let (agent, _bus) = echo_agent(false);
        let handles = spawn_agent(agent.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.core().stop();
        for handle in handles {
            handle.await.unwrap();
        }
        let items = agent.store.retrieve_health_items().await.unwrap();
        assert!(items.iter().any(|i| i.agent == "echo"));
    }

    #[tokio::test]
    async fn reap_keeps_records_younger_than_three_heartbeats() {
        let (agent, _bus) = echo_agent(false);
        let delay = agent.core().config.heartbeat_delay;
        let peer = |thread_id: u64, age: Duration| HealthItem {
            agent: "peer".to_string(),
            hostname: "elsewhere".to_string(),
            pid: 1,
            thread_id,
            thread_name: format!("peer-{thread_id}"),
            payload: None,
            updated_at: chrono::Utc::now() - chrono::Duration::from_std(age).unwrap(),
        };
        // One record two heartbeats behind, one past the three-beat cutoff.
        let lagging = delay * 2 + Duration::from_secs(1);
        let stale = delay * 3 + Duration::from_secs(1);
        agent.store.add_health_item(peer(1, lagging)).await.unwrap();
        agent.store.add_health_item(peer(2, stale)).await.unwrap();

        health_heartbeat(&*agent).await.unwrap();

        let items = agent.store.retrieve_health_items().await.unwrap();
        assert!(items.iter().any(|i| i.agent == "peer" && i.thread_id == 1));
        assert!(!items.iter().any(|i| i.agent == "peer" && i.thread_id == 2));
    }

    #[test]
    fn backoff_poll_grows_with_retries() {
        let config = AgentConfig::default();
        let base = Duration::from_secs(10);
        let one = backoff_poll(&config, base, 1);
        let three = backoff_poll(&config, base, 3);
        assert!(one > base);
        assert!(three > one);
        assert!(three <= config.max_poll_period);
    }
}
