//! In-memory prioritized event queue with merge-on-insert.
//!
//! Exactly one queued event may exist per (event type, subject); a second
//! publish for the same subject merges into the queued one and re-scores it.
//! Consumers pull per event type, High before Medium before Low, and only
//! events whose scheduled time has arrived.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::events::{Event, EventPriority, EventType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusAccounts {
    pub queued: u64,
    pub processed: u64,
    /// Pulls that found nothing ready.
    pub lack_events: u64,
}

#[derive(Debug)]
struct AgentReport {
    report: Value,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct BusInner {
    /// All queued events by bus id.
    events: HashMap<Uuid, Event>,
    /// Per type and priority, bus ids ordered by scheduled time.
    index: HashMap<EventType, HashMap<EventPriority, Vec<Uuid>>>,
    /// Merge key -> bus id of the single queued event for that subject.
    ids: HashMap<(EventType, u64), Uuid>,
    accounts: HashMap<EventType, BusAccounts>,
    reports: HashMap<String, AgentReport>,
    last_depth_log: Option<DateTime<Utc>>,
}

pub struct EventBus {
    config: CoordinatorConfig,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config, inner: Mutex::new(BusInner::default()) }
    }

    /// Priority and earliest-dispatch time for an event, given the current
    /// depth of its destination queue.
    fn scheduled_prio_time(&self, event: &Event, queue_depth: usize) -> (EventPriority, DateTime<Utc>) {
        let cfg = &self.config;
        let now = Utc::now();

        if event.is_terminating() {
            return (EventPriority::High, now);
        }
        let priority = if event.has_updates() { EventPriority::Medium } else { EventPriority::Low };

        let interval = ChronoDuration::from_std(cfg.interval_delay).unwrap_or_else(|_| ChronoDuration::seconds(5));
        let mut delay = if queue_depth < cfg.min_queued_events {
            ChronoDuration::zero()
        } else if self.is_big_task(event) {
            ChronoDuration::from_std(cfg.interval_delay_for_big_task)
                .unwrap_or_else(|_| ChronoDuration::seconds(60))
        } else {
            let boost = (queue_depth as f64 / cfg.max_queued_events as f64)
                .min(cfg.max_boost_interval_delay as f64);
            ChronoDuration::milliseconds((interval.num_milliseconds() as f64 * 2.0 * boost) as i64)
        };

        // Events that keep coming back without progress wait longer; past a
        // few attempts the delay is randomized to spread thundering retries.
        if event.requeue_counter > 0 {
            delay = if event.requeue_counter <= 3 {
                interval * event.requeue_counter as i32
            } else {
                let factor = fastrand::u32(3..=event.requeue_counter);
                interval * factor as i32
            };
        }

        (priority, now + delay)
    }

    fn is_big_task(&self, event: &Event) -> bool {
        let total = event
            .content
            .as_ref()
            .and_then(|c| c.get("total_files"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if total <= self.config.max_total_files_for_small_task {
            return false;
        }
        let processed = event
            .content
            .as_ref()
            .and_then(|c| c.get("processed_files"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        // Near-completion big tasks keep the normal cadence.
        processed + self.config.max_total_files_for_small_task / 10 < total
    }

    pub fn send(&self, event: Event) {
        self.send_bulk(vec![event]);
    }

    pub fn send_bulk(&self, events: Vec<Event>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            self.insert_locked(&mut inner, event);
        }
        self.maybe_log_depths(&mut inner);
    }

    fn insert_locked(&self, inner: &mut BusInner, mut event: Event) {
        let key = (event.event_type, event.event_id());

        if let Some(existing_id) = inner.ids.get(&key).copied() {
            if let Some(mut existing) = inner.events.remove(&existing_id) {
                existing.merge(&event);
                if existing.has_changes {
                    // Re-score: the merge may have raised the priority. The
                    // event never moves later than it already was.
                    let old_prio = existing.priority;
                    let old_time = existing.scheduled_time;
                    let depth = queue_depth(inner, event.event_type);
                    let (priority, scheduled_time) = self.scheduled_prio_time(&existing, depth);
                    if priority != old_prio || scheduled_time < old_time {
                        remove_from_index(inner, event.event_type, old_prio, existing_id);
                        existing.priority = priority;
                        existing.scheduled_time = scheduled_time.min(old_time);
                        let at = existing.scheduled_time;
                        inner.events.insert(existing_id, existing);
                        push_to_index(inner, event.event_type, priority, at, existing_id);
                        return;
                    }
                }
                inner.events.insert(existing_id, existing);
                return;
            }
            inner.ids.remove(&key);
        }

        let depth = queue_depth(inner, event.event_type);
        let (priority, scheduled_time) = self.scheduled_prio_time(&event, depth);
        event.priority = priority;
        event.scheduled_time = scheduled_time;

        let id = event.id;
        let event_type = event.event_type;
        inner.ids.insert(key, id);
        inner.events.insert(id, event);
        push_to_index(inner, event_type, priority, scheduled_time, id);
        inner.accounts.entry(event_type).or_default().queued += 1;
    }

    /// Pull up to `num` ready events of one type. Higher priorities drain
    /// first; within a priority the oldest scheduled time wins.
    pub fn get(&self, event_type: EventType, num: usize) -> Vec<Event> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Reborrow past the guard so index and events can be borrowed apart.
        let inner = &mut *inner;
        let mut out = Vec::new();

        for priority in EventPriority::ORDERED {
            if out.len() >= num {
                break;
            }
            let Some(queue) = inner.index.get_mut(&event_type).and_then(|m| m.get_mut(&priority))
            else {
                continue;
            };
            let mut taken = Vec::new();
            while out.len() + taken.len() < num && !queue.is_empty() {
                let id = queue[0];
                let ready = inner.events.get(&id).map(|e| e.scheduled_time <= now).unwrap_or(true);
                if !ready {
                    break;
                }
                queue.remove(0);
                taken.push(id);
            }
            for id in taken {
                if let Some(event) = inner.events.remove(&id) {
                    inner.ids.remove(&(event.event_type, event.event_id()));
                    out.push(event);
                }
            }
        }

        let accounts = inner.accounts.entry(event_type).or_default();
        if out.is_empty() {
            accounts.lack_events += 1;
        } else {
            accounts.processed += out.len() as u64;
        }
        out
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accounts(&self, event_type: EventType) -> BusAccounts {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.accounts.get(&event_type).copied().unwrap_or_default()
    }

    /// Store an agent's self-report, replacing any previous one.
    pub fn record_report(&self, publisher_id: &str, report: Value) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .reports
            .insert(publisher_id.to_string(), AgentReport { report, updated_at: Utc::now() });
    }

    pub fn reports(&self) -> HashMap<String, Value> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.report_retention)
                .unwrap_or_else(|_| ChronoDuration::days(10));
        inner.reports.retain(|_, r| r.updated_at >= cutoff);
        inner.reports.iter().map(|(k, v)| (k.clone(), v.report.clone())).collect()
    }

    fn maybe_log_depths(&self, inner: &mut BusInner) {
        let now = Utc::now();
        let interval = ChronoDuration::from_std(self.config.show_queued_events_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        if let Some(last) = inner.last_depth_log {
            if now - last < interval {
                return;
            }
        }
        inner.last_depth_log = Some(now);
        for (event_type, prios) in &inner.index {
            for (priority, queue) in prios {
                if !queue.is_empty() {
                    debug!(?event_type, ?priority, depth = queue.len(), "queued events");
                }
            }
        }
    }
}

fn queue_depth(inner: &BusInner, event_type: EventType) -> usize {
    inner
        .index
        .get(&event_type)
        .map(|m| m.values().map(Vec::len).sum())
        .unwrap_or(0)
}

fn remove_from_index(inner: &mut BusInner, event_type: EventType, priority: EventPriority, id: Uuid) {
    if let Some(queue) = inner.index.get_mut(&event_type).and_then(|m| m.get_mut(&priority)) {
        queue.retain(|queued| *queued != id);
    }
}

fn push_to_index(
    inner: &mut BusInner,
    event_type: EventType,
    priority: EventPriority,
    scheduled_time: DateTime<Utc>,
    id: Uuid,
) {
    let queue = inner.index.entry(event_type).or_default().entry(priority).or_default();
    let pos = queue
        .iter()
        .position(|queued| {
            inner
                .events
                .get(queued)
                .map(|e| e.scheduled_time > scheduled_time)
                .unwrap_or(false)
        })
        .unwrap_or(queue.len());
    queue.insert(pos, id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSubject;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(CoordinatorConfig::default())
    }

    #[test]
    fn duplicate_subject_merges_to_one_event() {
        let bus = bus();
        let e1 = Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(5))
            .with_content(json!({"x": 1}));
        let e2 = Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(5))
            .with_content(json!({"y": 2}));
        bus.send(e1);
        bus.send(e2);
        assert_eq!(bus.len(), 1);

        let got = bus.get(EventType::UpdateProcessing, 10);
        assert_eq!(got.len(), 1);
        let content = got[0].content.clone().unwrap();
        assert_eq!(content["x"], 1);
        assert_eq!(content["y"], 2);
        assert!(bus.is_empty());
    }

    #[test]
    fn different_subjects_stay_separate() {
        let bus = bus();
        bus.send(Event::new("a", EventType::UpdateTransform, EventSubject::Transform(1)));
        bus.send(Event::new("a", EventType::UpdateTransform, EventSubject::Transform(2)));
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn terminating_events_come_out_first() {
        let bus = bus();
        for i in 0..5 {
            bus.send(Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(i)));
        }
        let mut urgent = Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(99));
        urgent.set_terminating();
        bus.send(urgent);

        let got = bus.get(EventType::UpdateProcessing, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_id(), 99);
    }

    #[test]
    fn has_updates_beats_plain_poll() {
        let bus = bus();
        bus.send(Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(1)));
        let mut updated = Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(2));
        updated.set_has_updates();
        bus.send(updated);

        let got = bus.get(EventType::UpdateProcessing, 1);
        assert_eq!(got[0].event_id(), 2);
    }

    #[test]
    fn same_tier_events_drain_in_arrival_order() {
        let bus = bus();
        for i in 1..=4 {
            bus.send(Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(i)));
        }
        let got = bus.get(EventType::UpdateProcessing, 4);
        let ids: Vec<u64> = got.iter().map(Event::event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn get_respects_event_type_and_count() {
        let bus = bus();
        bus.send(Event::new("a", EventType::NewTransform, EventSubject::Transform(1)));
        bus.send(Event::new("a", EventType::UpdateTransform, EventSubject::Transform(1)));
        for i in 2..6 {
            bus.send(Event::new("a", EventType::NewTransform, EventSubject::Transform(i)));
        }

        let got = bus.get(EventType::NewTransform, 3);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|e| e.event_type == EventType::NewTransform));
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn requeued_event_is_delayed() {
        let bus = bus();
        let mut e = Event::new("a", EventType::UpdateProcessing, EventSubject::Processing(1));
        e.requeue();
        bus.send(e);
        // Delay is at least one interval_delay, so an immediate pull is empty.
        assert!(bus.get(EventType::UpdateProcessing, 10).is_empty());
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.accounts(EventType::UpdateProcessing).lack_events, 1);
    }

    #[test]
    fn accounts_track_queue_flow() {
        let bus = bus();
        bus.send(Event::new("a", EventType::NewRequest, EventSubject::Request(1)));
        bus.send(Event::new("a", EventType::NewRequest, EventSubject::Request(2)));
        bus.get(EventType::NewRequest, 10);
        let acc = bus.accounts(EventType::NewRequest);
        assert_eq!(acc.queued, 2);
        assert_eq!(acc.processed, 2);
    }

    #[test]
    fn reports_replace_per_publisher() {
        let bus = bus();
        bus.record_report("clerk-1", json!({"processed": 3}));
        bus.record_report("clerk-1", json!({"processed": 5}));
        let reports = bus.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports["clerk-1"]["processed"], 5);
    }
}
