//! Mergeable, prioritized units of deferred work.
//!
//! An event says "something changed for entity X"; agents re-derive the
//! actual work from store state, so losing an event is safe (the discovery
//! polls regenerate it) and merging two events for the same entity is always
//! correct.

pub mod bus;
pub mod coordinator;

pub use bus::{BusAccounts, EventBus};
pub use coordinator::{Coordinator, CoordinatorHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ProcessingId, RequestId, TransformId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NewRequest,
    UpdateRequest,
    AbortRequest,
    ResumeRequest,
    ExpireRequest,
    NewTransform,
    UpdateTransform,
    AbortTransform,
    ResumeTransform,
    NewProcessing,
    UpdateProcessing,
    AbortProcessing,
    ResumeProcessing,
    Test,
}

/// Dequeue order within one event-type queue.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EventPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl EventPriority {
    /// High first.
    pub const ORDERED: [EventPriority; 3] =
        [EventPriority::High, EventPriority::Medium, EventPriority::Low];
}

/// The entity an event is about. Provides the merge/dedup key, distinct from
/// the bus-internal unique event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSubject {
    Request(RequestId),
    Transform(TransformId),
    Processing(ProcessingId),
    /// Events not tied to a stored entity; the id is random.
    Generic(u64),
}

impl EventSubject {
    pub fn domain_id(&self) -> u64 {
        match self {
            EventSubject::Request(id)
            | EventSubject::Transform(id)
            | EventSubject::Processing(id)
            | EventSubject::Generic(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub publisher_id: String,
    pub event_type: EventType,
    pub subject: EventSubject,
    pub timestamp: DateTime<Utc>,
    pub counter: u32,
    pub content: Option<Value>,
    pub requeue_counter: u32,
    #[serde(skip)]
    pub has_changes: bool,
    // Assigned by the bus when the event is scored.
    #[serde(skip)]
    pub(crate) priority: EventPriority,
    #[serde(skip)]
    pub(crate) scheduled_time: DateTime<Utc>,
}

impl Event {
    pub fn new(publisher_id: impl Into<String>, event_type: EventType, subject: EventSubject) -> Self {
        Self {
            id: Uuid::new_v4(),
            publisher_id: publisher_id.into(),
            event_type,
            subject,
            timestamp: Utc::now(),
            counter: 1,
            content: None,
            requeue_counter: 0,
            has_changes: false,
            priority: EventPriority::Low,
            scheduled_time: Utc::now(),
        }
    }

    pub fn generic(publisher_id: impl Into<String>, event_type: EventType) -> Self {
        let id = fastrand::u64(..);
        Self::new(publisher_id, event_type, EventSubject::Generic(id))
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    /// Domain identity: the merge/dedup key.
    pub fn event_id(&self) -> u64 {
        self.subject.domain_id()
    }

    pub fn able_to_merge(&self, other: &Event) -> bool {
        self.event_type == other.event_type && self.event_id() == other.event_id()
    }

    /// Merge `other` into `self`: counter becomes the max of the two, content
    /// is deep-merged preferring the incoming values on conflict. Returns
    /// false when the events are not mergeable.
    pub fn merge(&mut self, other: &Event) -> bool {
        if !self.able_to_merge(other) {
            return false;
        }
        self.has_changes = false;
        if other.counter > self.counter {
            self.counter = other.counter;
            self.has_changes = true;
        }
        if let Some(incoming) = &other.content {
            match &mut self.content {
                None => {
                    self.content = Some(incoming.clone());
                    self.has_changes = true;
                }
                Some(existing) => {
                    if existing != incoming {
                        merge_json(existing, incoming);
                        self.has_changes = true;
                    }
                }
            }
        }
        true
    }

    /// Called when the event is rescheduled without making progress; the bus
    /// turns the counter into growing, jittered delay.
    pub fn requeue(&mut self) {
        self.requeue_counter += 1;
    }

    fn content_flag(&self, key: &str) -> bool {
        self.content
            .as_ref()
            .and_then(|c| c.get(key))
            .map(flag_is_set)
            .unwrap_or(false)
    }

    fn set_content_flag(&mut self, key: &str) {
        let content = self.content.get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = content {
            map.insert(key.to_string(), Value::Bool(true));
        }
    }

    /// A terminating event fast-paths to High priority.
    pub fn set_terminating(&mut self) {
        self.set_content_flag("is_terminating");
    }

    pub fn is_terminating(&self) -> bool {
        self.content_flag("is_terminating")
    }

    /// A producer that knows updates are pending promotes to Medium priority.
    pub fn set_has_updates(&mut self) {
        self.set_content_flag("has_updates");
    }

    pub fn has_updates(&self) -> bool {
        self.content_flag("has_updates")
            || self
                .content
                .as_ref()
                .and_then(|c| c.get("num_to_update_contents"))
                .and_then(Value::as_u64)
                .map(|n| n > 0)
                .unwrap_or(false)
    }
}

fn flag_is_set(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().map(|n| n > 0).unwrap_or(false),
        _ => false,
    }
}

/// Recursive union of two JSON values; incoming wins on scalar conflicts.
pub fn merge_json(existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        a.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => {
            *slot = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_requires_same_type_and_subject() {
        let mut a = Event::new("p1", EventType::UpdateProcessing, EventSubject::Processing(7));
        let b = Event::new("p2", EventType::UpdateProcessing, EventSubject::Processing(8));
        let c = Event::new("p2", EventType::UpdateTransform, EventSubject::Processing(7));
        assert!(!a.merge(&b));
        assert!(!a.merge(&c));
    }

    #[test]
    fn merge_unions_content_and_takes_max_counter() {
        let mut a = Event::new("p1", EventType::UpdateProcessing, EventSubject::Processing(7))
            .with_content(json!({"files": {"a": 1}, "stale": true}));
        let mut b = Event::new("p2", EventType::UpdateProcessing, EventSubject::Processing(7))
            .with_content(json!({"files": {"b": 2}, "stale": false}));
        b.counter = 4;

        assert!(a.merge(&b));
        assert!(a.has_changes);
        assert_eq!(a.counter, 4);
        let content = a.content.unwrap();
        assert_eq!(content["files"]["a"], 1);
        assert_eq!(content["files"]["b"], 2);
        // incoming value wins on conflict
        assert_eq!(content["stale"], false);
    }

    #[test]
    fn merge_is_order_insensitive_for_disjoint_content() {
        let e1 = Event::new("p", EventType::UpdateTransform, EventSubject::Transform(3))
            .with_content(json!({"x": 1}));
        let e2 = Event::new("p", EventType::UpdateTransform, EventSubject::Transform(3))
            .with_content(json!({"y": 2}));

        let mut a = e1.clone();
        a.merge(&e2);
        let mut b = e2.clone();
        b.merge(&e1);
        assert_eq!(a.content, b.content);
    }

    #[test]
    fn events_round_trip_through_json() {
        let mut event = Event::new("p1", EventType::UpdateProcessing, EventSubject::Processing(7))
            .with_content(json!({"files": 2}));
        event.set_has_updates();
        event.priority = EventPriority::High;

        let wire = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.subject, event.subject);
        assert!(back.has_updates());
        // Bus-assigned scoring is not part of the wire form.
        assert_eq!(back.priority, EventPriority::Low);
    }

    #[test]
    fn priority_flags() {
        let mut e = Event::new("p", EventType::UpdateProcessing, EventSubject::Processing(1));
        assert!(!e.is_terminating());
        assert!(!e.has_updates());
        e.set_has_updates();
        assert!(e.has_updates());
        e.set_terminating();
        assert!(e.is_terminating());

        let e = Event::new("p", EventType::UpdateProcessing, EventSubject::Processing(1))
            .with_content(json!({"num_to_update_contents": 12}));
        assert!(e.has_updates());
    }
}
