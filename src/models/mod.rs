//! Persisted entity records and their status machinery.
//!
//! Everything in here is plain data: behavior objects (works, backends) are
//! reconstructed from type tags on load, never embedded in a record.

pub mod status;

pub use status::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub type RequestId = u64;
pub type TransformId = u64;
pub type ProcessingId = u64;
pub type CollectionId = u64;
pub type ContentId = u64;
pub type MessageId = u64;
pub type MapId = u64;

/// Identity of the worker holding a row lock. Used by the lock-reaping sweep
/// to decide whether the holder is still alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub hostname: String,
    pub pid: u32,
    pub thread_id: u64,
    pub thread_name: String,
}

impl LockOwner {
    pub fn current(thread_name: &str) -> Self {
        Self {
            hostname: crate::models::local_hostname(),
            pid: std::process::id(),
            thread_id: thread_id_hash(),
            thread_name: thread_name.to_string(),
        }
    }
}

pub(crate) fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn thread_id_hash() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

/// Top-level workflow instance submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub name: String,
    pub status: RequestStatus,
    pub substatus: Option<RequestStatus>,
    pub locking: LockStatus,
    pub lock_owner: Option<LockOwner>,
    pub priority: u32,
    pub lifetime: Option<Duration>,
    /// Embeds the serialized workflow (list of work specs plus DAG edges).
    pub request_metadata: Value,
    pub errors: Option<Value>,
    pub new_retries: u32,
    pub update_retries: u32,
    pub max_new_retries: u32,
    pub max_update_retries: u32,
    pub next_poll_at: DateTime<Utc>,
    pub poll_period: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(name: impl Into<String>, request_metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            request_id: 0,
            name: name.into(),
            status: RequestStatus::New,
            substatus: None,
            locking: LockStatus::Idle,
            lock_owner: None,
            priority: 0,
            lifetime: None,
            request_metadata,
            errors: None,
            new_retries: 0,
            update_retries: 0,
            max_new_retries: 3,
            max_update_retries: 0,
            next_poll_at: now,
            poll_period: Duration::from_secs(10),
            created_at: now,
            updated_at: now,
            finished_at: None,
            expired_at: None,
        }
    }
}

/// One execution unit derived from a work object within a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    pub transform_id: TransformId,
    pub request_id: RequestId,
    pub name: String,
    pub transform_type: crate::work::WorkType,
    pub transform_tag: Option<String>,
    pub status: TransformStatus,
    pub substatus: Option<TransformStatus>,
    pub locking: LockStatus,
    pub lock_owner: Option<LockOwner>,
    /// DAG edges inside the owning request's workflow.
    pub parent_transform_id: Option<TransformId>,
    pub previous_transform_id: Option<TransformId>,
    pub current_processing_id: Option<ProcessingId>,
    /// Serialized work spec plus runtime work state.
    pub transform_metadata: Value,
    pub errors: Option<Value>,
    pub new_retries: u32,
    pub update_retries: u32,
    pub max_new_retries: u32,
    pub max_update_retries: u32,
    pub next_poll_at: DateTime<Utc>,
    pub poll_period: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Transform {
    pub fn new(
        request_id: RequestId,
        name: impl Into<String>,
        transform_type: crate::work::WorkType,
        transform_metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            transform_id: 0,
            request_id,
            name: name.into(),
            transform_type,
            transform_tag: None,
            status: TransformStatus::New,
            substatus: None,
            locking: LockStatus::Idle,
            lock_owner: None,
            parent_transform_id: None,
            previous_transform_id: None,
            current_processing_id: None,
            transform_metadata,
            errors: None,
            new_retries: 0,
            update_retries: 0,
            max_new_retries: 3,
            max_update_retries: 0,
            next_poll_at: now,
            poll_period: Duration::from_secs(10),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// One concrete submission of a transform to an external back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    pub processing_id: ProcessingId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub status: ProcessingStatus,
    pub substatus: Option<ProcessingStatus>,
    pub locking: LockStatus,
    pub lock_owner: Option<LockOwner>,
    pub granularity: Option<GranularityType>,
    /// Workload id on the external back-end; recorded once on submit.
    pub external_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub processing_metadata: Value,
    pub errors: Option<Value>,
    pub new_retries: u32,
    pub update_retries: u32,
    pub max_new_retries: u32,
    pub max_update_retries: u32,
    pub next_poll_at: DateTime<Utc>,
    pub poll_period: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Processing {
    pub fn new(request_id: RequestId, transform_id: TransformId, processing_metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            processing_id: 0,
            request_id,
            transform_id,
            status: ProcessingStatus::New,
            substatus: None,
            locking: LockStatus::Idle,
            lock_owner: None,
            granularity: Some(GranularityType::File),
            external_id: None,
            submitted_at: None,
            processing_metadata,
            errors: None,
            new_retries: 0,
            update_retries: 0,
            max_new_retries: 3,
            max_update_retries: 0,
            next_poll_at: now,
            poll_period: Duration::from_secs(10),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Named group of content items bound to one transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub coll_id: CollectionId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub scope: String,
    pub name: String,
    pub relation_type: CollectionRelationType,
    pub status: CollectionStatus,
    pub total_files: u64,
    pub new_files: u64,
    pub processed_files: u64,
    pub coll_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(
        request_id: RequestId,
        transform_id: TransformId,
        scope: impl Into<String>,
        name: impl Into<String>,
        relation_type: CollectionRelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            coll_id: 0,
            request_id,
            transform_id,
            scope: scope.into(),
            name: name.into(),
            relation_type,
            status: CollectionStatus::New,
            total_files: 0,
            new_files: 0,
            processed_files: 0,
            coll_metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Smallest trackable unit of data: a file, event range or candidate point.
///
/// `substatus` tracks the latest observation from the back-end; `status` only
/// advances monotonically and is never downgraded once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub content_id: ContentId,
    pub coll_id: CollectionId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    /// Groups the inputs and outputs of one unit of work.
    pub map_id: MapId,
    pub scope: String,
    pub name: String,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub content_relation_type: ContentRelationType,
    /// For `InputDependency` rows: the upstream Output content this one waits
    /// for, resolved by scope:name matching at registration time.
    pub content_dep_id: Option<ContentId>,
    pub path: Option<String>,
    pub content_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Content {
    pub fn new(
        coll_id: CollectionId,
        request_id: RequestId,
        transform_id: TransformId,
        map_id: MapId,
        scope: impl Into<String>,
        name: impl Into<String>,
        content_relation_type: ContentRelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            content_id: 0,
            coll_id,
            request_id,
            transform_id,
            map_id,
            scope: scope.into(),
            name: name.into(),
            status: ContentStatus::New,
            substatus: ContentStatus::New,
            content_relation_type,
            content_dep_id: None,
            path: None,
            content_metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outbound notification queued for delivery by the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: MessageId,
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub source: MessageSource,
    pub request_id: Option<RequestId>,
    pub transform_id: Option<TransformId>,
    pub processing_id: Option<ProcessingId>,
    pub num_contents: u32,
    pub msg_content: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(msg_type: MessageType, source: MessageSource, msg_content: Value) -> Self {
        let now = Utc::now();
        Self {
            msg_id: 0,
            msg_type,
            status: MessageStatus::New,
            source,
            request_id: None,
            transform_id: None,
            processing_id: None,
            num_contents: 0,
            msg_content,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Liveness record written by every agent thread on its heartbeat interval.
/// Backs both lock reaping and coordinator election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthItem {
    pub agent: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: u64,
    pub thread_name: String,
    pub payload: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl HealthItem {
    /// Whether `owner` matches this health record's process identity.
    pub fn covers(&self, owner: &LockOwner) -> bool {
        self.hostname == owner.hostname && self.pid == owner.pid
    }
}

// ---------------------------------------------------------------------------
// Partial updates: only `Some` fields are applied by the store.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub substatus: Option<RequestStatus>,
    pub locking: Option<LockStatus>,
    pub errors: Option<Value>,
    pub new_retries: Option<u32>,
    pub update_retries: Option<u32>,
    pub poll_period: Option<Duration>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub request_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TransformUpdate {
    pub status: Option<TransformStatus>,
    pub substatus: Option<TransformStatus>,
    pub locking: Option<LockStatus>,
    pub errors: Option<Value>,
    pub new_retries: Option<u32>,
    pub update_retries: Option<u32>,
    pub poll_period: Option<Duration>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub current_processing_id: Option<ProcessingId>,
    pub transform_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingUpdate {
    pub status: Option<ProcessingStatus>,
    pub substatus: Option<ProcessingStatus>,
    pub locking: Option<LockStatus>,
    pub errors: Option<Value>,
    pub new_retries: Option<u32>,
    pub update_retries: Option<u32>,
    pub poll_period: Option<Duration>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub processing_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionUpdate {
    pub status: Option<CollectionStatus>,
    pub total_files: Option<u64>,
    pub new_files: Option<u64>,
    pub processed_files: Option<u64>,
    pub coll_metadata: Option<Value>,
}

/// Per-content status update, addressed by content id.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    pub content_id: ContentId,
    pub status: Option<ContentStatus>,
    pub substatus: Option<ContentStatus>,
    pub path: Option<String>,
}

impl ContentUpdate {
    pub fn substatus(content_id: ContentId, substatus: ContentStatus) -> Self {
        Self {
            content_id,
            status: None,
            substatus: Some(substatus),
            path: None,
        }
    }
}

/// Truncate an error message for storage in an entity's `errors` field.
pub fn truncate_error(msg: &str, max_len: usize) -> String {
    if msg.len() <= max_len {
        msg.to_string()
    } else {
        let mut end = max_len;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let msg = "abcdéfgh";
        let out = truncate_error(msg, 5);
        assert!(out.len() <= 5);
        assert!(msg.starts_with(&out));
        assert_eq!(truncate_error("short", 200), "short");
    }

    #[test]
    fn health_item_covers_lock_owner() {
        let owner = LockOwner {
            hostname: "node1".into(),
            pid: 42,
            thread_id: 7,
            thread_name: "poller".into(),
        };
        let item = HealthItem {
            agent: "carrier".into(),
            hostname: "node1".into(),
            pid: 42,
            thread_id: 9,
            thread_name: "main".into(),
            payload: None,
            updated_at: Utc::now(),
        };
        assert!(item.covers(&owner));

        let other = LockOwner { pid: 43, ..owner };
        assert!(!item.covers(&other));
    }
}
