//! Persistence layer: every agent interaction with durable state goes
//! through [`EntityStore`].
//!
//! The store is the single synchronization point of the system. Bulk reads
//! that hand rows to workers claim them (`locking = Locking` plus owner) in
//! the same critical section, so two agents can never process the same row
//! concurrently even across hosts.

mod memory;
mod sled_store;
pub(crate) mod tables;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Collection, CollectionId, CollectionUpdate, Content, ContentId, ContentUpdate, HealthItem,
    LockOwner, Message, MessageId, MessageStatus, Processing, ProcessingId, ProcessingStatus,
    ProcessingUpdate, Request, RequestId, RequestStatus, RequestUpdate, Transform, TransformId,
    TransformStatus, TransformUpdate,
};

/// Atomic multi-table commit for one processing poll cycle. Everything in
/// here lands in a single store transaction or not at all.
#[derive(Debug, Default)]
pub struct ProcessingCommit {
    pub processing_update: ProcessingUpdate,
    pub new_contents: Vec<Content>,
    pub content_updates: Vec<ContentUpdate>,
    pub collection_updates: Vec<(CollectionId, CollectionUpdate)>,
    pub messages: Vec<Message>,
}

/// Result of a content-touching commit: which sibling transforms saw one of
/// their input dependencies change, so the caller can wake them.
#[derive(Debug, Default)]
pub struct ContentPropagation {
    pub updated_transform_ids: Vec<TransformId>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    // --- requests ---
    async fn add_request(&self, request: Request) -> Result<RequestId>;
    async fn get_request(&self, request_id: RequestId) -> Result<Request>;
    async fn update_request(&self, request_id: RequestId, update: RequestUpdate) -> Result<()>;
    /// Claiming bulk read: rows in `statuses` with an elapsed `next_poll_at`
    /// and `locking == Idle`. When `claim` is given, matched rows are locked
    /// to that owner before being returned.
    async fn get_requests_by_status(
        &self,
        statuses: &[RequestStatus],
        bulk_size: usize,
        min_id: Option<RequestId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Request>>;
    /// Cascade delete of a request and everything under it. Admin cleanup
    /// only, never part of the normal lifecycle.
    async fn delete_request(&self, request_id: RequestId) -> Result<()>;

    // --- transforms ---
    async fn add_transform(&self, transform: Transform) -> Result<TransformId>;
    async fn get_transform(&self, transform_id: TransformId) -> Result<Transform>;
    async fn get_transforms_by_request(&self, request_id: RequestId) -> Result<Vec<Transform>>;
    async fn update_transform(&self, transform_id: TransformId, update: TransformUpdate)
        -> Result<()>;
    async fn get_transforms_by_status(
        &self,
        statuses: &[TransformStatus],
        bulk_size: usize,
        min_id: Option<TransformId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Transform>>;

    // --- processings ---
    async fn add_processing(&self, processing: Processing) -> Result<ProcessingId>;
    async fn get_processing(&self, processing_id: ProcessingId) -> Result<Processing>;
    async fn update_processing(
        &self,
        processing_id: ProcessingId,
        update: ProcessingUpdate,
    ) -> Result<()>;
    async fn get_processings_by_status(
        &self,
        statuses: &[ProcessingStatus],
        bulk_size: usize,
        min_id: Option<ProcessingId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Processing>>;
    /// The one multi-table write of the poll path: processing row, content
    /// rows, collection counters and outbound messages move together.
    async fn update_processing_contents(
        &self,
        processing_id: ProcessingId,
        commit: ProcessingCommit,
    ) -> Result<ContentPropagation>;

    // --- collections ---
    async fn add_collection(&self, collection: Collection) -> Result<CollectionId>;
    async fn get_collection(&self, coll_id: CollectionId) -> Result<Collection>;
    async fn get_collections_by_transform(&self, transform_id: TransformId)
        -> Result<Vec<Collection>>;
    async fn update_collection(&self, coll_id: CollectionId, update: CollectionUpdate)
        -> Result<()>;

    // --- contents ---
    /// Insert content rows, resolving `InputDependency` rows against Output
    /// contents of the same request by scope:name. Unresolvable dependencies
    /// fail the whole registration.
    async fn register_contents(&self, contents: Vec<Content>) -> Result<Vec<ContentId>>;
    async fn get_contents_by_transform(&self, transform_id: TransformId) -> Result<Vec<Content>>;
    async fn get_contents_by_coll(&self, coll_id: CollectionId) -> Result<Vec<Content>>;
    async fn get_contents_by_request(&self, request_id: RequestId) -> Result<Vec<Content>>;
    async fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<ContentPropagation>;

    // --- messages ---
    async fn add_messages(&self, messages: Vec<Message>) -> Result<()>;
    async fn retrieve_messages(
        &self,
        status: MessageStatus,
        bulk_size: usize,
    ) -> Result<Vec<Message>>;
    async fn update_messages(&self, msg_ids: &[MessageId], status: MessageStatus) -> Result<()>;

    // --- health / liveness ---
    /// Upsert keyed by (agent, hostname, pid, thread_id).
    async fn add_health_item(&self, item: HealthItem) -> Result<()>;
    async fn retrieve_health_items(&self) -> Result<Vec<HealthItem>>;
    /// Drop health rows older than `older_than` or belonging to `dead_pids`
    /// on this host.
    async fn clean_health(&self, older_than: Duration, dead_pids: &[u32]) -> Result<usize>;
    /// Deterministic pick among the live heartbeats for `agent`: the
    /// election used to choose the coordinator.
    async fn select_agent(&self, agent: &str, newer_than: Duration) -> Result<HealthItem>;

    // --- maintenance ---
    /// Force-unlock rows whose lock is older than `older_than` or whose
    /// owner has no live health record. Returns the number of rows released.
    async fn clean_locking(&self, older_than: Duration) -> Result<usize>;
    /// Reset `next_poll_at` on every non-terminal row so the next discovery
    /// pass picks them up immediately.
    async fn clean_next_poll_at(&self) -> Result<()>;
}
