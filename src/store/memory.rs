//! In-memory store: the single-process and test backend.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Collection, CollectionId, CollectionUpdate, Content, ContentId, ContentUpdate, HealthItem,
    LockOwner, Message, MessageId, MessageStatus, Processing, ProcessingId, ProcessingStatus,
    ProcessingUpdate, Request, RequestId, RequestStatus, RequestUpdate, Transform, TransformId,
    TransformStatus, TransformUpdate,
};
use crate::store::tables::Tables;
use crate::store::{ContentPropagation, EntityStore, ProcessingCommit};

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn add_request(&self, request: Request) -> Result<RequestId> {
        Ok(self.lock().add_request(request))
    }

    async fn get_request(&self, request_id: RequestId) -> Result<Request> {
        self.lock().get_request(request_id)
    }

    async fn update_request(&self, request_id: RequestId, update: RequestUpdate) -> Result<()> {
        self.lock().update_request(request_id, update)
    }

    async fn get_requests_by_status(
        &self,
        statuses: &[RequestStatus],
        bulk_size: usize,
        min_id: Option<RequestId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Request>> {
        Ok(self.lock().get_requests_by_status(statuses, bulk_size, min_id, claim))
    }

    async fn delete_request(&self, request_id: RequestId) -> Result<()> {
        self.lock().delete_request(request_id)
    }

    async fn add_transform(&self, transform: Transform) -> Result<TransformId> {
        Ok(self.lock().add_transform(transform))
    }

    async fn get_transform(&self, transform_id: TransformId) -> Result<Transform> {
        self.lock().get_transform(transform_id)
    }

    async fn get_transforms_by_request(&self, request_id: RequestId) -> Result<Vec<Transform>> {
        Ok(self.lock().get_transforms_by_request(request_id))
    }

    async fn update_transform(
        &self,
        transform_id: TransformId,
        update: TransformUpdate,
    ) -> Result<()> {
        self.lock().update_transform(transform_id, update)
    }

    async fn get_transforms_by_status(
        &self,
        statuses: &[TransformStatus],
        bulk_size: usize,
        min_id: Option<TransformId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Transform>> {
        Ok(self.lock().get_transforms_by_status(statuses, bulk_size, min_id, claim))
    }

    async fn add_processing(&self, processing: Processing) -> Result<ProcessingId> {
        Ok(self.lock().add_processing(processing))
    }

    async fn get_processing(&self, processing_id: ProcessingId) -> Result<Processing> {
        self.lock().get_processing(processing_id)
    }

    async fn update_processing(
        &self,
        processing_id: ProcessingId,
        update: ProcessingUpdate,
    ) -> Result<()> {
        self.lock().update_processing(processing_id, update)
    }

    async fn get_processings_by_status(
        &self,
        statuses: &[ProcessingStatus],
        bulk_size: usize,
        min_id: Option<ProcessingId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Processing>> {
        Ok(self.lock().get_processings_by_status(statuses, bulk_size, min_id, claim))
    }

    async fn update_processing_contents(
        &self,
        processing_id: ProcessingId,
        commit: ProcessingCommit,
    ) -> Result<ContentPropagation> {
        self.lock().update_processing_contents(processing_id, commit)
    }

    async fn add_collection(&self, collection: Collection) -> Result<CollectionId> {
        Ok(self.lock().add_collection(collection))
    }

    async fn get_collection(&self, coll_id: CollectionId) -> Result<Collection> {
        self.lock().get_collection(coll_id)
    }

    async fn get_collections_by_transform(
        &self,
        transform_id: TransformId,
    ) -> Result<Vec<Collection>> {
        Ok(self.lock().get_collections_by_transform(transform_id))
    }

    async fn update_collection(
        &self,
        coll_id: CollectionId,
        update: CollectionUpdate,
    ) -> Result<()> {
        self.lock().update_collection(coll_id, update)
    }

    async fn register_contents(&self, contents: Vec<Content>) -> Result<Vec<ContentId>> {
        self.lock().register_contents(contents)
    }

    async fn get_contents_by_transform(&self, transform_id: TransformId) -> Result<Vec<Content>> {
        Ok(self.lock().get_contents_by_transform(transform_id))
    }

    async fn get_contents_by_coll(&self, coll_id: CollectionId) -> Result<Vec<Content>> {
        Ok(self.lock().get_contents_by_coll(coll_id))
    }

    async fn get_contents_by_request(&self, request_id: RequestId) -> Result<Vec<Content>> {
        Ok(self.lock().get_contents_by_request(request_id))
    }

    async fn update_contents(&self, updates: Vec<ContentUpdate>) -> Result<ContentPropagation> {
        self.lock().update_contents(updates)
    }

    async fn add_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.lock().add_messages(messages);
        Ok(())
    }

    async fn retrieve_messages(
        &self,
        status: MessageStatus,
        bulk_size: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.lock().retrieve_messages(status, bulk_size))
    }

    async fn update_messages(&self, msg_ids: &[MessageId], status: MessageStatus) -> Result<()> {
        self.lock().update_messages(msg_ids, status);
        Ok(())
    }

    async fn add_health_item(&self, item: HealthItem) -> Result<()> {
        self.lock().add_health_item(item);
        Ok(())
    }

    async fn retrieve_health_items(&self) -> Result<Vec<HealthItem>> {
        Ok(self.lock().retrieve_health_items())
    }

    async fn clean_health(&self, older_than: Duration, dead_pids: &[u32]) -> Result<usize> {
        Ok(self.lock().clean_health(older_than, dead_pids))
    }

    async fn select_agent(&self, agent: &str, newer_than: Duration) -> Result<HealthItem> {
        self.lock().select_agent(agent, newer_than)
    }

    async fn clean_locking(&self, older_than: Duration) -> Result<usize> {
        Ok(self.lock().clean_locking(older_than))
    }

    async fn clean_next_poll_at(&self) -> Result<()> {
        self.lock().clean_next_poll_at();
        Ok(())
    }
}
