//! Durable store: the in-memory tables write through to a `sled::Db`.
//!
//! The table lock serializes every commit, so each public operation flushes
//! its touched records as one batch before the lock is released. On open the
//! trees are loaded back and the id counters rebuilt from the highest keys.
//! Records are stored as JSON; the entities carry free-form `Value` metadata
//! blobs, which need a self-describing encoding.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::models::{
    Collection, CollectionId, CollectionUpdate, Content, ContentId, ContentUpdate, HealthItem,
    LockOwner, Message, MessageId, MessageStatus, Processing, ProcessingId, ProcessingStatus,
    ProcessingUpdate, Request, RequestId, RequestStatus, RequestUpdate, Transform, TransformId,
    TransformStatus, TransformUpdate,
};
use crate::store::tables::Tables;
use crate::store::{ContentPropagation, EntityStore, ProcessingCommit};

pub struct SledStore {
    _db: sled::Db,
    requests: sled::Tree,
    transforms: sled::Tree,
    processings: sled::Tree,
    collections: sled::Tree,
    contents: sled::Tree,
    messages: sled::Tree,
    health: sled::Tree,
    tables: Mutex<Tables>,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn load_tree<V: DeserializeOwned>(
    tree: &sled::Tree,
    mut insert: impl FnMut(u64, V),
) -> Result<u64> {
    let mut max_id = 0;
    for entry in tree.iter() {
        let (key, value) = entry?;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&key);
        let id = u64::from_be_bytes(id_bytes);
        max_id = max_id.max(id);
        insert(id, serde_json::from_slice(&value)?);
    }
    Ok(max_id)
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self {
            requests: db.open_tree("requests")?,
            transforms: db.open_tree("transforms")?,
            processings: db.open_tree("processings")?,
            collections: db.open_tree("collections")?,
            contents: db.open_tree("contents")?,
            messages: db.open_tree("messages")?,
            health: db.open_tree("health")?,
            tables: Mutex::new(Tables::default()),
            _db: db,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let mut guard = self.lock();
        let tables = &mut *guard;
        tables.next_request_id =
            load_tree(&self.requests, |id, v: Request| {
                tables.requests.insert(id, v);
            })? + 1;
        tables.next_transform_id =
            load_tree(&self.transforms, |id, v: Transform| {
                tables.transforms.insert(id, v);
            })? + 1;
        tables.next_processing_id =
            load_tree(&self.processings, |id, v: Processing| {
                tables.processings.insert(id, v);
            })? + 1;
        tables.next_coll_id =
            load_tree(&self.collections, |id, v: Collection| {
                tables.collections.insert(id, v);
            })? + 1;
        tables.next_content_id =
            load_tree(&self.contents, |id, v: Content| {
                tables.contents.insert(id, v);
            })? + 1;
        tables.next_msg_id =
            load_tree(&self.messages, |id, v: Message| {
                tables.messages.insert(id, v);
            })? + 1;
        for entry in self.health.iter() {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            tables.health.insert(key, serde_json::from_slice(&value)?);
        }
        info!(
            requests = tables.requests.len(),
            transforms = tables.transforms.len(),
            processings = tables.processings.len(),
            "loaded store from disk"
        );
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist everything the last operation touched, then clear the dirty
    /// sets. Runs under the table lock.
    fn flush(&self, tables: &mut Tables) -> Result<()> {
        flush_table(&self.requests, &tables.requests, &mut tables.dirty.requests)?;
        flush_removed(&self.requests, &mut tables.dirty.removed_requests)?;
        flush_table(&self.transforms, &tables.transforms, &mut tables.dirty.transforms)?;
        flush_removed(&self.transforms, &mut tables.dirty.removed_transforms)?;
        flush_table(&self.processings, &tables.processings, &mut tables.dirty.processings)?;
        flush_removed(&self.processings, &mut tables.dirty.removed_processings)?;
        flush_table(&self.collections, &tables.collections, &mut tables.dirty.collections)?;
        flush_removed(&self.collections, &mut tables.dirty.removed_collections)?;
        flush_table(&self.contents, &tables.contents, &mut tables.dirty.contents)?;
        flush_removed(&self.contents, &mut tables.dirty.removed_contents)?;
        flush_table(&self.messages, &tables.messages, &mut tables.dirty.messages)?;
        flush_removed(&self.messages, &mut tables.dirty.removed_messages)?;

        for key in std::mem::take(&mut tables.dirty.health) {
            if let Some(item) = tables.health.get(&key) {
                self.health.insert(key.as_bytes(), serde_json::to_vec(item)?)?;
            }
        }
        for key in std::mem::take(&mut tables.dirty.removed_health) {
            self.health.remove(key.as_bytes())?;
        }
        Ok(())
    }

    fn commit<T>(&self, op: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.lock();
        let out = op(&mut tables)?;
        self.flush(&mut tables)?;
        Ok(out)
    }
}

fn flush_table<V: Serialize>(
    tree: &sled::Tree,
    table: &std::collections::BTreeMap<u64, V>,
    dirty: &mut std::collections::BTreeSet<u64>,
) -> Result<()> {
    for id in std::mem::take(dirty) {
        if let Some(record) = table.get(&id) {
            tree.insert(id_key(id), serde_json::to_vec(record)?)?;
        }
    }
    Ok(())
}

fn flush_removed(tree: &sled::Tree, removed: &mut std::collections::BTreeSet<u64>) -> Result<()> {
    for id in std::mem::take(removed) {
        tree.remove(id_key(id))?;
    }
    Ok(())
}

#[async_trait]
impl EntityStore for SledStore {
    async fn add_request(&self, request: Request) -> Result<RequestId> {
        self.commit(|t| Ok(t.add_request(request)))
    }

    async fn get_request(&self, request_id: RequestId) -> Result<Request> {
        self.lock().get_request(request_id)
    }

    async fn update_request(&self, request_id: RequestId, update: RequestUpdate) -> Result<()> {
        self.commit(|t| t.update_request(request_id, update))
    }

    async fn get_requests_by_status(
        &self,
        statuses: &[RequestStatus],
        bulk_size: usize,
        min_id: Option<RequestId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Request>> {
        self.commit(|t| Ok(t.get_requests_by_status(statuses, bulk_size, min_id, claim)))
    }

    async fn delete_request(&self, request_id: RequestId) -> Result<()> {
        self.commit(|t| t.delete_request(request_id))
    }

    async fn add_transform(&self, transform: Transform) -> Result<TransformId> {
        self.commit(|t| Ok(t.add_transform(transform)))
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
        self.commit(|t| t.update_transform(transform_id, update))
    }

    async fn get_transforms_by_status(
        &self,
        statuses: &[TransformStatus],
        bulk_size: usize,
        min_id: Option<TransformId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Transform>> {
        self.commit(|t| Ok(t.get_transforms_by_status(statuses, bulk_size, min_id, claim)))
    }

    async fn add_processing(&self, processing: Processing) -> Result<ProcessingId> {
        self.commit(|t| Ok(t.add_processing(processing)))
    }

    async fn get_processing(&self, processing_id: ProcessingId) -> Result<Processing> {
        self.lock().get_processing(processing_id)
    }

    async fn update_processing(
        &self,
        processing_id: ProcessingId,
        update: ProcessingUpdate,
    ) -> Result<()> {
        self.commit(|t| t.update_processing(processing_id, update))
    }

    async fn get_processings_by_status(
        &self,
        statuses: &[ProcessingStatus],
        bulk_size: usize,
        min_id: Option<ProcessingId>,
        claim: Option<&LockOwner>,
    ) -> Result<Vec<Processing>> {
        self.commit(|t| Ok(t.get_processings_by_status(statuses, bulk_size, min_id, claim)))
    }

    async fn update_processing_contents(
        &self,
        processing_id: ProcessingId,
        commit: ProcessingCommit,
    ) -> Result<ContentPropagation> {
        self.commit(|t| t.update_processing_contents(processing_id, commit))
    }

    async fn add_collection(&self, collection: Collection) -> Result<CollectionId> {
        self.commit(|t| Ok(t.add_collection(collection)))
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
        self.commit(|t| t.update_collection(coll_id, update))
    }

    async fn register_contents(&self, contents: Vec<Content>) -> Result<Vec<ContentId>> {
        self.commit(|t| t.register_contents(contents))
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
        self.commit(|t| t.update_contents(updates))
    }

    async fn add_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.commit(|t| {
            t.add_messages(messages);
            Ok(())
        })
    }

    async fn retrieve_messages(
        &self,
        status: MessageStatus,
        bulk_size: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.lock().retrieve_messages(status, bulk_size))
    }

    async fn update_messages(&self, msg_ids: &[MessageId], status: MessageStatus) -> Result<()> {
        self.commit(|t| {
            t.update_messages(msg_ids, status);
            Ok(())
        })
    }

    async fn add_health_item(&self, item: HealthItem) -> Result<()> {
        self.commit(|t| {
            t.add_health_item(item);
            Ok(())
        })
    }

    async fn retrieve_health_items(&self) -> Result<Vec<HealthItem>> {
        Ok(self.lock().retrieve_health_items())
    }

    async fn clean_health(&self, older_than: Duration, dead_pids: &[u32]) -> Result<usize> {
        self.commit(|t| Ok(t.clean_health(older_than, dead_pids)))
    }

    async fn select_agent(&self, agent: &str, newer_than: Duration) -> Result<HealthItem> {
        self.lock().select_agent(agent, newer_than)
    }

    async fn clean_locking(&self, older_than: Duration) -> Result<usize> {
        self.commit(|t| Ok(t.clean_locking(older_than)))
    }

    async fn clean_next_poll_at(&self) -> Result<()> {
        self.commit(|t| {
            t.clean_next_poll_at();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let rid;
        {
            let store = SledStore::open(dir.path()).unwrap();
            rid = store.add_request(Request::new("persisted", json!({"k": 1}))).await.unwrap();
            store
                .update_request(
                    rid,
                    RequestUpdate {
                        status: Some(RequestStatus::Transforming),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let request = store.get_request(rid).await.unwrap();
        assert_eq!(request.name, "persisted");
        assert_eq!(request.status, RequestStatus::Transforming);
        assert_eq!(request.request_metadata["k"], 1);

        // id allocation continues past the reloaded rows
        let next = store.add_request(Request::new("next", json!({}))).await.unwrap();
        assert!(next > rid);
    }

    #[tokio::test]
    async fn deletes_write_through() {
        let dir = TempDir::new().unwrap();
        let rid;
        {
            let store = SledStore::open(dir.path()).unwrap();
            rid = store.add_request(Request::new("doomed", json!({}))).await.unwrap();
            store.delete_request(rid).await.unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert!(store.get_request(rid).await.is_err());
    }
}
