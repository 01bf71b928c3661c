//! Shared table state and mutation logic behind both store backends.
//!
//! Everything here runs under the owning store's lock, so each public method
//! is one atomic commit. Mutations record touched keys in [`Dirty`] so the
//! sled backend can write through exactly what changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::error::{CascadeError, Result};
use crate::models::{
    Collection, CollectionId, CollectionUpdate, Content, ContentId, ContentUpdate, HealthItem,
    LockOwner, LockStatus, Message, MessageId, MessageStatus, Processing, ProcessingId,
    ProcessingStatus, ProcessingUpdate, Request, RequestId, RequestStatus, RequestUpdate,
    Transform, TransformId, TransformStatus, TransformUpdate,
};
use crate::models::{ContentRelationType, ContentStatus};
use crate::store::{ContentPropagation, ProcessingCommit};

/// Keys touched since the last drain, per table. Removed keys are listed
/// separately so the sled backend can delete them.
#[derive(Debug, Default)]
pub(crate) struct Dirty {
    pub requests: BTreeSet<RequestId>,
    pub transforms: BTreeSet<TransformId>,
    pub processings: BTreeSet<ProcessingId>,
    pub collections: BTreeSet<CollectionId>,
    pub contents: BTreeSet<ContentId>,
    pub messages: BTreeSet<MessageId>,
    pub health: BTreeSet<String>,
    pub removed_requests: BTreeSet<RequestId>,
    pub removed_transforms: BTreeSet<TransformId>,
    pub removed_processings: BTreeSet<ProcessingId>,
    pub removed_collections: BTreeSet<CollectionId>,
    pub removed_contents: BTreeSet<ContentId>,
    pub removed_messages: BTreeSet<MessageId>,
    pub removed_health: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub requests: BTreeMap<RequestId, Request>,
    pub transforms: BTreeMap<TransformId, Transform>,
    pub processings: BTreeMap<ProcessingId, Processing>,
    pub collections: BTreeMap<CollectionId, Collection>,
    pub contents: BTreeMap<ContentId, Content>,
    pub messages: BTreeMap<MessageId, Message>,
    pub health: BTreeMap<String, HealthItem>,
    pub next_request_id: RequestId,
    pub next_transform_id: TransformId,
    pub next_processing_id: ProcessingId,
    pub next_coll_id: CollectionId,
    pub next_content_id: ContentId,
    pub next_msg_id: MessageId,
    pub dirty: Dirty,
}

pub(crate) fn health_key(agent: &str, hostname: &str, pid: u32, thread_id: u64) -> String {
    format!("{agent}|{hostname}|{pid}|{thread_id}")
}

fn next_id(counter: &mut u64, requested: u64) -> u64 {
    if requested != 0 {
        *counter = (*counter).max(requested + 1);
        return requested;
    }
    if *counter == 0 {
        *counter = 1;
    }
    let id = *counter;
    *counter += 1;
    id
}

impl Tables {
    // --- requests ---

    pub fn add_request(&mut self, mut request: Request) -> RequestId {
        let id = next_id(&mut self.next_request_id, request.request_id);
        request.request_id = id;
        self.dirty.requests.insert(id);
        self.requests.insert(id, request);
        id
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request> {
        self.requests.get(&id).cloned().ok_or_else(|| CascadeError::not_found("request", id))
    }

    pub fn update_request(&mut self, id: RequestId, update: RequestUpdate) -> Result<()> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| CascadeError::not_found("request", id))?;
        let now = Utc::now();
        if let Some(status) = update.status {
            request.status = status;
            if status.is_terminal() && request.finished_at.is_none() {
                request.finished_at = Some(now);
            }
        }
        if let Some(substatus) = update.substatus {
            request.substatus = Some(substatus);
        }
        if let Some(locking) = update.locking {
            request.locking = locking;
            if locking == LockStatus::Idle {
                request.lock_owner = None;
            }
        }
        if let Some(errors) = update.errors {
            request.errors = Some(errors);
        }
        if let Some(n) = update.new_retries {
            request.new_retries = n;
        }
        if let Some(n) = update.update_retries {
            request.update_retries = n;
        }
        if let Some(p) = update.poll_period {
            request.poll_period = p;
        }
        if let Some(t) = update.next_poll_at {
            request.next_poll_at = t;
        }
        if let Some(m) = update.request_metadata {
            request.request_metadata = m;
        }
        request.updated_at = now;
        self.dirty.requests.insert(id);
        Ok(())
    }

    pub fn get_requests_by_status(
        &mut self,
        statuses: &[RequestStatus],
        bulk_size: usize,
        min_id: Option<RequestId>,
        claim: Option<&LockOwner>,
    ) -> Vec<Request> {
        let now = Utc::now();
        let floor = min_id.unwrap_or(0);
        let mut out = Vec::new();
        for (id, request) in self.requests.range_mut(floor..) {
            if out.len() >= bulk_size {
                break;
            }
            if !statuses.contains(&request.status) {
                continue;
            }
            if claim.is_some() {
                if request.locking != LockStatus::Idle || request.next_poll_at > now {
                    continue;
                }
                request.locking = LockStatus::Locking;
                request.lock_owner = claim.cloned();
                request.updated_at = now;
                self.dirty.requests.insert(*id);
            }
            out.push(request.clone());
        }
        out
    }

    pub fn delete_request(&mut self, id: RequestId) -> Result<()> {
        self.requests
            .remove(&id)
            .ok_or_else(|| CascadeError::not_found("request", id))?;
        self.dirty.removed_requests.insert(id);
        let transform_ids: Vec<_> = self
            .transforms
            .iter()
            .filter(|(_, t)| t.request_id == id)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in transform_ids {
            self.transforms.remove(&tid);
            self.dirty.removed_transforms.insert(tid);
        }
        retain_marking(&mut self.processings, &mut self.dirty.removed_processings, |p| {
            p.request_id != id
        });
        retain_marking(&mut self.collections, &mut self.dirty.removed_collections, |c| {
            c.request_id != id
        });
        retain_marking(&mut self.contents, &mut self.dirty.removed_contents, |c| {
            c.request_id != id
        });
        retain_marking(&mut self.messages, &mut self.dirty.removed_messages, |m| {
            m.request_id != Some(id)
        });
        Ok(())
    }

    // --- transforms ---

    pub fn add_transform(&mut self, mut transform: Transform) -> TransformId {
        let id = next_id(&mut self.next_transform_id, transform.transform_id);
        transform.transform_id = id;
        self.dirty.transforms.insert(id);
        self.transforms.insert(id, transform);
        id
    }

    pub fn get_transform(&self, id: TransformId) -> Result<Transform> {
        self.transforms.get(&id).cloned().ok_or_else(|| CascadeError::not_found("transform", id))
    }

    pub fn get_transforms_by_request(&self, request_id: RequestId) -> Vec<Transform> {
        self.transforms.values().filter(|t| t.request_id == request_id).cloned().collect()
    }

    pub fn update_transform(&mut self, id: TransformId, update: TransformUpdate) -> Result<()> {
        let transform = self
            .transforms
            .get_mut(&id)
            .ok_or_else(|| CascadeError::not_found("transform", id))?;
        let now = Utc::now();
        if let Some(status) = update.status {
            transform.status = status;
            if status.is_terminal() && transform.finished_at.is_none() {
                transform.finished_at = Some(now);
            }
        }
        if let Some(substatus) = update.substatus {
            transform.substatus = Some(substatus);
        }
        if let Some(locking) = update.locking {
            transform.locking = locking;
            if locking == LockStatus::Idle {
                transform.lock_owner = None;
            }
        }
        if let Some(errors) = update.errors {
            transform.errors = Some(errors);
        }
        if let Some(n) = update.new_retries {
            transform.new_retries = n;
        }
        if let Some(n) = update.update_retries {
            transform.update_retries = n;
        }
        if let Some(p) = update.poll_period {
            transform.poll_period = p;
        }
        if let Some(t) = update.next_poll_at {
            transform.next_poll_at = t;
        }
        if let Some(pid) = update.current_processing_id {
            transform.current_processing_id = Some(pid);
        }
        if let Some(m) = update.transform_metadata {
            transform.transform_metadata = m;
        }
        transform.updated_at = now;
        self.dirty.transforms.insert(id);
        Ok(())
    }

    pub fn get_transforms_by_status(
        &mut self,
        statuses: &[TransformStatus],
        bulk_size: usize,
        min_id: Option<TransformId>,
        claim: Option<&LockOwner>,
    ) -> Vec<Transform> {
        let now = Utc::now();
        let floor = min_id.unwrap_or(0);
        let mut out = Vec::new();
        for (id, transform) in self.transforms.range_mut(floor..) {
            if out.len() >= bulk_size {
                break;
            }
            if !statuses.contains(&transform.status) {
                continue;
            }
            if claim.is_some() {
                if transform.locking != LockStatus::Idle || transform.next_poll_at > now {
                    continue;
                }
                transform.locking = LockStatus::Locking;
                transform.lock_owner = claim.cloned();
                transform.updated_at = now;
                self.dirty.transforms.insert(*id);
            }
            out.push(transform.clone());
        }
        out
    }

    // --- processings ---

    pub fn add_processing(&mut self, mut processing: Processing) -> ProcessingId {
        let id = next_id(&mut self.next_processing_id, processing.processing_id);
        processing.processing_id = id;
        self.dirty.processings.insert(id);
        self.processings.insert(id, processing);
        id
    }

    pub fn get_processing(&self, id: ProcessingId) -> Result<Processing> {
        self.processings
            .get(&id)
            .cloned()
            .ok_or_else(|| CascadeError::not_found("processing", id))
    }

    pub fn update_processing(&mut self, id: ProcessingId, update: ProcessingUpdate) -> Result<()> {
        let processing = self
            .processings
            .get_mut(&id)
            .ok_or_else(|| CascadeError::not_found("processing", id))?;
        apply_processing_update(processing, update);
        self.dirty.processings.insert(id);
        Ok(())
    }

    pub fn get_processings_by_status(
        &mut self,
        statuses: &[ProcessingStatus],
        bulk_size: usize,
        min_id: Option<ProcessingId>,
        claim: Option<&LockOwner>,
    ) -> Vec<Processing> {
        let now = Utc::now();
        let floor = min_id.unwrap_or(0);
        let mut out = Vec::new();
        for (id, processing) in self.processings.range_mut(floor..) {
            if out.len() >= bulk_size {
                break;
            }
            if !statuses.contains(&processing.status) {
                continue;
            }
            if claim.is_some() {
                if processing.locking != LockStatus::Idle || processing.next_poll_at > now {
                    continue;
                }
                processing.locking = LockStatus::Locking;
                processing.lock_owner = claim.cloned();
                processing.updated_at = now;
                self.dirty.processings.insert(*id);
            }
            out.push(processing.clone());
        }
        out
    }

    pub fn update_processing_contents(
        &mut self,
        processing_id: ProcessingId,
        commit: ProcessingCommit,
    ) -> Result<ContentPropagation> {
        if !self.processings.contains_key(&processing_id) {
            return Err(CascadeError::not_found("processing", processing_id));
        }
        // All writes below are infallible once the new contents resolve, so
        // resolving first keeps the commit all-or-nothing.
        let new_ids = self.register_contents(commit.new_contents)?;
        if !new_ids.is_empty() {
            debug!(processing_id, count = new_ids.len(), "registered contents");
        }
        let propagation = self.update_contents(commit.content_updates)?;
        for (coll_id, update) in commit.collection_updates {
            self.update_collection(coll_id, update)?;
        }
        self.add_messages(commit.messages);
        if let Some(processing) = self.processings.get_mut(&processing_id) {
            apply_processing_update(processing, commit.processing_update);
            self.dirty.processings.insert(processing_id);
        }
        Ok(propagation)
    }

    // --- collections ---

    pub fn add_collection(&mut self, mut collection: Collection) -> CollectionId {
        let id = next_id(&mut self.next_coll_id, collection.coll_id);
        collection.coll_id = id;
        self.dirty.collections.insert(id);
        self.collections.insert(id, collection);
        id
    }

    pub fn get_collection(&self, id: CollectionId) -> Result<Collection> {
        self.collections
            .get(&id)
            .cloned()
            .ok_or_else(|| CascadeError::not_found("collection", id))
    }

    pub fn get_collections_by_transform(&self, transform_id: TransformId) -> Vec<Collection> {
        self.collections.values().filter(|c| c.transform_id == transform_id).cloned().collect()
    }

    pub fn update_collection(&mut self, id: CollectionId, update: CollectionUpdate) -> Result<()> {
        let collection = self
            .collections
            .get_mut(&id)
            .ok_or_else(|| CascadeError::not_found("collection", id))?;
        if let Some(status) = update.status {
            collection.status = status;
        }
        if let Some(n) = update.total_files {
            collection.total_files = n;
        }
        if let Some(n) = update.new_files {
            collection.new_files = n;
        }
        if let Some(n) = update.processed_files {
            collection.processed_files = n;
        }
        if let Some(m) = update.coll_metadata {
            collection.coll_metadata = Some(m);
        }
        collection.updated_at = Utc::now();
        self.dirty.collections.insert(id);
        Ok(())
    }

    // --- contents ---

    /// Insert rows, wiring `InputDependency` rows to the Output content of
    /// the same request they name. The whole batch fails if any dependency
    /// stays unresolved, before anything is written.
    pub fn register_contents(&mut self, contents: Vec<Content>) -> Result<Vec<ContentId>> {
        // scope:name -> content id, over existing plus incoming Output rows.
        let mut outputs: HashMap<(RequestId, &str, &str), ContentId> = HashMap::new();
        for content in self.contents.values() {
            if content.content_relation_type == ContentRelationType::Output {
                outputs.insert(
                    (content.request_id, content.scope.as_str(), content.name.as_str()),
                    content.content_id,
                );
            }
        }

        let start = if self.next_content_id == 0 { 1 } else { self.next_content_id };
        for (offset, content) in contents.iter().enumerate() {
            if content.content_relation_type == ContentRelationType::Output {
                let id = if content.content_id != 0 {
                    content.content_id
                } else {
                    start + offset as u64
                };
                outputs.insert(
                    (content.request_id, content.scope.as_str(), content.name.as_str()),
                    id,
                );
            }
        }

        let mut resolved = Vec::with_capacity(contents.len());
        for content in &contents {
            if content.content_relation_type == ContentRelationType::InputDependency
                && content.content_dep_id.is_none()
            {
                let dep = outputs
                    .get(&(content.request_id, content.scope.as_str(), content.name.as_str()))
                    .copied()
                    .ok_or_else(|| CascadeError::UnresolvedDependency {
                        scope: content.scope.clone(),
                        name: content.name.clone(),
                    })?;
                resolved.push(Some(dep));
            } else {
                resolved.push(None);
            }
        }

        let mut ids = Vec::with_capacity(contents.len());
        let mut touched_colls = BTreeSet::new();
        for (mut content, dep) in contents.into_iter().zip(resolved) {
            let id = next_id(&mut self.next_content_id, content.content_id);
            content.content_id = id;
            if let Some(dep) = dep {
                content.content_dep_id = Some(dep);
                // An already-available upstream must not strand the new row.
                if let Some(upstream) = self.contents.get(&dep) {
                    if upstream.substatus != ContentStatus::New {
                        content.substatus = upstream.substatus;
                        content.status = upstream.substatus;
                    }
                }
            }
            touched_colls.insert(content.coll_id);
            self.dirty.contents.insert(id);
            self.contents.insert(id, content);
            ids.push(id);
        }
        for coll_id in touched_colls {
            self.recompute_collection_counters(coll_id);
        }
        Ok(ids)
    }

    pub fn get_contents_by_transform(&self, transform_id: TransformId) -> Vec<Content> {
        self.contents.values().filter(|c| c.transform_id == transform_id).cloned().collect()
    }

    pub fn get_contents_by_coll(&self, coll_id: CollectionId) -> Vec<Content> {
        self.contents.values().filter(|c| c.coll_id == coll_id).cloned().collect()
    }

    pub fn get_contents_by_request(&self, request_id: RequestId) -> Vec<Content> {
        self.contents.values().filter(|c| c.request_id == request_id).cloned().collect()
    }

    /// Apply per-row updates, then propagate Output changes to the
    /// `InputDependency` rows waiting on them. Returns the transforms whose
    /// dependency inputs changed so the caller can wake them.
    pub fn update_contents(&mut self, updates: Vec<ContentUpdate>) -> Result<ContentPropagation> {
        let mut touched_colls = BTreeSet::new();
        let mut changed_outputs: Vec<(ContentId, ContentStatus)> = Vec::new();

        for update in updates {
            let id = update.content_id;
            let content = self
                .contents
                .get_mut(&id)
                .ok_or_else(|| CascadeError::not_found("content", id))?;
            let before = content.substatus;
            apply_content_update(content, &update);
            touched_colls.insert(content.coll_id);
            self.dirty.contents.insert(id);
            if content.content_relation_type == ContentRelationType::Output
                && content.substatus != before
            {
                changed_outputs.push((id, content.substatus));
            }
        }

        let mut woken = BTreeSet::new();
        for (output_id, substatus) in changed_outputs {
            let dependents: Vec<ContentId> = self
                .contents
                .values()
                .filter(|c| c.content_dep_id == Some(output_id))
                .map(|c| c.content_id)
                .collect();
            for dep_id in dependents {
                if let Some(dependent) = self.contents.get_mut(&dep_id) {
                    let update = ContentUpdate {
                        content_id: dep_id,
                        status: Some(substatus),
                        substatus: Some(substatus),
                        path: None,
                    };
                    apply_content_update(dependent, &update);
                    touched_colls.insert(dependent.coll_id);
                    woken.insert(dependent.transform_id);
                    self.dirty.contents.insert(dep_id);
                }
            }
        }

        for coll_id in touched_colls {
            self.recompute_collection_counters(coll_id);
        }
        Ok(ContentPropagation { updated_transform_ids: woken.into_iter().collect() })
    }

    fn recompute_collection_counters(&mut self, coll_id: CollectionId) {
        let mut total = 0u64;
        let mut new = 0u64;
        let mut processed = 0u64;
        for content in self.contents.values() {
            if content.coll_id != coll_id {
                continue;
            }
            total += 1;
            if content.status == ContentStatus::New {
                new += 1;
            }
            if content.substatus.is_available() {
                processed += 1;
            }
        }
        if let Some(collection) = self.collections.get_mut(&coll_id) {
            collection.total_files = total;
            collection.new_files = new;
            collection.processed_files = processed;
            collection.updated_at = Utc::now();
            self.dirty.collections.insert(coll_id);
        }
    }

    // --- messages ---

    pub fn add_messages(&mut self, messages: Vec<Message>) {
        for mut message in messages {
            let id = next_id(&mut self.next_msg_id, message.msg_id);
            message.msg_id = id;
            self.dirty.messages.insert(id);
            self.messages.insert(id, message);
        }
    }

    pub fn retrieve_messages(&self, status: MessageStatus, bulk_size: usize) -> Vec<Message> {
        self.messages
            .values()
            .filter(|m| m.status == status)
            .take(bulk_size)
            .cloned()
            .collect()
    }

    pub fn update_messages(&mut self, msg_ids: &[MessageId], status: MessageStatus) {
        let now = Utc::now();
        for id in msg_ids {
            if let Some(message) = self.messages.get_mut(id) {
                message.status = status;
                message.updated_at = now;
                self.dirty.messages.insert(*id);
            }
        }
    }

    // --- health ---

    pub fn add_health_item(&mut self, item: HealthItem) {
        let key = health_key(&item.agent, &item.hostname, item.pid, item.thread_id);
        self.dirty.health.insert(key.clone());
        self.health.insert(key, item);
    }

    pub fn retrieve_health_items(&self) -> Vec<HealthItem> {
        self.health.values().cloned().collect()
    }

    pub fn clean_health(&mut self, older_than: std::time::Duration, dead_pids: &[u32]) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::hours(1));
        let hostname = crate::models::local_hostname();
        let stale: Vec<String> = self
            .health
            .iter()
            .filter(|(_, item)| {
                item.updated_at < cutoff
                    || (item.hostname == hostname && dead_pids.contains(&item.pid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        let removed = stale.len();
        for key in stale {
            self.health.remove(&key);
            self.dirty.removed_health.insert(key);
        }
        removed
    }

    pub fn select_agent(
        &self,
        agent: &str,
        newer_than: std::time::Duration,
    ) -> Result<HealthItem> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(newer_than).unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut candidates: Vec<&HealthItem> = self
            .health
            .values()
            .filter(|item| item.agent == agent && item.updated_at >= cutoff)
            .collect();
        // deterministic: every node running this election picks the same one
        candidates.sort_by(|a, b| {
            (&a.hostname, a.pid, a.thread_id).cmp(&(&b.hostname, b.pid, b.thread_id))
        });
        candidates
            .first()
            .map(|item| (*item).clone())
            .ok_or_else(|| CascadeError::Store(format!("no live agent registered as {agent}")))
    }

    // --- maintenance ---

    pub fn clean_locking(&mut self, older_than: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::hours(1));
        let live: Vec<(String, u32)> =
            self.health.values().map(|h| (h.hostname.clone(), h.pid)).collect();
        let owner_dead = |owner: &Option<LockOwner>| match owner {
            Some(owner) => !live.iter().any(|(host, pid)| *host == owner.hostname && *pid == owner.pid),
            None => true,
        };

        let mut released = 0;
        for (id, request) in self.requests.iter_mut() {
            if request.locking == LockStatus::Locking
                && (request.updated_at < cutoff || owner_dead(&request.lock_owner))
            {
                request.locking = LockStatus::Idle;
                request.lock_owner = None;
                self.dirty.requests.insert(*id);
                released += 1;
            }
        }
        for (id, transform) in self.transforms.iter_mut() {
            if transform.locking == LockStatus::Locking
                && (transform.updated_at < cutoff || owner_dead(&transform.lock_owner))
            {
                transform.locking = LockStatus::Idle;
                transform.lock_owner = None;
                self.dirty.transforms.insert(*id);
                released += 1;
            }
        }
        for (id, processing) in self.processings.iter_mut() {
            if processing.locking == LockStatus::Locking
                && (processing.updated_at < cutoff || owner_dead(&processing.lock_owner))
            {
                processing.locking = LockStatus::Idle;
                processing.lock_owner = None;
                self.dirty.processings.insert(*id);
                released += 1;
            }
        }
        released
    }

    pub fn clean_next_poll_at(&mut self) {
        let now = Utc::now();
        for (id, request) in self.requests.iter_mut() {
            if !request.status.is_terminal() {
                request.next_poll_at = now;
                self.dirty.requests.insert(*id);
            }
        }
        for (id, transform) in self.transforms.iter_mut() {
            if !transform.status.is_terminal() {
                transform.next_poll_at = now;
                self.dirty.transforms.insert(*id);
            }
        }
        for (id, processing) in self.processings.iter_mut() {
            if !processing.status.is_terminal() {
                processing.next_poll_at = now;
                self.dirty.processings.insert(*id);
            }
        }
    }
}

fn retain_marking<K: Ord + Clone, V>(
    map: &mut BTreeMap<K, V>,
    removed: &mut BTreeSet<K>,
    keep: impl Fn(&V) -> bool,
) {
    let gone: Vec<K> =
        map.iter().filter(|(_, v)| !keep(v)).map(|(k, _)| k.clone()).collect();
    for key in gone {
        map.remove(&key);
        removed.insert(key);
    }
}

fn apply_processing_update(processing: &mut Processing, update: ProcessingUpdate) {
    let now = Utc::now();
    if let Some(status) = update.status {
        processing.status = status;
        if status.is_terminal() && processing.finished_at.is_none() {
            processing.finished_at = Some(now);
        }
    }
    if let Some(substatus) = update.substatus {
        processing.substatus = Some(substatus);
    }
    if let Some(locking) = update.locking {
        processing.locking = locking;
        if locking == LockStatus::Idle {
            processing.lock_owner = None;
        }
    }
    if let Some(errors) = update.errors {
        processing.errors = Some(errors);
    }
    if let Some(n) = update.new_retries {
        processing.new_retries = n;
    }
    if let Some(n) = update.update_retries {
        processing.update_retries = n;
    }
    if let Some(p) = update.poll_period {
        processing.poll_period = p;
    }
    if let Some(t) = update.next_poll_at {
        processing.next_poll_at = t;
    }
    if let Some(external_id) = update.external_id {
        processing.external_id = Some(external_id);
    }
    if let Some(t) = update.submitted_at {
        processing.submitted_at = Some(t);
    }
    if let Some(m) = update.processing_metadata {
        processing.processing_metadata = m;
    }
    processing.updated_at = now;
}

/// `substatus` always tracks the latest observation; `status` never leaves a
/// terminal state once it reached one.
fn apply_content_update(content: &mut Content, update: &ContentUpdate) {
    if let Some(substatus) = update.substatus {
        content.substatus = substatus;
    }
    if let Some(status) = update.status {
        if !content.status.is_terminal() {
            content.status = status;
        }
    }
    if let Some(path) = &update.path {
        content.path = Some(path.clone());
    }
    content.updated_at = Utc::now();
}
