//! Transformer: owns the Transform lifecycle.
//!
//! Activates new transforms (collections, content mapping, first
//! processing), keeps mapping as upstream outputs appear, and folds content
//! state back into the transform status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agents::base::{backoff_poll, Agent, AgentCore};
use crate::agents::clerk::to_chrono;
use crate::config::AgentConfig;
use crate::error::{CascadeError, Result};
use crate::events::{CoordinatorHandle, Event, EventSubject, EventType};
use crate::models::{
    Collection, CollectionRelationType, CollectionStatus, CollectionUpdate, Content,
    ContentRelationType, LockOwner, LockStatus, Message, MessageSource, MessageType, Processing,
    Transform, TransformId, TransformStatus, TransformUpdate,
};
use crate::store::EntityStore;
use crate::work::{resolve_work, InputSource, Work, WorkSpec, WorkStatus};

const NEW_STATUSES: [TransformStatus; 1] = [TransformStatus::New];
const RUNNING_STATUSES: [TransformStatus; 4] = [
    TransformStatus::Transforming,
    TransformStatus::Cancelling,
    TransformStatus::Suspending,
    TransformStatus::Expiring,
];
const OPERATION_STATUSES: [TransformStatus; 4] = [
    TransformStatus::ToCancel,
    TransformStatus::ToSuspend,
    TransformStatus::ToResume,
    TransformStatus::ToExpire,
];

pub struct Transformer {
    core: AgentCore,
    store: Arc<dyn EntityStore>,
    bus: CoordinatorHandle,
}

impl Transformer {
    pub fn new(store: Arc<dyn EntityStore>, bus: CoordinatorHandle, config: AgentConfig) -> Self {
        Self { core: AgentCore::new("transformer", config), store, bus }
    }

    async fn claim_transform(&self, transform_id: TransformId) -> Result<Transform> {
        claim_transform(&*self.store, transform_id, &self.core.owner).await
    }

    /// First activation: collections, initial content maps, first processing.
    async fn process_new_transform(&self, transform_id: TransformId) -> Result<Vec<Event>> {
        let transform = self.claim_transform(transform_id).await?;
        let spec = transform_spec(&transform)?;
        let work = resolve_work(&spec)?;

        let collections = self.ensure_collections(&transform, &spec).await?;
        self.map_new_contents(&transform, &spec, &*work, &collections).await?;
        let (processing_id, events) = self.ensure_processing(&transform).await?;

        self.store
            .update_transform(
                transform_id,
                TransformUpdate {
                    status: Some(TransformStatus::Transforming),
                    substatus: Some(TransformStatus::Transforming),
                    current_processing_id: processing_id,
                    locking: Some(LockStatus::Idle),
                    next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                    ..Default::default()
                },
            )
            .await?;
        info!(transform_id, ?processing_id, "transform activated");
        Ok(events)
    }

    /// Create the transform's processing once it has contents to process. A
    /// dependent transform whose upstream has not produced outputs yet stays
    /// without one until the next poll.
    async fn ensure_processing(
        &self,
        transform: &Transform,
    ) -> Result<(Option<crate::models::ProcessingId>, Vec<Event>)> {
        if let Some(id) = transform.current_processing_id {
            return Ok((Some(id), vec![]));
        }
        let contents =
            self.store.get_contents_by_transform(transform.transform_id).await?;
        if contents.is_empty() {
            return Ok((None, vec![]));
        }
        let mut processing =
            Processing::new(transform.request_id, transform.transform_id, json!({}));
        processing.max_new_retries = self.core.config.max_new_retries;
        processing.max_update_retries = self.core.config.max_update_retries;
        processing.poll_period = self.core.config.poll_period;
        let id = self.store.add_processing(processing).await?;
        let event = Event::new(
            &self.core.name,
            EventType::NewProcessing,
            EventSubject::Processing(id),
        );
        Ok((Some(id), vec![event]))
    }

    /// Poll pass: map any new upstream outputs, then re-derive the transform
    /// status from its contents.
    async fn process_update_transform(&self, transform_id: TransformId) -> Result<Vec<Event>> {
        let transform = self.claim_transform(transform_id).await?;
        let spec = transform_spec(&transform)?;
        let work = resolve_work(&spec)?;

        let collections = self.ensure_collections(&transform, &spec).await?;
        // Operator-commanded transforms close out once their processing is
        // done, whatever the content histogram says.
        if matches!(
            transform.status,
            TransformStatus::Cancelling | TransformStatus::Suspending | TransformStatus::Expiring
        ) {
            return self.finish_commanded(&transform).await;
        }

        self.map_new_contents(&transform, &spec, &*work, &collections).await?;
        let (processing_id, mut events) = self.ensure_processing(&transform).await?;

        let contents = self.store.get_contents_by_transform(transform_id).await?;
        let work_status = work.syn_work_status(&contents);

        let status = match work_status {
            WorkStatus::Finished => Some(TransformStatus::Finished),
            WorkStatus::Failed => Some(TransformStatus::Failed),
            WorkStatus::SubFinished => Some(TransformStatus::SubFinished),
            WorkStatus::New | WorkStatus::Transforming => None,
        };

        match status {
            Some(status) => {
                events.extend(self.finish_transform(&transform, status, &collections).await?);
                Ok(events)
            }
            None => {
                self.store
                    .update_transform(
                        transform_id,
                        TransformUpdate {
                            current_processing_id: processing_id,
                            locking: Some(LockStatus::Idle),
                            next_poll_at: Some(
                                Utc::now() + to_chrono(self.core.config.poll_period),
                            ),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(events)
            }
        }
    }

    async fn finish_transform(
        &self,
        transform: &Transform,
        status: TransformStatus,
        collections: &[Collection],
    ) -> Result<Vec<Event>> {
        let coll_status = match status {
            TransformStatus::Finished => CollectionStatus::Closed,
            TransformStatus::SubFinished => CollectionStatus::SubClosed,
            _ => CollectionStatus::Failed,
        };
        for collection in collections {
            self.store
                .update_collection(
                    collection.coll_id,
                    CollectionUpdate { status: Some(coll_status), ..Default::default() },
                )
                .await?;
        }
        self.store
            .update_transform(
                transform.transform_id,
                TransformUpdate {
                    status: Some(status),
                    substatus: Some(status),
                    locking: Some(LockStatus::Idle),
                    ..Default::default()
                },
            )
            .await?;
        info!(transform_id = transform.transform_id, ?status, "transform terminal");

        let mut message = Message::new(
            MessageType::Work,
            MessageSource::Transformer,
            json!({
                "transform_id": transform.transform_id,
                "request_id": transform.request_id,
                "status": format!("{status:?}"),
            }),
        );
        message.request_id = Some(transform.request_id);
        message.transform_id = Some(transform.transform_id);
        self.store.add_messages(vec![message]).await?;

        let mut event = Event::new(
            &self.core.name,
            EventType::UpdateRequest,
            EventSubject::Request(transform.request_id),
        );
        event.set_has_updates();
        Ok(vec![event])
    }

    /// Close a Cancelling/Suspending/Expiring transform once its processing
    /// has reached a terminal state.
    async fn finish_commanded(&self, transform: &Transform) -> Result<Vec<Event>> {
        let processing_terminal = match transform.current_processing_id {
            Some(id) => self.store.get_processing(id).await?.status.is_terminal(),
            None => true,
        };
        if !processing_terminal {
            self.store
                .update_transform(
                    transform.transform_id,
                    TransformUpdate {
                        locking: Some(LockStatus::Idle),
                        next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(vec![]);
        }
        let status = match transform.status {
            TransformStatus::Suspending => TransformStatus::Suspended,
            TransformStatus::Expiring => TransformStatus::Expired,
            _ => TransformStatus::Cancelled,
        };
        self.store
            .update_transform(
                transform.transform_id,
                TransformUpdate {
                    status: Some(status),
                    substatus: Some(status),
                    locking: Some(LockStatus::Idle),
                    ..Default::default()
                },
            )
            .await?;
        let mut event = Event::new(
            &self.core.name,
            EventType::UpdateRequest,
            EventSubject::Request(transform.request_id),
        );
        event.set_has_updates();
        Ok(vec![event])
    }

    async fn process_command(
        &self,
        transform_id: TransformId,
        command: EventType,
    ) -> Result<Vec<Event>> {
        let transform = self.claim_transform(transform_id).await?;
        let mut events = Vec::new();

        let next = match command {
            EventType::ResumeTransform => {
                // Back into the running pool; the processing resumes too.
                if let Some(processing_id) = transform.current_processing_id {
                    events.push(Event::new(
                        &self.core.name,
                        EventType::ResumeProcessing,
                        EventSubject::Processing(processing_id),
                    ));
                }
                TransformStatus::Transforming
            }
            _ => {
                if let Some(processing_id) = transform.current_processing_id {
                    let mut event = Event::new(
                        &self.core.name,
                        EventType::AbortProcessing,
                        EventSubject::Processing(processing_id),
                    );
                    event.set_terminating();
                    events.push(event);
                }
                match transform.status {
                    TransformStatus::ToSuspend => TransformStatus::Suspending,
                    TransformStatus::ToExpire => TransformStatus::Expiring,
                    _ => TransformStatus::Cancelling,
                }
            }
        };

        self.store
            .update_transform(
                transform_id,
                TransformUpdate {
                    status: Some(next),
                    substatus: Some(next),
                    locking: Some(LockStatus::Idle),
                    next_poll_at: Some(Utc::now()),
                    new_retries: Some(0),
                    update_retries: Some(0),
                    ..Default::default()
                },
            )
            .await?;
        Ok(events)
    }

    /// Input/Output/Log collections for the transform, created on first call.
    async fn ensure_collections(
        &self,
        transform: &Transform,
        spec: &WorkSpec,
    ) -> Result<Vec<Collection>> {
        let existing = self.store.get_collections_by_transform(transform.transform_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let mut defs = vec![
            (spec.input.clone(), CollectionRelationType::Input),
            (spec.output.clone(), CollectionRelationType::Output),
        ];
        if let Some(log) = &spec.log {
            defs.push((log.clone(), CollectionRelationType::Log));
        }
        let mut collections = Vec::new();
        for (def, relation) in defs {
            let collection = Collection::new(
                transform.request_id,
                transform.transform_id,
                def.scope,
                def.name,
                relation,
            );
            let coll_id = self.store.add_collection(collection).await?;
            collections.push(self.store.get_collection(coll_id).await?);
        }
        debug!(transform_id = transform.transform_id, "collections registered");
        Ok(collections)
    }

    /// Offer unmapped candidates to the work and register the content rows
    /// it produces. Candidates are primary input files for root works,
    /// upstream Output contents for dependent works.
    async fn map_new_contents(
        &self,
        transform: &Transform,
        spec: &WorkSpec,
        work: &dyn Work,
        collections: &[Collection],
    ) -> Result<()> {
        let upstream_ids = depends_on_transform_ids(transform);
        let mut candidates = Vec::new();
        if upstream_ids.is_empty() {
            if let Some(files) =
                spec.parameters.get("input_files").and_then(|v| v.as_array())
            {
                for file in files.iter().filter_map(|f| f.as_str()) {
                    candidates.push(InputSource {
                        scope: spec.input.scope.clone(),
                        name: file.to_string(),
                        is_dependency: false,
                    });
                }
            }
        } else {
            for upstream_id in upstream_ids {
                for content in self.store.get_contents_by_transform(upstream_id).await? {
                    if content.content_relation_type == ContentRelationType::Output {
                        candidates.push(InputSource {
                            scope: content.scope,
                            name: content.name,
                            is_dependency: true,
                        });
                    }
                }
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let existing = self.store.get_contents_by_transform(transform.transform_id).await?;
        let next_map_id = existing.iter().map(|c| c.map_id).max().unwrap_or(0) + 1;
        let maps = work.new_input_output_maps(spec, &candidates, &existing, next_map_id)?;
        if maps.is_empty() {
            return Ok(());
        }

        let input_coll = collection_id(collections, CollectionRelationType::Input)?;
        let output_coll = collection_id(collections, CollectionRelationType::Output)?;
        let mut rows = Vec::new();
        for map in &maps {
            for (scope, name) in &map.inputs {
                let relation = if map.input_dependencies.contains(&(scope.clone(), name.clone())) {
                    ContentRelationType::InputDependency
                } else {
                    ContentRelationType::Input
                };
                rows.push(Content::new(
                    input_coll,
                    transform.request_id,
                    transform.transform_id,
                    map.map_id,
                    scope.clone(),
                    name.clone(),
                    relation,
                ));
            }
            for (scope, name) in &map.outputs {
                rows.push(Content::new(
                    output_coll,
                    transform.request_id,
                    transform.transform_id,
                    map.map_id,
                    scope.clone(),
                    name.clone(),
                    ContentRelationType::Output,
                ));
            }
        }
        let registered = self.store.register_contents(rows).await?;
        info!(
            transform_id = transform.transform_id,
            maps = maps.len(),
            contents = registered.len(),
            "mapped new contents"
        );
        Ok(())
    }

    async fn apply_retry(&self, transform_id: TransformId, err: &CascadeError, new_path: bool) {
        let Ok(transform) = self.store.get_transform(transform_id).await else {
            return;
        };
        let retries =
            if new_path { transform.new_retries + 1 } else { transform.update_retries + 1 };
        let budget =
            if new_path { transform.max_new_retries } else { transform.max_update_retries };
        let exhausted = budget > 0 && retries >= budget;
        let truncated = crate::models::truncate_error(&err.to_string(), 800);

        let update = if exhausted || !err.is_retryable() {
            TransformUpdate {
                status: Some(TransformStatus::Failed),
                substatus: Some(TransformStatus::Failed),
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                ..Default::default()
            }
        } else {
            let period = backoff_poll(&self.core.config, transform.poll_period, retries);
            TransformUpdate {
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                new_retries: new_path.then_some(retries),
                update_retries: (!new_path).then_some(retries),
                poll_period: Some(period),
                next_poll_at: Some(Utc::now() + to_chrono(period)),
                ..Default::default()
            }
        };
        if let Err(err) = self.store.update_transform(transform_id, update).await {
            warn!(transform_id, error = %err, "failed to record transform retry");
        }
        // A failed transform still has to surface in the request status.
        if exhausted {
            let mut event = Event::new(
                &self.core.name,
                EventType::UpdateRequest,
                EventSubject::Request(transform.request_id),
            );
            event.set_has_updates();
            self.bus.send(event);
        }
    }
}

#[async_trait]
impl Agent for Transformer {
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
        vec![
            EventType::NewTransform,
            EventType::UpdateTransform,
            EventType::AbortTransform,
            EventType::ResumeTransform,
        ]
    }

    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>> {
        let transform_id = event.event_id();
        let outcome = match event.event_type {
            EventType::NewTransform => self.process_new_transform(transform_id).await,
            EventType::UpdateTransform => self.process_update_transform(transform_id).await,
            EventType::AbortTransform | EventType::ResumeTransform => {
                self.process_command(transform_id, event.event_type).await
            }
            other => {
                Err(CascadeError::Store(format!("transformer got unexpected event {other:?}")))
            }
        };
        match outcome {
            Err(err @ CascadeError::Locked { .. }) => Err(err),
            Err(err) => {
                warn!(transform_id, error = %err, "transform handling failed");
                self.apply_retry(transform_id, &err, event.event_type == EventType::NewTransform)
                    .await;
                Ok(vec![])
            }
            ok => ok,
        }
    }

    async fn on_timer(&self) -> Result<()> {
        let bulk = self.core.config.retrieve_bulk_size;
        let claim = Some(&self.core.owner);

        let mut events = Vec::new();
        for transform in
            self.store.get_transforms_by_status(&NEW_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::NewTransform,
                EventSubject::Transform(transform.transform_id),
            ));
        }
        for transform in
            self.store.get_transforms_by_status(&RUNNING_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::UpdateTransform,
                EventSubject::Transform(transform.transform_id),
            ));
        }
        for transform in
            self.store.get_transforms_by_status(&OPERATION_STATUSES, bulk, None, claim).await?
        {
            let event_type = match transform.status {
                TransformStatus::ToResume => EventType::ResumeTransform,
                _ => EventType::AbortTransform,
            };
            let mut event = Event::new(
                &self.core.name,
                event_type,
                EventSubject::Transform(transform.transform_id),
            );
            event.set_terminating();
            events.push(event);
        }
        if !events.is_empty() {
            self.bus.send_bulk(events);
        }
        Ok(())
    }
}

pub(crate) async fn claim_transform(
    store: &dyn EntityStore,
    transform_id: TransformId,
    owner: &LockOwner,
) -> Result<Transform> {
    let transform = store.get_transform(transform_id).await?;
    match transform.locking {
        LockStatus::Locking if transform.lock_owner.as_ref() == Some(owner) => Ok(transform),
        LockStatus::Locking => Err(CascadeError::locked("transform", transform_id)),
        LockStatus::Idle => {
            let rows = store
                .get_transforms_by_status(&[transform.status], 1, Some(transform_id), Some(owner))
                .await?;
            match rows.into_iter().next() {
                Some(row) if row.transform_id == transform_id => Ok(row),
                Some(row) => {
                    // The scan skipped the gated target and claimed a later
                    // row; hand that one back untouched.
                    store
                        .update_transform(
                            row.transform_id,
                            TransformUpdate {
                                locking: Some(LockStatus::Idle),
                                ..Default::default()
                            },
                        )
                        .await?;
                    Err(CascadeError::locked("transform", transform_id))
                }
                None => Err(CascadeError::locked("transform", transform_id)),
            }
        }
    }
}

pub(crate) fn transform_spec(transform: &Transform) -> Result<WorkSpec> {
    let spec = transform.transform_metadata.get("spec").cloned().ok_or_else(|| {
        CascadeError::ProcessFormatNotSupported(format!(
            "transform {} carries no work spec",
            transform.transform_id
        ))
    })?;
    Ok(serde_json::from_value(spec)?)
}

fn depends_on_transform_ids(transform: &Transform) -> Vec<TransformId> {
    transform
        .transform_metadata
        .get("depends_on_transform_ids")
        .and_then(|v| v.as_array())
        .map(|ids| ids.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_default()
}

fn collection_id(
    collections: &[Collection],
    relation: CollectionRelationType,
) -> Result<crate::models::CollectionId> {
    collections
        .iter()
        .find(|c| c.relation_type == relation)
        .map(|c| c.coll_id)
        .ok_or_else(|| CascadeError::Store(format!("missing {relation:?} collection")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkType;

    #[test]
    fn transform_spec_round_trips_through_metadata() {
        let spec = WorkSpec {
            work_type: WorkType::Generic,
            name: "w".into(),
            depends_on: vec!["up".into()],
            input: crate::work::CollectionDef { scope: "s".into(), name: "in".into() },
            output: crate::work::CollectionDef { scope: "s".into(), name: "out".into() },
            log: None,
            parameters: json!({"x": 1}),
        };
        let metadata = json!({
            "spec": serde_json::to_value(&spec).unwrap(),
            "depends_on_transform_ids": [7, 9],
        });
        let transform = Transform::new(1, "w", WorkType::Generic, metadata);
        let parsed = transform_spec(&transform).unwrap();
        assert_eq!(parsed.name, "w");
        assert_eq!(depends_on_transform_ids(&transform), vec![7, 9]);
    }

    #[test]
    fn missing_spec_is_a_format_error() {
        let transform = Transform::new(1, "w", WorkType::Generic, json!({}));
        assert!(matches!(
            transform_spec(&transform),
            Err(CascadeError::ProcessFormatNotSupported(_))
        ));
    }
}
