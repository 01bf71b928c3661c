//! Carrier: owns the Processing lifecycle against the external back-end.
//!
//! Submits new processings, polls running ones and lands each observation as
//! one atomic commit (processing row + content rows + messages), and relays
//! abort/resume commands to the back-end.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::agents::base::{backoff_poll, Agent, AgentCore};
use crate::agents::clerk::to_chrono;
use crate::agents::transformer::transform_spec;
use crate::config::AgentConfig;
use crate::error::{CascadeError, Result};
use crate::events::{CoordinatorHandle, Event, EventSubject, EventType};
use crate::models::{
    LockOwner, LockStatus, Message, MessageSource, MessageType, Processing, ProcessingId,
    ProcessingStatus, ProcessingUpdate,
};
use crate::store::{EntityStore, ProcessingCommit};
use crate::work::resolve_work;

const NEW_STATUSES: [ProcessingStatus; 1] = [ProcessingStatus::New];
const RUNNING_STATUSES: [ProcessingStatus; 10] = [
    ProcessingStatus::Submitting,
    ProcessingStatus::Submitted,
    ProcessingStatus::Running,
    ProcessingStatus::Terminating,
    ProcessingStatus::ToFinish,
    ProcessingStatus::ToForceFinish,
    ProcessingStatus::Cancelling,
    ProcessingStatus::Suspending,
    ProcessingStatus::Expiring,
    ProcessingStatus::Resuming,
];
const OPERATION_STATUSES: [ProcessingStatus; 4] = [
    ProcessingStatus::ToCancel,
    ProcessingStatus::ToSuspend,
    ProcessingStatus::ToResume,
    ProcessingStatus::ToExpire,
];

pub struct Carrier {
    core: AgentCore,
    store: Arc<dyn EntityStore>,
    bus: CoordinatorHandle,
}

impl Carrier {
    pub fn new(store: Arc<dyn EntityStore>, bus: CoordinatorHandle, config: AgentConfig) -> Self {
        Self { core: AgentCore::new("carrier", config), store, bus }
    }

    async fn claim_processing(&self, processing_id: ProcessingId) -> Result<Processing> {
        let processing = self.store.get_processing(processing_id).await?;
        match processing.locking {
            LockStatus::Locking
                if processing.lock_owner.as_ref() == Some(&self.core.owner) =>
            {
                Ok(processing)
            }
            LockStatus::Locking => Err(CascadeError::locked("processing", processing_id)),
            LockStatus::Idle => {
                let rows = self
                    .store
                    .get_processings_by_status(
                        &[processing.status],
                        1,
                        Some(processing_id),
                        Some(&self.core.owner),
                    )
                    .await?;
                match rows.into_iter().next() {
                    Some(row) if row.processing_id == processing_id => Ok(row),
                    Some(row) => {
                        // The scan skipped the gated target and claimed a
                        // later row; hand that one back untouched.
                        self.store
                            .update_processing(
                                row.processing_id,
                                ProcessingUpdate {
                                    locking: Some(LockStatus::Idle),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        Err(CascadeError::locked("processing", processing_id))
                    }
                    None => Err(CascadeError::locked("processing", processing_id)),
                }
            }
        }
    }

    async fn work_for(&self, processing: &Processing) -> Result<Box<dyn crate::work::Work>> {
        let transform = self.store.get_transform(processing.transform_id).await?;
        let spec = transform_spec(&transform)?;
        resolve_work(&spec)
    }

    /// Submitter path: hand the processing to the back-end and record the
    /// external id.
    async fn process_new_processing(&self, processing_id: ProcessingId) -> Result<Vec<Event>> {
        let processing = self.claim_processing(processing_id).await?;
        let work = self.work_for(&processing).await?;
        let contents = self.store.get_contents_by_transform(processing.transform_id).await?;

        let external_id = work.submit_processing(&processing, &contents).await?;
        self.store
            .update_processing(
                processing_id,
                ProcessingUpdate {
                    status: Some(ProcessingStatus::Submitted),
                    substatus: Some(ProcessingStatus::Submitted),
                    external_id: Some(external_id.clone()),
                    submitted_at: Some(Utc::now()),
                    locking: Some(LockStatus::Idle),
                    next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                    ..Default::default()
                },
            )
            .await?;
        info!(processing_id, %external_id, "processing submitted");

        Ok(vec![Event::new(
            &self.core.name,
            EventType::UpdateProcessing,
            EventSubject::Processing(processing_id),
        )])
    }

    /// Poller path: one back-end observation landed as one atomic commit.
    async fn process_update_processing(&self, processing_id: ProcessingId) -> Result<Vec<Event>> {
        let processing = self.claim_processing(processing_id).await?;
        let work = self.work_for(&processing).await?;
        let contents = self.store.get_contents_by_transform(processing.transform_id).await?;

        let outcome = work.poll_processing(&processing, &contents).await?;
        let status = commanded_terminal(processing.status, outcome.status);
        let terminal = status.is_terminal();
        let has_updates = !outcome.content_updates.is_empty();

        let mut messages = Vec::new();
        if has_updates {
            let files: Vec<_> = outcome
                .content_updates
                .iter()
                .map(|u| {
                    json!({
                        "content_id": u.content_id,
                        "substatus": u.substatus.map(|s| format!("{s:?}")),
                    })
                })
                .collect();
            let mut message = Message::new(
                MessageType::File,
                MessageSource::Carrier,
                json!({"processing_id": processing_id, "files": files}),
            );
            message.request_id = Some(processing.request_id);
            message.transform_id = Some(processing.transform_id);
            message.processing_id = Some(processing_id);
            message.num_contents = outcome.content_updates.len() as u32;
            messages.push(message);
        }

        let commit = ProcessingCommit {
            processing_update: ProcessingUpdate {
                status: Some(status),
                substatus: Some(status),
                locking: Some(LockStatus::Idle),
                update_retries: Some(0),
                next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                ..Default::default()
            },
            new_contents: vec![],
            content_updates: outcome.content_updates,
            collection_updates: vec![],
            messages,
        };
        let propagation = self.store.update_processing_contents(processing_id, commit).await?;

        let mut events = Vec::new();
        let mut own = Event::new(
            &self.core.name,
            EventType::UpdateTransform,
            EventSubject::Transform(processing.transform_id),
        );
        if has_updates {
            own.set_has_updates();
        }
        if terminal {
            own.set_terminating();
        }
        if has_updates || terminal {
            events.push(own);
        }
        // Wake sibling transforms whose input dependencies just moved.
        for transform_id in propagation.updated_transform_ids {
            let mut event = Event::new(
                &self.core.name,
                EventType::UpdateTransform,
                EventSubject::Transform(transform_id),
            );
            event.set_has_updates();
            events.push(event);
        }
        Ok(events)
    }

    async fn process_command(
        &self,
        processing_id: ProcessingId,
        command: EventType,
    ) -> Result<Vec<Event>> {
        let processing = self.claim_processing(processing_id).await?;
        if processing.status.is_terminal() {
            self.store
                .update_processing(
                    processing_id,
                    ProcessingUpdate {
                        locking: Some(LockStatus::Idle),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(vec![]);
        }
        let work = self.work_for(&processing).await?;

        let next = match command {
            EventType::ResumeProcessing => {
                work.resume_processing(&processing).await?;
                ProcessingStatus::Resuming
            }
            _ => {
                work.abort_processing(&processing).await?;
                match processing.status {
                    ProcessingStatus::ToSuspend => ProcessingStatus::Suspending,
                    ProcessingStatus::ToExpire => ProcessingStatus::Expiring,
                    _ => ProcessingStatus::Cancelling,
                }
            }
        };
        self.store
            .update_processing(
                processing_id,
                ProcessingUpdate {
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

        Ok(vec![Event::new(
            &self.core.name,
            EventType::UpdateProcessing,
            EventSubject::Processing(processing_id),
        )])
    }

    async fn apply_retry(&self, processing_id: ProcessingId, err: &CascadeError, new_path: bool) {
        let Ok(processing) = self.store.get_processing(processing_id).await else {
            return;
        };
        let retries =
            if new_path { processing.new_retries + 1 } else { processing.update_retries + 1 };
        let budget =
            if new_path { processing.max_new_retries } else { processing.max_update_retries };
        let exhausted = budget > 0 && retries >= budget;
        let truncated = crate::models::truncate_error(&err.to_string(), 800);

        let update = if exhausted || !err.is_retryable() {
            ProcessingUpdate {
                status: Some(ProcessingStatus::Failed),
                substatus: Some(ProcessingStatus::Failed),
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                ..Default::default()
            }
        } else {
            let period = backoff_poll(&self.core.config, processing.poll_period, retries);
            ProcessingUpdate {
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                new_retries: new_path.then_some(retries),
                update_retries: (!new_path).then_some(retries),
                poll_period: Some(period),
                next_poll_at: Some(Utc::now() + to_chrono(period)),
                ..Default::default()
            }
        };
        if let Err(err) = self.store.update_processing(processing_id, update).await {
            warn!(processing_id, error = %err, "failed to record processing retry");
        }
        if exhausted {
            let mut event = Event::new(
                &self.core.name,
                EventType::UpdateTransform,
                EventSubject::Transform(processing.transform_id),
            );
            event.set_terminating();
            self.bus.send(event);
        }
    }
}

/// An aborted back-end job reports Cancelled whatever the operator asked
/// for; land it as the terminal state matching the command in flight.
fn commanded_terminal(
    current: ProcessingStatus,
    observed: ProcessingStatus,
) -> ProcessingStatus {
    if observed != ProcessingStatus::Cancelled {
        return observed;
    }
    match current {
        ProcessingStatus::Suspending => ProcessingStatus::Suspended,
        ProcessingStatus::Expiring => ProcessingStatus::Expired,
        _ => observed,
    }
}

#[async_trait]
impl Agent for Carrier {
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
            EventType::NewProcessing,
            EventType::UpdateProcessing,
            EventType::AbortProcessing,
            EventType::ResumeProcessing,
        ]
    }

    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>> {
        let processing_id = event.event_id();
        let outcome = match event.event_type {
            EventType::NewProcessing => self.process_new_processing(processing_id).await,
            EventType::UpdateProcessing => self.process_update_processing(processing_id).await,
            EventType::AbortProcessing | EventType::ResumeProcessing => {
                self.process_command(processing_id, event.event_type).await
            }
            other => Err(CascadeError::Store(format!("carrier got unexpected event {other:?}"))),
        };
        match outcome {
            Err(err @ CascadeError::Locked { .. }) => Err(err),
            Err(err) => {
                warn!(processing_id, error = %err, "processing handling failed");
                self.apply_retry(processing_id, &err, event.event_type == EventType::NewProcessing)
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
        for processing in
            self.store.get_processings_by_status(&NEW_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::NewProcessing,
                EventSubject::Processing(processing.processing_id),
            ));
        }
        for processing in
            self.store.get_processings_by_status(&RUNNING_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::UpdateProcessing,
                EventSubject::Processing(processing.processing_id),
            ));
        }
        for processing in
            self.store.get_processings_by_status(&OPERATION_STATUSES, bulk, None, claim).await?
        {
            let event_type = match processing.status {
                ProcessingStatus::ToResume => EventType::ResumeProcessing,
                _ => EventType::AbortProcessing,
            };
            let mut event = Event::new(
                &self.core.name,
                event_type,
                EventSubject::Processing(processing.processing_id),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::models::{Request, Transform};
    use crate::store::MemoryStore;
    use crate::work::{
        register_generic_work, CollectionDef, ScriptedBackend, WorkSpec, WorkType,
    };
    use pretty_assertions::assert_eq;

    async fn seed_processing(
        store: &Arc<dyn EntityStore>,
        status: ProcessingStatus,
    ) -> ProcessingId {
        let request_id = store
            .add_request(Request::new("req", json!({})))
            .await
            .unwrap();
        let transform_id = store
            .add_transform(Transform::new(request_id, "t0", WorkType::Generic, json!({})))
            .await
            .unwrap();
        let mut processing = Processing::new(request_id, transform_id, json!({}));
        processing.status = status;
        store.add_processing(processing).await.unwrap()
    }

    fn carrier(store: Arc<dyn EntityStore>) -> Carrier {
        let bus = CoordinatorHandle::local(CoordinatorConfig::default());
        Carrier::new(store, bus, AgentConfig::default())
    }

    fn work_spec() -> serde_json::Value {
        serde_json::to_value(WorkSpec {
            work_type: WorkType::Generic,
            name: "w".into(),
            depends_on: vec![],
            input: CollectionDef { scope: "s".into(), name: "in".into() },
            output: CollectionDef { scope: "s".into(), name: "out".into() },
            log: None,
            parameters: json!({}),
        })
        .unwrap()
    }

    /// Like [`seed_processing`], but the transform carries a resolvable work
    /// spec so command handling can reach the back-end.
    async fn seed_commanded(
        store: &Arc<dyn EntityStore>,
        status: ProcessingStatus,
    ) -> ProcessingId {
        let request_id = store.add_request(Request::new("req", json!({}))).await.unwrap();
        let transform_id = store
            .add_transform(Transform::new(
                request_id,
                "w",
                WorkType::Generic,
                json!({"spec": work_spec()}),
            ))
            .await
            .unwrap();
        let mut processing = Processing::new(request_id, transform_id, json!({}));
        processing.status = status;
        store.add_processing(processing).await.unwrap()
    }

    #[tokio::test]
    async fn command_on_terminal_processing_only_unlocks() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let processing_id = seed_processing(&store, ProcessingStatus::Cancelled).await;
        let carrier = carrier(store.clone());

        let events = carrier
            .process_command(processing_id, EventType::AbortProcessing)
            .await
            .unwrap();
        assert!(events.is_empty());
        let row = store.get_processing(processing_id).await.unwrap();
        assert_eq!(row.status, ProcessingStatus::Cancelled);
        assert_eq!(row.locking, LockStatus::Idle);
    }

    #[tokio::test]
    async fn claim_fails_when_another_owner_holds_the_lock() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let processing_id = seed_processing(&store, ProcessingStatus::New).await;
        let other = LockOwner::current("other-agent");
        store
            .get_processings_by_status(&[ProcessingStatus::New], 1, None, Some(&other))
            .await
            .unwrap();

        let carrier = carrier(store);
        let err = carrier.claim_processing(processing_id).await.unwrap_err();
        assert!(matches!(err, CascadeError::Locked { .. }));
    }

    #[tokio::test]
    async fn gated_claim_leaves_other_rows_unlocked() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let gated_id = seed_processing(&store, ProcessingStatus::New).await;
        let other_id = seed_processing(&store, ProcessingStatus::New).await;
        // The target is not pollable yet, as right after a submit.
        store
            .update_processing(
                gated_id,
                ProcessingUpdate {
                    next_poll_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let carrier = carrier(store.clone());
        let err = carrier.claim_processing(gated_id).await.unwrap_err();
        assert!(matches!(err, CascadeError::Locked { .. }));

        let neighbor = store.get_processing(other_id).await.unwrap();
        assert_eq!(neighbor.locking, LockStatus::Idle);
        assert_eq!(neighbor.lock_owner, None);
    }

    #[tokio::test]
    async fn each_stop_command_keeps_its_own_state() {
        register_generic_work(Arc::new(ScriptedBackend::new(false)));
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let suspend_id = seed_commanded(&store, ProcessingStatus::ToSuspend).await;
        let expire_id = seed_commanded(&store, ProcessingStatus::ToExpire).await;
        let cancel_id = seed_commanded(&store, ProcessingStatus::ToCancel).await;
        let carrier = carrier(store.clone());

        for id in [suspend_id, expire_id, cancel_id] {
            carrier.process_command(id, EventType::AbortProcessing).await.unwrap();
        }

        let expected = [
            (suspend_id, ProcessingStatus::Suspending),
            (expire_id, ProcessingStatus::Expiring),
            (cancel_id, ProcessingStatus::Cancelling),
        ];
        for (id, status) in expected {
            assert_eq!(store.get_processing(id).await.unwrap().status, status);
        }
    }

    #[test]
    fn commanded_stops_land_as_their_own_terminal_states() {
        assert_eq!(
            commanded_terminal(ProcessingStatus::Suspending, ProcessingStatus::Cancelled),
            ProcessingStatus::Suspended
        );
        assert_eq!(
            commanded_terminal(ProcessingStatus::Expiring, ProcessingStatus::Cancelled),
            ProcessingStatus::Expired
        );
        assert_eq!(
            commanded_terminal(ProcessingStatus::Cancelling, ProcessingStatus::Cancelled),
            ProcessingStatus::Cancelled
        );
        assert_eq!(
            commanded_terminal(ProcessingStatus::Running, ProcessingStatus::Finished),
            ProcessingStatus::Finished
        );
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_retry_budget() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let processing_id = seed_processing(&store, ProcessingStatus::New).await;
        let carrier = carrier(store.clone());
        let err = CascadeError::Backend("submission refused".into());

        // Budget of 3 (the default): two charges leave the row retryable.
        carrier.apply_retry(processing_id, &err, true).await;
        carrier.apply_retry(processing_id, &err, true).await;
        let row = store.get_processing(processing_id).await.unwrap();
        assert_eq!(row.new_retries, 2);
        assert_eq!(row.status, ProcessingStatus::New);
        assert!(row.errors.is_some());
        assert!(row.poll_period > AgentConfig::default().poll_period);

        carrier.apply_retry(processing_id, &err, true).await;
        let row = store.get_processing(processing_id).await.unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);

        let woken = carrier.bus.get(EventType::UpdateTransform, 10);
        assert_eq!(woken.len(), 1);
        assert!(woken[0].is_terminating());
    }

    #[tokio::test]
    async fn zero_budget_retries_forever() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let processing_id = seed_processing(&store, ProcessingStatus::Running).await;
        let carrier = carrier(store.clone());
        let err = CascadeError::Backend("poll glitch".into());

        // max_update_retries defaults to 0: unbounded.
        for _ in 0..10 {
            carrier.apply_retry(processing_id, &err, false).await;
        }
        let row = store.get_processing(processing_id).await.unwrap();
        assert_eq!(row.update_retries, 10);
        assert_eq!(row.status, ProcessingStatus::Running);
    }

    #[tokio::test]
    async fn contract_violations_fail_without_retrying() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let processing_id = seed_processing(&store, ProcessingStatus::New).await;
        let carrier = carrier(store.clone());

        let err = CascadeError::ProcessFormatNotSupported("no work spec".into());
        carrier.apply_retry(processing_id, &err, true).await;
        let row = store.get_processing(processing_id).await.unwrap();
        assert_eq!(row.status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn discovery_routes_each_status_bucket() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let new_id = seed_processing(&store, ProcessingStatus::New).await;
        let running_id = seed_processing(&store, ProcessingStatus::Running).await;
        let cancel_id = seed_processing(&store, ProcessingStatus::ToCancel).await;
        let resume_id = seed_processing(&store, ProcessingStatus::ToResume).await;

        let carrier = carrier(store);
        carrier.on_timer().await.unwrap();

        let mut seen = Vec::new();
        for event_type in [
            EventType::NewProcessing,
            EventType::UpdateProcessing,
            EventType::AbortProcessing,
            EventType::ResumeProcessing,
        ] {
            for event in carrier.bus.get(event_type, 10) {
                seen.push((event.event_type, event.event_id(), event.is_terminating()));
            }
        }
        seen.sort_by_key(|(_, id, _)| *id);
        assert_eq!(
            seen,
            vec![
                (EventType::NewProcessing, new_id, false),
                (EventType::UpdateProcessing, running_id, false),
                (EventType::AbortProcessing, cancel_id, true),
                (EventType::ResumeProcessing, resume_id, true),
            ]
        );
    }
}
