//! End-to-end run of a two-stage derivation chain against the scripted
//! back-end, driving each agent handler directly so every step is
//! deterministic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cascade::agents::{Agent, Carrier, Clerk, Conductor, Transformer};
use cascade::api::{get_request_status, submit_request, RequestSubmission};
use cascade::config::{AgentConfig, CoordinatorConfig};
use cascade::events::{CoordinatorHandle, Event, EventType};
use cascade::models::{
    CollectionStatus, ContentRelationType, ContentStatus, MessageStatus, MessageType,
    ProcessingStatus, RequestStatus, TransformStatus,
};
use cascade::store::{EntityStore, MemoryStore};
use cascade::work::{register_generic_work, ScriptedBackend};

struct Pipeline {
    store: Arc<dyn EntityStore>,
    bus: CoordinatorHandle,
    backend: Arc<ScriptedBackend>,
    clerk: Clerk,
    transformer: Transformer,
    carrier: Carrier,
    conductor: Conductor,
}

impl Pipeline {
    fn new() -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let bus = CoordinatorHandle::local(CoordinatorConfig::default());
        let backend = Arc::new(ScriptedBackend::new(false));
        register_generic_work(backend.clone());

        // Zero poll period keeps every row immediately re-claimable.
        let config = AgentConfig { poll_period: Duration::ZERO, ..AgentConfig::default() };
        Self {
            clerk: Clerk::new(store.clone(), bus.clone(), config.clone()),
            transformer: Transformer::new(store.clone(), bus.clone(), config.clone()),
            carrier: Carrier::new(store.clone(), bus.clone(), config.clone()),
            conductor: Conductor::new(store.clone(), bus.clone(), config),
            store,
            bus,
            backend,
        }
    }

    /// Route one event to the agent subscribed to it and return the
    /// follow-ups.
    async fn dispatch(&self, event: &Event) -> Vec<Event> {
        let agent: &dyn Agent = match event.event_type {
            EventType::NewRequest | EventType::UpdateRequest | EventType::AbortRequest
            | EventType::ResumeRequest | EventType::ExpireRequest => &self.clerk,
            EventType::NewTransform | EventType::UpdateTransform | EventType::AbortTransform
            | EventType::ResumeTransform => &self.transformer,
            _ => &self.carrier,
        };
        agent.handle_event(event).await.unwrap()
    }

    /// Dispatch until no agent produces further events.
    async fn settle(&self, mut pending: Vec<Event>) {
        while let Some(event) = pending.pop() {
            pending.extend(self.dispatch(&event).await);
        }
    }
}

fn two_stage_workflow() -> serde_json::Value {
    json!({
        "works": [
            {
                "name": "stage-a",
                "work_type": "Generic",
                "input": {"scope": "data", "name": "raw"},
                "output": {"scope": "data", "name": "stage-a-out"},
                "parameters": {"input_files": ["f1", "f2"], "output_suffix": ".a"}
            },
            {
                "name": "stage-b",
                "work_type": "Generic",
                "depends_on": ["stage-a"],
                "input": {"scope": "data", "name": "stage-a-out"},
                "output": {"scope": "data", "name": "stage-b-out"},
                "parameters": {"output_suffix": ".b"}
            }
        ]
    })
}

#[tokio::test]
async fn two_stage_chain_runs_to_finished() {
    let p = Pipeline::new();

    let request_id = submit_request(
        &p.store,
        &p.bus,
        RequestSubmission { name: "chain".into(), workflow: two_stage_workflow(), priority: 0 },
    )
    .await
    .unwrap();

    // Clerk expands the request into two transforms, in dependency order.
    let new_request = p.bus.get(EventType::NewRequest, 10);
    assert_eq!(new_request.len(), 1);
    let transform_events = p.dispatch(&new_request[0]).await;
    assert_eq!(transform_events.len(), 2);
    assert!(transform_events.iter().all(|e| e.event_type == EventType::NewTransform));

    let transforms = p.store.get_transforms_by_request(request_id).await.unwrap();
    let (t_a, t_b) = (transforms[0].transform_id, transforms[1].transform_id);
    assert_eq!(transforms[0].name, "stage-a");
    assert_eq!(transforms[1].name, "stage-b");

    // Activation maps contents and opens one processing per transform.
    let mut processing_events = Vec::new();
    for event in &transform_events {
        processing_events.extend(p.dispatch(event).await);
    }
    assert_eq!(processing_events.len(), 2);

    let contents_b = p.store.get_contents_by_transform(t_b).await.unwrap();
    let deps: Vec<_> = contents_b
        .iter()
        .filter(|c| c.content_relation_type == ContentRelationType::InputDependency)
        .collect();
    assert_eq!(deps.len(), 2, "stage-b waits for f1.a and f2.a");
    assert!(deps.iter().all(|c| c.substatus == ContentStatus::New));

    // Carrier submits both processings to the back-end.
    for event in &processing_events {
        let followups = p.dispatch(event).await;
        assert_eq!(followups[0].event_type, EventType::UpdateProcessing);
    }
    assert_eq!(p.backend.job_count(), 2);

    let processings: Vec<_> = futures::future::try_join_all(
        p.store
            .get_transforms_by_request(request_id)
            .await
            .unwrap()
            .iter()
            .map(|t| p.store.get_processing(t.current_processing_id.unwrap())),
    )
    .await
    .unwrap();
    let (p_a, p_b) = (processings[0].clone(), processings[1].clone());
    let ext_a = p_a.external_id.clone().unwrap();
    let ext_b = p_b.external_id.clone().unwrap();

    // One upstream output lands: the dependency propagates but nothing
    // finishes yet.
    p.backend.set_file_done(&ext_a, "f1.a", true);
    let poll_a = Event::new("test", EventType::UpdateProcessing, cascade::events::EventSubject::Processing(p_a.processing_id));
    let woken = p.dispatch(&poll_a).await;
    assert!(woken
        .iter()
        .any(|e| e.event_type == EventType::UpdateTransform && e.event_id() == t_b));
    p.settle(woken).await;

    let contents_b = p.store.get_contents_by_transform(t_b).await.unwrap();
    let f1_dep = contents_b
        .iter()
        .find(|c| c.name == "f1.a" && c.content_relation_type == ContentRelationType::InputDependency)
        .unwrap();
    assert_eq!(f1_dep.substatus, ContentStatus::Available);
    let view = get_request_status(&p.store, request_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Transforming);

    // Stage A finishes: its transform closes, the request keeps running.
    p.backend.finish_job(&ext_a);
    p.settle(vec![poll_a]).await;

    let t_a_row = p.store.get_transform(t_a).await.unwrap();
    assert_eq!(t_a_row.status, TransformStatus::Finished);
    assert_eq!(
        p.store.get_processing(p_a.processing_id).await.unwrap().status,
        ProcessingStatus::Finished
    );
    for collection in p.store.get_collections_by_transform(t_a).await.unwrap() {
        assert_eq!(collection.status, CollectionStatus::Closed);
    }
    let view = get_request_status(&p.store, request_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Transforming, "stage-b still running");

    // Stage B finishes: the whole request closes out.
    p.backend.finish_job(&ext_b);
    let poll_b = Event::new("test", EventType::UpdateProcessing, cascade::events::EventSubject::Processing(p_b.processing_id));
    p.settle(vec![poll_b]).await;

    let view = get_request_status(&p.store, request_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Finished);
    assert!(view.transforms.iter().all(|t| t.status == TransformStatus::Finished));

    // The conductor drains the accumulated notifications.
    let mut feed = p.conductor.subscribe();
    p.conductor.on_timer().await.unwrap();
    let mut work_messages = 0;
    let mut file_messages = 0;
    while let Ok(message) = feed.try_recv() {
        match message.msg_type {
            MessageType::Work => work_messages += 1,
            MessageType::File => file_messages += 1,
            _ => {}
        }
    }
    // One per finished transform plus the request-level summary.
    assert_eq!(work_messages, 3);
    assert!(file_messages >= 2);
    assert!(p
        .store
        .retrieve_messages(MessageStatus::New, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn abort_command_cascades_to_the_backend() {
    let p = Pipeline::new();

    let request_id = submit_request(
        &p.store,
        &p.bus,
        RequestSubmission {
            name: "doomed".into(),
            workflow: json!({
                "works": [{
                    "name": "only",
                    "work_type": "Generic",
                    "input": {"scope": "data", "name": "raw"},
                    "output": {"scope": "data", "name": "out"},
                    "parameters": {"input_files": ["f1"]}
                }]
            }),
            priority: 0,
        },
    )
    .await
    .unwrap();

    // Run the pipeline up to a submitted processing.
    let new_request = p.bus.get(EventType::NewRequest, 10);
    let transform_events = p.dispatch(&new_request[0]).await;
    let processing_events = p.dispatch(&transform_events[0]).await;
    p.dispatch(&processing_events[0]).await;

    cascade::api::abort_request(&p.store, &p.bus, request_id).await.unwrap();
    let abort = p.bus.get(EventType::AbortRequest, 10);
    assert_eq!(abort.len(), 1);
    p.settle(abort).await;

    // The command walked request -> transform -> processing -> back-end and
    // the follow-up poll of the cancelled job closed everything out.
    let transforms = p.store.get_transforms_by_request(request_id).await.unwrap();
    let processing_id = transforms[0].current_processing_id.unwrap();

    let view = get_request_status(&p.store, request_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Cancelled);
    assert_eq!(view.transforms[0].status, TransformStatus::Cancelled);
    assert_eq!(
        p.store.get_processing(processing_id).await.unwrap().status,
        ProcessingStatus::Cancelled
    );
}
