//! Clerk: owns the Request lifecycle.
//!
//! Expands newly submitted requests into transforms (validating the
//! workflow DAG first), aggregates transform outcomes back into the request
//! status, and drives operator commands down to the transforms.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::json;
use tracing::{info, warn};

use crate::agents::base::{backoff_poll, Agent, AgentCore};
use crate::config::AgentConfig;
use crate::error::{CascadeError, Result};
use crate::events::{CoordinatorHandle, Event, EventSubject, EventType};
use crate::models::{
    LockOwner, LockStatus, Message, MessageSource, MessageType, Request, RequestId, RequestStatus,
    RequestUpdate, Transform, TransformStatus,
};
use crate::store::EntityStore;
use crate::work::WorkSpec;

const NEW_STATUSES: [RequestStatus; 2] = [RequestStatus::New, RequestStatus::Extend];
const RUNNING_STATUSES: [RequestStatus; 5] = [
    RequestStatus::Transforming,
    RequestStatus::Throttling,
    RequestStatus::Cancelling,
    RequestStatus::Suspending,
    RequestStatus::Expiring,
];
const OPERATION_STATUSES: [RequestStatus; 4] = [
    RequestStatus::ToCancel,
    RequestStatus::ToSuspend,
    RequestStatus::ToResume,
    RequestStatus::ToExpire,
];

pub struct Clerk {
    core: AgentCore,
    store: Arc<dyn EntityStore>,
    bus: CoordinatorHandle,
}

impl Clerk {
    pub fn new(store: Arc<dyn EntityStore>, bus: CoordinatorHandle, config: AgentConfig) -> Self {
        Self { core: AgentCore::new("clerk", config), store, bus }
    }

    async fn claim_request(&self, request_id: RequestId) -> Result<Request> {
        claim_request(&*self.store, request_id, &self.core.owner).await
    }

    /// Expand a new request into its transforms, one per work in topological
    /// order of the declared dependencies.
    async fn process_new_request(&self, request_id: RequestId) -> Result<Vec<Event>> {
        let request = self.claim_request(request_id).await?;
        let specs = workflow_specs(&request)?;
        let order = dag_order(&specs)?;

        let mut transform_ids: HashMap<String, u64> = HashMap::new();
        let mut events = Vec::new();
        for index in order {
            let spec = &specs[index];
            let depends_on: Vec<u64> = spec
                .depends_on
                .iter()
                .map(|name| {
                    transform_ids.get(name).copied().ok_or_else(|| {
                        CascadeError::InvalidWorkflow(format!(
                            "work {} depends on unknown work {name}",
                            spec.name
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            let metadata = json!({
                "spec": serde_json::to_value(spec)?,
                "depends_on_transform_ids": depends_on,
            });
            let mut transform =
                Transform::new(request.request_id, spec.name.clone(), spec.work_type, metadata);
            transform.max_new_retries = self.core.config.max_new_retries;
            transform.max_update_retries = self.core.config.max_update_retries;
            transform.poll_period = self.core.config.poll_period;
            let transform_id = self.store.add_transform(transform).await?;
            transform_ids.insert(spec.name.clone(), transform_id);
            events.push(Event::new(
                &self.core.name,
                EventType::NewTransform,
                EventSubject::Transform(transform_id),
            ));
        }
        info!(request_id, transforms = events.len(), "request expanded");

        self.store
            .update_request(
                request_id,
                RequestUpdate {
                    status: Some(RequestStatus::Transforming),
                    substatus: Some(RequestStatus::Transforming),
                    locking: Some(LockStatus::Idle),
                    next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(events)
    }

    /// Re-derive the request status from its transforms.
    async fn process_update_request(&self, request_id: RequestId) -> Result<Vec<Event>> {
        let request = self.claim_request(request_id).await?;
        let transforms = self.store.get_transforms_by_request(request_id).await?;

        let all_terminal =
            !transforms.is_empty() && transforms.iter().all(|t| t.status.is_terminal());
        if !all_terminal {
            self.store
                .update_request(
                    request_id,
                    RequestUpdate {
                        locking: Some(LockStatus::Idle),
                        next_poll_at: Some(Utc::now() + to_chrono(self.core.config.poll_period)),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(vec![]);
        }

        let status = aggregate_request_status(&request, &transforms);
        self.store
            .update_request(
                request_id,
                RequestUpdate {
                    status: Some(status),
                    substatus: Some(status),
                    locking: Some(LockStatus::Idle),
                    ..Default::default()
                },
            )
            .await?;
        info!(request_id, ?status, "request reached terminal status");

        let mut message = Message::new(
            MessageType::Work,
            MessageSource::Clerk,
            json!({ "request_id": request_id, "status": format!("{status:?}") }),
        );
        message.request_id = Some(request_id);
        self.store.add_messages(vec![message]).await?;
        Ok(vec![])
    }

    /// Turn an operator command into the matching `*ing` state and push it
    /// down to every non-terminal transform.
    async fn process_command(&self, request_id: RequestId, command: EventType) -> Result<Vec<Event>> {
        let request = self.claim_request(request_id).await?;
        let (next, downstream) = match (command, request.status) {
            (EventType::AbortRequest, RequestStatus::ToSuspend) => {
                (RequestStatus::Suspending, Some(EventType::AbortTransform))
            }
            (EventType::AbortRequest, _) => {
                (RequestStatus::Cancelling, Some(EventType::AbortTransform))
            }
            (EventType::ExpireRequest, _) => {
                (RequestStatus::Expiring, Some(EventType::AbortTransform))
            }
            (EventType::ResumeRequest, _) => {
                (RequestStatus::Transforming, Some(EventType::ResumeTransform))
            }
            (other, _) => {
                return Err(CascadeError::Store(format!(
                    "clerk cannot apply command {other:?}"
                )))
            }
        };

        self.store
            .update_request(
                request_id,
                RequestUpdate {
                    status: Some(next),
                    substatus: Some(next),
                    locking: Some(LockStatus::Idle),
                    next_poll_at: Some(Utc::now()),
                    // A resumed request starts a fresh retry budget.
                    new_retries: Some(0),
                    update_retries: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        let mut events = Vec::new();
        if let Some(event_type) = downstream {
            for transform in self.store.get_transforms_by_request(request_id).await? {
                let wake = match event_type {
                    EventType::ResumeTransform => transform.status.is_terminal()
                        && transform.status != TransformStatus::Finished,
                    _ => !transform.status.is_terminal(),
                };
                if wake {
                    let mut event = Event::new(
                        &self.core.name,
                        event_type,
                        EventSubject::Transform(transform.transform_id),
                    );
                    event.set_terminating();
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    /// Charge a failed attempt to the right retry budget; at budget the
    /// request goes terminal with the error recorded.
    async fn apply_retry(&self, request_id: RequestId, err: &CascadeError, new_path: bool) {
        let Ok(request) = self.store.get_request(request_id).await else {
            return;
        };
        let retries = if new_path { request.new_retries + 1 } else { request.update_retries + 1 };
        let budget =
            if new_path { request.max_new_retries } else { request.max_update_retries };
        let exhausted = budget > 0 && retries >= budget;
        let truncated = crate::models::truncate_error(&err.to_string(), 800);

        let update = if exhausted || !err.is_retryable() {
            RequestUpdate {
                status: Some(RequestStatus::Failed),
                substatus: Some(RequestStatus::Failed),
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                ..Default::default()
            }
        } else {
            let period = backoff_poll(&self.core.config, request.poll_period, retries);
            RequestUpdate {
                locking: Some(LockStatus::Idle),
                errors: Some(json!({ "message": truncated })),
                new_retries: new_path.then_some(retries),
                update_retries: (!new_path).then_some(retries),
                poll_period: Some(period),
                next_poll_at: Some(Utc::now() + to_chrono(period)),
                ..Default::default()
            }
        };
        if let Err(err) = self.store.update_request(request_id, update).await {
            warn!(request_id, error = %err, "failed to record request retry");
        }
    }
}

#[async_trait]
impl Agent for Clerk {
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
            EventType::NewRequest,
            EventType::UpdateRequest,
            EventType::AbortRequest,
            EventType::ResumeRequest,
            EventType::ExpireRequest,
        ]
    }

    async fn handle_event(&self, event: &Event) -> Result<Vec<Event>> {
        let request_id = event.event_id();
        let outcome = match event.event_type {
            EventType::NewRequest => self.process_new_request(request_id).await,
            EventType::UpdateRequest => self.process_update_request(request_id).await,
            EventType::AbortRequest | EventType::ResumeRequest | EventType::ExpireRequest => {
                self.process_command(request_id, event.event_type).await
            }
            other => Err(CascadeError::Store(format!("clerk got unexpected event {other:?}"))),
        };
        match outcome {
            Err(err @ CascadeError::Locked { .. }) => Err(err),
            Err(err) => {
                warn!(request_id, error = %err, "request handling failed");
                self.apply_retry(request_id, &err, event.event_type == EventType::NewRequest)
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
        for request in
            self.store.get_requests_by_status(&NEW_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::NewRequest,
                EventSubject::Request(request.request_id),
            ));
        }
        for request in
            self.store.get_requests_by_status(&RUNNING_STATUSES, bulk, None, claim).await?
        {
            events.push(Event::new(
                &self.core.name,
                EventType::UpdateRequest,
                EventSubject::Request(request.request_id),
            ));
        }
        for request in
            self.store.get_requests_by_status(&OPERATION_STATUSES, bulk, None, claim).await?
        {
            let event_type = match request.status {
                RequestStatus::ToResume => EventType::ResumeRequest,
                RequestStatus::ToExpire => EventType::ExpireRequest,
                _ => EventType::AbortRequest,
            };
            let mut event = Event::new(
                &self.core.name,
                event_type,
                EventSubject::Request(request.request_id),
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

pub(crate) async fn claim_request(
    store: &dyn EntityStore,
    request_id: RequestId,
    owner: &LockOwner,
) -> Result<Request> {
    let request = store.get_request(request_id).await?;
    match request.locking {
        LockStatus::Locking if request.lock_owner.as_ref() == Some(owner) => Ok(request),
        LockStatus::Locking => Err(CascadeError::locked("request", request_id)),
        LockStatus::Idle => {
            let rows = store
                .get_requests_by_status(&[request.status], 1, Some(request_id), Some(owner))
                .await?;
            match rows.into_iter().next() {
                Some(row) if row.request_id == request_id => Ok(row),
                Some(row) => {
                    // The scan skipped the gated target and claimed a later
                    // row; hand that one back untouched.
                    store
                        .update_request(
                            row.request_id,
                            RequestUpdate {
                                locking: Some(LockStatus::Idle),
                                ..Default::default()
                            },
                        )
                        .await?;
                    Err(CascadeError::locked("request", request_id))
                }
                None => Err(CascadeError::locked("request", request_id)),
            }
        }
    }
}

fn workflow_specs(request: &Request) -> Result<Vec<WorkSpec>> {
    let works = request
        .request_metadata
        .get("workflow")
        .and_then(|w| w.get("works"))
        .cloned()
        .ok_or_else(|| {
            CascadeError::InvalidWorkflow("request metadata carries no workflow.works".into())
        })?;
    let specs: Vec<WorkSpec> = serde_json::from_value(works)?;
    if specs.is_empty() {
        return Err(CascadeError::InvalidWorkflow("workflow has no works".into()));
    }
    Ok(specs)
}

/// Topological order of the works, or an error when the dependency graph has
/// a cycle or names an unknown work.
fn dag_order(specs: &[WorkSpec]) -> Result<Vec<usize>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let mut nodes = HashMap::new();
    for (index, spec) in specs.iter().enumerate() {
        nodes.insert(spec.name.as_str(), graph.add_node(index));
    }
    for spec in specs {
        let to = nodes[spec.name.as_str()];
        for dep in &spec.depends_on {
            let from = nodes.get(dep.as_str()).ok_or_else(|| {
                CascadeError::InvalidWorkflow(format!(
                    "work {} depends on unknown work {dep}",
                    spec.name
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }
    let order = toposort(&graph, None).map_err(|cycle| {
        CascadeError::InvalidWorkflow(format!(
            "workflow has a dependency cycle through {}",
            specs[graph[cycle.node_id()]].name
        ))
    })?;
    Ok(order.into_iter().map(|node| graph[node]).collect())
}

fn aggregate_request_status(request: &Request, transforms: &[Transform]) -> RequestStatus {
    match request.status {
        RequestStatus::Cancelling => return RequestStatus::Cancelled,
        RequestStatus::Suspending => return RequestStatus::Suspended,
        RequestStatus::Expiring => return RequestStatus::Expired,
        _ => {}
    }
    let finished =
        transforms.iter().filter(|t| t.status == TransformStatus::Finished).count();
    if finished == transforms.len() {
        RequestStatus::Finished
    } else if finished == 0 {
        RequestStatus::Failed
    } else {
        RequestStatus::SubFinished
    }
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{CollectionDef, WorkType};

    fn spec(name: &str, depends_on: &[&str]) -> WorkSpec {
        WorkSpec {
            work_type: WorkType::Generic,
            name: name.into(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            input: CollectionDef { scope: "data".into(), name: format!("{name}.in") },
            output: CollectionDef { scope: "data".into(), name: format!("{name}.out") },
            log: None,
            parameters: json!({}),
        }
    }

    #[test]
    fn dag_order_respects_dependencies() {
        let specs = vec![spec("b", &["a"]), spec("a", &[]), spec("c", &["a", "b"])];
        let order = dag_order(&specs).unwrap();
        let pos = |name: &str| {
            order
                .iter()
                .position(|&i| specs[i].name == name)
                .unwrap()
        };
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn dag_cycle_is_invalid() {
        let specs = vec![spec("a", &["b"]), spec("b", &["a"])];
        assert!(matches!(dag_order(&specs), Err(CascadeError::InvalidWorkflow(_))));
    }

    #[test]
    fn unknown_dependency_is_invalid() {
        let specs = vec![spec("a", &["ghost"])];
        assert!(matches!(dag_order(&specs), Err(CascadeError::InvalidWorkflow(_))));
    }

    #[test]
    fn request_aggregation_matrix() {
        let request = Request::new("r", json!({}));
        let transform = |status| {
            let mut t = Transform::new(1, "t", WorkType::Generic, json!({}));
            t.status = status;
            t
        };
        let all_finished =
            vec![transform(TransformStatus::Finished), transform(TransformStatus::Finished)];
        assert_eq!(aggregate_request_status(&request, &all_finished), RequestStatus::Finished);

        let none_finished =
            vec![transform(TransformStatus::Failed), transform(TransformStatus::Cancelled)];
        assert_eq!(aggregate_request_status(&request, &none_finished), RequestStatus::Failed);

        let mixed =
            vec![transform(TransformStatus::Finished), transform(TransformStatus::Failed)];
        assert_eq!(aggregate_request_status(&request, &mixed), RequestStatus::SubFinished);

        let mut cancelling = Request::new("r", json!({}));
        cancelling.status = RequestStatus::Cancelling;
        assert_eq!(aggregate_request_status(&cancelling, &mixed), RequestStatus::Cancelled);
    }
}
