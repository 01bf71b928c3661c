//! Client-facing surface: submit, abort, resume and inspect requests.
//!
//! Every call reduces to store writes plus an event on the bus; there is no
//! wire protocol in front of it.

use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{CascadeError, Result};
use crate::events::{CoordinatorHandle, Event, EventSubject, EventType};
use crate::models::{Request, RequestId, RequestStatus, RequestUpdate, TransformStatus};
use crate::store::EntityStore;

lazy_static! {
    static ref WORKFLOW_VALIDATOR: jsonschema::Validator = {
        let schema = json!({
            "type": "object",
            "required": ["works"],
            "properties": {
                "works": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["name", "work_type", "input", "output"],
                        "properties": {
                            "name": {"type": "string", "minLength": 1},
                            "work_type": {"type": "string"},
                            "depends_on": {"type": "array", "items": {"type": "string"}},
                            "input": {
                                "type": "object",
                                "required": ["scope", "name"],
                                "properties": {
                                    "scope": {"type": "string"},
                                    "name": {"type": "string"}
                                }
                            },
                            "output": {
                                "type": "object",
                                "required": ["scope", "name"],
                                "properties": {
                                    "scope": {"type": "string"},
                                    "name": {"type": "string"}
                                }
                            },
                            "parameters": {"type": "object"}
                        }
                    }
                }
            }
        });
        jsonschema::validator_for(&schema).expect("workflow schema is valid")
    };
}

/// Everything a client provides when submitting a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSubmission {
    pub name: String,
    /// `{"works": [...]}`; each work is a serialized `WorkSpec`.
    pub workflow: Value,
    #[serde(default)]
    pub priority: u32,
}

/// Snapshot of one request and its transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatusView {
    pub request_id: RequestId,
    pub name: String,
    pub status: RequestStatus,
    pub substatus: Option<RequestStatus>,
    pub errors: Option<Value>,
    pub transforms: Vec<TransformStatusView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStatusView {
    pub transform_id: u64,
    pub name: String,
    pub status: TransformStatus,
    pub substatus: Option<TransformStatus>,
}

fn validate_workflow(workflow: &Value) -> Result<()> {
    if let Err(error) = WORKFLOW_VALIDATOR.validate(workflow) {
        return Err(CascadeError::SchemaValidation(error.to_string()));
    }
    Ok(())
}

/// Validate the workflow, persist the request and wake the clerk.
pub async fn submit_request(
    store: &Arc<dyn EntityStore>,
    bus: &CoordinatorHandle,
    submission: RequestSubmission,
) -> Result<RequestId> {
    validate_workflow(&submission.workflow)?;

    let mut request = Request::new(submission.name, json!({"workflow": submission.workflow}));
    request.priority = submission.priority;
    let request_id = store.add_request(request).await?;
    info!(request_id, "request submitted");

    bus.send(Event::new("api", EventType::NewRequest, EventSubject::Request(request_id)));
    Ok(request_id)
}

/// Flag the request for cancellation; the clerk fans the command out.
pub async fn abort_request(
    store: &Arc<dyn EntityStore>,
    bus: &CoordinatorHandle,
    request_id: RequestId,
) -> Result<()> {
    command_request(store, bus, request_id, RequestStatus::ToCancel, EventType::AbortRequest).await
}

/// Wake a terminal-but-unfinished request for another attempt.
pub async fn resume_request(
    store: &Arc<dyn EntityStore>,
    bus: &CoordinatorHandle,
    request_id: RequestId,
) -> Result<()> {
    command_request(store, bus, request_id, RequestStatus::ToResume, EventType::ResumeRequest).await
}

async fn command_request(
    store: &Arc<dyn EntityStore>,
    bus: &CoordinatorHandle,
    request_id: RequestId,
    status: RequestStatus,
    event_type: EventType,
) -> Result<()> {
    let request = store.get_request(request_id).await?;
    if event_type == EventType::AbortRequest && request.status.is_terminal() {
        return Err(CascadeError::InvalidWorkflow(format!(
            "request {request_id} is already terminal"
        )));
    }
    if event_type == EventType::ResumeRequest && request.status == RequestStatus::Finished {
        return Err(CascadeError::InvalidWorkflow(format!(
            "request {request_id} already finished"
        )));
    }
    store
        .update_request(
            request_id,
            RequestUpdate {
                status: Some(status),
                next_poll_at: Some(Utc::now()),
                new_retries: Some(0),
                update_retries: Some(0),
                ..Default::default()
            },
        )
        .await?;
    let mut event = Event::new("api", event_type, EventSubject::Request(request_id));
    event.set_terminating();
    bus.send(event);
    Ok(())
}

pub async fn get_request_status(
    store: &Arc<dyn EntityStore>,
    request_id: RequestId,
) -> Result<RequestStatusView> {
    let request = store.get_request(request_id).await?;
    let transforms = store
        .get_transforms_by_request(request_id)
        .await?
        .into_iter()
        .map(|t| TransformStatusView {
            transform_id: t.transform_id,
            name: t.name,
            status: t.status,
            substatus: t.substatus,
        })
        .collect();
    Ok(RequestStatusView {
        request_id: request.request_id,
        name: request.name,
        status: request.status,
        substatus: request.substatus,
        errors: request.errors,
        transforms,
    })
}
