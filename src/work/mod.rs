//! The pluggable unit of computation.
//!
//! A `Work` describes how one step of a request turns input contents into
//! output contents on an external back-end. Records only store the
//! [`WorkType`] tag plus a serialized [`WorkSpec`]; live behavior is rebuilt
//! through the global registry, so every record stays plain serializable
//! data.

pub mod backend;
pub mod generic;

pub use backend::{BackendJob, BackendJobState, ExecutionBackend, JobSubmission, ScriptedBackend};
pub use generic::GenericWork;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dyn_clone::DynClone;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CascadeError, Result};
use crate::models::{Content, ContentStatus, ContentUpdate, MapId, Processing, ProcessingStatus};

/// Closed set of work implementations. New kinds are added here, not
/// discovered dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkType {
    Generic,
    BatchGrid,
    StageIn,
    HyperParameterOpt,
    Actuator,
}

/// One named input or output collection of a work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub scope: String,
    pub name: String,
}

/// Serializable description of one work inside a request's workflow. The
/// `name` is unique within the request and `depends_on` names other works
/// whose outputs feed this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub work_type: WorkType,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub input: CollectionDef,
    pub output: CollectionDef,
    #[serde(default)]
    pub log: Option<CollectionDef>,
    #[serde(default)]
    pub parameters: Value,
}

/// A candidate input file offered to a work when it maps new contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    pub scope: String,
    pub name: String,
    /// Set when the candidate is an upstream Output content this work must
    /// wait on rather than a primary input.
    pub is_dependency: bool,
}

/// One unit of work: the inputs it consumes and the outputs it produces,
/// grouped under a single map id.
#[derive(Debug, Clone)]
pub struct ContentMap {
    pub map_id: MapId,
    pub inputs: Vec<(String, String)>,
    /// scope:name pairs of upstream Output contents this map waits on.
    pub input_dependencies: Vec<(String, String)>,
    pub outputs: Vec<(String, String)>,
}

/// Outcome of one poll of the external back-end.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub status: ProcessingStatus,
    pub content_updates: Vec<ContentUpdate>,
}

/// Coarse progress of a work, derived purely from its Output contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    New,
    Transforming,
    SubFinished,
    Finished,
    Failed,
}

#[async_trait]
pub trait Work: DynClone + Send + Sync {
    fn work_type(&self) -> WorkType;

    /// Map not-yet-mapped input candidates to fresh content groups. Called
    /// on every transform poll; must ignore candidates already covered by
    /// `existing`.
    fn new_input_output_maps(
        &self,
        spec: &WorkSpec,
        candidates: &[InputSource],
        existing: &[Content],
        next_map_id: MapId,
    ) -> Result<Vec<ContentMap>>;

    /// Hand the mapped inputs to the external back-end. Idempotent: an
    /// already-submitted processing returns its recorded external id.
    async fn submit_processing(
        &self,
        processing: &Processing,
        contents: &[Content],
    ) -> Result<String>;

    /// One observation of the back-end, translated into a processing status
    /// plus per-content substatus updates.
    async fn poll_processing(
        &self,
        processing: &Processing,
        contents: &[Content],
    ) -> Result<PollOutcome>;

    async fn abort_processing(&self, processing: &Processing) -> Result<()>;

    async fn resume_processing(&self, processing: &Processing) -> Result<()>;

    /// Aggregate work progress from the Output contents. Pure and
    /// deterministic; re-running it on the same rows gives the same answer.
    fn syn_work_status(&self, contents: &[Content]) -> WorkStatus {
        aggregate_output_status(contents)
    }
}

dyn_clone::clone_trait_object!(Work);

/// Default aggregation over Output rows: every row terminal and available
/// means Finished, terminal with nothing available means Failed, a terminal
/// mix means SubFinished, anything still moving means Transforming.
pub fn aggregate_output_status(contents: &[Content]) -> WorkStatus {
    let outputs: Vec<&Content> = contents
        .iter()
        .filter(|c| c.content_relation_type == crate::models::ContentRelationType::Output)
        .collect();
    if outputs.is_empty() {
        return WorkStatus::New;
    }
    let all_terminal = outputs.iter().all(|c| c.status.is_terminal());
    if !all_terminal {
        return WorkStatus::Transforming;
    }
    let available = outputs.iter().filter(|c| c.status.is_available()).count();
    if available == outputs.len() {
        WorkStatus::Finished
    } else if available == 0 {
        WorkStatus::Failed
    } else {
        WorkStatus::SubFinished
    }
}

/// Map a back-end job state to the processing status it implies.
pub fn processing_status_for(state: BackendJobState) -> ProcessingStatus {
    match state {
        BackendJobState::Pending => ProcessingStatus::Submitted,
        BackendJobState::Running => ProcessingStatus::Running,
        BackendJobState::Finished => ProcessingStatus::Finished,
        BackendJobState::Failed => ProcessingStatus::Failed,
        BackendJobState::Cancelled => ProcessingStatus::Cancelled,
        BackendJobState::Lost => ProcessingStatus::Lost,
    }
}

/// Map a per-file back-end verdict to a content substatus.
pub fn content_status_for(done: bool) -> ContentStatus {
    if done {
        ContentStatus::Available
    } else {
        ContentStatus::Failed
    }
}

pub type WorkFactory = dyn Fn(&WorkSpec) -> Result<Box<dyn Work>> + Send + Sync;

#[derive(Default)]
pub struct WorkRegistry {
    factories: RwLock<HashMap<WorkType, Arc<WorkFactory>>>,
}

impl WorkRegistry {
    pub fn register<F>(&self, work_type: WorkType, factory: F)
    where
        F: Fn(&WorkSpec) -> Result<Box<dyn Work>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(work_type, Arc::new(factory));
    }

    /// Rebuild the live work behind a serialized spec.
    pub fn resolve(&self, spec: &WorkSpec) -> Result<Box<dyn Work>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let factory = factories
            .get(&spec.work_type)
            .cloned()
            .ok_or_else(|| CascadeError::WorkTypeNotRegistered(format!("{:?}", spec.work_type)))?;
        drop(factories);
        factory(spec)
    }
}

lazy_static! {
    pub static ref GLOBAL_WORK_REGISTRY: WorkRegistry = WorkRegistry::default();
}

/// Register [`GenericWork`] driven by `backend` as the handler for
/// [`WorkType::Generic`]. Called once at startup (or per test).
pub fn register_generic_work(backend: Arc<dyn ExecutionBackend>) {
    GLOBAL_WORK_REGISTRY.register(WorkType::Generic, move |spec| {
        Ok(Box::new(GenericWork::new(spec.clone(), backend.clone())) as Box<dyn Work>)
    });
}

pub fn resolve_work(spec: &WorkSpec) -> Result<Box<dyn Work>> {
    GLOBAL_WORK_REGISTRY.resolve(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentRelationType;

    fn output(id: u64, status: ContentStatus) -> Content {
        let mut content = Content::new(1, 1, 1, id, "scope", format!("f{id}"), ContentRelationType::Output);
        content.content_id = id;
        content.status = status;
        content.substatus = status;
        content
    }

    #[test]
    fn aggregation_all_available_is_finished() {
        let rows = vec![output(1, ContentStatus::Available), output(2, ContentStatus::Available)];
        assert_eq!(aggregate_output_status(&rows), WorkStatus::Finished);
    }

    #[test]
    fn aggregation_none_available_is_failed() {
        let rows = vec![output(1, ContentStatus::Failed), output(2, ContentStatus::FinalFailed)];
        assert_eq!(aggregate_output_status(&rows), WorkStatus::Failed);
    }

    #[test]
    fn aggregation_terminal_mix_is_subfinished() {
        let rows = vec![output(1, ContentStatus::Available), output(2, ContentStatus::Failed)];
        assert_eq!(aggregate_output_status(&rows), WorkStatus::SubFinished);
    }

    #[test]
    fn aggregation_open_rows_is_transforming() {
        let rows = vec![output(1, ContentStatus::Available), output(2, ContentStatus::Processing)];
        assert_eq!(aggregate_output_status(&rows), WorkStatus::Transforming);
    }

    #[test]
    fn aggregation_ignores_non_output_rows() {
        let mut input = output(1, ContentStatus::Processing);
        input.content_relation_type = ContentRelationType::Input;
        let rows = vec![input, output(2, ContentStatus::Available)];
        assert_eq!(aggregate_output_status(&rows), WorkStatus::Finished);
    }

    #[test]
    fn unregistered_work_type_is_an_error() {
        let registry = WorkRegistry::default();
        let spec = WorkSpec {
            work_type: WorkType::BatchGrid,
            name: "w".into(),
            depends_on: vec![],
            input: CollectionDef { scope: "s".into(), name: "in".into() },
            output: CollectionDef { scope: "s".into(), name: "out".into() },
            log: None,
            parameters: Value::Null,
        };
        assert!(matches!(
            registry.resolve(&spec),
            Err(CascadeError::WorkTypeNotRegistered(_))
        ));
    }
}
