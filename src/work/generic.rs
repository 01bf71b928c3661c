//! File-in, file-out work driven by an [`ExecutionBackend`].
//!
//! Each input file maps to one output file (input name plus the
//! `output_suffix` parameter). The back-end reports per-file verdicts that
//! translate directly into content substatus updates.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{
    Content, ContentRelationType, ContentStatus, ContentUpdate, MapId, Processing,
};
use crate::work::{
    content_status_for, processing_status_for, BackendJobState, ContentMap, ExecutionBackend,
    InputSource, JobSubmission, PollOutcome, Work, WorkSpec, WorkType,
};

pub struct GenericWork {
    spec: WorkSpec,
    backend: Arc<dyn ExecutionBackend>,
}

impl Clone for GenericWork {
    fn clone(&self) -> Self {
        Self { spec: self.spec.clone(), backend: self.backend.clone() }
    }
}

impl GenericWork {
    pub fn new(spec: WorkSpec, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { spec, backend }
    }

    fn output_suffix(&self) -> String {
        self.spec
            .parameters
            .get("output_suffix")
            .and_then(Value::as_str)
            .unwrap_or(".out")
            .to_string()
    }

    fn output_name(&self, input_name: &str) -> String {
        format!("{input_name}{}", self.output_suffix())
    }
}

#[async_trait]
impl Work for GenericWork {
    fn work_type(&self) -> WorkType {
        WorkType::Generic
    }

    fn new_input_output_maps(
        &self,
        spec: &WorkSpec,
        candidates: &[InputSource],
        existing: &[Content],
        next_map_id: MapId,
    ) -> Result<Vec<ContentMap>> {
        let mut maps = Vec::new();
        let mut map_id = next_map_id;
        for candidate in candidates {
            let seen = existing.iter().any(|c| {
                matches!(
                    c.content_relation_type,
                    ContentRelationType::Input | ContentRelationType::InputDependency
                ) && c.scope == candidate.scope
                    && c.name == candidate.name
            });
            if seen {
                continue;
            }
            let input = (candidate.scope.clone(), candidate.name.clone());
            let output = (spec.output.scope.clone(), self.output_name(&candidate.name));
            maps.push(ContentMap {
                map_id,
                inputs: vec![input.clone()],
                input_dependencies: if candidate.is_dependency { vec![input] } else { vec![] },
                outputs: vec![output],
            });
            map_id += 1;
        }
        Ok(maps)
    }

    async fn submit_processing(
        &self,
        processing: &Processing,
        contents: &[Content],
    ) -> Result<String> {
        if let Some(external_id) = &processing.external_id {
            debug!(processing_id = processing.processing_id, %external_id, "already submitted");
            return Ok(external_id.clone());
        }
        let inputs = contents
            .iter()
            .filter(|c| c.content_relation_type == ContentRelationType::Input)
            .map(|c| c.name.clone())
            .collect();
        let outputs = contents
            .iter()
            .filter(|c| c.content_relation_type == ContentRelationType::Output)
            .map(|c| c.name.clone())
            .collect();
        let external_id = self
            .backend
            .submit(JobSubmission {
                name: format!("{}-{}", self.spec.name, processing.processing_id),
                inputs,
                outputs,
                parameters: self.spec.parameters.clone(),
            })
            .await?;
        Ok(external_id)
    }

    async fn poll_processing(
        &self,
        processing: &Processing,
        contents: &[Content],
    ) -> Result<PollOutcome> {
        let Some(external_id) = &processing.external_id else {
            // Nothing submitted yet; nothing to observe.
            return Ok(PollOutcome { status: processing.status, content_updates: vec![] });
        };
        let job = self.backend.poll(external_id).await?;
        let status = processing_status_for(job.state);

        let mut content_updates = Vec::new();
        for content in contents {
            if content.content_relation_type != ContentRelationType::Output {
                continue;
            }
            let substatus = match job.file_done.get(&content.name) {
                Some(done) => content_status_for(*done),
                // A finished job that never reported the file lost it.
                None if job.state == BackendJobState::Finished => ContentStatus::Missing,
                None => continue,
            };
            if substatus == content.substatus {
                continue;
            }
            content_updates.push(ContentUpdate {
                content_id: content.content_id,
                status: Some(substatus),
                substatus: Some(substatus),
                path: None,
            });
        }
        Ok(PollOutcome { status, content_updates })
    }

    async fn abort_processing(&self, processing: &Processing) -> Result<()> {
        if let Some(external_id) = &processing.external_id {
            if let Err(err) = self.backend.abort(external_id).await {
                // Local state still advances; the next poll reconciles.
                warn!(processing_id = processing.processing_id, error = %err, "backend abort failed");
            }
        }
        Ok(())
    }

    async fn resume_processing(&self, processing: &Processing) -> Result<()> {
        if let Some(external_id) = &processing.external_id {
            if let Err(err) = self.backend.resume(external_id).await {
                warn!(processing_id = processing.processing_id, error = %err, "backend resume failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{CollectionDef, ScriptedBackend};
    use serde_json::json;

    fn spec() -> WorkSpec {
        WorkSpec {
            work_type: WorkType::Generic,
            name: "derive".into(),
            depends_on: vec![],
            input: CollectionDef { scope: "data".into(), name: "in".into() },
            output: CollectionDef { scope: "data".into(), name: "out".into() },
            log: None,
            parameters: json!({"output_suffix": ".derived"}),
        }
    }

    fn work(backend: Arc<ScriptedBackend>) -> GenericWork {
        GenericWork::new(spec(), backend)
    }

    fn candidate(name: &str) -> InputSource {
        InputSource { scope: "data".into(), name: name.into(), is_dependency: false }
    }

    #[test]
    fn maps_each_new_candidate_once() {
        let w = work(Arc::new(ScriptedBackend::new(false)));
        let maps = w.new_input_output_maps(&spec(), &[candidate("f1"), candidate("f2")], &[], 1).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].map_id, 1);
        assert_eq!(maps[1].map_id, 2);
        assert_eq!(maps[0].outputs[0].1, "f1.derived");

        // Already-mapped candidates are skipped on the next poll.
        let existing = vec![Content::new(1, 1, 1, 1, "data", "f1", ContentRelationType::Input)];
        let maps = w.new_input_output_maps(&spec(), &[candidate("f1"), candidate("f3")], &existing, 3).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].inputs[0].1, "f3");
    }

    #[test]
    fn dependency_candidates_carry_a_dependency_edge() {
        let w = work(Arc::new(ScriptedBackend::new(false)));
        let dep = InputSource { scope: "data".into(), name: "up.out".into(), is_dependency: true };
        let maps = w.new_input_output_maps(&spec(), &[dep], &[], 1).unwrap();
        assert_eq!(maps[0].input_dependencies, vec![("data".to_string(), "up.out".to_string())]);
    }

    #[tokio::test]
    async fn submit_is_idempotent() {
        let backend = Arc::new(ScriptedBackend::new(false));
        let w = work(backend.clone());
        let mut processing = Processing::new(1, 1, json!({}));
        processing.processing_id = 1;

        let first = w.submit_processing(&processing, &[]).await.unwrap();
        assert_eq!(backend.job_count(), 1);

        processing.external_id = Some(first.clone());
        let second = w.submit_processing(&processing, &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.job_count(), 1);
    }

    #[tokio::test]
    async fn poll_translates_file_verdicts() {
        let backend = Arc::new(ScriptedBackend::new(false));
        let w = work(backend.clone());
        let mut processing = Processing::new(1, 1, json!({}));
        processing.processing_id = 1;

        let mut out_a = Content::new(1, 1, 1, 1, "data", "f1.derived", ContentRelationType::Output);
        out_a.content_id = 10;
        let mut out_b = Content::new(1, 1, 1, 2, "data", "f2.derived", ContentRelationType::Output);
        out_b.content_id = 11;
        let mut missing = Content::new(1, 1, 1, 3, "data", "f3.derived", ContentRelationType::Output);
        missing.content_id = 12;
        // f3 is tracked locally but never declared to the back-end.
        let submitted = vec![out_a.clone(), out_b.clone()];
        let all = vec![out_a, out_b, missing];

        let external_id = w.submit_processing(&processing, &submitted).await.unwrap();
        processing.external_id = Some(external_id.clone());
        backend.fail_file(&external_id, "f2.derived");

        let outcome = w.poll_processing(&processing, &all).await.unwrap();
        assert_eq!(outcome.status, crate::models::ProcessingStatus::Finished);
        let by_id: std::collections::HashMap<_, _> =
            outcome.content_updates.iter().map(|u| (u.content_id, u.substatus)).collect();
        assert_eq!(by_id[&10], Some(ContentStatus::Available));
        assert_eq!(by_id[&11], Some(ContentStatus::Failed));
        assert_eq!(by_id[&12], Some(ContentStatus::Missing));
    }

    #[tokio::test]
    async fn unsubmitted_poll_is_a_no_op() {
        let w = work(Arc::new(ScriptedBackend::new(false)));
        let processing = Processing::new(1, 1, json!({}));
        let outcome = w.poll_processing(&processing, &[]).await.unwrap();
        assert!(outcome.content_updates.is_empty());
        assert_eq!(outcome.status, processing.status);
    }
}
