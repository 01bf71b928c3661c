//! External execution back-ends.
//!
//! The back-end owns the actual computation; this side only submits, polls
//! and aborts. [`ScriptedBackend`] is the in-memory implementation used by
//! tests and the demo launcher.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CascadeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendJobState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
    Lost,
}

/// One observation of a submitted job: overall state plus per-output-file
/// verdicts. A file absent from `file_done` has no verdict yet.
#[derive(Debug, Clone)]
pub struct BackendJob {
    pub external_id: String,
    pub state: BackendJobState,
    pub file_done: HashMap<String, bool>,
}

#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub parameters: Value,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, submission: JobSubmission) -> Result<String>;
    async fn poll(&self, external_id: &str) -> Result<BackendJob>;
    async fn abort(&self, external_id: &str) -> Result<()>;
    async fn resume(&self, external_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct ScriptedJob {
    submission: JobSubmission,
    state: BackendJobState,
    file_done: HashMap<String, bool>,
    polls: u32,
}

/// In-memory back-end whose jobs either auto-advance
/// Pending -> Running -> Finished over successive polls, or sit still until
/// the test script drives them with [`finish_job`](Self::finish_job) /
/// [`fail_file`](Self::fail_file).
pub struct ScriptedBackend {
    jobs: DashMap<String, ScriptedJob>,
    auto_advance: bool,
}

impl ScriptedBackend {
    pub fn new(auto_advance: bool) -> Self {
        Self { jobs: DashMap::new(), auto_advance }
    }

    /// Mark the whole job finished with every output done.
    pub fn finish_job(&self, external_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(external_id) {
            job.state = BackendJobState::Finished;
            for output in job.submission.outputs.clone() {
                job.file_done.insert(output, true);
            }
        }
    }

    /// Record a per-file verdict without finishing the job.
    pub fn set_file_done(&self, external_id: &str, name: &str, done: bool) {
        if let Some(mut job) = self.jobs.get_mut(external_id) {
            job.file_done.insert(name.to_string(), done);
        }
    }

    /// Finish the job with `name` failed and everything else done.
    pub fn fail_file(&self, external_id: &str, name: &str) {
        if let Some(mut job) = self.jobs.get_mut(external_id) {
            job.state = BackendJobState::Finished;
            for output in job.submission.outputs.clone() {
                job.file_done.insert(output.clone(), output != name);
            }
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn submit(&self, submission: JobSubmission) -> Result<String> {
        let external_id = Uuid::new_v4().to_string();
        debug!(name = %submission.name, %external_id, "scripted submit");
        self.jobs.insert(
            external_id.clone(),
            ScriptedJob {
                submission,
                state: BackendJobState::Pending,
                file_done: HashMap::new(),
                polls: 0,
            },
        );
        Ok(external_id)
    }

    async fn poll(&self, external_id: &str) -> Result<BackendJob> {
        let mut job = self
            .jobs
            .get_mut(external_id)
            .ok_or_else(|| CascadeError::Backend(format!("unknown job {external_id}")))?;
        job.polls += 1;
        if self.auto_advance {
            match job.state {
                BackendJobState::Pending => job.state = BackendJobState::Running,
                BackendJobState::Running => {
                    job.state = BackendJobState::Finished;
                    for output in job.submission.outputs.clone() {
                        job.file_done.insert(output, true);
                    }
                }
                _ => {}
            }
        }
        Ok(BackendJob {
            external_id: external_id.to_string(),
            state: job.state,
            file_done: job.file_done.clone(),
        })
    }

    async fn abort(&self, external_id: &str) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(external_id)
            .ok_or_else(|| CascadeError::Backend(format!("unknown job {external_id}")))?;
        if !matches!(job.state, BackendJobState::Finished | BackendJobState::Failed) {
            job.state = BackendJobState::Cancelled;
        }
        Ok(())
    }

    async fn resume(&self, external_id: &str) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(external_id)
            .ok_or_else(|| CascadeError::Backend(format!("unknown job {external_id}")))?;
        if job.state == BackendJobState::Cancelled {
            job.state = BackendJobState::Running;
        }
        Ok(())
    }
}
