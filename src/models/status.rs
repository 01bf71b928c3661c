use serde::{Deserialize, Serialize};

/// Status of a top-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    New,
    Ready,
    Transforming,
    Finished,
    SubFinished,
    Failed,
    Extend,
    ToCancel,
    Cancelling,
    Cancelled,
    ToSuspend,
    Suspending,
    Suspended,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    Expired,
    Throttling,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Finished
                | RequestStatus::SubFinished
                | RequestStatus::Failed
                | RequestStatus::Cancelled
                | RequestStatus::Suspended
                | RequestStatus::Expired
        )
    }

    /// Operator command states picked up by the update-polling path.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            RequestStatus::ToCancel
                | RequestStatus::ToSuspend
                | RequestStatus::ToResume
                | RequestStatus::ToExpire
        )
    }
}

/// Status of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformStatus {
    New,
    Ready,
    Transforming,
    Finished,
    SubFinished,
    Failed,
    ToCancel,
    Cancelling,
    Cancelled,
    ToSuspend,
    Suspending,
    Suspended,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    Expired,
}

impl TransformStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransformStatus::Finished
                | TransformStatus::SubFinished
                | TransformStatus::Failed
                | TransformStatus::Cancelled
                | TransformStatus::Suspended
                | TransformStatus::Expired
        )
    }
}

/// Status of one submission to an external execution back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Finished,
    SubFinished,
    Failed,
    Lost,
    ToCancel,
    Cancelling,
    Cancelled,
    ToSuspend,
    Suspending,
    Suspended,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    Expired,
    ToFinish,
    ToForceFinish,
    Timeout,
    Broken,
    Terminating,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Finished
                | ProcessingStatus::SubFinished
                | ProcessingStatus::Failed
                | ProcessingStatus::Lost
                | ProcessingStatus::Cancelled
                | ProcessingStatus::Suspended
                | ProcessingStatus::Expired
                | ProcessingStatus::Broken
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ProcessingStatus::Finished)
    }

    /// Statuses the poller keeps watching.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Submitting
                | ProcessingStatus::Submitted
                | ProcessingStatus::Running
                | ProcessingStatus::Terminating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionStatus {
    New,
    Updated,
    Processing,
    Open,
    Closed,
    SubClosed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionRelationType {
    Input,
    Output,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentStatus {
    New,
    Activated,
    Processing,
    Available,
    Failed,
    FinalFailed,
    Lost,
    Deleted,
    Missing,
    Cancelled,
}

impl ContentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContentStatus::Available
                | ContentStatus::Failed
                | ContentStatus::FinalFailed
                | ContentStatus::Lost
                | ContentStatus::Deleted
                | ContentStatus::Missing
                | ContentStatus::Cancelled
        )
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ContentStatus::Available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentRelationType {
    Input,
    Output,
    Log,
    InputDependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GranularityType {
    File,
    Event,
}

/// Row-level claim flag. A `Locking` row is owned by exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    Idle,
    Locking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    File,
    Collection,
    Work,
    HealthHeartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    New,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    Clerk,
    Transformer,
    Carrier,
    Conductor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ProcessingStatus::Finished.is_terminal());
        assert!(ProcessingStatus::Broken.is_terminal());
        assert!(!ProcessingStatus::Running.is_terminal());
        assert!(!ProcessingStatus::ToCancel.is_terminal());

        assert!(ContentStatus::Missing.is_terminal());
        assert!(!ContentStatus::Processing.is_terminal());

        assert!(RequestStatus::ToCancel.is_command());
        assert!(!RequestStatus::Transforming.is_command());
    }
}
