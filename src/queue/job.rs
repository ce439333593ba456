//! Job queue collaborator traits.

use std::fmt;
use std::sync::Arc;

use crate::error::QueueError;

pub type JobId = u64;

/// A stored work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub work_type: String,
    /// Serialized message (JSON)
    pub payload: String,
    /// Number of deliveries so far, including the current one
    pub attempts: u32,
}

/// How a delivered job was resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Remove the job from the store.
    Complete,
    /// Put the job back at the head of its work type.
    Retry(String),
}

/// One-shot completion handed to the job handler.
///
/// The queue does not deliver the next job of the same work type until the
/// ack resolves. Dropping an unresolved ack completes the job.
pub struct JobAck {
    resolve: Option<Box<dyn FnOnce(JobOutcome) + Send>>,
}

impl JobAck {
    pub fn new<F>(resolve: F) -> Self
    where
        F: FnOnce(JobOutcome) + Send + 'static,
    {
        Self {
            resolve: Some(Box::new(resolve)),
        }
    }

    pub fn complete(mut self) {
        self.resolve_with(JobOutcome::Complete);
    }

    pub fn retry(mut self, reason: impl Into<String>) {
        self.resolve_with(JobOutcome::Retry(reason.into()));
    }

    fn resolve_with(&mut self, outcome: JobOutcome) {
        if let Some(resolve) = self.resolve.take() {
            resolve(outcome);
        }
    }
}

impl Drop for JobAck {
    fn drop(&mut self) {
        self.resolve_with(JobOutcome::Complete);
    }
}

impl fmt::Debug for JobAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAck")
            .field("resolved", &self.resolve.is_none())
            .finish()
    }
}

/// Handler invoked for each delivered job.
pub type JobHandler = Arc<dyn Fn(Job, JobAck) + Send + Sync>;

/// Trait for a durable, ordered work queue.
///
/// Implementations might include:
/// - `InMemoryJobQueue` - For testing and single-process scenarios
/// - A Redis-backed work queue for multi-process deployments
pub trait JobQueue: Send + Sync {
    /// Durably store a work item.
    fn enqueue(&self, work_type: &str, payload: String) -> Result<JobId, QueueError>;

    /// Register the single handler for a work type, replacing any previous one.
    ///
    /// Jobs of that work type are delivered one at a time.
    fn process(&self, work_type: &str, handler: JobHandler);
}
