//! In-memory job queue for testing and single-process scenarios.
//!
//! This module provides a thread-safe in-memory queue that implements
//! `JobQueue`, useful for:
//! - Unit and integration testing without a queue service
//! - Single-process applications
//! - Development and prototyping

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{Job, JobAck, JobHandler, JobId, JobOutcome, JobQueue};
use crate::error::QueueError;

/// In-memory job queue.
///
/// Features:
/// - Thread-safe (clones share the same store)
/// - Sequential delivery per work type: the next job waits for the current ack
/// - Retried jobs go back to the head; after `max_attempts` they move to `failed()`
/// - Can start paused, so tests can inspect what was enqueued before processing
/// - Keeps the full history behind `jobs()`, `completed_ids()` and `failed()`;
///   it only grows until `clear()` drops it, so long-running use should clear
///   periodically
///
/// ## Example
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use bus_exchange::queue::{InMemoryJobQueue, Job, JobAck, JobQueue};
///
/// let queue = InMemoryJobQueue::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
///
/// queue.process("message", Arc::new(move |job: Job, ack: JobAck| {
///     sink.lock().unwrap().push(job.payload);
///     ack.complete();
/// }));
/// queue.enqueue("message", r#"{"id":"1"}"#.to_string()).unwrap();
///
/// assert_eq!(seen.lock().unwrap().len(), 1);
/// assert_eq!(queue.completed_ids(), vec![1]);
/// ```
#[derive(Clone)]
pub struct InMemoryJobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    max_attempts: u32,
}

#[derive(Default)]
struct State {
    next_id: JobId,
    paused: bool,
    /// Every job ever enqueued, in order
    log: Vec<Job>,
    lanes: HashMap<String, Lane>,
    completed: Vec<JobId>,
    failed: Vec<(Job, String)>,
    fail_next_enqueue: Option<QueueError>,
}

#[derive(Default)]
struct Lane {
    handler: Option<JobHandler>,
    pending: VecDeque<Job>,
    in_flight: Option<JobId>,
    pumping: bool,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(3)
    }

    /// Create a queue that stores jobs but delivers nothing until `resume()`.
    pub fn paused() -> Self {
        let queue = Self::new();
        queue.pause();
        queue
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 1,
                    ..State::default()
                }),
                max_attempts: max_attempts.max(1),
            }),
        }
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Resume delivery and drain every work type.
    pub fn resume(&self) {
        let work_types: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.paused = false;
            state.lanes.keys().cloned().collect()
        };
        for work_type in work_types {
            self.inner.pump(&work_type);
        }
    }

    /// Make the next `enqueue` fail with the given error.
    pub fn fail_next_enqueue(&self, err: QueueError) {
        self.inner.state.lock().fail_next_enqueue = Some(err);
    }

    /// Get all jobs ever enqueued.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().log.clone()
    }

    /// Get the payloads of all jobs ever enqueued.
    pub fn payloads(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .log
            .iter()
            .map(|job| job.payload.clone())
            .collect()
    }

    /// Get the total number of jobs ever enqueued.
    pub fn len(&self) -> usize {
        self.inner.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().log.is_empty()
    }

    /// Jobs of a work type waiting for delivery.
    pub fn pending_len(&self, work_type: &str) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .get(work_type)
            .map_or(0, |lane| lane.pending.len())
    }

    /// Get ids of completed (removed) jobs in completion order.
    pub fn completed_ids(&self) -> Vec<JobId> {
        self.inner.state.lock().completed.clone()
    }

    /// Get jobs that ran out of attempts, with the last retry reason.
    pub fn failed(&self) -> Vec<(Job, String)> {
        self.inner.state.lock().failed.clone()
    }

    /// Drop the recorded history and every undelivered job. Handlers stay
    /// registered and job ids keep counting up.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.log.clear();
        state.completed.clear();
        state.failed.clear();
        for lane in state.lanes.values_mut() {
            lane.pending.clear();
        }
    }
}

impl Inner {
    fn pump(self: &Arc<Self>, work_type: &str) {
        {
            let mut state = self.state.lock();
            let lane = state.lanes.entry(work_type.to_string()).or_default();
            if lane.pumping {
                // The active loop further up the stack picks up the new work.
                return;
            }
            lane.pumping = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                let paused = state.paused;
                let lane = state.lanes.entry(work_type.to_string()).or_default();
                let ready = !paused && lane.in_flight.is_none() && lane.handler.is_some();
                match (ready, lane.pending.pop_front()) {
                    (true, Some(mut job)) => {
                        job.attempts += 1;
                        lane.in_flight = Some(job.id);
                        lane.handler.clone().map(|handler| (job, handler))
                    }
                    (_, job) => {
                        if let Some(job) = job {
                            lane.pending.push_front(job);
                        }
                        lane.pumping = false;
                        None
                    }
                }
            };

            let Some((job, handler)) = next else {
                return;
            };

            debug!(job_id = job.id, work_type, attempts = job.attempts, "delivering job");
            let inner = Arc::clone(self);
            let delivered = job.clone();
            let ack = JobAck::new(move |outcome| inner.resolve(delivered, outcome));
            handler(job, ack);
        }
    }

    fn resolve(self: &Arc<Self>, job: Job, outcome: JobOutcome) {
        let work_type = job.work_type.clone();
        {
            let mut state = self.state.lock();
            if let Some(lane) = state.lanes.get_mut(&work_type) {
                lane.in_flight = None;
            }
            match outcome {
                JobOutcome::Complete => {
                    debug!(job_id = job.id, "job complete");
                    state.completed.push(job.id);
                }
                JobOutcome::Retry(reason) if job.attempts >= self.max_attempts => {
                    debug!(job_id = job.id, %reason, "job out of attempts");
                    state.failed.push((job, reason));
                }
                JobOutcome::Retry(reason) => {
                    debug!(job_id = job.id, %reason, "job returned for retry");
                    state
                        .lanes
                        .entry(work_type.clone())
                        .or_default()
                        .pending
                        .push_front(job);
                }
            }
        }
        self.pump(&work_type);
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, work_type: &str, payload: String) -> Result<JobId, QueueError> {
        let id = {
            let mut state = self.inner.state.lock();
            if let Some(err) = state.fail_next_enqueue.take() {
                return Err(err);
            }
            let id = state.next_id;
            state.next_id += 1;
            let job = Job {
                id,
                work_type: work_type.to_string(),
                payload,
                attempts: 0,
            };
            state.log.push(job.clone());
            state
                .lanes
                .entry(work_type.to_string())
                .or_default()
                .pending
                .push_back(job);
            id
        };
        self.inner.pump(work_type);
        Ok(id)
    }

    fn process(&self, work_type: &str, handler: JobHandler) {
        self.inner
            .state
            .lock()
            .lanes
            .entry(work_type.to_string())
            .or_default()
            .handler = Some(handler);
        self.inner.pump(work_type);
    }
}
