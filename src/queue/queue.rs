//! Queue adapter: serializes messages into jobs and dispatches jobs back out
//! as messages.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::debug;

use super::{Job, JobAck, JobQueue};
use crate::config::{AckPolicy, QueueConfig};
use crate::error::{panic_message, CodecError, ExchangeError, HandlerError};
use crate::observers::{ErrorListener, ListenerId, Observers};
use crate::Message;

/// Callback receiving each ingested message.
///
/// Returning an error marks the job as failed for the ack policy. Observers
/// report their own failures; the queue only reports panics.
pub type MessageObserver = dyn Fn(Message) -> Result<(), ExchangeError> + Send + Sync;

/// Adapter between the exchange and a [`JobQueue`].
///
/// Cloning yields another handle to the same adapter.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    jobs: Arc<dyn JobQueue>,
    config: QueueConfig,
    observers: Observers<MessageObserver>,
    errors: Observers<ErrorListener>,
}

impl Queue {
    pub fn new(jobs: impl JobQueue + 'static) -> Self {
        Self::with_config(jobs, QueueConfig::default())
    }

    /// Create the adapter and register it as the handler for `config.work_type`.
    pub fn with_config(jobs: impl JobQueue + 'static, config: QueueConfig) -> Self {
        let inner = Arc::new(QueueInner {
            jobs: Arc::new(jobs),
            config,
            observers: Observers::new(),
            errors: Observers::new(),
        });

        let weak: Weak<QueueInner> = Arc::downgrade(&inner);
        inner.jobs.process(
            &inner.config.work_type,
            Arc::new(move |job: Job, ack: JobAck| match weak.upgrade() {
                Some(inner) => inner.on_job(job, ack),
                None => ack.retry("queue adapter dropped"),
            }),
        );

        debug!(work_type = %inner.config.work_type, "new queue");
        Self { inner }
    }

    /// Serialize a message and hand it to the job queue.
    ///
    /// Failures are reported as error notifications.
    pub fn send(&self, message: &Message) -> &Self {
        debug!(message_id = %message.id, "send message to queue");
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                self.inner
                    .errors
                    .raise("queue", ExchangeError::Codec(CodecError::from(e)));
                return self;
            }
        };
        if let Err(e) = self.inner.jobs.enqueue(&self.inner.config.work_type, payload) {
            self.inner.errors.raise("queue", ExchangeError::Queue(e));
        }
        self
    }

    pub fn on_message<F>(&self, observer: F) -> ListenerId
    where
        F: Fn(Message) -> Result<(), ExchangeError> + Send + Sync + 'static,
    {
        self.inner.observers.add(Arc::new(observer))
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.observers.remove(id)
    }

    pub fn message_listener_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExchangeError) + Send + Sync + 'static,
    {
        self.inner.errors.add(Arc::new(listener))
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.errors.remove(id)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same adapter.
    pub fn same_as(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl QueueInner {
    fn on_job(&self, job: Job, ack: JobAck) {
        let message: Message = match serde_json::from_str(&job.payload) {
            Ok(message) => message,
            Err(e) => {
                // Malformed jobs can never succeed; drop them.
                self.errors
                    .raise("queue", ExchangeError::Codec(CodecError::from(e)));
                ack.complete();
                return;
            }
        };

        debug!(job_id = job.id, message_id = %message.id, "on message");
        let observers = self.observers.snapshot();
        if observers.is_empty() {
            debug!(message_id = %message.id, "no message listeners");
        }

        let mut failed = false;
        for observer in observers {
            let delivered = message.clone();
            match catch_unwind(AssertUnwindSafe(|| observer(delivered))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(message_id = %message.id, error = %err, "message listener failed");
                    failed = true;
                }
                Err(panic) => {
                    failed = true;
                    self.errors.raise(
                        "queue",
                        ExchangeError::Handler {
                            action: message.action.clone(),
                            source: HandlerError::Panicked(panic_message(panic)),
                        },
                    );
                }
            }
        }

        match (failed, self.config.ack) {
            (true, AckPolicy::OnSuccess) => ack.retry(format!("dispatch of {} failed", message.id)),
            _ => ack.complete(),
        }
    }
}
