//! Durable ingestion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Queue (adapter)                              │
//! │  send(message) / on_message / on_error       │
//! │  decodes jobs, dispatches, acks per policy   │
//! └──────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │ JobQueue trait                               │
//! │  enqueue(work_type, payload)                 │
//! │  process(work_type, handler(job, ack))       │
//! └──────────────────────────────────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌──────────────────┐   ┌───────────────────────┐
//! │ InMemoryJobQueue │   │ Redis-backed queue    │
//! │ (included)       │   │ (external)            │
//! └──────────────────┘   └───────────────────────┘
//! ```

mod in_memory;
mod job;
mod queue;

pub use in_memory::InMemoryJobQueue;
pub use job::{Job, JobAck, JobHandler, JobId, JobOutcome, JobQueue};
pub use queue::{MessageObserver, Queue};
