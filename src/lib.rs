//! stoker: a priority-aware persistent job queue over Redis
//!
//! Producers create and save jobs; workers on any number of hosts claim
//! them by priority, run a handler, and settle the outcome with retries;
//! a promoter returns delayed jobs to the runnable set when due; and a
//! cross-process event bus delivers per-job lifecycle events back to the
//! producer that saved the job.

pub mod backoff;
pub mod client;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod promoter;
pub mod queue;
pub mod search;
pub mod store;
pub mod worker;

pub use backoff::BackoffStrategy;
pub use client::Client;
pub use error::{Result, StokerError};
pub use events::{Event, EventBus, JobEvent};
pub use job::{Job, JobId, Priority, State};
pub use memory::MemoryStore;
pub use promoter::Promoter;
pub use queue::{Queue, QueueOptions};
pub use search::{NoopIndex, SearchIndex};
pub use store::{RedisStore, Store};
pub use worker::{Handler, Worker};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
