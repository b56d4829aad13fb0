//! Store client facade: one connection factory plus the key-prefixing
//! convention every component goes through.

use std::sync::Arc;

use crate::job::State;
use crate::store::{RedisStore, Store};
use crate::{JobId, Result};

pub const DEFAULT_PREFIX: &str = "q";

/// Shared handle on the store plus the key namespace.
///
/// Cloning is cheap; every component (jobs, workers, the promoter, the event
/// bus) carries its own clone.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
    prefix: String,
}

impl Client {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Open a Redis-backed client.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let store = RedisStore::connect(url).await?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Id allocator counter.
    pub fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    /// Set of known job types.
    pub fn types_key(&self) -> String {
        format!("{}:job:types", self.prefix)
    }

    /// Record fields for one job.
    pub fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Append-only log entries for one job.
    pub fn log_key(&self, id: JobId) -> String {
        format!("{}:job:{}:log", self.prefix, id)
    }

    /// Global index of all job ids by priority.
    pub fn all_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    /// Per-state index.
    pub fn state_key(&self, state: State) -> String {
        format!("{}:jobs:{}", self.prefix, state.as_str())
    }

    /// Per-(type, state) index.
    pub fn kind_state_key(&self, kind: &str, state: State) -> String {
        format!("{}:jobs:{}:{}", self.prefix, kind, state.as_str())
    }

    /// Per-type notification list; one sentinel per job entering `inactive`.
    pub fn notify_key(&self, kind: &str) -> String {
        format!("{}:{}:jobs", self.prefix, kind)
    }

    /// Cumulative worker time in milliseconds.
    pub fn work_time_key(&self) -> String {
        format!("{}:stats:work-time", self.prefix)
    }

    /// Free-form settings hash.
    pub fn settings_key(&self) -> String {
        format!("{}:settings", self.prefix)
    }

    /// Event-bus owner map: job id -> owning process id.
    pub fn events_key(&self) -> String {
        format!("{}:events", self.prefix)
    }

    /// Per-process event channel.
    pub fn channel_key(&self, process_id: &str) -> String {
        format!("{}:events:{}", self.prefix, process_id)
    }
}
