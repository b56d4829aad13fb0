use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;

use crate::client::DEFAULT_PREFIX;
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobId, State};
use crate::promoter::Promoter;
use crate::search::{NoopIndex, SearchIndex};
use crate::store::{RedisStore, Store};
use crate::worker::{Handler, Worker};
use crate::{Client, Result};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub redis_url: String,
    pub prefix: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// The queue facade: job factory, worker pool spawner, promoter control,
/// and aggregate queries.
pub struct Queue {
    client: Client,
    bus: Arc<EventBus>,
    search: Arc<dyn SearchIndex>,
    errors: broadcast::Sender<String>,
    salvaged: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    promoting: AtomicBool,
}

impl Queue {
    /// Connect to Redis.
    pub async fn connect(options: QueueOptions) -> Result<Arc<Queue>> {
        let store = RedisStore::connect(&options.redis_url).await?;
        Ok(Self::with_store(Arc::new(store), options.prefix))
    }

    /// Build a queue over any [`Store`] with the default (no-op) search
    /// indexer.
    pub fn with_store(store: Arc<dyn Store>, prefix: impl Into<String>) -> Arc<Queue> {
        Self::with_search(store, prefix, Arc::new(NoopIndex))
    }

    /// Build a queue over any [`Store`] with a custom search indexer.
    pub fn with_search(
        store: Arc<dyn Store>,
        prefix: impl Into<String>,
        search: Arc<dyn SearchIndex>,
    ) -> Arc<Queue> {
        let client = Client::new(store, prefix);
        let bus = Arc::new(EventBus::new(client.clone()));
        let (errors, _) = broadcast::channel(256);
        Arc::new(Queue {
            client,
            bus,
            search,
            errors,
            salvaged: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            promoting: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Construct a job of the given type. Nothing is persisted until
    /// [`Job::save`].
    pub fn create(&self, kind: impl Into<String>, data: Value) -> Job {
        Job::new(
            self.client.clone(),
            self.bus.clone(),
            self.search.clone(),
            kind,
            data,
        )
    }

    /// Load a job by id.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        Job::load(
            self.client.clone(),
            self.bus.clone(),
            self.search.clone(),
            id,
        )
        .await
    }

    /// Spawn `count` workers (at least one) on a job type. The first call
    /// per type also salvages jobs a dead worker left `active`.
    pub async fn process(
        self: &Arc<Self>,
        kind: &str,
        count: usize,
        handler: impl Handler,
    ) -> Result<()> {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let count = count.max(1);

        let first_for_kind = self.salvaged.lock().unwrap().insert(kind.to_string());
        if first_for_kind {
            let salvager = self.worker(kind, format!("{kind}-salvage"), handler.clone());
            let recovered = salvager.salvage().await?;
            if recovered > 0 {
                info!(kind, recovered, "salvaged jobs from a previous process");
            }
        }

        let mut tasks = self.tasks.lock().unwrap();
        for i in 0..count {
            let worker = self.worker(kind, format!("{kind}-{i}"), handler.clone());
            tasks.push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    fn worker(&self, kind: &str, name: String, handler: Arc<dyn Handler>) -> Worker {
        Worker::new(
            self.client.clone(),
            self.bus.clone(),
            self.search.clone(),
            kind,
            name,
            handler,
            self.errors.clone(),
        )
    }

    /// Start the delay promoter. Idempotent; later calls are ignored.
    pub fn promote(self: &Arc<Self>, every: Duration) {
        if self.promoting.swap(true, Ordering::SeqCst) {
            return;
        }
        let promoter = Promoter::new(
            self.client.clone(),
            self.bus.clone(),
            self.search.clone(),
            every,
        );
        self.tasks.lock().unwrap().push(tokio::spawn(promoter.run()));
    }

    /// Set of known job types.
    pub async fn types(&self) -> Result<Vec<String>> {
        self.client.store().smembers(&self.client.types_key()).await
    }

    /// Ids currently in one state, in priority order.
    pub async fn state(&self, state: State) -> Result<Vec<JobId>> {
        let members = self
            .client
            .store()
            .zrange(&self.client.state_key(state), 0, -1)
            .await?;
        Ok(members.iter().filter_map(|m| JobId::from_zid(m)).collect())
    }

    /// Number of jobs in one state.
    pub async fn card(&self, state: State) -> Result<u64> {
        self.client.store().zcard(&self.client.state_key(state)).await
    }

    pub async fn inactive_count(&self) -> Result<u64> {
        self.card(State::Inactive).await
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.card(State::Active).await
    }

    pub async fn complete_count(&self) -> Result<u64> {
        self.card(State::Complete).await
    }

    pub async fn failed_count(&self) -> Result<u64> {
        self.card(State::Failed).await
    }

    pub async fn delayed_count(&self) -> Result<u64> {
        self.card(State::Delayed).await
    }

    /// Cumulative worker time in milliseconds.
    pub async fn work_time(&self) -> Result<u64> {
        let raw = self.client.store().get(&self.client.work_time_key()).await?;
        Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
    }

    /// Read a named settings entry.
    pub async fn setting(&self, name: &str) -> Result<Option<String>> {
        self.client
            .store()
            .hget(&self.client.settings_key(), name)
            .await
    }

    /// Subscribe to every job event delivered to this process. The first
    /// call activates the event-bus channel subscription.
    pub async fn job_events(self: &Arc<Self>) -> Result<broadcast::Receiver<JobEvent>> {
        self.bus.subscribe().await?;
        Ok(self.bus.queue_events())
    }

    /// Worker and store errors, re-emitted on the queue.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Abort background tasks and clear this process's event mappings.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.bus.close().await;
        info!("queue shut down");
    }
}
