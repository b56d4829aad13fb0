use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backoff::BackoffStrategy;
use crate::events::{Event, EventBus, JobEvent};
use crate::search::SearchIndex;
use crate::{Client, Result, StokerError};

/// Unique identifier for a job, allocated monotonically by the store's
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Zero-padded form used as the member in every ordered index. Equal
    /// scores then tie-break lexicographically, which for this encoding is
    /// numeric id order.
    pub fn zid(self) -> String {
        format!("{:012}", self.0)
    }

    pub(crate) fn from_zid(s: &str) -> Option<JobId> {
        s.parse().ok().map(JobId)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority score: lower wins. Any signed value is accepted; the named
/// levels are conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i64);

impl Priority {
    pub const CRITICAL: Priority = Priority(-15);
    pub const HIGH: Priority = Priority(-10);
    pub const MEDIUM: Priority = Priority(-5);
    pub const NORMAL: Priority = Priority(0);
    pub const LOW: Priority = Priority(10);

    pub fn value(self) -> i64 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Priority(value)
    }
}

impl FromStr for Priority {
    type Err = std::num::ParseIntError;

    /// Named levels resolve via the fixed map; anything else is parsed as a
    /// raw numeric score.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::CRITICAL),
            "high" => Ok(Priority::HIGH),
            "medium" => Ok(Priority::MEDIUM),
            "normal" => Ok(Priority::NORMAL),
            "low" => Ok(Priority::LOW),
            other => other.parse().map(Priority),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Inactive,
    Active,
    Complete,
    Failed,
    Delayed,
}

impl State {
    pub const ALL: [State; 5] = [
        State::Inactive,
        State::Active,
        State::Complete,
        State::Failed,
        State::Delayed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            State::Inactive => "inactive",
            State::Active => "active",
            State::Complete => "complete",
            State::Failed => "failed",
            State::Delayed => "delayed",
        }
    }
}

impl FromStr for State {
    type Err = StokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inactive" => Ok(State::Inactive),
            "active" => Ok(State::Active),
            "complete" => Ok(State::Complete),
            "failed" => Ok(State::Failed),
            "delayed" => Ok(State::Delayed),
            other => Err(StokerError::InvalidState(other.to_string())),
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn clamp_progress(done: u64, total: u64) -> u32 {
    let pct = done.saturating_mul(100) / total.max(1);
    pct.min(100) as u32
}

/// A persistent job.
///
/// Constructed through [`crate::Queue::create`], persisted by [`Job::save`],
/// and mutated through the methods here; each mutator writes through to the
/// store. The id is allocated on first save.
pub struct Job {
    client: Client,
    bus: Arc<EventBus>,
    search: Arc<dyn SearchIndex>,

    id: Option<JobId>,
    kind: String,
    data: Value,
    priority: Priority,
    state: State,
    delay: Option<u64>,
    backoff: Option<BackoffStrategy>,
    attempts: u32,
    max_attempts: u32,
    progress: u32,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    failed_at: i64,
    duration: u64,

    events_rx: Option<mpsc::UnboundedReceiver<JobEvent>>,
}

impl Job {
    pub(crate) fn new(
        client: Client,
        bus: Arc<EventBus>,
        search: Arc<dyn SearchIndex>,
        kind: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            client,
            bus,
            search,
            id: None,
            kind: kind.into(),
            data,
            priority: Priority::NORMAL,
            state: State::Inactive,
            delay: None,
            backoff: None,
            attempts: 0,
            max_attempts: 1,
            progress: 0,
            error: None,
            created_at: 0,
            updated_at: 0,
            failed_at: 0,
            duration: 0,
            events_rx: None,
        }
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn priority_value(&self) -> Priority {
        self.priority
    }

    pub fn delay_ms(&self) -> Option<u64> {
        self.delay
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn progress_value(&self) -> u32 {
        self.progress
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    pub fn failed_at(&self) -> i64 {
        self.failed_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration
    }

    pub fn backoff_strategy(&self) -> Option<&BackoffStrategy> {
        self.backoff.as_ref()
    }

    /// Set the priority. Takes any `Into<Priority>`; parse named levels
    /// with [`Priority::from_str`].
    pub fn priority(&mut self, priority: impl Into<Priority>) -> &mut Self {
        self.priority = priority.into();
        self
    }

    /// Delay eligibility by `ms` from creation. A positive delay forces the
    /// initial state to `delayed`.
    pub fn delay(&mut self, ms: u64) -> &mut Self {
        if ms > 0 {
            self.delay = Some(ms);
            self.state = State::Delayed;
        }
        self
    }

    /// Set the maximum number of dispatch attempts (at least 1).
    pub fn attempts(&mut self, max: u32) -> &mut Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Route retries through `delayed` with the given backoff instead of
    /// straight back to `inactive`.
    pub fn backoff(&mut self, strategy: BackoffStrategy) -> &mut Self {
        self.backoff = Some(strategy);
        self
    }

    /// Take the receiver of this job's lifecycle events. Available once
    /// after `save`; events flow only while the queue's bus subscription is
    /// running.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events_rx.take()
    }

    fn require_id(&self) -> Result<JobId> {
        self.id.ok_or(StokerError::Unsaved)
    }

    /// First save allocates an id, registers the event mapping, persists
    /// and indexes the job, and emits `enqueue`. Subsequent saves are
    /// [`Job::update`].
    pub async fn save(&mut self) -> Result<JobId> {
        if let Some(id) = self.id {
            self.update().await?;
            return Ok(id);
        }

        let store = self.client.store();
        let next = store.incrby(&self.client.ids_key(), 1).await?;
        let id = JobId(next as u64);
        self.id = Some(id);
        self.created_at = now_ms();

        store.sadd(&self.client.types_key(), &self.kind).await?;
        self.bus.add(id).await?;
        self.events_rx = Some(self.bus.attach(id));

        self.update().await?;
        self.bus.emit(id, Event::Enqueue, Vec::new()).await?;
        Ok(id)
    }

    /// Serialize `data`, persist the scalar fields, re-index under the
    /// current priority, and hand the JSON to the search indexer.
    pub async fn update(&mut self) -> Result<()> {
        let id = self.require_id()?;
        self.updated_at = now_ms();

        let json = serde_json::to_string(&self.data)?;
        let mut fields: Vec<(&str, String)> = vec![
            ("type", self.kind.clone()),
            ("data", json.clone()),
            ("priority", self.priority.value().to_string()),
            ("state", self.state.as_str().to_string()),
            ("attempts", self.attempts.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("progress", self.progress.to_string()),
            ("created_at", self.created_at.to_string()),
            ("updated_at", self.updated_at.to_string()),
            ("duration", self.duration.to_string()),
        ];
        if let Some(delay) = self.delay {
            fields.push(("delay", delay.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if self.failed_at > 0 {
            fields.push(("failed_at", self.failed_at.to_string()));
        }
        if let Some(backoff) = &self.backoff {
            fields.push(("backoff", serde_json::to_string(backoff)?));
        }
        self.client
            .store()
            .hset_multiple(&self.client.job_key(id), &fields)
            .await?;

        let state = self.state;
        self.set_state(state).await?;
        self.search.index(id, &json).await?;
        Ok(())
    }

    /// The single state-transition primitive: de-index from the current
    /// state, persist the new state, re-index under the current priority,
    /// and wake one worker when entering `inactive`.
    ///
    /// The de-index/re-index steps are single-key commands; a concurrent
    /// reader may briefly observe the job in no index at all.
    pub async fn set_state(&mut self, state: State) -> Result<()> {
        let id = self.require_id()?;
        let store = self.client.store();
        let zid = id.zid();

        store.zrem(&self.client.all_key(), &zid).await?;
        store.zrem(&self.client.state_key(self.state), &zid).await?;
        store
            .zrem(&self.client.kind_state_key(&self.kind, self.state), &zid)
            .await?;

        self.state = state;
        store
            .hset(&self.client.job_key(id), "state", state.as_str())
            .await?;

        let score = self.priority.value();
        store.zadd(&self.client.all_key(), &zid, score).await?;
        store.zadd(&self.client.state_key(state), &zid, score).await?;
        store
            .zadd(&self.client.kind_state_key(&self.kind, state), &zid, score)
            .await?;

        if state == State::Inactive {
            store.lpush(&self.client.notify_key(&self.kind), "1").await?;
        }

        self.touch().await
    }

    pub async fn inactive(&mut self) -> Result<()> {
        self.set_state(State::Inactive).await
    }

    pub async fn active(&mut self) -> Result<()> {
        self.set_state(State::Active).await
    }

    /// Completion forces `progress` to 100.
    pub async fn complete(&mut self) -> Result<()> {
        let id = self.require_id()?;
        self.progress = 100;
        self.client
            .store()
            .hset(&self.client.job_key(id), "progress", "100")
            .await?;
        self.set_state(State::Complete).await
    }

    pub async fn failed(&mut self) -> Result<()> {
        let id = self.require_id()?;
        self.failed_at = now_ms();
        self.client
            .store()
            .hset(&self.client.job_key(id), "failed_at", &self.failed_at.to_string())
            .await?;
        self.set_state(State::Failed).await
    }

    /// Recompute progress as `min(100, done/total*100)`, persist it, and
    /// emit a `progress` event carrying the new percentage.
    pub async fn progress(&mut self, done: u64, total: u64) -> Result<u32> {
        let id = self.require_id()?;
        let pct = clamp_progress(done, total);
        self.progress = pct;
        self.client
            .store()
            .hset(&self.client.job_key(id), "progress", &pct.to_string())
            .await?;
        self.touch().await?;
        self.bus
            .emit(id, Event::Progress, vec![Value::from(pct)])
            .await?;
        Ok(pct)
    }

    /// Append a line to the job's log. Callers format with `format!`.
    pub async fn log(&mut self, line: impl Into<String>) -> Result<()> {
        let id = self.require_id()?;
        self.client
            .store()
            .rpush(&self.client.log_key(id), &line.into())
            .await?;
        self.touch().await
    }

    /// Read back the log entries.
    pub async fn logs(&self) -> Result<Vec<String>> {
        let id = self.require_id()?;
        self.client.store().lrange(&self.client.log_key(id), 0, -1).await
    }

    /// Record a failure: persist the message as the job's error, log its
    /// first line, set `failed_at`.
    pub async fn set_error(&mut self, message: impl Into<String>) -> Result<()> {
        let id = self.require_id()?;
        let message = message.into();
        let first_line = message.lines().next().unwrap_or_default().to_string();

        self.error = Some(message.clone());
        self.failed_at = now_ms();
        self.client
            .store()
            .hset_multiple(
                &self.client.job_key(id),
                &[
                    ("error", message),
                    ("failed_at", self.failed_at.to_string()),
                ],
            )
            .await?;
        self.log(first_line).await
    }

    /// Consume one attempt: default `max_attempts` to 1 if the record lacks
    /// it, bump `attempts`, and return how many attempts remain.
    pub async fn attempt(&mut self) -> Result<u32> {
        let id = self.require_id()?;
        let store = self.client.store();
        let key = self.client.job_key(id);

        store.hsetnx(&key, "max_attempts", "1").await?;
        let max: u32 = store
            .hget(&key, "max_attempts")
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);
        let made = store.hincrby(&key, "attempts", 1).await? as u32;

        self.max_attempts = max;
        self.attempts = made;
        Ok(max.saturating_sub(made))
    }

    /// Reschedule a retry through `delayed` so that it becomes due
    /// `backoff_ms` from now. The stored delay is relative to `created_at`,
    /// which is what the promoter's due test reads.
    pub(crate) async fn delay_retry(&mut self, backoff_ms: u64) -> Result<()> {
        let id = self.require_id()?;
        let since_creation = (now_ms() - self.created_at).max(0) as u64;
        let delay = since_creation + backoff_ms;
        self.delay = Some(delay);
        self.client
            .store()
            .hset(&self.client.job_key(id), "delay", &delay.to_string())
            .await?;
        self.set_state(State::Delayed).await
    }

    pub(crate) async fn record_duration(&mut self, ms: u64) -> Result<()> {
        let id = self.require_id()?;
        self.duration = ms;
        self.client
            .store()
            .hset(&self.client.job_key(id), "duration", &ms.to_string())
            .await
    }

    /// Remove the job everywhere: indices, log, search entry, event
    /// mapping, record. Cleanup is best-effort.
    pub async fn remove(mut self) -> Result<()> {
        let id = self.require_id()?;
        let _ = self.bus.emit(id, Event::Remove, Vec::new()).await;

        let store = self.client.store();
        let zid = id.zid();
        let _ = store.zrem(&self.client.all_key(), &zid).await;
        let _ = store.zrem(&self.client.state_key(self.state), &zid).await;
        let _ = store
            .zrem(&self.client.kind_state_key(&self.kind, self.state), &zid)
            .await;
        let _ = store.del(&self.client.log_key(id)).await;
        let _ = self.search.deindex(id).await;
        let _ = store.del(&self.client.job_key(id)).await;
        let _ = self.bus.remove(id).await;
        self.events_rx = None;
        Ok(())
    }

    /// Load a job by id.
    ///
    /// An empty record means the indices are the inconsistent party: the id
    /// is evicted from every per-state set and `NotFound` is returned. A
    /// record without a type is purged entirely and surfaces as `Corrupt`.
    pub(crate) async fn load(
        client: Client,
        bus: Arc<EventBus>,
        search: Arc<dyn SearchIndex>,
        id: JobId,
    ) -> Result<Job> {
        let record = client.store().hgetall(&client.job_key(id)).await?;
        if record.is_empty() {
            evict(&client, id).await;
            return Err(StokerError::NotFound(id));
        }

        let kind = match record.get("type") {
            Some(kind) if !kind.is_empty() => kind.clone(),
            _ => {
                evict(&client, id).await;
                let store = client.store();
                let _ = store.zrem(&client.all_key(), &id.zid()).await;
                let _ = store.del(&client.log_key(id)).await;
                let _ = search.deindex(id).await;
                let _ = store.del(&client.job_key(id)).await;
                let _ = store.hdel(&client.events_key(), &id.to_string()).await;
                return Err(StokerError::Corrupt(id));
            }
        };

        let data = match record.get("data") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        let backoff = match record.get("backoff") {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        let state = record
            .get("state")
            .map(|raw| raw.parse())
            .unwrap_or(Ok(State::Inactive))?;

        let field = |name: &str| record.get(name).cloned().unwrap_or_default();
        Ok(Job {
            client,
            bus,
            search,
            id: Some(id),
            kind,
            data,
            priority: Priority(field("priority").parse().unwrap_or(0)),
            state,
            delay: field("delay").parse().ok(),
            backoff,
            attempts: field("attempts").parse().unwrap_or(0),
            max_attempts: field("max_attempts").parse().unwrap_or(1),
            progress: field("progress").parse().unwrap_or(0),
            error: record.get("error").cloned(),
            created_at: field("created_at").parse().unwrap_or(0),
            updated_at: field("updated_at").parse().unwrap_or(0),
            failed_at: field("failed_at").parse().unwrap_or(0),
            duration: field("duration").parse().unwrap_or(0),
            events_rx: None,
        })
    }

    async fn touch(&mut self) -> Result<()> {
        let id = self.require_id()?;
        self.updated_at = now_ms();
        self.client
            .store()
            .hset(&self.client.job_key(id), "updated_at", &self.updated_at.to_string())
            .await
    }
}

/// Evict a stale id from every per-state index; failures are ignored.
async fn evict(client: &Client, id: JobId) {
    let zid = id.zid();
    for state in State::ALL {
        let _ = client.store().zrem(&client.state_key(state), &zid).await;
    }
}
