//! Cross-process event bus.
//!
//! Each producer process owns one pub/sub channel named after its process
//! id. The store-side `events` hash maps every saved job id to the process
//! that saved it; `emit` looks the owner up and publishes there. A lazy
//! dispatch task routes incoming messages to the per-job local channel and
//! to the queue-level broadcast. Delivery is best-effort and in publish
//! order; nothing is persisted, so a subscriber that starts late misses
//! earlier events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::{Client, JobId, Result};

/// Lifecycle events raised by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Enqueue,
    Start,
    Promotion,
    Progress,
    Complete,
    Failed,
    Remove,
}

/// Wire message published on the owner's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobId,
    pub event: Event,
    #[serde(default)]
    pub args: Vec<Value>,
}

pub struct EventBus {
    client: Client,
    process_id: String,
    local: Mutex<HashMap<JobId, mpsc::UnboundedSender<JobEvent>>>,
    queue_tx: broadcast::Sender<JobEvent>,
    subscribed: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(client: Client) -> Self {
        let (queue_tx, _) = broadcast::channel(256);
        Self {
            client,
            process_id: Uuid::new_v4().to_string(),
            local: Mutex::new(HashMap::new()),
            queue_tx,
            subscribed: AtomicBool::new(false),
            dispatch: Mutex::new(None),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Register this process as the owner of a job's events.
    pub async fn add(&self, id: JobId) -> Result<()> {
        self.client
            .store()
            .hset(&self.client.events_key(), &id.to_string(), &self.process_id)
            .await
    }

    /// Drop the owner mapping for a job.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        self.detach(id);
        self.client
            .store()
            .hdel(&self.client.events_key(), &id.to_string())
            .await
    }

    /// Open the local per-job channel events will be routed onto.
    pub fn attach(&self, id: JobId) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.lock().unwrap().insert(id, tx);
        rx
    }

    pub fn detach(&self, id: JobId) {
        self.local.lock().unwrap().remove(&id);
    }

    /// Publish an event to whichever process owns the job. A job nobody
    /// subscribed to has no owner entry and the event is dropped.
    pub async fn emit(&self, id: JobId, event: Event, args: Vec<Value>) -> Result<()> {
        let owner = self
            .client
            .store()
            .hget(&self.client.events_key(), &id.to_string())
            .await?;
        let Some(owner) = owner else {
            return Ok(());
        };
        let message = JobEvent { id, event, args };
        let payload = serde_json::to_string(&message)?;
        self.client
            .store()
            .publish(&self.client.channel_key(&owner), &payload)
            .await
    }

    /// Start the dispatch task for this process's channel. Idempotent; the
    /// queue calls this lazily the first time anyone listens for job events.
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.client.channel_key(&self.process_id);
        let mut messages = match self.client.store().subscribe(&channel).await {
            Ok(rx) => rx,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(payload) = messages.recv().await {
                let event: JobEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("discarding undecodable event payload: {e}");
                        continue;
                    }
                };
                let sender = bus.local.lock().unwrap().get(&event.id).cloned();
                if let Some(sender) = sender {
                    let _ = sender.send(event.clone());
                }
                let _ = bus.queue_tx.send(event);
            }
        });
        *self.dispatch.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Queue-level fan-out of every event delivered to this process.
    pub fn queue_events(&self) -> broadcast::Receiver<JobEvent> {
        self.queue_tx.subscribe()
    }

    /// Stop dispatching and delete this process's own entries from the
    /// owner map so emitters stop publishing into the void.
    pub async fn close(&self) {
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.abort();
        }
        self.local.lock().unwrap().clear();

        let store = self.client.store();
        let events_key = self.client.events_key();
        if let Ok(owners) = store.hgetall(&events_key).await {
            for (id, owner) in owners {
                if owner == self.process_id {
                    let _ = store.hdel(&events_key, &id).await;
                }
            }
        }
    }
}
