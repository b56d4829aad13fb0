use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::events::{Event, EventBus};
use crate::job::{Job, JobId, State};
use crate::search::SearchIndex;
use crate::{Client, Result, StokerError};

/// User handler invoked for each claimed job.
///
/// Returning `Ok` settles the job as complete; returning an error consumes
/// an attempt and either re-queues or fails it terminally. A handler that
/// never returns leaves the job `active` until another process's salvage.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn perform(&self, job: &mut Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Job) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
{
    async fn perform(&self, job: &mut Job) -> anyhow::Result<()> {
        (self)(job).await
    }
}

/// A worker bound to one job type.
///
/// The loop: block on the per-type notification list, pop the
/// highest-urgency inactive job, run the handler, settle. A popped sentinel
/// with no job behind it (another worker won the claim) is a spurious
/// wakeup and sends the loop straight back to the blocking pop.
pub struct Worker {
    client: Client,
    bus: Arc<EventBus>,
    search: Arc<dyn SearchIndex>,
    kind: String,
    name: String,
    handler: Arc<dyn Handler>,
    errors: broadcast::Sender<String>,
}

impl Worker {
    pub(crate) fn new(
        client: Client,
        bus: Arc<EventBus>,
        search: Arc<dyn SearchIndex>,
        kind: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        errors: broadcast::Sender<String>,
    ) -> Self {
        Self {
            client,
            bus,
            search,
            kind: kind.into(),
            name: name.into(),
            handler,
            errors,
        }
    }

    /// Run the worker loop forever. Store errors are reported and the loop
    /// backs off briefly; handler errors are settled into the job and never
    /// escape.
    pub async fn run(self) {
        info!(worker = %self.name, kind = %self.kind, "worker started");
        loop {
            if let Err(e) = self.tick().await {
                error!(worker = %self.name, "worker error: {e}");
                let _ = self.errors.send(e.to_string());
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let store = self.client.store();

        // Acquire: the sentinel only signals that an inactive job of this
        // type likely exists.
        store.blpop(&self.client.notify_key(&self.kind)).await?;

        // Select+claim: atomic min-pop, so two workers cannot take the same
        // id. Empty means someone else got there first.
        let popped = store
            .zpopmin(&self.client.kind_state_key(&self.kind, State::Inactive))
            .await?;
        let Some(member) = popped else {
            return Ok(());
        };
        let Some(id) = JobId::from_zid(&member) else {
            return Ok(());
        };

        let mut job = match self.load(id).await {
            Ok(job) => job,
            Err(StokerError::NotFound(_)) | Err(StokerError::Corrupt(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        job.active().await?;
        self.bus.emit(id, Event::Start, Vec::new()).await?;

        let started = Instant::now();
        let outcome = self.handler.perform(&mut job).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => self.settle_complete(job, id, elapsed).await,
            Err(err) => self.settle_failure(job, id, err).await,
        }
    }

    async fn settle_complete(&self, mut job: Job, id: JobId, elapsed: u64) -> Result<()> {
        job.record_duration(elapsed).await?;
        self.client
            .store()
            .incrby(&self.client.work_time_key(), elapsed as i64)
            .await?;
        job.complete().await?;
        self.bus
            .emit(id, Event::Complete, vec![Value::from(elapsed)])
            .await?;
        info!(worker = %self.name, job = %id, elapsed_ms = elapsed, "job complete");
        Ok(())
    }

    async fn settle_failure(&self, mut job: Job, id: JobId, err: anyhow::Error) -> Result<()> {
        let message = format!("{err:#}");
        warn!(worker = %self.name, job = %id, "job failed: {message}");

        job.set_error(message.clone()).await?;
        let remaining = job.attempt().await?;
        if remaining > 0 {
            match job.backoff_strategy().cloned() {
                Some(backoff) => {
                    let wait = backoff.delay_ms(job.attempts_made());
                    job.delay_retry(wait).await?;
                }
                None => job.inactive().await?,
            }
        } else {
            job.failed().await?;
            self.bus
                .emit(id, Event::Failed, vec![Value::from(message.clone())])
                .await?;
        }
        let _ = self.errors.send(message);
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Job> {
        Job::load(
            self.client.clone(),
            self.bus.clone(),
            self.search.clone(),
            id,
        )
        .await
    }

    /// One-shot recovery of jobs a dead worker left `active`: every id in
    /// the per-(type, active) set is returned to `inactive` so a live
    /// worker picks it up. Runs once per process per type; jobs orphaned
    /// later in this process's lifetime wait for the next restart.
    pub(crate) async fn salvage(&self) -> Result<usize> {
        let members = self
            .client
            .store()
            .zrange(&self.client.kind_state_key(&self.kind, State::Active), 0, -1)
            .await?;

        let mut recovered = 0;
        for member in members {
            let Some(id) = JobId::from_zid(&member) else {
                continue;
            };
            match self.load(id).await {
                Ok(mut job) => {
                    job.inactive().await?;
                    recovered += 1;
                    info!(kind = %self.kind, job = %id, "salvaged abandoned job");
                }
                Err(StokerError::NotFound(_)) | Err(StokerError::Corrupt(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}
