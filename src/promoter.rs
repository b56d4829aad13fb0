use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::job::{now_ms, Job, JobId, State};
use crate::search::SearchIndex;
use crate::{Client, Result};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic sweep moving due delayed jobs back to `inactive`.
///
/// Each tick walks the whole `delayed` index and filters by each record's
/// stored `delay` and `created_at`; a job is due once `created_at + delay`
/// has passed, non-due entries stay put. The index is scored by priority,
/// so a bounded window would anchor on whichever entries sort first and
/// never reach due jobs behind them; the full walk is what guarantees every
/// due job is eventually promoted. Promotion is idempotent, so a second
/// promoter racing this one only re-places the job identically.
pub struct Promoter {
    client: Client,
    bus: Arc<EventBus>,
    search: Arc<dyn SearchIndex>,
    every: Duration,
}

impl Promoter {
    pub(crate) fn new(
        client: Client,
        bus: Arc<EventBus>,
        search: Arc<dyn SearchIndex>,
        every: Duration,
    ) -> Self {
        Self {
            client,
            bus,
            search,
            every,
        }
    }

    /// Run the promotion loop forever. A failed tick is logged and retried
    /// whole on the next interval.
    pub async fn run(self) {
        info!(every_ms = self.every.as_millis() as u64, "promoter started");
        let mut ticker = interval(self.every);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(0) => {}
                Ok(promoted) => info!(promoted, "promoted delayed jobs"),
                Err(e) => warn!("promotion sweep failed: {e}"),
            }
        }
    }

    /// One sweep. A store error or failed load abandons the remainder of
    /// the sweep; the next tick retries from the front of the index.
    async fn tick(&self) -> Result<usize> {
        let store = self.client.store();
        let members = store
            .zrange(&self.client.state_key(State::Delayed), 0, -1)
            .await?;

        let now = now_ms();
        let mut promoted = 0;
        for member in members {
            let Some(id) = JobId::from_zid(&member) else {
                continue;
            };
            let key = self.client.job_key(id);
            let delay: i64 = store
                .hget(&key, "delay")
                .await?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            let created_at: i64 = store
                .hget(&key, "created_at")
                .await?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            if created_at + delay > now {
                continue;
            }

            let mut job = Job::load(
                self.client.clone(),
                self.bus.clone(),
                self.search.clone(),
                id,
            )
            .await?;
            job.inactive().await?;
            self.bus.emit(id, Event::Promotion, Vec::new()).await?;
            promoted += 1;
        }
        Ok(promoted)
    }
}
