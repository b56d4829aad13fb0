//! End-to-end scenarios against the in-process store: one queue per test,
//! workers and the promoter running as real tasks, events observed through
//! the bus.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

use stoker::{
    async_trait, BackoffStrategy, Event, Handler, Job, JobEvent, JobId, MemoryStore, Priority,
    Queue, State, StokerError, Store,
};

fn setup() -> (Arc<MemoryStore>, Arc<Queue>) {
    let store = Arc::new(MemoryStore::new());
    let queue = Queue::with_store(store.clone(), "q");
    (store, queue)
}

async fn wait_for(rx: &mut broadcast::Receiver<JobEvent>, wanted: Event) -> JobEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.event == wanted {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Handler that fails its first `fail_times` runs, then succeeds.
struct Flaky {
    runs: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait]
impl Handler for Flaky {
    async fn perform(&self, _job: &mut Job) -> anyhow::Result<()> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_times {
            anyhow::bail!("simulated failure");
        }
        Ok(())
    }
}

/// Handler that sleeps long enough for a measurable duration.
struct Sleeper;

#[async_trait]
impl Handler for Sleeper {
    async fn perform(&self, _job: &mut Job) -> anyhow::Result<()> {
        sleep(Duration::from_millis(25)).await;
        Ok(())
    }
}

/// Count how many per-state and per-(type,state) indices hold the id.
async fn placements(store: &MemoryStore, kind: &str, id: JobId) -> (usize, usize, bool) {
    let zid = id.zid();
    let mut state_hits = 0;
    let mut kind_hits = 0;
    for state in State::ALL {
        let key = format!("q:jobs:{}", state.as_str());
        if store.zrange(&key, 0, -1).await.unwrap().contains(&zid) {
            state_hits += 1;
        }
        let key = format!("q:jobs:{}:{}", kind, state.as_str());
        if store.zrange(&key, 0, -1).await.unwrap().contains(&zid) {
            kind_hits += 1;
        }
    }
    let global = store.zrange("q:jobs", 0, -1).await.unwrap().contains(&zid);
    (state_hits, kind_hits, global)
}

#[tokio::test]
async fn save_allocates_id_and_indexes_by_priority() {
    let (store, queue) = setup();

    let mut job = queue.create("email", json!({"to": "a"}));
    job.priority("high".parse::<Priority>().unwrap());
    let id = job.save().await.unwrap();

    assert_eq!(id, JobId(1));
    assert_eq!(job.state(), State::Inactive);

    let members = store.zrange("q:jobs:email:inactive", 0, -1).await.unwrap();
    assert_eq!(members, vec![id.zid()]);
    assert_eq!(
        store.zscore("q:jobs:email:inactive", &id.zid()).await.unwrap(),
        Some(-10)
    );

    let (state_hits, kind_hits, global) = placements(&store, "email", id).await;
    assert_eq!((state_hits, kind_hits, global), (1, 1, true));

    assert_eq!(queue.types().await.unwrap(), vec!["email".to_string()]);
    assert_eq!(queue.inactive_count().await.unwrap(), 1);
}

#[tokio::test]
async fn worker_completes_a_job_and_accounts_time() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut job = queue.create("email", json!({"to": "a"}));
    let id = job.save().await.unwrap();

    queue.process("email", 1, Sleeper).await.unwrap();

    let started = wait_for(&mut events, Event::Start).await;
    assert_eq!(started.id, id);
    let completed = wait_for(&mut events, Event::Complete).await;
    assert_eq!(completed.id, id);

    let settled = queue.get(id).await.unwrap();
    assert_eq!(settled.state(), State::Complete);
    assert_eq!(settled.progress_value(), 100);
    assert!(settled.duration_ms() >= 1);
    assert!(queue.work_time().await.unwrap() >= settled.duration_ms());

    queue.shutdown().await;
}

#[tokio::test]
async fn lower_priority_scores_are_served_first() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut normal = queue.create("email", json!({"n": 1}));
    let normal_id = normal.save().await.unwrap();

    let mut critical = queue.create("email", json!({"n": 2}));
    critical.priority(Priority::CRITICAL);
    let critical_id = critical.save().await.unwrap();

    queue.process("email", 1, Sleeper).await.unwrap();

    let first = wait_for(&mut events, Event::Complete).await;
    let second = wait_for(&mut events, Event::Complete).await;
    assert_eq!(first.id, critical_id);
    assert_eq!(second.id, normal_id);

    queue.shutdown().await;
}

#[tokio::test]
async fn equal_priorities_are_served_in_id_order() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        let mut job = queue.create("email", json!({"n": n}));
        ids.push(job.save().await.unwrap());
    }

    queue.process("email", 1, Sleeper).await.unwrap();

    for expected in ids {
        let completed = wait_for(&mut events, Event::Complete).await;
        assert_eq!(completed.id, expected);
    }

    queue.shutdown().await;
}

#[tokio::test]
async fn delayed_job_is_promoted_once_due() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut job = queue.create("email", json!({}));
    job.delay(300);
    let id = job.save().await.unwrap();
    assert_eq!(job.state(), State::Delayed);

    queue.promote(Duration::from_millis(50));

    // Well before the deadline the job must still be delayed.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get(id).await.unwrap().state(), State::Delayed);

    let promoted = wait_for(&mut events, Event::Promotion).await;
    assert_eq!(promoted.id, id);
    assert_eq!(queue.get(id).await.unwrap().state(), State::Inactive);

    // Exactly once: no further promotion arrives.
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.event == Event::Promotion {
                return event;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "job was promoted more than once");

    queue.shutdown().await;
}

#[tokio::test]
async fn due_jobs_are_promoted_past_undue_higher_priority_ones() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    // Twenty critical jobs sort to the front of the priority-scored
    // delayed index but are nowhere near due.
    for n in 0..20 {
        let mut job = queue.create("email", json!({"n": n}));
        job.priority(Priority::CRITICAL).delay(60_000);
        job.save().await.unwrap();
    }

    // Five low-priority jobs sit behind them and become due almost
    // immediately; the sweep must still reach them.
    let mut due = HashSet::new();
    for n in 0..5 {
        let mut job = queue.create("email", json!({"late": n}));
        job.priority(Priority::LOW).delay(50);
        due.insert(job.save().await.unwrap());
    }

    queue.promote(Duration::from_millis(25));

    let mut promoted = HashSet::new();
    while promoted.len() < due.len() {
        let event = wait_for(&mut events, Event::Promotion).await;
        promoted.insert(event.id);
    }
    assert_eq!(promoted, due);
    assert_eq!(queue.delayed_count().await.unwrap(), 20);
    assert_eq!(queue.inactive_count().await.unwrap(), 5);

    queue.shutdown().await;
}

#[tokio::test]
async fn failing_handler_exhausts_attempts_then_fails() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut errors = queue.errors();
    let runs = Arc::new(AtomicU32::new(0));
    let mut job = queue.create("email", json!({}));
    job.attempts(3);
    let id = job.save().await.unwrap();

    queue
        .process(
            "email",
            1,
            Flaky {
                runs: runs.clone(),
                fail_times: u32::MAX,
            },
        )
        .await
        .unwrap();

    let failed = wait_for(&mut events, Event::Failed).await;

    // Handler failures are re-emitted on the queue's error channel.
    let reported = timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("no error re-emitted")
        .unwrap();
    assert!(reported.contains("simulated failure"));
    assert_eq!(failed.id, id);
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let settled = queue.get(id).await.unwrap();
    assert_eq!(settled.state(), State::Failed);
    assert_eq!(settled.attempts_made(), 3);
    assert_eq!(settled.max_attempts(), 3);
    assert!(settled.attempts_made() <= settled.max_attempts());
    assert!(settled.error().unwrap().contains("simulated failure"));
    assert!(settled.failed_at() > 0);

    // Each failure logged its first line.
    assert_eq!(settled.logs().await.unwrap().len(), 3);

    queue.shutdown().await;
}

#[tokio::test]
async fn handler_that_recovers_ends_complete() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let mut job = queue.create("email", json!({}));
    job.attempts(3);
    let id = job.save().await.unwrap();

    queue
        .process(
            "email",
            1,
            Flaky {
                runs: runs.clone(),
                fail_times: 2,
            },
        )
        .await
        .unwrap();

    let completed = wait_for(&mut events, Event::Complete).await;
    assert_eq!(completed.id, id);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(queue.get(id).await.unwrap().state(), State::Complete);

    queue.shutdown().await;
}

#[tokio::test]
async fn backoff_routes_retries_through_delayed() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let mut job = queue.create("email", json!({}));
    job.attempts(2)
        .backoff(BackoffStrategy::Fixed { delay_ms: 100 });
    let id = job.save().await.unwrap();

    queue.promote(Duration::from_millis(25));
    queue
        .process(
            "email",
            1,
            Flaky {
                runs: runs.clone(),
                fail_times: 1,
            },
        )
        .await
        .unwrap();

    // The failed first attempt parks the job in `delayed`; the promoter
    // must bring it back before the retry can complete.
    let promoted = wait_for(&mut events, Event::Promotion).await;
    assert_eq!(promoted.id, id);
    let completed = wait_for(&mut events, Event::Complete).await;
    assert_eq!(completed.id, id);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    queue.shutdown().await;
}

#[tokio::test]
async fn abandoned_active_job_is_salvaged_once() {
    let (store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut job = queue.create("email", json!({}));
    let id = job.save().await.unwrap();
    job.set_state(State::Active).await.unwrap();
    assert!(store
        .zrange("q:jobs:email:active", 0, -1)
        .await
        .unwrap()
        .contains(&id.zid()));

    queue.process("email", 1, Sleeper).await.unwrap();

    let completed = wait_for(&mut events, Event::Complete).await;
    assert_eq!(completed.id, id);
    assert_eq!(queue.get(id).await.unwrap().state(), State::Complete);

    // Salvage ran already for this type: a second abandoned job stays put.
    let mut orphan = queue.create("email", json!({}));
    let orphan_id = orphan.save().await.unwrap();
    orphan.set_state(State::Active).await.unwrap();
    queue.process("email", 1, Sleeper).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get(orphan_id).await.unwrap().state(), State::Active);

    queue.shutdown().await;
}

#[tokio::test]
async fn remove_clears_record_indices_and_mapping() {
    let (store, queue) = setup();

    let mut job = queue.create("email", json!({"to": "a"}));
    let id = job.save().await.unwrap();
    job.remove().await.unwrap();

    assert!(store.hgetall(&format!("q:job:{id}")).await.unwrap().is_empty());
    let (state_hits, kind_hits, global) = placements(&store, "email", id).await;
    assert_eq!((state_hits, kind_hits, global), (0, 0, false));
    assert!(store
        .hget("q:events", &id.to_string())
        .await
        .unwrap()
        .is_none());
    assert!(store
        .lrange(&format!("q:job:{id}:log"), 0, -1)
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        queue.get(id).await,
        Err(StokerError::NotFound(_))
    ));
}

#[tokio::test]
async fn saved_jobs_round_trip_through_get() {
    let (_store, queue) = setup();

    let data = json!({"to": "a", "attachments": [1, 2, 3]});
    let mut job = queue.create("email", data.clone());
    job.priority(Priority::CRITICAL);
    let id = job.save().await.unwrap();

    let loaded = queue.get(id).await.unwrap();
    assert_eq!(loaded.kind(), "email");
    assert_eq!(loaded.data(), &data);
    assert_eq!(loaded.priority_value(), Priority::CRITICAL);
    assert_eq!(loaded.state(), State::Inactive);
    assert_eq!(loaded.created_at(), job.created_at());
}

#[tokio::test]
async fn missing_record_evicts_stale_index_entries() {
    let (store, queue) = setup();

    let ghost = JobId(99);
    store.zadd("q:jobs:inactive", &ghost.zid(), 0).await.unwrap();
    store
        .zadd("q:jobs:email:inactive", &ghost.zid(), 0)
        .await
        .unwrap();

    assert!(matches!(
        queue.get(ghost).await,
        Err(StokerError::NotFound(_))
    ));
    assert!(store.zrange("q:jobs:inactive", 0, -1).await.unwrap().is_empty());
}

#[tokio::test]
async fn record_without_a_type_is_purged_as_corrupt() {
    let (store, queue) = setup();

    let id = JobId(5);
    store.hset(&format!("q:job:{id}"), "data", "{}").await.unwrap();
    store.zadd("q:jobs", &id.zid(), 0).await.unwrap();
    store.zadd("q:jobs:inactive", &id.zid(), 0).await.unwrap();

    assert!(matches!(
        queue.get(id).await,
        Err(StokerError::Corrupt(_))
    ));
    assert!(store.hgetall(&format!("q:job:{id}")).await.unwrap().is_empty());
    assert!(store.zrange("q:jobs", 0, -1).await.unwrap().is_empty());
    assert!(store.zrange("q:jobs:inactive", 0, -1).await.unwrap().is_empty());
}

#[tokio::test]
async fn transitions_keep_exactly_one_index_placement() {
    let (store, queue) = setup();

    let mut job = queue.create("email", json!({}));
    let id = job.save().await.unwrap();

    for state in [State::Active, State::Complete, State::Failed, State::Delayed, State::Inactive] {
        job.set_state(state).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().state(), state);
        let (state_hits, kind_hits, global) = placements(&store, "email", id).await;
        assert_eq!((state_hits, kind_hits, global), (1, 1, true), "in {state}");
    }
}

#[tokio::test]
async fn producers_see_enqueue_and_progress_events() {
    let (_store, queue) = setup();
    let mut events = queue.job_events().await.unwrap();

    let mut job = queue.create("email", json!({}));
    let id = job.save().await.unwrap();
    let mut own = job.events().expect("save attaches the event channel");

    let enqueued = wait_for(&mut events, Event::Enqueue).await;
    assert_eq!(enqueued.id, id);

    let pct = job.progress(5, 10).await.unwrap();
    assert_eq!(pct, 50);

    let progressed = wait_for(&mut events, Event::Progress).await;
    assert_eq!(progressed.args, vec![json!(50)]);

    // The same event also lands on the per-job channel.
    let delivered = timeout(Duration::from_secs(5), async {
        loop {
            let event = own.recv().await.expect("job channel closed");
            if event.event == Event::Progress {
                return event;
            }
        }
    })
    .await
    .expect("per-job event not delivered");
    assert_eq!(delivered.id, id);
}

#[tokio::test]
async fn settings_and_counters_read_back() {
    let (store, queue) = setup();

    store.hset("q:settings", "concurrency", "10").await.unwrap();
    assert_eq!(
        queue.setting("concurrency").await.unwrap().as_deref(),
        Some("10")
    );
    assert_eq!(queue.setting("absent").await.unwrap(), None);

    let mut a = queue.create("email", json!({}));
    a.save().await.unwrap();
    let mut b = queue.create("video", json!({}));
    b.delay(1_000);
    b.save().await.unwrap();

    let mut types = queue.types().await.unwrap();
    types.sort();
    assert_eq!(types, vec!["email".to_string(), "video".to_string()]);
    assert_eq!(queue.inactive_count().await.unwrap(), 1);
    assert_eq!(queue.delayed_count().await.unwrap(), 1);
    assert_eq!(queue.state(State::Delayed).await.unwrap(), vec![b.id().unwrap()]);
}
