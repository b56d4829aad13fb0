//! In-process [`Store`] implementation.
//!
//! Backs the test suite and embedded single-process deployments. Semantics
//! mirror the Redis commands the core uses: sorted sets order by
//! `(score, member)` so equal-priority jobs keep id order, the blocking pop
//! suspends until a push arrives, and pub/sub delivers in publish order with
//! nothing replayed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::store::Store;
use crate::{Result, StokerError};

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

#[derive(Default)]
struct Data {
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, Zset>,
    lists: HashMap<String, Arc<ListState>>,
}

#[derive(Default)]
struct Zset {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl Zset {
    fn insert(&mut self, member: String, score: i64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.scores.remove(member) {
            self.ordered.remove(&(score, member.to_string()));
        }
    }

    fn pop_min(&mut self) -> Option<String> {
        let (score, member) = self.ordered.iter().next().cloned()?;
        self.ordered.remove(&(score, member.clone()));
        self.scores.remove(&member);
        Some(member)
    }
}

struct ListState {
    items: Mutex<VecDeque<String>>,
    ready: Semaphore,
}

impl ListState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
        })
    }
}

/// Inclusive index range with Redis semantics: negative indices count from
/// the end, out-of-range ends clamp, inverted ranges are empty.
fn index_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let resolve = |i: isize| -> isize {
        if i < 0 {
            len as isize + i
        } else {
            i
        }
    };
    let start = resolve(start).max(0) as usize;
    let stop = resolve(stop);
    if stop < 0 || start >= len {
        return None;
    }
    let stop = (stop as usize).min(len - 1);
    if start > stop {
        return None;
    }
    Some((start, stop))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, key: &str) -> Arc<ListState> {
        let mut data = self.data.lock().unwrap();
        data.lists
            .entry(key.to_string())
            .or_insert_with(ListState::new)
            .clone()
    }

    fn channel(&self, key: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock().unwrap();
        Ok(data.counters.get(key).map(|n| n.to_string()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.counters.remove(key);
        data.hashes.remove(key);
        data.sets.remove(key);
        data.zsets.remove(key);
        data.lists.remove(key);
        Ok(())
    }

    async fn incrby(&self, key: &str, by: i64) -> Result<i64> {
        let mut data = self.data.lock().unwrap();
        let counter = data.counters.entry(key.to_string()).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let hash = data.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let hash = data.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let data = self.data.lock().unwrap();
        Ok(data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut data = self.data.lock().unwrap();
        let hash = data.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash
            .get(field)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(hash) = data.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(zset) = data.zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let data = self.data.lock().unwrap();
        let Some(zset) = data.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = index_range(zset.ordered.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .ordered
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let data = self.data.lock().unwrap();
        Ok(data.zsets.get(key).map(|z| z.ordered.len() as u64).unwrap_or(0))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .zsets
            .get(key)
            .and_then(|zset| zset.scores.get(member))
            .copied())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().unwrap();
        Ok(data.zsets.get_mut(key).and_then(Zset::pop_min))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let list = self.list(key);
        list.items.lock().unwrap().push_front(value.to_string());
        list.ready.add_permits(1);
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let list = self.list(key);
        list.items.lock().unwrap().push_back(value.to_string());
        list.ready.add_permits(1);
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let list = self.list(key);
        let items = list.items.lock().unwrap();
        let Some((start, stop)) = index_range(items.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(items.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn blpop(&self, key: &str) -> Result<String> {
        let list = self.list(key);
        loop {
            let permit = list
                .ready
                .acquire()
                .await
                .map_err(|_| StokerError::Worker("notification list closed".into()))?;
            permit.forget();
            if let Some(value) = list.items.lock().unwrap().pop_front() {
                return Ok(value);
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let sender = {
            let channels = self.channels.lock().unwrap();
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No subscribers is not an error, matching PUBLISH.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut source = self.channel(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
