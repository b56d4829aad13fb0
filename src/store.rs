use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client as RedisClient};
use tokio::sync::mpsc;

use crate::Result;

/// Single-key store primitives the core is built on.
///
/// Every method maps to one store command; the core never asks the store for
/// multi-key transactions. [`RedisStore`] is the production implementation,
/// [`crate::MemoryStore`] the in-process one.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn incrby(&self, key: &str, by: i64) -> Result<i64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;
    /// Set a hash field only if absent; returns whether it was set.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    /// Members in (score, member) order over the inclusive index range;
    /// negative indices count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;
    /// Atomically pop the lowest-scored member, ties resolved by member
    /// order.
    async fn zpopmin(&self, key: &str) -> Result<Option<String>>;

    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    /// Pop the head of the list, waiting without bound until one exists.
    /// This is the only unbounded suspension in the crate.
    async fn blpop(&self, key: &str) -> Result<String>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    /// Start listening on a channel; payloads arrive on the returned
    /// receiver in publish order. Nothing is replayed.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// Redis-backed [`Store`].
///
/// Request/reply commands share one [`ConnectionManager`]; the blocking pop
/// and the subscription each open a dedicated connection so they cannot
/// stall the multiplexed traffic.
pub struct RedisStore {
    client: RedisClient,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn incrby(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, by).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hset_nx(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, by).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(popped.into_iter().next().map(|(member, _)| member))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn blpop(&self, key: &str) -> Result<String> {
        // Dedicated connection: BLPOP parks the whole connection until a
        // value arrives.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        loop {
            let popped: Option<(String, String)> = conn.blpop(key, 0.0).await?;
            if let Some((_, value)) = popped {
                return Ok(value);
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
