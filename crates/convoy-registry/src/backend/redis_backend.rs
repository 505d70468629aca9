//! Redis backend.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own;
//! subscriptions use a dedicated pub/sub connection per call, pinged while
//! idle so a silently dropped link ends the subscription.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{BackendFuture, RegistryBackend, Subscription};
use crate::error::{RegistryError, RegistryResult};

const SUBSCRIPTION_BUFFER: usize = 64;
const SUBSCRIPTION_PING_INTERVAL: Duration = Duration::from_secs(30);
const SUBSCRIPTION_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
    url: String,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.url)
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn backend_err(op: &str, e: redis::RedisError) -> RegistryError {
    if e.is_io_error() || e.is_connection_dropped() {
        RegistryError::Connection(format!("redis {op} failed: {e}"))
    } else {
        RegistryError::Backend(format!("redis {op} failed: {e}"))
    }
}

impl RedisBackend {
    /// Connect to the server named by `url`.
    pub async fn open(url: &str) -> RegistryResult<Self> {
        info!(%url, "connecting to redis registry");

        let client = redis::Client::open(url).map_err(|e| RegistryError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| backend_err("connect", e))?;

        Ok(Self {
            client,
            conn,
            url: url.to_string(),
        })
    }
}

impl RegistryBackend for RedisBackend {
    fn connect(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| backend_err("PING", e))?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str, field: &'a str) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async::<Option<String>>(&mut conn)
                .await
                .map_err(|e| backend_err("HGET", e))
        })
    }

    fn set<'a>(&'a self, key: &'a str, field: &'a str, value: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(|e| backend_err("HSET", e))?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed = redis::cmd("DEL")
                .arg(key)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(|e| backend_err("DEL", e))?;
            Ok(removed > 0)
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl_secs: u64) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let set = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(|e| backend_err("EXPIRE", e))?;
            Ok(set == 1)
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<u64>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // -2: no such key, -1: no lease.
            let ttl = redis::cmd("TTL")
                .arg(key)
                .query_async::<i64>(&mut conn)
                .await
                .map_err(|e| backend_err("TTL", e))?;
            Ok(u64::try_from(ttl).ok())
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut keys = redis::cmd("KEYS")
                .arg(pattern)
                .query_async::<Vec<String>>(&mut conn)
                .await
                .map_err(|e| backend_err("KEYS", e))?;
            keys.sort();
            Ok(keys)
        })
    }

    fn members<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut members = redis::cmd("SMEMBERS")
                .arg(key)
                .query_async::<Vec<String>>(&mut conn)
                .await
                .map_err(|e| backend_err("SMEMBERS", e))?;
            members.sort();
            Ok(members)
        })
    }

    fn add_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("SADD")
                .arg(key)
                .arg(value)
                .query_async::<u64>(&mut conn)
                .await
                .map_err(|e| backend_err("SADD", e))
        })
    }

    fn remove_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("SREM")
                .arg(key)
                .arg(value)
                .query_async::<u64>(&mut conn)
                .await
                .map_err(|e| backend_err("SREM", e))
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query_async::<u64>(&mut conn)
                .await
                .map_err(|e| backend_err("PUBLISH", e))
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BackendFuture<'a, Subscription> {
        Box::pin(async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| backend_err("SUBSCRIBE", e))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| backend_err("SUBSCRIBE", e))?;
            debug!(%channel, "subscribed");

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let channel_name = channel.to_string();
            let (sink, stream) = pubsub.split();
            let messages = stream.map(|msg| {
                msg.get_payload::<String>()
                    .map_err(|e| RegistryError::Deserialize(format!("pub/sub payload: {e}")))
            });
            let ping = move || {
                let mut sink = sink.clone();
                async move {
                    sink.ping::<redis::Value>()
                        .await
                        .map(drop)
                        .map_err(|e| backend_err("PING", e))
                }
            };
            let task = tokio::spawn(async move {
                forward_messages(&channel_name, messages, ping, SUBSCRIPTION_PING_INTERVAL, tx).await;
            });
            Ok(Subscription::new(rx, task))
        })
    }
}

/// Forward `messages` to `tx`, pinging the connection every `every`.
///
/// Ends with one `Err` item when the stream ends or a ping fails or times
/// out; returns quietly when the receiver is gone.
async fn forward_messages<S, P, F>(
    channel: &str,
    messages: S,
    mut ping: P,
    every: Duration,
    tx: mpsc::Sender<RegistryResult<String>>,
) where
    S: Stream<Item = RegistryResult<String>>,
    P: FnMut() -> F,
    F: Future<Output = RegistryResult<()>>,
{
    let mut messages = pin!(messages);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let reason = loop {
        tokio::select! {
            message = messages.next() => match message {
                Some(item) => {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                None => break "stream ended".to_string(),
            },
            _ = ticker.tick() => match tokio::time::timeout(SUBSCRIPTION_PING_TIMEOUT, ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break e.to_string(),
                Err(_) => break "ping timed out".to_string(),
            },
        }
    };

    warn!(%channel, %reason, "redis subscription lost");
    let _ = tx
        .send(Err(RegistryError::Connection(format!(
            "subscription to {channel} lost: {reason}"
        ))))
        .await;
}
