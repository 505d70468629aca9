//! In-process backend.
//!
//! Mirrors the Redis semantics the registry relies on: hash writes keep an
//! existing lease, expired keys vanish on the next access, an empty set
//! stops existing, and publish reaches only current subscribers. Lease
//! clocks use `tokio::time::Instant`, so paused-time tests can advance them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use super::{BackendFuture, RegistryBackend, Subscription, glob_match};
use crate::error::{RegistryError, RegistryResult};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// Process-local backend, cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live subscription as if the connection had failed.
    pub async fn disconnect_subscribers(&self) {
        let mut channels = self.inner.channels.lock().await;
        let dropped = channels.len();
        channels.clear();
        debug!(channels = dropped, "memory backend subscribers disconnected");
    }
}

/// Remove `key` if its lease has run out.
fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        entries.remove(key);
    }
}

fn wrong_type(key: &str) -> RegistryError {
    RegistryError::Backend(format!(
        "WRONGTYPE operation against a key holding the wrong kind of value: {key}"
    ))
}

impl RegistryBackend for MemoryBackend {
    fn connect(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, key: &'a str, field: &'a str) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            match entries.get(key) {
                Some(Entry { value: Value::Hash(hash), .. }) => Ok(hash.get(field).cloned()),
                Some(_) => Err(wrong_type(key)),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, field: &'a str, value: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                Value::Set(_) => Err(wrong_type(key)),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            Ok(entries.remove(key).is_some())
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl_secs: u64) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<u64>> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            Ok(entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs()))
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            let now = Instant::now();
            entries.retain(|_, e| !e.is_expired(now));
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn members<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            match entries.get(key) {
                Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
                Some(_) => Err(wrong_type(key)),
                None => Ok(Vec::new()),
            }
        })
    }

    fn add_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => Ok(u64::from(set.insert(value.to_string()))),
                Value::Hash(_) => Err(wrong_type(key)),
            }
        })
    }

    fn remove_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let mut entries = self.inner.entries.lock().await;
            purge_expired(&mut entries, key);
            let (removed, now_empty) = match entries.get_mut(key) {
                Some(Entry { value: Value::Set(set), .. }) => {
                    let removed = set.remove(value);
                    (removed, set.is_empty())
                }
                Some(_) => return Err(wrong_type(key)),
                None => (false, false),
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(u64::from(removed))
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            let channels = self.inner.channels.lock().await;
            let receivers = channels
                .get(channel)
                .and_then(|tx| tx.send(message.to_string()).ok())
                .unwrap_or(0);
            Ok(receivers as u64)
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> BackendFuture<'a, Subscription> {
        Box::pin(async move {
            let mut broadcast_rx = {
                let mut channels = self.inner.channels.lock().await;
                channels
                    .entry(channel.to_string())
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                    .subscribe()
            };

            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let channel_name = channel.to_string();
            let task = tokio::spawn(async move {
                loop {
                    match broadcast_rx.recv().await {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(channel = %channel_name, skipped, "subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx
                                .send(Err(RegistryError::Connection(format!(
                                    "subscription to {channel_name} closed"
                                ))))
                                .await;
                            return;
                        }
                    }
                }
            });
            Ok(Subscription::new(rx, task))
        })
    }
}
