//! Backend contract: the storage the registry runs on.
//!
//! The registry needs key/field storage with expiring keys, glob key
//! enumeration, set membership and a publish/subscribe primitive. Anything
//! providing those can back it; the implementation is picked from the
//! registry URL scheme by [`open`].
//!
//! | Scheme | Implementation |
//! |---|---|
//! | `redis://`, `rediss://` | [`RedisBackend`] |
//! | `memory://` | [`MemoryBackend`] (process-local) |

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};

pub mod memory;
pub mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = RegistryResult<T>> + Send + 'a>>;

/// Key/field store with leases, set membership and pub/sub.
pub trait RegistryBackend: Send + Sync + fmt::Debug {
    /// Liveness check against the backend.
    fn connect(&self) -> BackendFuture<'_, ()>;

    /// Read one field of a hash key.
    fn get<'a>(&'a self, key: &'a str, field: &'a str) -> BackendFuture<'a, Option<String>>;

    /// Write one field of a hash key. An existing lease is kept.
    fn set<'a>(&'a self, key: &'a str, field: &'a str, value: &'a str) -> BackendFuture<'a, ()>;

    /// Delete a key. Returns true if it existed.
    fn delete<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool>;

    /// Attach a lease. Returns false if the key does not exist.
    fn expire<'a>(&'a self, key: &'a str, ttl_secs: u64) -> BackendFuture<'a, bool>;

    /// Seconds left on a key's lease; `None` if missing or not leased.
    fn ttl<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<u64>>;

    /// Keys matching a glob pattern (`*`, `?`, `[...]`; `*` spans `/`).
    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>>;

    /// Members of a set key.
    fn members<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Vec<String>>;

    /// Add to a set. Returns the number of members added.
    fn add_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64>;

    /// Remove from a set. Returns the number of members removed.
    fn remove_member<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, u64>;

    /// Publish a message. Returns the number of receivers.
    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> BackendFuture<'a, u64>;

    /// Subscribe to a channel.
    fn subscribe<'a>(&'a self, channel: &'a str) -> BackendFuture<'a, Subscription>;
}

/// A live channel subscription.
///
/// Messages are forwarded by a receive task owned by the subscription. A
/// connection failure is delivered as one `Err` item, after which the
/// stream ends; the receive task is aborted when the subscription drops.
pub struct Subscription {
    rx: mpsc::Receiver<RegistryResult<String>>,
    receiver_task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<RegistryResult<String>>, receiver_task: JoinHandle<()>) -> Self {
        Self {
            rx,
            receiver_task: Some(receiver_task),
        }
    }

    /// Next payload. `None` once the subscription has ended.
    pub async fn next_message(&mut self) -> Option<RegistryResult<String>> {
        self.rx.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
    }
}

/// Open the backend named by `url`'s scheme.
pub async fn open(url: &str) -> RegistryResult<Arc<dyn RegistryBackend>> {
    let (scheme, _) = url.split_once("://").ok_or_else(|| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: "missing scheme".to_string(),
    })?;

    let backend: Arc<dyn RegistryBackend> = match scheme.to_ascii_lowercase().as_str() {
        "redis" | "rediss" => Arc::new(RedisBackend::open(url).await?),
        "memory" => Arc::new(MemoryBackend::new()),
        other => return Err(RegistryError::UnsupportedBackend(other.to_string())),
    };
    debug!(%scheme, "registry backend opened");
    Ok(backend)
}

/// Redis-style glob match: `*`, `?`, `[abc]`, `[^a]`, `[a-z]`, `\x`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point: (pattern index after `*`, text index it matched up to).
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = match p.get(pi) {
            Some('*') => {
                star = Some((pi + 1, ti));
                pi += 1;
                continue;
            }
            Some('?') => Some(1),
            Some('[') => match_class(&p[pi..], t[ti]),
            Some('\\') if pi + 1 < p.len() => (p[pi + 1] == t[ti]).then_some(2),
            Some(&c) => (c == t[ti]).then_some(1),
            None => None,
        };

        match step {
            Some(width) => {
                pi += width;
                ti += 1;
            }
            None => match star {
                Some((star_pi, star_ti)) => {
                    pi = star_pi;
                    ti = star_ti + 1;
                    star = Some((star_pi, star_ti + 1));
                }
                None => return false,
            },
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against a `[...]` class at the start of `p`.
/// Returns the class width in pattern chars when it matches.
fn match_class(p: &[char], c: char) -> Option<usize> {
    let mut i = 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }
    if i >= p.len() {
        // Unterminated class: treat `[` literally.
        return (c == '[').then_some(1);
    }
    (matched != negate).then_some(i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_spans_separators() {
        assert!(glob_match("prod/*/environment", "prod/api/environment"));
        assert!(glob_match("prod/*/environment", "prod/a/b/environment"));
        assert!(!glob_match("prod/*/environment", "staging/api/environment"));
        assert!(glob_match("*", ""));
        assert!(glob_match("prod/*/hosts/*/*", "prod/web/hosts/10.0.0.1/api"));
    }

    #[test]
    fn glob_question_and_classes() {
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("v[0-9]", "v7"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
    }

    #[test]
    fn glob_trailing_literal_after_star() {
        assert!(glob_match("*pools*", "prod/pools/web"));
        assert!(!glob_match("*.json", "config.toml"));
    }

    #[tokio::test]
    async fn open_selects_backend_by_scheme() {
        assert!(open("memory://").await.is_ok());

        let err = open("etcd://localhost:2379").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedBackend(ref s) if s == "etcd"));
        assert!(err.is_fatal());

        let err = open("localhost:6379").await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidUrl { .. }));
    }
}
