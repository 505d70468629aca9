//! convoy-registry — lease-based service registry for Convoy.
//!
//! Stores app configs, pool membership and container registrations in a
//! shared backend, and watches it for config changes.
//!
//! # Architecture
//!
//! The registry speaks only to the [`RegistryBackend`] contract: hash
//! fields, expiring keys, glob scans, sets and pub/sub. [`backend::open`]
//! picks the implementation from the URL scheme (`redis://`, `memory://`).
//!
//! Registrations are written with a TTL and disappear unless refreshed.
//! Config writes advance the config's version id and publish `config` on
//! the `convoy` channel; [`ServiceRegistry::watch`] turns those
//! notifications, plus a periodic ticker, into [`ConfigChange`] events.

pub mod backend;
pub mod error;
pub mod notify;
pub mod paths;
pub mod registration;
pub mod registry;

pub use backend::{MemoryBackend, RedisBackend, RegistryBackend, Subscription};
pub use error::{RegistryError, RegistryResult};
pub use notify::{ChangeDetector, ConfigChange, WatchHandles};
pub use registry::{DEFAULT_TTL, RuntimeEntry, ServiceRegistry};
