//! ServiceConfig: desired state for one application in one environment.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static CONTAINER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<app>.+)_(?P<id>\d+)$").expect("valid container name regex"));

/// Per-pool runtime settings for an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PoolRuntime {
    /// Number of processes to run in the pool (0 = unset).
    #[serde(default)]
    pub processes: u32,
    /// Memory limit, e.g. "512m". Empty = unset.
    #[serde(default)]
    pub memory: String,
}

/// Operator-supplied runtime changes for one app in one pool.
///
/// Unset fields (`0` / empty) leave the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub processes: u32,
    pub memory: String,
    pub virtual_host: String,
    pub port: String,
}

/// Desired-state record for an application.
///
/// `id` is the version identifier: every write through the registry
/// advances it, and change detection compares identifiers only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceConfig {
    pub name: String,
    /// Environment this config belongs to.
    pub environment: String,
    /// Image to run (`registry/repository:tag`). Empty until first deploy.
    #[serde(default)]
    version: String,
    #[serde(default)]
    id: i64,
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Exposed container ports → protocol.
    #[serde(default)]
    ports: BTreeMap<String, String>,
    /// Pool name → runtime settings.
    #[serde(default)]
    runtime: BTreeMap<String, PoolRuntime>,
}

impl ServiceConfig {
    /// An empty config for `name` tagged with `environment`.
    pub fn new(name: &str, environment: &str) -> Self {
        Self {
            name: name.to_string(),
            environment: environment.to_string(),
            ..Self::default()
        }
    }

    /// The version identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Advance the version identifier.
    ///
    /// The new id is strictly greater than the old one and never behind
    /// `now` (microseconds since the epoch), so a deleted and recreated
    /// app never reuses an id a watcher has already seen.
    pub fn advance_id(&mut self, now: i64) -> i64 {
        self.id = (self.id + 1).max(now);
        self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    /// Environment variables with keys normalized to ASCII upper case.
    pub fn env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
            .collect()
    }

    /// Look up a variable case-insensitively.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Set a variable, replacing any case variant of the same key.
    pub fn env_set(&mut self, key: &str, value: &str) {
        self.env.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.env.insert(key.to_ascii_uppercase(), value.to_string());
    }

    /// Remove a variable. Returns true if anything was removed.
    pub fn env_unset(&mut self, key: &str) -> bool {
        let before = self.env.len();
        self.env.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.env.len() != before
    }

    /// Exposed container ports → protocol.
    pub fn ports(&self) -> &BTreeMap<String, String> {
        &self.ports
    }

    pub fn set_ports(&mut self, ports: BTreeMap<String, String>) {
        self.ports = ports;
    }

    /// Process count for `pool`, 0 if unset.
    pub fn processes(&self, pool: &str) -> u32 {
        self.runtime.get(pool).map_or(0, |r| r.processes)
    }

    pub fn set_processes(&mut self, pool: &str, processes: u32) {
        self.runtime.entry(pool.to_string()).or_default().processes = processes;
    }

    /// Memory limit for `pool`, empty if unset.
    pub fn memory(&self, pool: &str) -> &str {
        self.runtime.get(pool).map_or("", |r| r.memory.as_str())
    }

    pub fn set_memory(&mut self, pool: &str, memory: &str) {
        self.runtime.entry(pool.to_string()).or_default().memory = memory.to_string();
    }

    /// Pools with runtime settings recorded.
    pub fn runtime_pools(&self) -> Vec<String> {
        self.runtime.keys().cloned().collect()
    }

    /// Virtual hosts declared in `VIRTUAL_HOST`, trimmed, empties dropped.
    pub fn virtual_hosts(&self) -> Vec<String> {
        self.env_get(crate::VIRTUAL_HOST_ENV_VAR)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the container running the current version.
    pub fn container_name(&self) -> String {
        format!("{}_{}", self.name, self.id)
    }

    /// True if `container_name` belongs to this app, whatever its version.
    pub fn is_container_version(&self, container_name: &str) -> bool {
        matches!(parse_container_name(container_name), Some((app, _)) if app == self.name)
    }

    /// True if `container_name` is this app's container for the current version.
    ///
    /// Names that do not follow the `<app>_<id>` pattern never match.
    pub fn is_current_container(&self, container_name: &str) -> bool {
        matches!(
            parse_container_name(container_name),
            Some((app, id)) if app == self.name && id == self.id
        )
    }
}

/// Split a managed container name into `(app, version id)`.
///
/// A leading `/` (as reported by the engine) is ignored.
pub fn parse_container_name(name: &str) -> Option<(&str, i64)> {
    let name = name.trim_start_matches('/');
    let caps = CONTAINER_NAME.captures(name)?;
    let app = caps.name("app")?.as_str();
    let id = caps.name("id")?.as_str().parse().ok()?;
    Some((app, id))
}
