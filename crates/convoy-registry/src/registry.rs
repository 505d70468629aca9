//! Service registry: apps, pools and their assignments.
//!
//! All records live in the backend under the key scheme in [`crate::paths`].
//! Every config write advances the config's version id and publishes a
//! change notification, so watchers on every host (this one included)
//! re-check their apps.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use convoy_core::{PORT_ENV_VAR, RuntimeOptions, ServiceConfig, VIRTUAL_HOST_ENV_VAR};

use crate::backend::RegistryBackend;
use crate::error::{RegistryError, RegistryResult};
use crate::paths::{self, CONFIG_FIELD, POOL_PLACEHOLDER};

/// Default registration lease, in seconds.
pub const DEFAULT_TTL: u64 = 60;

/// One row of the runtime listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEntry {
    pub env: String,
    pub app: String,
    pub pool: String,
    pub processes: u32,
    pub memory: String,
    pub virtual_hosts: String,
    pub port: String,
}

/// Registry client for one host in one pool.
pub struct ServiceRegistry {
    pub(crate) backend: Arc<dyn RegistryBackend>,
    pub(crate) pool: String,
    pub(crate) host_ip: String,
    /// Registration lease in seconds.
    pub(crate) ttl: u64,
    pub(crate) poll_interval: Duration,
    pub(crate) reconnect_backoff: Duration,
    pub(crate) poll_tx: mpsc::Sender<()>,
    /// Taken by the first `watch` call.
    pub(crate) poll_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("backend", &self.backend)
            .field("pool", &self.pool)
            .field("host_ip", &self.host_ip)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ServiceRegistry {
    /// Create a registry client for the host at `host_ip` in `pool`.
    pub fn new(backend: Arc<dyn RegistryBackend>, pool: &str, host_ip: &str) -> Self {
        // One pending trigger is enough: checks requested while one is
        // queued coalesce into it.
        let (poll_tx, poll_rx) = mpsc::channel(1);
        Self {
            backend,
            pool: pool.to_string(),
            host_ip: host_ip.to_string(),
            ttl: DEFAULT_TTL,
            poll_interval: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            poll_tx,
            poll_rx: Mutex::new(Some(poll_rx)),
        }
    }

    /// Set the registration lease in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = ttl_secs;
        self
    }

    /// Set the periodic change-check interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delay before the change subscriber reconnects.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub async fn app_exists(&self, app: &str, env: &str) -> RegistryResult<bool> {
        Ok(self
            .backend
            .get(&paths::app_key(env, app), CONFIG_FIELD)
            .await?
            .is_some())
    }

    /// Load an app's config. `None` if it does not exist.
    pub async fn get_app(&self, app: &str, env: &str) -> RegistryResult<Option<ServiceConfig>> {
        let key = paths::app_key(env, app);
        match self.backend.get(&key, CONFIG_FIELD).await? {
            Some(raw) => decode_config(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Create an empty config for `app`. False if it already exists.
    pub async fn create_app(&self, app: &str, env: &str) -> RegistryResult<bool> {
        paths::validate_name(app)?;
        paths::validate_name(env)?;

        if self.app_exists(app, env).await? {
            debug!(%app, %env, "app already exists");
            return Ok(false);
        }

        let mut config = ServiceConfig::new(app, env);
        self.update_app(&mut config, env).await?;
        info!(%app, %env, "app created");
        Ok(true)
    }

    /// Write `config`, advancing its version id, and notify watchers.
    pub async fn update_app(&self, config: &mut ServiceConfig, env: &str) -> RegistryResult<bool> {
        paths::validate_name(&config.name)?;
        paths::validate_name(env)?;

        let id = config.advance_id(Utc::now().timestamp_micros());
        let raw = serde_json::to_string(config)
            .map_err(|e| RegistryError::Serialize(format!("config {}: {e}", config.name)))?;
        self.backend
            .set(&paths::app_key(env, &config.name), CONFIG_FIELD, &raw)
            .await?;
        debug!(app = %config.name, %env, id, "app config written");

        self.notify_changed().await?;
        Ok(true)
    }

    /// Delete an app. False (and nothing deleted) while any pool runs it.
    pub async fn delete_app(&self, app: &str, env: &str) -> RegistryResult<bool> {
        let pools = self.list_assigned_pools(env, app).await?;
        if !pools.is_empty() {
            warn!(%app, %env, ?pools, "app is still assigned; not deleting");
            return Ok(false);
        }

        if self.backend.delete(&paths::app_key(env, app)).await? {
            info!(%app, %env, "app deleted");
            self.notify_changed().await?;
        }
        Ok(true)
    }

    /// Configs of every app in `env`. Undecodable records are skipped.
    pub async fn list_apps(&self, env: &str) -> RegistryResult<Vec<ServiceConfig>> {
        load_apps(self.backend.as_ref(), &paths::apps_pattern(env)).await
    }

    /// Configs of every app in every environment.
    pub async fn list_all_apps(&self) -> RegistryResult<Vec<ServiceConfig>> {
        load_apps(self.backend.as_ref(), &paths::envs_pattern()).await
    }

    /// Environments with at least one app.
    pub async fn list_envs(&self) -> RegistryResult<Vec<String>> {
        let keys = self.backend.keys(&paths::envs_pattern()).await?;
        let envs: BTreeSet<String> = keys
            .iter()
            .filter_map(|k| paths::parse_app_key(k))
            .map(|(env, _)| env.to_string())
            .collect();
        Ok(envs.into_iter().collect())
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub async fn pool_exists(&self, pool: &str, env: &str) -> RegistryResult<bool> {
        Ok(!self
            .backend
            .members(&paths::pool_key(env, pool))
            .await?
            .is_empty())
    }

    /// Create an empty pool. False if it already exists.
    pub async fn create_pool(&self, pool: &str, env: &str) -> RegistryResult<bool> {
        paths::validate_name(pool)?;
        paths::validate_name(env)?;

        let added = self
            .backend
            .add_member(&paths::pool_key(env, pool), POOL_PLACEHOLDER)
            .await?;
        if added == 0 {
            debug!(%pool, %env, "pool already exists");
            return Ok(false);
        }
        info!(%pool, %env, "pool created");
        Ok(true)
    }

    /// Delete a pool. False (and the pool left intact) while apps are assigned.
    pub async fn delete_pool(&self, pool: &str, env: &str) -> RegistryResult<bool> {
        let assigned = self.list_assignments(env, pool).await?;
        if !assigned.is_empty() {
            warn!(%pool, %env, apps = ?assigned, "pool has assigned apps; not deleting");
            return Ok(false);
        }

        if self.backend.delete(&paths::pool_key(env, pool)).await? {
            info!(%pool, %env, "pool deleted");
        }
        Ok(true)
    }

    pub async fn list_pools(&self, env: &str) -> RegistryResult<Vec<String>> {
        let keys = self.backend.keys(&paths::pools_pattern(env)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| paths::parse_pool_key(k))
            .map(str::to_string)
            .collect())
    }

    // ── Assignments ────────────────────────────────────────────────

    /// Assign `app` to `pool`. False if it was already assigned.
    pub async fn assign_app(&self, app: &str, env: &str, pool: &str) -> RegistryResult<bool> {
        if !self.app_exists(app, env).await? {
            return Err(RegistryError::AppNotFound(app.to_string()));
        }
        if !self.pool_exists(pool, env).await? {
            return Err(RegistryError::PoolNotFound(pool.to_string()));
        }

        let added = self
            .backend
            .add_member(&paths::pool_key(env, pool), app)
            .await?;
        if added == 0 {
            return Ok(false);
        }

        info!(%app, %env, %pool, "app assigned");
        self.notify_restart(app, env).await?;
        Ok(true)
    }

    /// Remove `app` from `pool`. False if it was not assigned.
    pub async fn unassign_app(&self, app: &str, env: &str, pool: &str) -> RegistryResult<bool> {
        let removed = self
            .backend
            .remove_member(&paths::pool_key(env, pool), app)
            .await?;
        if removed == 0 {
            return Ok(false);
        }

        info!(%app, %env, %pool, "app unassigned");
        self.notify_restart(app, env).await?;
        Ok(true)
    }

    /// Apps assigned to `pool`.
    pub async fn list_assignments(&self, env: &str, pool: &str) -> RegistryResult<Vec<String>> {
        let members = self.backend.members(&paths::pool_key(env, pool)).await?;
        Ok(members
            .into_iter()
            .filter(|m| m != POOL_PLACEHOLDER)
            .collect())
    }

    /// Pools `app` is assigned to.
    pub async fn list_assigned_pools(&self, env: &str, app: &str) -> RegistryResult<Vec<String>> {
        let mut assigned = Vec::new();
        for pool in self.list_pools(env).await? {
            if self
                .list_assignments(env, &pool)
                .await?
                .iter()
                .any(|a| a == app)
            {
                assigned.push(pool);
            }
        }
        Ok(assigned)
    }

    /// Bump an app's version id so every host restarts it.
    pub async fn notify_restart(&self, app: &str, env: &str) -> RegistryResult<()> {
        let mut config = self
            .get_app(app, env)
            .await?
            .ok_or_else(|| RegistryError::AppNotFound(app.to_string()))?;
        self.update_app(&mut config, env).await?;
        debug!(%app, %env, id = config.id(), "restart requested");
        Ok(())
    }

    // ── Runtime options and environment ────────────────────────────

    /// Apply per-pool runtime options. Writes only when something changed.
    pub async fn set_runtime_options(
        &self,
        app: &str,
        env: &str,
        pool: &str,
        options: &RuntimeOptions,
    ) -> RegistryResult<bool> {
        let mut config = self
            .get_app(app, env)
            .await?
            .ok_or_else(|| RegistryError::AppNotFound(app.to_string()))?;
        let mut changed = false;

        if options.processes != 0 && options.processes != config.processes(pool) {
            config.set_processes(pool, options.processes);
            changed = true;
        }

        if !options.memory.is_empty() && options.memory != config.memory(pool) {
            config.set_memory(pool, &options.memory);
            changed = true;
        }

        let mut vhosts = config.virtual_hosts();
        if !options.virtual_host.is_empty() && !vhosts.contains(&options.virtual_host) {
            vhosts.push(options.virtual_host.clone());
            config.env_set(VIRTUAL_HOST_ENV_VAR, &vhosts.join(","));
            changed = true;
        }

        if !options.port.is_empty() && config.env_get(PORT_ENV_VAR) != Some(options.port.as_str()) {
            config.env_set(PORT_ENV_VAR, &options.port);
            changed = true;
        }

        if !changed {
            return Ok(false);
        }
        self.update_app(&mut config, env).await?;
        info!(%app, %env, %pool, "runtime options updated");
        Ok(true)
    }

    /// Set one environment variable. False if it already had that value.
    pub async fn set_env_var(
        &self,
        app: &str,
        env: &str,
        key: &str,
        value: &str,
    ) -> RegistryResult<bool> {
        let mut config = self
            .get_app(app, env)
            .await?
            .ok_or_else(|| RegistryError::AppNotFound(app.to_string()))?;
        if config.env_get(key) == Some(value) {
            return Ok(false);
        }
        config.env_set(key, value);
        self.update_app(&mut config, env).await
    }

    /// Remove one environment variable. False if it was not set.
    pub async fn unset_env_var(&self, app: &str, env: &str, key: &str) -> RegistryResult<bool> {
        let mut config = self
            .get_app(app, env)
            .await?
            .ok_or_else(|| RegistryError::AppNotFound(app.to_string()))?;
        if !config.env_unset(key) {
            return Ok(false);
        }
        self.update_app(&mut config, env).await
    }

    /// Per-pool runtime settings, optionally filtered by env, app and pool.
    pub async fn list_runtime(
        &self,
        env: Option<&str>,
        app: Option<&str>,
        pool: Option<&str>,
    ) -> RegistryResult<Vec<RuntimeEntry>> {
        let envs = match env {
            Some(env) => vec![env.to_string()],
            None => self.list_envs().await?,
        };

        let mut rows = Vec::new();
        for env in envs {
            for config in self.list_apps(&env).await? {
                if app.is_some_and(|a| a != config.name) {
                    continue;
                }
                for p in config.runtime_pools() {
                    if pool.is_some_and(|want| want != p) {
                        continue;
                    }
                    rows.push(RuntimeEntry {
                        env: env.clone(),
                        app: config.name.clone(),
                        processes: config.processes(&p),
                        memory: config.memory(&p).to_string(),
                        virtual_hosts: config.env_get(VIRTUAL_HOST_ENV_VAR).unwrap_or_default().to_string(),
                        port: config.env_get(PORT_ENV_VAR).unwrap_or_default().to_string(),
                        pool: p,
                    });
                }
            }
        }
        Ok(rows)
    }
}

fn decode_config(key: &str, raw: &str) -> RegistryResult<ServiceConfig> {
    serde_json::from_str(raw).map_err(|e| RegistryError::Deserialize(format!("{key}: {e}")))
}

/// Load every config whose key matches `pattern`. Records that fail to
/// load or decode are logged and skipped.
pub(crate) async fn load_apps(
    backend: &dyn RegistryBackend,
    pattern: &str,
) -> RegistryResult<Vec<ServiceConfig>> {
    let keys = backend.keys(pattern).await?;
    let mut configs = Vec::with_capacity(keys.len());

    for key in keys {
        if paths::parse_app_key(&key).is_none() {
            continue;
        }
        let raw = match backend.get(&key, CONFIG_FIELD).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(%key, error = %e, "unable to load app config");
                continue;
            }
        };
        match decode_config(&key, &raw) {
            Ok(config) => configs.push(config),
            Err(e) => warn!(%key, error = %e, "unable to decode app config"),
        }
    }
    Ok(configs)
}
