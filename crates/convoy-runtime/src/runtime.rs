//! Service runtime. Converges this host's containers on the registry's
//! desired versions.
//!
//! Containers are named `<app>_<version id>`, so whether the current version
//! runs is a single inspect by name. Superseded containers are reaped by
//! [`ServiceRuntime::stop_all_but_latest`]; a container that does not stop
//! within the stop bound is blacklisted for the life of the runtime and
//! never targeted again.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use convoy_core::{
    APP_ENV_VAR, ContainerInfo, ContainerSummary, ImageInfo, ImageRef, ServiceConfig,
    ServiceRegistration, parse_container_name,
};
use convoy_registry::{RegistryError, ServiceRegistry};

use crate::auth::{AuthConfig, AuthFormat};
use crate::engine::{ContainerEngine, CreateSpec};
use crate::error::{RuntimeError, RuntimeResult};

/// Bounded waits around engine calls that can hang.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTimings {
    /// Grace the engine gives a container before killing it.
    pub stop_grace: Duration,
    /// Overall bound on a stop call; exceeding it blacklists the container.
    pub stop_timeout: Duration,
    /// Inspections after start that must all find the container running.
    pub start_checks: u32,
    pub start_check_interval: Duration,
}

impl Default for RuntimeTimings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(20),
            start_checks: 5,
            start_check_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one reap pass, by container id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stopped and removed.
    pub stopped: Vec<String>,
    /// Timed out on stop in this pass; now blacklisted.
    pub blacklisted: Vec<String>,
    /// Stop failed; left running for the next pass.
    pub failed: Vec<String>,
    /// Eligible but already blacklisted.
    pub skipped: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
            && self.blacklisted.is_empty()
            && self.failed.is_empty()
            && self.skipped.is_empty()
    }

    fn absorb(&mut self, other: ReapReport) {
        self.stopped.extend(other.stopped);
        self.blacklisted.extend(other.blacklisted);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }
}

pub struct ServiceRuntime {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ServiceRegistry>,
    env: String,
    /// Address other apps are reachable at from inside a container.
    ingress_host: String,
    timings: RuntimeTimings,
    auth_path: Option<PathBuf>,
    auth: OnceCell<AuthConfig>,
    /// Held for a whole reap pass.
    blacklist: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("engine", &self.engine)
            .field("env", &self.env)
            .field("ingress_host", &self.ingress_host)
            .field("timings", &self.timings)
            .finish()
    }
}

impl ServiceRuntime {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ServiceRegistry>,
        env: &str,
        ingress_host: &str,
    ) -> Self {
        Self {
            engine,
            registry,
            env: env.to_string(),
            ingress_host: ingress_host.to_string(),
            timings: RuntimeTimings::default(),
            auth_path: None,
            auth: OnceCell::new(),
            blacklist: Mutex::new(HashSet::new()),
        }
    }

    /// Override the start/stop waits.
    pub fn with_timings(mut self, timings: RuntimeTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Read registry credentials from `path` (a `config.json`) instead of
    /// the default locations.
    pub fn with_auth_file(mut self, path: PathBuf) -> Self {
        self.auth_path = Some(path);
        self
    }

    /// Use already-loaded registry credentials.
    pub fn with_auth_config(mut self, auth: AuthConfig) -> Self {
        self.auth = OnceCell::from(auth);
        self
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    async fn credentials(&self) -> RuntimeResult<&AuthConfig> {
        self.auth
            .get_or_try_init(|| async {
                match &self.auth_path {
                    Some(path) => AuthConfig::load_file(path, AuthFormat::Config).await,
                    None => AuthConfig::load_default().await,
                }
            })
            .await
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Make `version` available locally, pulling it if needed.
    ///
    /// Credentials are only looked up for images on a non-default registry.
    pub async fn pull_image(&self, version: &str) -> RuntimeResult<ImageInfo> {
        if let Some(image) = self.engine.inspect_image(version).await? {
            return Ok(image);
        }

        let image = ImageRef::parse(version)?;
        let credentials = match &image.registry {
            Some(registry) => self.credentials().await?.resolve(registry).cloned(),
            None => None,
        };

        self.engine.pull_image(&image, credentials.as_ref()).await?;
        self.engine
            .inspect_image(version)
            .await?
            .ok_or_else(|| RuntimeError::ImageNotFound(version.to_string()))
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Start `config`'s current version, creating its container if absent.
    ///
    /// Fails with `StoppedUnexpectedly` if any post-start inspection finds
    /// the container not running.
    pub async fn start(&self, config: &ServiceConfig) -> RuntimeResult<ContainerInfo> {
        if config.version().is_empty() {
            return Err(RuntimeError::NoVersion(config.name.clone()));
        }
        self.pull_image(config.version()).await?;

        let apps = self.registry.list_apps(&self.env).await?;
        let name = config.container_name();

        let id = match self.engine.inspect_container(&name).await? {
            Some(existing) => existing.id,
            None => {
                let spec = CreateSpec {
                    name: Some(name.clone()),
                    image: config.version().to_string(),
                    env: container_env(config, &apps, &self.ingress_host),
                    publish_all_ports: true,
                    ..CreateSpec::default()
                };
                let id = self.engine.create_container(&spec).await?;
                info!(app = %config.name, container = %name, image = %config.version(), "container created");
                id
            }
        };

        self.engine.start_container(&id).await?;

        let mut observed = None;
        for _ in 0..self.timings.start_checks.max(1) {
            match self.engine.inspect_container(&id).await? {
                Some(container) if container.running => observed = Some(container),
                _ => {
                    warn!(app = %config.name, container = %name, "container stopped after start");
                    return Err(RuntimeError::StoppedUnexpectedly(name));
                }
            }
            tokio::time::sleep(self.timings.start_check_interval).await;
        }

        info!(app = %config.name, container = %name, "container started");
        observed.ok_or(RuntimeError::StoppedUnexpectedly(name))
    }

    /// Start `config`'s current version unless it is already running.
    ///
    /// Returns whether anything was started, and the running container.
    pub async fn start_if_not_running(
        &self,
        config: &ServiceConfig,
    ) -> RuntimeResult<(bool, ContainerInfo)> {
        match self.engine.inspect_container(&config.container_name()).await? {
            Some(container) if container.running && config.is_current_container(&container.name) => {
                debug!(app = %config.name, container = %container.name, "current version running");
                Ok((false, container))
            }
            Some(container) => {
                debug!(
                    app = %config.name,
                    container = %container.name,
                    running = container.running,
                    "container needs (re)start"
                );
                Ok((true, self.start(config).await?))
            }
            None => Ok((true, self.start(config).await?)),
        }
    }

    // ── Reaping ────────────────────────────────────────────────────

    /// Stop and remove superseded containers older than `cutoff`.
    ///
    /// Per app, the latest container is the one with the current name; apps
    /// without a latest container are skipped so the old version keeps
    /// serving. Reap passes are serialized.
    pub async fn stop_all_but_latest(&self, cutoff: Duration) -> RuntimeResult<ReapReport> {
        let mut blacklist = self.blacklist.lock().await;
        let mut report = ReapReport::default();

        let apps = self.registry.list_apps(&self.env).await?;
        let containers = self.engine.list_containers().await?;
        let created_before = Utc::now().timestamp() - i64::try_from(cutoff.as_secs()).unwrap_or(i64::MAX);
        let mut handled = HashSet::new();

        for config in &apps {
            if config.version().is_empty() {
                continue;
            }
            let image = match ImageRef::parse(config.version()) {
                Ok(image) => image,
                Err(e) => {
                    warn!(app = %config.name, error = %e, "unparseable version; not reaping");
                    continue;
                }
            };
            let Some(latest) = self.engine.inspect_container(&config.container_name()).await? else {
                debug!(app = %config.name, "latest container missing; leaving old ones");
                continue;
            };

            for container in &containers {
                let Some(name) = container.name() else { continue };
                if container.id == latest.id
                    || container.created >= created_before
                    || handled.contains(&container.id)
                    || !reap_candidate(name, config, &apps)
                {
                    continue;
                }
                match ImageRef::parse(&container.image) {
                    Ok(running) if running.same_repository(&image) => {}
                    _ => continue,
                }
                handled.insert(container.id.clone());

                if blacklist.contains(&container.id) {
                    debug!(container = %container.id, "blacklisted; not stopping");
                    report.skipped.push(container.id.clone());
                    continue;
                }

                info!(app = %config.name, image = %container.image, container = %name, "stopping superseded container");
                self.stop_and_remove(&container.id, &mut blacklist, &mut report)
                    .await;
            }
        }
        Ok(report)
    }

    /// Stop `id` within the stop bound, then remove it.
    ///
    /// A stop that times out blacklists the container.
    async fn stop_and_remove(&self, id: &str, blacklist: &mut HashSet<String>, report: &mut ReapReport) {
        let stop = self.engine.stop_container(id, self.timings.stop_grace);
        match tokio::time::timeout(self.timings.stop_timeout, stop).await {
            Err(_) => {
                error!(container = %id, "timed out stopping container; blacklisting");
                blacklist.insert(id.to_string());
                report.blacklisted.push(id.to_string());
            }
            Ok(Err(e)) => {
                error!(container = %id, error = %e, "unable to stop container");
                report.failed.push(id.to_string());
            }
            Ok(Ok(())) => {
                if let Err(e) = self.engine.remove_container(id, true).await {
                    warn!(container = %id, error = %e, "unable to remove stopped container");
                }
                report.stopped.push(id.to_string());
            }
        }
    }

    /// Stop every running container of `config`'s app, whatever its
    /// version, dropping this host's registration first.
    pub async fn stop_app(&self, config: &ServiceConfig) -> RuntimeResult<ReapReport> {
        let containers = self.engine.list_containers().await?;
        self.retire(config, app_containers(&containers, config)).await
    }

    /// Stop the containers of every app in the environment that is not
    /// assigned to this host's pool.
    pub async fn stop_unassigned(&self) -> RuntimeResult<ReapReport> {
        let assigned = self.assigned_apps().await?;
        let apps = self.registry.list_apps(&self.env).await?;
        let containers = self.engine.list_containers().await?;
        let mut report = ReapReport::default();

        for config in apps.iter().filter(|a| !assigned.contains(&a.name)) {
            let targets = app_containers(&containers, config);
            if targets.is_empty() {
                continue;
            }
            info!(app = %config.name, pool = %self.registry.pool(), count = targets.len(), "app not assigned to this pool; stopping");
            report.absorb(self.retire(config, targets).await?);
        }
        Ok(report)
    }

    async fn retire(&self, config: &ServiceConfig, targets: Vec<&ContainerSummary>) -> RuntimeResult<ReapReport> {
        let mut blacklist = self.blacklist.lock().await;
        let mut report = ReapReport::default();

        for summary in targets {
            if blacklist.contains(&summary.id) {
                debug!(container = %summary.id, "blacklisted; not stopping");
                report.skipped.push(summary.id.clone());
                continue;
            }
            match self.engine.inspect_container(&summary.id).await {
                Ok(Some(container)) => {
                    if let Err(e) = self
                        .registry
                        .unregister_service(&self.env, &container, config)
                        .await
                    {
                        warn!(app = %config.name, container = %container.short_id(), error = %e, "unable to unregister");
                    }
                }
                Ok(None) => continue,
                Err(e) => warn!(container = %summary.id, error = %e, "unable to inspect container"),
            }
            info!(app = %config.name, image = %summary.image, container = ?summary.name(), "stopping container");
            self.stop_and_remove(&summary.id, &mut blacklist, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn assigned_apps(&self) -> RuntimeResult<HashSet<String>> {
        let apps = self
            .registry
            .list_assignments(&self.env, self.registry.pool())
            .await?;
        Ok(apps.into_iter().collect())
    }

    pub async fn is_blacklisted(&self, container_id: &str) -> bool {
        self.blacklist.lock().await.contains(container_id)
    }

    /// Blacklisted container ids, sorted.
    pub async fn blacklisted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.blacklist.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    // ── Deploy and registration ───────────────────────────────────

    /// Point `app` at image `version`, recording the image's exposed ports.
    ///
    /// False if the app already runs that version with the same ports.
    pub async fn deploy(&self, app: &str, version: &str) -> RuntimeResult<bool> {
        let mut config = self
            .registry
            .get_app(app, &self.env)
            .await?
            .ok_or_else(|| RegistryError::AppNotFound(app.to_string()))?;

        let image = self.pull_image(version).await?;
        let ports = image.port_map();
        if config.version() == version && config.ports() == &ports {
            return Ok(false);
        }

        config.set_version(version);
        config.set_ports(ports);
        self.registry.update_app(&mut config, &self.env).await?;
        info!(%app, %version, id = config.id(), "app deployed");
        Ok(true)
    }

    /// Register (or refresh) every running container of a current version
    /// of an app assigned to this host's pool. Failures are logged and
    /// skipped.
    pub async fn register_running(&self) -> RuntimeResult<Vec<ServiceRegistration>> {
        let assigned = self.assigned_apps().await?;
        let mut apps = self.registry.list_apps(&self.env).await?;
        apps.retain(|a| assigned.contains(&a.name));
        let containers = self.engine.list_containers().await?;
        let mut registered = Vec::new();

        for summary in containers {
            let Some(name) = summary.name() else { continue };
            let Some(config) = apps.iter().find(|a| a.is_current_container(name)) else {
                continue;
            };

            let container = match self.engine.inspect_container(&summary.id).await {
                Ok(Some(container)) => container,
                Ok(None) => continue,
                Err(e) => {
                    warn!(container = %summary.id, error = %e, "unable to inspect container; skipping");
                    continue;
                }
            };

            match self
                .registry
                .register_service(&self.env, &container, config)
                .await
            {
                Ok(registration) => registered.push(registration),
                Err(e) => warn!(app = %config.name, container = %container.short_id(), error = %e, "unable to register"),
            }
        }
        debug!(count = registered.len(), "registrations refreshed");
        Ok(registered)
    }

    /// Remove this host's registration of `config`'s current container.
    pub async fn unregister(&self, config: &ServiceConfig) -> RuntimeResult<Option<ServiceRegistration>> {
        let Some(container) = self.engine.inspect_container(&config.container_name()).await? else {
            return Ok(None);
        };
        Ok(self
            .registry
            .unregister_service(&self.env, &container, config)
            .await?)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub(crate) fn ingress_host(&self) -> &str {
        &self.ingress_host
    }
}

/// Whether a running container named `name` may be reaped on behalf of
/// `config`.
///
/// Containers of this app qualify; containers named for another known app
/// never do. Names outside the `<app>_<id>` scheme qualify, leaving the
/// image-repository check to decide.
fn reap_candidate(name: &str, config: &ServiceConfig, apps: &[ServiceConfig]) -> bool {
    match parse_container_name(name) {
        Some((app, _)) if app == config.name => true,
        Some((app, _)) => !apps.iter().any(|a| a.name == app),
        None => true,
    }
}

/// Running containers named for `config`'s app, any version.
fn app_containers<'a>(containers: &'a [ContainerSummary], config: &ServiceConfig) -> Vec<&'a ContainerSummary> {
    containers
        .iter()
        .filter(|c| c.name().is_some_and(|name| config.is_container_version(name)))
        .collect()
}

/// `<APP>_ADDR_<port>=<ingress>:<port>` for every exposed port of every app
/// other than `current`.
pub fn discovery_env(apps: &[ServiceConfig], current: &str, ingress_host: &str) -> Vec<String> {
    apps.iter()
        .filter(|app| app.name != current)
        .flat_map(|app| {
            let prefix = app.name.to_uppercase().replace('-', "_");
            app.ports()
                .keys()
                .map(move |port| format!("{prefix}_ADDR_{port}={ingress_host}:{port}"))
        })
        .collect()
}

/// Full environment for a service container.
pub fn container_env(config: &ServiceConfig, apps: &[ServiceConfig], ingress_host: &str) -> Vec<String> {
    let mut env: Vec<String> = config
        .env()
        .into_iter()
        .filter(|(key, _)| key != APP_ENV_VAR)
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    env.push(format!("{APP_ENV_VAR}={}", config.name));
    env.extend(discovery_env(apps, &config.name, ingress_host));
    env
}
