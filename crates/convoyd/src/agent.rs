//! Agent mode — converges this host on its pool's apps.
//!
//! In this mode, the daemon:
//! 1. Opens the registry backend and connects to the container engine
//! 2. Starts every app assigned to its pool that has a version deployed
//! 3. Restarts apps as their configs change (via the registry watch)
//! 4. Stops the containers of apps taken out of its pool
//! 5. Refreshes registrations and reaps superseded containers on an interval,
//!    in the background so a slow pass never delays a restart
//! 6. On Ctrl-C, stops the loop and the watch; leases lapse on their own

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use convoy_core::ServiceConfig;
use convoy_registry::{ConfigChange, ServiceRegistry};
use convoy_runtime::{DockerEngine, ReapReport, RuntimeResult, ServiceRuntime};

use crate::config::AgentConfig;

/// Buffered change events between the watch and the agent loop.
const CHANGE_BUFFER: usize = 64;

pub struct Agent {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<ServiceRuntime>,
    env: String,
    pool: String,
    register_interval: Duration,
    reap_cutoff: Duration,
}

impl Agent {
    pub fn new(registry: Arc<ServiceRegistry>, runtime: Arc<ServiceRuntime>, config: &AgentConfig) -> Self {
        Self {
            registry,
            runtime,
            env: config.env.clone(),
            pool: config.pool.clone(),
            register_interval: config.register_interval(),
            reap_cutoff: config.reap_cutoff(),
        }
    }

    async fn is_assigned(&self, app: &str) -> RuntimeResult<bool> {
        let pools = self.registry.list_assigned_pools(&self.env, app).await?;
        Ok(pools.iter().any(|p| *p == self.pool))
    }

    /// Run `config`'s current version, registering it if it was (re)started.
    pub async fn converge(&self, config: &ServiceConfig) -> RuntimeResult<bool> {
        if config.version().is_empty() {
            debug!(app = %config.name, "no version deployed; nothing to run");
            return Ok(false);
        }
        let (changed, container) = self.runtime.start_if_not_running(config).await?;
        if changed {
            self.registry
                .register_service(&self.env, &container, config)
                .await?;
        }
        Ok(changed)
    }

    /// Converge every app assigned to this pool. Returns how many started.
    ///
    /// Per-app failures are logged; only fatal errors abort.
    pub async fn converge_all(&self) -> RuntimeResult<usize> {
        let apps = self.registry.list_assignments(&self.env, &self.pool).await?;
        let mut started = 0;

        for app in apps {
            let Some(config) = self.registry.get_app(&app, &self.env).await? else {
                warn!(%app, env = %self.env, "assigned app has no config; skipping");
                continue;
            };
            match self.converge(&config).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(%app, error = %e, "unable to start app"),
            }
        }
        info!(pool = %self.pool, env = %self.env, started, "pool converged");
        Ok(started)
    }

    async fn handle_change(&self, change: ConfigChange) -> RuntimeResult<()> {
        let config = match change {
            ConfigChange::Changed(config) => config,
            ConfigChange::Error(e) => {
                warn!(error = %e, "change watch error");
                return Ok(());
            }
        };
        if config.environment != self.env {
            debug!(app = %config.name, env = %config.environment, "change for another env");
            return Ok(());
        }
        if !self.is_assigned(&config.name).await? {
            return self.retire(&config).await;
        }

        info!(app = %config.name, id = config.id(), "config changed");
        match self.converge(&config).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(app = %config.name, error = %e, "unable to restart app");
                Ok(())
            }
        }
    }

    /// Stop whatever still runs of an app this pool does not serve.
    async fn retire(&self, config: &ServiceConfig) -> RuntimeResult<()> {
        match self.runtime.stop_app(config).await {
            Ok(report) if report.is_empty() => {
                debug!(app = %config.name, "change not for this pool");
            }
            Ok(report) => log_stopped(&report, "app left this pool; containers stopped"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(app = %config.name, error = %e, "unable to stop unassigned app"),
        }
        Ok(())
    }

    /// Refresh registrations, then reap superseded containers and those of
    /// apps outside the pool.
    pub async fn housekeeping(&self) -> RuntimeResult<()> {
        housekeeping(&self.runtime, self.reap_cutoff).await
    }

    /// Drive the agent until `shutdown` fires or the watch ends.
    ///
    /// Housekeeping passes run in the background, one at a time; a tick
    /// that finds a pass still running is skipped.
    pub async fn run(
        self,
        mut changes: mpsc::Receiver<ConfigChange>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RuntimeResult<()> {
        let mut ticker = tokio::time::interval(self.register_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = JoinSet::new();

        let result = loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Some(change) => {
                        if let Err(e) = self.handle_change(change).await {
                            break Err(e);
                        }
                    }
                    None => {
                        warn!("change watch ended");
                        break Ok(());
                    }
                },
                _ = ticker.tick() => {
                    if passes.is_empty() {
                        let runtime = self.runtime.clone();
                        let cutoff = self.reap_cutoff;
                        passes.spawn(async move { housekeeping(&runtime, cutoff).await });
                    } else {
                        debug!("housekeeping pass still running; skipping tick");
                    }
                }
                Some(joined) = passes.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => error!(error = %e, "housekeeping pass panicked"),
                },
                _ = shutdown.changed() => {
                    info!("agent stopping");
                    break Ok(());
                }
            }
        };
        passes.shutdown().await;
        result
    }
}

/// One housekeeping pass. Only fatal errors are returned.
async fn housekeeping(runtime: &ServiceRuntime, reap_cutoff: Duration) -> RuntimeResult<()> {
    match runtime.register_running().await {
        Ok(registered) => debug!(count = registered.len(), "registrations refreshed"),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(error = %e, "unable to refresh registrations"),
    }

    match runtime.stop_all_but_latest(reap_cutoff).await {
        Ok(report) if !report.is_empty() => log_stopped(&report, "superseded containers reaped"),
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(error = %e, "reap pass failed"),
    }

    match runtime.stop_unassigned().await {
        Ok(report) if !report.is_empty() => log_stopped(&report, "unassigned apps stopped"),
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(error = %e, "unable to stop unassigned apps"),
    }
    Ok(())
}

fn log_stopped(report: &ReapReport, message: &str) {
    if !report.stopped.is_empty() {
        info!(count = report.stopped.len(), "{message}");
    }
    if !report.blacklisted.is_empty() {
        warn!(containers = ?report.blacklisted, "containers would not stop; blacklisted");
    }
    if !report.failed.is_empty() {
        warn!(containers = ?report.failed, "unable to stop containers; retrying next pass");
    }
}

/// Run the agent until Ctrl-C.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(env = %config.env, pool = %config.pool, host_ip = %config.host_ip, "convoy agent starting");

    // ── Registry ────────────────────────────────────────────────
    let backend = convoy_registry::backend::open(&config.registry_url).await?;
    let registry = Arc::new(
        ServiceRegistry::new(backend, &config.pool, &config.host_ip)
            .with_ttl(config.ttl)
            .with_poll_interval(config.poll_interval()),
    );
    info!(url = %config.registry_url, "registry opened");

    // ── Container engine + runtime ──────────────────────────────
    let engine = Arc::new(DockerEngine::connect(config.docker_endpoint.as_deref())?);
    let mut runtime = ServiceRuntime::new(engine, registry.clone(), &config.env, &config.ingress_host);
    if let Some(path) = &config.auth_file {
        runtime = runtime.with_auth_file(path.clone());
    }
    let runtime = Arc::new(runtime);

    // ── Shutdown signal + change watch ──────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (changes_tx, changes_rx) = mpsc::channel(CHANGE_BUFFER);
    let watch_handles = registry.watch(changes_tx, shutdown_rx.clone()).await?;

    let agent = Agent::new(registry, runtime, &config);
    agent.converge_all().await?;

    let mut agent_handle = tokio::spawn(agent.run(changes_rx, shutdown_rx));

    // The loop only ends on its own after a fatal error or a dead watch.
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
            None
        }
        result = &mut agent_handle => Some(result),
    };
    let _ = shutdown_tx.send(true);

    let result = match finished {
        Some(result) => result,
        None => agent_handle.await,
    };
    watch_handles.abort();
    result??;

    info!("convoy agent stopped");
    Ok(())
}
