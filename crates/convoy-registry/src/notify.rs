//! Change watch.
//!
//! Three background tasks feed one stream of [`ConfigChange`]s:
//! - the poll loop, which compares every app's version id against the last
//!   one it saw whenever a check is requested;
//! - a ticker requesting a check every poll interval;
//! - a subscriber requesting a check whenever `config` is published on the
//!   change channel, reconnecting after a fixed backoff when the backend
//!   drops it.
//!
//! Check requests share a one-slot channel, so a burst of them collapses
//! into a single pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use convoy_core::ServiceConfig;

use crate::backend::RegistryBackend;
use crate::error::{RegistryError, RegistryResult};
use crate::paths::{self, CHANGE_CHANNEL, CHANGE_PAYLOAD};
use crate::registry::{ServiceRegistry, load_apps};

/// One event from the change watch.
#[derive(Debug)]
pub enum ConfigChange {
    /// An app's version id moved; carries the new config.
    Changed(ServiceConfig),
    /// Listing apps failed; the watch keeps running.
    Error(RegistryError),
}

/// Join handles of the watch tasks.
#[derive(Debug)]
pub struct WatchHandles {
    pub poll: JoinHandle<()>,
    pub ticker: JoinHandle<()>,
    pub subscriber: JoinHandle<()>,
}

impl WatchHandles {
    /// Abort every watch task.
    pub fn abort(&self) {
        self.poll.abort();
        self.ticker.abort();
        self.subscriber.abort();
    }
}

/// Tracks the last version id seen per app.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last_version: HashMap<(String, String), i64>,
}

impl ChangeDetector {
    /// Record current ids without reporting anything.
    pub fn seed(&mut self, configs: &[ServiceConfig]) {
        for config in configs {
            self.last_version
                .insert((config.environment.clone(), config.name.clone()), config.id());
        }
    }

    /// Configs whose id differs from the last one seen, in listing order.
    pub fn diff(&mut self, configs: Vec<ServiceConfig>) -> Vec<ServiceConfig> {
        configs
            .into_iter()
            .filter(|config| {
                let key = (config.environment.clone(), config.name.clone());
                let id = config.id();
                self.last_version.insert(key, id) != Some(id)
            })
            .collect()
    }
}

impl ServiceRegistry {
    /// Ask the poll loop for an immediate check.
    ///
    /// Never blocks; a request made while another is pending is merged
    /// into it.
    pub fn check_for_changes_now(&self) {
        request_check(&self.poll_tx);
    }

    /// Publish a change notification to every watcher.
    pub async fn notify_changed(&self) -> RegistryResult<()> {
        let receivers = self.backend.publish(CHANGE_CHANNEL, CHANGE_PAYLOAD).await?;
        debug!(receivers, "change notification published");
        Ok(())
    }

    /// Start the change watch, delivering events to `changes`.
    ///
    /// Every app's current id is recorded before this returns, so any write
    /// made afterwards is reported. `stop` halts the ticker; the poll loop
    /// ends once `changes` is closed, and the subscriber runs until
    /// aborted. Only one watch may run per registry.
    pub async fn watch(
        &self,
        changes: mpsc::Sender<ConfigChange>,
        stop: watch::Receiver<bool>,
    ) -> RegistryResult<WatchHandles> {
        let mut poll_slot = self.poll_rx.lock().await;
        if poll_slot.is_none() {
            return Err(RegistryError::AlreadyWatching);
        }

        let configs = load_apps(self.backend.as_ref(), &paths::envs_pattern()).await?;
        let mut detector = ChangeDetector::default();
        detector.seed(&configs);
        debug!(apps = configs.len(), "change watch seeded");

        let poll_rx = poll_slot.take().ok_or(RegistryError::AlreadyWatching)?;
        drop(poll_slot);

        let poll = tokio::spawn(poll_loop(self.backend.clone(), detector, poll_rx, changes));
        let ticker = tokio::spawn(tick_loop(self.poll_tx.clone(), self.poll_interval, stop));
        let subscriber = tokio::spawn(subscribe_loop(
            self.backend.clone(),
            self.poll_tx.clone(),
            self.reconnect_backoff,
        ));

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            channel = CHANGE_CHANNEL,
            "change watch started"
        );
        Ok(WatchHandles {
            poll,
            ticker,
            subscriber,
        })
    }
}

fn request_check(poll_tx: &mpsc::Sender<()>) {
    match poll_tx.try_send(()) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
        Err(mpsc::error::TrySendError::Closed(())) => debug!("change watch not running"),
    }
}

async fn poll_loop(
    backend: Arc<dyn RegistryBackend>,
    mut detector: ChangeDetector,
    mut poll_rx: mpsc::Receiver<()>,
    changes: mpsc::Sender<ConfigChange>,
) {
    let pattern = paths::envs_pattern();

    while poll_rx.recv().await.is_some() {
        let event_batch = match load_apps(backend.as_ref(), &pattern).await {
            Ok(configs) => detector
                .diff(configs)
                .into_iter()
                .map(ConfigChange::Changed)
                .collect(),
            Err(e) => {
                warn!(error = %e, "change check failed");
                vec![ConfigChange::Error(e)]
            }
        };

        for event in event_batch {
            if let ConfigChange::Changed(config) = &event {
                info!(app = %config.name, env = %config.environment, id = config.id(), "config changed");
            }
            if changes.send(event).await.is_err() {
                debug!("change receiver dropped; poll loop exiting");
                return;
            }
        }
    }
}

/// Request a check every `every` until `stop` turns true.
///
/// A dropped stop sender leaves the ticker running until aborted.
async fn tick_loop(poll_tx: mpsc::Sender<()>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut stoppable = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => request_check(&poll_tx),
            changed = stop.changed(), if stoppable => match changed {
                Ok(()) if *stop.borrow() => {
                    debug!("change ticker stopping");
                    return;
                }
                Ok(()) => {}
                Err(_) => {
                    debug!("stop signal dropped; change ticker keeps running");
                    stoppable = false;
                }
            },
        }
    }
}

async fn subscribe_loop(
    backend: Arc<dyn RegistryBackend>,
    poll_tx: mpsc::Sender<()>,
    backoff: Duration,
) {
    loop {
        if let Err(e) = backend.connect().await {
            warn!(error = %e, "registry unreachable; retrying");
            tokio::time::sleep(backoff).await;
            continue;
        }

        let mut subscription = match backend.subscribe(CHANGE_CHANNEL).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, channel = CHANGE_CHANNEL, "subscribe failed; retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        info!(channel = CHANGE_CHANNEL, "monitoring for config changes");

        while let Some(message) = subscription.next_message().await {
            match message {
                Ok(payload) if payload == CHANGE_PAYLOAD => {
                    debug!("config change notification received");
                    request_check(&poll_tx);
                }
                Ok(payload) => debug!(%payload, "ignoring notification"),
                Err(e) => {
                    warn!(error = %e, "change subscription failed");
                    break;
                }
            }
        }

        drop(subscription);
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(env: &str, name: &str, id: i64) -> ServiceConfig {
        let mut cfg = ServiceConfig::new(name, env);
        cfg.advance_id(id);
        cfg
    }

    #[test]
    fn detector_reports_only_moved_ids() {
        let mut detector = ChangeDetector::default();
        detector.seed(&[config("prod", "api", 10), config("prod", "web", 20)]);

        assert!(detector
            .diff(vec![config("prod", "api", 10), config("prod", "web", 20)])
            .is_empty());

        let changed = detector.diff(vec![config("prod", "api", 11), config("prod", "web", 20)]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "api");

        // Same id again: reported once only.
        assert!(detector.diff(vec![config("prod", "api", 11)]).is_empty());
    }

    #[test]
    fn detector_reports_new_apps_and_scopes_by_env() {
        let mut detector = ChangeDetector::default();
        detector.seed(&[config("prod", "api", 10)]);

        let changed = detector.diff(vec![config("prod", "api", 10), config("staging", "api", 10)]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].environment, "staging");
    }

    #[tokio::test]
    async fn check_requests_coalesce() {
        let reg = ServiceRegistry::new(
            Arc::new(crate::backend::MemoryBackend::new()),
            "web",
            "10.0.0.1",
        );
        reg.check_for_changes_now();
        reg.check_for_changes_now();
        reg.check_for_changes_now();

        let mut rx = reg.poll_rx.lock().await.take().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_watch_is_rejected() {
        let reg = ServiceRegistry::new(
            Arc::new(crate::backend::MemoryBackend::new()),
            "web",
            "10.0.0.1",
        );
        let (tx, _rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handles = reg.watch(tx.clone(), stop_rx.clone()).await.unwrap();
        let err = reg.watch(tx, stop_rx).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyWatching));
        handles.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_outlives_a_dropped_stop_sender() {
        let (poll_tx, mut poll_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = tokio::spawn(tick_loop(poll_tx, Duration::from_secs(10), stop_rx));
        drop(stop_tx);

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(11), poll_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!ticker.is_finished());
        ticker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_ignores_a_false_stop_value() {
        let (poll_tx, mut poll_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = tokio::spawn(tick_loop(poll_tx, Duration::from_secs(10), stop_rx));

        stop_tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(11), poll_rx.recv())
            .await
            .unwrap()
            .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), ticker)
            .await
            .unwrap()
            .unwrap();
    }
}
