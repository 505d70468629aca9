//! convoy.toml configuration, overlaid with command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Serialize};

/// Default config file, read when present.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/convoy/convoy.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `redis://host:port` or `memory://`.
    pub registry_url: String,
    pub env: String,
    /// Pool this host serves.
    pub pool: String,
    /// Address other hosts reach this host's published ports on.
    pub host_ip: String,
    /// Address containers reach other apps on.
    pub ingress_host: String,
    /// Registration lease, in seconds.
    pub ttl: u64,
    pub poll_interval_secs: u64,
    pub register_interval_secs: u64,
    /// Superseded containers younger than this are left running.
    pub reap_cutoff_secs: u64,
    /// Docker endpoint; the local defaults when unset.
    pub docker_endpoint: Option<String>,
    /// Docker client config holding registry credentials.
    pub auth_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry_url: "redis://127.0.0.1:6379".to_string(),
            env: "dev".to_string(),
            pool: "web".to_string(),
            host_ip: "127.0.0.1".to_string(),
            ingress_host: "172.17.0.1".to_string(),
            ttl: convoy_registry::DEFAULT_TTL,
            poll_interval_secs: 10,
            register_interval_secs: 10,
            reap_cutoff_secs: 60,
            docker_endpoint: None,
            auth_file: None,
        }
    }
}

/// Flags for `convoyd agent`. Each one overrides the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct AgentArgs {
    /// Config file [default: /etc/convoy/convoy.toml, if present].
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Registry URL.
    #[arg(long, env = "CONVOY_REGISTRY")]
    pub registry: Option<String>,

    /// Environment to run.
    #[arg(long, env = "CONVOY_ENV")]
    pub env: Option<String>,

    /// Pool this host serves.
    #[arg(long, env = "CONVOY_POOL")]
    pub pool: Option<String>,

    /// Externally reachable IP of this host.
    #[arg(long, env = "CONVOY_HOST_IP")]
    pub host_ip: Option<String>,

    /// Address containers reach other apps on.
    #[arg(long)]
    pub ingress_host: Option<String>,

    /// Registration lease in seconds.
    #[arg(long)]
    pub ttl: Option<u64>,

    /// Change poll interval in seconds.
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Registration refresh interval in seconds.
    #[arg(long)]
    pub register_interval: Option<u64>,

    /// Minimum age in seconds before a superseded container is reaped.
    #[arg(long)]
    pub reap_cutoff: Option<u64>,

    /// Docker endpoint (unix:// or tcp://).
    #[arg(long, env = "DOCKER_HOST")]
    pub docker: Option<String>,

    /// Docker client config with registry credentials.
    #[arg(long)]
    pub auth_file: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the effective config for `args`.
    ///
    /// An explicit `--config` must exist; the default path is optional.
    pub fn load(args: &AgentArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    /// Overlay every flag that was given.
    pub fn apply(&mut self, args: &AgentArgs) {
        if let Some(url) = &args.registry {
            self.registry_url = url.clone();
        }
        if let Some(env) = &args.env {
            self.env = env.clone();
        }
        if let Some(pool) = &args.pool {
            self.pool = pool.clone();
        }
        if let Some(ip) = &args.host_ip {
            self.host_ip = ip.clone();
        }
        if let Some(host) = &args.ingress_host {
            self.ingress_host = host.clone();
        }
        if let Some(ttl) = args.ttl {
            self.ttl = ttl;
        }
        if let Some(secs) = args.poll_interval {
            self.poll_interval_secs = secs;
        }
        if let Some(secs) = args.register_interval {
            self.register_interval_secs = secs;
        }
        if let Some(secs) = args.reap_cutoff {
            self.reap_cutoff_secs = secs;
        }
        if let Some(endpoint) = &args.docker {
            self.docker_endpoint = Some(endpoint.clone());
        }
        if let Some(path) = &args.auth_file {
            self.auth_file = Some(path.clone());
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.env.is_empty(), "env must not be empty");
        anyhow::ensure!(!self.pool.is_empty(), "pool must not be empty");
        anyhow::ensure!(!self.host_ip.is_empty(), "host_ip must not be empty");
        anyhow::ensure!(self.ttl > 0, "ttl must be positive");
        anyhow::ensure!(self.poll_interval_secs > 0, "poll_interval_secs must be positive");
        anyhow::ensure!(
            self.register_interval_secs > 0,
            "register_interval_secs must be positive"
        );
        // A lease shorter than the refresh interval would lapse between refreshes.
        anyhow::ensure!(
            self.register_interval_secs < self.ttl,
            "register_interval_secs ({}) must be below ttl ({})",
            self.register_interval_secs,
            self.ttl
        );
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval_secs)
    }

    pub fn reap_cutoff(&self) -> Duration {
        Duration::from_secs(self.reap_cutoff_secs)
    }
}
