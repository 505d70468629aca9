//! Engine-facing container and image views.
//!
//! These are the shapes the runtime's engine contract returns; the registry
//! builds registrations from them without knowing which engine produced them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One published container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Port inside the container, e.g. "8080".
    pub container_port: String,
    /// "tcp" or "udp".
    pub protocol: String,
    /// Host port the engine published it on, if any.
    pub host_port: Option<String>,
}

/// Inspected state of a single container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name without the engine's leading `/`.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Resolved image id.
    pub image_id: String,
    pub created: DateTime<Utc>,
    pub running: bool,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Address on the engine's bridge network.
    pub ip_address: String,
    /// Ports ordered by container port.
    pub ports: Vec<PortMapping>,
}

impl ContainerInfo {
    /// First 12 characters of the id.
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    /// The container environment as a map.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        parse_env(&self.env)
    }

    /// `(internal port, external port)` of the first published TCP port.
    pub fn first_published_tcp_port(&self) -> Option<(&str, &str)> {
        self.ports.iter().find_map(|p| {
            let host = p.host_port.as_deref().filter(|h| !h.is_empty())?;
            (p.protocol == "tcp").then_some((p.container_port.as_str(), host))
        })
    }
}

/// A running container as reported by a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the engine (may carry a leading `/`).
    pub names: Vec<String>,
    pub image: String,
    /// Creation time, seconds since the epoch.
    pub created: i64,
}

impl ContainerSummary {
    /// First name without its leading `/`.
    pub fn name(&self) -> Option<&str> {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .filter(|n| !n.is_empty())
    }
}

/// Inspected image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    /// Exposed ports as "port/proto".
    pub exposed_ports: Vec<String>,
}

impl ImageInfo {
    /// Exposed ports as `port → protocol`.
    pub fn port_map(&self) -> BTreeMap<String, String> {
        self.exposed_ports
            .iter()
            .map(|p| match p.split_once('/') {
                Some((port, proto)) => (port.to_string(), proto.to_string()),
                None => (p.clone(), "tcp".to_string()),
            })
            .collect()
    }
}

/// Parse `KEY=VALUE` entries. Entries without `=` map to an empty value.
pub fn parse_env(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}
