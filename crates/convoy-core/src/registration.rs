//! ServiceRegistration: observed state of one running container.
//!
//! The JSON field names are upper case and fixed: other hosts and the
//! ingress layer read these records directly.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::container::ContainerInfo;

static ERROR_PAGE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^VIRTUAL_HOST_\d+$").expect("valid error page regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceRegistration {
    #[serde(rename = "NAME", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "EXTERNAL_IP", default, skip_serializing_if = "String::is_empty")]
    pub external_ip: String,
    #[serde(rename = "EXTERNAL_PORT", default, skip_serializing_if = "String::is_empty")]
    pub external_port: String,
    #[serde(rename = "INTERNAL_IP", default, skip_serializing_if = "String::is_empty")]
    pub internal_ip: String,
    #[serde(rename = "INTERNAL_PORT", default, skip_serializing_if = "String::is_empty")]
    pub internal_port: String,
    #[serde(rename = "CONTAINER_ID", default)]
    pub container_id: String,
    #[serde(rename = "CONTAINER_NAME", default)]
    pub container_name: String,
    #[serde(rename = "IMAGE", default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(rename = "IMAGE_ID", default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    #[serde(rename = "STARTED_AT", default)]
    pub started_at: DateTime<Utc>,
    /// Lease expiry; derived from the key TTL, never stored.
    #[serde(skip)]
    pub expires: DateTime<Utc>,
    /// Registry key the record lives at; never stored.
    #[serde(skip)]
    pub path: String,
    #[serde(rename = "VIRTUAL_HOSTS", default, deserialize_with = "null_as_empty")]
    pub virtual_hosts: Vec<String>,
    #[serde(rename = "PORT", default)]
    pub port: String,
    #[serde(rename = "ERROR_PAGES", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_pages: BTreeMap<String, String>,
}

impl ServiceRegistration {
    /// Build a registration from an inspected container.
    ///
    /// Only the first published TCP port is recorded; address fields stay
    /// empty when the container publishes none.
    pub fn from_container(container: &ContainerInfo, host_ip: &str) -> Self {
        let mut reg = Self {
            container_name: container.name.clone(),
            container_id: container.id.clone(),
            started_at: container.created,
            image: container.image.clone(),
            ..Self::default()
        };

        if let Some((internal, external)) = container.first_published_tcp_port() {
            reg.external_ip = host_ip.to_string();
            reg.external_port = external.to_string();
            reg.internal_ip = container.ip_address.clone();
            reg.internal_port = internal.to_string();
        }
        reg
    }

    /// Reconciliation equality: the external and internal endpoints only.
    pub fn same_endpoints(&self, other: &ServiceRegistration) -> bool {
        self.external_ip == other.external_ip
            && self.external_port == other.external_port
            && self.internal_ip == other.internal_ip
            && self.internal_port == other.internal_port
    }

    pub fn external_addr(&self) -> Option<String> {
        addr(&self.external_ip, &self.external_port)
    }

    pub fn internal_addr(&self) -> Option<String> {
        addr(&self.internal_ip, &self.internal_port)
    }
}

/// Collect `VIRTUAL_HOST_<n>` variables, keyed by the variable name.
pub fn scrape_error_pages(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(k, _)| ERROR_PAGE_VAR.is_match(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn addr(ip: &str, port: &str) -> Option<String> {
    (!ip.is_empty() && !port.is_empty()).then(|| format!("{ip}:{port}"))
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PortMapping;

    fn full_registration() -> ServiceRegistration {
        ServiceRegistration {
            name: "web".to_string(),
            external_ip: "10.0.0.7".to_string(),
            external_port: "49153".to_string(),
            internal_ip: "172.17.0.5".to_string(),
            internal_port: "8080".to_string(),
            container_id: "0123456789abcdef".to_string(),
            container_name: "web_12".to_string(),
            image: "reg.io/web:1.2".to_string(),
            image_id: "sha256:abc".to_string(),
            started_at: DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap(),
            expires: DateTime::default(),
            path: String::new(),
            virtual_hosts: vec!["web.example.com".to_string()],
            port: "8080".to_string(),
            error_pages: BTreeMap::from([(
                "VIRTUAL_HOST_500".to_string(),
                "https://static.example.com/500.html".to_string(),
            )]),
        }
    }

    #[test]
    fn wire_format_uses_upper_case_names() {
        let json = serde_json::to_value(full_registration()).unwrap();
        for field in [
            "NAME",
            "EXTERNAL_IP",
            "EXTERNAL_PORT",
            "INTERNAL_IP",
            "INTERNAL_PORT",
            "CONTAINER_ID",
            "CONTAINER_NAME",
            "IMAGE",
            "IMAGE_ID",
            "STARTED_AT",
            "VIRTUAL_HOSTS",
            "PORT",
            "ERROR_PAGES",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert!(json.get("expires").is_none());
        assert!(json.get("path").is_none());
    }

    #[test]
    fn round_trip_preserves_stored_fields() {
        let reg = full_registration();
        let json = serde_json::to_string(&reg).unwrap();
        let back: ServiceRegistration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reg);
    }

    #[test]
    fn empty_endpoints_and_error_pages_are_omitted() {
        let reg = ServiceRegistration {
            container_id: "abc".to_string(),
            container_name: "worker_3".to_string(),
            ..ServiceRegistration::default()
        };
        let json = serde_json::to_value(&reg).unwrap();
        for field in ["EXTERNAL_IP", "EXTERNAL_PORT", "INTERNAL_IP", "INTERNAL_PORT", "ERROR_PAGES"] {
            assert!(json.get(field).is_none(), "{field} should be omitted");
        }
        assert!(json.get("CONTAINER_ID").is_some());
    }

    #[test]
    fn null_virtual_hosts_decode_as_empty() {
        let json = r#"{"CONTAINER_ID":"a","CONTAINER_NAME":"b","STARTED_AT":"2024-01-01T00:00:00Z","VIRTUAL_HOSTS":null,"PORT":""}"#;
        let reg: ServiceRegistration = serde_json::from_str(json).unwrap();
        assert!(reg.virtual_hosts.is_empty());
    }

    #[test]
    fn same_endpoints_ignores_metadata() {
        let a = full_registration();
        let mut b = full_registration();
        b.container_id = "other".to_string();
        b.virtual_hosts.clear();
        assert!(a.same_endpoints(&b));
        b.internal_port = "9090".to_string();
        assert!(!a.same_endpoints(&b));
    }

    #[test]
    fn addrs_require_ip_and_port() {
        let reg = full_registration();
        assert_eq!(reg.external_addr().as_deref(), Some("10.0.0.7:49153"));
        assert_eq!(ServiceRegistration::default().internal_addr(), None);
    }

    #[test]
    fn from_container_takes_first_published_port() {
        let container = ContainerInfo {
            id: "0123456789abcdef".to_string(),
            name: "web_12".to_string(),
            image: "reg.io/web:1.2".to_string(),
            image_id: "sha256:abc".to_string(),
            created: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            running: true,
            env: vec![],
            ip_address: "172.17.0.5".to_string(),
            ports: vec![PortMapping {
                container_port: "8080".to_string(),
                protocol: "tcp".to_string(),
                host_port: Some("49153".to_string()),
            }],
        };
        let reg = ServiceRegistration::from_container(&container, "10.0.0.7");
        assert_eq!(reg.external_addr().as_deref(), Some("10.0.0.7:49153"));
        assert_eq!(reg.internal_addr().as_deref(), Some("172.17.0.5:8080"));

        let unpublished = ContainerInfo { ports: vec![], ..container };
        let reg = ServiceRegistration::from_container(&unpublished, "10.0.0.7");
        assert!(reg.external_ip.is_empty());
        assert!(reg.internal_ip.is_empty());
    }

    #[test]
    fn scrape_error_pages_matches_numbered_vars_only() {
        let env = BTreeMap::from([
            ("VIRTUAL_HOST".to_string(), "web.example.com".to_string()),
            ("VIRTUAL_HOST_503".to_string(), "https://e/503".to_string()),
            ("VIRTUAL_HOST_X".to_string(), "nope".to_string()),
            ("VIRTUAL_HOST_".to_string(), "nope".to_string()),
        ]);
        let pages = scrape_error_pages(&env);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages["VIRTUAL_HOST_503"], "https://e/503");
    }
}
