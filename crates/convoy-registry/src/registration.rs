//! Registrations of running containers, held under expiring leases.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use convoy_core::{
    APP_ENV_VAR, ContainerInfo, PORT_ENV_VAR, ServiceConfig, ServiceRegistration,
    scrape_error_pages,
};

use crate::error::{RegistryError, RegistryResult};
use crate::paths::{self, LOCATION_FIELD};
use crate::registry::ServiceRegistry;

impl ServiceRegistry {
    /// Write (or refresh) this host's registration of `container`.
    ///
    /// The container must declare the app it runs in `CONVOY_APP`, and it
    /// must be `config`'s app.
    pub async fn register_service(
        &self,
        env: &str,
        container: &ContainerInfo,
        config: &ServiceConfig,
    ) -> RegistryResult<ServiceRegistration> {
        check_app_name(container, config)?;

        let key = self.registration_path(env, &config.name);
        let app_env = config.env();

        let mut registration = ServiceRegistration::from_container(container, &self.host_ip);
        registration.name = config.name.clone();
        registration.image_id = container.image_id.clone();
        registration.virtual_hosts = config.virtual_hosts();
        registration.error_pages = scrape_error_pages(&app_env);
        registration.port = app_env.get(PORT_ENV_VAR).cloned().unwrap_or_default();

        let raw = serde_json::to_string(&registration).map_err(|e| {
            RegistryError::Serialize(format!("registration {key}: {e}"))
        })?;
        self.backend.set(&key, LOCATION_FIELD, &raw).await?;
        self.backend.expire(&key, self.ttl).await?;

        registration.expires = Utc::now() + lease(self.ttl);
        registration.path = key;
        debug!(
            app = %config.name,
            container = %container.short_id(),
            path = %registration.path,
            ttl = self.ttl,
            "service registered"
        );
        Ok(registration)
    }

    /// Remove this host's registration of `container`.
    ///
    /// Returns the removed record. A record owned by a different container
    /// is left alone and `None` returned.
    pub async fn unregister_service(
        &self,
        env: &str,
        container: &ContainerInfo,
        config: &ServiceConfig,
    ) -> RegistryResult<Option<ServiceRegistration>> {
        let Some(registration) = self.get_service_registration(env, config).await? else {
            return Ok(None);
        };

        if registration.container_id != container.id {
            debug!(
                app = %config.name,
                container = %container.short_id(),
                owner = %registration.container_id,
                "registration belongs to another container"
            );
            return Ok(None);
        }

        self.backend.delete(&registration.path).await?;
        info!(app = %config.name, container = %container.short_id(), "service unregistered");
        Ok(Some(registration))
    }

    /// This host's registration of `config`'s app, with its lease expiry.
    pub async fn get_service_registration(
        &self,
        env: &str,
        config: &ServiceConfig,
    ) -> RegistryResult<Option<ServiceRegistration>> {
        let key = self.registration_path(env, &config.name);
        load_registration(self, key).await
    }

    pub async fn is_registered(&self, env: &str, config: &ServiceConfig) -> RegistryResult<bool> {
        Ok(self.get_service_registration(env, config).await?.is_some())
    }

    /// Every live registration in `env`, across pools and hosts.
    ///
    /// Records that fail to load or decode are logged and skipped.
    pub async fn list_registrations(&self, env: &str) -> RegistryResult<Vec<ServiceRegistration>> {
        let keys = self.backend.keys(&paths::registrations_pattern(env)).await?;
        let mut registrations = Vec::with_capacity(keys.len());

        for key in keys {
            if paths::parse_registration_key(&key).is_none() {
                continue;
            }
            match load_registration(self, key.clone()).await {
                Ok(Some(reg)) => registrations.push(reg),
                // Lease ran out between the scan and the read.
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "unable to load registration"),
            }
        }
        Ok(registrations)
    }

    fn registration_path(&self, env: &str, app: &str) -> String {
        paths::registration_key(env, &self.pool, &self.host_ip, app)
    }
}

async fn load_registration(
    registry: &ServiceRegistry,
    key: String,
) -> RegistryResult<Option<ServiceRegistration>> {
    let Some(raw) = registry.backend.get(&key, LOCATION_FIELD).await? else {
        return Ok(None);
    };

    let mut registration: ServiceRegistration = serde_json::from_str(&raw)
        .map_err(|e| RegistryError::Deserialize(format!("{key}: {e}")))?;

    if registration.name.is_empty() {
        if let Some((_, _, app)) = paths::parse_registration_key(&key) {
            registration.name = app.to_string();
        }
    }

    let remaining = registry.backend.ttl(&key).await?.unwrap_or(0);
    registration.expires = Utc::now() + lease(remaining);
    registration.path = key;
    Ok(Some(registration))
}

fn check_app_name(container: &ContainerInfo, config: &ServiceConfig) -> RegistryResult<()> {
    let env = container.env_map();
    match env.get(APP_ENV_VAR).map(String::as_str) {
        None | Some("") => Err(RegistryError::MissingAppName {
            var: APP_ENV_VAR,
            container: container.short_id().to_string(),
        }),
        Some(found) if found != config.name => Err(RegistryError::AppMismatch {
            container: container.short_id().to_string(),
            found: found.to_string(),
            expected: config.name.clone(),
        }),
        Some(_) => Ok(()),
    }
}

fn lease(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs.min(u64::from(u32::MAX)) as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;
    use convoy_core::PortMapping;

    use super::*;
    use crate::backend::{MemoryBackend, RegistryBackend};

    fn container(app: &str) -> ContainerInfo {
        ContainerInfo {
            id: "0123456789abcdef0123".to_string(),
            name: format!("{app}_7"),
            image: "reg.io/api:1".to_string(),
            image_id: "sha256:feed".to_string(),
            created: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            running: true,
            env: vec![format!("{APP_ENV_VAR}={app}")],
            ip_address: "172.17.0.9".to_string(),
            ports: vec![PortMapping {
                container_port: "8080".to_string(),
                protocol: "tcp".to_string(),
                host_port: Some("49200".to_string()),
            }],
        }
    }

    fn config() -> ServiceConfig {
        let mut cfg = ServiceConfig::new("api", "prod");
        cfg.env_set("VIRTUAL_HOST", "api.example.com,api2.example.com");
        cfg.env_set("VIRTUAL_HOST_503", "https://static.example.com/503.html");
        cfg.env_set(PORT_ENV_VAR, "8080");
        cfg
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(MemoryBackend::new()), "web", "10.0.0.1").with_ttl(30)
    }

    #[tokio::test]
    async fn register_builds_record_from_container_and_config() {
        let reg = registry();
        let record = reg.register_service("prod", &container("api"), &config()).await.unwrap();

        assert_eq!(record.path, "prod/web/hosts/10.0.0.1/api");
        assert_eq!(record.name, "api");
        assert_eq!(record.external_addr().as_deref(), Some("10.0.0.1:49200"));
        assert_eq!(record.internal_addr().as_deref(), Some("172.17.0.9:8080"));
        assert_eq!(record.image_id, "sha256:feed");
        assert_eq!(record.virtual_hosts, vec!["api.example.com", "api2.example.com"]);
        assert_eq!(record.error_pages.len(), 1);
        assert_eq!(record.port, "8080");
        assert!(record.expires > Utc::now());

        let stored = reg.get_service_registration("prod", &config()).await.unwrap().unwrap();
        assert!(stored.same_endpoints(&record));
        assert_eq!(stored.path, record.path);
        assert!(reg.is_registered("prod", &config()).await.unwrap());
    }

    #[tokio::test]
    async fn register_requires_matching_app_var() {
        let reg = registry();

        let mut missing = container("api");
        missing.env.clear();
        let err = reg.register_service("prod", &missing, &config()).await.unwrap_err();
        assert!(matches!(err, RegistryError::MissingAppName { .. }));

        let err = reg
            .register_service("prod", &container("worker"), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AppMismatch { ref found, .. } if found == "worker"));
    }

    #[tokio::test]
    async fn unregister_ignores_foreign_container() {
        let reg = registry();
        reg.register_service("prod", &container("api"), &config()).await.unwrap();

        let mut other = container("api");
        other.id = "ffffffffffffffffffff".to_string();
        assert!(reg.unregister_service("prod", &other, &config()).await.unwrap().is_none());
        assert!(reg.is_registered("prod", &config()).await.unwrap());

        let removed = reg
            .unregister_service("prod", &container("api"), &config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed.container_id, "0123456789abcdef0123");
        assert!(!reg.is_registered("prod", &config()).await.unwrap());
    }

    #[tokio::test]
    async fn list_registrations_spans_hosts() {
        let backend: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let a = ServiceRegistry::new(backend.clone(), "web", "10.0.0.1");
        let b = ServiceRegistry::new(backend.clone(), "web", "10.0.0.2");
        a.register_service("prod", &container("api"), &config()).await.unwrap();
        b.register_service("prod", &container("api"), &config()).await.unwrap();
        backend
            .set("prod/web/hosts/10.0.0.3/api", LOCATION_FIELD, "{bad")
            .await
            .unwrap();

        let regs = a.list_registrations("prod").await.unwrap();
        assert_eq!(regs.len(), 2);
        assert!(regs.iter().all(|r| r.name == "api"));
        assert!(a.list_registrations("staging").await.unwrap().is_empty());
    }
}
