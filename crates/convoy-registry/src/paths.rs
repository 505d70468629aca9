//! Key-path scheme for registry records.
//!
//! Keys are `/`-joined and scoped by environment:
//! - `{env}/{pool}/hosts/{host_ip}/{app}`: registration hash, field `location`
//! - `{env}/pools/{pool}`: set of assigned app names
//! - `{env}/{app}/environment`: service config hash, field `config`
//!
//! Enumeration is a glob scan; backends match `*` across `/`, so listings
//! re-check the segment count of every key they get back.

use crate::error::{RegistryError, RegistryResult};

/// Hash field holding a serialized registration.
pub const LOCATION_FIELD: &str = "location";

/// Hash field holding a serialized service config.
pub const CONFIG_FIELD: &str = "config";

/// Member that keeps an empty pool set alive.
pub const POOL_PLACEHOLDER: &str = "__pool__";

/// Pub/sub channel carrying change notifications.
pub const CHANGE_CHANNEL: &str = "convoy";

/// Payload that asks watchers to re-check configs.
pub const CHANGE_PAYLOAD: &str = "config";

const POOLS_SEGMENT: &str = "pools";
const HOSTS_SEGMENT: &str = "hosts";
const CONFIG_SEGMENT: &str = "environment";

pub fn registration_key(env: &str, pool: &str, host_ip: &str, app: &str) -> String {
    format!("{env}/{pool}/{HOSTS_SEGMENT}/{host_ip}/{app}")
}

pub fn registrations_pattern(env: &str) -> String {
    format!("{env}/*/{HOSTS_SEGMENT}/*/*")
}

pub fn pool_key(env: &str, pool: &str) -> String {
    format!("{env}/{POOLS_SEGMENT}/{pool}")
}

pub fn pools_pattern(env: &str) -> String {
    format!("{env}/{POOLS_SEGMENT}/*")
}

pub fn app_key(env: &str, app: &str) -> String {
    format!("{env}/{app}/{CONFIG_SEGMENT}")
}

pub fn apps_pattern(env: &str) -> String {
    format!("{env}/*/{CONFIG_SEGMENT}")
}

pub fn envs_pattern() -> String {
    format!("*/*/{CONFIG_SEGMENT}")
}

/// `(env, app)` from a config key.
pub fn parse_app_key(key: &str) -> Option<(&str, &str)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [env, app, CONFIG_SEGMENT] => Some((*env, *app)),
        _ => None,
    }
}

/// Pool name from a pool key.
pub fn parse_pool_key(key: &str) -> Option<&str> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [_, POOLS_SEGMENT, pool] => Some(*pool),
        _ => None,
    }
}

/// `(pool, host_ip, app)` from a registration key.
pub fn parse_registration_key(key: &str) -> Option<(&str, &str, &str)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [_, pool, HOSTS_SEGMENT, host, app] => Some((*pool, *host, *app)),
        _ => None,
    }
}

/// Reject names that would break the key scheme or glob scans.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.contains(['/', '*', '?', '[', ']', '\\']) {
        Some("contains a path or glob character")
    } else if [POOLS_SEGMENT, HOSTS_SEGMENT, CONFIG_SEGMENT].contains(&name) {
        Some("reserved")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(RegistryError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_scheme() {
        assert_eq!(registration_key("prod", "web", "10.0.0.1", "api"), "prod/web/hosts/10.0.0.1/api");
        assert_eq!(pool_key("prod", "web"), "prod/pools/web");
        assert_eq!(app_key("prod", "api"), "prod/api/environment");
    }

    #[test]
    fn parse_keys() {
        assert_eq!(parse_app_key("prod/api/environment"), Some(("prod", "api")));
        assert_eq!(parse_app_key("prod/web/hosts/1.2.3.4/environment"), None);
        assert_eq!(parse_pool_key("prod/pools/web"), Some("web"));
        assert_eq!(parse_pool_key("prod/pools/web/extra"), None);
        assert_eq!(
            parse_registration_key("prod/web/hosts/10.0.0.1/api"),
            Some(("web", "10.0.0.1", "api"))
        );
        assert_eq!(parse_registration_key("prod/web/hosts/10.0.0.1"), None);
    }

    #[test]
    fn validate_rejects_reserved_and_glob_names() {
        assert!(validate_name("api").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("pools").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("we*b").is_err());
    }
}
