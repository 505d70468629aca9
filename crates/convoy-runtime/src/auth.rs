//! Registry credentials from the operator's docker client config.
//!
//! Looked up in `$DOCKER_CONFIG/config.json`, then `~/.docker/config.json`,
//! then the legacy `~/.dockercfg`. No file at all means no credentials; a
//! file that cannot be read or parsed is a configuration error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};

/// Credentials for one registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    /// Registry host the credentials belong to.
    pub server_address: String,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Which file layout to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFormat {
    /// `config.json`: entries under `"auths"`.
    Config,
    /// `.dockercfg`: entries at the top level.
    Legacy,
}

/// Parsed credentials, keyed by registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    entries: HashMap<String, RegistryCredentials>,
}

impl AuthConfig {
    /// Parse a docker client config. `source` names the file in errors.
    pub fn parse(raw: &str, format: AuthFormat, source: &str) -> RuntimeResult<Self> {
        let invalid = |reason: String| RuntimeError::Credentials {
            path: source.to_string(),
            reason,
        };

        let raw_entries: HashMap<String, AuthEntry> = match format {
            AuthFormat::Config => {
                serde_json::from_str::<ConfigFile>(raw)
                    .map_err(|e| invalid(e.to_string()))?
                    .auths
            }
            AuthFormat::Legacy => serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?,
        };

        let mut entries = HashMap::with_capacity(raw_entries.len());
        for (server, entry) in raw_entries {
            let host = registry_host(&server);
            let (username, password) = match (entry.auth.as_deref(), entry.username, entry.password) {
                (Some(auth), _, _) if !auth.is_empty() => {
                    decode_auth(auth).map_err(|reason| invalid(format!("{server}: {reason}")))?
                }
                (_, Some(username), Some(password)) => (username, password),
                // Entry backed by a credential helper; nothing stored here.
                _ => continue,
            };
            entries.insert(
                host.clone(),
                RegistryCredentials {
                    username,
                    password,
                    email: entry.email.filter(|e| !e.is_empty()),
                    server_address: host,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Load one file. A missing file yields empty credentials.
    pub async fn load_file(path: &Path, format: AuthFormat) -> RuntimeResult<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(RuntimeError::Credentials {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let config = Self::parse(&raw, format, &path.display().to_string())?;
        debug!(path = %path.display(), registries = config.entries.len(), "registry credentials loaded");
        Ok(config)
    }

    /// Load from the first default location that exists.
    pub async fn load_default() -> RuntimeResult<Self> {
        for (path, format) in default_locations() {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Self::load_file(&path, format).await;
            }
        }
        debug!("no docker client config found; pulling anonymously");
        Ok(Self::default())
    }

    /// Credentials for `registry`, matched on host.
    pub fn resolve(&self, registry: &str) -> Option<&RegistryCredentials> {
        self.entries.get(&registry_host(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn default_locations() -> Vec<(PathBuf, AuthFormat)> {
    let mut locations = Vec::new();
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        locations.push((PathBuf::from(dir).join("config.json"), AuthFormat::Config));
    }
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        locations.push((home.join(".docker").join("config.json"), AuthFormat::Config));
        locations.push((home.join(".dockercfg"), AuthFormat::Legacy));
    }
    locations
}

/// `https://index.example.com/v1/` → `index.example.com`.
fn registry_host(server: &str) -> String {
    let trimmed = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    trimmed.split('/').next().unwrap_or(trimmed).to_ascii_lowercase()
}

fn decode_auth(auth: &str) -> Result<(String, String), String> {
    let decoded = STANDARD
        .decode(auth.trim())
        .map_err(|e| format!("auth is not base64: {e}"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| "auth is not utf-8".to_string())?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| "auth is not user:password".to_string())?;
    Ok((user.to_string(), pass.to_string()))
}
