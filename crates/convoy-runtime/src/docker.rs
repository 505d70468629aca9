//! Docker Engine API implementation of [`ContainerEngine`], over `bollard`.

use std::collections::HashMap;
use std::pin::pin;
use std::time::Duration;

use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, ImageInspect, PortBinding};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future;
use tracing::{debug, info};

use convoy_core::{ContainerInfo, ContainerSummary, ImageInfo, ImageRef, PortMapping};

use crate::auth::RegistryCredentials;
use crate::engine::{ContainerEngine, CreateSpec, EngineFuture, OutputChunk, OutputStream};
use crate::error::{EngineError, EngineResult};

/// Seconds the client waits on a single engine request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to `endpoint` (`unix://…`, `tcp://…`, `http://…`), or to the
    /// local daemon's default socket when `None`.
    pub fn connect(endpoint: Option<&str>) -> EngineResult<Self> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(ep) if ep.starts_with("unix://") => {
                Docker::connect_with_unix(ep, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(ep) => {
                Docker::connect_with_http(ep, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| EngineError::Connection(e.to_string()))?;

        info!(endpoint = endpoint.unwrap_or("local default"), "docker engine client ready");
        Ok(Self { docker })
    }
}

fn engine_err(e: DockerError) -> EngineError {
    match e {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Connection(other.to_string()),
    }
}

fn has_status(e: &DockerError, status: u16) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code, .. } if *status_code == status)
}

impl ContainerEngine for DockerEngine {
    fn inspect_container<'a>(&'a self, name_or_id: &'a str) -> EngineFuture<'a, Option<ContainerInfo>> {
        Box::pin(async move {
            match self
                .docker
                .inspect_container(name_or_id, None::<InspectContainerOptions>)
                .await
            {
                Ok(resp) => container_info(resp).map(Some),
                Err(e) if has_status(&e, 404) => Ok(None),
                Err(e) => Err(engine_err(e)),
            }
        })
    }

    fn list_containers(&self) -> EngineFuture<'_, Vec<ContainerSummary>> {
        Box::pin(async move {
            let options = ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            };
            let containers = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(engine_err)?;

            Ok(containers
                .into_iter()
                .filter_map(|c| {
                    Some(ContainerSummary {
                        id: c.id?,
                        names: c.names.unwrap_or_default(),
                        image: c.image.unwrap_or_default(),
                        created: c.created.unwrap_or(0),
                    })
                })
                .collect())
        })
    }

    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> EngineFuture<'a, String> {
        Box::pin(async move {
            let options = spec.name.as_ref().map(|name| CreateContainerOptions {
                name: name.clone(),
                platform: None,
            });
            let config = Config {
                image: Some(spec.image.clone()),
                env: Some(spec.env.clone()),
                cmd: spec.cmd.clone(),
                attach_stdout: Some(spec.attach_output),
                attach_stderr: Some(spec.attach_output),
                host_config: Some(HostConfig {
                    publish_all_ports: Some(spec.publish_all_ports),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let created = self
                .docker
                .create_container(options, config)
                .await
                .map_err(engine_err)?;
            for warning in &created.warnings {
                debug!(id = %created.id, %warning, "engine warning on create");
            }
            Ok(created.id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            match self
                .docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
            {
                // 304: already running.
                Err(e) if !has_status(&e, 304) => Err(engine_err(e)),
                _ => Ok(()),
            }
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, grace: Duration) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = StopContainerOptions {
                t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
            };
            match self.docker.stop_container(id, Some(options)).await {
                // 304: already stopped.
                Err(e) if !has_status(&e, 304) => Err(engine_err(e)),
                _ => Ok(()),
            }
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, remove_volumes: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = RemoveContainerOptions {
                v: remove_volumes,
                ..Default::default()
            };
            self.docker
                .remove_container(id, Some(options))
                .await
                .map_err(engine_err)
        })
    }

    fn inspect_image<'a>(&'a self, image: &'a str) -> EngineFuture<'a, Option<ImageInfo>> {
        Box::pin(async move {
            match self.docker.inspect_image(image).await {
                Ok(resp) => Ok(Some(image_info(resp))),
                Err(e) if has_status(&e, 404) => Ok(None),
                Err(e) => Err(engine_err(e)),
            }
        })
    }

    fn pull_image<'a>(
        &'a self,
        image: &'a ImageRef,
        credentials: Option<&'a RegistryCredentials>,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = CreateImageOptions {
                from_image: image.qualified_repository(),
                tag: image.pull_reference().to_string(),
                ..Default::default()
            };
            let credentials = credentials.map(|c| DockerCredentials {
                username: Some(c.username.clone()),
                password: Some(c.password.clone()),
                email: c.email.clone(),
                serveraddress: Some(c.server_address.clone()),
                ..Default::default()
            });

            info!(%image, authenticated = credentials.is_some(), "pulling image");
            let mut progress = pin!(self.docker.create_image(Some(options), None, credentials));
            while let Some(update) = progress.next().await {
                let update = update.map_err(|e| EngineError::Pull {
                    image: image.to_string(),
                    message: e.to_string(),
                })?;
                if let Some(message) = update.error {
                    return Err(EngineError::Pull {
                        image: image.to_string(),
                        message,
                    });
                }
                if let Some(status) = update.status {
                    debug!(%image, %status, "pull progress");
                }
            }
            Ok(())
        })
    }

    fn attach_output<'a>(&'a self, id: &'a str) -> EngineFuture<'a, OutputStream> {
        Box::pin(async move {
            let options = AttachContainerOptions::<String> {
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(true),
                ..Default::default()
            };
            let AttachContainerResults { output, .. } = self
                .docker
                .attach_container(id, Some(options))
                .await
                .map_err(engine_err)?;

            let chunks = output.filter_map(|item| {
                future::ready(match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(OutputChunk::Stdout(message)))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(engine_err(e))),
                })
            });
            Ok(Box::pin(chunks) as OutputStream)
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64> {
        Box::pin(async move {
            let mut waiting = pin!(
                self.docker
                    .wait_container(id, None::<WaitContainerOptions<String>>)
            );
            match waiting.next().await {
                Some(Ok(resp)) => Ok(resp.status_code),
                // Non-zero exits come back as an error carrying the code.
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(engine_err(e)),
                None => Err(EngineError::Malformed(format!("no exit status for {id}"))),
            }
        })
    }
}

fn container_info(resp: ContainerInspectResponse) -> EngineResult<ContainerInfo> {
    let id = resp
        .id
        .ok_or_else(|| EngineError::Malformed("container without id".to_string()))?;
    let config = resp.config.unwrap_or_default();
    let network = resp.network_settings.unwrap_or_default();

    let created = resp
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_default();

    Ok(ContainerInfo {
        id,
        name: resp
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: config.image.unwrap_or_default(),
        image_id: resp.image.unwrap_or_default(),
        created,
        running: resp.state.and_then(|s| s.running).unwrap_or(false),
        env: config.env.unwrap_or_default(),
        ip_address: network.ip_address.unwrap_or_default(),
        ports: port_mappings(network.ports.unwrap_or_default()),
    })
}

/// Flatten the engine's port map, ordered by container port.
fn port_mappings(ports: HashMap<String, Option<Vec<PortBinding>>>) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = ports
        .into_iter()
        .map(|(key, bindings)| {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            PortMapping {
                container_port: port.to_string(),
                protocol: protocol.to_string(),
                host_port: bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|b| b.host_port.filter(|p| !p.is_empty())),
            }
        })
        .collect();
    mappings.sort_by(|a, b| {
        let num = |p: &PortMapping| p.container_port.parse::<u32>().unwrap_or(u32::MAX);
        num(a)
            .cmp(&num(b))
            .then_with(|| a.protocol.cmp(&b.protocol))
    });
    mappings
}

fn image_info(resp: ImageInspect) -> ImageInfo {
    let mut exposed_ports: Vec<String> = resp
        .config
        .and_then(|c| c.exposed_ports)
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    ImageInfo {
        id: resp.id.unwrap_or_default(),
        repo_tags: resp.repo_tags.unwrap_or_default(),
        exposed_ports,
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{ContainerConfig, ContainerState, ImageConfig, NetworkSettings};

    use super::*;

    fn binding(port: &str) -> Option<Vec<PortBinding>> {
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(port.to_string()),
        }])
    }

    #[test]
    fn port_mappings_are_sorted_numerically() {
        let ports = HashMap::from([
            ("8080/tcp".to_string(), binding("49155")),
            ("443/tcp".to_string(), binding("49154")),
            ("53/udp".to_string(), binding("49153")),
            ("9000/tcp".to_string(), None),
        ]);
        let mappings = port_mappings(ports);
        let order: Vec<&str> = mappings.iter().map(|m| m.container_port.as_str()).collect();
        assert_eq!(order, vec!["53", "443", "8080", "9000"]);
        assert_eq!(mappings[3].host_port, None);
    }

    #[test]
    fn container_info_from_inspect() {
        let resp = ContainerInspectResponse {
            id: Some("abcdef0123456789".to_string()),
            name: Some("/api_17".to_string()),
            image: Some("sha256:1234".to_string()),
            created: Some("2024-05-01T12:00:00.123456789Z".to_string()),
            state: Some(ContainerState {
                running: Some(true),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some("reg.io/api:3".to_string()),
                env: Some(vec!["CONVOY_APP=api".to_string()]),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some("172.17.0.4".to_string()),
                ports: Some(HashMap::from([("80/tcp".to_string(), binding("49160"))])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = container_info(resp).unwrap();
        assert_eq!(info.name, "api_17");
        assert_eq!(info.image, "reg.io/api:3");
        assert_eq!(info.image_id, "sha256:1234");
        assert!(info.running);
        assert_eq!(info.created.timestamp(), 1_714_564_800);
        assert_eq!(info.first_published_tcp_port(), Some(("80", "49160")));
    }

    #[test]
    fn container_info_requires_id() {
        assert!(container_info(ContainerInspectResponse::default()).is_err());
    }

    #[test]
    fn image_info_lists_exposed_ports() {
        let resp = ImageInspect {
            id: Some("sha256:9".to_string()),
            config: Some(ImageConfig {
                exposed_ports: Some(HashMap::from([
                    ("9090/tcp".to_string(), HashMap::new()),
                    ("8080/tcp".to_string(), HashMap::new()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let info = image_info(resp);
        assert_eq!(info.exposed_ports, vec!["8080/tcp", "9090/tcp"]);
        assert_eq!(info.port_map().len(), 2);
    }
}
