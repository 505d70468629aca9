//! Scripted in-memory [`ContainerEngine`] for tests.
//!
//! Containers, images and failures are set up directly; every call the
//! runtime makes is recorded for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;

use convoy_core::{ContainerInfo, ContainerSummary, ImageInfo, ImageRef, PortMapping};

use crate::auth::RegistryCredentials;
use crate::engine::{ContainerEngine, CreateSpec, EngineFuture, OutputChunk, OutputStream};
use crate::error::EngineError;

#[derive(Debug, Default)]
struct State {
    containers: Vec<ContainerInfo>,
    local_images: HashMap<String, ImageInfo>,
    remote_images: HashMap<String, ImageInfo>,
    created: Vec<CreateSpec>,
    stop_calls: Vec<String>,
    removed: Vec<(String, bool)>,
    pulls: Vec<(String, Option<RegistryCredentials>)>,
    hang_on_stop: HashSet<String>,
    fail_stop: HashSet<String>,
    die_on_start: HashSet<String>,
    output: Vec<OutputChunk>,
    exit_code: i64,
    next_id: u64,
    next_host_port: u16,
}

#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<State>,
}

fn image_info(image: &str, ports: &[&str]) -> ImageInfo {
    ImageInfo {
        id: format!("sha256:{image}"),
        repo_tags: vec![image.to_string()],
        exposed_ports: ports.iter().map(|p| p.to_string()).collect(),
    }
}

impl MockEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        engine.state().next_host_port = 49153;
        engine
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_image(&self, image: &str, ports: &[&str]) {
        self.state()
            .local_images
            .insert(image.to_string(), image_info(image, ports));
    }

    /// An image that only becomes local once pulled.
    pub fn add_remote_image(&self, image: &str, ports: &[&str]) {
        self.state()
            .remote_images
            .insert(image.to_string(), image_info(image, ports));
    }

    /// Add a container directly. Returns its id.
    pub fn add_container(&self, name: &str, image: &str, created: DateTime<Utc>, running: bool) -> String {
        let mut state = self.state();
        let id = next_id(&mut state);
        state.containers.push(ContainerInfo {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_id: format!("sha256:{image}"),
            created,
            running,
            env: Vec::new(),
            ip_address: "172.17.0.9".to_string(),
            ports: Vec::new(),
        });
        id
    }

    pub fn container(&self, id: &str) -> Option<ContainerInfo> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn set_running(&self, id: &str, running: bool) {
        let mut state = self.state();
        if let Some(c) = state.containers.iter_mut().find(|c| c.id == id) {
            c.running = running;
        }
    }

    /// Stopping `id` never completes.
    pub fn hang_on_stop(&self, id: &str) {
        self.state().hang_on_stop.insert(id.to_string());
    }

    /// Stopping `id` fails.
    pub fn fail_stop(&self, id: &str) {
        self.state().fail_stop.insert(id.to_string());
    }

    /// The container named `name` exits right after it starts.
    pub fn die_on_start(&self, name: &str) {
        self.state().die_on_start.insert(name.to_string());
    }

    /// Output and exit code of attached containers.
    pub fn script_output(&self, output: Vec<OutputChunk>, exit_code: i64) {
        let mut state = self.state();
        state.output = output;
        state.exit_code = exit_code;
    }

    pub fn created(&self) -> Vec<CreateSpec> {
        self.state().created.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state().stop_calls.clone()
    }

    pub fn removed(&self) -> Vec<(String, bool)> {
        self.state().removed.clone()
    }

    pub fn pulls(&self) -> Vec<(String, Option<RegistryCredentials>)> {
        self.state().pulls.clone()
    }
}

fn next_id(state: &mut State) -> String {
    state.next_id += 1;
    format!("{:064x}", state.next_id)
}

fn find<'a>(state: &'a State, name_or_id: &str) -> Option<&'a ContainerInfo> {
    let name = name_or_id.trim_start_matches('/');
    state
        .containers
        .iter()
        .find(|c| c.id == name_or_id || c.name == name)
}

fn no_such_container(id: &str) -> EngineError {
    EngineError::Api {
        status: 404,
        message: format!("no such container: {id}"),
    }
}

impl ContainerEngine for MockEngine {
    fn inspect_container<'a>(&'a self, name_or_id: &'a str) -> EngineFuture<'a, Option<ContainerInfo>> {
        Box::pin(async move { Ok(find(&self.state(), name_or_id).cloned()) })
    }

    fn list_containers(&self) -> EngineFuture<'_, Vec<ContainerSummary>> {
        Box::pin(async move {
            let state = self.state();
            Ok(state
                .containers
                .iter()
                .filter(|c| c.running)
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    names: vec![format!("/{}", c.name)],
                    image: c.image.clone(),
                    created: c.created.timestamp(),
                })
                .collect())
        })
    }

    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> EngineFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state();
            let Some(image) = state.local_images.get(&spec.image).cloned() else {
                return Err(EngineError::Api {
                    status: 404,
                    message: format!("no such image: {}", spec.image),
                });
            };
            let mut ports = Vec::new();
            for (port, protocol) in image.port_map() {
                let host_port = spec.publish_all_ports.then(|| {
                    state.next_host_port += 1;
                    state.next_host_port.to_string()
                });
                ports.push(PortMapping {
                    container_port: port,
                    protocol,
                    host_port,
                });
            }
            let id = next_id(&mut state);
            let name = spec.name.clone().unwrap_or_else(|| format!("auto_{}", &id[56..]));
            state.containers.push(ContainerInfo {
                id: id.clone(),
                name,
                image: spec.image.clone(),
                image_id: image.id,
                created: Utc::now(),
                running: false,
                env: spec.env.clone(),
                ip_address: "172.17.0.2".to_string(),
                ports,
            });
            state.created.push(spec.clone());
            Ok(id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            let die = state.die_on_start.clone();
            let container = state
                .containers
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| no_such_container(id))?;
            container.running = !die.contains(&container.name);
            Ok(())
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, _grace: Duration) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let (hang, fail) = {
                let mut state = self.state();
                state.stop_calls.push(id.to_string());
                (state.hang_on_stop.contains(id), state.fail_stop.contains(id))
            };
            if hang {
                std::future::pending::<()>().await;
            }
            if fail {
                return Err(EngineError::Api {
                    status: 500,
                    message: "cannot stop".to_string(),
                });
            }
            let mut state = self.state();
            if let Some(c) = state.containers.iter_mut().find(|c| c.id == id) {
                c.running = false;
            }
            Ok(())
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, remove_volumes: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.containers.retain(|c| c.id != id);
            state.removed.push((id.to_string(), remove_volumes));
            Ok(())
        })
    }

    fn inspect_image<'a>(&'a self, image: &'a str) -> EngineFuture<'a, Option<ImageInfo>> {
        Box::pin(async move { Ok(self.state().local_images.get(image).cloned()) })
    }

    fn pull_image<'a>(
        &'a self,
        image: &'a ImageRef,
        credentials: Option<&'a RegistryCredentials>,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let reference = image.to_string();
            let mut state = self.state();
            state.pulls.push((reference.clone(), credentials.cloned()));
            match state.remote_images.get(&reference).cloned() {
                Some(info) => {
                    state.local_images.insert(reference, info);
                    Ok(())
                }
                None => Err(EngineError::Pull {
                    image: reference,
                    message: "not found".to_string(),
                }),
            }
        })
    }

    fn attach_output<'a>(&'a self, _id: &'a str) -> EngineFuture<'a, OutputStream> {
        Box::pin(async move {
            let output = self.state().output.clone();
            let stream: OutputStream = Box::pin(stream::iter(output.into_iter().map(Ok)));
            Ok(stream)
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64> {
        Box::pin(async move {
            let mut state = self.state();
            let code = state.exit_code;
            if let Some(c) = state.containers.iter_mut().find(|c| c.id == id) {
                c.running = false;
            }
            Ok(code)
        })
    }
}

pub fn stdout(text: &str) -> OutputChunk {
    OutputChunk::Stdout(Bytes::from(text.to_string()))
}

pub fn stderr(text: &str) -> OutputChunk {
    OutputChunk::Stderr(Bytes::from(text.to_string()))
}
