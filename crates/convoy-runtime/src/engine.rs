//! Container engine contract.
//!
//! The runtime drives containers only through [`ContainerEngine`]. "No such
//! container" and "no such image" are `None`, not errors; everything else an
//! engine reports is an [`EngineError`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use convoy_core::{ContainerInfo, ContainerSummary, ImageInfo, ImageRef};

use crate::auth::RegistryCredentials;
use crate::error::EngineResult;

/// Boxed future returned by engine operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Output of an attached container.
pub type OutputStream = Pin<Box<dyn Stream<Item = EngineResult<OutputChunk>> + Send>>;

/// One chunk of attached container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name; engine-assigned when `None`.
    pub name: Option<String>,
    pub image: String,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Command override; the image default when `None`.
    pub cmd: Option<Vec<String>>,
    /// Publish every exposed port on a random host port.
    pub publish_all_ports: bool,
    /// Attach stdout/stderr for a later `attach_output`.
    pub attach_output: bool,
}

pub trait ContainerEngine: Send + Sync + fmt::Debug {
    /// Inspect a container by name or id.
    fn inspect_container<'a>(&'a self, name_or_id: &'a str) -> EngineFuture<'a, Option<ContainerInfo>>;

    /// Running containers.
    fn list_containers(&self) -> EngineFuture<'_, Vec<ContainerSummary>>;

    /// Create a container. Returns its id.
    fn create_container<'a>(&'a self, spec: &'a CreateSpec) -> EngineFuture<'a, String>;

    /// Start a container. Starting a running container succeeds.
    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()>;

    /// Stop a container, killing it once `grace` has passed.
    fn stop_container<'a>(&'a self, id: &'a str, grace: Duration) -> EngineFuture<'a, ()>;

    fn remove_container<'a>(&'a self, id: &'a str, remove_volumes: bool) -> EngineFuture<'a, ()>;

    /// Inspect a local image.
    fn inspect_image<'a>(&'a self, image: &'a str) -> EngineFuture<'a, Option<ImageInfo>>;

    /// Pull an image, authenticating with `credentials` when given.
    fn pull_image<'a>(
        &'a self,
        image: &'a ImageRef,
        credentials: Option<&'a RegistryCredentials>,
    ) -> EngineFuture<'a, ()>;

    /// Stream a container's stdout and stderr, including earlier output.
    fn attach_output<'a>(&'a self, id: &'a str) -> EngineFuture<'a, OutputStream>;

    /// Wait for a container to exit. Returns its exit code.
    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64>;
}
