//! convoy-core — value types shared by the Convoy registry and runtime.
//!
//! - [`ServiceConfig`]: desired state of one application in one environment.
//! - [`ServiceRegistration`]: observed state of one running container, in
//!   the upper-case JSON wire format other hosts read.
//! - [`ContainerInfo`] / [`ContainerSummary`] / [`ImageInfo`]: the engine-facing
//!   view of containers and images, independent of any engine client.
//! - [`ImageRef`]: `registry/repository:tag` splitting.

pub mod config;
pub mod container;
pub mod image;
pub mod registration;

pub use config::{PoolRuntime, RuntimeOptions, ServiceConfig, parse_container_name};
pub use container::{ContainerInfo, ContainerSummary, ImageInfo, PortMapping, parse_env};
pub use image::{ImageError, ImageRef};
pub use registration::{ServiceRegistration, scrape_error_pages};

/// Container environment variable naming the application a container runs.
pub const APP_ENV_VAR: &str = "CONVOY_APP";

/// Application environment variable holding the declared service port.
pub const PORT_ENV_VAR: &str = "CONVOY_PORT";

/// Application environment variable holding the comma-separated virtual hosts.
pub const VIRTUAL_HOST_ENV_VAR: &str = "VIRTUAL_HOST";
