//! convoy-runtime — runs an environment's apps as containers on this host.
//!
//! The runtime drives a container engine (Docker, via bollard) towards the
//! desired state held in the registry:
//!
//! - **Images**: pulled on demand, with registry credentials read from the
//!   operator's docker client config
//! - **Start**: one container per app version, named `<app>_<version id>`,
//!   with every exposed port published and discovery variables for the
//!   other apps
//! - **Reaping**: superseded containers are stopped and removed; a container
//!   that will not stop is blacklisted rather than retried forever
//! - **Registration**: running current versions are registered under a
//!   lease so routers can find them
//! - **One-shot commands**: throwaway containers for tasks and consoles
//!
//! # Architecture
//!
//! ```text
//! ServiceRuntime
//!   ├── ContainerEngine (DockerEngine in production)
//!   ├── ServiceRegistry (desired state + registrations)
//!   ├── AuthConfig (loaded once, on first private pull)
//!   └── blacklist (container ids that would not stop)
//! ```

pub mod auth;
pub mod docker;
pub mod engine;
pub mod error;
pub mod oneshot;
pub mod runtime;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use auth::{AuthConfig, AuthFormat, RegistryCredentials};
pub use docker::DockerEngine;
pub use engine::{ContainerEngine, CreateSpec, EngineFuture, OutputChunk, OutputStream};
pub use error::{EngineError, EngineResult, RuntimeError, RuntimeResult};
pub use oneshot::{interactive_args, oneshot_env};
pub use runtime::{ReapReport, RuntimeTimings, ServiceRuntime, container_env, discovery_env};
