//! One-off commands in an app's image.
//!
//! `run_command` creates a throwaway container, streams its output and
//! removes it; `start_interactive` shells out to the docker CLI so the
//! terminal and signals are handled by docker itself.

use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use convoy_core::ServiceConfig;

use crate::engine::{CreateSpec, OutputChunk};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ServiceRuntime, discovery_env};

const ONESHOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Grace for a command container stopped by Ctrl-C.
const INTERRUPT_GRACE: Duration = Duration::from_secs(3);

/// Environment of a one-shot container: a minimal login environment plus
/// the app's variables.
pub fn oneshot_env(config: &ServiceConfig) -> Vec<String> {
    let mut env = vec![
        "HOME=/".to_string(),
        format!("PATH={ONESHOT_PATH}"),
        "HOSTNAME=app".to_string(),
        "TERM=xterm".to_string(),
    ];
    env.extend(config.env().into_iter().map(|(k, v)| format!("{k}={v}")));
    env
}

/// `docker` CLI arguments for an interactive shell in `config`'s image.
pub fn interactive_args(config: &ServiceConfig, apps: &[ServiceConfig], ingress_host: &str) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
    let env = config
        .env()
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .chain(discovery_env(apps, &config.name, ingress_host));
    for entry in env {
        args.push("-e".to_string());
        args.push(entry);
    }
    args.extend([
        "-t".to_string(),
        config.version().to_string(),
        "/bin/bash".to_string(),
    ]);
    args
}

impl ServiceRuntime {
    /// Run `command` under `/bin/bash -c` in `config`'s image, copying its
    /// output to `stdout`/`stderr`. Returns the exit code.
    ///
    /// The container is removed afterwards, whatever the outcome.
    pub async fn run_command<O, E>(
        &self,
        config: &ServiceConfig,
        command: &str,
        stdout: &mut O,
        stderr: &mut E,
    ) -> RuntimeResult<i64>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        if config.version().is_empty() {
            return Err(RuntimeError::NoVersion(config.name.clone()));
        }
        self.pull_image(config.version()).await?;

        let spec = CreateSpec {
            image: config.version().to_string(),
            env: oneshot_env(config),
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_output: true,
            ..CreateSpec::default()
        };
        let id = self.engine().create_container(&spec).await?;
        info!(app = %config.name, container = %id, %command, "running command");

        let result = self.attach_and_wait(&id, stdout, stderr).await;
        if let Err(e) = self.engine().remove_container(&id, true).await {
            warn!(container = %id, error = %e, "unable to remove command container");
        }
        result
    }

    async fn attach_and_wait<O, E>(&self, id: &str, stdout: &mut O, stderr: &mut E) -> RuntimeResult<i64>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        // Attach first so short-lived commands lose no output.
        let mut output = self.engine().attach_output(id).await?;
        self.engine().start_container(id).await?;

        let copy = async {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    OutputChunk::Stdout(bytes) => stdout.write_all(&bytes).await?,
                    OutputChunk::Stderr(bytes) => stderr.write_all(&bytes).await?,
                }
            }
            stdout.flush().await?;
            stderr.flush().await?;
            Ok::<_, RuntimeError>(())
        };

        tokio::select! {
            copied = copy => copied?,
            _ = tokio::signal::ctrl_c() => {
                warn!(container = %id, "interrupted; stopping command container");
                if let Err(e) = self.engine().stop_container(id, INTERRUPT_GRACE).await {
                    warn!(container = %id, error = %e, "unable to stop command container");
                }
                return Err(RuntimeError::CommandFailed("interrupted".to_string()));
            }
        }

        Ok(self.engine().wait_container(id).await?)
    }

    /// Open an interactive shell in `config`'s image through the docker CLI.
    pub async fn start_interactive(&self, config: &ServiceConfig) -> RuntimeResult<()> {
        if config.version().is_empty() {
            return Err(RuntimeError::NoVersion(config.name.clone()));
        }
        self.pull_image(config.version()).await?;

        let apps = self.registry().list_apps(self.env()).await?;
        let args = interactive_args(config, &apps, self.ingress_host());

        let status = tokio::process::Command::new("docker")
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed(format!("docker run exited with {status}")))
        }
    }
}
