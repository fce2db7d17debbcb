use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::DEFAULT_ENGINE_TIMEOUT_SECS;

/// The container engine collaborator. The pipeline only needs four
/// capabilities; tests substitute a mock that never touches a real daemon.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Inspect the multi-architecture manifest list for an image and return
    /// the raw document bytes.
    async fn inspect_manifest(&self, image: &str) -> Result<Vec<u8>>;

    /// Pull the image pinned to an exact `os/architecture` platform.
    async fn pull(&self, image: &str, platform: &str) -> Result<()>;

    /// Export a pulled image and its metadata to a portable archive.
    async fn save(&self, image: &str, dest: &Path) -> Result<()>;

    /// Authenticate against the public registry, password on stdin.
    async fn login(&self, username: &str, password: &str) -> Result<()>;
}

/// `ContainerEngine` backed by the `docker` command line client.
pub struct DockerCli {
    binary: String,
    /// Pass `--insecure` to manifest inspection; required for a local
    /// plain-HTTP registry.
    insecure: bool,
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            insecure: true,
            timeout: Duration::from_secs(DEFAULT_ENGINE_TIMEOUT_SECS),
        }
    }
}

impl DockerCli {
    pub fn new(binary: String, insecure: bool, timeout: Duration) -> Self {
        Self {
            binary,
            insecure,
            timeout,
        }
    }

    /// Run one engine invocation, capture stdout, and enforce the bounded
    /// timeout. A timed-out child is killed rather than left running; the
    /// caller reports the failure, it is never retried here.
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        tracing::debug!(binary = %self.binary, ?args, "Invoking container engine");

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        if let Some(input) = stdin {
            let mut handle = child.stdin.take().context("child stdin not captured")?;
            handle.write_all(input).await?;
            drop(handle);
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => bail!(
                "`{} {}` timed out after {}s",
                self.binary,
                args.join(" "),
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{} {}` failed ({}): {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn inspect_manifest(&self, image: &str) -> Result<Vec<u8>> {
        let mut args = vec!["manifest", "inspect", "--verbose"];
        if self.insecure {
            args.push("--insecure");
        }
        args.push(image);
        self.run(&args, None).await
    }

    async fn pull(&self, image: &str, platform: &str) -> Result<()> {
        self.run(&["pull", "--platform", platform, image], None)
            .await?;
        Ok(())
    }

    async fn save(&self, image: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run(&["save", "-o", dest.as_ref(), image], None).await?;
        Ok(())
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.run(
            &["login", "--username", username, "--password-stdin"],
            Some(password.as_bytes()),
        )
        .await?;
        Ok(())
    }
}
