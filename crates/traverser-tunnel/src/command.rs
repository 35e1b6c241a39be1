//! External tool invocation.
//!
//! The kernel device is configured with the `ip`, `wg` and `resolvconf` tools.
//! Invocations go through [`CommandRunner`] so the exact command lines can be
//! checked in tests without touching the host.

use crate::error::{TunnelError, TunnelResult};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs a program to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally feeding `stdin`.
    ///
    /// # Returns
    /// Captured standard output
    ///
    /// # Errors
    /// `TunnelError::Io` if the program cannot be started and
    /// `TunnelError::Command` if it exits unsuccessfully.
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>)
    -> TunnelResult<String>;
}

/// Runs programs on the host, optionally through `sudo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    /// Create a runner. With `sudo` set every program is run as `sudo <program>`.
    #[must_use]
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> TunnelResult<String> {
        tracing::debug!("Running {} {}", program, args.join(" "));

        let mut child = self
            .command(program, args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TunnelError::Command {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
