// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host connections
//!
//! A [`Host`] runs shell commands and writes files on the machine being
//! converged. The engine only interprets exit status and output; everything
//! else is an opaque external command.

mod local;
mod ssh;

pub use local::LocalHost;
pub use ssh::SshHost;

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{ConnectionKind, TargetConfig};
use crate::error::{PerchError, Result};

/// Captured result of one external command
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code; -1 when the process was killed by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A connection to the machine being converged
#[async_trait]
pub trait Host: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Acquire the connection; called once at the start of a run
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Run a shell command
    ///
    /// A non-zero exit is reported through [`CommandOutput::exit_code`], not
    /// as an error. Errors mean the command could not be run at all
    /// (timeout, lost connection).
    async fn run_command(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Write a file, then apply mode and owner when given
    async fn write_file(
        &self,
        path: &str,
        content: &str,
        mode: Option<u32>,
        owner: Option<&str>,
        timeout: Duration,
    ) -> Result<()>;

    /// Release the connection; called on every exit path of a run
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the connection for a configured target
pub fn connect(target: &TargetConfig) -> Result<Box<dyn Host>> {
    match target.connection {
        ConnectionKind::Local => Ok(Box::new(LocalHost::new(&target.name))),
        ConnectionKind::Ssh => Ok(Box::new(SshHost::from_target(target)?)),
    }
}

/// Quote one word for a POSIX shell
pub fn quote(input: &str) -> Result<String> {
    shlex::try_quote(input)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| PerchError::UnquotableCommand {
            input: input.to_string(),
        })
}

/// Read a file; `None` when it does not exist or cannot be read
pub async fn read_file(host: &dyn Host, path: &str, limit: Duration) -> Result<Option<String>> {
    let output = host
        .run_command(&format!("cat -- {}", quote(path)?), limit)
        .await?;
    Ok(output.success().then_some(output.stdout))
}

/// Run `chmod`/`chown` for a file that was just written
pub(crate) async fn apply_attributes(
    host: &dyn Host,
    path: &str,
    mode: Option<u32>,
    owner: Option<&str>,
    limit: Duration,
) -> Result<()> {
    let quoted = quote(path)?;
    let mut steps = Vec::new();
    if let Some(mode) = mode {
        steps.push(format!("chmod {:o} -- {}", mode, quoted));
    }
    if let Some(owner) = owner {
        steps.push(format!("chown {} -- {}", quote(owner)?, quoted));
    }

    for step in steps {
        let output = host.run_command(&step, limit).await?;
        if !output.success() {
            return Err(PerchError::WriteFailed {
                path: path.to_string(),
                message: format!("'{}' failed: {}", step, output.stderr.trim()),
            });
        }
    }
    Ok(())
}

/// Spawn a prepared command, feed it `input`, and collect its output
pub(crate) async fn collect(
    mut command: Command,
    input: Option<&[u8]>,
    display: &str,
    limit: Duration,
) -> Result<CommandOutput> {
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let run = async {
        let mut child = command.spawn()?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    match timeout(limit, run).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        }),
        Ok(Err(e)) => Err(PerchError::IoError(e)),
        Err(_) => Err(PerchError::Timeout {
            command: display.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}
