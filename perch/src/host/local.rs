// SPDX-License-Identifier: AGPL-3.0-or-later
//! Converge the machine Perch runs on

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{apply_attributes, collect, CommandOutput, Host};
use crate::error::{PerchError, Result};

/// Runs commands through the local `sh`
#[derive(Debug, Clone)]
pub struct LocalHost {
    name: String,
}

impl LocalHost {
    /// Create a local host connection
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_command(&self, cmd: &str, limit: Duration) -> Result<CommandOutput> {
        debug!(host = %self.name, command = %cmd, "Running local command");

        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        collect(command, None, cmd, limit).await
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        mode: Option<u32>,
        owner: Option<&str>,
        limit: Duration,
    ) -> Result<()> {
        debug!(host = %self.name, path = %path, bytes = content.len(), "Writing local file");

        let write = async {
            tokio::fs::write(path, content).await?;
            if let Some(mode) = mode {
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
            }
            Ok::<(), std::io::Error>(())
        };

        match timeout(limit, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PerchError::WriteFailed {
                    path: path.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(PerchError::Timeout {
                    command: format!("write {}", path),
                    seconds: limit.as_secs(),
                })
            }
        }

        apply_attributes(self, path, None, owner, limit).await
    }
}
