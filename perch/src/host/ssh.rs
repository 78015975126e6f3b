// SPDX-License-Identifier: AGPL-3.0-or-later
//! Converge a remote machine through the system `ssh` client
//!
//! One control master is opened per run and reused by every command, so a
//! run holds a single connection for its whole lifetime.
//!
//! ssh exits 255 both when the connection fails and when the remote command
//! itself exits 255 (`sshd -t` does on a bad config). Every remote command
//! therefore reports its own status on a trailing stderr marker line; a 255
//! without the marker is the connection.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{apply_attributes, collect, quote, CommandOutput, Host};
use crate::config::TargetConfig;
use crate::error::{PerchError, Result};

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Prefix of the stderr line carrying the remote command's exit status
const EXIT_MARKER: &str = "PERCH_EXIT=";

/// Runs commands on a remote host with `ssh`
#[derive(Debug, Clone)]
pub struct SshHost {
    name: String,
    program: PathBuf,
    destination: String,
    port: u16,
    identity_file: Option<PathBuf>,
    options: Vec<String>,
    control_path: PathBuf,
}

impl SshHost {
    /// Build a connection from a configured target
    pub fn from_target(target: &TargetConfig) -> Result<Self> {
        let address = target
            .address
            .as_deref()
            .ok_or_else(|| PerchError::InvalidConfig {
                message: format!("Target '{}' uses ssh but has no address", target.name),
            })?;

        let destination = match target.user.as_deref() {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        };

        let control_path = std::env::temp_dir().join(format!(
            "perch-{}-{}.sock",
            target.name,
            std::process::id()
        ));

        Ok(Self {
            name: target.name.clone(),
            program: target
                .ssh_program
                .clone()
                .unwrap_or_else(|| PathBuf::from("ssh")),
            destination,
            port: target.port,
            identity_file: target.identity_file.clone(),
            options: target.ssh_options.clone(),
            control_path,
        })
    }

    /// Base `ssh` invocation shared by every command
    fn ssh(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-p")
            .arg(self.port.to_string());

        if let Some(identity) = &self.identity_file {
            command.arg("-i").arg(identity);
        }
        for option in &self.options {
            command.arg("-o").arg(option);
        }
        command
    }

    /// Run `remote` through `sh -c` on the host
    async fn remote(
        &self,
        remote: &str,
        input: Option<&[u8]>,
        limit: Duration,
    ) -> Result<CommandOutput> {
        let mut command = self.ssh();
        command
            .arg(&self.destination)
            .arg("--")
            .arg(wrap_remote(remote)?);

        let output = collect(command, input, remote, limit).await?;
        match split_exit_marker(&output.stderr) {
            Some((stderr, exit_code)) => Ok(CommandOutput {
                stdout: output.stdout,
                stderr,
                exit_code,
            }),
            None if output.exit_code == SSH_CONNECTION_FAILURE => Err(PerchError::ConnectionLost {
                host: self.name.clone(),
                message: output.stderr.trim().to_string(),
            }),
            None => Ok(output),
        }
    }

    /// The ssh arguments a command would use, for display and tests
    pub fn describe(&self) -> String {
        format!("{} -p {} {}", self.program.display(), self.port, self.destination)
    }
}

/// Remote shell line that runs `remote` and reports its exit status
fn wrap_remote(remote: &str) -> Result<String> {
    Ok(format!(
        "sh -c {}; printf '\\n{}%d\\n' \"$?\" >&2",
        quote(remote)?,
        EXIT_MARKER
    ))
}

/// Strip the exit marker from remote stderr; `None` when it never arrived
fn split_exit_marker(stderr: &str) -> Option<(String, i32)> {
    let needle = format!("\n{}", EXIT_MARKER);
    let start = stderr.rfind(&needle)?;
    let exit_code = stderr[start + needle.len()..].trim().parse().ok()?;
    Some((stderr[..start].to_string(), exit_code))
}

#[async_trait]
impl Host for SshHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<()> {
        info!(host = %self.name, destination = %self.destination, "Opening ssh control connection");

        let mut command = self.ssh();
        command
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-N")
            .arg("-f")
            .arg(&self.destination);

        let output = collect(command, None, "ssh -N -f", Duration::from_secs(30)).await?;
        if !output.success() {
            return Err(PerchError::ConnectionLost {
                host: self.name.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_command(&self, cmd: &str, limit: Duration) -> Result<CommandOutput> {
        debug!(host = %self.name, command = %cmd, "Running remote command");
        self.remote(cmd, None, limit).await
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        mode: Option<u32>,
        owner: Option<&str>,
        limit: Duration,
    ) -> Result<()> {
        debug!(host = %self.name, path = %path, bytes = content.len(), "Writing remote file");

        let output = self
            .remote(
                &format!("cat > {}", quote(path)?),
                Some(content.as_bytes()),
                limit,
            )
            .await?;
        if !output.success() {
            return Err(PerchError::WriteFailed {
                path: path.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        apply_attributes(self, path, mode, owner, limit).await
    }

    async fn close(&self) -> Result<()> {
        let mut command = self.ssh();
        command.arg("-O").arg("exit").arg(&self.destination);

        match collect(command, None, "ssh -O exit", Duration::from_secs(10)).await {
            Ok(output) if !output.success() => {
                warn!(host = %self.name, stderr = %output.stderr.trim(), "Control connection was not running");
            }
            Ok(_) => debug!(host = %self.name, "Closed ssh control connection"),
            Err(e) => warn!(host = %self.name, error = %e, "Failed to close ssh control connection"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionKind;

    fn target() -> TargetConfig {
        let mut target = TargetConfig::local("web1");
        target.connection = ConnectionKind::Ssh;
        target.address = Some("203.0.113.10".to_string());
        target.user = Some("root".to_string());
        target.port = 2222;
        target
    }

    #[test]
    fn test_from_target() {
        let host = SshHost::from_target(&target()).unwrap();
        assert_eq!(host.name(), "web1");
        assert_eq!(host.describe(), "ssh -p 2222 root@203.0.113.10");
        assert!(host
            .control_path
            .to_string_lossy()
            .contains("perch-web1-"));
    }

    #[test]
    fn test_from_target_without_user() {
        let mut target = target();
        target.user = None;
        let host = SshHost::from_target(&target).unwrap();
        assert_eq!(host.destination, "203.0.113.10");
    }

    #[test]
    fn test_from_target_without_address() {
        let mut target = target();
        target.address = None;
        assert!(SshHost::from_target(&target).is_err());
    }

    #[test]
    fn test_from_target_with_program() {
        let mut target = target();
        target.ssh_program = Some(PathBuf::from("/opt/ssh/bin/ssh"));
        let host = SshHost::from_target(&target).unwrap();
        assert_eq!(host.describe(), "/opt/ssh/bin/ssh -p 2222 root@203.0.113.10");
    }

    #[test]
    fn test_split_exit_marker() {
        assert_eq!(
            split_exit_marker("bad option\n\nPERCH_EXIT=255\n"),
            Some(("bad option\n".to_string(), 255))
        );
        assert_eq!(
            split_exit_marker("\nPERCH_EXIT=0\n"),
            Some((String::new(), 0))
        );
        assert_eq!(split_exit_marker("Connection refused\n"), None);
        assert_eq!(split_exit_marker("\nPERCH_EXIT=garbage\n"), None);
    }

    /// ssh stand-in that runs the remote command with the local shell
    const LOOPBACK_SSH: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -o|-p|-i) shift 2 ;;
    -O) exit 0 ;;
    --) shift; exec sh -c "$1" ;;
    *) shift ;;
  esac
done
exit 0
"#;

    /// ssh stand-in for a host that never answers
    const UNREACHABLE_SSH: &str = r#"#!/bin/sh
echo "ssh: connect to host 203.0.113.10 port 2222: Connection refused" >&2
exit 255
"#;

    fn fake_ssh(dir: &std::path::Path, script: &str) -> SshHost {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("ssh");
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut target = target();
        target.ssh_program = Some(program);
        SshHost::from_target(&target).unwrap()
    }

    const LIMIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_run_command_reports_remote_status() {
        let temp_dir = tempfile::tempdir().unwrap();
        let host = fake_ssh(temp_dir.path(), LOOPBACK_SSH);

        host.open().await.unwrap();
        let output = host
            .run_command("echo out; echo err >&2; exit 3", LIMIT)
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        host.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_exit_255_is_not_a_lost_connection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let host = fake_ssh(temp_dir.path(), LOOPBACK_SSH);

        let output = host
            .run_command("echo 'Bad configuration option' >&2; exit 255", LIMIT)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 255);
        assert_eq!(output.stderr, "Bad configuration option\n");
    }

    #[tokio::test]
    async fn test_write_file_over_ssh() {
        let temp_dir = tempfile::tempdir().unwrap();
        let host = fake_ssh(temp_dir.path(), LOOPBACK_SSH);
        let path = temp_dir.path().join("motd");

        host.write_file(
            path.to_str().unwrap(),
            "it's a 'quoted' line\n",
            Some(0o600),
            None,
            LIMIT,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "it's a 'quoted' line\n");
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::metadata(&path).unwrap().permissions().mode()
        };
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_lost() {
        let temp_dir = tempfile::tempdir().unwrap();
        let host = fake_ssh(temp_dir.path(), UNREACHABLE_SSH);

        let opened = host.open().await.unwrap_err();
        assert!(opened.is_connection_lost());

        let ran = host.run_command("true", LIMIT).await.unwrap_err();
        assert!(ran.is_connection_lost());
        assert!(ran.to_string().contains("Connection refused"));

        host.close().await.unwrap();
    }
}
