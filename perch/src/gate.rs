// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation gate for lockout-risky file replacements
//!
//! A proposed file is written next to the live one, checked by a validator
//! command, and only then renamed over the live path. The phases are types:
//! [`Staged`] can only become [`Validated`] or [`Rejected`], and only a
//! [`Validated`] file can be committed. A rejected file never reaches the
//! live path.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directive::FileSpec;
use crate::error::{PerchError, Result};
use crate::host::{quote, CommandOutput, Host};

/// Suffix of the staged copy, next to the live file
pub const STAGED_SUFFIX: &str = ".perch-staged";

/// Suffix of the backup kept when a live file is replaced
pub const BACKUP_SUFFIX: &str = ".perch-backup";

/// Placeholder in validator commands replaced by the staged path
pub const STAGED_PLACEHOLDER: &str = "%s";

/// Furthest phase a gated directive reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    /// Proposed content written to the staging path
    Staged,
    /// Validator accepted the staged file
    Validated,
    /// Staged file renamed over the live path
    Committed,
    /// Validator refused the staged file
    Rejected,
}

impl std::fmt::Display for GatePhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatePhase::Staged => write!(formatter, "staged"),
            GatePhase::Validated => write!(formatter, "validated"),
            GatePhase::Committed => write!(formatter, "committed"),
            GatePhase::Rejected => write!(formatter, "rejected"),
        }
    }
}

/// Staged paths that still exist on the host
///
/// The run removes whatever is left here on every exit path.
#[derive(Debug, Default)]
pub struct StagingArea {
    paths: Mutex<BTreeSet<String>>,
}

impl StagingArea {
    /// Create an empty staging area
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, path: &str) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path.to_string());
        }
    }

    fn release(&self, path: &str) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.remove(path);
        }
    }

    /// Paths currently staged
    pub fn pending(&self) -> Vec<String> {
        self.paths
            .lock()
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every leftover staged file
    pub async fn cleanup(&self, host: &dyn Host, limit: Duration) {
        for path in self.pending() {
            match remove(host, &path, limit).await {
                Ok(()) => {
                    debug!(path = %path, "Removed staged file");
                    self.release(&path);
                }
                Err(e) => warn!(path = %path, error = %e, "Failed to remove staged file"),
            }
        }
    }
}

/// Entry point of the gate
pub struct ValidationGate<'a> {
    host: &'a dyn Host,
    staging: &'a StagingArea,
    limit: Duration,
}

/// Proposed content sitting at the staging path
pub struct Staged<'a> {
    gate: ValidationGate<'a>,
    file: FileSpec,
    staged_path: String,
}

/// Staged content the validator accepted
pub struct Validated<'a> {
    staged: Staged<'a>,
    output: CommandOutput,
}

/// Validator verdict
pub enum Verdict<'a> {
    /// Safe to commit
    Validated(Validated<'a>),
    /// Refused; the staged file is already gone
    Rejected(Rejected),
}

/// Why the validator refused the staged file
#[derive(Debug, Clone)]
pub struct Rejected {
    /// Validator output, when it ran to completion
    pub output: Option<CommandOutput>,
    /// Human-readable reason
    pub reason: String,
}

/// Result of a committed replacement
#[derive(Debug, Clone)]
pub struct Committed {
    /// Where the previous live file was saved, if there was one
    pub backup: Option<String>,
    /// Validator output
    pub output: CommandOutput,
}

impl<'a> ValidationGate<'a> {
    /// Create a gate bound to a host
    pub fn new(host: &'a dyn Host, staging: &'a StagingArea, limit: Duration) -> Self {
        Self {
            host,
            staging,
            limit,
        }
    }

    /// Write the proposed file to its staging path
    pub async fn stage(self, file: &FileSpec) -> Result<Staged<'a>> {
        let staged_path = format!("{}{}", file.path, STAGED_SUFFIX);
        self.staging.track(&staged_path);

        debug!(path = %file.path, staged = %staged_path, "Staging proposed file");
        self.host
            .write_file(
                &staged_path,
                &file.content,
                file.mode,
                file.owner.as_deref(),
                self.limit,
            )
            .await?;

        Ok(Staged {
            gate: self,
            file: file.clone(),
            staged_path,
        })
    }
}

impl<'a> Staged<'a> {
    /// Path of the staged copy
    pub fn path(&self) -> &str {
        &self.staged_path
    }

    /// Run the validator against the staged copy
    ///
    /// Non-zero exits and timeouts reject; only a lost connection is an error.
    pub async fn validate(self, validator: &str) -> Result<Verdict<'a>> {
        let command = validator.replace(STAGED_PLACEHOLDER, &quote(&self.staged_path)?);
        info!(path = %self.file.path, validator = %command, "Validating staged file");

        let outcome = self.gate.host.run_command(&command, self.gate.limit).await;
        let rejection = match outcome {
            Ok(output) if output.success() => {
                return Ok(Verdict::Validated(Validated {
                    staged: self,
                    output,
                }));
            }
            Ok(output) => Rejected {
                reason: format!(
                    "validator exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
                output: Some(output),
            },
            Err(e @ PerchError::Timeout { .. }) => Rejected {
                reason: e.to_string(),
                output: None,
            },
            Err(e) => return Err(e),
        };

        warn!(path = %self.file.path, reason = %rejection.reason, "Staged file rejected");
        self.discard().await?;
        Ok(Verdict::Rejected(rejection))
    }

    async fn discard(self) -> Result<()> {
        remove(self.gate.host, &self.staged_path, self.gate.limit).await?;
        self.gate.staging.release(&self.staged_path);
        Ok(())
    }
}

impl<'a> Validated<'a> {
    /// Keep a backup of the live file and rename the staged copy over it
    pub async fn commit(self) -> Result<Committed> {
        let Validated { staged, output } = self;
        let host = staged.gate.host;
        let limit = staged.gate.limit;
        let live = quote(&staged.file.path)?;

        let exists = host
            .run_command(&format!("test -e {}", live), limit)
            .await?
            .success();

        let backup = if exists {
            let backup = format!("{}{}", staged.file.path, BACKUP_SUFFIX);
            run_checked(
                host,
                &staged.file.path,
                &format!("cp -p -- {} {}", live, quote(&backup)?),
                limit,
            )
            .await?;
            Some(backup)
        } else {
            None
        };

        run_checked(
            host,
            &staged.file.path,
            &format!("mv -f -- {} {}", quote(&staged.staged_path)?, live),
            limit,
        )
        .await?;
        staged.gate.staging.release(&staged.staged_path);

        info!(path = %staged.file.path, backup = ?backup, "Committed validated file");
        Ok(Committed { backup, output })
    }

    /// Throw the staged copy away without touching the live path
    pub async fn discard(self) -> Result<()> {
        self.staged.discard().await
    }
}

async fn run_checked(host: &dyn Host, path: &str, command: &str, limit: Duration) -> Result<()> {
    let output = host.run_command(command, limit).await?;
    if output.success() {
        Ok(())
    } else {
        Err(PerchError::WriteFailed {
            path: path.to_string(),
            message: format!("'{}' failed: {}", command, output.stderr.trim()),
        })
    }
}

async fn remove(host: &dyn Host, path: &str, limit: Duration) -> Result<()> {
    run_checked(host, path, &format!("rm -f -- {}", quote(path)?), limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use std::fs;
    use tempfile::tempdir;

    const LIMIT: Duration = Duration::from_secs(10);

    fn spec(path: &std::path::Path, content: &str) -> FileSpec {
        FileSpec {
            path: path.to_str().unwrap().to_string(),
            content: content.to_string(),
            mode: Some(0o600),
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_rejected_file_never_reaches_live_path() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("sshd_config");
        fs::write(&live, "Port 22\n").unwrap();

        let host = LocalHost::new("local");
        let staging = StagingArea::new();
        let gate = ValidationGate::new(&host, &staging, LIMIT);

        let staged = gate.stage(&spec(&live, "Port banana\n")).await.unwrap();
        assert!(std::path::Path::new(staged.path()).exists());

        let verdict = staged
            .validate("grep -Eq '^Port [0-9]+$' %s")
            .await
            .unwrap();
        match verdict {
            Verdict::Rejected(rejected) => {
                assert_eq!(rejected.output.unwrap().exit_code, 1);
            }
            Verdict::Validated(_) => panic!("Expected rejection"),
        }

        assert_eq!(fs::read_to_string(&live).unwrap(), "Port 22\n");
        assert!(!temp_dir.path().join("sshd_config.perch-staged").exists());
        assert!(staging.pending().is_empty());
    }

    #[tokio::test]
    async fn test_validated_file_is_committed_with_backup() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("sshd_config");
        fs::write(&live, "Port 22\n").unwrap();

        let host = LocalHost::new("local");
        let staging = StagingArea::new();
        let gate = ValidationGate::new(&host, &staging, LIMIT);

        let staged = gate.stage(&spec(&live, "Port 2222\n")).await.unwrap();
        let committed = match staged.validate("grep -Eq '^Port [0-9]+$' %s").await.unwrap() {
            Verdict::Validated(validated) => validated.commit().await.unwrap(),
            Verdict::Rejected(rejected) => panic!("Unexpected rejection: {}", rejected.reason),
        };

        assert_eq!(fs::read_to_string(&live).unwrap(), "Port 2222\n");
        let backup = committed.backup.unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), "Port 22\n");
        assert!(staging.pending().is_empty());
    }

    #[tokio::test]
    async fn test_commit_without_existing_file_has_no_backup() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("jail.local");

        let host = LocalHost::new("local");
        let staging = StagingArea::new();
        let gate = ValidationGate::new(&host, &staging, LIMIT);

        let staged = gate.stage(&spec(&live, "[sshd]\n")).await.unwrap();
        let committed = match staged.validate("test -s %s").await.unwrap() {
            Verdict::Validated(validated) => validated.commit().await.unwrap(),
            Verdict::Rejected(rejected) => panic!("Unexpected rejection: {}", rejected.reason),
        };

        assert!(committed.backup.is_none());
        assert_eq!(fs::read_to_string(&live).unwrap(), "[sshd]\n");
    }

    #[tokio::test]
    async fn test_discard_after_validation() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("sshd_config");
        fs::write(&live, "Port 22\n").unwrap();

        let host = LocalHost::new("local");
        let staging = StagingArea::new();
        let gate = ValidationGate::new(&host, &staging, LIMIT);

        let staged = gate.stage(&spec(&live, "Port 2222\n")).await.unwrap();
        match staged.validate("true").await.unwrap() {
            Verdict::Validated(validated) => validated.discard().await.unwrap(),
            Verdict::Rejected(_) => panic!("Expected validation"),
        }

        assert_eq!(fs::read_to_string(&live).unwrap(), "Port 22\n");
        assert!(staging.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_leftovers() {
        let temp_dir = tempdir().unwrap();
        let live = temp_dir.path().join("sshd_config");

        let host = LocalHost::new("local");
        let staging = StagingArea::new();
        let gate = ValidationGate::new(&host, &staging, LIMIT);

        let staged = gate.stage(&spec(&live, "Port 22\n")).await.unwrap();
        let staged_path = staged.path().to_string();
        drop(staged);

        assert_eq!(staging.pending(), vec![staged_path.clone()]);
        staging.cleanup(&host, LIMIT).await;
        assert!(!std::path::Path::new(&staged_path).exists());
        assert!(staging.pending().is_empty());
    }
}
