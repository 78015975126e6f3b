// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for Kea-Perch

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PerchError, Result};

/// Main configuration structure for Perch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Perch instance name
    pub name: String,

    /// Default manifest applied when none is given on the command line
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Execution limits
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Run report settings
    #[serde(default)]
    pub report: ReportConfig,

    /// Variables shared by every target
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,

    /// Hosts that can be converged
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default timeout applied to every external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Run report configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directive ids whose ignored failures do not fail the run
    #[serde(default)]
    pub allowed_failures: Vec<String>,
}

/// How Perch reaches a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Commands run on this machine through `sh -c`
    Local,
    /// Commands run through the system `ssh` client
    Ssh,
}

/// A single convergence target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name, also exposed to templates as `target`
    pub name: String,

    /// Connection type
    #[serde(default = "default_connection")]
    pub connection: ConnectionKind,

    /// Hostname or address (ssh only)
    #[serde(default)]
    pub address: Option<String>,

    /// Remote user (ssh only)
    #[serde(default)]
    pub user: Option<String>,

    /// Remote port (ssh only)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key passed to `ssh -i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Extra `-o` options passed to ssh
    #[serde(default)]
    pub ssh_options: Vec<String>,

    /// ssh client binary (defaults to `ssh` on `PATH`)
    #[serde(default)]
    pub ssh_program: Option<PathBuf>,

    /// Variables specific to this target
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "perch".to_string(),
            manifest: default_manifest(),
            execution: ExecutionConfig::default(),
            report: ReportConfig::default(),
            vars: BTreeMap::new(),
            targets: default_targets(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TargetConfig {
    /// A target that converges the local machine
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: ConnectionKind::Local,
            address: None,
            user: None,
            port: default_ssh_port(),
            identity_file: None,
            ssh_options: Vec::new(),
            ssh_program: None,
            vars: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PerchError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PerchError::InvalidConfig {
                message: "Perch name cannot be empty".to_string(),
            });
        }

        if self.execution.command_timeout_secs == 0 {
            return Err(PerchError::InvalidConfig {
                message: "execution.command_timeout_secs must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(PerchError::InvalidConfig {
                    message: "Target name cannot be empty".to_string(),
                });
            }
            if !seen.insert(target.name.as_str()) {
                return Err(PerchError::InvalidConfig {
                    message: format!("Duplicate target name: {}", target.name),
                });
            }
            if target.connection == ConnectionKind::Ssh && target.address.is_none() {
                return Err(PerchError::InvalidConfig {
                    message: format!("Target '{}' uses ssh but has no address", target.name),
                });
            }
        }

        Ok(())
    }

    /// Default timeout for external commands
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.command_timeout_secs)
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|target| target.name == name)
            .ok_or_else(|| PerchError::UnknownTarget {
                name: name.to_string(),
            })
    }

    /// Resolve a list of target names; an empty list selects every target
    pub fn select_targets(&self, names: &[String]) -> Result<Vec<&TargetConfig>> {
        if names.is_empty() {
            return Ok(self.targets.iter().collect());
        }
        names.iter().map(|name| self.target(name)).collect()
    }
}

// Default value functions

fn default_manifest() -> PathBuf {
    PathBuf::from("site.toml")
}

fn default_command_timeout() -> u64 {
    120 // 2 minutes
}

fn default_connection() -> ConnectionKind {
    ConnectionKind::Ssh
}

fn default_ssh_port() -> u16 {
    22
}

fn default_targets() -> Vec<TargetConfig> {
    vec![TargetConfig::local("localhost")]
}

fn default_log_level() -> String {
    "warn".to_string()
}
