// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed directives, their guards and policies
//!
//! Everything here is pure data. Evaluating a guard or rendering a body only
//! reads the [`Context`]; nothing touches the host.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Context;
use crate::error::{PerchError, Result};

/// One idempotent configuration action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    /// Stable name, unique within a manifest
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Labels used for tag filtering
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Precondition; a false guard skips the directive
    #[serde(default)]
    pub guard: Guard,

    /// The action to perform
    pub body: Body,

    /// Command run against the staged file before it goes live (`%s` is the staged path)
    #[serde(default)]
    pub validator: Option<String>,

    /// Whether a bad change could lock the operator out
    #[serde(default)]
    pub risk_class: RiskClass,

    /// What a failed action means for the run
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How the directive decides whether it changed anything
    #[serde(default)]
    pub change_policy: Option<ChangePolicy>,

    /// Handlers to notify when the directive changes state
    #[serde(default)]
    pub notifies: Vec<String>,

    /// Per-directive override of the command timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Precondition for a directive
///
/// `when`/`equals` are checked against the context before the run starts.
/// `probe`/`unless` are read-only commands checked on the host just before
/// the directive would run; their exit status is data, never a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    /// Variable that must be truthy (or equal `equals`)
    #[serde(default)]
    pub when: Option<String>,

    /// Expected string value of the `when` variable
    #[serde(default)]
    pub equals: Option<String>,

    /// Run only if this command exits zero
    #[serde(default)]
    pub probe: Option<String>,

    /// Skip if this command exits zero
    #[serde(default)]
    pub unless: Option<String>,
}

/// The action a directive or handler performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Body {
    /// Run a shell command
    Command {
        /// Command template
        cmd: String,
        /// Regex over stdout that marks the command as having changed something
        #[serde(default)]
        changed_when: Option<String>,
    },

    /// Ensure a file has the given content
    File {
        /// Destination path on the host
        path: String,
        /// Content template
        content: String,
        /// Octal permission bits, e.g. "0600"
        #[serde(default)]
        mode: Option<String>,
        /// `user` or `user:group`
        #[serde(default)]
        owner: Option<String>,
    },

    /// Ensure a systemd service is in a state
    Service {
        /// Unit name
        name: String,
        /// Desired state
        #[serde(default)]
        state: ServiceState,
        /// Whether the unit starts at boot
        #[serde(default)]
        enabled: Option<bool>,
    },

    /// Ensure packages are installed or removed
    Package {
        /// Package names
        names: Vec<String>,
        /// Desired state
        #[serde(default)]
        state: PackageState,
    },

    /// Read-only command; recorded, never changed, never failed
    Probe {
        /// Command template
        cmd: String,
    },
}

/// Desired state of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Running; started if inactive
    #[default]
    Started,
    /// Not running; stopped if active
    Stopped,
    /// Restarted unconditionally
    Restarted,
    /// Reloaded unconditionally
    Reloaded,
}

/// Desired state of a package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    /// Installed
    #[default]
    Present,
    /// Not installed
    Absent,
}

/// Lockout classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Misapplying this directive is recoverable
    #[default]
    Safe,
    /// Misapplying this directive can cut off remote access
    LockoutRisk,
}

/// How a failed action is treated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the run
    #[default]
    Fatal,
    /// Record and continue
    Ignored,
    /// The directive decides success from its captured output
    CustomPredicate(SuccessPredicate),
}

/// Directive-supplied success test over captured command output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPredicate {
    /// Exit codes that count as success
    #[serde(default = "default_exit_codes")]
    pub exit_codes: Vec<i32>,

    /// Regex that stdout must match
    #[serde(default)]
    pub stdout_matches: Option<String>,

    /// Whether a non-matching result aborts the run
    #[serde(default = "default_true")]
    pub fatal: bool,
}

/// How a directive reports change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// Every successful execution counts as a change
    AlwaysChanged,
    /// The body's own output decides
    DetectByOutput,
    /// Never counts as a change
    NeverChanged,
}

/// A body with every template resolved
#[derive(Debug, Clone)]
pub enum ConcreteAction {
    /// Shell command
    Command {
        cmd: String,
        changed_when: Option<Regex>,
    },
    /// File content assertion
    File(FileSpec),
    /// Service state assertion
    Service {
        name: String,
        state: ServiceState,
        enabled: Option<bool>,
    },
    /// Package state assertion
    Package {
        names: Vec<String>,
        state: PackageState,
    },
    /// Read-only command
    Probe { cmd: String },
}

/// Fully rendered file write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: String,
    pub content: String,
    pub mode: Option<u32>,
    pub owner: Option<String>,
}

/// Compiled form of a [`SuccessPredicate`]
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    pub exit_codes: Vec<i32>,
    pub stdout_matches: Option<Regex>,
    pub fatal: bool,
}

/// Everything the executor needs, rendered once before the run
#[derive(Debug, Clone)]
pub struct Rendered {
    pub action: ConcreteAction,
    pub validator: Option<String>,
    pub probe: Option<String>,
    pub unless: Option<String>,
    pub predicate: Option<CompiledPredicate>,
}

impl Directive {
    /// Create a directive with default policies
    pub fn new(id: impl Into<String>, body: Body) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tags: BTreeSet::new(),
            guard: Guard::default(),
            body,
            validator: None,
            risk_class: RiskClass::Safe,
            failure_policy: FailurePolicy::Fatal,
            change_policy: None,
            notifies: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Add tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Notify a handler on change
    pub fn notifying(mut self, handler: impl Into<String>) -> Self {
        self.notifies.push(handler.into());
        self
    }

    /// Mark as lockout-risky with the given validator
    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self.risk_class = RiskClass::LockoutRisk;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the change policy
    pub fn with_change_policy(mut self, policy: ChangePolicy) -> Self {
        self.change_policy = Some(policy);
        self
    }

    /// Set the guard
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    /// Change policy after applying the per-body default
    pub fn effective_change_policy(&self) -> ChangePolicy {
        self.change_policy.unwrap_or(match self.body {
            Body::Command { .. } => ChangePolicy::AlwaysChanged,
            Body::Probe { .. } => ChangePolicy::NeverChanged,
            _ => ChangePolicy::DetectByOutput,
        })
    }

    /// Whether the directive must go through the validation gate
    pub fn requires_gate(&self) -> bool {
        self.risk_class == RiskClass::LockoutRisk || self.validator.is_some()
    }

    /// Evaluate the context-only part of the guard
    pub fn evaluate_guard(&self, context: &Context) -> bool {
        let Some(var) = self.guard.when.as_deref() else {
            return true;
        };

        match self.guard.equals.as_deref() {
            Some(expected) => context.display(var).as_deref() == Some(expected),
            None => context.is_truthy(var),
        }
    }

    /// Resolve every template against the context
    pub fn render(&self, context: &Context) -> Result<Rendered> {
        let action = self.body.render(&self.id, context)?;
        let render_opt = |field: &str, template: &Option<String>| -> Result<Option<String>> {
            template
                .as_deref()
                .map(|template| context.render(&self.id, field, template))
                .transpose()
        };

        let predicate = match &self.failure_policy {
            FailurePolicy::CustomPredicate(predicate) => Some(predicate.compile(&self.id)?),
            _ => None,
        };

        Ok(Rendered {
            action,
            validator: render_opt("validator", &self.validator)?,
            probe: render_opt("guard.probe", &self.guard.probe)?,
            unless: render_opt("guard.unless", &self.guard.unless)?,
            predicate,
        })
    }
}

impl Body {
    /// Shorthand for a command body
    pub fn command(cmd: impl Into<String>) -> Self {
        Body::Command {
            cmd: cmd.into(),
            changed_when: None,
        }
    }

    /// Shorthand for a file body
    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Body::File {
            path: path.into(),
            content: content.into(),
            mode: None,
            owner: None,
        }
    }

    /// Short name of the body type
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Command { .. } => "command",
            Body::File { .. } => "file",
            Body::Service { .. } => "service",
            Body::Package { .. } => "package",
            Body::Probe { .. } => "probe",
        }
    }

    /// Resolve templates; `owner` names the directive or handler in errors
    pub fn render(&self, owner: &str, context: &Context) -> Result<ConcreteAction> {
        let action = match self {
            Body::Command { cmd, changed_when } => ConcreteAction::Command {
                cmd: context.render(owner, "cmd", cmd)?,
                changed_when: changed_when
                    .as_deref()
                    .map(|pattern| compile_regex(owner, "changed_when", pattern))
                    .transpose()?,
            },
            Body::File {
                path,
                content,
                mode,
                owner: file_owner,
            } => ConcreteAction::File(FileSpec {
                path: context.render(owner, "path", path)?,
                content: context.render(owner, "content", content)?,
                mode: mode
                    .as_deref()
                    .map(|mode| parse_mode(owner, mode))
                    .transpose()?,
                owner: file_owner
                    .as_deref()
                    .map(|value| context.render(owner, "owner", value))
                    .transpose()?,
            }),
            Body::Service {
                name,
                state,
                enabled,
            } => ConcreteAction::Service {
                name: context.render(owner, "name", name)?,
                state: *state,
                enabled: *enabled,
            },
            Body::Package { names, state } => ConcreteAction::Package {
                names: names
                    .iter()
                    .map(|name| context.render(owner, "names", name))
                    .collect::<Result<_>>()?,
                state: *state,
            },
            Body::Probe { cmd } => ConcreteAction::Probe {
                cmd: context.render(owner, "cmd", cmd)?,
            },
        };
        Ok(action)
    }
}

impl SuccessPredicate {
    /// Compile the regexes
    pub fn compile(&self, owner: &str) -> Result<CompiledPredicate> {
        Ok(CompiledPredicate {
            exit_codes: self.exit_codes.clone(),
            stdout_matches: self
                .stdout_matches
                .as_deref()
                .map(|pattern| compile_regex(owner, "stdout_matches", pattern))
                .transpose()?,
            fatal: self.fatal,
        })
    }
}

impl CompiledPredicate {
    /// Apply the success test to captured output
    pub fn accepts(&self, exit_code: i32, stdout: &str) -> bool {
        self.exit_codes.contains(&exit_code)
            && self
                .stdout_matches
                .as_ref()
                .map_or(true, |pattern| pattern.is_match(stdout))
    }
}

/// Parse an octal mode such as `0600`, `600` or `0o600`
pub fn parse_mode(owner: &str, mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|value| *value <= 0o7777)
        .ok_or_else(|| PerchError::RenderFailed {
            owner: owner.to_string(),
            field: "mode".to_string(),
            message: format!("'{}' is not an octal file mode", mode),
        })
}

fn compile_regex(owner: &str, field: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|error| PerchError::RenderFailed {
        owner: owner.to_string(),
        field: field.to_string(),
        message: error.to_string(),
    })
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_defaults_to_true() {
        let directive = Directive::new("noop", Body::command("true"));
        assert!(directive.evaluate_guard(&Context::empty()));
    }

    #[test]
    fn test_guard_when_and_equals() {
        let context = Context::builder()
            .set("manage_swap", false)
            .set("runtime", "docker")
            .build();

        let swap = Directive::new("swap", Body::command("swapon -a")).with_guard(Guard {
            when: Some("manage_swap".to_string()),
            ..Guard::default()
        });
        assert!(!swap.evaluate_guard(&context));

        let docker = Directive::new("docker", Body::command("true")).with_guard(Guard {
            when: Some("runtime".to_string()),
            equals: Some("docker".to_string()),
            ..Guard::default()
        });
        assert!(docker.evaluate_guard(&context));

        let podman = Directive::new("podman", Body::command("true")).with_guard(Guard {
            when: Some("runtime".to_string()),
            equals: Some("podman".to_string()),
            ..Guard::default()
        });
        assert!(!podman.evaluate_guard(&context));
    }

    #[test]
    fn test_render_file_body() {
        let context = Context::builder().set("ssh_port", 2222).build();
        let directive = Directive::new(
            "sshd-config",
            Body::File {
                path: "/etc/ssh/sshd_config".to_string(),
                content: "Port {{ ssh_port }}\nPermitRootLogin no\n".to_string(),
                mode: Some("0600".to_string()),
                owner: Some("root:root".to_string()),
            },
        )
        .with_validator("sshd -t -f %s");

        let rendered = directive.render(&context).unwrap();
        match rendered.action {
            ConcreteAction::File(spec) => {
                assert_eq!(spec.content, "Port 2222\nPermitRootLogin no\n");
                assert_eq!(spec.mode, Some(0o600));
                assert_eq!(spec.owner.as_deref(), Some("root:root"));
            }
            other => panic!("Expected file action, got {:?}", other),
        }
        assert_eq!(rendered.validator.as_deref(), Some("sshd -t -f %s"));
    }

    #[test]
    fn test_render_rejects_bad_regex() {
        let directive = Directive::new(
            "broken",
            Body::Command {
                cmd: "true".to_string(),
                changed_when: Some("(".to_string()),
            },
        );
        assert!(matches!(
            directive.render(&Context::empty()),
            Err(PerchError::RenderFailed { .. })
        ));
    }

    #[test]
    fn test_effective_change_policy_defaults() {
        assert_eq!(
            Directive::new("c", Body::command("true")).effective_change_policy(),
            ChangePolicy::AlwaysChanged
        );
        assert_eq!(
            Directive::new("f", Body::file("/tmp/x", "")).effective_change_policy(),
            ChangePolicy::DetectByOutput
        );
        assert_eq!(
            Directive::new("p", Body::Probe { cmd: "true".to_string() }).effective_change_policy(),
            ChangePolicy::NeverChanged
        );
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("d", "0644").unwrap(), 0o644);
        assert_eq!(parse_mode("d", "600").unwrap(), 0o600);
        assert_eq!(parse_mode("d", "0o755").unwrap(), 0o755);
        assert!(parse_mode("d", "999").is_err());
        assert!(parse_mode("d", "rw-r--r--").is_err());
    }

    #[test]
    fn test_compiled_predicate() {
        let predicate = SuccessPredicate {
            exit_codes: vec![0, 1],
            stdout_matches: Some("^Status: active".to_string()),
            fatal: false,
        }
        .compile("ufw")
        .unwrap();

        assert!(predicate.accepts(0, "Status: active\n"));
        assert!(predicate.accepts(1, "Status: active\n"));
        assert!(!predicate.accepts(2, "Status: active\n"));
        assert!(!predicate.accepts(0, "Status: inactive\n"));
    }

    #[test]
    fn test_failure_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            failure_policy: FailurePolicy,
        }

        let simple: Wrapper = toml::from_str(r#"failure_policy = "ignored""#).unwrap();
        assert_eq!(simple.failure_policy, FailurePolicy::Ignored);

        let custom: Wrapper = toml::from_str(
            r#"failure_policy = { custom_predicate = { exit_codes = [0, 3], fatal = false } }"#,
        )
        .unwrap();
        match custom.failure_policy {
            FailurePolicy::CustomPredicate(predicate) => {
                assert_eq!(predicate.exit_codes, vec![0, 3]);
                assert!(!predicate.fatal);
                assert!(predicate.stdout_matches.is_none());
            }
            other => panic!("Expected custom predicate, got {:?}", other),
        }
    }
}
