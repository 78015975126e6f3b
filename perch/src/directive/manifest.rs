// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manifest file parser
//!
//! A manifest is a TOML document holding the ordered directive list and the
//! handlers those directives may notify.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use super::{parse_mode, Body, ChangePolicy, Directive, FailurePolicy, RiskClass};
use crate::error::{PerchError, Result};
use crate::gate::STAGED_PLACEHOLDER;
use crate::handlers::Handler;

/// An ordered list of directives plus the handlers they notify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Default variables, overridden by configuration and the command line
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,

    /// Directives in execution order
    #[serde(default)]
    pub directives: Vec<Directive>,

    /// Deferred actions notified by directives
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

impl Manifest {
    /// Parse a manifest from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PerchError::ManifestNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents, &path.display().to_string())
    }

    /// Parse a manifest from TOML content; `origin` names the source in errors
    pub fn from_toml(contents: &str, origin: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| PerchError::ManifestParseError {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Look up a handler by name
    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.iter().find(|handler| handler.name == name)
    }

    /// Check the structural rules every manifest must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("Manifest name cannot be empty"));
        }

        if self.directives.is_empty() {
            return Err(invalid(format!(
                "Manifest '{}' has no directives defined",
                self.name
            )));
        }

        let mut handler_names = HashSet::new();
        for handler in &self.handlers {
            if handler.name.is_empty() {
                return Err(invalid("Handler name cannot be empty"));
            }
            if !handler_names.insert(handler.name.as_str()) {
                return Err(invalid(format!("Duplicate handler name: {}", handler.name)));
            }
            validate_body(&handler.name, &handler.body)?;
        }

        let mut ids = HashSet::new();
        for directive in &self.directives {
            if directive.id.is_empty() {
                return Err(invalid("Directive id cannot be empty"));
            }
            if !ids.insert(directive.id.as_str()) {
                return Err(invalid(format!("Duplicate directive id: {}", directive.id)));
            }
            validate_directive(directive, &handler_names)?;
        }

        Ok(())
    }
}

fn validate_directive(directive: &Directive, handlers: &HashSet<&str>) -> Result<()> {
    let id = &directive.id;

    if let Some(unknown) = directive
        .notifies
        .iter()
        .find(|name| !handlers.contains(name.as_str()))
    {
        return Err(invalid(format!(
            "Directive '{}' notifies unknown handler '{}'",
            id, unknown
        )));
    }

    if directive.requires_gate() {
        if directive.risk_class == RiskClass::LockoutRisk && directive.validator.is_none() {
            return Err(invalid(format!(
                "Directive '{}' is lockout_risk but has no validator",
                id
            )));
        }
        if !matches!(directive.body, Body::File { .. }) {
            return Err(invalid(format!(
                "Directive '{}' needs a validator, which only applies to file bodies",
                id
            )));
        }
        if let Some(validator) = &directive.validator {
            if !validator.contains(STAGED_PLACEHOLDER) {
                return Err(invalid(format!(
                    "Directive '{}' validator must reference the staged file as {}",
                    id, STAGED_PLACEHOLDER
                )));
            }
        }
    }

    if let FailurePolicy::CustomPredicate(predicate) = &directive.failure_policy {
        if !matches!(directive.body, Body::Command { .. }) {
            return Err(invalid(format!(
                "Directive '{}' uses custom_predicate, which only applies to command bodies",
                id
            )));
        }
        if predicate.exit_codes.is_empty() {
            return Err(invalid(format!(
                "Directive '{}' custom_predicate accepts no exit codes",
                id
            )));
        }
        predicate.compile(id)?;
    }

    if let Body::Command { changed_when, .. } = &directive.body {
        if directive.effective_change_policy() == ChangePolicy::DetectByOutput
            && changed_when.is_none()
        {
            return Err(invalid(format!(
                "Directive '{}' uses detect_by_output but sets no changed_when pattern",
                id
            )));
        }
    }

    if directive.timeout_secs == Some(0) {
        return Err(invalid(format!("Directive '{}' has a zero timeout", id)));
    }

    validate_body(id, &directive.body)
}

fn validate_body(owner: &str, body: &Body) -> Result<()> {
    match body {
        Body::Command { cmd, changed_when } => {
            if cmd.trim().is_empty() {
                return Err(invalid(format!("'{}' has an empty command", owner)));
            }
            if let Some(pattern) = changed_when {
                regex::Regex::new(pattern).map_err(|e| {
                    invalid(format!("'{}' has an invalid changed_when: {}", owner, e))
                })?;
            }
        }
        Body::Probe { cmd } => {
            if cmd.trim().is_empty() {
                return Err(invalid(format!("'{}' has an empty command", owner)));
            }
        }
        Body::File { path, mode, .. } => {
            if path.trim().is_empty() {
                return Err(invalid(format!("'{}' has an empty path", owner)));
            }
            if let Some(mode) = mode {
                parse_mode(owner, mode)?;
            }
        }
        Body::Service { name, .. } => {
            if name.trim().is_empty() {
                return Err(invalid(format!("'{}' has an empty service name", owner)));
            }
        }
        Body::Package { names, .. } => {
            if names.is_empty() {
                return Err(invalid(format!("'{}' lists no packages", owner)));
            }
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> PerchError {
    PerchError::InvalidManifest {
        message: message.into(),
    }
}
