// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable variable snapshot used to evaluate guards and render templates

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior};

use crate::error::{PerchError, Result};

/// Variables resolved once at the start of a run.
///
/// Cloning is cheap and every clone sees the same values; nothing can
/// mutate a context after [`ContextBuilder::build`].
#[derive(Clone)]
pub struct Context {
    vars: Arc<BTreeMap<String, toml::Value>>,
    env: Arc<Environment<'static>>,
}

/// Layered construction of a [`Context`]; later layers win
#[derive(Debug, Default)]
pub struct ContextBuilder {
    vars: BTreeMap<String, toml::Value>,
}

impl ContextBuilder {
    /// Merge a layer of variables over what is already present
    pub fn layer(mut self, vars: &BTreeMap<String, toml::Value>) -> Self {
        for (key, value) in vars {
            self.vars.insert(key.clone(), value.clone());
        }
        self
    }

    /// Set a single variable
    pub fn set(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Apply `KEY=VALUE` assignments from the command line
    pub fn assignments(mut self, assignments: &[String]) -> Result<Self> {
        for input in assignments {
            let (key, value) = input
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| PerchError::InvalidVariable {
                    input: input.clone(),
                })?;
            self.vars
                .insert(key.trim().to_string(), toml::Value::String(value.to_string()));
        }
        Ok(self)
    }

    /// Freeze the variables
    pub fn build(self) -> Context {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        // Rendered files must keep their final newline byte-for-byte.
        env.set_keep_trailing_newline(true);

        Context {
            vars: Arc::new(self.vars),
            env: Arc::new(env),
        }
    }
}

impl Context {
    /// Start building a context
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// An empty context
    pub fn empty() -> Self {
        ContextBuilder::default().build()
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.vars.get(key)
    }

    /// All variables, sorted by name
    pub fn vars(&self) -> &BTreeMap<String, toml::Value> {
        &self.vars
    }

    /// Whether a variable is set to something other than a false-like value
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(toml::Value::Boolean(value)) => *value,
            Some(toml::Value::Integer(value)) => *value != 0,
            Some(toml::Value::Float(value)) => *value != 0.0,
            Some(toml::Value::String(value)) => !matches!(
                value.trim().to_lowercase().as_str(),
                "" | "0" | "false" | "no" | "off"
            ),
            Some(toml::Value::Array(values)) => !values.is_empty(),
            Some(toml::Value::Table(values)) => !values.is_empty(),
            Some(toml::Value::Datetime(_)) => true,
        }
    }

    /// String form of a variable, as templates would print it
    pub fn display(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// Render a template against this context
    pub fn render(&self, owner: &str, field: &str, template: &str) -> Result<String> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }

        self.env
            .render_str(template, &*self.vars)
            .map_err(|error| PerchError::RenderFailed {
                owner: owner.to_string(),
                field: field.to_string(),
                message: error.to_string(),
            })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Context")
            .field("vars", &self.vars)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_override_in_order() {
        let mut base = BTreeMap::new();
        base.insert("ssh_port".to_string(), toml::Value::Integer(22));
        base.insert("admin_user".to_string(), toml::Value::from("admin"));

        let mut target = BTreeMap::new();
        target.insert("ssh_port".to_string(), toml::Value::Integer(2222));

        let context = Context::builder()
            .layer(&base)
            .layer(&target)
            .assignments(&["admin_user=deploy".to_string()])
            .unwrap()
            .build();

        assert_eq!(context.display("ssh_port").as_deref(), Some("2222"));
        assert_eq!(context.display("admin_user").as_deref(), Some("deploy"));
    }

    #[test]
    fn test_invalid_assignment() {
        let result = Context::builder().assignments(&["no-equals-sign".to_string()]);
        assert!(matches!(result, Err(PerchError::InvalidVariable { .. })));

        let result = Context::builder().assignments(&["=value".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_render_substitutes_variables() {
        let context = Context::builder()
            .set("admin_user", "deploy")
            .set("ssh_port", 2222)
            .build();

        let rendered = context
            .render("d", "cmd", "usermod -aG sudo {{ admin_user }} # {{ ssh_port }}")
            .unwrap();
        assert_eq!(rendered, "usermod -aG sudo deploy # 2222");
    }

    #[test]
    fn test_render_keeps_trailing_newline() {
        let context = Context::builder().set("port", 22).build();
        let rendered = context.render("d", "content", "Port {{ port }}\n").unwrap();
        assert_eq!(rendered, "Port 22\n");
    }

    #[test]
    fn test_render_missing_variable_fails() {
        let context = Context::empty();
        let result = context.render("create-user", "cmd", "useradd {{ admin_user }}");
        match result {
            Err(PerchError::RenderFailed { owner, field, .. }) => {
                assert_eq!(owner, "create-user");
                assert_eq!(field, "cmd");
            }
            other => panic!("Expected RenderFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_truthiness() {
        let context = Context::builder()
            .set("yes", true)
            .set("no", false)
            .set("zero", 0)
            .set("word", "enabled")
            .set("off", "off")
            .build();

        assert!(context.is_truthy("yes"));
        assert!(!context.is_truthy("no"));
        assert!(!context.is_truthy("zero"));
        assert!(context.is_truthy("word"));
        assert!(!context.is_truthy("off"));
        assert!(!context.is_truthy("missing"));
    }
}
