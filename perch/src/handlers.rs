// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deferred, deduplicated handlers
//!
//! Directives that change state notify handlers by name. Notifications are
//! collected during the run and each handler fires at most once, after the
//! last directive, in the order it was first notified.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::directive::Body;

/// A named post-run action such as restarting a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handler {
    /// Name directives use in `notifies`
    pub name: String,

    /// Action to perform
    pub body: Body,

    /// Per-handler override of the command timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Handler {
    /// Create a handler
    pub fn new(name: impl Into<String>, body: Body) -> Self {
        Self {
            name: name.into(),
            body,
            timeout_secs: None,
        }
    }
}

/// Pending handler names, deduplicated, in first-notified order
#[derive(Debug, Default, Clone)]
pub struct HandlerQueue {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl HandlerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a handler; returns `false` if it was already pending
    pub fn notify(&mut self, name: &str) -> bool {
        if !self.seen.insert(name.to_string()) {
            return false;
        }
        self.order.push(name.to_string());
        true
    }

    /// Whether a handler is pending
    pub fn is_pending(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    /// Pending names in firing order
    pub fn pending(&self) -> &[String] {
        &self.order
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Take every pending name, leaving the queue empty
    pub fn drain(&mut self) -> Vec<String> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_deduplicates() {
        let mut queue = HandlerQueue::new();
        assert!(queue.notify("restart-ssh"));
        assert!(!queue.notify("restart-ssh"));
        assert!(!queue.notify("restart-ssh"));
        assert_eq!(queue.pending(), ["restart-ssh".to_string()]);
    }

    #[test]
    fn test_first_enqueue_order() {
        let mut queue = HandlerQueue::new();
        queue.notify("reload-ufw");
        queue.notify("restart-ssh");
        queue.notify("reload-ufw");
        queue.notify("restart-docker");

        assert_eq!(
            queue.drain(),
            vec!["reload-ufw", "restart-ssh", "restart-docker"]
        );
        assert!(queue.is_empty());
        assert!(!queue.is_pending("reload-ufw"));
    }

    #[test]
    fn test_handler_from_toml() {
        let handler: Handler = toml::from_str(
            r#"
                name = "restart-fail2ban"
                timeout_secs = 30
                body = { type = "service", name = "fail2ban", state = "restarted" }
            "#,
        )
        .unwrap();
        assert_eq!(handler.name, "restart-fail2ban");
        assert_eq!(handler.timeout_secs, Some(30));
        assert_eq!(handler.body.kind(), "service");
    }
}
