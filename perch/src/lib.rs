// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Perch: Declarative host convergence for the Kea ecosystem
//!
//! The Perch takes a freshly provisioned machine and settles it into its
//! declared shape. It applies an ordered manifest of idempotent directives
//! over a local shell or `ssh`, and it never commits a lockout-risky file
//! the host has not validated first.
//!
//! # Features
//!
//! * **Idempotent Directives:** Every directive reports whether it changed anything
//! * **Validation Gate:** Stage, validate, then atomically replace risky files
//! * **Deferred Handlers:** Notified handlers fire once, after the last directive
//! * **Tag Scoping:** Include and exclude tags without reordering the manifest

pub mod config;
pub mod directive;
pub mod error;
pub mod executor;
pub mod gate;
pub mod handlers;
pub mod host;
pub mod plan;
pub mod report;
pub mod run;

pub use config::Config;
pub use directive::{load_manifest, Context, Directive, Manifest};
pub use error::{PerchError, Result};
pub use plan::{Plan, TagFilter};
pub use report::RunReport;
pub use run::{Interrupt, Run, RunOptions};
