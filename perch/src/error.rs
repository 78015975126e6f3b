// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for Kea-Perch

use thiserror::Error;

/// Result type alias for Kea-Perch operations
pub type Result<T> = std::result::Result<T, PerchError>;

/// Errors that can occur during Perch operations
#[derive(Error, Debug)]
pub enum PerchError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Manifest parsing error
    #[error("Failed to parse manifest '{path}': {message}")]
    ManifestParseError { path: String, message: String },

    /// Manifest not found
    #[error("Manifest not found: {path}")]
    ManifestNotFound { path: String },

    /// Manifest is structurally invalid
    #[error("Invalid manifest: {message}")]
    InvalidManifest { message: String },

    /// Target not declared in the configuration
    #[error("Unknown target: {name}")]
    UnknownTarget { name: String },

    /// A template could not be rendered against the run context
    #[error("Failed to render '{field}' of '{owner}': {message}")]
    RenderFailed {
        owner: String,
        field: String,
        message: String,
    },

    /// The host could not be reached, or stopped answering mid-run
    #[error("Connection to '{host}' lost: {message}")]
    ConnectionLost { host: String, message: String },

    /// An external command ran past its deadline
    #[error("Command timed out after {seconds} seconds: {command}")]
    Timeout { command: String, seconds: u64 },

    /// A host-side file operation failed
    #[error("Failed to write '{path}': {message}")]
    WriteFailed { path: String, message: String },

    /// A command or path cannot be quoted for the remote shell
    #[error("Cannot quote for the remote shell: {input}")]
    UnquotableCommand { input: String },

    /// Invalid CLI variable assignment
    #[error("Invalid variable '{input}': expected KEY=VALUE")]
    InvalidVariable { input: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl PerchError {
    /// Whether this error means the host connection itself is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, PerchError::ConnectionLost { .. })
    }
}
