// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directive model and manifest loading
//!
//! Directives are the unit of convergence: one idempotent action with its
//! tags, guard, risk class and policies. Manifests group them with the
//! handlers they notify.

mod context;
mod manifest;
mod model;

pub use context::{Context, ContextBuilder};
pub use manifest::Manifest;
pub use model::{
    parse_mode, Body, ChangePolicy, CompiledPredicate, ConcreteAction, Directive, FailurePolicy,
    FileSpec, Guard, PackageState, Rendered, RiskClass, ServiceState, SuccessPredicate,
};

use std::path::Path;
use crate::error::Result;

/// Load and validate a manifest from a file
///
/// # Arguments
///
/// * `path` - Path to the manifest file
///
/// # Returns
///
/// The parsed manifest or an error
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let manifest = Manifest::from_file(path)?;
    manifest.validate()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_manifest_validates() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("empty.toml");
        fs::write(&path, "name = \"empty\"\n").unwrap();

        assert!(Manifest::from_file(&path).is_ok());
        assert!(load_manifest(&path).is_err());
    }

    #[test]
    fn test_load_manifest_nonexistent() {
        assert!(load_manifest("/nonexistent/site.toml").is_err());
    }
}
