//! Path-map rules: merge, push, resolve, and shared-rule tracking.

pub mod reconciler;
pub mod resolver;
pub mod rule;
pub mod shared;

use std::path::Path;

use thiserror::Error;

use crate::channel::transport::TransportError;

pub use reconciler::{apply, is_different, reconcile, strip_for_push, synchronize};
pub use rule::{PathMapRule, RuleOwner};
pub use shared::{SharedRuleDelta, SharedRuleStore};

#[derive(Error, Debug)]
pub enum PathMapError {
    #[error("could not read the remote path map: {0}")]
    Get(#[source] TransportError),

    #[error("could not set the remote path map: {0}")]
    Set(#[source] TransportError),

    #[error("could not read rules from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Read a YAML list of rules.
pub fn load_rules(path: &Path) -> Result<Vec<PathMapRule>, PathMapError> {
    let text = std::fs::read_to_string(path).map_err(|e| PathMapError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml_bw::from_str(&text).map_err(|e| PathMapError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
