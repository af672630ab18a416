//! Host side of value-add helper processes.
//!
//! A value-add is a short-lived helper that opens a local server the channel
//! is first opened to and then redirected from. One helper instance runs per
//! peer id.

pub mod external;
pub mod simulated;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use value_add::message::PropertiesError;

use crate::channel::peer::PeerInfo;

pub use external::{ExternalValueAdd, ValueAddCommand};
pub use simulated::SimulatedValueAdd;

pub type ValueAddRef = Arc<dyn ValueAdd>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueAddError {
    #[error("could not start `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("value-add died during startup ({status}): {stderr}")]
    Died { status: String, stderr: String },

    #[error("value-add did not announce itself within {timeout_ms} ms")]
    Timeout { timeout_ms: u128, stderr: String },

    #[error("bad value-add output: {source}")]
    Properties {
        #[source]
        source: PropertiesError,
        stderr: String,
    },

    #[error("value-add announced no server for `{0}`")]
    NoPeer(String),

    #[error("value-add i/o failed: {0}")]
    Io(String),
}

/// A helper process that sits in front of a peer.
#[async_trait]
pub trait ValueAdd: Send + Sync {
    /// Stable id; keep-alive markers are scoped by it.
    fn id(&self) -> &str;

    fn label(&self) -> &str {
        self.id()
    }

    /// Whether a helper for `peer_id` is running and usable.
    async fn is_alive(&self, peer_id: &str) -> Result<bool, ValueAddError>;

    /// Start the helper for `peer_id`. A running one is left alone.
    async fn launch(&self, peer_id: &str) -> Result<(), ValueAddError>;

    async fn shutdown(&self, peer_id: &str) -> Result<(), ValueAddError>;

    /// The helper's own server for `peer_id`, once launched.
    fn peer(&self, peer_id: &str) -> Option<PeerInfo>;
}

impl fmt::Debug for dyn ValueAdd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueAdd").field("id", &self.id()).finish()
    }
}
