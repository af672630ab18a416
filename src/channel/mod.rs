/*
┌──────────────────────────────────────────────────────────┐
│                     ChannelManager                       │
│  shared table: peer id → (channel, refcount | waiters)   │
└──────────────┬───────────────────────────────────────────┘
               │ open_channel(target, flags)
               ▼
┌──────────────────────────────────────────────────────────┐
│ chain.rs   PeerDirectory::chain_for(target) → hops       │
└──────────────┬───────────────────────────────────────────┘
               ▼
┌──────────────────────────────────────────────────────────┐
│ steps.rs   log-name → [launch va → chain va]* → chain    │
│            → path-map listener → logging                 │
│            run by StepExecutor on the dispatch loop      │
└──────────────┬───────────────────────────────────────────┘
               ▼
┌──────────────────────────────────────────────────────────┐
│ transport.rs   Transport / Channel / remote services     │
│ memory.rs      in-process implementation                 │
└──────────────────────────────────────────────────────────┘
*/
pub mod chain;
pub mod event;
pub mod manager;
pub mod memory;
pub mod peer;
pub mod steps;
pub mod stream_proxy;
pub mod transport;

use std::sync::Arc;

use thiserror::Error;

use crate::{dispatch::DispatchError, stepper::GroupFailure};

pub use chain::{Hop, PeerDirectory};
pub use event::{ChannelEvent, ChannelEventKind, EventBus};
pub use manager::{ChannelManager, ChannelManagerSettings, OpenFlags};
pub use peer::PeerInfo;
pub use transport::{Channel, ChannelRef, ChannelState, Transport, TransportError};

/// `StepData` key of the channel being built.
pub const ATTR_CHANNEL: &str = "channel";
/// `StepData` key of the logical log name.
pub const ATTR_LOG_NAME: &str = "log_name";
/// `StepData` key of the value-add launched by a hop.
pub const ATTR_VALUE_ADD: &str = "value_add";
/// `StepData` key overriding the peer a chain step connects to.
pub const ATTR_ACTIVE_PEER: &str = "active_peer";
/// Set for private channels.
pub const FLAG_FORCE_NEW: &str = "force_new";
pub const FLAG_NO_VALUE_ADD: &str = "no_value_add";
pub const FLAG_NO_PATH_MAP: &str = "no_path_map";
pub const PROP_SKIP_SHUTDOWN_STEP: &str = "skip_shutdown_step";

/// `StepData` key marking a value-add as started by someone else.
pub fn keepalive_key(value_add_id: &str) -> String {
    format!("{value_add_id}.keepalive")
}

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("could not open a channel to `{peer}`: {source}")]
    OpenChannel {
        peer: String,
        #[source]
        source: TransportError,
    },

    #[error("could not redirect the channel to `{peer}`: {source}")]
    Redirect {
        peer: String,
        #[source]
        source: TransportError,
    },

    #[error("channel to target not available or closed")]
    NotAvailable,

    #[error("no chain to `{0}`")]
    NoChain(String),

    #[error("opening `{peer}` failed: {failure}")]
    Failed { peer: String, failure: Arc<GroupFailure> },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ChannelError {
    /// The transport error behind an initial open failure, wherever it sits.
    pub fn open_channel_cause(&self) -> Option<&TransportError> {
        match self {
            ChannelError::OpenChannel { source, .. } => Some(source),
            ChannelError::Failed { failure, .. } => match failure.status.cause::<ChannelError>() {
                Some(ChannelError::OpenChannel { source, .. }) => Some(source),
                _ => None,
            },
            _ => None,
        }
    }
}
