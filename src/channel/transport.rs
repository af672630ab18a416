//! The seams to the wire: transports, channels and the two remote services the
//! chain manager uses.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::pathmap::PathMapRule;

use super::peer::PeerInfo;

pub type ChannelRef = Arc<dyn Channel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer `{0}` is not reachable")]
    Unreachable(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("channel is closed")]
    Closed,

    #[error("an open or redirect is already in progress")]
    Busy,

    #[error("no such stream `{0}`")]
    NoSuchStream(String),

    #[error("remote service `{0}` not available")]
    NoService(String),

    #[error("{0}")]
    Io(String),
}

/// Creates channels.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Start opening a channel to `peer`; the channel is returned in
    /// [`ChannelState::Opening`].
    fn open_channel(&self, peer: &PeerInfo) -> ChannelRef;
}

/// One connection, possibly redirected through several hops.
///
/// At most one open or redirect is in flight per channel; `redirect` while
/// opening fails with [`TransportError::Busy`].
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// The peer the channel currently ends at.
    fn remote_peer(&self) -> PeerInfo;

    /// Ask the current remote end to forward the channel to `peer`.
    fn redirect(&self, peer: &PeerInfo) -> Result<(), TransportError>;

    /// Resolves when the pending open or redirect finished.
    async fn wait_open(&self) -> Result<(), TransportError>;

    /// Resolves when the channel is closed, with the error it closed with.
    async fn wait_closed(&self) -> Option<TransportError>;

    fn close(&self);

    /// Close with an error.
    fn terminate(&self, error: TransportError);

    fn remote_services(&self) -> Vec<String>;

    fn path_map(&self) -> Option<Arc<dyn PathMapService>>;

    fn streams(&self) -> Option<Arc<dyn StreamsService>>;
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("remote", &self.remote_peer().id)
            .finish()
    }
}

pub trait PathMapListener: Send + Sync {
    fn changed(&self);
}

/// The agent's path-map service.
#[async_trait]
pub trait PathMapService: Send + Sync {
    /// `None` when the agent has no map yet.
    async fn get(&self) -> Result<Option<Vec<PathMapRule>>, TransportError>;

    async fn set(&self, rules: Vec<PathMapRule>) -> Result<(), TransportError>;

    fn add_listener(&self, listener: Arc<dyn PathMapListener>);

    fn remove_listener(&self, listener: &Arc<dyn PathMapListener>);
}

/// Notifications about streams the agent created or disposed.
pub trait StreamsListener: Send + Sync {
    fn created(&self, stream_type: &str, stream_id: &str, context_id: Option<&str>);

    fn disposed(&self, stream_type: &str, stream_id: &str);
}

/// One read result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    /// Bytes the agent dropped before this chunk.
    pub lost_size: usize,
    pub eos: bool,
}

/// The agent's byte-stream service.
#[async_trait]
pub trait StreamsService: Send + Sync {
    async fn subscribe(&self, stream_type: &str, listener: Arc<dyn StreamsListener>) -> Result<(), TransportError>;

    async fn unsubscribe(&self, stream_type: &str, listener: &Arc<dyn StreamsListener>) -> Result<(), TransportError>;

    /// Waits until data, end of stream, or an error is available.
    async fn read(&self, stream_id: &str, size: usize) -> Result<ReadChunk, TransportError>;

    async fn write(&self, stream_id: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn eos(&self, stream_id: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, stream_id: &str) -> Result<(), TransportError>;
}

/// Identity of a trait object behind an `Arc`, ignoring vtables.
pub(crate) fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
