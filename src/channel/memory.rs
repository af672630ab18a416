//! A deterministic in-process transport.
//!
//! Every peer is reachable unless told otherwise. Opens and redirects complete
//! when awaited, after the configured latency. Each peer gets one path-map and
//! one streams service, shared by every channel that ends at that peer.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace};

use crate::pathmap::PathMapRule;

use super::{
    peer::PeerInfo,
    transport::{
        Channel, ChannelRef, ChannelState, PathMapListener, PathMapService, ReadChunk, StreamsListener,
        StreamsService, Transport, TransportError, same_object,
    },
};

pub const SERVICE_LOCATOR: &str = "Locator";
pub const SERVICE_PATH_MAP: &str = "PathMap";
pub const SERVICE_STREAMS: &str = "Streams";

#[derive(Default)]
struct Inner {
    latency: Mutex<Duration>,
    fail_open: DashMap<String, TransportError>,
    fail_redirect: DashMap<String, TransportError>,
    services: DashMap<String, Vec<String>>,
    path_maps: DashMap<String, Arc<MemoryPathMapService>>,
    streams: DashMap<String, Arc<MemoryStreamsService>>,
    opens: Mutex<Vec<String>>,
    redirects: Mutex<Vec<(String, String)>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    next_id: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
        self
    }

    /// Opening a channel to `peer_id` fails with `error`.
    pub fn fail_open(&self, peer_id: &str, error: TransportError) {
        self.inner.fail_open.insert(peer_id.to_string(), error);
    }

    /// Redirecting a channel to `peer_id` fails with `error`.
    pub fn fail_redirect(&self, peer_id: &str, error: TransportError) {
        self.inner.fail_redirect.insert(peer_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.inner.fail_open.clear();
        self.inner.fail_redirect.clear();
    }

    pub fn set_services(&self, peer_id: &str, services: Vec<String>) {
        self.inner.services.insert(peer_id.to_string(), services);
    }

    pub fn path_map_for(&self, peer_id: &str) -> Arc<MemoryPathMapService> {
        self.inner
            .path_maps
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(MemoryPathMapService::default()))
            .clone()
    }

    pub fn streams_for(&self, peer_id: &str) -> Arc<MemoryStreamsService> {
        self.inner
            .streams
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStreamsService::default()))
            .clone()
    }

    /// Peer ids `open_channel` was called for, in order.
    pub fn opens(&self) -> Vec<String> {
        self.inner.opens.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// `(from, to)` peer ids of every redirect, in order.
    pub fn redirects(&self) -> Vec<(String, String)> {
        self.inner.redirects.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn channels(&self) -> Vec<ChannelRef> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.clone() as ChannelRef)
            .collect()
    }

    fn latency(&self) -> Duration {
        *self.inner.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn open_channel(&self, peer: &PeerInfo) -> ChannelRef {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MemoryChannel::new(format!("mem-{n}"), peer.clone(), self.clone()));
        self.inner.opens.lock().unwrap_or_else(PoisonError::into_inner).push(peer.id.clone());
        self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner).push(channel.clone());
        debug!(channel = %channel.id, peer = %peer.id, "memory channel opening");
        channel
    }
}

enum Pending {
    Open,
    Redirect,
}

pub struct MemoryChannel {
    id: String,
    transport: MemoryTransport,
    state: watch::Sender<ChannelState>,
    remote: Mutex<PeerInfo>,
    pending: Mutex<Option<Pending>>,
    close_error: Mutex<Option<TransportError>>,
    transition: tokio::sync::Mutex<()>,
}

impl MemoryChannel {
    fn new(id: String, peer: PeerInfo, transport: MemoryTransport) -> Self {
        let (state, _) = watch::channel(ChannelState::Opening);
        Self {
            id,
            transport,
            state,
            remote: Mutex::new(peer),
            pending: Mutex::new(Some(Pending::Open)),
            close_error: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn close_error(&self) -> Option<TransportError> {
        self.close_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn has_service(&self, name: &str) -> bool {
        self.remote_services().iter().any(|s| s == name)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn remote_peer(&self) -> PeerInfo {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn redirect(&self, peer: &PeerInfo) -> Result<(), TransportError> {
        match self.state() {
            ChannelState::Opening => return Err(TransportError::Busy),
            ChannelState::Closed => return Err(TransportError::Closed),
            ChannelState::Open => {}
        }
        let from = {
            let mut remote = self.remote.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *remote, peer.clone()).id
        };
        self.transport
            .inner
            .redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((from, peer.id.clone()));
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(Pending::Redirect);
        self.set_state(ChannelState::Opening);
        Ok(())
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let _transition = self.transition.lock().await;
        match self.state() {
            ChannelState::Open => return Ok(()),
            ChannelState::Closed => return Err(self.close_error().unwrap_or(TransportError::Closed)),
            ChannelState::Opening => {}
        }

        let latency = self.transport.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // closed while we waited
        if self.state() == ChannelState::Closed {
            return Err(self.close_error().unwrap_or(TransportError::Closed));
        }

        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        let target = self.remote_peer().id;
        let failure = match pending {
            Some(Pending::Redirect) => self.transport.inner.fail_redirect.get(&target).map(|e| e.clone()),
            _ => self.transport.inner.fail_open.get(&target).map(|e| e.clone()),
        };
        match failure {
            Some(error) => {
                trace!(channel = %self.id, peer = %target, "memory channel failed: {error}");
                self.terminate(error.clone());
                Err(error)
            }
            None => {
                self.set_state(ChannelState::Open);
                Ok(())
            }
        }
    }

    async fn wait_closed(&self) -> Option<TransportError> {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
        self.close_error()
    }

    fn close(&self) {
        if self.state() != ChannelState::Closed {
            debug!(channel = %self.id, "memory channel closed");
            self.set_state(ChannelState::Closed);
        }
    }

    fn terminate(&self, error: TransportError) {
        if self.state() == ChannelState::Closed {
            return;
        }
        *self.close_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.set_state(ChannelState::Closed);
    }

    fn remote_services(&self) -> Vec<String> {
        let peer = self.remote_peer().id;
        self.transport
            .inner
            .services
            .get(&peer)
            .map(|s| s.clone())
            .unwrap_or_else(|| {
                vec![SERVICE_LOCATOR.to_string(), SERVICE_PATH_MAP.to_string(), SERVICE_STREAMS.to_string()]
            })
    }

    fn path_map(&self) -> Option<Arc<dyn PathMapService>> {
        if self.state() != ChannelState::Open || !self.has_service(SERVICE_PATH_MAP) {
            return None;
        }
        Some(self.transport.path_map_for(&self.remote_peer().id) as Arc<dyn PathMapService>)
    }

    fn streams(&self) -> Option<Arc<dyn StreamsService>> {
        if self.state() != ChannelState::Open || !self.has_service(SERVICE_STREAMS) {
            return None;
        }
        Some(self.transport.streams_for(&self.remote_peer().id) as Arc<dyn StreamsService>)
    }
}

// ---------------------------------------------------------------------------
// path map
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPathMapService {
    rules: Mutex<Option<Vec<PathMapRule>>>,
    listeners: Mutex<Vec<Arc<dyn PathMapListener>>>,
    set_calls: AtomicUsize,
}

impl MemoryPathMapService {
    pub fn new(rules: Vec<PathMapRule>) -> Self {
        Self { rules: Mutex::new(Some(rules)), ..Default::default() }
    }

    pub fn rules(&self) -> Vec<PathMapRule> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).clone().unwrap_or_default()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Replace the rules as if another producer changed them, and notify.
    pub fn replace_remote(&self, rules: Vec<PathMapRule>) {
        *self.rules.lock().unwrap_or_else(PoisonError::into_inner) = Some(rules);
        self.notify();
    }

    fn notify(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for listener in listeners {
            listener.changed();
        }
    }
}

#[async_trait]
impl PathMapService for MemoryPathMapService {
    async fn get(&self) -> Result<Option<Vec<PathMapRule>>, TransportError> {
        Ok(self.rules.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn set(&self, rules: Vec<PathMapRule>) -> Result<(), TransportError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        *self.rules.lock().unwrap_or_else(PoisonError::into_inner) = Some(rules);
        self.notify();
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn PathMapListener>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn PathMapListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same_object(l, listener));
    }
}

// ---------------------------------------------------------------------------
// streams
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStream {
    chunks: VecDeque<Vec<u8>>,
    eos: bool,
    fail: Option<TransportError>,
    written: Vec<u8>,
    eos_received: bool,
    disconnected: bool,
    parked_reads: usize,
}

#[derive(Default)]
pub struct MemoryStreamsService {
    listeners: Mutex<Vec<(String, Arc<dyn StreamsListener>)>>,
    streams: Mutex<HashMap<String, MemoryStream>>,
    disconnects: Mutex<Vec<String>>,
    changed: Notify,
}

impl MemoryStreamsService {
    fn with_stream<R>(&self, stream_id: &str, f: impl FnOnce(&mut MemoryStream) -> R) -> R {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        f(streams.entry(stream_id.to_string()).or_default())
    }

    /// Queue data the agent "sends" on `stream_id`.
    pub fn push_chunk(&self, stream_id: &str, data: &[u8]) {
        self.with_stream(stream_id, |s| s.chunks.push_back(data.to_vec()));
        self.changed.notify_waiters();
    }

    pub fn push_eos(&self, stream_id: &str) {
        self.with_stream(stream_id, |s| s.eos = true);
        self.changed.notify_waiters();
    }

    /// Fail the next reads of `stream_id`.
    pub fn fail_reads(&self, stream_id: &str, error: TransportError) {
        self.with_stream(stream_id, |s| s.fail = Some(error));
        self.changed.notify_waiters();
    }

    /// Announce a new stream to every listener subscribed for `stream_type`.
    pub fn create_stream(&self, stream_type: &str, stream_id: &str, context_id: Option<&str>) {
        self.with_stream(stream_id, |_| ());
        for listener in self.listeners_for(stream_type) {
            listener.created(stream_type, stream_id, context_id);
        }
    }

    pub fn dispose_stream(&self, stream_type: &str, stream_id: &str) {
        for listener in self.listeners_for(stream_type) {
            listener.disposed(stream_type, stream_id);
        }
    }

    pub fn written(&self, stream_id: &str) -> Vec<u8> {
        self.with_stream(stream_id, |s| s.written.clone())
    }

    /// Reads currently waiting for data on `stream_id`.
    pub fn parked_reads(&self, stream_id: &str) -> usize {
        self.with_stream(stream_id, |s| s.parked_reads)
    }

    pub fn eos_received(&self, stream_id: &str) -> bool {
        self.with_stream(stream_id, |s| s.eos_received)
    }

    /// Every disconnect call, in order.
    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn disconnect_count(&self, stream_id: &str) -> usize {
        self.disconnects().iter().filter(|id| *id == stream_id).count()
    }

    pub fn subscriber_count(&self, stream_type: &str) -> usize {
        self.listeners_for(stream_type).len()
    }

    fn listeners_for(&self, stream_type: &str) -> Vec<Arc<dyn StreamsListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == stream_type)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

#[async_trait]
impl StreamsService for MemoryStreamsService {
    async fn subscribe(&self, stream_type: &str, listener: Arc<dyn StreamsListener>) -> Result<(), TransportError> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stream_type.to_string(), listener));
        Ok(())
    }

    async fn unsubscribe(&self, stream_type: &str, listener: &Arc<dyn StreamsListener>) -> Result<(), TransportError> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(t, l)| !(t == stream_type && same_object(l, listener)));
        Ok(())
    }

    async fn read(&self, stream_id: &str, size: usize) -> Result<ReadChunk, TransportError> {
        loop {
            // register interest before looking, so a push in between is not missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.with_stream(stream_id, |s| {
                if s.disconnected {
                    return Some(Err(TransportError::NoSuchStream(stream_id.to_string())));
                }
                if let Some(error) = s.fail.clone() {
                    return Some(Err(error));
                }
                if let Some(mut chunk) = s.chunks.pop_front() {
                    if chunk.len() > size {
                        let rest = chunk.split_off(size);
                        s.chunks.push_front(rest);
                    }
                    return Some(Ok(ReadChunk { data: chunk, lost_size: 0, eos: false }));
                }
                if s.eos {
                    return Some(Ok(ReadChunk { data: Vec::new(), lost_size: 0, eos: true }));
                }
                s.parked_reads += 1;
                None
            });
            if let Some(result) = ready {
                return result;
            }
            notified.await;
            self.with_stream(stream_id, |s| s.parked_reads = s.parked_reads.saturating_sub(1));
        }
    }

    async fn write(&self, stream_id: &str, data: &[u8]) -> Result<(), TransportError> {
        self.with_stream(stream_id, |s| {
            if s.disconnected {
                return Err(TransportError::NoSuchStream(stream_id.to_string()));
            }
            s.written.extend_from_slice(data);
            Ok(())
        })
    }

    async fn eos(&self, stream_id: &str) -> Result<(), TransportError> {
        self.with_stream(stream_id, |s| s.eos_received = true);
        Ok(())
    }

    async fn disconnect(&self, stream_id: &str) -> Result<(), TransportError> {
        self.disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stream_id.to_string());
        self.with_stream(stream_id, |s| s.disconnected = true);
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_then_redirect() {
        let transport = MemoryTransport::new();
        let channel = transport.open_channel(&PeerInfo::new("p1"));
        assert_eq!(channel.state(), ChannelState::Opening);
        channel.wait_open().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        channel.redirect(&PeerInfo::new("p2")).unwrap();
        assert_eq!(channel.redirect(&PeerInfo::new("p3")), Err(TransportError::Busy));
        channel.wait_open().await.unwrap();
        assert_eq!(channel.remote_peer().id, "p2");
        assert_eq!(transport.redirects(), vec![("p1".to_string(), "p2".to_string())]);
    }

    #[tokio::test]
    async fn injected_open_failure_closes_the_channel() {
        let transport = MemoryTransport::new();
        transport.fail_open("p1", TransportError::Refused("nope".into()));
        let channel = transport.open_channel(&PeerInfo::new("p1"));
        assert!(channel.wait_open().await.is_err());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.wait_closed().await, Some(TransportError::Refused("nope".into())));
    }

    #[tokio::test]
    async fn reads_split_chunks_and_end_with_eos() {
        let streams = MemoryStreamsService::default();
        streams.push_chunk("s1", b"hello world");
        streams.push_eos("s1");

        let first = streams.read("s1", 5).await.unwrap();
        assert_eq!(first.data, b"hello");
        let second = streams.read("s1", 1024).await.unwrap();
        assert_eq!(second.data, b" world");
        assert!(streams.read("s1", 1024).await.unwrap().eos);
    }

    #[tokio::test]
    async fn pending_read_wakes_on_push() {
        let streams = Arc::new(MemoryStreamsService::default());
        let reader = streams.clone();
        let task = tokio::spawn(async move { reader.read("s1", 16).await });
        tokio::task::yield_now().await;
        streams.push_chunk("s1", b"late");
        assert_eq!(task.await.unwrap().unwrap().data, b"late");
    }
}
