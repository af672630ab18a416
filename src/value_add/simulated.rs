use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU16, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tracing::debug;
use value_add::message::{ServerProperties, TransportName};

use crate::channel::peer::PeerInfo;

use super::{ValueAdd, ValueAddError};

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// A value-add that only pretends to run a process. Every launch hands out a
/// fresh loopback port.
#[derive(Clone)]
pub struct SimulatedValueAdd {
    id: String,
    running: Arc<Mutex<HashMap<String, PeerInfo>>>,
    fail_launch: Arc<Mutex<Option<ValueAddError>>>,
    next_port: Arc<AtomicU16>,
    counters: Arc<Counters>,
}

impl SimulatedValueAdd {
    pub fn new(id: impl Into<String>, base_port: u16) -> Self {
        Self {
            id: id.into(),
            running: Arc::default(),
            fail_launch: Arc::default(),
            next_port: Arc::new(AtomicU16::new(base_port)),
            counters: Arc::default(),
        }
    }

    /// Pretend someone else already started the helper for `peer_id`.
    pub fn start_externally(&self, peer_id: &str) -> PeerInfo {
        let peer = self.next_peer();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.to_string(), peer.clone());
        peer
    }

    /// The next launch fails with `error`.
    pub fn fail_next_launch(&self, error: ValueAddError) {
        *self.fail_launch.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    fn next_peer(&self) -> PeerInfo {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        PeerInfo::loopback(&ServerProperties::new(TransportName::Tcp, port))
    }
}

#[async_trait]
impl ValueAdd for SimulatedValueAdd {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self, peer_id: &str) -> Result<bool, ValueAddError> {
        Ok(self.running.lock().unwrap_or_else(PoisonError::into_inner).contains_key(peer_id))
    }

    async fn launch(&self, peer_id: &str) -> Result<(), ValueAddError> {
        if let Some(error) = self.fail_launch.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(error);
        }
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.contains_key(peer_id) {
            let peer = self.next_peer();
            debug!(value_add = %self.id, peer = %peer_id, helper = %peer.id, "simulated value-add launched");
            running.insert(peer_id.to_string(), peer);
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn shutdown(&self, peer_id: &str) -> Result<(), ValueAddError> {
        if self.running.lock().unwrap_or_else(PoisonError::into_inner).remove(peer_id).is_some() {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).get(peer_id).cloned()
    }
}
