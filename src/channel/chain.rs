use std::collections::HashSet;

use dashmap::DashMap;
use tracing::trace;

use crate::value_add::ValueAddRef;

use super::{ChannelError, peer::PeerInfo};

/// One step of a route: the peer to reach and the value-adds that sit in
/// front of it.
#[derive(Clone, Debug)]
pub struct Hop {
    pub peer: PeerInfo,
    pub value_adds: Vec<ValueAddRef>,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    peer: PeerInfo,
    proxy: Option<String>,
    value_adds: Vec<String>,
}

/// Known peers, how they are reached, and the value-adds they need.
#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<String, PeerEntry>,
    value_adds: DashMap<String, ValueAddRef>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: PeerInfo, proxy: Option<String>, value_adds: Vec<String>) {
        self.peers.insert(peer.id.clone(), PeerEntry { peer, proxy, value_adds });
    }

    pub fn add_value_add(&self, value_add: ValueAddRef) {
        self.value_adds.insert(value_add.id().to_string(), value_add);
    }

    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.peers.get(id).map(|e| e.peer.clone())
    }

    pub fn value_add(&self, id: &str) -> Option<ValueAddRef> {
        self.value_adds.get(id).map(|v| v.clone())
    }

    /// Every value-add any peer uses.
    pub fn value_adds(&self) -> Vec<ValueAddRef> {
        self.value_adds.iter().map(|v| v.value().clone()).collect()
    }

    /// The hops to `target`, outermost proxy first and `target` last.
    ///
    /// A target nobody configured is reached directly.
    pub fn chain_for(&self, target: &PeerInfo) -> Result<Vec<Hop>, ChannelError> {
        let mut hops = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(target.id.clone());

        while let Some(id) = next.take() {
            if !seen.insert(id.clone()) {
                return Err(ChannelError::NoChain(format!("{} (proxy loop at `{id}`)", target.id)));
            }
            let entry = match self.peers.get(&id) {
                Some(entry) => entry.clone(),
                None if id == target.id => {
                    hops.push(Hop { peer: target.clone(), value_adds: Vec::new() });
                    break;
                }
                None => return Err(ChannelError::NoChain(format!("{} (unknown proxy `{id}`)", target.id))),
            };

            let mut value_adds = Vec::with_capacity(entry.value_adds.len());
            for va_id in &entry.value_adds {
                let va = self
                    .value_add(va_id)
                    .ok_or_else(|| ChannelError::NoChain(format!("{} (unknown value-add `{va_id}`)", target.id)))?;
                value_adds.push(va);
            }
            // the caller's attributes win for the target itself
            let peer = if id == target.id { target.clone() } else { entry.peer };
            hops.push(Hop { peer, value_adds });
            next = entry.proxy;
        }

        hops.reverse();
        trace!(target = %target.id, hops = ?hops.iter().map(|h| h.peer.id.as_str()).collect::<Vec<_>>(), "chain computed");
        Ok(hops)
    }
}
