use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::Address;
use crate::endpoint::{parse_reference, Endpoint};

/// Public endpoints learned from each peer, keyed by full address
///
/// Each entry is an immutable, ordered list: the first endpoint is the one
/// preferred for outgoing traffic. Replaced lists are dropped after the
/// lock is released. When a peer's key for an algorithm changes, the key it
/// replaced stays reachable as the new endpoint's previous generation.
///
/// Alongside, the cache tracks which of our own public keys each peer is
/// known to hold, so outgoing traffic can stay on a generation the peer can
/// still open until it learns the current one.
#[derive(Debug)]
pub struct PeerCache {
    peers: Mutex<HashMap<String, Arc<[Arc<Endpoint>]>>>,
    learned: Mutex<HashMap<String, HashSet<Vec<u8>>>>,
    desired_strength: u32,
}

/// Order a peer's endpoints by preference
///
/// Strongest first, then lowest score. If any endpoint after the first meets
/// `desired_strength`, the last such endpoint moves to the front.
pub fn order_endpoints(endpoints: &mut Vec<Arc<Endpoint>>, desired_strength: u32) {
    endpoints.sort_by(|a, b| {
        b.strength()
            .cmp(&a.strength())
            .then_with(|| a.score().cmp(&b.score()))
    });

    let promote = endpoints
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, endpoint)| endpoint.strength() >= desired_strength)
        .map(|(index, _)| index)
        .last();
    if let Some(index) = promote {
        let endpoint = endpoints.remove(index);
        endpoints.insert(0, endpoint);
    }
}

impl PeerCache {
    pub fn new(desired_strength: u32) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            learned: Mutex::new(HashMap::new()),
            desired_strength,
        }
    }

    /// Replace everything known about `peer`
    ///
    /// An empty list removes the peer. Returns whether the peer now has
    /// usable endpoints.
    pub fn replace(&self, peer: &Address, mut endpoints: Vec<Arc<Endpoint>>) -> bool {
        if endpoints.is_empty() {
            self.remove(peer);
            return false;
        }
        order_endpoints(&mut endpoints, self.desired_strength);
        let mut peers = self.peers.lock();
        if let Some(old) = peers.get(&peer.key()) {
            carry_previous(&endpoints, old);
        }
        let replaced = peers.insert(peer.key(), Arc::from(endpoints));
        drop(peers);
        drop(replaced);
        true
    }

    /// Forget `peer`, including which of our keys it holds
    pub fn remove(&self, peer: &Address) -> bool {
        self.learned.lock().remove(&peer.key());
        let removed = self.peers.lock().remove(&peer.key());
        removed.is_some()
    }

    /// `peer` now holds exactly these public keys of ours
    pub fn set_learned(&self, peer: &Address, keys: impl IntoIterator<Item = Vec<u8>>) {
        self.learned
            .lock()
            .insert(peer.key(), keys.into_iter().collect());
    }

    /// `peer` proved it holds one more public key of ours
    pub fn add_learned(&self, peer: &Address, key: &[u8]) {
        let mut learned = self.learned.lock();
        let keys = learned.entry(peer.key()).or_default();
        if !keys.contains(key) {
            keys.insert(key.to_vec());
        }
    }

    /// Whether `peer` holds `key`; `None` when nothing is recorded for it
    pub fn holds(&self, peer: &Address, key: &[u8]) -> Option<bool> {
        self.learned
            .lock()
            .get(&peer.key())
            .map(|keys| keys.contains(key))
    }

    pub fn get(&self, peer: &Address) -> Option<Arc<[Arc<Endpoint>]>> {
        self.peers.lock().get(&peer.key()).cloned()
    }

    pub fn contains(&self, peer: &Address) -> bool {
        self.peers.lock().contains_key(&peer.key())
    }

    /// The preferred endpoint of `peer`
    pub fn preferred(&self, peer: &Address) -> Option<Arc<Endpoint>> {
        self.get(peer).and_then(|endpoints| endpoints.first().cloned())
    }

    /// A specific endpoint of `peer` by reference (`namespace#localName`)
    pub fn by_reference(&self, peer: &Address, reference: &str) -> Option<Arc<Endpoint>> {
        let (namespace, local_name) = parse_reference(reference)?;
        self.get(peer)?
            .iter()
            .find(|endpoint| endpoint.id().matches(local_name, namespace))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.learned.lock().clear();
        let drained = std::mem::take(&mut *self.peers.lock());
        drop(drained);
    }
}

/// Link each fresh endpoint to the one it supersedes
///
/// A changed key keeps the old one as previous generation; an unchanged key
/// inherits whatever previous generation the old entry still had.
fn carry_previous(fresh: &[Arc<Endpoint>], old: &[Arc<Endpoint>]) {
    for endpoint in fresh {
        let Some(before) = old.iter().find(|o| o.same_algorithm(endpoint)) else {
            continue;
        };
        if before.public_key() == endpoint.public_key() {
            endpoint.set_previous(before.previous());
        } else {
            before.set_previous(None);
            endpoint.set_previous(Some(before.clone()));
        }
    }
}
