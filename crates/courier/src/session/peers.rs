use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use super::sender::Outbound;
use crate::sync::{lock, read, write};

/// Where a [`Sender`](super::Sender) keeps per-peer outbound state.
///
/// A client talks to exactly one peer, a server to one per connection;
/// both drive the same sender through this seam.
pub trait PeerSet: Send + Sync {
    type Peer: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Runs `f` under the peer's own lock. `None` when the peer is unknown.
    fn with_outbound<R>(
        &self,
        peer: Self::Peer,
        f: impl FnOnce(&mut Outbound) -> R,
    ) -> Option<R>;

    fn peers(&self) -> Vec<Self::Peer>;
}

#[derive(Debug, Default)]
pub struct SinglePeer {
    slot: Mutex<Option<Outbound>>,
}

impl SinglePeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) {
        *lock(&self.slot) = Some(Outbound::new());
    }

    pub fn disconnect(&self) {
        *lock(&self.slot) = None;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl PeerSet for SinglePeer {
    type Peer = ();

    fn with_outbound<R>(&self, _peer: (), f: impl FnOnce(&mut Outbound) -> R) -> Option<R> {
        lock(&self.slot).as_mut().map(f)
    }

    fn peers(&self) -> Vec<()> {
        if self.is_connected() { vec![()] } else { Vec::new() }
    }
}

pub struct PeerMap<K> {
    peers: RwLock<HashMap<K, Arc<Mutex<Outbound>>>>,
}

impl<K> Default for PeerMap<K> {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Copy + Eq + Hash> PeerMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer already existed; its state is kept.
    pub fn add(&self, peer: K) -> bool {
        let mut peers = write(&self.peers);
        if peers.contains_key(&peer) {
            return false;
        }
        peers.insert(peer, Arc::new(Mutex::new(Outbound::new())));
        true
    }

    pub fn remove(&self, peer: K) -> bool {
        write(&self.peers).remove(&peer).is_some()
    }

    pub fn contains(&self, peer: K) -> bool {
        read(&self.peers).contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        read(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> PeerSet for PeerMap<K>
where
    K: Copy + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Peer = K;

    fn with_outbound<R>(&self, peer: K, f: impl FnOnce(&mut Outbound) -> R) -> Option<R> {
        // Clone the entry out so the map lock is not held while `f` runs.
        let outbound = read(&self.peers).get(&peer).cloned()?;
        let mut guard = lock(&outbound);
        Some(f(&mut guard))
    }

    fn peers(&self) -> Vec<K> {
        read(&self.peers).keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Command;

    #[test]
    fn single_peer_lifecycle() {
        let peer = SinglePeer::new();
        assert!(peer.peers().is_empty());
        assert!(peer.with_outbound((), |_| ()).is_none());

        peer.connect();
        assert_eq!(peer.peers(), vec![()]);
        peer.with_outbound((), |o| o.push(Command::guaranteed(0, vec![])));
        assert_eq!(peer.with_outbound((), |o| o.is_send_pending()), Some(true));

        peer.connect();
        assert_eq!(peer.with_outbound((), |o| o.is_send_pending()), Some(false));

        peer.disconnect();
        assert!(!peer.is_connected());
    }

    #[test]
    fn peer_map_add_remove() {
        let map = PeerMap::<u32>::new();
        assert!(map.add(7));
        assert!(!map.add(7));
        assert!(map.contains(7));
        assert_eq!(map.len(), 1);

        assert!(map.remove(7));
        assert!(!map.remove(7));
        assert!(map.is_empty());
        assert!(map.with_outbound(7, |_| ()).is_none());
    }
}
