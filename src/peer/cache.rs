// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The indexed store of known peers.
//!
//! The cache mints [`PeerId`]s, maps addresses to peers (including the
//! byte-aliasing lookup that merges dual-mode peers), and relays
//! mutation events to registered observers. All mutation happens on the
//! dispatcher thread; observers are invoked synchronously after the
//! cache lock is released.

use futures::channel::mpsc;
use log::info;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::HashMap;
use std::sync::Arc;

use crate::peer::{BondingData, ConnectionState, Peer};
use crate::types::{Address, PeerId};

/// Cache mutation events delivered to observers.
#[derive(Clone, Debug)]
pub enum CacheEvent {
    /// A peer was created or one of its fields changed.
    Updated(Peer),
    /// A peer transitioned to bonded.
    Bonded(Peer),
    /// A peer was removed from the cache.
    Removed(PeerId),
}

pub type CacheObserver = Box<dyn FnMut(&CacheEvent) + 'static>;

/// Identifies a registered observer for removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObserverId(usize);

struct CacheInner {
    peers: HashMap<PeerId, Peer>,
    // Observer slots are `None` while checked out for notification.
    observers: Slab<Option<CacheObserver>>,
}

impl CacheInner {
    fn find_id_by_address(&self, address: &Address) -> Option<PeerId> {
        // Exact (type, bytes) match wins.
        if let Some(peer) =
            self.peers.values().find(|p| p.addresses().contains(address))
        {
            return Some(peer.identifier());
        }
        // Byte-alias match: the same physical peer reached over the
        // other transport.
        self.peers
            .values()
            .find(|p| p.addresses().iter().any(|a| a.bytes() == address.bytes()))
            .map(|p| p.identifier())
    }
}

/// Shared handle to the peer cache.
#[derive(Clone)]
pub struct PeerCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl PeerCache {
    pub fn new() -> PeerCache {
        PeerCache {
            inner: Arc::new(Mutex::new(CacheInner {
                peers: HashMap::new(),
                observers: Slab::new(),
            })),
        }
    }

    /// Returns the peer for `address`, minting a new record when none
    /// exists. When the bytes alias a peer known on the other
    /// transport, the peers are merged and the survivor's technology
    /// becomes dual-mode.
    pub fn new_peer(&self, address: Address, connectable: bool) -> PeerId {
        let (id, event) = {
            let mut inner = self.inner.lock();
            match inner.find_id_by_address(&address) {
                Some(id) => {
                    let peer = inner.peers.get_mut(&id).expect("indexed peer exists");
                    let had_address = peer.addresses().contains(&address);
                    peer.add_address(address);
                    if connectable {
                        peer.set_connectable(true);
                    }
                    if !had_address {
                        info!("PeerCache: merged {} onto peer {}", address, id);
                    }
                    (id, Some(CacheEvent::Updated(peer.clone())))
                }
                None => {
                    let id = PeerId::random();
                    let peer = Peer::new(id, address, connectable);
                    let event = CacheEvent::Updated(peer.clone());
                    inner.peers.insert(id, peer);
                    info!("PeerCache: new peer {} at {}", id, address);
                    (id, Some(event))
                }
            }
        };
        if let Some(event) = event {
            self.notify(event);
        }
        id
    }

    /// Looks up a peer by address: exact (type, bytes) match first, then
    /// any peer whose addresses alias the same bytes.
    pub fn find_by_address(&self, address: &Address) -> Option<Peer> {
        let inner = self.inner.lock();
        inner.find_id_by_address(address).and_then(|id| inner.peers.get(&id).cloned())
    }

    pub fn find_by_id(&self, id: PeerId) -> Option<Peer> {
        self.inner.lock().peers.get(&id).cloned()
    }

    /// Runs `f` over every peer snapshot.
    pub fn for_each_peer(&self, mut f: impl FnMut(&Peer)) {
        let peers: Vec<Peer> = self.inner.lock().peers.values().cloned().collect();
        for peer in &peers {
            f(peer);
        }
    }

    /// Mutates a peer and notifies observers. Returns `None` when the
    /// peer does not exist. A bonded transition is reported as
    /// [`CacheEvent::Bonded`] in addition to the update.
    pub fn update_peer<R>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let (result, events) = {
            let mut inner = self.inner.lock();
            let peer = inner.peers.get_mut(&id)?;
            let was_bonded = peer.bonded();
            let result = f(peer);
            let mut events = vec![CacheEvent::Updated(peer.clone())];
            if !was_bonded && peer.bonded() {
                events.push(CacheEvent::Bonded(peer.clone()));
            }
            (result, events)
        };
        for event in events {
            self.notify(event);
        }
        Some(result)
    }

    /// Restores a bonded peer from persisted bonding data. Returns
    /// false when the identifier or address is already claimed by a
    /// different peer.
    pub fn add_bonded_peer(&self, bond: BondingData) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.peers.contains_key(&bond.identifier) {
                return false;
            }
            if inner.find_id_by_address(&bond.address).is_some() {
                return false;
            }
            let mut peer = Peer::new(bond.identifier, bond.address, true);
            peer.restore_bond(bond.link_key);
            let event = CacheEvent::Updated(peer.clone());
            inner.peers.insert(bond.identifier, peer);
            event
        };
        self.notify(event);
        true
    }

    /// Removes a peer that is not connected. Returns false when the
    /// peer is missing or still connected.
    pub fn remove_disconnected_peer(&self, id: PeerId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.peers.get(&id) {
                Some(peer) if peer.connection_state() == ConnectionState::NotConnected => {
                    inner.peers.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify(CacheEvent::Removed(id));
        }
        removed
    }

    pub fn register_observer(&self, observer: CacheObserver) -> ObserverId {
        ObserverId(self.inner.lock().observers.insert(Some(observer)))
    }

    /// Returns a stream of cache events. Events are dropped once the
    /// receiver goes away.
    pub fn event_stream(&self) -> mpsc::UnboundedReceiver<CacheEvent> {
        let (sender, receiver) = mpsc::unbounded();
        let _ = self.register_observer(Box::new(move |event| {
            let _ = sender.unbounded_send(event.clone());
        }));
        receiver
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        let mut inner = self.inner.lock();
        if inner.observers.contains(id.0) {
            inner.observers.remove(id.0);
        }
    }

    fn notify(&self, event: CacheEvent) {
        let keys: Vec<usize> = {
            let inner = self.inner.lock();
            inner
                .observers
                .iter()
                .filter(|(_, slot)| slot.is_some())
                .map(|(key, _)| key)
                .collect()
        };
        for key in keys {
            let observer = {
                let mut inner = self.inner.lock();
                inner.observers.get_mut(key).and_then(|slot| slot.take())
            };
            let mut observer = match observer {
                Some(observer) => observer,
                None => continue,
            };
            observer(&event);
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.observers.get_mut(key) {
                *slot = Some(observer);
            }
        }
    }
}

impl Default for PeerCache {
    fn default() -> PeerCache {
        PeerCache::new()
    }
}
