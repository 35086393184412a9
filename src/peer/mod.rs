// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The peer record and its bonding data.

pub mod cache;

pub use cache::{CacheEvent, PeerCache};

use std::collections::{HashMap, HashSet};

use crate::hci::constants::LinkKeyType;
use crate::types::{Address, PeerId, Technology, Uuid};

/// Externally visible connection state of a peer. The connection
/// manager's internal states map onto these three.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    NotConnected,
    /// Connecting, interrogating, or pairing.
    Initializing,
    Connected,
}

/// Where a peer's name was learned from. A name from a later
/// observation replaces an earlier one; the source is recorded so
/// clients can tell a discovery-procedure name from advertised data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameSource {
    /// Remote Name Request during discovery or interrogation.
    NameDiscoveryProcedure,
    /// An EIR or advertising-data name section.
    AdvertisingDataOrEir,
}

/// Security properties of a BR/EDR link key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SecurityProperties {
    pub authenticated: bool,
    pub secure_connections: bool,
    pub key_size: u8,
}

/// A BR/EDR link key together with its properties.
#[derive(Clone, Debug, PartialEq)]
pub struct BrEdrLinkKey {
    pub value: [u8; 16],
    pub key_type: LinkKeyType,
    pub security: SecurityProperties,
}

impl BrEdrLinkKey {
    pub fn new(value: [u8; 16], key_type: LinkKeyType, key_size: u8) -> BrEdrLinkKey {
        BrEdrLinkKey {
            value,
            key_type,
            security: SecurityProperties {
                authenticated: key_type.is_authenticated(),
                secure_connections: key_type.is_secure_connections(),
                key_size,
            },
        }
    }
}

/// Bonding data persisted for a bonded peer.
#[derive(Clone, Debug, PartialEq)]
pub struct BondingData {
    pub identifier: PeerId,
    pub address: Address,
    pub link_key: BrEdrLinkKey,
}

/// Remote version information collected during interrogation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteVersion {
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

/// LMP feature pages collected during interrogation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeaturePages {
    pages: HashMap<u8, u64>,
    /// The highest page number that will be retained. Set from the
    /// peer's advertised maximum, or forced to 0 when a controller
    /// echoes a mismatched page number.
    last_page_number: Option<u8>,
}

impl FeaturePages {
    /// LMP feature page 0 bit for Extended Features support.
    pub const EXTENDED_FEATURES_BIT: u64 = 1 << 63;

    pub fn page(&self, page: u8) -> Option<u64> {
        self.pages.get(&page).copied()
    }

    pub fn set_page(&mut self, page: u8, features: u64) {
        self.pages.insert(page, features);
    }

    pub fn last_page_number(&self) -> Option<u8> {
        self.last_page_number
    }

    pub fn set_last_page_number(&mut self, page: u8) {
        self.last_page_number = Some(page);
    }

    pub fn has_extended_features(&self) -> bool {
        self.page(0).map_or(false, |p| p & Self::EXTENDED_FEATURES_BIT != 0)
    }
}

/// A record in the peer cache.
#[derive(Clone, Debug)]
pub struct Peer {
    identifier: PeerId,
    addresses: Vec<Address>,
    technology: Technology,
    temporary: bool,
    bonded: bool,
    bredr_link_key: Option<BrEdrLinkKey>,
    connection_state: ConnectionState,
    connectable: bool,
    name: Option<String>,
    name_source: Option<NameSource>,
    version: Option<RemoteVersion>,
    features: FeaturePages,
    /// Service UUIDs observed in EIR or advertising data.
    observed_services: HashSet<Uuid>,
    /// Service UUIDs returned by SDP searches, keyed by the searched
    /// service-class pattern. A non-empty result replaces the previous
    /// result for its pattern; an empty result never erases one.
    search_results: HashMap<Uuid, HashSet<Uuid>>,
    rssi: Option<i8>,
    advertising_data: Option<Vec<u8>>,
    page_scan_repetition_mode: Option<u8>,
    clock_offset: Option<u16>,
}

impl Peer {
    pub(crate) fn new(identifier: PeerId, address: Address, connectable: bool) -> Peer {
        let technology = if address.is_le() { Technology::LowEnergy } else { Technology::Classic };
        Peer {
            identifier,
            addresses: vec![address],
            technology,
            temporary: true,
            bonded: false,
            bredr_link_key: None,
            connection_state: ConnectionState::NotConnected,
            connectable,
            name: None,
            name_source: None,
            version: None,
            features: FeaturePages::default(),
            observed_services: HashSet::new(),
            search_results: HashMap::new(),
            rssi: None,
            advertising_data: None,
            page_scan_repetition_mode: None,
            clock_offset: None,
        }
    }

    pub fn identifier(&self) -> PeerId {
        self.identifier
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// The peer's address on the given transport, if it has one.
    pub fn address_of_type(&self, predicate: impl Fn(&Address) -> bool) -> Option<Address> {
        self.addresses.iter().copied().find(|a| predicate(a))
    }

    pub fn bredr_address(&self) -> Option<Address> {
        self.address_of_type(|a| a.is_bredr())
    }

    pub fn le_address(&self) -> Option<Address> {
        self.address_of_type(|a| a.is_le())
    }

    pub(crate) fn add_address(&mut self, address: Address) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
        let observed =
            if address.is_le() { Technology::LowEnergy } else { Technology::Classic };
        self.technology = self.technology.merge(observed);
    }

    pub fn technology(&self) -> Technology {
        self.technology
    }

    pub fn temporary(&self) -> bool {
        self.temporary
    }

    /// Retains the peer past its current connection.
    pub fn mark_non_temporary(&mut self) {
        self.temporary = false;
    }

    pub fn bonded(&self) -> bool {
        self.bonded
    }

    pub fn bredr_link_key(&self) -> Option<&BrEdrLinkKey> {
        self.bredr_link_key.as_ref()
    }

    /// Records a link key delivered by pairing. Only Secure Simple
    /// Pairing key types bond the peer; a Changed Combination key
    /// updates a bonded peer's key but never promotes an unbonded one.
    pub fn record_link_key(&mut self, key: BrEdrLinkKey) {
        match key.key_type {
            kind if kind.is_secure_simple_pairing() => {
                self.bredr_link_key = Some(key);
                self.bonded = true;
                self.temporary = false;
            }
            LinkKeyType::ChangedCombination => {
                if self.bonded {
                    self.bredr_link_key = Some(key);
                }
                // Ignored for unbonded peers.
            }
            _ => {
                // Legacy pairing: usable for this link, but not a bond.
                self.bredr_link_key = Some(key);
            }
        }
    }

    pub(crate) fn restore_bond(&mut self, key: BrEdrLinkKey) {
        self.bredr_link_key = Some(key);
        self.bonded = true;
        self.temporary = false;
    }

    /// Updates the stored link key's size once Read Encryption Key
    /// Size reports it.
    pub fn set_key_size(&mut self, key_size: u8) {
        if let Some(key) = &mut self.bredr_link_key {
            key.security.key_size = key_size;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub(crate) fn set_connection_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.temporary = false;
        }
        self.connection_state = state;
    }

    pub fn connectable(&self) -> bool {
        self.connectable
    }

    pub(crate) fn set_connectable(&mut self, connectable: bool) {
        self.connectable = connectable;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn name_source(&self) -> Option<NameSource> {
        self.name_source
    }

    pub fn set_name(&mut self, name: String, source: NameSource) {
        if name.is_empty() {
            return;
        }
        self.name = Some(name);
        self.name_source = Some(source);
    }

    pub fn version(&self) -> Option<RemoteVersion> {
        self.version
    }

    pub fn set_version(&mut self, version: RemoteVersion) {
        self.version = Some(version);
    }

    pub fn features(&self) -> &FeaturePages {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut FeaturePages {
        &mut self.features
    }

    /// All service UUIDs known for this peer: observed in EIR or
    /// advertising data, plus every retained search result.
    pub fn services(&self) -> HashSet<Uuid> {
        let mut all = self.observed_services.clone();
        for uuids in self.search_results.values() {
            all.extend(uuids.iter().copied());
        }
        all
    }

    pub fn add_observed_services(&mut self, uuids: impl IntoIterator<Item = Uuid>) {
        self.observed_services.extend(uuids);
    }

    /// Records an SDP search result. Empty results are dropped so that
    /// services learned on prior sessions are never erased by a peer
    /// that answers a later search with nothing.
    pub fn record_search_result(
        &mut self,
        pattern: Uuid,
        uuids: impl IntoIterator<Item = Uuid>,
    ) {
        let uuids: HashSet<Uuid> = uuids.into_iter().collect();
        if uuids.is_empty() {
            return;
        }
        self.search_results.insert(pattern, uuids);
    }

    pub fn rssi(&self) -> Option<i8> {
        self.rssi
    }

    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = Some(rssi);
    }

    pub fn advertising_data(&self) -> Option<&[u8]> {
        self.advertising_data.as_deref()
    }

    pub fn set_advertising_data(&mut self, data: Vec<u8>) {
        self.advertising_data = Some(data);
    }

    pub fn page_scan_repetition_mode(&self) -> Option<u8> {
        self.page_scan_repetition_mode
    }

    pub fn clock_offset(&self) -> Option<u16> {
        self.clock_offset
    }

    /// Records paging parameters from an inquiry result so later Create
    /// Connection and Remote Name Request commands page faster.
    pub fn set_paging_parameters(&mut self, repetition_mode: u8, clock_offset: u16) {
        self.page_scan_repetition_mode = Some(repetition_mode);
        self.clock_offset = Some(clock_offset & 0x7FFF);
    }
}
