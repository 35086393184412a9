// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! LE discovery: active and passive scan session multiplexing.
//!
//! One physical scanner serves any number of [`LeDiscoverySession`]s
//! (active scan) and an optional background mode (passive scan, used to
//! rediscover bonded peers). Active always wins over passive; stopping
//! the last session with background still requested drops the scanner
//! to passive rather than off. At each period boundary the scanner is
//! disabled and re-enabled so the controller rotates its random address
//! and re-delivers cached advertisements as fresh events.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::dispatch::{Dispatcher, TaskHandle};
use crate::eir;
use crate::error::{Error, Result};
use crate::hci::constants::{le_advertising_type, le_subevent, EventCode};
use crate::hci::event::{
    EventPacket, LeAdvertisingReport, LeAdvertisingReportParams,
    LeDirectedAdvertisingReportParams,
};
use crate::hci::{CommandChannel, EventHandlerId};
use crate::le::scanner::{LeScanner, ScanType};
use crate::peer::{NameSource, Peer, PeerCache};
use crate::types::{Address, AddressType, Uuid};

/// Tunables injected by the embedder.
#[derive(Clone, Copy, Debug)]
pub struct LeDiscoveryConfig {
    /// How long one scan period runs before the scanner is cycled.
    /// `None` disables the period.
    pub scan_period: Option<Duration>,
}

impl Default for LeDiscoveryConfig {
    fn default() -> LeDiscoveryConfig {
        LeDiscoveryConfig { scan_period: Some(Duration::from_millis(10240)) }
    }
}

/// Per-session result filter. Empty criteria match everything.
#[derive(Clone, Debug, Default)]
pub struct LeDiscoveryFilter {
    /// The advertisement's AD flags must intersect this mask.
    pub flags: Option<u8>,
    /// Any listed UUID appears in the advertisement's service lists.
    pub service_uuids: Vec<Uuid>,
    /// Case-sensitive substring of the advertised local name.
    pub name_substring: Option<String>,
    /// `Some(true)`: connectable only; `Some(false)`: non-connectable
    /// only; `None`: either.
    pub connectable: Option<bool>,
    /// Observed RSSI must be at least this value.
    pub rssi_threshold: Option<i8>,
}

impl LeDiscoveryFilter {
    /// Evaluates the filter against a peer snapshot and its parsed
    /// advertising data.
    pub fn matches(&self, peer: &Peer) -> bool {
        let sections = peer.advertising_data().map(eir::parse).unwrap_or_default();
        if let Some(mask) = self.flags {
            match sections.flags {
                Some(flags) if flags & mask != 0 => {}
                _ => return false,
            }
        }
        if !self.service_uuids.is_empty() {
            let known = peer.services();
            if !self.service_uuids.iter().any(|uuid| {
                known.contains(uuid) || sections.service_uuids.contains(uuid)
            }) {
                return false;
            }
        }
        if let Some(substring) = &self.name_substring {
            let name = sections.name.as_deref().or_else(|| peer.name());
            match name {
                Some(name) if name.contains(substring.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(connectable) = self.connectable {
            if peer.connectable() != connectable {
                return false;
            }
        }
        if let Some(threshold) = self.rssi_threshold {
            match peer.rssi() {
                Some(rssi) if rssi >= threshold => {}
                _ => return false,
            }
        }
        true
    }
}

/// Called for every filter-matching peer observation.
pub type LePeerObservedCallback = Box<dyn FnMut(&Peer) + 'static>;

/// Called at most once when the session is invalidated.
pub type LeSessionErrorCallback = Box<dyn FnOnce(Error) + 'static>;

/// Called during passive scan for advertisements from peers the cache
/// already knows to be connectable.
pub type PeerConnectableCallback = Box<dyn FnMut(&Peer) + 'static>;

type SessionKey = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScanState {
    Disabled,
    Starting,
    Enabled(ScanType),
    Stopping,
}

struct LeSessionState {
    filter: LeDiscoveryFilter,
    on_peer: Option<LePeerObservedCallback>,
    on_error: Option<LeSessionErrorCallback>,
    /// Addresses already delivered this scan period.
    seen: HashSet<Address>,
}

struct LeInner {
    channel: CommandChannel,
    cache: PeerCache,
    dispatcher: Arc<dyn Dispatcher>,
    scanner: LeScanner,
    config: LeDiscoveryConfig,
    next_key: SessionKey,
    sessions: HashMap<SessionKey, LeSessionState>,
    background: bool,
    connectable_callback: Option<PeerConnectableCallback>,
    state: ScanState,
    /// A mode change arrived while a transition was in flight.
    recheck: bool,
    period_task: Option<TaskHandle>,
    handler_id: Option<EventHandlerId>,
}

impl LeInner {
    fn required_mode(&self) -> Option<ScanType> {
        if !self.sessions.is_empty() {
            Some(ScanType::Active)
        } else if self.background {
            Some(ScanType::Passive)
        } else {
            None
        }
    }

    fn cancel_period_task(&mut self) {
        if let Some(task) = self.period_task.take() {
            self.dispatcher.cancel(task);
        }
    }
}

impl Drop for LeInner {
    fn drop(&mut self) {
        if let Some(id) = self.handler_id.take() {
            self.channel.remove_event_handler(id);
        }
        self.cancel_period_task();
    }
}

/// Multiplexes LE scanning across sessions and the background mode.
#[derive(Clone)]
pub struct LeDiscoveryManager {
    inner: Arc<Mutex<LeInner>>,
}

/// RAII token for an LE discovery client. Dropping the last one stops
/// active scanning (falling back to passive when background scanning is
/// requested).
pub struct LeDiscoverySession {
    manager: LeDiscoveryManager,
    key: SessionKey,
}

impl Drop for LeDiscoverySession {
    fn drop(&mut self) {
        self.manager.remove_session(self.key);
    }
}

impl LeDiscoveryManager {
    pub fn new(
        channel: CommandChannel,
        cache: PeerCache,
        dispatcher: Arc<dyn Dispatcher>,
        config: LeDiscoveryConfig,
    ) -> LeDiscoveryManager {
        let scanner = LeScanner::new(channel.clone());
        let inner = Arc::new(Mutex::new(LeInner {
            channel: channel.clone(),
            cache,
            dispatcher,
            scanner,
            config,
            next_key: 0,
            sessions: HashMap::new(),
            background: false,
            connectable_callback: None,
            state: ScanState::Disabled,
            recheck: false,
            period_task: None,
            handler_id: None,
        }));
        let manager = LeDiscoveryManager { inner };
        let weak = Arc::downgrade(&manager.inner);
        let handler_id = channel.add_event_handler(
            EventCode::LeMeta,
            Box::new(move |packet| {
                if let Some(manager) = upgrade(&weak) {
                    manager.on_le_meta(packet);
                }
            }),
        );
        manager.inner.lock().handler_id = Some(handler_id);
        manager
    }

    /// Starts an active discovery session. Cached peers matching the
    /// filter are delivered synchronously before this returns;
    /// afterwards only events from the running scan trigger
    /// notifications.
    pub fn start_discovery_session(
        &self,
        filter: LeDiscoveryFilter,
        on_peer: LePeerObservedCallback,
        on_error: LeSessionErrorCallback,
    ) -> LeDiscoverySession {
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.sessions.insert(
                key,
                LeSessionState {
                    filter,
                    on_peer: Some(on_peer),
                    on_error: Some(on_error),
                    seen: HashSet::new(),
                },
            );
            key
        };

        self.replay_cached_peers(key);
        self.recompute_scan();
        LeDiscoverySession { manager: self.clone(), key }
    }

    /// Enables or disables the background (passive) scan used to
    /// rediscover bonded peers. A change while an active scan runs is a
    /// no-op to the controller.
    pub fn set_background_scan(&self, enabled: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.background == enabled {
                return;
            }
            inner.background = enabled;
        }
        self.recompute_scan();
    }

    /// Installs the callback fired during passive scan for
    /// advertisements from peers the cache already knows to be
    /// connectable.
    pub fn set_peer_connectable_callback(&self, callback: PeerConnectableCallback) {
        self.inner.lock().connectable_callback = Some(callback);
    }

    /// Changes the scan period. Takes effect at the next period
    /// boundary or scan start.
    pub fn set_scan_period(&self, period: Option<Duration>) {
        self.inner.lock().config.scan_period = period;
    }

    fn replay_cached_peers(&self, key: SessionKey) {
        let (cache, filter) = {
            let inner = self.inner.lock();
            let filter = match inner.sessions.get(&key) {
                Some(session) => session.filter.clone(),
                None => return,
            };
            (inner.cache.clone(), filter)
        };
        let mut matching: Vec<Peer> = Vec::new();
        cache.for_each_peer(|peer| {
            if peer.le_address().is_some() && filter.matches(peer) {
                matching.push(peer.clone());
            }
        });
        for peer in matching {
            let address = match peer.le_address() {
                Some(address) => address,
                None => continue,
            };
            let deliver = {
                let mut inner = self.inner.lock();
                match inner.sessions.get_mut(&key) {
                    Some(session) => session.seen.insert(address),
                    None => false,
                }
            };
            if deliver {
                self.notify_session(key, &peer);
            }
        }
    }

    fn remove_session(&self, key: SessionKey) {
        {
            let mut inner = self.inner.lock();
            inner.sessions.remove(&key);
        }
        self.recompute_scan();
    }

    fn recompute_scan(&self) {
        enum Transition {
            Enable(ScanType),
            Disable,
        }
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                ScanState::Starting | ScanState::Stopping => {
                    inner.recheck = true;
                    return;
                }
                ScanState::Disabled => match inner.required_mode() {
                    Some(mode) => {
                        inner.state = ScanState::Starting;
                        Transition::Enable(mode)
                    }
                    None => return,
                },
                ScanState::Enabled(current) => match inner.required_mode() {
                    Some(mode) if mode == current => return,
                    // Mode switch or stop: disable first, then let the
                    // completion recompute.
                    _ => {
                        inner.state = ScanState::Stopping;
                        inner.recheck = true;
                        inner.cancel_period_task();
                        Transition::Disable
                    }
                },
            }
        };
        let scanner = self.inner.lock().scanner.clone();
        match transition {
            Transition::Enable(mode) => {
                let manager = self.clone();
                scanner.enable(
                    mode,
                    Box::new(move |result| manager.on_scan_enabled(mode, result)),
                );
            }
            Transition::Disable => {
                let manager = self.clone();
                scanner.disable(Box::new(move |result| manager.on_scan_disabled(result)));
            }
        }
    }

    fn on_scan_enabled(&self, mode: ScanType, result: Result<()>) {
        match result {
            Ok(()) => {
                let recheck = {
                    let mut inner = self.inner.lock();
                    inner.state = ScanState::Enabled(mode);
                    std::mem::take(&mut inner.recheck)
                };
                info!("LeDiscoveryManager: scanning ({:?})", mode);
                self.schedule_period_task();
                if recheck {
                    self.recompute_scan();
                }
            }
            Err(error) => {
                warn!("LeDiscoveryManager: scan enable failed: {}", error);
                self.fail_all_sessions(error);
            }
        }
    }

    fn on_scan_disabled(&self, result: Result<()>) {
        if let Err(error) = &result {
            warn!("LeDiscoveryManager: scan disable failed: {}", error);
        }
        let recheck = {
            let mut inner = self.inner.lock();
            inner.state = ScanState::Disabled;
            std::mem::take(&mut inner.recheck)
        };
        if recheck {
            self.recompute_scan();
        }
    }

    /// A scan-enable failure is fatal for every registered session; the
    /// manager returns to Disabled and the background request is
    /// dropped rather than retried in a loop.
    fn fail_all_sessions(&self, error: Error) {
        let errors = {
            let mut inner = self.inner.lock();
            inner.state = ScanState::Disabled;
            inner.recheck = false;
            inner.background = false;
            inner.cancel_period_task();
            let errors: Vec<LeSessionErrorCallback> = inner
                .sessions
                .values_mut()
                .filter_map(|s| s.on_error.take())
                .collect();
            inner.sessions.clear();
            errors
        };
        for on_error in errors {
            on_error(error.clone());
        }
    }

    fn schedule_period_task(&self) {
        let mut inner = self.inner.lock();
        inner.cancel_period_task();
        let period = match inner.config.scan_period {
            Some(period) => period,
            None => return,
        };
        let weak = Arc::downgrade(&self.inner);
        let task = inner.dispatcher.schedule(
            period,
            Box::new(move || {
                if let Some(manager) = upgrade(&weak) {
                    manager.on_period_elapsed();
                }
            }),
        );
        inner.period_task = Some(task);
    }

    /// At the period boundary the scanner cycles off and back on; the
    /// per-session duplicate sets reset so re-delivered advertisements
    /// count as fresh.
    fn on_period_elapsed(&self) {
        {
            let mut inner = self.inner.lock();
            inner.period_task = None;
            if !matches!(inner.state, ScanState::Enabled(_)) {
                return;
            }
            for session in inner.sessions.values_mut() {
                session.seen.clear();
            }
            inner.state = ScanState::Stopping;
            inner.recheck = true;
        }
        let scanner = self.inner.lock().scanner.clone();
        let manager = self.clone();
        scanner.disable(Box::new(move |result| manager.on_scan_disabled(result)));
    }

    fn on_le_meta(&self, packet: &EventPacket) {
        let payload = packet.payload();
        match payload.first() {
            Some(&le_subevent::ADVERTISING_REPORT) => {
                match packet.decode::<LeAdvertisingReportParams>() {
                    Ok(params) => {
                        for report in params.reports {
                            self.process_report(&report);
                        }
                    }
                    Err(e) => warn!("LeDiscoveryManager: malformed advertising report: {}", e),
                }
            }
            Some(&le_subevent::DIRECTED_ADVERTISING_REPORT) => {
                match packet.decode::<LeDirectedAdvertisingReportParams>() {
                    Ok(params) => {
                        for report in params.reports {
                            self.process_directed(report.address_type, report.address);
                        }
                    }
                    Err(e) => {
                        warn!("LeDiscoveryManager: malformed directed report: {}", e)
                    }
                }
            }
            _ => {}
        }
    }

    fn process_report(&self, report: &LeAdvertisingReport) {
        let address = le_address(report.address_type, report.address);
        let connectable = matches!(
            report.event_type,
            le_advertising_type::ADV_IND | le_advertising_type::ADV_DIRECT_IND
        );
        let active = {
            let inner = self.inner.lock();
            !inner.sessions.is_empty()
        };

        if !active {
            // Background mode: report only peers the cache already
            // holds as connectable, and never create entries.
            self.report_connectable_if_cached(&address);
            return;
        }

        let cache = self.inner.lock().cache.clone();
        let id = cache.new_peer(address, connectable);
        cache.update_peer(id, |peer| {
            peer.set_rssi(report.rssi);
            if report.event_type == le_advertising_type::SCAN_RSP {
                // Scan response data extends the advertisement observed
                // earlier in this period.
                let mut merged = peer.advertising_data().unwrap_or_default().to_vec();
                merged.extend_from_slice(&report.data);
                peer.set_advertising_data(merged);
            } else {
                peer.set_advertising_data(report.data.clone());
            }
            let sections = eir::parse(peer.advertising_data().unwrap_or_default());
            if let Some(name) = sections.name {
                peer.set_name(name, NameSource::AdvertisingDataOrEir);
            }
            peer.add_observed_services(sections.service_uuids);
        });
        let peer = match cache.find_by_id(id) {
            Some(peer) => peer,
            None => return,
        };

        let keys: Vec<SessionKey> = {
            let inner = self.inner.lock();
            inner.sessions.keys().copied().collect()
        };
        for key in keys {
            let deliver = {
                let mut inner = self.inner.lock();
                match inner.sessions.get_mut(&key) {
                    Some(session) => {
                        session.filter.matches(&peer) && session.seen.insert(address)
                    }
                    None => false,
                }
            };
            if deliver {
                self.notify_session(key, &peer);
            }
        }
    }

    fn process_directed(&self, address_type: u8, address_bytes: [u8; 6]) {
        let address = le_address(address_type, address_bytes);
        // Directed advertisements carry no data to filter on; they only
        // matter for rediscovering connectable cached peers.
        self.report_connectable_if_cached(&address);
    }

    fn report_connectable_if_cached(&self, address: &Address) {
        let peer = {
            let inner = self.inner.lock();
            inner.cache.find_by_address(address)
        };
        let peer = match peer {
            Some(peer) if peer.connectable() => peer,
            _ => return,
        };
        let callback = self.inner.lock().connectable_callback.take();
        if let Some(mut callback) = callback {
            callback(&peer);
            let mut inner = self.inner.lock();
            if inner.connectable_callback.is_none() {
                inner.connectable_callback = Some(callback);
            }
        }
    }

    fn notify_session(&self, key: SessionKey, peer: &Peer) {
        let on_peer = {
            let mut inner = self.inner.lock();
            inner.sessions.get_mut(&key).and_then(|s| s.on_peer.take())
        };
        let mut on_peer = match on_peer {
            Some(on_peer) => on_peer,
            None => return,
        };
        on_peer(peer);
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(&key) {
            session.on_peer = Some(on_peer);
        }
    }
}

fn upgrade(weak: &Weak<Mutex<LeInner>>) -> Option<LeDiscoveryManager> {
    weak.upgrade().map(|inner| LeDiscoveryManager { inner })
}

fn le_address(address_type: u8, bytes: [u8; 6]) -> Address {
    let address_type = match address_type {
        0x01 => AddressType::LeRandom,
        0x03 => AddressType::LeRandomResolvable,
        // Public and public-identity.
        _ => AddressType::LePublic,
    };
    Address::new(address_type, bytes)
}
