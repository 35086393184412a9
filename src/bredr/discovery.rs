// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Inquiry and inquiry-scan session multiplexing.
//!
//! Any number of clients may hold [`DiscoverySession`]s (inquiry runs
//! while at least one exists) or [`DiscoverableSession`]s (inquiry scan
//! is enabled while at least one exists). Sessions are owned by their
//! callers; dropping the last one makes the manager issue the
//! corresponding disable command. Start and stop requests in the same
//! direction coalesce: while a start is in flight new sessions attach
//! to the pending request instead of issuing a second command.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::eir;
use crate::error::{Error, Result};
use crate::hci::command::{
    ByteParams, CommandPacket, InquiryParams, RemoteNameRequestParams,
    WriteExtendedInquiryResponseParams, WriteLocalNameParams, WriteScanActivityParams,
    WriteScanEnableParams,
};
use crate::hci::constants::{EventCode, Opcode, ScanEnableBits, GIAC_LAP, INQUIRY_LENGTH};
use crate::hci::event::{
    CommandCompleteParams, EventPacket, ExtendedInquiryResultParams, InquiryResponse,
    InquiryResultParams, InquiryResultWithRssiParams, ReadScanEnableReturn,
    RemoteNameRequestCompleteParams,
};
use crate::hci::{CommandChannel, CommandRunner, EventHandlerId, Exclusions, StatusCode};
use crate::peer::{NameSource, Peer, PeerCache};
use crate::types::Address;

/// Inquiry scan interval in 0.625 ms slots (2.56 s).
const INQUIRY_SCAN_INTERVAL: u16 = 0x1000;
/// Inquiry scan window in 0.625 ms slots (11.25 ms).
const INQUIRY_SCAN_WINDOW: u16 = 0x0012;
/// Interlaced inquiry scan.
const INQUIRY_SCAN_TYPE_INTERLACED: u8 = 0x01;
/// Inquiry results carry RSSI.
const INQUIRY_MODE_RSSI: u8 = 0x01;

/// Called for every peer observed by a discovery session.
pub type PeerObservedCallback = Box<dyn FnMut(&Peer) + 'static>;

/// Called at most once when a session is invalidated by a background
/// failure.
pub type SessionErrorCallback = Box<dyn FnOnce(Error) + 'static>;

/// Delivery callback for a requested session token.
pub type DiscoverySessionCallback = Box<dyn FnOnce(Result<DiscoverySession>) + 'static>;
pub type DiscoverableSessionCallback = Box<dyn FnOnce(Result<DiscoverableSession>) + 'static>;

/// Completion callback for `update_local_name`.
pub type NameUpdateCallback = Box<dyn FnOnce(Result<()>) + 'static>;

type SessionKey = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ActivityState {
    Stopped,
    Starting,
    Active,
    Stopping,
}

struct DiscoverySessionState {
    on_peer: Option<PeerObservedCallback>,
    on_error: Option<SessionErrorCallback>,
}

struct DiscoverableSessionState {
    on_error: Option<SessionErrorCallback>,
}

struct DiscoveryInner {
    channel: CommandChannel,
    cache: PeerCache,
    next_session_key: SessionKey,
    sessions: HashMap<SessionKey, DiscoverySessionState>,
    inquiry_state: ActivityState,
    pending_discovery: Vec<(SessionKey, DiscoverySessionCallback)>,
    pending_name_requests: HashSet<[u8; 6]>,
    discoverable_sessions: HashMap<SessionKey, DiscoverableSessionState>,
    scan_state: ActivityState,
    pending_discoverable: Vec<(SessionKey, DiscoverableSessionCallback)>,
    local_name: Option<String>,
    handler_ids: Vec<EventHandlerId>,
}

impl DiscoveryInner {
    fn next_key(&mut self) -> SessionKey {
        let key = self.next_session_key;
        self.next_session_key += 1;
        key
    }
}

impl Drop for DiscoveryInner {
    fn drop(&mut self) {
        for id in self.handler_ids.drain(..) {
            self.channel.remove_event_handler(id);
        }
    }
}

/// Multiplexes inquiry and discoverable mode across client sessions.
#[derive(Clone)]
pub struct BrEdrDiscoveryManager {
    inner: Arc<Mutex<DiscoveryInner>>,
}

/// RAII token for an active-discovery client. Dropping the last one
/// cancels inquiry.
pub struct DiscoverySession {
    manager: BrEdrDiscoveryManager,
    key: SessionKey,
}

impl std::fmt::Debug for DiscoverySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoverySession").field("key", &self.key).finish()
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.manager.remove_discovery_session(self.key);
    }
}

/// RAII token for a discoverable-mode client. Dropping the last one
/// disables inquiry scan.
pub struct DiscoverableSession {
    manager: BrEdrDiscoveryManager,
    key: SessionKey,
}

impl std::fmt::Debug for DiscoverableSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoverableSession").field("key", &self.key).finish()
    }
}

impl Drop for DiscoverableSession {
    fn drop(&mut self) {
        self.manager.remove_discoverable_session(self.key);
    }
}

impl BrEdrDiscoveryManager {
    pub fn new(channel: CommandChannel, cache: PeerCache) -> BrEdrDiscoveryManager {
        let inner = Arc::new(Mutex::new(DiscoveryInner {
            channel: channel.clone(),
            cache,
            next_session_key: 0,
            sessions: HashMap::new(),
            inquiry_state: ActivityState::Stopped,
            pending_discovery: Vec::new(),
            pending_name_requests: HashSet::new(),
            discoverable_sessions: HashMap::new(),
            scan_state: ActivityState::Stopped,
            pending_discoverable: Vec::new(),
            local_name: None,
            handler_ids: Vec::new(),
        }));
        let manager = BrEdrDiscoveryManager { inner };

        let mut handler_ids = Vec::new();
        for code in [
            EventCode::InquiryResult,
            EventCode::InquiryResultWithRssi,
            EventCode::ExtendedInquiryResult,
        ] {
            let weak = Arc::downgrade(&manager.inner);
            handler_ids.push(channel.add_event_handler(
                code,
                Box::new(move |packet| {
                    if let Some(manager) = upgrade(&weak) {
                        manager.on_inquiry_result(packet);
                    }
                }),
            ));
        }
        manager.inner.lock().handler_ids = handler_ids;
        manager
    }

    /// Requests active discovery. Inquiry is started if this is the
    /// first session; `callback` delivers the session token once
    /// inquiry is running (immediately when it already is).
    pub fn request_discovery(
        &self,
        on_peer: PeerObservedCallback,
        on_error: SessionErrorCallback,
        callback: DiscoverySessionCallback,
    ) {
        enum Disposition {
            Deliver(SessionKey, DiscoverySessionCallback),
            Start,
            Wait,
        }
        let disposition = {
            let mut inner = self.inner.lock();
            let key = inner.next_key();
            inner.sessions.insert(
                key,
                DiscoverySessionState { on_peer: Some(on_peer), on_error: Some(on_error) },
            );
            match inner.inquiry_state {
                ActivityState::Active => Disposition::Deliver(key, callback),
                ActivityState::Stopped => {
                    inner.inquiry_state = ActivityState::Starting;
                    inner.pending_discovery.push((key, callback));
                    Disposition::Start
                }
                ActivityState::Starting | ActivityState::Stopping => {
                    inner.pending_discovery.push((key, callback));
                    Disposition::Wait
                }
            }
        };
        match disposition {
            Disposition::Deliver(key, callback) => {
                callback(Ok(DiscoverySession { manager: self.clone(), key }))
            }
            Disposition::Start => self.start_inquiry(),
            Disposition::Wait => {}
        }
    }

    /// Requests discoverable mode. Inquiry scan is enabled if this is
    /// the first session.
    pub fn request_discoverable(
        &self,
        on_error: SessionErrorCallback,
        callback: DiscoverableSessionCallback,
    ) {
        enum Disposition {
            Deliver(SessionKey, DiscoverableSessionCallback),
            Start,
            Wait,
        }
        let disposition = {
            let mut inner = self.inner.lock();
            let key = inner.next_key();
            inner
                .discoverable_sessions
                .insert(key, DiscoverableSessionState { on_error: Some(on_error) });
            match inner.scan_state {
                ActivityState::Active => Disposition::Deliver(key, callback),
                ActivityState::Stopped => {
                    inner.scan_state = ActivityState::Starting;
                    inner.pending_discoverable.push((key, callback));
                    Disposition::Start
                }
                ActivityState::Starting | ActivityState::Stopping => {
                    inner.pending_discoverable.push((key, callback));
                    Disposition::Wait
                }
            }
        };
        match disposition {
            Disposition::Deliver(key, callback) => {
                callback(Ok(DiscoverableSession { manager: self.clone(), key }))
            }
            Disposition::Start => self.start_inquiry_scan(),
            Disposition::Wait => {}
        }
    }

    /// Writes the local name and refreshes the Extended Inquiry
    /// Response. On failure the cached name is left unchanged.
    pub fn update_local_name(&self, name: String, callback: NameUpdateCallback) {
        let channel = self.inner.lock().channel.clone();
        let runner = CommandRunner::new(channel);
        runner.queue(
            CommandPacket::new(
                Opcode::WRITE_LOCAL_NAME,
                &WriteLocalNameParams { name: name.clone().into_bytes() },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.queue(
            CommandPacket::new(
                Opcode::WRITE_EXTENDED_INQUIRY_RESPONSE,
                &WriteExtendedInquiryResponseParams {
                    fec_required: false,
                    eir: eir::build_name_section(&name),
                },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        let weak = Arc::downgrade(&self.inner);
        runner.run(Box::new(move |result| {
            if result.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().local_name = Some(name);
                }
            }
            callback(result);
        }));
    }

    /// The last name successfully written to the controller.
    pub fn local_name(&self) -> Option<String> {
        self.inner.lock().local_name.clone()
    }

    fn start_inquiry(&self) {
        let channel = self.inner.lock().channel.clone();
        let started = self.clone();
        let done = self.clone();
        channel.send_with_status(
            CommandPacket::new(
                Opcode::INQUIRY,
                &InquiryParams { lap: GIAC_LAP, length: INQUIRY_LENGTH, num_responses: 0 },
            ),
            EventCode::InquiryComplete,
            Exclusions::INQUIRY,
            Some(Box::new(move |status| started.on_inquiry_started(status))),
            Box::new(move |result| done.on_inquiry_round_done(result)),
        );
    }

    fn on_inquiry_started(&self, status: Result<()>) {
        match status {
            Ok(()) => {
                let (callbacks, should_stop) = {
                    let mut inner = self.inner.lock();
                    if inner.inquiry_state == ActivityState::Starting {
                        inner.inquiry_state = ActivityState::Active;
                    }
                    let callbacks: Vec<(SessionKey, DiscoverySessionCallback)> =
                        inner.pending_discovery.drain(..).collect();
                    (callbacks, inner.sessions.is_empty())
                };
                info!("BrEdrDiscoveryManager: inquiry started");
                for (key, callback) in callbacks {
                    let alive = self.inner.lock().sessions.contains_key(&key);
                    if alive {
                        callback(Ok(DiscoverySession { manager: self.clone(), key }));
                    }
                }
                if should_stop {
                    self.stop_inquiry();
                }
            }
            Err(error) => {
                warn!("BrEdrDiscoveryManager: inquiry failed to start: {}", error);
                self.fail_discovery_sessions(error);
            }
        }
    }

    fn on_inquiry_round_done(&self, result: Result<EventPacket>) {
        match result {
            Ok(_) => {
                // End of an inquiry round. Keep discovering while
                // sessions remain.
                let restart = {
                    let mut inner = self.inner.lock();
                    if inner.sessions.is_empty() {
                        inner.inquiry_state = ActivityState::Stopped;
                        false
                    } else {
                        true
                    }
                };
                if restart {
                    self.start_inquiry();
                }
            }
            Err(Error::Canceled) => {
                // Inquiry Cancel superseded the round. Restart exactly
                // once if sessions arrived while the stop was in
                // flight.
                let restart = {
                    let mut inner = self.inner.lock();
                    if inner.sessions.is_empty() {
                        inner.inquiry_state = ActivityState::Stopped;
                        false
                    } else {
                        inner.inquiry_state = ActivityState::Starting;
                        true
                    }
                };
                if restart {
                    self.start_inquiry();
                }
            }
            Err(error) => {
                warn!("BrEdrDiscoveryManager: inquiry error: {}", error);
                self.fail_discovery_sessions(error);
            }
        }
    }

    fn fail_discovery_sessions(&self, error: Error) {
        let (pending, errors) = {
            let mut inner = self.inner.lock();
            inner.inquiry_state = ActivityState::Stopped;
            let pending: Vec<(SessionKey, DiscoverySessionCallback)> =
                inner.pending_discovery.drain(..).collect();
            // Sessions awaiting a delivery callback learn of the
            // failure through it; the rest get their error callback.
            for (key, _) in &pending {
                inner.sessions.remove(key);
            }
            let errors: Vec<SessionErrorCallback> = inner
                .sessions
                .values_mut()
                .filter_map(|s| s.on_error.take())
                .collect();
            inner.sessions.clear();
            (pending, errors)
        };
        for (_, callback) in pending {
            callback(Err(error.clone()));
        }
        for on_error in errors {
            on_error(error.clone());
        }
    }

    fn stop_inquiry(&self) {
        let channel = {
            let mut inner = self.inner.lock();
            if inner.inquiry_state != ActivityState::Active
                && inner.inquiry_state != ActivityState::Starting
            {
                return;
            }
            inner.inquiry_state = ActivityState::Stopping;
            inner.channel.clone()
        };
        let manager = self.clone();
        channel.send_command(
            CommandPacket::new_empty(Opcode::INQUIRY_CANCEL),
            Box::new(move |_result| {
                // Whatever the cancel outcome, the pending inquiry
                // transaction will not see an Inquiry Complete.
                let channel = manager.inner.lock().channel.clone();
                channel.abort_transaction(Opcode::INQUIRY);
            }),
        );
    }

    fn remove_discovery_session(&self, key: SessionKey) {
        let stop = {
            let mut inner = self.inner.lock();
            inner.sessions.remove(&key);
            inner.pending_discovery.retain(|(k, _)| *k != key);
            inner.sessions.is_empty() && inner.inquiry_state == ActivityState::Active
        };
        if stop {
            self.stop_inquiry();
        }
    }

    fn on_inquiry_result(&self, packet: &EventPacket) {
        let responses: Vec<(InquiryResponse, Option<Vec<u8>>)> = match packet.code() {
            Some(EventCode::InquiryResult) => match packet.decode::<InquiryResultParams>() {
                Ok(params) => params.responses.into_iter().map(|r| (r, None)).collect(),
                Err(e) => {
                    warn!("BrEdrDiscoveryManager: malformed inquiry result: {}", e);
                    return;
                }
            },
            Some(EventCode::InquiryResultWithRssi) => {
                match packet.decode::<InquiryResultWithRssiParams>() {
                    Ok(params) => params.responses.into_iter().map(|r| (r, None)).collect(),
                    Err(e) => {
                        warn!("BrEdrDiscoveryManager: malformed inquiry result: {}", e);
                        return;
                    }
                }
            }
            _ => match packet.decode::<ExtendedInquiryResultParams>() {
                Ok(params) => vec![(params.response, Some(params.eir))],
                Err(e) => {
                    warn!("BrEdrDiscoveryManager: malformed extended inquiry result: {}", e);
                    return;
                }
            },
        };

        for (response, eir_data) in responses {
            self.process_inquiry_response(response, eir_data);
        }
    }

    fn process_inquiry_response(&self, response: InquiryResponse, eir_data: Option<Vec<u8>>) {
        let cache = self.inner.lock().cache.clone();
        let address = Address::bredr(response.bd_addr);
        let id = cache.new_peer(address, true);
        cache.update_peer(id, |peer| {
            peer.set_paging_parameters(response.page_scan_repetition_mode, response.clock_offset);
            if let Some(rssi) = response.rssi {
                peer.set_rssi(rssi);
            }
            if let Some(data) = &eir_data {
                let sections = eir::parse(data);
                if let Some(name) = sections.name {
                    peer.set_name(name, NameSource::AdvertisingDataOrEir);
                }
                peer.add_observed_services(sections.service_uuids);
            }
        });

        let peer = match cache.find_by_id(id) {
            Some(peer) => peer,
            None => return,
        };

        // A newly observed peer without a name gets one Remote Name
        // Request, serialized against the running inquiry.
        let needs_name = {
            let mut inner = self.inner.lock();
            peer.name().is_none() && inner.pending_name_requests.insert(response.bd_addr)
        };
        if needs_name {
            self.request_remote_name(response);
        }

        self.notify_sessions(&peer);
    }

    fn request_remote_name(&self, response: InquiryResponse) {
        let channel = self.inner.lock().channel.clone();
        let weak = Arc::downgrade(&self.inner);
        let bd_addr = response.bd_addr;
        channel.send_exclusive(
            CommandPacket::new(
                Opcode::REMOTE_NAME_REQUEST,
                &RemoteNameRequestParams {
                    bd_addr,
                    page_scan_repetition_mode: response.page_scan_repetition_mode,
                    clock_offset: Some(response.clock_offset & 0x7FFF),
                },
            ),
            EventCode::RemoteNameRequestComplete,
            Exclusions::INQUIRY,
            Box::new(move |result| {
                let manager = match upgrade(&weak) {
                    Some(manager) => manager,
                    None => return,
                };
                let cache = {
                    let mut inner = manager.inner.lock();
                    inner.pending_name_requests.remove(&bd_addr);
                    inner.cache.clone()
                };
                match result.and_then(|packet| packet.decode::<RemoteNameRequestCompleteParams>())
                {
                    Ok(params) if params.status == StatusCode::Success => {
                        let name = String::from_utf8_lossy(params.name()).into_owned();
                        if let Some(peer) = cache.find_by_address(&Address::bredr(bd_addr)) {
                            cache.update_peer(peer.identifier(), |p| {
                                p.set_name(name, NameSource::NameDiscoveryProcedure)
                            });
                        }
                    }
                    Ok(params) => {
                        info!(
                            "BrEdrDiscoveryManager: name request for {} failed: {}",
                            Address::bredr(bd_addr),
                            params.status
                        );
                    }
                    Err(e) => info!("BrEdrDiscoveryManager: name request failed: {}", e),
                }
            }),
        );
    }

    fn notify_sessions(&self, peer: &Peer) {
        let keys: Vec<SessionKey> = {
            let inner = self.inner.lock();
            inner.sessions.keys().copied().collect()
        };
        for key in keys {
            let on_peer = {
                let mut inner = self.inner.lock();
                inner.sessions.get_mut(&key).and_then(|s| s.on_peer.take())
            };
            let mut on_peer = match on_peer {
                Some(on_peer) => on_peer,
                None => continue,
            };
            on_peer(peer);
            let mut inner = self.inner.lock();
            if let Some(session) = inner.sessions.get_mut(&key) {
                session.on_peer = Some(on_peer);
            }
        }
    }

    fn start_inquiry_scan(&self) {
        let channel = self.inner.lock().channel.clone();
        let runner = CommandRunner::new(channel);
        runner.queue(
            CommandPacket::new(
                Opcode::WRITE_INQUIRY_SCAN_ACTIVITY,
                &WriteScanActivityParams {
                    interval: INQUIRY_SCAN_INTERVAL,
                    window: INQUIRY_SCAN_WINDOW,
                },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.queue(
            CommandPacket::new(
                Opcode::WRITE_INQUIRY_SCAN_TYPE,
                &ByteParams { value: INQUIRY_SCAN_TYPE_INTERLACED },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.queue(
            CommandPacket::new(
                Opcode::WRITE_INQUIRY_MODE,
                &ByteParams { value: INQUIRY_MODE_RSSI },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        self.queue_scan_enable_update(&runner, ScanEnableBits::INQUIRY, true);

        let manager = self.clone();
        runner.run(Box::new(move |result| manager.on_inquiry_scan_started(result)));
    }

    /// Queues a read-modify-write of the Scan_Enable mask onto `runner`
    /// so the other owner's bit is preserved.
    fn queue_scan_enable_update(&self, runner: &CommandRunner, bit: ScanEnableBits, set: bool) {
        let chain_runner = runner.clone();
        runner.queue(
            CommandPacket::new_empty(Opcode::READ_SCAN_ENABLE),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(move |packet| {
                let current = packet
                    .decode::<CommandCompleteParams>()
                    .and_then(|p| p.return_params::<ReadScanEnableReturn>())
                    .map(|r| r.scan_enable)
                    .unwrap_or_else(|_| ScanEnableBits::empty());
                let updated = if set { current | bit } else { current - bit };
                chain_runner.queue(
                    CommandPacket::new(
                        Opcode::WRITE_SCAN_ENABLE,
                        &WriteScanEnableParams { scan_enable: updated },
                    ),
                    EventCode::CommandComplete,
                    Exclusions::empty(),
                    true,
                    Box::new(|_| {}),
                );
            }),
        );
    }

    fn on_inquiry_scan_started(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                let (callbacks, should_stop) = {
                    let mut inner = self.inner.lock();
                    inner.scan_state = ActivityState::Active;
                    let callbacks: Vec<(SessionKey, DiscoverableSessionCallback)> =
                        inner.pending_discoverable.drain(..).collect();
                    (callbacks, inner.discoverable_sessions.is_empty())
                };
                info!("BrEdrDiscoveryManager: discoverable");
                for (key, callback) in callbacks {
                    let alive = self.inner.lock().discoverable_sessions.contains_key(&key);
                    if alive {
                        callback(Ok(DiscoverableSession { manager: self.clone(), key }));
                    }
                }
                if should_stop {
                    self.stop_inquiry_scan();
                }
            }
            Err(error) => {
                warn!("BrEdrDiscoveryManager: inquiry scan failed: {}", error);
                let (pending, errors) = {
                    let mut inner = self.inner.lock();
                    inner.scan_state = ActivityState::Stopped;
                    let pending: Vec<(SessionKey, DiscoverableSessionCallback)> =
                        inner.pending_discoverable.drain(..).collect();
                    for (key, _) in &pending {
                        inner.discoverable_sessions.remove(key);
                    }
                    let errors: Vec<SessionErrorCallback> = inner
                        .discoverable_sessions
                        .values_mut()
                        .filter_map(|s| s.on_error.take())
                        .collect();
                    inner.discoverable_sessions.clear();
                    (pending, errors)
                };
                for (_, callback) in pending {
                    callback(Err(error.clone()));
                }
                for on_error in errors {
                    on_error(error.clone());
                }
            }
        }
    }

    fn stop_inquiry_scan(&self) {
        let channel = {
            let mut inner = self.inner.lock();
            if inner.scan_state != ActivityState::Active {
                return;
            }
            inner.scan_state = ActivityState::Stopping;
            inner.channel.clone()
        };
        let runner = CommandRunner::new(channel);
        self.queue_scan_enable_update(&runner, ScanEnableBits::INQUIRY, false);
        let manager = self.clone();
        runner.run(Box::new(move |result| {
            if let Err(error) = &result {
                warn!("BrEdrDiscoveryManager: disabling inquiry scan failed: {}", error);
            }
            let restart = {
                let mut inner = manager.inner.lock();
                if inner.discoverable_sessions.is_empty() {
                    inner.scan_state = ActivityState::Stopped;
                    false
                } else {
                    inner.scan_state = ActivityState::Starting;
                    true
                }
            };
            if restart {
                manager.start_inquiry_scan();
            }
        }));
    }

    fn remove_discoverable_session(&self, key: SessionKey) {
        let stop = {
            let mut inner = self.inner.lock();
            inner.discoverable_sessions.remove(&key);
            inner.pending_discoverable.retain(|(k, _)| *k != key);
            inner.discoverable_sessions.is_empty() && inner.scan_state == ActivityState::Active
        };
        if stop {
            self.stop_inquiry_scan();
        }
    }
}

fn upgrade(weak: &Weak<Mutex<DiscoveryInner>>) -> Option<BrEdrDiscoveryManager> {
    weak.upgrade().map(|inner| BrEdrDiscoveryManager { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        command_complete, command_status, event_bytes, remote_name_request_complete,
        RecordingTransport,
    };
    use matches::assert_matches;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    struct Fixture {
        transport: Arc<RecordingTransport>,
        channel: CommandChannel,
        cache: PeerCache,
        manager: BrEdrDiscoveryManager,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let channel = CommandChannel::new(transport.clone());
        let cache = PeerCache::new();
        let manager = BrEdrDiscoveryManager::new(channel.clone(), cache.clone());
        Fixture { transport, channel, cache, manager }
    }

    fn inquiry_result_with_rssi(bd_addr: [u8; 6]) -> Vec<u8> {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&bd_addr);
        payload.push(0x01);
        payload.push(0x00);
        payload.extend_from_slice(&[0x0C, 0x02, 0x5A]);
        payload.extend_from_slice(&0x4000u16.to_le_bytes());
        payload.push((-40i8) as u8);
        event_bytes(EventCode::InquiryResultWithRssi, &payload)
    }

    fn extended_inquiry_result(bd_addr: [u8; 6], eir: &[u8]) -> Vec<u8> {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&bd_addr);
        payload.push(0x01);
        payload.push(0x00);
        payload.extend_from_slice(&[0x0C, 0x02, 0x5A]);
        payload.extend_from_slice(&0x4000u16.to_le_bytes());
        payload.push((-40i8) as u8);
        payload.extend_from_slice(eir);
        event_bytes(EventCode::ExtendedInquiryResult, &payload)
    }

    fn request_session(
        f: &Fixture,
        peers: Rc<RefCell<Vec<crate::types::PeerId>>>,
    ) -> Rc<RefCell<Option<Result<DiscoverySession>>>> {
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discovery(
            Box::new(move |peer| peers.borrow_mut().push(peer.identifier())),
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        slot
    }

    #[test]
    fn first_session_starts_inquiry_and_results_notify() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let session = request_session(&f, observed.clone());

        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 1);
        // Session token delivered once the inquiry command status
        // arrives.
        assert!(session.borrow().is_none());
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        assert_matches!(&*session.borrow(), Some(Ok(_)));

        f.channel.handle_event(&inquiry_result_with_rssi(ADDR)).expect("routes");
        assert_eq!(observed.borrow().len(), 1);
        let peer = f.cache.find_by_address(&Address::bredr(ADDR)).unwrap();
        assert_eq!(peer.rssi(), Some(-40));

        // The name request for the new peer is held by the exclusivity
        // rule until the inquiry round ends.
        assert_eq!(f.transport.count_sent(Opcode::REMOTE_NAME_REQUEST), 0);
        f.channel
            .handle_event(&event_bytes(EventCode::InquiryComplete, &[0x00]))
            .expect("routes");
        assert_eq!(f.transport.count_sent(Opcode::REMOTE_NAME_REQUEST), 1);
        // The restart is held in turn until the name request finishes.
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 1);
        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"Speaker"))
            .expect("routes");
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 2);
    }

    #[test]
    fn second_session_attaches_without_second_inquiry() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let first = request_session(&f, observed.clone());
        let second = request_session(&f, observed.clone());
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 1);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        assert_matches!(&*first.borrow(), Some(Ok(_)));
        assert_matches!(&*second.borrow(), Some(Ok(_)));

        // Both sessions hear about an observed peer.
        f.channel.handle_event(&inquiry_result_with_rssi(ADDR)).expect("routes");
        assert_eq!(observed.borrow().len(), 2);
    }

    #[test]
    fn dropping_last_session_cancels_inquiry() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let slot = request_session(&f, observed);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        let session = slot.borrow_mut().take().unwrap().unwrap();
        drop(session);

        assert_eq!(f.transport.count_sent(Opcode::INQUIRY_CANCEL), 1);
        f.channel
            .handle_event(&command_complete(Opcode::INQUIRY_CANCEL, &[0x00]))
            .expect("routes");
        // No restart.
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 1);
    }

    #[test]
    fn session_requested_while_stop_in_flight_restarts_once() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let slot = request_session(&f, observed.clone());
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        let session = slot.borrow_mut().take().unwrap().unwrap();
        drop(session);
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY_CANCEL), 1);

        // A new session arrives while the cancel is still in flight.
        let slot = request_session(&f, observed);
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 1);
        f.channel
            .handle_event(&command_complete(Opcode::INQUIRY_CANCEL, &[0x00]))
            .expect("routes");
        // Exactly one restart: enabled, disabled, enabled.
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 2);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        assert_matches!(&*slot.borrow(), Some(Ok(_)));
    }

    #[test]
    fn inquiry_start_failure_fails_pending_request() {
        let f = fixture();
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discovery(
            Box::new(|_| {}),
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::CommandDisallowed))
            .expect("routes");
        assert_matches!(
            &*slot.borrow(),
            Some(Err(Error::Protocol(StatusCode::CommandDisallowed)))
        );
        // A later request starts fresh.
        let slot = request_session(&f, Rc::new(RefCell::new(Vec::new())));
        assert_eq!(f.transport.count_sent(Opcode::INQUIRY), 2);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        assert_matches!(&*slot.borrow(), Some(Ok(_)));
    }

    #[test]
    fn eir_name_suppresses_remote_name_request() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let _slot = request_session(&f, observed);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");

        let mut eir = vec![0x08, eir::SECTION_COMPLETE_NAME];
        eir.extend_from_slice(b"Kitchen");
        f.channel.handle_event(&extended_inquiry_result(ADDR, &eir)).expect("routes");

        let peer = f.cache.find_by_address(&Address::bredr(ADDR)).unwrap();
        assert_eq!(peer.name(), Some("Kitchen"));
        assert_eq!(peer.name_source(), Some(NameSource::AdvertisingDataOrEir));
        assert_eq!(f.transport.count_sent(Opcode::REMOTE_NAME_REQUEST), 0);
    }

    #[test]
    fn remote_name_result_updates_cache() {
        let f = fixture();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let _slot = request_session(&f, observed);
        f.channel
            .handle_event(&command_status(Opcode::INQUIRY, StatusCode::Success))
            .expect("routes");
        f.channel.handle_event(&inquiry_result_with_rssi(ADDR)).expect("routes");
        // A second sighting does not queue a second name request.
        f.channel.handle_event(&inquiry_result_with_rssi(ADDR)).expect("routes");
        f.channel
            .handle_event(&event_bytes(EventCode::InquiryComplete, &[0x00]))
            .expect("routes");
        assert_eq!(f.transport.count_sent(Opcode::REMOTE_NAME_REQUEST), 1);

        f.channel
            .handle_event(&remote_name_request_complete(ADDR, b"Speaker"))
            .expect("routes");
        let peer = f.cache.find_by_address(&Address::bredr(ADDR)).unwrap();
        assert_eq!(peer.name(), Some("Speaker"));
        assert_eq!(peer.name_source(), Some(NameSource::NameDiscoveryProcedure));
    }

    #[test]
    fn discoverable_enables_inquiry_scan_preserving_page_bit() {
        let f = fixture();
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discoverable(
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        assert_eq!(f.transport.count_sent(Opcode::WRITE_INQUIRY_SCAN_ACTIVITY), 1);
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_SCAN_ACTIVITY, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_SCAN_TYPE, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_MODE, &[0x00]))
            .expect("routes");
        // Page scan already on; the write must preserve it.
        f.channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x02]))
            .expect("routes");
        let params = f.transport.last_params(Opcode::WRITE_SCAN_ENABLE).unwrap();
        assert_eq!(params, vec![0x03]);
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_SCAN_ENABLE, &[0x00]))
            .expect("routes");
        assert_matches!(&*slot.borrow(), Some(Ok(_)));
    }

    fn complete_discoverable_start(f: &Fixture) {
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_SCAN_ACTIVITY, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_SCAN_TYPE, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_INQUIRY_MODE, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x02]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_SCAN_ENABLE, &[0x00]))
            .expect("routes");
    }

    #[test]
    fn dropping_last_discoverable_session_clears_only_inquiry_bit() {
        let f = fixture();
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discoverable(
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        complete_discoverable_start(&f);
        let session = slot.borrow_mut().take().unwrap().unwrap();

        drop(session);
        f.channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x03]))
            .expect("routes");
        let params = f.transport.last_params(Opcode::WRITE_SCAN_ENABLE).unwrap();
        assert_eq!(params, vec![0x02]);
    }

    #[test]
    fn discoverable_requested_while_stop_in_flight_restarts_once() {
        let f = fixture();
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discoverable(
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        complete_discoverable_start(&f);
        let session = slot.borrow_mut().take().unwrap().unwrap();
        drop(session);
        // Stop sequence is in flight (read issued).
        assert_eq!(f.transport.count_sent(Opcode::READ_SCAN_ENABLE), 2);

        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        f.manager.request_discoverable(
            Box::new(|_| {}),
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );
        // No new command until the stop settles.
        assert_eq!(f.transport.count_sent(Opcode::WRITE_INQUIRY_SCAN_ACTIVITY), 1);

        f.channel
            .handle_event(&command_complete(Opcode::READ_SCAN_ENABLE, &[0x00, 0x03]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_SCAN_ENABLE, &[0x00]))
            .expect("routes");
        // Exactly one restart of the start sequence.
        assert_eq!(f.transport.count_sent(Opcode::WRITE_INQUIRY_SCAN_ACTIVITY), 2);
        complete_discoverable_start(&f);
        assert_matches!(&*slot.borrow(), Some(Ok(_)));
    }

    #[test]
    fn update_local_name_failure_keeps_cached_name() {
        let f = fixture();
        let first = Rc::new(RefCell::new(None));
        let sink = first.clone();
        f.manager
            .update_local_name("first".into(), Box::new(move |r| *sink.borrow_mut() = Some(r)));
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_LOCAL_NAME, &[0x00]))
            .expect("routes");
        f.channel
            .handle_event(&command_complete(Opcode::WRITE_EXTENDED_INQUIRY_RESPONSE, &[0x00]))
            .expect("routes");
        assert_matches!(&*first.borrow(), Some(Ok(())));
        assert_eq!(f.manager.local_name().as_deref(), Some("first"));

        let second = Rc::new(RefCell::new(None));
        let sink = second.clone();
        f.manager
            .update_local_name("second".into(), Box::new(move |r| *sink.borrow_mut() = Some(r)));
        f.channel
            .handle_event(&command_complete(
                Opcode::WRITE_LOCAL_NAME,
                &[StatusCode::InvalidCommandParameters.to_u8()],
            ))
            .expect("routes");
        assert_matches!(&*second.borrow(), Some(Err(_)));
        assert_eq!(f.manager.local_name().as_deref(), Some("first"));
    }
}
