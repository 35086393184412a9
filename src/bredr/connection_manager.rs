// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The BR/EDR connection manager: ACL lifecycle, pairing
//! orchestration, L2CAP channel opens under security requirements, SDP
//! service searches, and SCO request routing.
//!
//! Inbound and outbound connections meet here. An accepted or created
//! link is interrogated before it is usable; pairing runs whenever the
//! controller or a caller demands it; L2CAP opens wait on the security
//! their callers require. Local disconnects with reason `ApiRequest`
//! start a cooldown during which new inbound requests from that peer
//! are rejected.

use log::{info, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::bredr::connection::{
    AclState, BrEdrConnection, ConnectionRecord, DisconnectCallback, DisconnectReason,
    QueuedChannelOpen,
};
use crate::bredr::interrogator::Interrogator;
use crate::bredr::pairing::{
    auth_requirements_for, PairingCallback, PairingPhase, PairingState, SecurityRequirements,
};
use crate::bredr::sco::{ScoConnectionCallback, ScoState};
use crate::dispatch::{Dispatcher, TaskHandle};
use crate::hci::command::{
    AcceptConnectionRequestParams, BdAddrParams, ByteParams, CommandPacket,
    CreateConnectionParams, DisconnectParams, EnhancedAcceptSynchronousConnectionParams,
    EnhancedSetupSynchronousConnectionParams, EscoParameters, HandleParams,
    IoCapabilityRequestNegativeReplyParams, IoCapabilityRequestReplyParams,
    LinkKeyRequestReplyParams, RejectConnectionRequestParams, SetConnectionEncryptionParams,
    UserPasskeyRequestReplyParams, WriteScanActivityParams, WriteScanEnableParams,
};
use crate::hci::constants::{
    EventCode, IoCapability, LinkKeyType, LinkType, Opcode, Role, ScanEnableBits, StatusCode,
    DEFAULT_CONNECTION_PACKET_TYPES,
};
use crate::hci::event::{
    AuthenticationCompleteParams, CommandCompleteParams, ConnectionCompleteParams,
    ConnectionRequestParams, DisconnectionCompleteParams, EncryptionChangeParams,
    EncryptionKeyRefreshCompleteParams, EventPacket, IoCapabilityRequestParams,
    IoCapabilityResponseParams, LinkKeyNotificationParams, LinkKeyRequestParams,
    ReadEncryptionKeySizeReturn, ReadScanEnableReturn, RoleChangeParams,
    SimplePairingCompleteParams, SynchronousConnectionCompleteParams,
    UserConfirmationRequestParams, UserPasskeyNotificationParams, UserPasskeyRequestParams,
};
use crate::hci::{CommandChannel, CommandRunner, Decodable, Encodable, EventHandlerId, Exclusions};
use crate::l2cap::{Channel, ChannelCallback, ChannelParameters, L2cap, Psm};
use crate::pairing_delegate::{DisplayMethod, PairingDelegate};
use crate::peer::{BrEdrLinkKey, ConnectionState, PeerCache};
use crate::sdp::{
    parse_attribute_lists, service_class_uuids, AttributeId, ServiceSearchAttributeRequest,
    ServiceSearchAttributeResponse,
};
use crate::types::{Address, ConnectionHandle, PeerId, Uuid};
use crate::{Error, Result};

/// Page scan interval in 0.625 ms slots (1.28 s).
const PAGE_SCAN_INTERVAL: u16 = 0x0800;
/// Page scan window in 0.625 ms slots (10.625 ms).
const PAGE_SCAN_WINDOW: u16 = 0x0011;
/// Interlaced page scan.
const PAGE_SCAN_TYPE_INTERLACED: u8 = 0x01;
/// Default page scan repetition mode assumed for peers never seen in an
/// inquiry result.
const DEFAULT_PAGE_SCAN_REPETITION_MODE: u8 = 0x02;
/// No practical limit on returned attribute bytes per SDP transaction.
const SDP_MAX_ATTRIBUTE_BYTES: u16 = 0xFFFF;

/// Tunables injected by the embedder.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionManagerConfig {
    /// Budget for one Create Connection attempt before Create
    /// Connection Cancel is issued.
    pub create_connection_timeout: Duration,
    /// Window after a local `ApiRequest` disconnect during which
    /// inbound requests from that peer are rejected.
    pub local_disconnect_cooldown: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            create_connection_timeout: Duration::from_secs(10),
            local_disconnect_cooldown: Duration::from_secs(30),
        }
    }
}

/// Callback for an outbound connect request. Fires after the link is
/// up and interrogated.
pub type ConnectCallback = Box<dyn FnOnce(Result<BrEdrConnection>) + 'static>;

/// Completion callback for `set_connectable`.
pub type ConnectableCallback = Box<dyn FnOnce(Result<()>) + 'static>;

/// Invoked once per matching service record returned by a registered
/// search.
pub type SearchCallback =
    Box<dyn FnMut(PeerId, HashMap<u16, crate::sdp::DataElement>) + 'static>;

/// Identifies a registered service search.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SearchId(u64);

struct ConnectionRequestState {
    bd_addr: [u8; 6],
    callbacks: Vec<ConnectCallback>,
    /// A Create Connection command was issued for this request.
    outbound_in_flight: bool,
    /// The per-attempt timeout fired and Create Connection Cancel was
    /// issued; a failed completion now reports `Error::Timeout`.
    timed_out: bool,
    timeout_task: Option<TaskHandle>,
}

struct SearchRecord {
    uuid: Uuid,
    attr_ids: Vec<u16>,
    // `None` while checked out for invocation.
    callback: Option<SearchCallback>,
}

struct SdpTransaction {
    channel: Channel,
    search_id: u64,
    peer_id: PeerId,
    pattern: Uuid,
    attr_ids: Vec<u16>,
    transaction_id: u16,
    accumulated: Vec<u8>,
}

struct ManagerInner {
    channel: CommandChannel,
    cache: PeerCache,
    l2cap: Arc<dyn L2cap>,
    dispatcher: Arc<dyn Dispatcher>,
    interrogator: Interrogator,
    config: ConnectionManagerConfig,
    delegate: Option<Weak<dyn PairingDelegate>>,
    connections: HashMap<ConnectionHandle, ConnectionRecord>,
    requests: HashMap<PeerId, ConnectionRequestState>,
    incoming_in_flight: HashSet<[u8; 6]>,
    cooldowns: HashMap<[u8; 6], Instant>,
    searches: HashMap<u64, SearchRecord>,
    next_search_id: u64,
    sdp_transactions: HashMap<u64, SdpTransaction>,
    next_sdp_key: u64,
    next_sdp_transaction_id: u16,
    sco: ScoState,
    handler_ids: Vec<EventHandlerId>,
}

impl ManagerInner {
    fn connection_by_peer(&self, peer_id: PeerId) -> Option<ConnectionHandle> {
        self.connections.values().find(|c| c.peer_id == peer_id).map(|c| c.handle)
    }

    fn connection_by_addr(&self, bd_addr: &[u8; 6]) -> Option<ConnectionHandle> {
        self.connections.values().find(|c| &c.bd_addr == bd_addr).map(|c| c.handle)
    }

    fn in_cooldown(&self, bd_addr: &[u8; 6], now: Instant) -> bool {
        self.cooldowns.get(bd_addr).map_or(false, |deadline| now < *deadline)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for id in self.handler_ids.drain(..) {
            self.channel.remove_event_handler(id);
        }
        // Teardown is quiescent: every queued caller learns the manager
        // is gone, and no disconnect is issued from here.
        for (_, request) in self.requests.drain() {
            if let Some(task) = request.timeout_task {
                self.dispatcher.cancel(task);
            }
            for callback in request.callbacks {
                callback(Err(Error::Canceled));
            }
        }
        for (_, mut connection) in self.connections.drain() {
            for waiter in connection.disconnect_waiters.drain(..) {
                waiter();
            }
            if let Some(mut pairing) = connection.pairing.take() {
                for waiter in pairing.waiters.drain(..) {
                    waiter(Err(Error::Canceled));
                }
            }
            for open in connection.queued_opens.drain(..) {
                (open.callback)(None);
            }
        }
        for callback in self.sco.drain() {
            callback(Err(Error::Canceled));
        }
    }
}

/// Shared handle to the connection manager.
#[derive(Clone)]
pub struct BrEdrConnectionManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl BrEdrConnectionManager {
    pub fn new(
        channel: CommandChannel,
        cache: PeerCache,
        l2cap: Arc<dyn L2cap>,
        dispatcher: Arc<dyn Dispatcher>,
        config: ConnectionManagerConfig,
    ) -> BrEdrConnectionManager {
        let interrogator = Interrogator::new(channel.clone(), cache.clone());
        let inner = Arc::new(Mutex::new(ManagerInner {
            channel: channel.clone(),
            cache,
            l2cap,
            dispatcher,
            interrogator,
            config,
            delegate: None,
            connections: HashMap::new(),
            requests: HashMap::new(),
            incoming_in_flight: HashSet::new(),
            cooldowns: HashMap::new(),
            searches: HashMap::new(),
            next_search_id: 0,
            sdp_transactions: HashMap::new(),
            next_sdp_key: 0,
            next_sdp_transaction_id: 1,
            sco: ScoState::new(),
            handler_ids: Vec::new(),
        }));
        let manager = BrEdrConnectionManager { inner };

        type Handler = fn(&BrEdrConnectionManager, &EventPacket);
        let handlers: [(EventCode, Handler); 16] = [
            (EventCode::ConnectionRequest, Self::on_connection_request),
            (EventCode::ConnectionComplete, Self::on_connection_complete),
            (EventCode::DisconnectionComplete, Self::on_disconnection_complete),
            (EventCode::RoleChange, Self::on_role_change),
            (EventCode::LinkKeyRequest, Self::on_link_key_request),
            (EventCode::LinkKeyNotification, Self::on_link_key_notification),
            (EventCode::IoCapabilityRequest, Self::on_io_capability_request),
            (EventCode::IoCapabilityResponse, Self::on_io_capability_response),
            (EventCode::UserConfirmationRequest, Self::on_user_confirmation_request),
            (EventCode::UserPasskeyRequest, Self::on_user_passkey_request),
            (EventCode::UserPasskeyNotification, Self::on_user_passkey_notification),
            (EventCode::SimplePairingComplete, Self::on_simple_pairing_complete),
            (EventCode::AuthenticationComplete, Self::on_authentication_complete),
            (EventCode::EncryptionChange, Self::on_encryption_change),
            (EventCode::EncryptionKeyRefreshComplete, Self::on_encryption_key_refresh),
            (EventCode::SynchronousConnectionComplete, Self::on_synchronous_connection_complete),
        ];
        let mut handler_ids = Vec::new();
        for (code, handler) in handlers {
            let weak = Arc::downgrade(&manager.inner);
            handler_ids.push(channel.add_event_handler(
                code,
                Box::new(move |packet| {
                    if let Some(inner) = weak.upgrade() {
                        handler(&BrEdrConnectionManager { inner }, packet);
                    }
                }),
            ));
        }
        manager.inner.lock().handler_ids = handler_ids;
        manager
    }

    /// Enables or disables page scan. The inquiry-scan bit owned by the
    /// discovery manager is preserved.
    pub fn set_connectable(&self, connectable: bool, callback: ConnectableCallback) {
        let channel = self.inner.lock().channel.clone();
        let runner = CommandRunner::new(channel);
        if connectable {
            runner.queue(
                CommandPacket::new(
                    Opcode::WRITE_PAGE_SCAN_ACTIVITY,
                    &WriteScanActivityParams {
                        interval: PAGE_SCAN_INTERVAL,
                        window: PAGE_SCAN_WINDOW,
                    },
                ),
                EventCode::CommandComplete,
                Exclusions::empty(),
                true,
                Box::new(|_| {}),
            );
            runner.queue(
                CommandPacket::new(
                    Opcode::WRITE_PAGE_SCAN_TYPE,
                    &ByteParams { value: PAGE_SCAN_TYPE_INTERLACED },
                ),
                EventCode::CommandComplete,
                Exclusions::empty(),
                true,
                Box::new(|_| {}),
            );
        }
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
                let updated = if connectable {
                    current | ScanEnableBits::PAGE
                } else {
                    current - ScanEnableBits::PAGE
                };
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
        runner.run(Box::new(move |result| callback(result)));
    }

    /// Installs (or replaces) the pairing delegate. While none is
    /// installed the manager declines pairing initiated by the peer.
    pub fn set_pairing_delegate(&self, delegate: Weak<dyn PairingDelegate>) {
        self.inner.lock().delegate = Some(delegate);
    }

    /// Initiates an outbound ACL connection to a known BR/EDR-capable
    /// peer. `Err` means the request was rejected outright: the peer is
    /// unknown or LE-only. Otherwise the callback fires once the link
    /// is up and interrogated, or with the failure.
    pub fn connect(&self, peer_id: PeerId, callback: ConnectCallback) -> Result<()> {
        enum Action {
            Existing(BrEdrConnection, ConnectCallback),
            Attached,
            Create([u8; 6], Option<u8>, Option<u16>),
        }
        let action = {
            let mut inner = self.inner.lock();
            let peer = inner.cache.find_by_id(peer_id).ok_or(Error::NotFound)?;
            let address = peer.bredr_address().ok_or(Error::NotSupported)?;
            let bd_addr = *address.bytes();

            if let Some(handle) = inner.connection_by_peer(peer_id) {
                let record = &inner.connections[&handle];
                if record.state == AclState::Available || record.state == AclState::Pairing {
                    Action::Existing(BrEdrConnection::new(peer_id, handle), callback)
                } else {
                    // Interrogating: resolved when interrogation
                    // completes. Disconnecting: a fresh outbound
                    // attempt starts once the link is fully down.
                    inner
                        .requests
                        .entry(peer_id)
                        .or_insert_with(|| ConnectionRequestState {
                            bd_addr,
                            callbacks: Vec::new(),
                            outbound_in_flight: false,
                            timed_out: false,
                            timeout_task: None,
                        })
                        .callbacks
                        .push(callback);
                    Action::Attached
                }
            } else if let Some(request) = inner.requests.get_mut(&peer_id) {
                request.callbacks.push(callback);
                Action::Attached
            } else if inner.incoming_in_flight.contains(&bd_addr) {
                // An inbound procedure is already in flight; attach to
                // it instead of issuing a duplicate Create Connection.
                inner.requests.insert(
                    peer_id,
                    ConnectionRequestState {
                        bd_addr,
                        callbacks: vec![callback],
                        outbound_in_flight: false,
                        timed_out: false,
                        timeout_task: None,
                    },
                );
                Action::Attached
            } else {
                inner.requests.insert(
                    peer_id,
                    ConnectionRequestState {
                        bd_addr,
                        callbacks: vec![callback],
                        outbound_in_flight: true,
                        timed_out: false,
                        timeout_task: None,
                    },
                );
                inner.cache.update_peer(peer_id, |p| {
                    p.set_connection_state(ConnectionState::Initializing)
                });
                Action::Create(bd_addr, peer.page_scan_repetition_mode(), peer.clock_offset())
            }
        };

        match action {
            Action::Existing(connection, callback) => callback_ok(callback, connection),
            Action::Attached => Ok(()),
            Action::Create(bd_addr, psr_mode, clock_offset) => {
                self.send_create_connection(peer_id, bd_addr, psr_mode, clock_offset);
                Ok(())
            }
        }
    }

    fn send_create_connection(
        &self,
        peer_id: PeerId,
        bd_addr: [u8; 6],
        psr_mode: Option<u8>,
        clock_offset: Option<u16>,
    ) {
        info!("ConnectionManager: connecting to {}", Address::bredr(bd_addr));
        let (channel, timeout, dispatcher) = {
            let inner = self.inner.lock();
            (inner.channel.clone(), inner.config.create_connection_timeout, inner.dispatcher.clone())
        };

        let weak = Arc::downgrade(&self.inner);
        let task = dispatcher.schedule(
            timeout,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    BrEdrConnectionManager { inner }.on_create_connection_timeout(peer_id);
                }
            }),
        );
        if let Some(request) = self.inner.lock().requests.get_mut(&peer_id) {
            request.timeout_task = Some(task);
        }

        let manager = self.clone();
        channel.send_exclusive(
            CommandPacket::new(
                Opcode::CREATE_CONNECTION,
                &CreateConnectionParams {
                    bd_addr,
                    packet_types: DEFAULT_CONNECTION_PACKET_TYPES,
                    page_scan_repetition_mode: psr_mode
                        .unwrap_or(DEFAULT_PAGE_SCAN_REPETITION_MODE),
                    clock_offset,
                    allow_role_switch: true,
                },
            ),
            EventCode::CommandStatus,
            Exclusions::empty(),
            Box::new(move |result| {
                if let Err(error) = result {
                    manager.fail_request(peer_id, error);
                }
            }),
        );
    }

    fn on_create_connection_timeout(&self, peer_id: PeerId) {
        let cancel = {
            let mut inner = self.inner.lock();
            let channel = inner.channel.clone();
            match inner.requests.get_mut(&peer_id) {
                Some(request) if request.outbound_in_flight && !request.timed_out => {
                    request.timed_out = true;
                    request.timeout_task = None;
                    Some((channel, request.bd_addr))
                }
                _ => None,
            }
        };
        if let Some((channel, bd_addr)) = cancel {
            info!(
                "ConnectionManager: connection attempt to {} timed out",
                Address::bredr(bd_addr)
            );
            channel.send_command(
                CommandPacket::new(Opcode::CREATE_CONNECTION_CANCEL, &BdAddrParams { bd_addr }),
                // The canceled Connection Complete resolves the request.
                Box::new(|_| {}),
            );
        }
    }

    fn fail_request(&self, peer_id: PeerId, error: Error) {
        let callbacks = {
            let mut inner = self.inner.lock();
            let request = match inner.requests.remove(&peer_id) {
                Some(request) => request,
                None => return,
            };
            if let Some(task) = request.timeout_task {
                inner.dispatcher.cancel(task);
            }
            if inner.connection_by_peer(peer_id).is_none() {
                inner.cache.update_peer(peer_id, |p| {
                    p.set_connection_state(ConnectionState::NotConnected)
                });
            }
            request.callbacks
        };
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    /// Requests disconnection of the peer's ACL link. Returns true when
    /// the peer exists. Idempotent: repeated calls attach to the same
    /// disconnect and emit no duplicate commands. `callback` fires once
    /// the Disconnection Complete arrives (immediately when there is no
    /// link).
    pub fn disconnect(
        &self,
        peer_id: PeerId,
        reason: DisconnectReason,
        callback: DisconnectCallback,
    ) -> bool {
        enum Action {
            NoLink(DisconnectCallback),
            Requested,
        }
        let action = {
            let mut inner = self.inner.lock();
            let peer = match inner.cache.find_by_id(peer_id) {
                Some(peer) => peer,
                None => return false,
            };
            if reason == DisconnectReason::ApiRequest {
                if let Some(address) = peer.bredr_address() {
                    let deadline =
                        inner.dispatcher.now() + inner.config.local_disconnect_cooldown;
                    inner.cooldowns.insert(*address.bytes(), deadline);
                }
            }
            match inner.connection_by_peer(peer_id) {
                None => Action::NoLink(callback),
                Some(handle) => {
                    let channel = inner.channel.clone();
                    let record = inner.connections.get_mut(&handle).expect("record exists");
                    record.disconnect_waiters.push(callback);
                    if record.state != AclState::Disconnecting {
                        record.state = AclState::Disconnecting;
                        let hci_reason = match reason {
                            DisconnectReason::PairingFailed => StatusCode::AuthenticationFailure,
                            _ => StatusCode::RemoteUserTerminatedConnection,
                        };
                        channel.send_exclusive(
                            CommandPacket::new(
                                Opcode::DISCONNECT,
                                &DisconnectParams { handle, reason: hci_reason },
                            ),
                            EventCode::CommandStatus,
                            Exclusions::empty(),
                            Box::new(|_| {}),
                        );
                    }
                    Action::Requested
                }
            }
        };
        match action {
            Action::NoLink(callback) => {
                callback();
                true
            }
            Action::Requested => true,
        }
    }

    /// Opens (or reuses) an L2CAP channel to `psm`, pairing first when
    /// the link does not meet `security`. The callback receives `None`
    /// on any failure, including an open requested while interrogation
    /// is still running.
    pub fn open_l2cap_channel(
        &self,
        peer_id: PeerId,
        psm: Psm,
        security: SecurityRequirements,
        parameters: ChannelParameters,
        callback: ChannelCallback,
    ) {
        let delegate_io = self.delegate_io();
        enum Action {
            Fail(ChannelCallback),
            Open(ConnectionHandle, ChannelCallback),
        }
        let action = {
            let mut inner = self.inner.lock();
            let handle = match inner.connection_by_peer(peer_id) {
                Some(handle) => handle,
                None => {
                    drop(inner);
                    return callback(None);
                }
            };
            let record = inner.connections.get_mut(&handle).expect("record exists");
            match record.state {
                // Channel opens are blocked until interrogation
                // completes.
                AclState::Interrogating | AclState::Disconnecting => Action::Fail(callback),
                AclState::Available | AclState::Pairing => {
                    if record.security_satisfied(&security) {
                        Action::Open(handle, callback)
                    } else {
                        match delegate_io {
                            Some(io) if security.attainable_with(io) => {
                                record.queued_opens.push(QueuedChannelOpen {
                                    psm,
                                    security,
                                    parameters,
                                    callback,
                                });
                                drop(inner);
                                self.start_pairing(peer_id, security);
                                return;
                            }
                            // No delegate, or one that cannot produce a
                            // strong enough key: fail without pairing.
                            _ => Action::Fail(callback),
                        }
                    }
                }
            }
        };
        match action {
            Action::Fail(callback) => callback(None),
            Action::Open(handle, callback) => {
                let l2cap = self.inner.lock().l2cap.clone();
                l2cap.open_channel(handle, psm, parameters, callback);
            }
        }
    }

    /// Initiates pairing if the current link key is insufficient for
    /// `security`. Idempotent when already satisfied.
    pub fn pair(&self, peer_id: PeerId, security: SecurityRequirements, callback: PairingCallback) {
        let delegate_io = self.delegate_io();
        let start = {
            let mut inner = self.inner.lock();
            let handle = match inner.connection_by_peer(peer_id) {
                Some(handle) => handle,
                None => {
                    drop(inner);
                    return callback(Err(Error::NotFound));
                }
            };
            let record = inner.connections.get_mut(&handle).expect("record exists");
            if record.security_satisfied(&security) {
                drop(inner);
                return callback(Ok(()));
            }
            match delegate_io {
                Some(io) if security.attainable_with(io) => {}
                _ => {
                    drop(inner);
                    return callback(Err(Error::InsufficientSecurity));
                }
            }
            if let Some(pairing) = record.pairing.as_mut() {
                pairing.merge_requirements(security);
                pairing.waiters.push(callback);
                false
            } else {
                let mut pairing = PairingState::initiator(security);
                pairing.waiters.push(callback);
                record.pairing = Some(pairing);
                true
            }
        };
        if start {
            self.start_pairing(peer_id, security);
        }
    }

    /// Ensures a pairing round with at least `security` is running on
    /// the peer's connection.
    fn start_pairing(&self, peer_id: PeerId, security: SecurityRequirements) {
        let send = {
            let mut inner = self.inner.lock();
            let handle = match inner.connection_by_peer(peer_id) {
                Some(handle) => handle,
                None => return,
            };
            let channel = inner.channel.clone();
            let record = inner.connections.get_mut(&handle).expect("record exists");
            match record.pairing.as_mut() {
                Some(pairing) => {
                    pairing.merge_requirements(security);
                    None
                }
                None => {
                    record.pairing = Some(PairingState::initiator(security));
                    if record.state == AclState::Available {
                        record.state = AclState::Pairing;
                        inner.cache.update_peer(peer_id, |p| {
                            p.set_connection_state(ConnectionState::Initializing)
                        });
                    }
                    Some((channel, handle))
                }
            }
        };
        if let Some((channel, handle)) = send {
            let manager = self.clone();
            channel.send_exclusive(
                CommandPacket::new(Opcode::AUTHENTICATION_REQUESTED, &HandleParams { handle }),
                EventCode::CommandStatus,
                Exclusions::empty(),
                Box::new(move |result| {
                    if let Err(error) = result {
                        manager.fail_pairing(handle, error);
                    }
                }),
            );
        }
    }

    /// Registers an SDP search run against every new interrogated
    /// connection whose peer advertises `uuid` (or has no known
    /// services yet).
    pub fn add_service_search(
        &self,
        uuid: Uuid,
        attr_ids: Vec<u16>,
        callback: SearchCallback,
    ) -> SearchId {
        let mut inner = self.inner.lock();
        let id = inner.next_search_id;
        inner.next_search_id += 1;
        inner.searches.insert(id, SearchRecord { uuid, attr_ids, callback: Some(callback) });
        SearchId(id)
    }

    /// Unregisters a search. Returns false when the id is unknown.
    pub fn remove_service_search(&self, id: SearchId) -> bool {
        self.inner.lock().searches.remove(&id.0).is_some()
    }

    /// Requests an outbound SCO/eSCO link on top of an existing ACL.
    pub fn open_sco_connection(
        &self,
        peer_id: PeerId,
        parameters: EscoParameters,
        callback: ScoConnectionCallback,
    ) {
        let send = {
            let mut inner = self.inner.lock();
            let handle = match inner.connection_by_peer(peer_id) {
                Some(handle) => handle,
                None => {
                    drop(inner);
                    return callback(Err(Error::NotFound));
                }
            };
            let bd_addr = inner.connections[&handle].bd_addr;
            if let Err(callback) = inner.sco.register_pending(bd_addr, callback) {
                drop(inner);
                return callback(Err(Error::Failed("synchronous connection already pending")));
            }
            (inner.channel.clone(), handle, bd_addr)
        };
        let (channel, handle, bd_addr) = send;
        let manager = self.clone();
        channel.send_exclusive(
            CommandPacket::new(
                Opcode::ENHANCED_SETUP_SYNCHRONOUS_CONNECTION,
                &EnhancedSetupSynchronousConnectionParams { handle, parameters },
            ),
            EventCode::CommandStatus,
            Exclusions::empty(),
            Box::new(move |result| {
                if let Err(error) = result {
                    let callback = manager.inner.lock().sco.take_pending(&bd_addr);
                    if let Some(callback) = callback {
                        callback(Err(error));
                    }
                }
            }),
        );
    }

    /// Registers parameters to answer the next inbound SCO/eSCO request
    /// from the peer with. Without a registration, inbound synchronous
    /// requests are rejected.
    pub fn accept_sco_connection(
        &self,
        peer_id: PeerId,
        parameters: EscoParameters,
        callback: ScoConnectionCallback,
    ) {
        let mut inner = self.inner.lock();
        let handle = match inner.connection_by_peer(peer_id) {
            Some(handle) => handle,
            None => {
                drop(inner);
                return callback(Err(Error::NotFound));
            }
        };
        let bd_addr = inner.connections[&handle].bd_addr;
        if let Err(callback) = inner.sco.register_pending(bd_addr, callback) {
            drop(inner);
            return callback(Err(Error::Failed("synchronous connection already pending")));
        }
        inner.connections.get_mut(&handle).expect("record exists").sco_accept =
            Some(parameters);
    }

    /// Reports a fatal L2CAP failure on `handle`; the link is torn
    /// down.
    pub fn on_link_error(&self, handle: ConnectionHandle) {
        let peer_id = self.inner.lock().connections.get(&handle).map(|c| c.peer_id);
        if let Some(peer_id) = peer_id {
            warn!("ConnectionManager: link error on handle 0x{:04x}", handle);
            let _ = self.disconnect(peer_id, DisconnectReason::Error, Box::new(|| {}));
        }
    }

    /// The live connection reference for a peer, if its link is up and
    /// interrogated.
    pub fn connection_to(&self, peer_id: PeerId) -> Option<BrEdrConnection> {
        let inner = self.inner.lock();
        inner
            .connections
            .values()
            .find(|c| c.peer_id == peer_id && c.state != AclState::Disconnecting)
            .map(|c| BrEdrConnection::new(peer_id, c.handle))
    }

    fn delegate_io(&self) -> Option<IoCapability> {
        let delegate = self.inner.lock().delegate.clone();
        delegate.and_then(|weak| weak.upgrade()).map(|delegate| delegate.io_capability())
    }

    fn delegate(&self) -> Option<Arc<dyn PairingDelegate>> {
        let delegate = self.inner.lock().delegate.clone();
        delegate.and_then(|weak| weak.upgrade())
    }

    fn peer_id_for_addr(&self, bd_addr: &[u8; 6]) -> Option<PeerId> {
        let cache = self.inner.lock().cache.clone();
        cache.find_by_address(&Address::bredr(*bd_addr)).map(|p| p.identifier())
    }

    // Event handlers.

    fn on_connection_request(&self, packet: &EventPacket) {
        let params: ConnectionRequestParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed connection request: {}", e),
        };
        let bd_addr = params.bd_addr;
        enum Action {
            AcceptAcl,
            AcceptSco(EscoParameters),
            RejectAcl(StatusCode),
            RejectSco(StatusCode),
        }
        let action = {
            let mut inner = self.inner.lock();
            let now = inner.dispatcher.now();
            match params.link_type {
                LinkType::Acl => {
                    if inner.in_cooldown(&bd_addr, now) {
                        Action::RejectAcl(StatusCode::ConnectionRejectedBadBdAddr)
                    } else if !inner.incoming_in_flight.insert(bd_addr) {
                        // A duplicate request while one is in flight.
                        Action::RejectAcl(StatusCode::ConnectionRejectedBadBdAddr)
                    } else {
                        Action::AcceptAcl
                    }
                }
                LinkType::Sco | LinkType::Esco => {
                    let accept = inner
                        .connection_by_addr(&bd_addr)
                        .and_then(|handle| {
                            inner.connections.get_mut(&handle).and_then(|c| c.sco_accept.take())
                        });
                    match accept {
                        Some(parameters) => Action::AcceptSco(parameters),
                        None => Action::RejectSco(StatusCode::UnacceptableConnectionParameters),
                    }
                }
                LinkType::Unknown(_) => {
                    Action::RejectAcl(StatusCode::UnsupportedFeatureOrParameter)
                }
            }
        };

        let channel = self.inner.lock().channel.clone();
        match action {
            Action::AcceptAcl => {
                let cache = self.inner.lock().cache.clone();
                let peer_id = cache.new_peer(Address::bredr(bd_addr), true);
                cache.update_peer(peer_id, |p| {
                    p.set_connection_state(ConnectionState::Initializing)
                });
                info!("ConnectionManager: accepting connection from {}", Address::bredr(bd_addr));
                let manager = self.clone();
                channel.send_exclusive(
                    CommandPacket::new(
                        Opcode::ACCEPT_CONNECTION_REQUEST,
                        &AcceptConnectionRequestParams { bd_addr, role: 0x00 },
                    ),
                    EventCode::CommandStatus,
                    Exclusions::empty(),
                    Box::new(move |result| {
                        if result.is_err() {
                            // The accept never produced a link; clear
                            // the in-flight marker so later requests
                            // from this peer are not taken for
                            // duplicates.
                            let mut inner = manager.inner.lock();
                            inner.incoming_in_flight.remove(&bd_addr);
                            let cache = inner.cache.clone();
                            drop(inner);
                            if let Some(peer) =
                                cache.find_by_address(&Address::bredr(bd_addr))
                            {
                                cache.update_peer(peer.identifier(), |p| {
                                    p.set_connection_state(ConnectionState::NotConnected)
                                });
                            }
                        }
                    }),
                );
            }
            Action::AcceptSco(parameters) => {
                channel.send_exclusive(
                    CommandPacket::new(
                        Opcode::ENHANCED_ACCEPT_SYNCHRONOUS_CONNECTION_REQUEST,
                        &EnhancedAcceptSynchronousConnectionParams { bd_addr, parameters },
                    ),
                    EventCode::CommandStatus,
                    Exclusions::empty(),
                    Box::new(|_| {}),
                );
            }
            Action::RejectAcl(reason) => {
                info!(
                    "ConnectionManager: rejecting connection from {}: {}",
                    Address::bredr(bd_addr),
                    reason
                );
                channel.send_command(
                    CommandPacket::new(
                        Opcode::REJECT_CONNECTION_REQUEST,
                        &RejectConnectionRequestParams { bd_addr, reason },
                    ),
                    Box::new(|_| {}),
                );
            }
            Action::RejectSco(reason) => {
                channel.send_command(
                    CommandPacket::new(
                        Opcode::REJECT_SYNCHRONOUS_CONNECTION_REQUEST,
                        &RejectConnectionRequestParams { bd_addr, reason },
                    ),
                    Box::new(|_| {}),
                );
            }
        }
    }

    fn on_connection_complete(&self, packet: &EventPacket) {
        let params: ConnectionCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed connection complete: {}", e),
        };
        if params.link_type != LinkType::Acl {
            trace!("ConnectionManager: ignoring non-ACL connection complete");
            return;
        }
        let bd_addr = params.bd_addr;

        if params.status != StatusCode::Success {
            let _ = self.inner.lock().incoming_in_flight.remove(&bd_addr);
            let peer_id = match self.peer_id_for_addr(&bd_addr) {
                Some(peer_id) => peer_id,
                None => return,
            };
            if params.status == StatusCode::ConnectionAlreadyExists {
                // The outbound attempt raced an inbound link. The
                // incoming completion satisfies the request.
                trace!("ConnectionManager: outbound raced existing inbound link");
                return;
            }
            let timed_out =
                self.inner.lock().requests.get(&peer_id).map_or(false, |r| r.timed_out);
            let error = if timed_out { Error::Timeout } else { Error::Protocol(params.status) };
            self.fail_request(peer_id, error);
            let inner = self.inner.lock();
            if inner.connection_by_peer(peer_id).is_none() {
                let cache = inner.cache.clone();
                drop(inner);
                cache.update_peer(peer_id, |p| {
                    p.set_connection_state(ConnectionState::NotConnected)
                });
            }
            return;
        }

        let peer_id = {
            let mut inner = self.inner.lock();
            let was_incoming = inner.incoming_in_flight.remove(&bd_addr);
            let cache = inner.cache.clone();
            drop(inner);
            let peer_id = cache.new_peer(Address::bredr(bd_addr), true);
            let mut inner = self.inner.lock();
            let role = if was_incoming { Role::Peripheral } else { Role::Central };
            if let Some(request) = inner.requests.get_mut(&peer_id) {
                if let Some(task) = request.timeout_task.take() {
                    inner.dispatcher.cancel(task);
                }
            }
            inner
                .connections
                .insert(params.handle, ConnectionRecord::new(params.handle, peer_id, bd_addr, role));
            inner.cache.update_peer(peer_id, |p| {
                p.set_connection_state(ConnectionState::Initializing)
            });
            peer_id
        };
        info!(
            "ConnectionManager: link to {} up (handle 0x{:04x})",
            Address::bredr(bd_addr),
            params.handle
        );

        let interrogator = self.inner.lock().interrogator.clone();
        let manager = self.clone();
        let handle = params.handle;
        interrogator.start(
            peer_id,
            handle,
            Box::new(move |result| manager.on_interrogation_complete(peer_id, handle, result)),
        );
    }

    fn on_interrogation_complete(
        &self,
        peer_id: PeerId,
        handle: ConnectionHandle,
        result: Result<()>,
    ) {
        match result {
            Ok(()) => {
                let (callbacks, searches) = {
                    let mut inner = self.inner.lock();
                    let record = match inner.connections.get_mut(&handle) {
                        Some(record) => record,
                        None => return,
                    };
                    if record.state == AclState::Interrogating {
                        record.state = AclState::Available;
                    }
                    let pairing_active = record.pairing.is_some();
                    inner.cache.update_peer(peer_id, |p| {
                        p.set_connection_state(if pairing_active {
                            ConnectionState::Initializing
                        } else {
                            ConnectionState::Connected
                        })
                    });
                    let callbacks = inner
                        .requests
                        .remove(&peer_id)
                        .map(|r| {
                            if let Some(task) = r.timeout_task {
                                inner.dispatcher.cancel(task);
                            }
                            r.callbacks
                        })
                        .unwrap_or_default();
                    let peer = inner.cache.find_by_id(peer_id);
                    let services = peer.map(|p| p.services()).unwrap_or_default();
                    let searches: Vec<(u64, Uuid, Vec<u16>)> = inner
                        .searches
                        .iter()
                        .filter(|(_, s)| services.is_empty() || services.contains(&s.uuid))
                        .map(|(&id, s)| (id, s.uuid, s.attr_ids.clone()))
                        .collect();
                    (callbacks, searches)
                };
                for callback in callbacks {
                    callback(Ok(BrEdrConnection::new(peer_id, handle)));
                }
                for (search_id, uuid, attr_ids) in searches {
                    self.run_service_search(peer_id, handle, search_id, uuid, attr_ids);
                }
            }
            Err(error) => {
                warn!("ConnectionManager: interrogation of {} failed: {}", peer_id, error);
                let callbacks = {
                    let mut inner = self.inner.lock();
                    if let Some(record) = inner.connections.get_mut(&handle) {
                        if record.state != AclState::Disconnecting {
                            record.state = AclState::Disconnecting;
                            inner.channel.send_exclusive(
                                CommandPacket::new(
                                    Opcode::DISCONNECT,
                                    &DisconnectParams {
                                        handle,
                                        reason: StatusCode::RemoteUserTerminatedConnection,
                                    },
                                ),
                                EventCode::CommandStatus,
                                Exclusions::empty(),
                                Box::new(|_| {}),
                            );
                        }
                    }
                    inner
                        .requests
                        .remove(&peer_id)
                        .map(|r| {
                            if let Some(task) = r.timeout_task {
                                inner.dispatcher.cancel(task);
                            }
                            r.callbacks
                        })
                        .unwrap_or_default()
                };
                for callback in callbacks {
                    callback(Err(error.clone()));
                }
            }
        }
    }

    fn on_disconnection_complete(&self, packet: &EventPacket) {
        let params: DisconnectionCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed disconnection complete: {}", e),
        };
        let (record, interrogator, sco_callback, deferred_connect) = {
            let mut inner = self.inner.lock();
            let record = match inner.connections.remove(&params.handle) {
                Some(record) => record,
                None => {
                    // A child SCO handle going away with its parent, or
                    // a stale handle.
                    for connection in inner.connections.values_mut() {
                        connection.sco_handles.retain(|&h| h != params.handle);
                    }
                    return;
                }
            };
            let sco_callback = inner.sco.take_pending(&record.bd_addr);
            inner.cache.update_peer(record.peer_id, |p| {
                p.set_connection_state(ConnectionState::NotConnected)
            });
            // A connect that arrived while the link was tearing down
            // starts its outbound attempt now.
            let deferred_addr = match inner.requests.get_mut(&record.peer_id) {
                Some(request) if !request.outbound_in_flight => {
                    request.outbound_in_flight = true;
                    Some(request.bd_addr)
                }
                _ => None,
            };
            let deferred_connect = deferred_addr.map(|bd_addr| {
                let peer = inner.cache.find_by_id(record.peer_id);
                (
                    record.peer_id,
                    bd_addr,
                    peer.as_ref().and_then(|p| p.page_scan_repetition_mode()),
                    peer.as_ref().and_then(|p| p.clock_offset()),
                )
            });
            (record, inner.interrogator.clone(), sco_callback, deferred_connect)
        };
        info!(
            "ConnectionManager: {} disconnected (reason {})",
            record.peer_id, params.reason
        );
        interrogator.cancel(params.handle);

        let mut record = record;
        for waiter in record.disconnect_waiters.drain(..) {
            waiter();
        }
        if let Some(mut pairing) = record.pairing.take() {
            for waiter in pairing.waiters.drain(..) {
                waiter(Err(Error::LinkError));
            }
        }
        // Channel opens that were waiting on pairing see the link die.
        for open in record.queued_opens.drain(..) {
            (open.callback)(None);
        }
        if let Some(callback) = sco_callback {
            callback(Err(Error::LinkError));
        }
        if let Some((peer_id, bd_addr, psr_mode, clock_offset)) = deferred_connect {
            self.inner.lock().cache.update_peer(peer_id, |p| {
                p.set_connection_state(ConnectionState::Initializing)
            });
            self.send_create_connection(peer_id, bd_addr, psr_mode, clock_offset);
        }
    }

    fn on_role_change(&self, packet: &EventPacket) {
        let params: RoleChangeParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed role change: {}", e),
        };
        if params.status != StatusCode::Success {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.connection_by_addr(&params.bd_addr) {
            inner.connections.get_mut(&handle).expect("record exists").role = params.role;
        }
    }

    fn on_link_key_request(&self, packet: &EventPacket) {
        let params: LinkKeyRequestParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed link key request: {}", e),
        };
        let bd_addr = params.bd_addr;
        let (channel, bonded_key) = {
            let inner = self.inner.lock();
            let key = inner
                .cache
                .find_by_address(&Address::bredr(bd_addr))
                .filter(|p| p.bonded())
                .and_then(|p| p.bredr_link_key().cloned());
            (inner.channel.clone(), key)
        };
        match bonded_key {
            Some(key) => channel.send_command(
                CommandPacket::new(
                    Opcode::LINK_KEY_REQUEST_REPLY,
                    &LinkKeyRequestReplyParams { bd_addr, link_key: key.value },
                ),
                Box::new(|_| {}),
            ),
            None => channel.send_command(
                CommandPacket::new(
                    Opcode::LINK_KEY_REQUEST_NEGATIVE_REPLY,
                    &BdAddrParams { bd_addr },
                ),
                Box::new(|_| {}),
            ),
        }
    }

    fn on_io_capability_request(&self, packet: &EventPacket) {
        let params: IoCapabilityRequestParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed io capability request: {}", e),
        };
        let bd_addr = params.bd_addr;
        let delegate_io = self.delegate_io();
        let channel = self.inner.lock().channel.clone();
        match delegate_io {
            None => {
                info!("ConnectionManager: no pairing delegate; declining pairing");
                channel.send_command(
                    CommandPacket::new(
                        Opcode::IO_CAPABILITY_REQUEST_NEGATIVE_REPLY,
                        &IoCapabilityRequestNegativeReplyParams {
                            bd_addr,
                            reason: StatusCode::PairingNotAllowed,
                        },
                    ),
                    Box::new(|_| {}),
                );
            }
            Some(io) => {
                {
                    let mut inner = self.inner.lock();
                    if let Some(handle) = inner.connection_by_addr(&bd_addr) {
                        let record =
                            inner.connections.get_mut(&handle).expect("record exists");
                        let pairing =
                            record.pairing.get_or_insert_with(PairingState::responder);
                        pairing.local_io = Some(io);
                    }
                }
                channel.send_command(
                    CommandPacket::new(
                        Opcode::IO_CAPABILITY_REQUEST_REPLY,
                        &IoCapabilityRequestReplyParams {
                            bd_addr,
                            io_capability: io,
                            oob_data_present: false,
                            auth_requirements: auth_requirements_for(io),
                        },
                    ),
                    Box::new(|_| {}),
                );
            }
        }
    }

    fn on_io_capability_response(&self, packet: &EventPacket) {
        let params: IoCapabilityResponseParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed io capability response: {}", e),
        };
        // The peer is pairing with us; make sure responder state exists
        // so later events have somewhere to land.
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.connection_by_addr(&params.bd_addr) {
            let record = inner.connections.get_mut(&handle).expect("record exists");
            record.pairing.get_or_insert_with(PairingState::responder);
        }
    }

    fn on_user_confirmation_request(&self, packet: &EventPacket) {
        let params: UserConfirmationRequestParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => {
                return warn!("ConnectionManager: malformed user confirmation request: {}", e)
            }
        };
        let bd_addr = params.bd_addr;
        let peer_id = self.peer_id_for_addr(&bd_addr);
        let delegate = self.delegate();
        let channel = self.inner.lock().channel.clone();

        let (delegate, peer_id) = match (delegate, peer_id) {
            (Some(delegate), Some(peer_id)) => (delegate, peer_id),
            _ => {
                channel.send_command(
                    CommandPacket::new(
                        Opcode::USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY,
                        &BdAddrParams { bd_addr },
                    ),
                    Box::new(|_| {}),
                );
                return;
            }
        };

        let respond = Box::new(move |confirmed: bool| {
            let opcode = if confirmed {
                Opcode::USER_CONFIRMATION_REQUEST_REPLY
            } else {
                Opcode::USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY
            };
            channel.send_command(
                CommandPacket::new(opcode, &BdAddrParams { bd_addr }),
                Box::new(|_| {}),
            );
        });

        // Both sides displaying a value is a numeric comparison; a
        // display-less local side can only consent.
        if delegate.io_capability() == IoCapability::DisplayYesNo {
            delegate.display_passkey(
                peer_id,
                params.numeric_value,
                DisplayMethod::Comparison,
                respond,
            );
        } else {
            delegate.confirm_pairing(peer_id, respond);
        }
    }

    fn on_user_passkey_request(&self, packet: &EventPacket) {
        let params: UserPasskeyRequestParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed user passkey request: {}", e),
        };
        let bd_addr = params.bd_addr;
        let peer_id = self.peer_id_for_addr(&bd_addr);
        let delegate = self.delegate();
        let channel = self.inner.lock().channel.clone();

        let (delegate, peer_id) = match (delegate, peer_id) {
            (Some(delegate), Some(peer_id)) => (delegate, peer_id),
            _ => {
                channel.send_command(
                    CommandPacket::new(
                        Opcode::USER_PASSKEY_REQUEST_NEGATIVE_REPLY,
                        &BdAddrParams { bd_addr },
                    ),
                    Box::new(|_| {}),
                );
                return;
            }
        };
        delegate.request_passkey(
            peer_id,
            Box::new(move |passkey| match passkey {
                Some(passkey) => channel.send_command(
                    CommandPacket::new(
                        Opcode::USER_PASSKEY_REQUEST_REPLY,
                        &UserPasskeyRequestReplyParams { bd_addr, passkey },
                    ),
                    Box::new(|_| {}),
                ),
                // A negative passkey means the user rejected the
                // prompt.
                None => channel.send_command(
                    CommandPacket::new(
                        Opcode::USER_PASSKEY_REQUEST_NEGATIVE_REPLY,
                        &BdAddrParams { bd_addr },
                    ),
                    Box::new(|_| {}),
                ),
            }),
        );
    }

    fn on_user_passkey_notification(&self, packet: &EventPacket) {
        let params: UserPasskeyNotificationParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => {
                return warn!("ConnectionManager: malformed user passkey notification: {}", e)
            }
        };
        if let (Some(delegate), Some(peer_id)) =
            (self.delegate(), self.peer_id_for_addr(&params.bd_addr))
        {
            delegate.display_passkey(
                peer_id,
                params.passkey,
                DisplayMethod::PeerEntry,
                Box::new(|_| {}),
            );
        }
    }

    fn on_simple_pairing_complete(&self, packet: &EventPacket) {
        let params: SimplePairingCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed simple pairing complete: {}", e),
        };
        let peer_id = self.peer_id_for_addr(&params.bd_addr);
        let status = if params.status == StatusCode::Success {
            Ok(())
        } else {
            Err(Error::AuthenticationFailure)
        };
        if let (Some(delegate), Some(peer_id)) = (self.delegate(), peer_id) {
            delegate.complete_pairing(peer_id, status.clone());
        }
        if status.is_err() {
            let handle = self.inner.lock().connection_by_addr(&params.bd_addr);
            if let Some(handle) = handle {
                self.fail_pairing(handle, Error::AuthenticationFailure);
                if let Some(peer_id) = peer_id {
                    let _ =
                        self.disconnect(peer_id, DisconnectReason::PairingFailed, Box::new(|| {}));
                }
            }
        }
    }

    fn on_link_key_notification(&self, packet: &EventPacket) {
        let params: LinkKeyNotificationParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed link key notification: {}", e),
        };
        let key_type = params.key_type;
        let (peer_id, legacy_during_pairing) = {
            let mut inner = self.inner.lock();
            let cache = inner.cache.clone();
            let peer = cache.find_by_address(&Address::bredr(params.bd_addr));
            let peer_id = match peer {
                Some(peer) => peer.identifier(),
                None => return,
            };
            let bonded = cache.find_by_id(peer_id).map_or(false, |p| p.bonded());
            if key_type == LinkKeyType::ChangedCombination && !bonded {
                // The specification is ambiguous here; the observed
                // behavior is to ignore the event entirely.
                trace!("ConnectionManager: ignoring changed key for unbonded peer");
                return;
            }
            let key = BrEdrLinkKey::new(params.link_key, key_type, 16);
            let mut legacy_during_pairing = false;
            if let Some(handle) = inner.connection_by_addr(&params.bd_addr) {
                let record = inner.connections.get_mut(&handle).expect("record exists");
                record.link_key = Some(key.clone());
                if !key_type.is_secure_simple_pairing()
                    && key_type != LinkKeyType::ChangedCombination
                    && record.pairing.is_some()
                {
                    legacy_during_pairing = true;
                }
            }
            cache.update_peer(peer_id, |p| p.record_link_key(key));
            (peer_id, legacy_during_pairing)
        };
        if legacy_during_pairing {
            // A Legacy Pairing key cannot carry the link to the
            // connected state.
            warn!("ConnectionManager: legacy link key for {}; failing pairing", peer_id);
            let handle = self.inner.lock().connection_by_peer(peer_id);
            if let Some(handle) = handle {
                self.fail_pairing(handle, Error::AuthenticationFailure);
            }
            let _ = self.disconnect(peer_id, DisconnectReason::PairingFailed, Box::new(|| {}));
        }
    }

    fn on_authentication_complete(&self, packet: &EventPacket) {
        let params: AuthenticationCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed authentication complete: {}", e),
        };
        let handle = params.handle;
        if params.status != StatusCode::Success {
            self.fail_pairing(handle, Error::AuthenticationFailure);
            let peer_id = self.inner.lock().connections.get(&handle).map(|c| c.peer_id);
            if let Some(peer_id) = peer_id {
                let _ = self.disconnect(peer_id, DisconnectReason::PairingFailed, Box::new(|| {}));
            }
            return;
        }
        let channel = {
            let mut inner = self.inner.lock();
            let record = match inner.connections.get_mut(&handle) {
                Some(record) => record,
                None => return,
            };
            if let Some(pairing) = record.pairing.as_mut() {
                pairing.phase = PairingPhase::WaitingEncryption;
            }
            inner.channel.clone()
        };
        channel.send_exclusive(
            CommandPacket::new(
                Opcode::SET_CONNECTION_ENCRYPTION,
                &SetConnectionEncryptionParams { handle, enable: true },
            ),
            EventCode::CommandStatus,
            Exclusions::empty(),
            Box::new(|_| {}),
        );
    }

    fn on_encryption_change(&self, packet: &EventPacket) {
        let params: EncryptionChangeParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed encryption change: {}", e),
        };
        let handle = params.handle;
        if params.status != StatusCode::Success {
            self.fail_pairing(handle, Error::Protocol(params.status));
            self.drop_link(handle, DisconnectReason::Error);
            return;
        }
        if params.encryption_status.is_on() {
            self.read_encryption_key_size(handle);
        } else {
            // Encryption turned off on a live link: MIC failure. The
            // link terminates and is cleaned up on the Disconnection
            // Complete that follows.
            warn!("ConnectionManager: encryption lost on handle 0x{:04x}", handle);
            self.fail_pairing(handle, Error::AuthenticationFailure);
            self.drop_link(handle, DisconnectReason::Error);
        }
    }

    fn on_encryption_key_refresh(&self, packet: &EventPacket) {
        let params: EncryptionKeyRefreshCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => return warn!("ConnectionManager: malformed key refresh complete: {}", e),
        };
        if params.status == StatusCode::Success {
            self.read_encryption_key_size(params.handle);
        }
    }

    /// The link only becomes usable for channels once the key size is
    /// known.
    fn read_encryption_key_size(&self, handle: ConnectionHandle) {
        let channel = self.inner.lock().channel.clone();
        let manager = self.clone();
        channel.send_command(
            CommandPacket::new(Opcode::READ_ENCRYPTION_KEY_SIZE, &HandleParams { handle }),
            Box::new(move |result| {
                let key_size = result.and_then(|packet| {
                    packet
                        .decode::<CommandCompleteParams>()
                        .and_then(|p| p.return_params::<ReadEncryptionKeySizeReturn>())
                });
                match key_size {
                    Ok(ret) => manager.finish_encryption(handle, ret.key_size),
                    Err(error) => {
                        warn!("ConnectionManager: reading key size failed: {}", error);
                        manager.fail_pairing(handle, error);
                        manager.drop_link(handle, DisconnectReason::Error);
                    }
                }
            }),
        );
    }

    /// Encryption is up and its key size known: the pairing round (if
    /// any) reaches its terminal state and deferred channel opens run.
    fn finish_encryption(&self, handle: ConnectionHandle, key_size: u8) {
        enum Waiter {
            Pairing(PairingCallback, Result<()>),
            Retry(QueuedChannelOpen),
            FailOpen(ChannelCallback),
        }
        let waiters = {
            let mut inner = self.inner.lock();
            let record = match inner.connections.get_mut(&handle) {
                Some(record) => record,
                None => return,
            };
            record.encrypted = true;
            record.encryption_key_size = Some(key_size);
            let peer_id = record.peer_id;

            let mut waiters: Vec<Waiter> = Vec::new();
            if let Some(mut pairing) = record.pairing.take() {
                let satisfied = record.security_satisfied(&pairing.requirements);
                let outcome: Result<()> =
                    if satisfied { Ok(()) } else { Err(Error::InsufficientSecurity) };
                for waiter in pairing.waiters.drain(..) {
                    waiters.push(Waiter::Pairing(waiter, outcome.clone()));
                }
            }
            if record.state == AclState::Pairing {
                record.state = AclState::Available;
            }
            // Deferred opens retry exactly once against the new key; a
            // link that still falls short fails them without another
            // pairing round.
            let opens: Vec<QueuedChannelOpen> = record.queued_opens.drain(..).collect();
            for open in opens {
                if record.security_satisfied(&open.security) {
                    waiters.push(Waiter::Retry(open));
                } else {
                    waiters.push(Waiter::FailOpen(open.callback));
                }
            }
            let interrogated = record.state == AclState::Available;
            inner.cache.update_peer(peer_id, |p| {
                p.set_key_size(key_size);
                if interrogated {
                    p.set_connection_state(ConnectionState::Connected);
                }
            });
            waiters
        };

        for waiter in waiters {
            match waiter {
                Waiter::Pairing(callback, outcome) => callback(outcome),
                Waiter::Retry(open) => {
                    let l2cap = self.inner.lock().l2cap.clone();
                    l2cap.open_channel(handle, open.psm, open.parameters, open.callback);
                }
                Waiter::FailOpen(callback) => callback(None),
            }
        }
    }

    /// Fails the pairing round on `handle`, if one is active.
    fn fail_pairing(&self, handle: ConnectionHandle, error: Error) {
        let (waiters, opens) = {
            let mut inner = self.inner.lock();
            let record = match inner.connections.get_mut(&handle) {
                Some(record) => record,
                None => return,
            };
            let waiters = match record.pairing.take() {
                Some(mut pairing) => pairing.waiters.drain(..).collect::<Vec<_>>(),
                None => Vec::new(),
            };
            if record.state == AclState::Pairing {
                record.state = AclState::Available;
            }
            let opens: Vec<QueuedChannelOpen> = record.queued_opens.drain(..).collect();
            (waiters, opens)
        };
        for waiter in waiters {
            waiter(Err(error.clone()));
        }
        for open in opens {
            (open.callback)(None);
        }
    }

    fn drop_link(&self, handle: ConnectionHandle, reason: DisconnectReason) {
        let peer_id = self.inner.lock().connections.get(&handle).map(|c| c.peer_id);
        if let Some(peer_id) = peer_id {
            let _ = self.disconnect(peer_id, reason, Box::new(|| {}));
        }
    }

    fn on_synchronous_connection_complete(&self, packet: &EventPacket) {
        let params: SynchronousConnectionCompleteParams = match packet.decode() {
            Ok(params) => params,
            Err(e) => {
                return warn!(
                    "ConnectionManager: malformed synchronous connection complete: {}",
                    e
                )
            }
        };
        let callback = {
            let mut inner = self.inner.lock();
            let callback = inner.sco.take_pending(&params.bd_addr);
            if params.status == StatusCode::Success {
                if let Some(acl) = inner.connection_by_addr(&params.bd_addr) {
                    inner
                        .connections
                        .get_mut(&acl)
                        .expect("record exists")
                        .sco_handles
                        .push(params.handle);
                }
            }
            callback
        };
        if let Some(callback) = callback {
            match Error::from_status(params.status) {
                None => callback(Ok(params.handle)),
                Some(error) => callback(Err(error)),
            }
        }
    }

    // SDP dispatch.

    fn run_service_search(
        &self,
        peer_id: PeerId,
        handle: ConnectionHandle,
        search_id: u64,
        uuid: Uuid,
        attr_ids: Vec<u16>,
    ) {
        let l2cap = self.inner.lock().l2cap.clone();
        let weak = Arc::downgrade(&self.inner);
        l2cap.open_channel(
            handle,
            Psm::SDP,
            ChannelParameters::default(),
            Box::new(move |channel| {
                let channel = match channel {
                    Some(channel) => channel,
                    None => {
                        info!("ConnectionManager: SDP channel to {} failed to open", peer_id);
                        return;
                    }
                };
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let manager = BrEdrConnectionManager { inner };
                manager.begin_sdp_transaction(peer_id, search_id, uuid, attr_ids, channel);
            }),
        );
    }

    fn begin_sdp_transaction(
        &self,
        peer_id: PeerId,
        search_id: u64,
        uuid: Uuid,
        attr_ids: Vec<u16>,
        channel: Channel,
    ) {
        let (key, request) = {
            let mut inner = self.inner.lock();
            let key = inner.next_sdp_key;
            inner.next_sdp_key += 1;
            let transaction_id = inner.next_sdp_transaction_id;
            inner.next_sdp_transaction_id = inner.next_sdp_transaction_id.wrapping_add(1);

            let request = ServiceSearchAttributeRequest {
                transaction_id,
                service_search_pattern: vec![uuid],
                max_attribute_byte_count: SDP_MAX_ATTRIBUTE_BYTES,
                attribute_ids: attr_ids.iter().map(|&id| AttributeId::Single(id)).collect(),
                continuation_state: Vec::new(),
            };

            let weak = Arc::downgrade(&self.inner);
            channel.on_receive(Box::new(move |sdu| {
                if let Some(inner) = weak.upgrade() {
                    BrEdrConnectionManager { inner }.on_sdp_sdu(key, sdu);
                }
            }));

            inner.sdp_transactions.insert(
                key,
                SdpTransaction {
                    channel,
                    search_id,
                    peer_id,
                    pattern: uuid,
                    attr_ids,
                    transaction_id,
                    accumulated: Vec::new(),
                },
            );
            (key, request)
        };
        let inner = self.inner.lock();
        if let Some(transaction) = inner.sdp_transactions.get(&key) {
            transaction.channel.send(&request.encoded());
        }
    }

    fn on_sdp_sdu(&self, key: u64, sdu: &[u8]) {
        enum Step {
            Continue,
            Done(u64, PeerId, Uuid, Vec<u8>),
            Abort,
        }
        let step = {
            let mut inner = self.inner.lock();
            let transaction = match inner.sdp_transactions.get_mut(&key) {
                Some(transaction) => transaction,
                None => return,
            };
            match ServiceSearchAttributeResponse::decode(sdu) {
                Ok(response) => {
                    transaction.accumulated.extend_from_slice(&response.attribute_lists_fragment);
                    if response.continuation_state.is_empty() {
                        let transaction = inner.sdp_transactions.remove(&key).expect("present");
                        Step::Done(
                            transaction.search_id,
                            transaction.peer_id,
                            transaction.pattern,
                            transaction.accumulated,
                        )
                    } else {
                        let request = ServiceSearchAttributeRequest {
                            transaction_id: transaction.transaction_id,
                            service_search_pattern: vec![transaction.pattern],
                            max_attribute_byte_count: SDP_MAX_ATTRIBUTE_BYTES,
                            attribute_ids: transaction
                                .attr_ids
                                .iter()
                                .map(|&id| AttributeId::Single(id))
                                .collect(),
                            continuation_state: response.continuation_state,
                        };
                        transaction.channel.send(&request.encoded());
                        Step::Continue
                    }
                }
                Err(error) => {
                    warn!("ConnectionManager: bad SDP response: {}", error);
                    inner.sdp_transactions.remove(&key);
                    Step::Abort
                }
            }
        };
        let (search_id, peer_id, pattern, bytes) = match step {
            Step::Done(search_id, peer_id, pattern, bytes) => {
                (search_id, peer_id, pattern, bytes)
            }
            Step::Continue | Step::Abort => return,
        };

        let maps = match parse_attribute_lists(&bytes) {
            Ok(maps) => maps,
            Err(error) => {
                warn!("ConnectionManager: bad SDP attribute lists: {}", error);
                return;
            }
        };

        // Record the returned service classes; an empty result never
        // erases services learned before.
        let uuids: Vec<Uuid> = maps.iter().flat_map(|m| service_class_uuids(m)).collect();
        let cache = self.inner.lock().cache.clone();
        if !uuids.is_empty() {
            cache.update_peer(peer_id, |p| p.record_search_result(pattern, uuids));
        }

        for map in maps {
            let callback = {
                let mut inner = self.inner.lock();
                inner.searches.get_mut(&search_id).and_then(|s| s.callback.take())
            };
            let mut callback = match callback {
                Some(callback) => callback,
                // The search was removed while results were in flight.
                None => return,
            };
            callback(peer_id, map);
            let mut inner = self.inner.lock();
            if let Some(search) = inner.searches.get_mut(&search_id) {
                search.callback = Some(callback);
            }
        }
    }
}

fn callback_ok(callback: ConnectCallback, connection: BrEdrConnection) -> Result<()> {
    callback(Ok(connection));
    Ok(())
}
