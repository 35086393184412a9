// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared fixtures for module tests: a transport that records every
//! encoded command, builders for inbound event packets, and a
//! dispatcher with manually advanced time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::{Dispatcher, Task, TaskHandle};
use crate::error::Result;
use crate::hci::constants::{EventCode, IoCapability, LinkKeyType, LinkType, Opcode, StatusCode};
use crate::hci::Transport;
use crate::l2cap::{Channel, ChannelCallback, ChannelParameters, L2cap, Psm, ReceiveHandlerSlot};
use crate::pairing_delegate::{ConfirmCallback, DisplayMethod, PairingDelegate, PasskeyCallback};
use crate::types::{ConnectionHandle, PeerId};

/// Records every command written to the transport.
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    pub fn new() -> RecordingTransport {
        RecordingTransport { sent: Mutex::new(Vec::new()) }
    }

    /// All packets sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// The opcodes of all packets sent so far.
    pub fn sent_opcodes(&self) -> Vec<Opcode> {
        self.sent
            .lock()
            .iter()
            .map(|packet| Opcode(u16::from_le_bytes([packet[0], packet[1]])))
            .collect()
    }

    /// Packets sent since the last call to this method.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// The parameter block of the most recent command with `opcode`, if
    /// any was sent.
    pub fn last_params(&self, opcode: Opcode) -> Option<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|packet| u16::from_le_bytes([packet[0], packet[1]]) == opcode.0)
            .map(|packet| packet[3..].to_vec())
    }

    /// Number of commands sent with `opcode`.
    pub fn count_sent(&self, opcode: Opcode) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|packet| u16::from_le_bytes([packet[0], packet[1]]) == opcode.0)
            .count()
    }
}

impl Transport for RecordingTransport {
    fn send_command(&self, packet: &[u8]) {
        assert!(packet.len() >= 3, "runt command packet");
        assert_eq!(packet.len() - 3, usize::from(packet[2]), "command length byte mismatch");
        self.sent.lock().push(packet.to_vec());
    }
}

/// Builds a raw event packet from a code and payload.
pub fn event_bytes(code: EventCode, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![code as u8, payload.len() as u8];
    out.extend_from_slice(payload);
    out
}

/// Builds a Command Complete event for `opcode` with the given return
/// parameters.
pub fn command_complete(opcode: Opcode, return_params: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x01];
    payload.extend_from_slice(&opcode.0.to_le_bytes());
    payload.extend_from_slice(return_params);
    event_bytes(EventCode::CommandComplete, &payload)
}

/// Builds a Command Status event for `opcode`.
pub fn command_status(opcode: Opcode, status: StatusCode) -> Vec<u8> {
    let mut payload = vec![status.to_u8(), 0x01];
    payload.extend_from_slice(&opcode.0.to_le_bytes());
    event_bytes(EventCode::CommandStatus, &payload)
}

/// Builds a Connection Complete event.
pub fn connection_complete(
    status: StatusCode,
    handle: u16,
    bd_addr: [u8; 6],
    link_type: LinkType,
) -> Vec<u8> {
    let mut payload = vec![status.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&bd_addr);
    payload.push(match link_type {
        LinkType::Sco => 0x00,
        LinkType::Acl => 0x01,
        LinkType::Esco => 0x02,
        LinkType::Unknown(value) => value,
    });
    payload.push(0x00);
    event_bytes(EventCode::ConnectionComplete, &payload)
}

/// Builds a Connection Request event.
pub fn connection_request(bd_addr: [u8; 6], link_type: LinkType) -> Vec<u8> {
    let mut payload = bd_addr.to_vec();
    payload.extend_from_slice(&[0x0C, 0x02, 0x5A]);
    payload.push(match link_type {
        LinkType::Sco => 0x00,
        LinkType::Acl => 0x01,
        LinkType::Esco => 0x02,
        LinkType::Unknown(value) => value,
    });
    event_bytes(EventCode::ConnectionRequest, &payload)
}

/// Builds a Disconnection Complete event.
pub fn disconnection_complete(handle: u16, reason: StatusCode) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.push(reason.to_u8());
    event_bytes(EventCode::DisconnectionComplete, &payload)
}

/// Builds a Remote Name Request Complete event with a C-string name.
pub fn remote_name_request_complete(bd_addr: [u8; 6], name: &[u8]) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&bd_addr);
    payload.extend_from_slice(name);
    payload.push(0);
    event_bytes(EventCode::RemoteNameRequestComplete, &payload)
}

/// Builds an LE Advertising Report event carrying one report.
pub fn le_advertising_report(
    event_type: u8,
    address_type: u8,
    address: [u8; 6],
    data: &[u8],
    rssi: i8,
) -> Vec<u8> {
    let mut payload = vec![crate::hci::constants::le_subevent::ADVERTISING_REPORT, 1];
    payload.push(event_type);
    payload.push(address_type);
    payload.extend_from_slice(&address);
    payload.push(data.len() as u8);
    payload.extend_from_slice(data);
    payload.push(rssi as u8);
    event_bytes(EventCode::LeMeta, &payload)
}

/// Builds an LE Directed Advertising Report event carrying one report.
pub fn le_directed_advertising_report(address_type: u8, address: [u8; 6]) -> Vec<u8> {
    let mut payload = vec![crate::hci::constants::le_subevent::DIRECTED_ADVERTISING_REPORT, 1];
    payload.push(0x01); // ADV_DIRECT_IND
    payload.push(address_type);
    payload.extend_from_slice(&address);
    payload.push(0x00); // direct address type: public
    payload.extend_from_slice(&[0xFF; 6]);
    payload.push((-45i8) as u8);
    event_bytes(EventCode::LeMeta, &payload)
}

/// Builds a Read Remote Version Information Complete event.
pub fn read_remote_version_complete(handle: u16) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.push(9);
    payload.extend_from_slice(&0x000Fu16.to_le_bytes());
    payload.extend_from_slice(&0x2222u16.to_le_bytes());
    event_bytes(EventCode::ReadRemoteVersionInformationComplete, &payload)
}

/// Builds a Read Remote Supported Features Complete event.
pub fn read_remote_supported_features_complete(handle: u16, features: u64) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&features.to_le_bytes());
    event_bytes(EventCode::ReadRemoteSupportedFeaturesComplete, &payload)
}

/// Builds a Read Remote Extended Features Complete event.
pub fn read_remote_extended_features_complete(
    handle: u16,
    page: u8,
    max_page: u8,
    features: u64,
) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.push(page);
    payload.push(max_page);
    payload.extend_from_slice(&features.to_le_bytes());
    event_bytes(EventCode::ReadRemoteExtendedFeaturesComplete, &payload)
}

/// Builds a Role Change event.
pub fn role_change(bd_addr: [u8; 6], role: u8) -> Vec<u8> {
    let mut payload = vec![StatusCode::Success.to_u8()];
    payload.extend_from_slice(&bd_addr);
    payload.push(role);
    event_bytes(EventCode::RoleChange, &payload)
}

/// Builds a Link Key Request event.
pub fn link_key_request(bd_addr: [u8; 6]) -> Vec<u8> {
    event_bytes(EventCode::LinkKeyRequest, &bd_addr)
}

/// Builds an IO Capability Request event.
pub fn io_capability_request(bd_addr: [u8; 6]) -> Vec<u8> {
    event_bytes(EventCode::IoCapabilityRequest, &bd_addr)
}

/// Builds an IO Capability Response event.
pub fn io_capability_response(bd_addr: [u8; 6], io: IoCapability) -> Vec<u8> {
    let mut payload = bd_addr.to_vec();
    payload.push(io.to_u8());
    payload.push(0x00);
    payload.push(0x05);
    event_bytes(EventCode::IoCapabilityResponse, &payload)
}

/// Builds a User Confirmation Request event.
pub fn user_confirmation_request(bd_addr: [u8; 6], value: u32) -> Vec<u8> {
    let mut payload = bd_addr.to_vec();
    payload.extend_from_slice(&value.to_le_bytes());
    event_bytes(EventCode::UserConfirmationRequest, &payload)
}

/// Builds a User Passkey Request event.
pub fn user_passkey_request(bd_addr: [u8; 6]) -> Vec<u8> {
    event_bytes(EventCode::UserPasskeyRequest, &bd_addr)
}

/// Builds a User Passkey Notification event.
pub fn user_passkey_notification(bd_addr: [u8; 6], passkey: u32) -> Vec<u8> {
    let mut payload = bd_addr.to_vec();
    payload.extend_from_slice(&passkey.to_le_bytes());
    event_bytes(EventCode::UserPasskeyNotification, &payload)
}

/// Builds a Simple Pairing Complete event.
pub fn simple_pairing_complete(bd_addr: [u8; 6], status: StatusCode) -> Vec<u8> {
    let mut payload = vec![status.to_u8()];
    payload.extend_from_slice(&bd_addr);
    event_bytes(EventCode::SimplePairingComplete, &payload)
}

/// Builds a Link Key Notification event.
pub fn link_key_notification(bd_addr: [u8; 6], key: [u8; 16], key_type: LinkKeyType) -> Vec<u8> {
    let mut payload = bd_addr.to_vec();
    payload.extend_from_slice(&key);
    let type_byte = match key_type {
        LinkKeyType::Combination => 0x00,
        LinkKeyType::DebugCombination => 0x03,
        LinkKeyType::UnauthenticatedCombination192 => 0x04,
        LinkKeyType::AuthenticatedCombination192 => 0x05,
        LinkKeyType::ChangedCombination => 0x06,
        LinkKeyType::UnauthenticatedCombination256 => 0x07,
        LinkKeyType::AuthenticatedCombination256 => 0x08,
        LinkKeyType::Other(value) => value,
    };
    payload.push(type_byte);
    event_bytes(EventCode::LinkKeyNotification, &payload)
}

/// Builds an Authentication Complete event.
pub fn authentication_complete(handle: u16, status: StatusCode) -> Vec<u8> {
    let mut payload = vec![status.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    event_bytes(EventCode::AuthenticationComplete, &payload)
}

/// Builds an Encryption Change event.
pub fn encryption_change(handle: u16, status: StatusCode, enabled: u8) -> Vec<u8> {
    let mut payload = vec![status.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.push(enabled);
    event_bytes(EventCode::EncryptionChange, &payload)
}

/// Builds a Synchronous Connection Complete event.
pub fn synchronous_connection_complete(
    status: StatusCode,
    handle: u16,
    bd_addr: [u8; 6],
) -> Vec<u8> {
    let mut payload = vec![status.to_u8()];
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&bd_addr);
    payload.push(0x02); // eSCO
    event_bytes(EventCode::SynchronousConnectionComplete, &payload)
}

/// One outbound channel-open request captured by [`FakeL2cap`].
pub struct PendingChannelOpen {
    pub handle: ConnectionHandle,
    pub psm: Psm,
    pub parameters: ChannelParameters,
    callback: ChannelCallback,
}

impl PendingChannelOpen {
    /// Resolves the open with a working channel and returns the test's
    /// end of it.
    pub fn succeed(self) -> FakeChannelPeer {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let rx_slot: ReceiveHandlerSlot = Arc::new(Mutex::new(None));
        let tx_log = sent.clone();
        let channel = Channel::new(
            Box::new(move |sdu| tx_log.lock().push(sdu.to_vec())),
            rx_slot.clone(),
            672,
        );
        (self.callback)(Some(channel));
        FakeChannelPeer { sent, rx_slot }
    }

    /// Resolves the open with failure.
    pub fn fail(self) {
        (self.callback)(None);
    }
}

/// The remote end of a channel opened through [`FakeL2cap`].
pub struct FakeChannelPeer {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    rx_slot: ReceiveHandlerSlot,
}

impl FakeChannelPeer {
    /// SDUs the local end has sent so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Delivers an inbound SDU to the local end's receive handler.
    pub fn receive(&self, sdu: &[u8]) {
        let handler = self.rx_slot.lock().take();
        if let Some(mut handler) = handler {
            handler(sdu);
            let mut slot = self.rx_slot.lock();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }
}

/// An L2CAP layer that records open requests for tests to resolve.
pub struct FakeL2cap {
    opens: Mutex<Vec<PendingChannelOpen>>,
}

impl FakeL2cap {
    pub fn new() -> FakeL2cap {
        FakeL2cap { opens: Mutex::new(Vec::new()) }
    }

    pub fn pending_opens(&self) -> usize {
        self.opens.lock().len()
    }

    /// Takes the oldest unresolved open request.
    pub fn take_open(&self) -> Option<PendingChannelOpen> {
        let mut opens = self.opens.lock();
        if opens.is_empty() {
            None
        } else {
            Some(opens.remove(0))
        }
    }
}

impl L2cap for FakeL2cap {
    fn open_channel(
        &self,
        handle: ConnectionHandle,
        psm: Psm,
        parameters: ChannelParameters,
        callback: ChannelCallback,
    ) {
        self.opens.lock().push(PendingChannelOpen { handle, psm, parameters, callback });
    }
}

/// A scripted pairing delegate. Responders are invoked synchronously
/// with the configured answers; every interaction is recorded.
pub struct FakePairingDelegate {
    pub io: IoCapability,
    confirm_response: Mutex<bool>,
    passkey_response: Mutex<Option<u32>>,
    displayed: Mutex<Vec<(PeerId, u32, DisplayMethod)>>,
    completed: Mutex<Vec<(PeerId, Result<()>)>>,
}

impl FakePairingDelegate {
    pub fn new(io: IoCapability) -> FakePairingDelegate {
        FakePairingDelegate {
            io,
            confirm_response: Mutex::new(true),
            passkey_response: Mutex::new(None),
            displayed: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_confirm_response(&self, confirm: bool) {
        *self.confirm_response.lock() = confirm;
    }

    pub fn set_passkey_response(&self, passkey: Option<u32>) {
        *self.passkey_response.lock() = passkey;
    }

    pub fn displayed(&self) -> Vec<(PeerId, u32, DisplayMethod)> {
        self.displayed.lock().clone()
    }

    pub fn completed(&self) -> Vec<(PeerId, Result<()>)> {
        self.completed.lock().clone()
    }
}

impl PairingDelegate for FakePairingDelegate {
    fn io_capability(&self) -> IoCapability {
        self.io
    }

    fn confirm_pairing(&self, _peer_id: PeerId, respond: ConfirmCallback) {
        respond(*self.confirm_response.lock());
    }

    fn display_passkey(
        &self,
        peer_id: PeerId,
        passkey: u32,
        method: DisplayMethod,
        respond: ConfirmCallback,
    ) {
        self.displayed.lock().push((peer_id, passkey, method));
        respond(*self.confirm_response.lock());
    }

    fn request_passkey(&self, _peer_id: PeerId, respond: PasskeyCallback) {
        respond(*self.passkey_response.lock());
    }

    fn complete_pairing(&self, peer_id: PeerId, status: Result<()>) {
        self.completed.lock().push((peer_id, status));
    }
}

struct ScheduledTask {
    deadline: Instant,
    sequence: u64,
    task: Task,
}

struct FakeDispatcherInner {
    now: Instant,
    next_id: u64,
    tasks: HashMap<u64, ScheduledTask>,
}

/// A dispatcher whose clock only moves when a test calls
/// [`FakeDispatcher::advance`]. Due tasks run in deadline order,
/// breaking ties by schedule order.
#[derive(Clone)]
pub struct FakeDispatcher {
    inner: Arc<Mutex<FakeDispatcherInner>>,
}

impl FakeDispatcher {
    pub fn new() -> FakeDispatcher {
        FakeDispatcher {
            inner: Arc::new(Mutex::new(FakeDispatcherInner {
                now: Instant::now(),
                next_id: 0,
                tasks: HashMap::new(),
            })),
        }
    }

    /// Moves the clock forward and runs every task that becomes due.
    /// Tasks scheduled by a running task fire in the same call if they
    /// fall within the advanced window.
    pub fn advance(&self, duration: Duration) {
        let target = {
            let mut inner = self.inner.lock();
            let target = inner.now + duration;
            inner.now = target;
            target
        };
        loop {
            let due = {
                let mut inner = self.inner.lock();
                let next = inner
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.sequence))
                    .map(|(&id, _)| id);
                match next {
                    Some(id) => inner.tasks.remove(&id),
                    None => None,
                }
            };
            match due {
                Some(scheduled) => (scheduled.task)(),
                None => break,
            }
        }
    }

    /// Number of tasks currently scheduled.
    pub fn pending_tasks(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

impl Dispatcher for FakeDispatcher {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let deadline = inner.now + delay;
        inner.tasks.insert(id, ScheduledTask { deadline, sequence: id, task });
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) {
        self.inner.lock().tasks.remove(&handle.0);
    }
}
