// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-ACL connection records and the client-facing connection
//! reference.

use crate::bredr::pairing::PairingState;
use crate::hci::command::EscoParameters;
use crate::hci::constants::Role;
use crate::l2cap::{ChannelCallback, ChannelParameters, Psm};
use crate::peer::BrEdrLinkKey;
use crate::types::{ConnectionHandle, PeerId};

/// Why a local disconnect was requested. `ApiRequest` starts the
/// inbound-connection cooldown; other reasons do not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    ApiRequest,
    PairingFailed,
    Error,
}

/// A non-owning reference to a live ACL connection, handed to clients.
/// Valid only while the connection manager lives and the link stays up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BrEdrConnection {
    peer_id: PeerId,
    handle: ConnectionHandle,
}

impl BrEdrConnection {
    pub(crate) fn new(peer_id: PeerId, handle: ConnectionHandle) -> BrEdrConnection {
        BrEdrConnection { peer_id, handle }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }
}

/// Internal lifecycle state of one ACL link. The peer's public
/// connection state maps Interrogating/Pairing onto Initializing and
/// Available onto Connected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AclState {
    Interrogating,
    Available,
    Pairing,
    Disconnecting,
}

/// Completion callback for a local disconnect, fired when the
/// Disconnection Complete event arrives.
pub type DisconnectCallback = Box<dyn FnOnce() + 'static>;

/// An L2CAP open deferred behind a pairing round. The requirement that
/// queued it is re-checked once against the post-pairing key.
pub(crate) struct QueuedChannelOpen {
    pub psm: Psm,
    pub security: crate::bredr::SecurityRequirements,
    pub parameters: ChannelParameters,
    pub callback: ChannelCallback,
}

/// State owned by the connection manager for each live ACL handle.
pub(crate) struct ConnectionRecord {
    pub handle: ConnectionHandle,
    pub peer_id: PeerId,
    pub bd_addr: [u8; 6],
    pub role: Role,
    pub state: AclState,
    /// The key in use on this link, if any. Unlike the cached peer's
    /// bonding key this includes legacy keys usable only for the
    /// current session.
    pub link_key: Option<BrEdrLinkKey>,
    pub encrypted: bool,
    pub encryption_key_size: Option<u8>,
    pub pairing: Option<PairingState>,
    /// Channel opens waiting on an in-flight pairing upgrade.
    pub queued_opens: Vec<QueuedChannelOpen>,
    /// Callbacks awaiting Disconnection Complete for a local
    /// disconnect.
    pub disconnect_waiters: Vec<DisconnectCallback>,
    /// Child synchronous connections on top of this ACL.
    pub sco_handles: Vec<ConnectionHandle>,
    /// A registered inbound SCO accept: parameters to answer the next
    /// synchronous Connection Request from this peer with.
    pub sco_accept: Option<EscoParameters>,
}

impl ConnectionRecord {
    pub fn new(
        handle: ConnectionHandle,
        peer_id: PeerId,
        bd_addr: [u8; 6],
        role: Role,
    ) -> ConnectionRecord {
        ConnectionRecord {
            handle,
            peer_id,
            bd_addr,
            role,
            state: AclState::Interrogating,
            link_key: None,
            encrypted: false,
            encryption_key_size: None,
            pairing: None,
            queued_opens: Vec::new(),
            disconnect_waiters: Vec::new(),
            sco_handles: Vec::new(),
            sco_accept: None,
        }
    }

    /// True when the link meets `requirements` for opening channels:
    /// the open is allowed on an unsecured link only when nothing was
    /// required.
    pub fn security_satisfied(&self, requirements: &crate::bredr::SecurityRequirements) -> bool {
        if !requirements.authentication && !requirements.secure_connections {
            return true;
        }
        let key = match &self.link_key {
            Some(key) => key,
            None => return false,
        };
        if !self.encrypted {
            return false;
        }
        requirements.satisfied_by(key)
    }
}
