// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The contract this crate uses to reach the L2CAP layer.
//!
//! L2CAP itself is an external collaborator: the connection manager
//! asks it to open outbound channels over an ACL link and is told about
//! fatal link errors by the embedder calling
//! `BrEdrConnectionManager::on_link_error`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::types::ConnectionHandle;

/// A Protocol/Service Multiplexer identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Psm(pub u16);

impl Psm {
    /// The well-known SDP PSM.
    pub const SDP: Psm = Psm(0x0001);
    pub const RFCOMM: Psm = Psm(0x0003);
    pub const AVDTP: Psm = Psm(0x0019);
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Channel retransmission/flow-control modes this crate requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelMode {
    Basic,
    EnhancedRetransmission,
}

/// Parameters for an outbound channel open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelParameters {
    pub mode: ChannelMode,
    pub max_rx_sdu_size: u16,
}

impl Default for ChannelParameters {
    fn default() -> ChannelParameters {
        // The L2CAP minimum MTU.
        ChannelParameters { mode: ChannelMode::Basic, max_rx_sdu_size: 672 }
    }
}

/// Slot the channel owner installs its inbound-SDU handler into.
pub type ReceiveHandlerSlot = Arc<Mutex<Option<Box<dyn FnMut(&[u8]) + 'static>>>>;

/// An open L2CAP channel. Valid only while the underlying ACL link is
/// up; the L2CAP layer signals link death separately.
pub struct Channel {
    tx: Box<dyn Fn(&[u8]) + 'static>,
    rx_slot: ReceiveHandlerSlot,
    max_tx_sdu_size: u16,
}

impl Channel {
    pub fn new(
        tx: Box<dyn Fn(&[u8]) + 'static>,
        rx_slot: ReceiveHandlerSlot,
        max_tx_sdu_size: u16,
    ) -> Channel {
        Channel { tx, rx_slot, max_tx_sdu_size }
    }

    /// Sends one SDU.
    pub fn send(&self, sdu: &[u8]) {
        (self.tx)(sdu);
    }

    /// Installs the inbound SDU handler, replacing any previous one.
    pub fn on_receive(&self, handler: Box<dyn FnMut(&[u8]) + 'static>) {
        *self.rx_slot.lock() = Some(handler);
    }

    pub fn max_tx_sdu_size(&self) -> u16 {
        self.max_tx_sdu_size
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("max_tx_sdu_size", &self.max_tx_sdu_size).finish()
    }
}

/// Callback for an outbound channel open. `None` reports failure.
pub type ChannelCallback = Box<dyn FnOnce(Option<Channel>) + 'static>;

/// The open-outbound-channel surface of the L2CAP layer.
pub trait L2cap {
    fn open_channel(
        &self,
        handle: ConnectionHandle,
        psm: Psm,
        parameters: ChannelParameters,
        callback: ChannelCallback,
    );
}
