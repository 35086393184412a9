// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The user-facing pairing delegate contract.
//!
//! A delegate is installed on the connection manager with
//! `set_pairing_delegate`; while none is installed the manager
//! negatively replies to IO Capability Requests, declining pairing
//! initiated by the peer.

use crate::error::Result;
use crate::hci::constants::IoCapability;
use crate::types::PeerId;

/// What the user is being shown a passkey for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisplayMethod {
    /// Numeric comparison: both sides display the same value and the
    /// user confirms they match.
    Comparison,
    /// The peer will enter the displayed passkey on its side.
    PeerEntry,
}

/// Response callback for a yes/no question put to the user.
pub type ConfirmCallback = Box<dyn FnOnce(bool) + 'static>;

/// Response callback for a passkey request. `None` reports user
/// rejection.
pub type PasskeyCallback = Box<dyn FnOnce(Option<u32>) + 'static>;

/// Callbacks a pairing user interface must implement. All methods are
/// invoked on the dispatcher thread; responders may be called
/// synchronously or later.
pub trait PairingDelegate {
    /// The IO capability advertised to peers while this delegate is
    /// installed.
    fn io_capability(&self) -> IoCapability;

    /// Asks the user to consent to pairing with no values to compare.
    fn confirm_pairing(&self, peer_id: PeerId, respond: ConfirmCallback);

    /// Shows a passkey. For [`DisplayMethod::Comparison`] the responder
    /// carries the user's match/no-match answer; for
    /// [`DisplayMethod::PeerEntry`] responding true acknowledges the
    /// display.
    fn display_passkey(
        &self,
        peer_id: PeerId,
        passkey: u32,
        method: DisplayMethod,
        respond: ConfirmCallback,
    );

    /// Asks the user to type the passkey shown on the peer.
    fn request_passkey(&self, peer_id: PeerId, respond: PasskeyCallback);

    /// Reports the outcome of a pairing procedure this delegate
    /// participated in.
    fn complete_pairing(&self, peer_id: PeerId, status: Result<()>);
}
