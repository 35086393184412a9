// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side Bluetooth Generic Access Profile core.
//!
//! This crate implements the connection, pairing, discovery, and scanning
//! machinery that sits between an HCI transport and the profiles above it:
//!
//! - [`bredr::BrEdrConnectionManager`] owns ACL links to BR/EDR peers,
//!   arbitrates pairing, opens L2CAP channels under security requirements,
//!   and dispatches SDP service searches.
//! - [`bredr::BrEdrDiscoveryManager`] multiplexes inquiry and
//!   discoverable mode across concurrent client sessions.
//! - [`bredr::Interrogator`] collects a newly-connected peer's name,
//!   version, and feature pages.
//! - [`le::LeDiscoveryManager`] multiplexes active and passive LE
//!   scanning with per-session filters and a background mode for bonded
//!   peer rediscovery.
//!
//! All components share a single-threaded dispatcher; no component is
//! thread-safe against itself. HCI commands go out through
//! [`hci::CommandChannel`] and events come back in through the same
//! channel's `handle_event`.

pub mod bredr;
pub mod dispatch;
pub mod eir;
pub mod error;
pub mod hci;
pub mod l2cap;
pub mod le;
pub mod pairing_delegate;
pub mod peer;
pub mod sdp;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
