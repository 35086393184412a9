// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BR/EDR (Classic) connection, pairing, discovery, and interrogation.

pub mod connection;
pub mod connection_manager;
pub mod discovery;
pub mod interrogator;
pub mod pairing;
pub mod sco;

pub use connection::{BrEdrConnection, DisconnectReason};
pub use connection_manager::{
    BrEdrConnectionManager, ConnectCallback, ConnectionManagerConfig, SearchCallback, SearchId,
};
pub use discovery::{BrEdrDiscoveryManager, DiscoverableSession, DiscoverySession};
pub use interrogator::Interrogator;
pub use pairing::{PairingCallback, SecurityRequirements};
pub use sco::ScoConnectionCallback;
