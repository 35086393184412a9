// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous connection (SCO/eSCO) request routing.
//!
//! Codec negotiation is out of scope; callers supply the Enhanced
//! Setup/Accept parameter block and receive the synchronous connection
//! handle. The connection manager consults this state when a
//! synchronous Connection Request or Synchronous Connection Complete
//! event arrives.

use std::collections::HashMap;

use crate::error::Result;
use crate::types::ConnectionHandle;

/// Callback delivering the synchronous connection handle.
pub type ScoConnectionCallback = Box<dyn FnOnce(Result<ConnectionHandle>) + 'static>;

/// Outstanding synchronous-connection activity, keyed by peer address.
/// At most one open or accept is in flight per peer.
#[derive(Default)]
pub(crate) struct ScoState {
    /// Locally initiated setups awaiting Synchronous Connection
    /// Complete.
    pending: HashMap<[u8; 6], ScoConnectionCallback>,
}

impl ScoState {
    pub fn new() -> ScoState {
        ScoState::default()
    }

    /// Registers a callback for the Synchronous Connection Complete
    /// expected from `bd_addr`. When one is already outstanding the
    /// callback is handed back so the caller can fail it.
    pub fn register_pending(
        &mut self,
        bd_addr: [u8; 6],
        callback: ScoConnectionCallback,
    ) -> std::result::Result<(), ScoConnectionCallback> {
        if self.pending.contains_key(&bd_addr) {
            return Err(callback);
        }
        self.pending.insert(bd_addr, callback);
        Ok(())
    }

    /// Resolves the pending setup for `bd_addr`, if any.
    pub fn take_pending(&mut self, bd_addr: &[u8; 6]) -> Option<ScoConnectionCallback> {
        self.pending.remove(bd_addr)
    }

    /// Fails every outstanding setup. Used at manager teardown.
    pub fn drain(&mut self) -> Vec<ScoConnectionCallback> {
        self.pending.drain().map(|(_, callback)| callback).collect()
    }
}
