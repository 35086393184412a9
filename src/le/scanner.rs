// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command sequencing for the physical LE scanner. One scanner exists
//! per controller; the discovery manager decides when and in which mode
//! it runs.

use crate::error::Result;
use crate::hci::command::{CommandPacket, LeSetScanEnableParams, LeSetScanParametersParams};
use crate::hci::constants::{EventCode, Opcode};
use crate::hci::{CommandChannel, CommandRunner, Exclusions};

/// Scan interval in 0.625 ms slots.
const SCAN_INTERVAL: u16 = 0x0010;
/// Scan window in 0.625 ms slots.
const SCAN_WINDOW: u16 = 0x0010;
/// Public device address for scan requests.
const OWN_ADDRESS_TYPE_PUBLIC: u8 = 0x00;
/// Accept all advertisements; filtering happens per session.
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// The physical scan type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanType {
    Active,
    Passive,
}

impl ScanType {
    fn to_u8(self) -> u8 {
        match self {
            ScanType::Passive => 0x00,
            ScanType::Active => 0x01,
        }
    }
}

/// Completion callback for an enable or disable sequence.
pub type ScanCommandCallback = Box<dyn FnOnce(Result<()>) + 'static>;

/// Issues the scan parameter and enable commands. Duplicate filtering
/// stays off in the controller so per-session deduplication governs
/// delivery.
#[derive(Clone)]
pub(crate) struct LeScanner {
    channel: CommandChannel,
}

impl LeScanner {
    pub fn new(channel: CommandChannel) -> LeScanner {
        LeScanner { channel }
    }

    /// Writes scan parameters for `scan_type` and enables scanning.
    pub fn enable(&self, scan_type: ScanType, callback: ScanCommandCallback) {
        let runner = CommandRunner::new(self.channel.clone());
        runner.queue(
            CommandPacket::new(
                Opcode::LE_SET_SCAN_PARAMETERS,
                &LeSetScanParametersParams {
                    scan_type: scan_type.to_u8(),
                    interval: SCAN_INTERVAL,
                    window: SCAN_WINDOW,
                    own_address_type: OWN_ADDRESS_TYPE_PUBLIC,
                    filter_policy: FILTER_POLICY_ACCEPT_ALL,
                },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.queue(
            CommandPacket::new(
                Opcode::LE_SET_SCAN_ENABLE,
                &LeSetScanEnableParams { enable: true, filter_duplicates: false },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.run(callback);
    }

    /// Disables scanning.
    pub fn disable(&self, callback: ScanCommandCallback) {
        let runner = CommandRunner::new(self.channel.clone());
        runner.queue(
            CommandPacket::new(
                Opcode::LE_SET_SCAN_ENABLE,
                &LeSetScanEnableParams { enable: false, filter_duplicates: false },
            ),
            EventCode::CommandComplete,
            Exclusions::empty(),
            true,
            Box::new(|_| {}),
        );
        runner.run(callback);
    }
}
