// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoders for the HCI commands this crate issues. Parameter blocks
//! are little-endian; each struct mirrors the layout in Core Spec
//! Vol 4, Part E, Section 7.

use crate::error::{Error, Result};
use crate::hci::constants::{
    AuthRequirements, IoCapability, Opcode, ScanEnableBits, StatusCode,
};
use crate::hci::Encodable;
use crate::types::ConnectionHandle;

/// A fully built command: opcode plus encoded parameter block.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandPacket {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(opcode: Opcode, params: &dyn Encodable) -> CommandPacket {
        CommandPacket { opcode, payload: params.encoded() }
    }

    /// A command with an empty parameter block.
    pub fn new_empty(opcode: Opcode) -> CommandPacket {
        CommandPacket { opcode, payload: Vec::new() }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The full wire packet: opcode, parameter length, parameters.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.extend_from_slice(&self.opcode.0.to_le_bytes());
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

macro_rules! check_len {
    ($buf:expr, $len:expr) => {
        if $buf.len() < $len {
            return Err(Error::Failed("encode buffer too small"));
        }
    };
}

/// Inquiry (Section 7.1.1).
#[derive(Debug)]
pub struct InquiryParams {
    pub lap: [u8; 3],
    /// Duration in 1.28 s units.
    pub length: u8,
    /// 0 means unlimited responses.
    pub num_responses: u8,
}

impl Encodable for InquiryParams {
    fn encoded_len(&self) -> usize {
        5
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 5);
        put(buf, 0, &self.lap);
        buf[3] = self.length;
        buf[4] = self.num_responses;
        Ok(())
    }
}

/// Create Connection (Section 7.1.5).
#[derive(Debug)]
pub struct CreateConnectionParams {
    pub bd_addr: [u8; 6],
    pub packet_types: u16,
    pub page_scan_repetition_mode: u8,
    /// Clock offset with the valid bit set when known.
    pub clock_offset: Option<u16>,
    pub allow_role_switch: bool,
}

impl Encodable for CreateConnectionParams {
    fn encoded_len(&self) -> usize {
        13
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 13);
        put(buf, 0, &self.bd_addr);
        put(buf, 6, &self.packet_types.to_le_bytes());
        buf[8] = self.page_scan_repetition_mode;
        buf[9] = 0; // reserved
        let clock = match self.clock_offset {
            Some(offset) => offset | 0x8000,
            None => 0,
        };
        put(buf, 10, &clock.to_le_bytes());
        buf[12] = self.allow_role_switch as u8;
        Ok(())
    }
}

/// Disconnect (Section 7.1.6).
#[derive(Debug)]
pub struct DisconnectParams {
    pub handle: ConnectionHandle,
    pub reason: StatusCode,
}

impl Encodable for DisconnectParams {
    fn encoded_len(&self) -> usize {
        3
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 3);
        put(buf, 0, &self.handle.to_le_bytes());
        buf[2] = self.reason.to_u8();
        Ok(())
    }
}

/// Parameter block consisting of a bare BD_ADDR. Used by Create
/// Connection Cancel, Link Key Request Negative Reply, User
/// Confirmation Request (Negative) Reply, and User Passkey Request
/// Negative Reply.
#[derive(Debug)]
pub struct BdAddrParams {
    pub bd_addr: [u8; 6],
}

impl Encodable for BdAddrParams {
    fn encoded_len(&self) -> usize {
        6
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 6);
        put(buf, 0, &self.bd_addr);
        Ok(())
    }
}

/// Accept Connection Request (Section 7.1.8). The role byte requests
/// Central (0x00) or stays Peripheral (0x01).
#[derive(Debug)]
pub struct AcceptConnectionRequestParams {
    pub bd_addr: [u8; 6],
    pub role: u8,
}

impl Encodable for AcceptConnectionRequestParams {
    fn encoded_len(&self) -> usize {
        7
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 7);
        put(buf, 0, &self.bd_addr);
        buf[6] = self.role;
        Ok(())
    }
}

/// Reject Connection Request (Section 7.1.9) and Reject Synchronous
/// Connection Request (Section 7.1.28) share this layout.
#[derive(Debug)]
pub struct RejectConnectionRequestParams {
    pub bd_addr: [u8; 6],
    pub reason: StatusCode,
}

impl Encodable for RejectConnectionRequestParams {
    fn encoded_len(&self) -> usize {
        7
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 7);
        put(buf, 0, &self.bd_addr);
        buf[6] = self.reason.to_u8();
        Ok(())
    }
}

/// Link Key Request Reply (Section 7.1.10).
#[derive(Debug)]
pub struct LinkKeyRequestReplyParams {
    pub bd_addr: [u8; 6],
    pub link_key: [u8; 16],
}

impl Encodable for LinkKeyRequestReplyParams {
    fn encoded_len(&self) -> usize {
        22
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 22);
        put(buf, 0, &self.bd_addr);
        put(buf, 6, &self.link_key);
        Ok(())
    }
}

/// Authentication Requested (Section 7.1.15) and the other
/// handle-only parameter blocks (Read Remote Version Information, Read
/// Remote Supported Features, Read Encryption Key Size).
#[derive(Debug)]
pub struct HandleParams {
    pub handle: ConnectionHandle,
}

impl Encodable for HandleParams {
    fn encoded_len(&self) -> usize {
        2
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 2);
        put(buf, 0, &self.handle.to_le_bytes());
        Ok(())
    }
}

/// Set Connection Encryption (Section 7.1.16).
#[derive(Debug)]
pub struct SetConnectionEncryptionParams {
    pub handle: ConnectionHandle,
    pub enable: bool,
}

impl Encodable for SetConnectionEncryptionParams {
    fn encoded_len(&self) -> usize {
        3
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 3);
        put(buf, 0, &self.handle.to_le_bytes());
        buf[2] = self.enable as u8;
        Ok(())
    }
}

/// Remote Name Request (Section 7.1.19).
#[derive(Debug)]
pub struct RemoteNameRequestParams {
    pub bd_addr: [u8; 6],
    pub page_scan_repetition_mode: u8,
    pub clock_offset: Option<u16>,
}

impl Encodable for RemoteNameRequestParams {
    fn encoded_len(&self) -> usize {
        10
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 10);
        put(buf, 0, &self.bd_addr);
        buf[6] = self.page_scan_repetition_mode;
        buf[7] = 0; // reserved
        let clock = match self.clock_offset {
            Some(offset) => offset | 0x8000,
            None => 0,
        };
        put(buf, 8, &clock.to_le_bytes());
        Ok(())
    }
}

/// Read Remote Extended Features (Section 7.1.22).
#[derive(Debug)]
pub struct ReadRemoteExtendedFeaturesParams {
    pub handle: ConnectionHandle,
    pub page: u8,
}

impl Encodable for ReadRemoteExtendedFeaturesParams {
    fn encoded_len(&self) -> usize {
        3
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 3);
        put(buf, 0, &self.handle.to_le_bytes());
        buf[2] = self.page;
        Ok(())
    }
}

/// IO Capability Request Reply (Section 7.1.29).
#[derive(Debug)]
pub struct IoCapabilityRequestReplyParams {
    pub bd_addr: [u8; 6],
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub auth_requirements: AuthRequirements,
}

impl Encodable for IoCapabilityRequestReplyParams {
    fn encoded_len(&self) -> usize {
        9
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 9);
        put(buf, 0, &self.bd_addr);
        buf[6] = self.io_capability.to_u8();
        buf[7] = self.oob_data_present as u8;
        buf[8] = self.auth_requirements.to_u8();
        Ok(())
    }
}

/// IO Capability Request Negative Reply (Section 7.1.36).
#[derive(Debug)]
pub struct IoCapabilityRequestNegativeReplyParams {
    pub bd_addr: [u8; 6],
    pub reason: StatusCode,
}

impl Encodable for IoCapabilityRequestNegativeReplyParams {
    fn encoded_len(&self) -> usize {
        7
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 7);
        put(buf, 0, &self.bd_addr);
        buf[6] = self.reason.to_u8();
        Ok(())
    }
}

/// User Passkey Request Reply (Section 7.1.33).
#[derive(Debug)]
pub struct UserPasskeyRequestReplyParams {
    pub bd_addr: [u8; 6],
    pub passkey: u32,
}

impl Encodable for UserPasskeyRequestReplyParams {
    fn encoded_len(&self) -> usize {
        10
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 10);
        put(buf, 0, &self.bd_addr);
        put(buf, 6, &self.passkey.to_le_bytes());
        Ok(())
    }
}

/// Enhanced Setup/Accept Synchronous Connection (Sections 7.1.45-46).
/// Codec negotiation is the caller's concern; the parameter block past
/// the addressing field is carried verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct EscoParameters {
    pub raw: Vec<u8>,
}

/// Enhanced Setup Synchronous Connection (Section 7.1.45).
#[derive(Debug)]
pub struct EnhancedSetupSynchronousConnectionParams {
    pub handle: ConnectionHandle,
    pub parameters: EscoParameters,
}

impl Encodable for EnhancedSetupSynchronousConnectionParams {
    fn encoded_len(&self) -> usize {
        2 + self.parameters.raw.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, self.encoded_len());
        put(buf, 0, &self.handle.to_le_bytes());
        put(buf, 2, &self.parameters.raw);
        Ok(())
    }
}

/// Enhanced Accept Synchronous Connection Request (Section 7.1.46).
#[derive(Debug)]
pub struct EnhancedAcceptSynchronousConnectionParams {
    pub bd_addr: [u8; 6],
    pub parameters: EscoParameters,
}

impl Encodable for EnhancedAcceptSynchronousConnectionParams {
    fn encoded_len(&self) -> usize {
        6 + self.parameters.raw.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, self.encoded_len());
        put(buf, 0, &self.bd_addr);
        put(buf, 6, &self.parameters.raw);
        Ok(())
    }
}

/// Write Local Name (Section 7.3.11). The name is null-padded to 248
/// bytes on the wire.
#[derive(Debug)]
pub struct WriteLocalNameParams {
    pub name: Vec<u8>,
}

impl Encodable for WriteLocalNameParams {
    fn encoded_len(&self) -> usize {
        248
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 248);
        let len = self.name.len().min(248);
        put(buf, 0, &self.name[..len]);
        for byte in buf[len..248].iter_mut() {
            *byte = 0;
        }
        Ok(())
    }
}

/// Write Scan Enable (Section 7.3.18).
#[derive(Debug)]
pub struct WriteScanEnableParams {
    pub scan_enable: ScanEnableBits,
}

impl Encodable for WriteScanEnableParams {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 1);
        buf[0] = self.scan_enable.bits();
        Ok(())
    }
}

/// Write Page Scan Activity (Section 7.3.19) and Write Inquiry Scan
/// Activity (Section 7.3.21) share this layout. Interval and window are
/// in 0.625 ms slots.
#[derive(Debug)]
pub struct WriteScanActivityParams {
    pub interval: u16,
    pub window: u16,
}

impl Encodable for WriteScanActivityParams {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 4);
        put(buf, 0, &self.interval.to_le_bytes());
        put(buf, 2, &self.window.to_le_bytes());
        Ok(())
    }
}

/// Single-byte parameter blocks: Write Page Scan Type, Write Inquiry
/// Scan Type, Write Inquiry Mode.
#[derive(Debug)]
pub struct ByteParams {
    pub value: u8,
}

impl Encodable for ByteParams {
    fn encoded_len(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 1);
        buf[0] = self.value;
        Ok(())
    }
}

/// Write Extended Inquiry Response (Section 7.3.56). The EIR block is
/// null-padded to 240 bytes.
#[derive(Debug)]
pub struct WriteExtendedInquiryResponseParams {
    pub fec_required: bool,
    pub eir: Vec<u8>,
}

impl Encodable for WriteExtendedInquiryResponseParams {
    fn encoded_len(&self) -> usize {
        241
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 241);
        buf[0] = self.fec_required as u8;
        let len = self.eir.len().min(240);
        put(buf, 1, &self.eir[..len]);
        for byte in buf[1 + len..241].iter_mut() {
            *byte = 0;
        }
        Ok(())
    }
}

/// LE Set Scan Parameters (Section 7.8.10).
#[derive(Debug)]
pub struct LeSetScanParametersParams {
    /// 0x00 passive, 0x01 active.
    pub scan_type: u8,
    /// In 0.625 ms slots.
    pub interval: u16,
    pub window: u16,
    pub own_address_type: u8,
    pub filter_policy: u8,
}

impl Encodable for LeSetScanParametersParams {
    fn encoded_len(&self) -> usize {
        7
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 7);
        buf[0] = self.scan_type;
        put(buf, 1, &self.interval.to_le_bytes());
        put(buf, 3, &self.window.to_le_bytes());
        buf[5] = self.own_address_type;
        buf[6] = self.filter_policy;
        Ok(())
    }
}

/// LE Set Scan Enable (Section 7.8.11).
#[derive(Debug)]
pub struct LeSetScanEnableParams {
    pub enable: bool,
    pub filter_duplicates: bool,
}

impl Encodable for LeSetScanEnableParams {
    fn encoded_len(&self) -> usize {
        2
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        check_len!(buf, 2);
        buf[0] = self.enable as u8;
        buf[1] = self.filter_duplicates as u8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_packet_wire_format() {
        let packet = CommandPacket::new(
            Opcode::DISCONNECT,
            &DisconnectParams { handle: 0x0BAA, reason: StatusCode::RemoteUserTerminatedConnection },
        );
        // Opcode 0x0406 LE, length 3, handle LE, reason 0x13.
        assert_eq!(packet.bytes(), vec![0x06, 0x04, 0x03, 0xAA, 0x0B, 0x13]);
    }

    #[test]
    fn create_connection_sets_clock_offset_valid_bit() {
        let params = CreateConnectionParams {
            bd_addr: [1, 2, 3, 4, 5, 6],
            packet_types: 0xCC18,
            page_scan_repetition_mode: 0x02,
            clock_offset: Some(0x0123),
            allow_role_switch: true,
        };
        let encoded = params.encoded();
        assert_eq!(encoded.len(), 13);
        assert_eq!(&encoded[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 0xCC18);
        assert_eq!(u16::from_le_bytes([encoded[10], encoded[11]]), 0x8123);
        assert_eq!(encoded[12], 1);
    }

    #[test]
    fn create_connection_without_clock_offset() {
        let params = CreateConnectionParams {
            bd_addr: [0; 6],
            packet_types: 0xCC18,
            page_scan_repetition_mode: 0x00,
            clock_offset: None,
            allow_role_switch: false,
        };
        let encoded = params.encoded();
        assert_eq!(u16::from_le_bytes([encoded[10], encoded[11]]), 0);
        assert_eq!(encoded[12], 0);
    }

    #[test]
    fn write_local_name_pads_to_248() {
        let params = WriteLocalNameParams { name: b"fuchsia".to_vec() };
        let encoded = params.encoded();
        assert_eq!(encoded.len(), 248);
        assert_eq!(&encoded[0..7], b"fuchsia");
        assert!(encoded[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn io_capability_reply_layout() {
        let params = IoCapabilityRequestReplyParams {
            bd_addr: [0xAA; 6],
            io_capability: IoCapability::DisplayYesNo,
            oob_data_present: false,
            auth_requirements: AuthRequirements::MitmGeneralBonding,
        };
        let encoded = params.encoded();
        assert_eq!(encoded[6], 0x01);
        assert_eq!(encoded[7], 0x00);
        assert_eq!(encoded[8], 0x05);
    }

    #[test]
    fn le_scan_enable_layout() {
        let params = LeSetScanEnableParams { enable: true, filter_duplicates: false };
        assert_eq!(params.encoded(), vec![0x01, 0x00]);
    }
}
