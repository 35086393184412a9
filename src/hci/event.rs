// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The HCI event packet parser and typed parameter views. Every view
//! validates the exact parameter length it needs; trailing bytes beyond
//! a known layout are tolerated (controllers append vendor fields), but
//! short payloads are `Error::Malformed`.

use crate::error::{Error, Result};
use crate::hci::constants::{
    le_subevent, EncryptionStatus, EventCode, IoCapability, LinkKeyType, LinkType, Opcode, Role,
    ScanEnableBits, StatusCode,
};
use crate::hci::{read_array, read_u16, Decodable};
use crate::types::ConnectionHandle;

/// A raw HCI event: event code, parameter length, parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct EventPacket {
    bytes: Vec<u8>,
}

impl EventPacket {
    /// Validates the header and length byte of a raw event packet.
    pub fn parse(bytes: &[u8]) -> Result<EventPacket> {
        if bytes.len() < 2 {
            return Err(Error::Malformed("event packet shorter than header"));
        }
        if bytes.len() - 2 != usize::from(bytes[1]) {
            return Err(Error::Malformed("event length byte does not match payload"));
        }
        Ok(EventPacket { bytes: bytes.to_vec() })
    }

    pub fn code_raw(&self) -> u8 {
        self.bytes[0]
    }

    pub fn code(&self) -> Option<EventCode> {
        EventCode::from_u8(self.bytes[0])
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[2..]
    }

    /// Parses the parameter block as `T`.
    pub fn decode<T: Decodable>(&self) -> Result<T> {
        T::decode(self.payload())
    }
}

/// Command Status (Section 7.7.15).
#[derive(Clone, Debug, PartialEq)]
pub struct CommandStatusParams {
    pub status: StatusCode,
    pub num_hci_command_packets: u8,
    pub opcode: Opcode,
}

impl Decodable for CommandStatusParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Malformed("command status too short"));
        }
        Ok(CommandStatusParams {
            status: StatusCode::from_u8(buf[0]),
            num_hci_command_packets: buf[1],
            opcode: Opcode(read_u16(buf, 2)?),
        })
    }
}

/// Command Complete (Section 7.7.14).
#[derive(Clone, Debug, PartialEq)]
pub struct CommandCompleteParams {
    pub num_hci_command_packets: u8,
    pub opcode: Opcode,
    pub return_params: Vec<u8>,
}

impl CommandCompleteParams {
    /// Parses the command-specific return parameters.
    pub fn return_params<T: Decodable>(&self) -> Result<T> {
        T::decode(&self.return_params)
    }

    /// The leading status byte every return block in this crate starts
    /// with.
    pub fn status(&self) -> Result<StatusCode> {
        self.return_params
            .first()
            .map(|&b| StatusCode::from_u8(b))
            .ok_or(Error::Malformed("command complete without status byte"))
    }
}

impl Decodable for CommandCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(Error::Malformed("command complete too short"));
        }
        Ok(CommandCompleteParams {
            num_hci_command_packets: buf[0],
            opcode: Opcode(read_u16(buf, 1)?),
            return_params: buf[3..].to_vec(),
        })
    }
}

/// A return block carrying only a status byte.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReturn {
    pub status: StatusCode,
}

impl Decodable for StatusReturn {
    fn decode(buf: &[u8]) -> Result<Self> {
        match buf.first() {
            Some(&b) => Ok(StatusReturn { status: StatusCode::from_u8(b) }),
            None => Err(Error::Malformed("empty return parameters")),
        }
    }
}

/// Read Scan Enable return block (Section 7.3.17).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadScanEnableReturn {
    pub status: StatusCode,
    pub scan_enable: ScanEnableBits,
}

impl Decodable for ReadScanEnableReturn {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Malformed("read scan enable return too short"));
        }
        Ok(ReadScanEnableReturn {
            status: StatusCode::from_u8(buf[0]),
            scan_enable: ScanEnableBits::from_bits_truncate(buf[1]),
        })
    }
}

/// Read Encryption Key Size return block (Section 7.5.7).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadEncryptionKeySizeReturn {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub key_size: u8,
}

impl Decodable for ReadEncryptionKeySizeReturn {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Malformed("read encryption key size return too short"));
        }
        Ok(ReadEncryptionKeySizeReturn {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            key_size: buf[3],
        })
    }
}

/// Inquiry Complete (Section 7.7.1).
#[derive(Clone, Debug, PartialEq)]
pub struct InquiryCompleteParams {
    pub status: StatusCode,
}

impl Decodable for InquiryCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        match buf.first() {
            Some(&b) => Ok(InquiryCompleteParams { status: StatusCode::from_u8(b) }),
            None => Err(Error::Malformed("inquiry complete too short")),
        }
    }
}

/// One response within an inquiry result event, in any of its flavors.
#[derive(Clone, Debug, PartialEq)]
pub struct InquiryResponse {
    pub bd_addr: [u8; 6],
    pub page_scan_repetition_mode: u8,
    pub class_of_device: [u8; 3],
    pub clock_offset: u16,
    pub rssi: Option<i8>,
}

/// Inquiry Result (Section 7.7.2).
#[derive(Clone, Debug, PartialEq)]
pub struct InquiryResultParams {
    pub responses: Vec<InquiryResponse>,
}

impl Decodable for InquiryResultParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        let num = usize::from(*buf.first().ok_or(Error::Malformed("inquiry result empty"))?);
        let mut responses = Vec::with_capacity(num);
        let mut at = 1;
        for _ in 0..num {
            responses.push(InquiryResponse {
                bd_addr: read_array(buf, at)?,
                page_scan_repetition_mode: *buf
                    .get(at + 6)
                    .ok_or(Error::Malformed("inquiry result truncated"))?,
                // Two reserved bytes follow the repetition mode.
                class_of_device: read_array(buf, at + 9)?,
                clock_offset: read_u16(buf, at + 12)?,
                rssi: None,
            });
            at += 14;
        }
        Ok(InquiryResultParams { responses })
    }
}

/// Inquiry Result with RSSI (Section 7.7.33).
#[derive(Clone, Debug, PartialEq)]
pub struct InquiryResultWithRssiParams {
    pub responses: Vec<InquiryResponse>,
}

impl Decodable for InquiryResultWithRssiParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        let num = usize::from(*buf.first().ok_or(Error::Malformed("inquiry result empty"))?);
        let mut responses = Vec::with_capacity(num);
        let mut at = 1;
        for _ in 0..num {
            responses.push(InquiryResponse {
                bd_addr: read_array(buf, at)?,
                page_scan_repetition_mode: *buf
                    .get(at + 6)
                    .ok_or(Error::Malformed("inquiry result truncated"))?,
                // One reserved byte in this flavor.
                class_of_device: read_array(buf, at + 8)?,
                clock_offset: read_u16(buf, at + 11)?,
                rssi: Some(
                    *buf.get(at + 13).ok_or(Error::Malformed("inquiry result truncated"))? as i8,
                ),
            });
            at += 14;
        }
        Ok(InquiryResultWithRssiParams { responses })
    }
}

/// Extended Inquiry Result (Section 7.7.38). Always a single response
/// plus a 240-byte EIR block.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtendedInquiryResultParams {
    pub response: InquiryResponse,
    pub eir: Vec<u8>,
}

impl Decodable for ExtendedInquiryResultParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 15 {
            return Err(Error::Malformed("extended inquiry result too short"));
        }
        if buf[0] != 1 {
            return Err(Error::Malformed("extended inquiry result with multiple responses"));
        }
        Ok(ExtendedInquiryResultParams {
            response: InquiryResponse {
                bd_addr: read_array(buf, 1)?,
                page_scan_repetition_mode: buf[7],
                class_of_device: read_array(buf, 9)?,
                clock_offset: read_u16(buf, 12)?,
                rssi: Some(buf[14] as i8),
            },
            eir: buf[15..].to_vec(),
        })
    }
}

/// Connection Complete (Section 7.7.3).
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub bd_addr: [u8; 6],
    pub link_type: LinkType,
    pub encryption_enabled: bool,
}

impl Decodable for ConnectionCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 11 {
            return Err(Error::Malformed("connection complete too short"));
        }
        Ok(ConnectionCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            bd_addr: read_array(buf, 3)?,
            link_type: LinkType::from_u8(buf[9]),
            encryption_enabled: buf[10] != 0,
        })
    }
}

/// Connection Request (Section 7.7.4).
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionRequestParams {
    pub bd_addr: [u8; 6],
    pub class_of_device: [u8; 3],
    pub link_type: LinkType,
}

impl Decodable for ConnectionRequestParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Malformed("connection request too short"));
        }
        Ok(ConnectionRequestParams {
            bd_addr: read_array(buf, 0)?,
            class_of_device: read_array(buf, 6)?,
            link_type: LinkType::from_u8(buf[9]),
        })
    }
}

/// Disconnection Complete (Section 7.7.5).
#[derive(Clone, Debug, PartialEq)]
pub struct DisconnectionCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub reason: StatusCode,
}

impl Decodable for DisconnectionCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Malformed("disconnection complete too short"));
        }
        Ok(DisconnectionCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            reason: StatusCode::from_u8(buf[3]),
        })
    }
}

/// Authentication Complete (Section 7.7.6).
#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticationCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
}

impl Decodable for AuthenticationCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(Error::Malformed("authentication complete too short"));
        }
        Ok(AuthenticationCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
        })
    }
}

/// Remote Name Request Complete (Section 7.7.7).
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteNameRequestCompleteParams {
    pub status: StatusCode,
    pub bd_addr: [u8; 6],
    name_bytes: Vec<u8>,
}

impl RemoteNameRequestCompleteParams {
    /// The remote name parsed as a C string: bytes up to the first zero,
    /// trailing bytes ignored.
    pub fn name(&self) -> &[u8] {
        let end = self.name_bytes.iter().position(|&b| b == 0).unwrap_or(self.name_bytes.len());
        &self.name_bytes[..end]
    }
}

impl Decodable for RemoteNameRequestCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 {
            return Err(Error::Malformed("remote name request complete too short"));
        }
        Ok(RemoteNameRequestCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            bd_addr: read_array(buf, 1)?,
            name_bytes: buf[7..].to_vec(),
        })
    }
}

/// Encryption Change (Section 7.7.8).
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionChangeParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub encryption_status: EncryptionStatus,
}

impl Decodable for EncryptionChangeParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Malformed("encryption change too short"));
        }
        Ok(EncryptionChangeParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            encryption_status: EncryptionStatus::from_u8(buf[3]),
        })
    }
}

/// Encryption Key Refresh Complete (Section 7.7.39).
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionKeyRefreshCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
}

impl Decodable for EncryptionKeyRefreshCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(Error::Malformed("encryption key refresh complete too short"));
        }
        Ok(EncryptionKeyRefreshCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
        })
    }
}

/// Read Remote Supported Features Complete (Section 7.7.11).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadRemoteSupportedFeaturesCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub features: u64,
}

impl Decodable for ReadRemoteSupportedFeaturesCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 11 {
            return Err(Error::Malformed("read remote supported features complete too short"));
        }
        Ok(ReadRemoteSupportedFeaturesCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            features: u64::from_le_bytes(read_array(buf, 3)?),
        })
    }
}

/// Read Remote Extended Features Complete (Section 7.7.34).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadRemoteExtendedFeaturesCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub page_number: u8,
    pub max_page_number: u8,
    pub features: u64,
}

impl Decodable for ReadRemoteExtendedFeaturesCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 13 {
            return Err(Error::Malformed("read remote extended features complete too short"));
        }
        Ok(ReadRemoteExtendedFeaturesCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            page_number: buf[3],
            max_page_number: buf[4],
            features: u64::from_le_bytes(read_array(buf, 5)?),
        })
    }
}

/// Read Remote Version Information Complete (Section 7.7.12).
#[derive(Clone, Debug, PartialEq)]
pub struct ReadRemoteVersionInformationCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

impl Decodable for ReadRemoteVersionInformationCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Malformed("read remote version complete too short"));
        }
        Ok(ReadRemoteVersionInformationCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            version: buf[3],
            manufacturer_name: read_u16(buf, 4)?,
            subversion: read_u16(buf, 6)?,
        })
    }
}

/// Role Change (Section 7.7.18).
#[derive(Clone, Debug, PartialEq)]
pub struct RoleChangeParams {
    pub status: StatusCode,
    pub bd_addr: [u8; 6],
    pub role: Role,
}

impl Decodable for RoleChangeParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Malformed("role change too short"));
        }
        Ok(RoleChangeParams {
            status: StatusCode::from_u8(buf[0]),
            bd_addr: read_array(buf, 1)?,
            role: Role::from_u8(buf[7]),
        })
    }
}

/// Link Key Request (Section 7.7.23).
#[derive(Clone, Debug, PartialEq)]
pub struct LinkKeyRequestParams {
    pub bd_addr: [u8; 6],
}

impl Decodable for LinkKeyRequestParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(LinkKeyRequestParams { bd_addr: read_array(buf, 0)? })
    }
}

/// Link Key Notification (Section 7.7.24).
#[derive(Clone, Debug, PartialEq)]
pub struct LinkKeyNotificationParams {
    pub bd_addr: [u8; 6],
    pub link_key: [u8; 16],
    pub key_type: LinkKeyType,
}

impl Decodable for LinkKeyNotificationParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 23 {
            return Err(Error::Malformed("link key notification too short"));
        }
        Ok(LinkKeyNotificationParams {
            bd_addr: read_array(buf, 0)?,
            link_key: read_array(buf, 6)?,
            key_type: LinkKeyType::from_u8(buf[22]),
        })
    }
}

/// IO Capability Request (Section 7.7.40).
#[derive(Clone, Debug, PartialEq)]
pub struct IoCapabilityRequestParams {
    pub bd_addr: [u8; 6],
}

impl Decodable for IoCapabilityRequestParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(IoCapabilityRequestParams { bd_addr: read_array(buf, 0)? })
    }
}

/// IO Capability Response (Section 7.7.41).
#[derive(Clone, Debug, PartialEq)]
pub struct IoCapabilityResponseParams {
    pub bd_addr: [u8; 6],
    pub io_capability: Option<IoCapability>,
    pub oob_data_present: bool,
    pub auth_requirements: u8,
}

impl Decodable for IoCapabilityResponseParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(Error::Malformed("io capability response too short"));
        }
        Ok(IoCapabilityResponseParams {
            bd_addr: read_array(buf, 0)?,
            io_capability: IoCapability::from_u8(buf[6]),
            oob_data_present: buf[7] != 0,
            auth_requirements: buf[8],
        })
    }
}

/// User Confirmation Request (Section 7.7.42).
#[derive(Clone, Debug, PartialEq)]
pub struct UserConfirmationRequestParams {
    pub bd_addr: [u8; 6],
    pub numeric_value: u32,
}

impl Decodable for UserConfirmationRequestParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Malformed("user confirmation request too short"));
        }
        Ok(UserConfirmationRequestParams {
            bd_addr: read_array(buf, 0)?,
            numeric_value: u32::from_le_bytes(read_array(buf, 6)?),
        })
    }
}

/// User Passkey Request (Section 7.7.43).
#[derive(Clone, Debug, PartialEq)]
pub struct UserPasskeyRequestParams {
    pub bd_addr: [u8; 6],
}

impl Decodable for UserPasskeyRequestParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(UserPasskeyRequestParams { bd_addr: read_array(buf, 0)? })
    }
}

/// User Passkey Notification (Section 7.7.48).
#[derive(Clone, Debug, PartialEq)]
pub struct UserPasskeyNotificationParams {
    pub bd_addr: [u8; 6],
    pub passkey: u32,
}

impl Decodable for UserPasskeyNotificationParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Malformed("user passkey notification too short"));
        }
        Ok(UserPasskeyNotificationParams {
            bd_addr: read_array(buf, 0)?,
            passkey: u32::from_le_bytes(read_array(buf, 6)?),
        })
    }
}

/// Simple Pairing Complete (Section 7.7.45).
#[derive(Clone, Debug, PartialEq)]
pub struct SimplePairingCompleteParams {
    pub status: StatusCode,
    pub bd_addr: [u8; 6],
}

impl Decodable for SimplePairingCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 {
            return Err(Error::Malformed("simple pairing complete too short"));
        }
        Ok(SimplePairingCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            bd_addr: read_array(buf, 1)?,
        })
    }
}

/// Synchronous Connection Complete (Section 7.7.35).
#[derive(Clone, Debug, PartialEq)]
pub struct SynchronousConnectionCompleteParams {
    pub status: StatusCode,
    pub handle: ConnectionHandle,
    pub bd_addr: [u8; 6],
    pub link_type: LinkType,
}

impl Decodable for SynchronousConnectionCompleteParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Malformed("synchronous connection complete too short"));
        }
        Ok(SynchronousConnectionCompleteParams {
            status: StatusCode::from_u8(buf[0]),
            handle: read_u16(buf, 1)?,
            bd_addr: read_array(buf, 3)?,
            link_type: LinkType::from_u8(buf[9]),
        })
    }
}

/// One report within an LE Advertising Report event.
#[derive(Clone, Debug, PartialEq)]
pub struct LeAdvertisingReport {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    pub data: Vec<u8>,
    pub rssi: i8,
}

/// LE Advertising Report (Section 7.7.65.2), subevent 0x02 of LE Meta.
#[derive(Clone, Debug, PartialEq)]
pub struct LeAdvertisingReportParams {
    pub reports: Vec<LeAdvertisingReport>,
}

impl Decodable for LeAdvertisingReportParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 || buf[0] != le_subevent::ADVERTISING_REPORT {
            return Err(Error::Malformed("not an advertising report subevent"));
        }
        let num = usize::from(buf[1]);
        let mut reports = Vec::with_capacity(num);
        let mut at = 2;
        for _ in 0..num {
            let event_type =
                *buf.get(at).ok_or(Error::Malformed("advertising report truncated"))?;
            let address_type =
                *buf.get(at + 1).ok_or(Error::Malformed("advertising report truncated"))?;
            let address = read_array(buf, at + 2)?;
            let data_len =
                usize::from(*buf.get(at + 8).ok_or(Error::Malformed("advertising report truncated"))?);
            let data = buf
                .get(at + 9..at + 9 + data_len)
                .ok_or(Error::Malformed("advertising report data truncated"))?
                .to_vec();
            let rssi = *buf
                .get(at + 9 + data_len)
                .ok_or(Error::Malformed("advertising report missing rssi"))? as i8;
            reports.push(LeAdvertisingReport { event_type, address_type, address, data, rssi });
            at += 10 + data_len;
        }
        Ok(LeAdvertisingReportParams { reports })
    }
}

/// One report within an LE Directed Advertising Report event.
#[derive(Clone, Debug, PartialEq)]
pub struct LeDirectedAdvertisingReport {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    pub direct_address_type: u8,
    pub direct_address: [u8; 6],
    pub rssi: i8,
}

/// LE Directed Advertising Report (Section 7.7.65.11), subevent 0x0B.
#[derive(Clone, Debug, PartialEq)]
pub struct LeDirectedAdvertisingReportParams {
    pub reports: Vec<LeDirectedAdvertisingReport>,
}

impl Decodable for LeDirectedAdvertisingReportParams {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 || buf[0] != le_subevent::DIRECTED_ADVERTISING_REPORT {
            return Err(Error::Malformed("not a directed advertising report subevent"));
        }
        let num = usize::from(buf[1]);
        let mut reports = Vec::with_capacity(num);
        let mut at = 2;
        for _ in 0..num {
            if buf.len() < at + 16 {
                return Err(Error::Malformed("directed advertising report truncated"));
            }
            reports.push(LeDirectedAdvertisingReport {
                event_type: buf[at],
                address_type: buf[at + 1],
                address: read_array(buf, at + 2)?,
                direct_address_type: buf[at + 8],
                direct_address: read_array(buf, at + 9)?,
                rssi: buf[at + 15] as i8,
            });
            at += 16;
        }
        Ok(LeDirectedAdvertisingReportParams { reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn parse_rejects_bad_length_byte() {
        assert_matches!(EventPacket::parse(&[0x0E]), Err(Error::Malformed(_)));
        assert_matches!(EventPacket::parse(&[0x0E, 0x03, 0x01]), Err(Error::Malformed(_)));
        assert!(EventPacket::parse(&[0x0E, 0x01, 0x01]).is_ok());
    }

    #[test]
    fn command_complete_decodes_opcode_and_returns() {
        let packet =
            EventPacket::parse(&[0x0E, 0x04, 0x01, 0x1A, 0x0C, 0x00]).expect("valid packet");
        assert_eq!(packet.code(), Some(EventCode::CommandComplete));
        let params: CommandCompleteParams = packet.decode().expect("decodes");
        assert_eq!(params.opcode, Opcode::WRITE_SCAN_ENABLE);
        assert_eq!(params.status().expect("status"), StatusCode::Success);
    }

    #[test]
    fn remote_name_parses_as_c_string() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.extend_from_slice(b"Display\0junk after the terminator");
        let params = RemoteNameRequestCompleteParams::decode(&payload).expect("decodes");
        assert_eq!(params.name(), b"Display");
    }

    #[test]
    fn remote_name_without_terminator_uses_all_bytes() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.extend_from_slice(b"abc");
        let params = RemoteNameRequestCompleteParams::decode(&payload).expect("decodes");
        assert_eq!(params.name(), b"abc");
    }

    #[test]
    fn inquiry_result_with_rssi_parses_each_response() {
        let mut payload = vec![2u8];
        for i in 0..2u8 {
            payload.extend_from_slice(&[i, 0, 0, 0, 0, 0]); // bd_addr
            payload.push(0x01); // page scan repetition mode
            payload.push(0x00); // reserved
            payload.extend_from_slice(&[0x0C, 0x02, 0x5A]); // class of device
            payload.extend_from_slice(&0x4000u16.to_le_bytes());
            payload.push((-40i8) as u8);
        }
        let params = InquiryResultWithRssiParams::decode(&payload).expect("decodes");
        assert_eq!(params.responses.len(), 2);
        assert_eq!(params.responses[1].bd_addr[0], 1);
        assert_eq!(params.responses[0].rssi, Some(-40));
    }

    #[test]
    fn le_advertising_report_parses_multiple_reports() {
        let mut payload = vec![le_subevent::ADVERTISING_REPORT, 2];
        // Report 1: ADV_IND with 3 bytes of data.
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.push(3);
        payload.extend_from_slice(&[0x02, 0x01, 0x06]);
        payload.push((-50i8) as u8);
        // Report 2: SCAN_RSP with no data.
        payload.extend_from_slice(&[0x04, 0x01]);
        payload.extend_from_slice(&[6, 5, 4, 3, 2, 1]);
        payload.push(0);
        payload.push((-60i8) as u8);

        let params = LeAdvertisingReportParams::decode(&payload).expect("decodes");
        assert_eq!(params.reports.len(), 2);
        assert_eq!(params.reports[0].data, vec![0x02, 0x01, 0x06]);
        assert_eq!(params.reports[1].event_type, 0x04);
        assert_eq!(params.reports[1].rssi, -60);
    }

    #[test]
    fn le_advertising_report_truncated_data_is_malformed() {
        let payload = vec![le_subevent::ADVERTISING_REPORT, 1, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 10];
        assert_matches!(
            LeAdvertisingReportParams::decode(&payload),
            Err(Error::Malformed(_))
        );
    }

    #[test]
    fn extended_features_complete_layout() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&0x0BAAu16.to_le_bytes());
        payload.push(1); // page
        payload.push(2); // max page
        payload.extend_from_slice(&0x0000_0000_0000_0003u64.to_le_bytes());
        let params = ReadRemoteExtendedFeaturesCompleteParams::decode(&payload).expect("decodes");
        assert_eq!(params.handle, 0x0BAA);
        assert_eq!(params.page_number, 1);
        assert_eq!(params.max_page_number, 2);
        assert_eq!(params.features, 3);
    }
}
