// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core identifier and address types shared by every subsystem.

use rand::Rng;
use std::fmt;

/// A connection handle assigned by the controller. Only the low 12 bits
/// are meaningful on the wire.
pub type ConnectionHandle = u16;

/// The kind of address carried in an [`Address`].
///
/// A BR/EDR address and an LE public address with identical bytes are
/// distinct map keys, but may alias the same physical peer. The peer
/// cache is responsible for merging such aliases (see
/// `PeerCache::find_by_address`).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AddressType {
    /// BR/EDR (BD_ADDR).
    BrEdr,
    /// LE public device address.
    LePublic,
    /// LE random (static) device address.
    LeRandom,
    /// LE resolvable private address.
    LeRandomResolvable,
    /// LE anonymous advertisement; no address was transmitted.
    LeAnonymous,
}

impl AddressType {
    pub fn is_le(&self) -> bool {
        !matches!(self, AddressType::BrEdr)
    }
}

/// A 48-bit device address tagged with its type. Two addresses compare
/// equal iff both the type and the bytes match.
#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct Address {
    address_type: AddressType,
    // Stored in little-endian wire order.
    bytes: [u8; 6],
}

impl Address {
    pub fn new(address_type: AddressType, bytes: [u8; 6]) -> Address {
        Address { address_type, bytes }
    }

    pub fn bredr(bytes: [u8; 6]) -> Address {
        Address::new(AddressType::BrEdr, bytes)
    }

    pub fn le_public(bytes: [u8; 6]) -> Address {
        Address::new(AddressType::LePublic, bytes)
    }

    pub fn le_random(bytes: [u8; 6]) -> Address {
        Address::new(AddressType::LeRandom, bytes)
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn bytes(&self) -> &[u8; 6] {
        &self.bytes
    }

    pub fn is_bredr(&self) -> bool {
        self.address_type == AddressType::BrEdr
    }

    pub fn is_le(&self) -> bool {
        self.address_type.is_le()
    }

    /// Returns the same address retagged with another type. Used when a
    /// dual-mode peer is reached over the other transport.
    pub fn with_type(&self, address_type: AddressType) -> Address {
        Address { address_type, bytes: self.bytes }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Most-significant byte first, as addresses are conventionally
        // printed.
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} ({:?})",
            b[5], b[4], b[3], b[2], b[1], b[0], self.address_type
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Opaque stable identifier for a peer, minted by the peer cache. A
/// `PeerId` maps to exactly one peer record for the record's lifetime.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Mints a new random identifier.
    pub fn random() -> PeerId {
        PeerId(rand::thread_rng().gen())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The transport technologies a peer has been observed on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Technology {
    Classic,
    LowEnergy,
    DualMode,
}

impl Technology {
    /// Merges an additional observation into the current value.
    pub fn merge(self, other: Technology) -> Technology {
        if self == other {
            self
        } else {
            Technology::DualMode
        }
    }
}

/// A Bluetooth UUID. Shortened 16- and 32-bit forms are expanded against
/// the Bluetooth base UUID so that all comparisons are 128-bit.
#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct Uuid([u8; 16]);

/// Bytes 4..16 of every UUID derived from the Bluetooth base UUID
/// 00000000-0000-1000-8000-00805F9B34FB, big-endian.
const BASE_UUID_TAIL: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

impl Uuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Uuid {
        Uuid(bytes)
    }

    pub fn from_u16(short: u16) -> Uuid {
        Uuid::from_u32(u32::from(short))
    }

    pub fn from_u32(short: u32) -> Uuid {
        let mut bytes = [0; 16];
        bytes[0..4].copy_from_slice(&short.to_be_bytes());
        bytes[4..16].copy_from_slice(&BASE_UUID_TAIL);
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the shortened 16-bit form if this UUID is derived from the
    /// base UUID and fits.
    pub fn to_u16(&self) -> Option<u16> {
        if self.0[4..16] == BASE_UUID_TAIL && self.0[0] == 0 && self.0[1] == 0 {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }

    /// Parses a UUID from its little-endian wire representation, as
    /// carried in EIR and advertising data sections.
    pub fn from_le_bytes(bytes: [u8; 16]) -> Uuid {
        let mut be = bytes;
        be.reverse();
        Uuid(be)
    }
}

impl From<u16> for Uuid {
    fn from(short: u16) -> Uuid {
        Uuid::from_u16(short)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-\
             {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Class of Device reported in inquiry results, 3 bytes on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceClass(pub [u8; 3]);
