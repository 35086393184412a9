// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HCI command/event plumbing shared by every subsystem.
//!
//! The wire surface is split into:
//! - [`constants`]: opcodes, event codes, status codes, and the small
//!   enums carried in command and event parameter blocks;
//! - [`command`]: encoders for the commands this crate issues;
//! - [`event`]: the event packet parser and typed parameter views;
//! - [`command_channel`]: the per-component command runner that
//!   serializes sends, routes completions, and enforces inquiry
//!   exclusivity.

pub mod command;
pub mod command_channel;
pub mod constants;
pub mod event;

pub use command::CommandPacket;
pub use command_channel::{
    CommandCallback, CommandChannel, CommandRunner, EventHandlerId, Exclusions, Transport,
};
pub use constants::{
    AuthRequirements, EncryptionStatus, EventCode, IoCapability, LinkKeyType, LinkType, Opcode,
    Role, ScanEnableBits, StatusCode,
};
pub use event::EventPacket;

use std::convert::TryInto;

use crate::error::{Error, Result};

/// A type that can be serialized into a wire parameter block.
pub trait Encodable {
    /// The exact number of bytes `encode` will write.
    fn encoded_len(&self) -> usize;

    /// Serializes into the front of `buf`. Fails with
    /// [`Error::Failed`] if `buf` is too small.
    fn encode(&self, buf: &mut [u8]) -> Result<()>;

    /// Serializes into a freshly allocated buffer.
    fn encoded(&self) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_len()];
        // encoded_len() sized the buffer; encode cannot fail.
        let _ = self.encode(&mut buf);
        buf
    }
}

/// A type that can be parsed from a wire parameter block.
pub trait Decodable: Sized {
    /// Parses from `buf`, which must contain the complete parameter
    /// block. Fails with [`Error::Malformed`] on short or inconsistent
    /// input.
    fn decode(buf: &[u8]) -> Result<Self>;
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    let bytes: [u8; 2] = buf
        .get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Malformed("short read for u16 field"))?;
    Ok(u16::from_le_bytes(bytes))
}

pub(crate) fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Malformed("short read for fixed-size field"))
}
