// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing and building of Extended Inquiry Response and LE advertising
//! data. Both carry the same `[length][type][payload]` section format
//! (Core Spec Supplement, Part A), so one parser serves inquiry
//! results, advertisements, and scan responses.

use std::convert::TryInto;

use crate::types::Uuid;

pub const SECTION_FLAGS: u8 = 0x01;
pub const SECTION_INCOMPLETE_16BIT_UUIDS: u8 = 0x02;
pub const SECTION_COMPLETE_16BIT_UUIDS: u8 = 0x03;
pub const SECTION_INCOMPLETE_32BIT_UUIDS: u8 = 0x04;
pub const SECTION_COMPLETE_32BIT_UUIDS: u8 = 0x05;
pub const SECTION_INCOMPLETE_128BIT_UUIDS: u8 = 0x06;
pub const SECTION_COMPLETE_128BIT_UUIDS: u8 = 0x07;
pub const SECTION_SHORTENED_NAME: u8 = 0x08;
pub const SECTION_COMPLETE_NAME: u8 = 0x09;
pub const SECTION_TX_POWER: u8 = 0x0A;

/// The recognized contents of an EIR block or advertising payload.
/// Unknown sections are skipped by length; a zero length byte ends the
/// block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataSections {
    pub flags: Option<u8>,
    pub service_uuids: Vec<Uuid>,
    pub name: Option<String>,
    pub name_complete: bool,
    pub tx_power: Option<i8>,
}

/// Parses an EIR or advertising data block. Tolerant by design:
/// truncated trailing sections are dropped rather than failing the
/// whole block.
pub fn parse(bytes: &[u8]) -> DataSections {
    let mut sections = DataSections::default();
    let mut at = 0;
    while at < bytes.len() {
        let length = usize::from(bytes[at]);
        if length == 0 {
            break;
        }
        let body = match bytes.get(at + 1..at + 1 + length) {
            Some(body) => body,
            None => break,
        };
        let (section_type, data) = (body[0], &body[1..]);
        match section_type {
            SECTION_FLAGS => {
                sections.flags = data.first().copied();
            }
            SECTION_INCOMPLETE_16BIT_UUIDS | SECTION_COMPLETE_16BIT_UUIDS => {
                for chunk in data.chunks_exact(2) {
                    sections
                        .service_uuids
                        .push(Uuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            SECTION_INCOMPLETE_32BIT_UUIDS | SECTION_COMPLETE_32BIT_UUIDS => {
                for chunk in data.chunks_exact(4) {
                    let value = u32::from_le_bytes(chunk.try_into().expect("chunk of 4"));
                    sections.service_uuids.push(Uuid::from_u32(value));
                }
            }
            SECTION_INCOMPLETE_128BIT_UUIDS | SECTION_COMPLETE_128BIT_UUIDS => {
                for chunk in data.chunks_exact(16) {
                    let bytes: [u8; 16] = chunk.try_into().expect("chunk of 16");
                    sections.service_uuids.push(Uuid::from_le_bytes(bytes));
                }
            }
            SECTION_SHORTENED_NAME => {
                if sections.name.is_none() {
                    sections.name = Some(String::from_utf8_lossy(data).into_owned());
                    sections.name_complete = false;
                }
            }
            SECTION_COMPLETE_NAME => {
                sections.name = Some(String::from_utf8_lossy(data).into_owned());
                sections.name_complete = true;
            }
            SECTION_TX_POWER => {
                sections.tx_power = data.first().map(|&b| b as i8);
            }
            _ => {}
        }
        at += 1 + length;
    }
    sections
}

/// Builds a complete-local-name section for an outgoing EIR block.
pub fn build_name_section(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.push((bytes.len() + 1) as u8);
    out.push(SECTION_COMPLETE_NAME);
    out.extend_from_slice(bytes);
    out
}
