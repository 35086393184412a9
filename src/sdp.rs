// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Service Discovery Protocol wire format: Data Element encoding and
//! the ServiceSearchAttribute transaction PDUs. All multi-byte SDP
//! values are big-endian, unlike HCI.

use std::collections::HashMap;
use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::hci::{Decodable, Encodable};
use crate::types::Uuid;

/// The ServiceClassIDList attribute.
pub const ATTR_SERVICE_CLASS_ID_LIST: u16 = 0x0001;
/// The ServiceID attribute.
pub const ATTR_SERVICE_ID: u16 = 0x0003;
/// The ProtocolDescriptorList attribute.
pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
/// The BluetoothProfileDescriptorList attribute.
pub const ATTR_PROFILE_DESCRIPTOR_LIST: u16 = 0x0009;

const PDU_ERROR_RESPONSE: u8 = 0x01;
const PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST: u8 = 0x06;
const PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE: u8 = 0x07;

// Type descriptors (SDP 3.2).
const TYPE_NIL: u8 = 0;
const TYPE_UINT: u8 = 1;
const TYPE_UUID: u8 = 3;
const TYPE_STRING: u8 = 4;
const TYPE_BOOL: u8 = 5;
const TYPE_SEQUENCE: u8 = 6;
const TYPE_ALTERNATIVE: u8 = 7;

/// An SDP Data Element.
#[derive(Clone, Debug, PartialEq)]
pub enum DataElement {
    Nil,
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Uuid(Uuid),
    Str(String),
    Bool(bool),
    Sequence(Vec<DataElement>),
    Alternative(Vec<DataElement>),
}

impl DataElement {
    fn body_len(&self) -> usize {
        match self {
            DataElement::Nil => 0,
            DataElement::Uint8(_) | DataElement::Bool(_) => 1,
            DataElement::Uint16(_) => 2,
            DataElement::Uint32(_) => 4,
            DataElement::Uint64(_) => 8,
            DataElement::Uuid(uuid) => {
                if uuid.to_u16().is_some() {
                    2
                } else {
                    16
                }
            }
            DataElement::Str(s) => s.len(),
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                items.iter().map(|e| e.encoded_len()).sum()
            }
        }
    }

    fn header_len(&self) -> usize {
        match self {
            DataElement::Str(_) | DataElement::Sequence(_) | DataElement::Alternative(_) => {
                if self.body_len() < 0x100 {
                    2
                } else {
                    3
                }
            }
            _ => 1,
        }
    }

    /// Returns the UUIDs contained in this element, walking nested
    /// sequences. Used to lift service-class lists out of attribute
    /// values.
    pub fn uuids(&self) -> Vec<Uuid> {
        match self {
            DataElement::Uuid(uuid) => vec![*uuid],
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                items.iter().flat_map(|e| e.uuids()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl Encodable for DataElement {
    fn encoded_len(&self) -> usize {
        self.header_len() + self.body_len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.encoded_len() {
            return Err(Error::Failed("encode buffer too small"));
        }
        let body_len = self.body_len();
        let mut at = match self {
            DataElement::Nil => {
                buf[0] = TYPE_NIL << 3;
                1
            }
            DataElement::Uint8(_) => {
                buf[0] = TYPE_UINT << 3;
                1
            }
            DataElement::Uint16(_) => {
                buf[0] = TYPE_UINT << 3 | 1;
                1
            }
            DataElement::Uint32(_) => {
                buf[0] = TYPE_UINT << 3 | 2;
                1
            }
            DataElement::Uint64(_) => {
                buf[0] = TYPE_UINT << 3 | 3;
                1
            }
            DataElement::Uuid(uuid) => {
                buf[0] = TYPE_UUID << 3 | if uuid.to_u16().is_some() { 1 } else { 4 };
                1
            }
            DataElement::Bool(_) => {
                buf[0] = TYPE_BOOL << 3;
                1
            }
            DataElement::Str(_) | DataElement::Sequence(_) | DataElement::Alternative(_) => {
                let type_descriptor = match self {
                    DataElement::Str(_) => TYPE_STRING,
                    DataElement::Sequence(_) => TYPE_SEQUENCE,
                    _ => TYPE_ALTERNATIVE,
                };
                if body_len < 0x100 {
                    buf[0] = type_descriptor << 3 | 5;
                    buf[1] = body_len as u8;
                    2
                } else {
                    buf[0] = type_descriptor << 3 | 6;
                    buf[1..3].copy_from_slice(&(body_len as u16).to_be_bytes());
                    3
                }
            }
        };
        match self {
            DataElement::Nil => {}
            DataElement::Uint8(v) => buf[at] = *v,
            DataElement::Uint16(v) => buf[at..at + 2].copy_from_slice(&v.to_be_bytes()),
            DataElement::Uint32(v) => buf[at..at + 4].copy_from_slice(&v.to_be_bytes()),
            DataElement::Uint64(v) => buf[at..at + 8].copy_from_slice(&v.to_be_bytes()),
            DataElement::Uuid(uuid) => match uuid.to_u16() {
                Some(short) => buf[at..at + 2].copy_from_slice(&short.to_be_bytes()),
                None => buf[at..at + 16].copy_from_slice(uuid.as_bytes()),
            },
            DataElement::Str(s) => buf[at..at + s.len()].copy_from_slice(s.as_bytes()),
            DataElement::Bool(v) => buf[at] = *v as u8,
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                for item in items {
                    item.encode(&mut buf[at..])?;
                    at += item.encoded_len();
                }
            }
        }
        Ok(())
    }
}

impl DataElement {
    /// Decodes one element from the front of `buf`, returning it and
    /// the number of bytes consumed.
    fn decode_one(buf: &[u8]) -> Result<(DataElement, usize)> {
        let header = *buf.first().ok_or(Error::Malformed("empty data element"))?;
        let type_descriptor = header >> 3;
        let size_index = header & 0x07;

        let fixed_size = |index: u8| -> Result<usize> {
            Ok(match index {
                0 => 1,
                1 => 2,
                2 => 4,
                3 => 8,
                4 => 16,
                _ => return Err(Error::Malformed("variable size index on fixed-size type")),
            })
        };

        // Variable-length types carry their body length after the
        // header byte.
        let (body_start, body_len) = match size_index {
            5 => {
                let len = *buf.get(1).ok_or(Error::Malformed("data element length truncated"))?;
                (2, usize::from(len))
            }
            6 => {
                let bytes: [u8; 2] = buf
                    .get(1..3)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(Error::Malformed("data element length truncated"))?;
                (3, usize::from(u16::from_be_bytes(bytes)))
            }
            7 => {
                let bytes: [u8; 4] = buf
                    .get(1..5)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(Error::Malformed("data element length truncated"))?;
                (5, u32::from_be_bytes(bytes) as usize)
            }
            index => {
                if type_descriptor == TYPE_NIL {
                    (1, 0)
                } else {
                    (1, fixed_size(index)?)
                }
            }
        };
        let body = buf
            .get(body_start..body_start + body_len)
            .ok_or(Error::Malformed("data element body truncated"))?;
        let consumed = body_start + body_len;

        let element = match type_descriptor {
            TYPE_NIL => DataElement::Nil,
            TYPE_UINT => match body_len {
                1 => DataElement::Uint8(body[0]),
                2 => DataElement::Uint16(u16::from_be_bytes([body[0], body[1]])),
                4 => DataElement::Uint32(u32::from_be_bytes([
                    body[0], body[1], body[2], body[3],
                ])),
                8 => {
                    let mut bytes = [0; 8];
                    bytes.copy_from_slice(body);
                    DataElement::Uint64(u64::from_be_bytes(bytes))
                }
                _ => return Err(Error::Malformed("unsupported uint width")),
            },
            TYPE_UUID => match body_len {
                2 => DataElement::Uuid(Uuid::from_u16(u16::from_be_bytes([body[0], body[1]]))),
                4 => DataElement::Uuid(Uuid::from_u32(u32::from_be_bytes([
                    body[0], body[1], body[2], body[3],
                ]))),
                16 => {
                    let mut bytes = [0; 16];
                    bytes.copy_from_slice(body);
                    DataElement::Uuid(Uuid::from_bytes(bytes))
                }
                _ => return Err(Error::Malformed("unsupported uuid width")),
            },
            TYPE_STRING => DataElement::Str(
                String::from_utf8(body.to_vec())
                    .map_err(|_| Error::Malformed("non-utf8 sdp string"))?,
            ),
            TYPE_BOOL => DataElement::Bool(body[0] != 0),
            TYPE_SEQUENCE | TYPE_ALTERNATIVE => {
                let mut items = Vec::new();
                let mut at = 0;
                while at < body.len() {
                    let (item, used) = DataElement::decode_one(&body[at..])?;
                    items.push(item);
                    at += used;
                }
                if type_descriptor == TYPE_SEQUENCE {
                    DataElement::Sequence(items)
                } else {
                    DataElement::Alternative(items)
                }
            }
            _ => return Err(Error::Malformed("unsupported data element type")),
        };
        Ok((element, consumed))
    }
}

impl Decodable for DataElement {
    fn decode(buf: &[u8]) -> Result<DataElement> {
        let (element, consumed) = DataElement::decode_one(buf)?;
        if consumed != buf.len() {
            return Err(Error::Malformed("trailing bytes after data element"));
        }
        Ok(element)
    }
}

/// An attribute id or inclusive id range in an attribute request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttributeId {
    Single(u16),
    Range(u16, u16),
}

impl AttributeId {
    fn element(&self) -> DataElement {
        match self {
            AttributeId::Single(id) => DataElement::Uint16(*id),
            AttributeId::Range(start, end) => {
                DataElement::Uint32(u32::from(*start) << 16 | u32::from(*end))
            }
        }
    }
}

/// ServiceSearchAttributeRequest (SDP 4.7.1).
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSearchAttributeRequest {
    pub transaction_id: u16,
    pub service_search_pattern: Vec<Uuid>,
    pub max_attribute_byte_count: u16,
    pub attribute_ids: Vec<AttributeId>,
    pub continuation_state: Vec<u8>,
}

impl Encodable for ServiceSearchAttributeRequest {
    fn encoded_len(&self) -> usize {
        let pattern = DataElement::Sequence(
            self.service_search_pattern.iter().map(|u| DataElement::Uuid(*u)).collect(),
        );
        let ids =
            DataElement::Sequence(self.attribute_ids.iter().map(|a| a.element()).collect());
        5 + pattern.encoded_len() + 2 + ids.encoded_len() + 1 + self.continuation_state.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.encoded_len() {
            return Err(Error::Failed("encode buffer too small"));
        }
        let pattern = DataElement::Sequence(
            self.service_search_pattern.iter().map(|u| DataElement::Uuid(*u)).collect(),
        );
        let ids =
            DataElement::Sequence(self.attribute_ids.iter().map(|a| a.element()).collect());
        let param_len = self.encoded_len() - 5;

        buf[0] = PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST;
        buf[1..3].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[3..5].copy_from_slice(&(param_len as u16).to_be_bytes());
        let mut at = 5;
        pattern.encode(&mut buf[at..])?;
        at += pattern.encoded_len();
        buf[at..at + 2].copy_from_slice(&self.max_attribute_byte_count.to_be_bytes());
        at += 2;
        ids.encode(&mut buf[at..])?;
        at += ids.encoded_len();
        buf[at] = self.continuation_state.len() as u8;
        at += 1;
        buf[at..at + self.continuation_state.len()].copy_from_slice(&self.continuation_state);
        Ok(())
    }
}

/// ServiceSearchAttributeResponse (SDP 4.7.2). The attribute-lists
/// stream may be split across continuations; fragments accumulate in
/// the client until the continuation state comes back empty.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSearchAttributeResponse {
    pub transaction_id: u16,
    pub attribute_lists_fragment: Vec<u8>,
    pub continuation_state: Vec<u8>,
}

impl Decodable for ServiceSearchAttributeResponse {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(Error::Malformed("sdp pdu header truncated"));
        }
        let transaction_id = u16::from_be_bytes([buf[1], buf[2]]);
        match buf[0] {
            PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE => {}
            PDU_ERROR_RESPONSE => return Err(Error::LinkError),
            _ => return Err(Error::Malformed("unexpected sdp pdu id")),
        }
        let param_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
        let params =
            buf.get(5..5 + param_len).ok_or(Error::Malformed("sdp parameters truncated"))?;
        if params.len() < 3 {
            return Err(Error::Malformed("sdp response too short"));
        }
        let byte_count = usize::from(u16::from_be_bytes([params[0], params[1]]));
        let fragment = params
            .get(2..2 + byte_count)
            .ok_or(Error::Malformed("attribute lists truncated"))?;
        let continuation_len = usize::from(
            *params.get(2 + byte_count).ok_or(Error::Malformed("continuation truncated"))?,
        );
        let continuation = params
            .get(3 + byte_count..3 + byte_count + continuation_len)
            .ok_or(Error::Malformed("continuation truncated"))?;
        Ok(ServiceSearchAttributeResponse {
            transaction_id,
            attribute_lists_fragment: fragment.to_vec(),
            continuation_state: continuation.to_vec(),
        })
    }
}

/// Parses a complete attribute-lists stream into one attribute map per
/// returned service record.
pub fn parse_attribute_lists(bytes: &[u8]) -> Result<Vec<HashMap<u16, DataElement>>> {
    let outer = DataElement::decode(bytes)?;
    let records = match outer {
        DataElement::Sequence(records) => records,
        _ => return Err(Error::Malformed("attribute lists is not a sequence")),
    };
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let items = match record {
            DataElement::Sequence(items) => items,
            _ => return Err(Error::Malformed("attribute list is not a sequence")),
        };
        if items.len() % 2 != 0 {
            return Err(Error::Malformed("attribute list has dangling id"));
        }
        let mut map = HashMap::new();
        let mut iter = items.into_iter();
        while let (Some(id), Some(value)) = (iter.next(), iter.next()) {
            let id = match id {
                DataElement::Uint16(id) => id,
                _ => return Err(Error::Malformed("attribute id is not a u16")),
            };
            map.insert(id, value);
        }
        out.push(map);
    }
    Ok(out)
}

/// The service-class UUIDs of one attribute map, if present.
pub fn service_class_uuids(attributes: &HashMap<u16, DataElement>) -> Vec<Uuid> {
    attributes.get(&ATTR_SERVICE_CLASS_ID_LIST).map(|e| e.uuids()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn uuid_elements_use_shortest_form() {
        let short = DataElement::Uuid(Uuid::from_u16(0x110b));
        assert_eq!(short.encoded(), vec![0x19, 0x11, 0x0b]);

        let mut bytes = *Uuid::from_u16(0x110b).as_bytes();
        bytes[15] = 0x01;
        let long = DataElement::Uuid(Uuid::from_bytes(bytes));
        assert_eq!(long.encoded().len(), 17);
        assert_eq!(long.encoded()[0], 0x1C);
    }

    #[test]
    fn sequence_round_trip() {
        let element = DataElement::Sequence(vec![
            DataElement::Uint16(0x0001),
            DataElement::Sequence(vec![DataElement::Uuid(Uuid::from_u16(0x110b))]),
            DataElement::Str("Audio Sink".to_string()),
            DataElement::Bool(true),
            DataElement::Nil,
        ]);
        let encoded = element.encoded();
        assert_eq!(DataElement::decode(&encoded).expect("decodes"), element);
    }

    #[test]
    fn truncated_sequence_is_malformed() {
        let element = DataElement::Sequence(vec![DataElement::Uint32(7)]);
        let encoded = element.encoded();
        assert_matches!(
            DataElement::decode(&encoded[..encoded.len() - 1]),
            Err(Error::Malformed(_))
        );
    }

    #[test]
    fn request_wire_format() {
        let request = ServiceSearchAttributeRequest {
            transaction_id: 0x0102,
            service_search_pattern: vec![Uuid::from_u16(0x110b)],
            max_attribute_byte_count: 0xFFFF,
            attribute_ids: vec![AttributeId::Single(ATTR_SERVICE_CLASS_ID_LIST)],
            continuation_state: vec![],
        };
        let encoded = request.encoded();
        assert_eq!(encoded[0], PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST);
        assert_eq!(&encoded[1..3], &[0x01, 0x02]);
        // Parameter length covers everything after the header.
        let param_len = usize::from(u16::from_be_bytes([encoded[3], encoded[4]]));
        assert_eq!(param_len, encoded.len() - 5);
        // Pattern sequence: 0x35 0x03 0x19 0x11 0x0b.
        assert_eq!(&encoded[5..10], &[0x35, 0x03, 0x19, 0x11, 0x0b]);
        // Trailing continuation state is empty.
        assert_eq!(encoded[encoded.len() - 1], 0x00);
    }

    #[test]
    fn response_round_trip_with_continuation() {
        let lists = DataElement::Sequence(vec![DataElement::Sequence(vec![
            DataElement::Uint16(ATTR_SERVICE_CLASS_ID_LIST),
            DataElement::Sequence(vec![DataElement::Uuid(Uuid::from_u16(0x110b))]),
        ])]);
        let lists_bytes = lists.encoded();

        let mut params = Vec::new();
        params.extend_from_slice(&(lists_bytes.len() as u16).to_be_bytes());
        params.extend_from_slice(&lists_bytes);
        params.push(2);
        params.extend_from_slice(&[0xAB, 0xCD]);

        let mut pdu = vec![PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE, 0x00, 0x01];
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&params);

        let response = ServiceSearchAttributeResponse::decode(&pdu).expect("decodes");
        assert_eq!(response.transaction_id, 1);
        assert_eq!(response.continuation_state, vec![0xAB, 0xCD]);

        let maps = parse_attribute_lists(&response.attribute_lists_fragment).expect("parses");
        assert_eq!(maps.len(), 1);
        assert_eq!(
            service_class_uuids(&maps[0]),
            vec![Uuid::from_u16(0x110b)]
        );
    }

    #[test]
    fn error_response_pdu_is_a_link_error() {
        let pdu = vec![PDU_ERROR_RESPONSE, 0x00, 0x01, 0x00, 0x02, 0x00, 0x04];
        assert_matches!(
            ServiceSearchAttributeResponse::decode(&pdu),
            Err(Error::LinkError)
        );
    }

    #[test]
    fn attribute_range_encodes_as_u32() {
        let id = AttributeId::Range(0x0001, 0x0009);
        assert_eq!(id.element(), DataElement::Uint32(0x0001_0009));
    }
}
