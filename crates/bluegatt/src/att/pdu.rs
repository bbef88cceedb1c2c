//! ATT PDU codec
//!
//! One struct per opcode with wire parsing and serialisation, plus the
//! tagged [`AttPdu`] value used by the reader loop and request pipeline.
//! All multi-byte fields are little-endian. Unknown opcodes are retained
//! as opaque [`AttPdu::Undefined`] blobs so higher layers can log and drop
//! them.
use super::constants::*;
use super::error::AttErrorCode;
use crate::uuid::Uuid;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Instant;

/// Parser failure: a received frame is shorter than its declared layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed ATT PDU")]
pub struct MalformedPdu;

/// Codec result type.
pub type CodecResult<T> = Result<T, MalformedPdu>;

/// Derived opcode classification used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Request,
    Response,
    Command,
    Notification,
    Indication,
    Confirmation,
    Undefined,
}

/// Classifies a raw opcode byte.
pub fn pdu_type_of(opcode: u8) -> PduType {
    match opcode {
        ATT_EXCHANGE_MTU_REQ
        | ATT_FIND_INFO_REQ
        | ATT_FIND_BY_TYPE_VALUE_REQ
        | ATT_READ_BY_TYPE_REQ
        | ATT_READ_REQ
        | ATT_READ_BLOB_REQ
        | ATT_READ_MULTIPLE_REQ
        | ATT_READ_BY_GROUP_TYPE_REQ
        | ATT_WRITE_REQ
        | ATT_PREPARE_WRITE_REQ
        | ATT_EXECUTE_WRITE_REQ
        | ATT_READ_MULTIPLE_VARIABLE_REQ => PduType::Request,
        ATT_ERROR_RSP
        | ATT_EXCHANGE_MTU_RSP
        | ATT_FIND_INFO_RSP
        | ATT_FIND_BY_TYPE_VALUE_RSP
        | ATT_READ_BY_TYPE_RSP
        | ATT_READ_RSP
        | ATT_READ_BLOB_RSP
        | ATT_READ_MULTIPLE_RSP
        | ATT_READ_BY_GROUP_TYPE_RSP
        | ATT_WRITE_RSP
        | ATT_PREPARE_WRITE_RSP
        | ATT_EXECUTE_WRITE_RSP
        | ATT_READ_MULTIPLE_VARIABLE_RSP => PduType::Response,
        ATT_WRITE_CMD | ATT_SIGNED_WRITE_CMD => PduType::Command,
        ATT_HANDLE_VALUE_NTF | ATT_MULTIPLE_HANDLE_VALUE_NTF => PduType::Notification,
        ATT_HANDLE_VALUE_IND => PduType::Indication,
        ATT_HANDLE_VALUE_CFM => PduType::Confirmation,
        _ => PduType::Undefined,
    }
}

/// Human-readable opcode name for log lines.
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        ATT_ERROR_RSP => "ERROR_RSP",
        ATT_EXCHANGE_MTU_REQ => "EXCHANGE_MTU_REQ",
        ATT_EXCHANGE_MTU_RSP => "EXCHANGE_MTU_RSP",
        ATT_FIND_INFO_REQ => "FIND_INFORMATION_REQ",
        ATT_FIND_INFO_RSP => "FIND_INFORMATION_RSP",
        ATT_FIND_BY_TYPE_VALUE_REQ => "FIND_BY_TYPE_VALUE_REQ",
        ATT_FIND_BY_TYPE_VALUE_RSP => "FIND_BY_TYPE_VALUE_RSP",
        ATT_READ_BY_TYPE_REQ => "READ_BY_TYPE_REQ",
        ATT_READ_BY_TYPE_RSP => "READ_BY_TYPE_RSP",
        ATT_READ_REQ => "READ_REQ",
        ATT_READ_RSP => "READ_RSP",
        ATT_READ_BLOB_REQ => "READ_BLOB_REQ",
        ATT_READ_BLOB_RSP => "READ_BLOB_RSP",
        ATT_READ_MULTIPLE_REQ => "READ_MULTIPLE_REQ",
        ATT_READ_MULTIPLE_RSP => "READ_MULTIPLE_RSP",
        ATT_READ_BY_GROUP_TYPE_REQ => "READ_BY_GROUP_TYPE_REQ",
        ATT_READ_BY_GROUP_TYPE_RSP => "READ_BY_GROUP_TYPE_RSP",
        ATT_WRITE_REQ => "WRITE_REQ",
        ATT_WRITE_RSP => "WRITE_RSP",
        ATT_WRITE_CMD => "WRITE_CMD",
        ATT_PREPARE_WRITE_REQ => "PREPARE_WRITE_REQ",
        ATT_PREPARE_WRITE_RSP => "PREPARE_WRITE_RSP",
        ATT_EXECUTE_WRITE_REQ => "EXECUTE_WRITE_REQ",
        ATT_EXECUTE_WRITE_RSP => "EXECUTE_WRITE_RSP",
        ATT_HANDLE_VALUE_NTF => "HANDLE_VALUE_NTF",
        ATT_HANDLE_VALUE_IND => "HANDLE_VALUE_IND",
        ATT_HANDLE_VALUE_CFM => "HANDLE_VALUE_CFM",
        ATT_SIGNED_WRITE_CMD => "SIGNED_WRITE_CMD",
        ATT_READ_MULTIPLE_VARIABLE_REQ => "READ_MULTIPLE_VARIABLE_REQ",
        ATT_READ_MULTIPLE_VARIABLE_RSP => "READ_MULTIPLE_VARIABLE_RSP",
        ATT_MULTIPLE_HANDLE_VALUE_NTF => "MULTIPLE_HANDLE_VALUE_NTF",
        _ => "PDU_UNDEFINED",
    }
}

/// ATT packet wire format.
pub trait AttPacket: Sized {
    /// Opcode of this packet type
    fn opcode() -> u8;

    /// Parse the packet from a full frame including the opcode byte
    fn parse(data: &[u8]) -> CodecResult<Self>;

    /// Serialize the packet to its full wire form
    fn serialize(&self) -> Vec<u8>;
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> CodecResult<u16> {
    cursor.read_u16::<LittleEndian>().map_err(|_| MalformedPdu)
}

/// Error response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Opcode of the failed request
    pub request_opcode: u8,
    /// Offending handle, 0 when not applicable
    pub handle: u16,
    /// Error code
    pub error_code: AttErrorCode,
}

impl AttPacket for ErrorResponse {
    fn opcode() -> u8 {
        ATT_ERROR_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 5 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let request_opcode = data[1];
        let mut cursor = Cursor::new(&data[2..]);
        let handle = read_u16(&mut cursor)?;
        let error_code = data[4].into();
        Ok(Self {
            request_opcode,
            handle,
            error_code,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.push(self.request_opcode);
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.push(self.error_code.into());
        packet
    }
}

/// Exchange MTU request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuRequest {
    /// Client Rx MTU
    pub client_mtu: u16,
}

impl AttPacket for ExchangeMtuRequest {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            client_mtu: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.client_mtu.to_le_bytes());
        packet
    }
}

/// Exchange MTU response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuResponse {
    /// Server Rx MTU
    pub server_mtu: u16,
}

impl AttPacket for ExchangeMtuResponse {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            server_mtu: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.server_mtu.to_le_bytes());
        packet
    }
}

/// Find Information request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationRequest {
    pub start_handle: u16,
    pub end_handle: u16,
}

impl AttPacket for FindInformationRequest {
    fn opcode() -> u8 {
        ATT_FIND_INFO_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 5 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            start_handle: read_u16(&mut cursor)?,
            end_handle: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        packet
    }
}

/// Find Information response: `(handle, uuid)` pairs of one fixed width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationResponse {
    /// Pair format, `ATT_FIND_INFO_FORMAT_16BIT` or `..._128BIT`
    pub format: u8,
    /// Descriptor handle/type pairs
    pub entries: Vec<(u16, Uuid)>,
}

impl FindInformationResponse {
    /// Builds a response, deriving the format from the first entry's width.
    /// All entries must share that width; the server batches accordingly.
    pub fn from_entries(entries: Vec<(u16, Uuid)>) -> Self {
        let format = match entries.first() {
            Some((_, uuid)) if uuid.att_size() == 2 => ATT_FIND_INFO_FORMAT_16BIT,
            _ => ATT_FIND_INFO_FORMAT_128BIT,
        };
        Self { format, entries }
    }

    /// Wire size of one `(handle, uuid)` pair for this format.
    pub fn entry_size(&self) -> usize {
        if self.format == ATT_FIND_INFO_FORMAT_16BIT {
            4
        } else {
            18
        }
    }
}

impl AttPacket for FindInformationResponse {
    fn opcode() -> u8 {
        ATT_FIND_INFO_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 2 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let format = data[1];
        let uuid_size = match format {
            ATT_FIND_INFO_FORMAT_16BIT => 2usize,
            ATT_FIND_INFO_FORMAT_128BIT => 16usize,
            _ => return Err(MalformedPdu),
        };
        let pair_size = 2 + uuid_size;
        let body = &data[2..];
        if body.is_empty() || body.len() % pair_size != 0 {
            return Err(MalformedPdu);
        }
        let mut entries = Vec::with_capacity(body.len() / pair_size);
        for pair in body.chunks_exact(pair_size) {
            let handle = u16::from_le_bytes([pair[0], pair[1]]);
            let uuid = Uuid::try_from_slice_le(&pair[2..]).ok_or(MalformedPdu)?;
            entries.push((handle, uuid));
        }
        Ok(Self { format, entries })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(2 + self.entries.len() * self.entry_size());
        packet.push(Self::opcode());
        packet.push(self.format);
        for (handle, uuid) in &self.entries {
            packet.extend_from_slice(&handle.to_le_bytes());
            if self.format == ATT_FIND_INFO_FORMAT_16BIT {
                // builder guarantees a short form exists for this format
                packet.extend_from_slice(&uuid.as_u16().unwrap_or(0).to_le_bytes());
            } else {
                packet.extend_from_slice(uuid.as_bytes_le());
            }
        }
        packet
    }
}

/// Find By Type Value request (attribute type is always a 16-bit UUID)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: u16,
    pub attribute_value: Vec<u8>,
}

impl AttPacket for FindByTypeValueRequest {
    fn opcode() -> u8 {
        ATT_FIND_BY_TYPE_VALUE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 7 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            start_handle: read_u16(&mut cursor)?,
            end_handle: read_u16(&mut cursor)?,
            attribute_type: read_u16(&mut cursor)?,
            attribute_value: data[7..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(7 + self.attribute_value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        packet.extend_from_slice(&self.attribute_type.to_le_bytes());
        packet.extend_from_slice(&self.attribute_value);
        packet
    }
}

/// Find By Type Value response: `(found_handle, group_end_handle)` ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueResponse {
    pub handles: Vec<(u16, u16)>,
}

impl AttPacket for FindByTypeValueResponse {
    fn opcode() -> u8 {
        ATT_FIND_BY_TYPE_VALUE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let body = &data[1..];
        if body.is_empty() || body.len() % 4 != 0 {
            return Err(MalformedPdu);
        }
        let handles = body
            .chunks_exact(4)
            .map(|c| {
                (
                    u16::from_le_bytes([c[0], c[1]]),
                    u16::from_le_bytes([c[2], c[3]]),
                )
            })
            .collect();
        Ok(Self { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.handles.len() * 4);
        packet.push(Self::opcode());
        for (found, end) in &self.handles {
            packet.extend_from_slice(&found.to_le_bytes());
            packet.extend_from_slice(&end.to_le_bytes());
        }
        packet
    }
}

/// Read By Type request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: Uuid,
}

impl AttPacket for ReadByTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if !(data.len() == 7 || data.len() == 21) || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        let start_handle = read_u16(&mut cursor)?;
        let end_handle = read_u16(&mut cursor)?;
        let attribute_type = Uuid::try_from_slice_le(&data[5..]).ok_or(MalformedPdu)?;
        Ok(Self {
            start_handle,
            end_handle,
            attribute_type,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + self.attribute_type.att_size());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        self.attribute_type.put_att(&mut packet);
        packet
    }
}

/// Read By Type response element: attribute handle plus its value bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Read By Type response: fixed-size `(handle, value)` elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeResponse {
    /// Wire size of one element: 2 handle bytes plus the value
    pub element_len: u8,
    pub elements: Vec<HandleValue>,
}

impl AttPacket for ReadByTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 2 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let element_len = data[1];
        if element_len < 3 {
            return Err(MalformedPdu);
        }
        let body = &data[2..];
        if body.is_empty() || body.len() % element_len as usize != 0 {
            return Err(MalformedPdu);
        }
        let elements = body
            .chunks_exact(element_len as usize)
            .map(|c| HandleValue {
                handle: u16::from_le_bytes([c[0], c[1]]),
                value: c[2..].to_vec(),
            })
            .collect();
        Ok(Self {
            element_len,
            elements,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(2 + self.elements.len() * self.element_len as usize);
        packet.push(Self::opcode());
        packet.push(self.element_len);
        for e in &self.elements {
            packet.extend_from_slice(&e.handle.to_le_bytes());
            packet.extend_from_slice(&e.value);
        }
        packet
    }
}

/// Read request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle: u16,
}

impl AttPacket for ReadRequest {
    fn opcode() -> u8 {
        ATT_READ_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet
    }
}

/// Read response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub value: Vec<u8>,
}

impl AttPacket for ReadResponse {
    fn opcode() -> u8 {
        ATT_READ_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Read Blob request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobRequest {
    pub handle: u16,
    pub offset: u16,
}

impl AttPacket for ReadBlobRequest {
    fn opcode() -> u8 {
        ATT_READ_BLOB_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 5 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            offset: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet
    }
}

/// Read Blob response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobResponse {
    pub value: Vec<u8>,
}

impl AttPacket for ReadBlobResponse {
    fn opcode() -> u8 {
        ATT_READ_BLOB_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Read Multiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleRequest {
    pub handles: Vec<u16>,
}

impl AttPacket for ReadMultipleRequest {
    fn opcode() -> u8 {
        ATT_READ_MULTIPLE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        // the Core Spec requires at least two handles
        if data.len() < 5 || data[0] != Self::opcode() || (data.len() - 1) % 2 != 0 {
            return Err(MalformedPdu);
        }
        let handles = data[1..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.handles.len() * 2);
        packet.push(Self::opcode());
        for handle in &self.handles {
            packet.extend_from_slice(&handle.to_le_bytes());
        }
        packet
    }
}

/// Read Multiple response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleResponse {
    pub values: Vec<u8>,
}

impl AttPacket for ReadMultipleResponse {
    fn opcode() -> u8 {
        ATT_READ_MULTIPLE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self {
            values: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.values.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.values);
        packet
    }
}

/// Read By Group Type request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub group_type: Uuid,
}

impl AttPacket for ReadByGroupTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if !(data.len() == 7 || data.len() == 21) || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        let start_handle = read_u16(&mut cursor)?;
        let end_handle = read_u16(&mut cursor)?;
        let group_type = Uuid::try_from_slice_le(&data[5..]).ok_or(MalformedPdu)?;
        Ok(Self {
            start_handle,
            end_handle,
            group_type,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + self.group_type.att_size());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        self.group_type.put_att(&mut packet);
        packet
    }
}

/// Read By Group Type response element: group range plus its value bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupElement {
    pub handle: u16,
    pub end_group_handle: u16,
    pub value: Vec<u8>,
}

/// Read By Group Type response: fixed-size group elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeResponse {
    /// Wire size of one element: 4 handle bytes plus the value
    pub element_len: u8,
    pub elements: Vec<GroupElement>,
}

impl AttPacket for ReadByGroupTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 2 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let element_len = data[1];
        if element_len < 6 {
            return Err(MalformedPdu);
        }
        let body = &data[2..];
        if body.is_empty() || body.len() % element_len as usize != 0 {
            return Err(MalformedPdu);
        }
        let elements = body
            .chunks_exact(element_len as usize)
            .map(|c| GroupElement {
                handle: u16::from_le_bytes([c[0], c[1]]),
                end_group_handle: u16::from_le_bytes([c[2], c[3]]),
                value: c[4..].to_vec(),
            })
            .collect();
        Ok(Self {
            element_len,
            elements,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(2 + self.elements.len() * self.element_len as usize);
        packet.push(Self::opcode());
        packet.push(self.element_len);
        for e in &self.elements {
            packet.extend_from_slice(&e.handle.to_le_bytes());
            packet.extend_from_slice(&e.end_group_handle.to_le_bytes());
            packet.extend_from_slice(&e.value);
        }
        packet
    }
}

/// Write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteRequest {
    fn opcode() -> u8 {
        ATT_WRITE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Write response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse;

impl AttPacket for WriteResponse {
    fn opcode() -> u8 {
        ATT_WRITE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}

/// Write command, never acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteCommand {
    fn opcode() -> u8 {
        ATT_WRITE_CMD
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Prepare Write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteRequest {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl AttPacket for PrepareWriteRequest {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 5 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            offset: read_u16(&mut cursor)?,
            value: data[5..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Prepare Write response, echoing the staged fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteResponse {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl AttPacket for PrepareWriteResponse {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 5 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            offset: read_u16(&mut cursor)?,
            value: data[5..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Execute Write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteRequest {
    /// `ATT_EXEC_WRITE_CANCEL` or `ATT_EXEC_WRITE_COMMIT`
    pub flags: u8,
}

impl AttPacket for ExecuteWriteRequest {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 2 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self { flags: data[1] })
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode(), self.flags]
    }
}

/// Execute Write response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteResponse;

impl AttPacket for ExecuteWriteResponse {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}

/// Handle Value notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueNotification {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueNotification {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_NTF
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Handle Value indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueIndication {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueIndication {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_IND
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 3 || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        let mut cursor = Cursor::new(&data[1..]);
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Handle Value confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueConfirmation;

impl AttPacket for HandleValueConfirmation {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_CFM
    }

    fn parse(data: &[u8]) -> CodecResult<Self> {
        if data.is_empty() || data[0] != Self::opcode() {
            return Err(MalformedPdu);
        }
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}

/// A parsed ATT PDU, tagged by opcode.
///
/// `SignedWrite` and `Undefined` keep the raw frame: the former is out of
/// scope but must be recognised for the `UNSUPPORTED_REQUEST` reply, the
/// latter lets the reader log and discard unknown opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    Error(ErrorResponse),
    ExchangeMtuReq(ExchangeMtuRequest),
    ExchangeMtuRsp(ExchangeMtuResponse),
    FindInformationReq(FindInformationRequest),
    FindInformationRsp(FindInformationResponse),
    FindByTypeValueReq(FindByTypeValueRequest),
    FindByTypeValueRsp(FindByTypeValueResponse),
    ReadByTypeReq(ReadByTypeRequest),
    ReadByTypeRsp(ReadByTypeResponse),
    ReadReq(ReadRequest),
    ReadRsp(ReadResponse),
    ReadBlobReq(ReadBlobRequest),
    ReadBlobRsp(ReadBlobResponse),
    ReadMultipleReq(ReadMultipleRequest),
    ReadMultipleRsp(ReadMultipleResponse),
    ReadByGroupTypeReq(ReadByGroupTypeRequest),
    ReadByGroupTypeRsp(ReadByGroupTypeResponse),
    WriteReq(WriteRequest),
    WriteRsp(WriteResponse),
    WriteCmd(WriteCommand),
    PrepareWriteReq(PrepareWriteRequest),
    PrepareWriteRsp(PrepareWriteResponse),
    ExecuteWriteReq(ExecuteWriteRequest),
    ExecuteWriteRsp(ExecuteWriteResponse),
    ValueNtf(HandleValueNotification),
    ValueInd(HandleValueIndication),
    ValueCfm(HandleValueConfirmation),
    SignedWrite(Vec<u8>),
    Undefined(Vec<u8>),
}

impl AttPdu {
    /// Parses one received frame into a tagged PDU. Unknown opcodes are
    /// retained as [`AttPdu::Undefined`]; an empty frame is malformed.
    pub fn parse(data: &[u8]) -> CodecResult<AttPdu> {
        let opcode = *data.first().ok_or(MalformedPdu)?;
        Ok(match opcode {
            ATT_ERROR_RSP => AttPdu::Error(ErrorResponse::parse(data)?),
            ATT_EXCHANGE_MTU_REQ => AttPdu::ExchangeMtuReq(ExchangeMtuRequest::parse(data)?),
            ATT_EXCHANGE_MTU_RSP => AttPdu::ExchangeMtuRsp(ExchangeMtuResponse::parse(data)?),
            ATT_FIND_INFO_REQ => AttPdu::FindInformationReq(FindInformationRequest::parse(data)?),
            ATT_FIND_INFO_RSP => AttPdu::FindInformationRsp(FindInformationResponse::parse(data)?),
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                AttPdu::FindByTypeValueReq(FindByTypeValueRequest::parse(data)?)
            }
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                AttPdu::FindByTypeValueRsp(FindByTypeValueResponse::parse(data)?)
            }
            ATT_READ_BY_TYPE_REQ => AttPdu::ReadByTypeReq(ReadByTypeRequest::parse(data)?),
            ATT_READ_BY_TYPE_RSP => AttPdu::ReadByTypeRsp(ReadByTypeResponse::parse(data)?),
            ATT_READ_REQ => AttPdu::ReadReq(ReadRequest::parse(data)?),
            ATT_READ_RSP => AttPdu::ReadRsp(ReadResponse::parse(data)?),
            ATT_READ_BLOB_REQ => AttPdu::ReadBlobReq(ReadBlobRequest::parse(data)?),
            ATT_READ_BLOB_RSP => AttPdu::ReadBlobRsp(ReadBlobResponse::parse(data)?),
            ATT_READ_MULTIPLE_REQ => AttPdu::ReadMultipleReq(ReadMultipleRequest::parse(data)?),
            ATT_READ_MULTIPLE_RSP => AttPdu::ReadMultipleRsp(ReadMultipleResponse::parse(data)?),
            ATT_READ_BY_GROUP_TYPE_REQ => {
                AttPdu::ReadByGroupTypeReq(ReadByGroupTypeRequest::parse(data)?)
            }
            ATT_READ_BY_GROUP_TYPE_RSP => {
                AttPdu::ReadByGroupTypeRsp(ReadByGroupTypeResponse::parse(data)?)
            }
            ATT_WRITE_REQ => AttPdu::WriteReq(WriteRequest::parse(data)?),
            ATT_WRITE_RSP => AttPdu::WriteRsp(WriteResponse::parse(data)?),
            ATT_WRITE_CMD => AttPdu::WriteCmd(WriteCommand::parse(data)?),
            ATT_PREPARE_WRITE_REQ => AttPdu::PrepareWriteReq(PrepareWriteRequest::parse(data)?),
            ATT_PREPARE_WRITE_RSP => AttPdu::PrepareWriteRsp(PrepareWriteResponse::parse(data)?),
            ATT_EXECUTE_WRITE_REQ => AttPdu::ExecuteWriteReq(ExecuteWriteRequest::parse(data)?),
            ATT_EXECUTE_WRITE_RSP => AttPdu::ExecuteWriteRsp(ExecuteWriteResponse::parse(data)?),
            ATT_HANDLE_VALUE_NTF => AttPdu::ValueNtf(HandleValueNotification::parse(data)?),
            ATT_HANDLE_VALUE_IND => AttPdu::ValueInd(HandleValueIndication::parse(data)?),
            ATT_HANDLE_VALUE_CFM => AttPdu::ValueCfm(HandleValueConfirmation::parse(data)?),
            ATT_SIGNED_WRITE_CMD => AttPdu::SignedWrite(data.to_vec()),
            _ => AttPdu::Undefined(data.to_vec()),
        })
    }

    /// The wire form of this PDU.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            AttPdu::Error(p) => p.serialize(),
            AttPdu::ExchangeMtuReq(p) => p.serialize(),
            AttPdu::ExchangeMtuRsp(p) => p.serialize(),
            AttPdu::FindInformationReq(p) => p.serialize(),
            AttPdu::FindInformationRsp(p) => p.serialize(),
            AttPdu::FindByTypeValueReq(p) => p.serialize(),
            AttPdu::FindByTypeValueRsp(p) => p.serialize(),
            AttPdu::ReadByTypeReq(p) => p.serialize(),
            AttPdu::ReadByTypeRsp(p) => p.serialize(),
            AttPdu::ReadReq(p) => p.serialize(),
            AttPdu::ReadRsp(p) => p.serialize(),
            AttPdu::ReadBlobReq(p) => p.serialize(),
            AttPdu::ReadBlobRsp(p) => p.serialize(),
            AttPdu::ReadMultipleReq(p) => p.serialize(),
            AttPdu::ReadMultipleRsp(p) => p.serialize(),
            AttPdu::ReadByGroupTypeReq(p) => p.serialize(),
            AttPdu::ReadByGroupTypeRsp(p) => p.serialize(),
            AttPdu::WriteReq(p) => p.serialize(),
            AttPdu::WriteRsp(p) => p.serialize(),
            AttPdu::WriteCmd(p) => p.serialize(),
            AttPdu::PrepareWriteReq(p) => p.serialize(),
            AttPdu::PrepareWriteRsp(p) => p.serialize(),
            AttPdu::ExecuteWriteReq(p) => p.serialize(),
            AttPdu::ExecuteWriteRsp(p) => p.serialize(),
            AttPdu::ValueNtf(p) => p.serialize(),
            AttPdu::ValueInd(p) => p.serialize(),
            AttPdu::ValueCfm(p) => p.serialize(),
            AttPdu::SignedWrite(raw) | AttPdu::Undefined(raw) => raw.clone(),
        }
    }

    /// The raw opcode byte.
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::Error(_) => ATT_ERROR_RSP,
            AttPdu::ExchangeMtuReq(_) => ATT_EXCHANGE_MTU_REQ,
            AttPdu::ExchangeMtuRsp(_) => ATT_EXCHANGE_MTU_RSP,
            AttPdu::FindInformationReq(_) => ATT_FIND_INFO_REQ,
            AttPdu::FindInformationRsp(_) => ATT_FIND_INFO_RSP,
            AttPdu::FindByTypeValueReq(_) => ATT_FIND_BY_TYPE_VALUE_REQ,
            AttPdu::FindByTypeValueRsp(_) => ATT_FIND_BY_TYPE_VALUE_RSP,
            AttPdu::ReadByTypeReq(_) => ATT_READ_BY_TYPE_REQ,
            AttPdu::ReadByTypeRsp(_) => ATT_READ_BY_TYPE_RSP,
            AttPdu::ReadReq(_) => ATT_READ_REQ,
            AttPdu::ReadRsp(_) => ATT_READ_RSP,
            AttPdu::ReadBlobReq(_) => ATT_READ_BLOB_REQ,
            AttPdu::ReadBlobRsp(_) => ATT_READ_BLOB_RSP,
            AttPdu::ReadMultipleReq(_) => ATT_READ_MULTIPLE_REQ,
            AttPdu::ReadMultipleRsp(_) => ATT_READ_MULTIPLE_RSP,
            AttPdu::ReadByGroupTypeReq(_) => ATT_READ_BY_GROUP_TYPE_REQ,
            AttPdu::ReadByGroupTypeRsp(_) => ATT_READ_BY_GROUP_TYPE_RSP,
            AttPdu::WriteReq(_) => ATT_WRITE_REQ,
            AttPdu::WriteRsp(_) => ATT_WRITE_RSP,
            AttPdu::WriteCmd(_) => ATT_WRITE_CMD,
            AttPdu::PrepareWriteReq(_) => ATT_PREPARE_WRITE_REQ,
            AttPdu::PrepareWriteRsp(_) => ATT_PREPARE_WRITE_RSP,
            AttPdu::ExecuteWriteReq(_) => ATT_EXECUTE_WRITE_REQ,
            AttPdu::ExecuteWriteRsp(_) => ATT_EXECUTE_WRITE_RSP,
            AttPdu::ValueNtf(_) => ATT_HANDLE_VALUE_NTF,
            AttPdu::ValueInd(_) => ATT_HANDLE_VALUE_IND,
            AttPdu::ValueCfm(_) => ATT_HANDLE_VALUE_CFM,
            AttPdu::SignedWrite(_) => ATT_SIGNED_WRITE_CMD,
            AttPdu::Undefined(raw) => raw.first().copied().unwrap_or(0),
        }
    }

    /// Classification used by the reader dispatch.
    pub fn pdu_type(&self) -> PduType {
        pdu_type_of(self.opcode())
    }

    /// Name of this PDU's opcode for log lines.
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }
}

/// One PDU as received off the transport, stamped with its parse time.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub pdu: AttPdu,
    /// Monotonic timestamp taken when the frame was parsed
    pub ts_creation: Instant,
}

impl Inbound {
    /// Parses a received frame, stamping the creation timestamp.
    pub fn parse(data: &[u8]) -> CodecResult<Inbound> {
        Ok(Inbound {
            pdu: AttPdu::parse(data)?,
            ts_creation: Instant::now(),
        })
    }
}
