use rand::RngCore;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A Bluetooth UUID of 16, 32 or 128 bit width.
///
/// The value is always stored expanded to 128 bits in little-endian byte
/// order, so equality transparently compares across widths: a 16-bit
/// SIG-assigned value and its Base-UUID expansion are the same `Uuid`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// Bluetooth Base UUID "00000000-0000-1000-8000-00805F9B34FB", little-endian.
const BASE_UUID_BYTES: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Offset of the 16/32-bit short value within the base UUID.
const BASE_OFFSET: usize = 12;

impl Uuid {
    /// Creates a UUID from 16 little-endian bytes.
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    /// Creates a UUID from 16 big-endian bytes (standard textual order).
    pub fn from_bytes_be(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        Uuid { bytes }
    }

    /// Expands a 16-bit SIG-assigned value: `value * 2^96 + BASE_UUID`.
    pub const fn from_u16(uuid16: u16) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid16 as u8;
        bytes[BASE_OFFSET + 1] = (uuid16 >> 8) as u8;
        Uuid { bytes }
    }

    /// Expands a 32-bit SIG-assigned value: `value * 2^96 + BASE_UUID`.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid32 as u8;
        bytes[BASE_OFFSET + 1] = (uuid32 >> 8) as u8;
        bytes[BASE_OFFSET + 2] = (uuid32 >> 16) as u8;
        bytes[BASE_OFFSET + 3] = (uuid32 >> 24) as u8;
        Uuid { bytes }
    }

    /// Creates a UUID from an on-wire little-endian slice of length 2, 4 or
    /// 16. Returns `None` for any other length.
    pub fn try_from_slice_le(slice: &[u8]) -> Option<Self> {
        match slice.len() {
            2 => Some(Uuid::from_u16(u16::from_le_bytes([slice[0], slice[1]]))),
            4 => Some(Uuid::from_u32(u32::from_le_bytes([
                slice[0], slice[1], slice[2], slice[3],
            ]))),
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(slice);
                Some(Uuid::from_bytes_le(bytes))
            }
            _ => None,
        }
    }

    /// Generates a random (version 4) UUID, e.g. for custom services.
    pub fn new_random_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // version 4, RFC 4122 variant (big-endian positions)
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Uuid::from_bytes_be(bytes)
    }

    /// The 16 underlying bytes, little-endian.
    pub const fn as_bytes_le(&self) -> &[u8; 16] {
        &self.bytes
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[0..BASE_OFFSET] == BASE_UUID_BYTES[0..BASE_OFFSET]
    }

    /// The 16-bit short form, if this UUID is a SIG-assigned 16-bit value.
    pub fn as_u16(&self) -> Option<u16> {
        if self.is_sig_assigned()
            && self.bytes[BASE_OFFSET + 2] == 0
            && self.bytes[BASE_OFFSET + 3] == 0
        {
            Some(u16::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
            ]))
        } else {
            None
        }
    }

    /// The 32-bit short form, if this UUID is a SIG-assigned value.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
                self.bytes[BASE_OFFSET + 2],
                self.bytes[BASE_OFFSET + 3],
            ]))
        } else {
            None
        }
    }

    /// On-wire size within an ATT PDU: 2 bytes for SIG-assigned 16-bit
    /// values, 16 bytes otherwise. 32-bit values have no dedicated ATT
    /// representation and go out expanded.
    pub fn att_size(&self) -> usize {
        if self.as_u16().is_some() {
            2
        } else {
            16
        }
    }

    /// Appends the little-endian on-wire form (2 or 16 bytes) to `out`.
    pub fn put_att(&self, out: &mut Vec<u8>) {
        if let Some(u) = self.as_u16() {
            out.extend_from_slice(&u.to_le_bytes());
        } else {
            out.extend_from_slice(&self.bytes);
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl PartialEq<u16> for Uuid {
    fn eq(&self, other: &u16) -> bool {
        self.as_u16() == Some(*other)
    }
}

impl PartialEq<Uuid> for u16 {
    fn eq(&self, other: &Uuid) -> bool {
        other.as_u16() == Some(*self)
    }
}

impl Hash for Uuid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // standard hyphenated big-endian form
        let mut b = self.bytes;
        b.reverse();
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    // Show the short form when one exists, the hyphenated form otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.as_u16() {
            write!(f, "Uuid(0x{:04X})", v)
        } else if let Some(v) = self.as_u32() {
            write!(f, "Uuid(0x{:08X})", v)
        } else {
            fmt::Display::fmt(self, f)
        }
    }
}

/// Error parsing a UUID from its textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UuidParseError {
    InvalidLength,
    InvalidFormat,
}

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UuidParseError::InvalidLength => write!(f, "invalid UUID string length"),
            UuidParseError::InvalidFormat => write!(f, "invalid UUID string format"),
        }
    }
}

impl std::error::Error for UuidParseError {}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts "180A", "0000180A" and the full hyphenated/unhyphenated
    /// 128-bit form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UuidParseError::InvalidFormat);
        }
        match cleaned.len() {
            4 => u16::from_str_radix(&cleaned, 16)
                .map(Uuid::from_u16)
                .map_err(|_| UuidParseError::InvalidFormat),
            8 => u32::from_str_radix(&cleaned, 16)
                .map(Uuid::from_u32)
                .map_err(|_| UuidParseError::InvalidFormat),
            32 => {
                let mut bytes_be = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes_be)
                    .map_err(|_| UuidParseError::InvalidFormat)?;
                Ok(Uuid::from_bytes_be(bytes_be))
            }
            _ => Err(UuidParseError::InvalidLength),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_are_equivalent() {
        let short = Uuid::from_u16(0x2902);
        let long = Uuid::from_str("00002902-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(short, long);
        assert_eq!(short.as_u16(), Some(0x2902));
        assert_eq!(long.as_u16(), Some(0x2902));
    }

    #[test]
    fn custom_uuid_has_no_short_form() {
        let u = Uuid::from_str("12345678-9abc-def0-1234-56789abcdef0").unwrap();
        assert_eq!(u.as_u16(), None);
        assert_eq!(u.att_size(), 16);
    }

    #[test]
    fn wire_roundtrip() {
        let u16v = Uuid::from_u16(0x2800);
        let mut out = Vec::new();
        u16v.put_att(&mut out);
        assert_eq!(out, vec![0x00, 0x28]);
        assert_eq!(Uuid::try_from_slice_le(&out), Some(u16v));

        let long = Uuid::new_random_v4();
        let mut out = Vec::new();
        long.put_att(&mut out);
        assert_eq!(out.len(), 16);
        assert_eq!(Uuid::try_from_slice_le(&out), Some(long));
    }

    #[test]
    fn rejects_odd_slice_lengths() {
        assert_eq!(Uuid::try_from_slice_le(&[0x00, 0x28, 0x01]), None);
        assert_eq!(Uuid::try_from_slice_le(&[]), None);
    }
}
