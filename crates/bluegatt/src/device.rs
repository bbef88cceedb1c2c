//! Consumed device boundary
//!
//! The session needs very little from the device that owns it: its address
//! for log lines and a way to request a link-level disconnect. The device
//! uniquely owns the session; the session only holds a `Weak` reference
//! back, so dropping the device is always safe and later calls that need
//! it fail with [`crate::GattError::NotAvailable`].
use std::fmt;
use std::str::FromStr;

/// A 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid address: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[5 - i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid address: {}", s))?;
        }
        Ok(BdAddr(bytes))
    }
}

/// LE address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
}

/// Reason forwarded with a device disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly local teardown
    UserTerminated,
    /// Transport I/O failure pulled the session down
    IoError,
}

/// The device owning a GATT session, seen from the session's side.
pub trait DeviceLink: Send + Sync {
    /// Address and type of the remote device
    fn address_and_type(&self) -> (BdAddr, AddressType);

    /// Requests a link-level disconnect of the device
    fn disconnect(&self, reason: DisconnectReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_string_roundtrip() {
        let addr = BdAddr::from_str("00:1A:7D:DA:71:13").unwrap();
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
        assert_eq!(addr.0[5], 0x00);
        assert_eq!(addr.0[0], 0x13);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(BdAddr::from_str("00:1A:7D:DA:71").is_err());
        assert!(BdAddr::from_str("zz:1A:7D:DA:71:13").is_err());
    }
}
