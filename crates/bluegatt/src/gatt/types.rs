//! Common GATT types
//!
//! The client-side view of a remote database as filled in by discovery,
//! plus the Generic Access and Device Information value structs assembled
//! by the session helpers.
use crate::att::constants::*;
use crate::uuid::Uuid;
use bitflags::bitflags;

/// Local role of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattRole {
    /// This side issues requests against the remote database
    Client,
    /// This side serves its own attribute database
    Server,
}

bitflags! {
    /// Characteristic property bits (BT Core Spec v5.2, Vol 3, Part G, 3.3.1.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharProps: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_NO_RESP = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTH_SIGNED_WRITE = 0x40;
        const EXT_PROPS = 0x80;
    }
}

/// A discovered characteristic descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor handle
    pub handle: u16,
    /// Descriptor type
    pub uuid: Uuid,
    /// Last read value
    pub value: Vec<u8>,
}

impl Descriptor {
    /// Whether this is a Client Characteristic Configuration descriptor
    pub fn is_client_char_config(&self) -> bool {
        self.uuid == GATT_CLIENT_CHAR_CONFIG_UUID
    }

    /// Whether this is a Characteristic User Description descriptor
    pub fn is_user_description(&self) -> bool {
        self.uuid == GATT_USER_DESCRIPTION_UUID
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Handle of the characteristic declaration
    pub handle: u16,
    /// Handle of the characteristic value
    pub value_handle: u16,
    /// Last handle belonging to this characteristic, inclusive
    pub end_handle: u16,
    /// Characteristic value type
    pub uuid: Uuid,
    /// Property bits from the declaration
    pub properties: CharProps,
    /// Discovered descriptors, in handle order
    pub descriptors: Vec<Descriptor>,
    /// Index of the CCC descriptor within `descriptors`, if present
    pub ccc_index: Option<usize>,
}

impl Characteristic {
    /// The Client Characteristic Configuration descriptor, if discovered.
    pub fn client_char_config(&self) -> Option<&Descriptor> {
        self.ccc_index.and_then(|i| self.descriptors.get(i))
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Whether this is a primary service
    pub primary: bool,
    /// First handle of the service group
    pub start_handle: u16,
    /// Last handle of the service group, inclusive
    pub end_handle: u16,
    /// Service type
    pub uuid: Uuid,
    /// Discovered characteristics, in handle order
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Finds a characteristic by value type.
    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Peripheral Preferred Connection Parameters characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferredConnParams {
    pub min_conn_interval: u16,
    pub max_conn_interval: u16,
    pub slave_latency: u16,
    pub supervision_timeout: u16,
}

impl PreferredConnParams {
    /// Parses the 8-byte characteristic value.
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 8 {
            return None;
        }
        Some(Self {
            min_conn_interval: u16::from_le_bytes([value[0], value[1]]),
            max_conn_interval: u16::from_le_bytes([value[2], value[3]]),
            slave_latency: u16::from_le_bytes([value[4], value[5]]),
            supervision_timeout: u16::from_le_bytes([value[6], value[7]]),
        })
    }
}

/// Values of the Generic Access service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericAccess {
    pub device_name: String,
    pub appearance: u16,
    pub preferred_conn_params: Option<PreferredConnParams>,
}

/// PnP ID characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpId {
    pub vendor_id_source: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_version: u16,
}

impl PnpId {
    /// Parses the 7-byte characteristic value.
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 7 {
            return None;
        }
        Some(Self {
            vendor_id_source: value[0],
            vendor_id: u16::from_le_bytes([value[1], value[2]]),
            product_id: u16::from_le_bytes([value[3], value[4]]),
            product_version: u16::from_le_bytes([value[5], value[6]]),
        })
    }
}

/// Values of the Device Information service. Characteristics the peer does
/// not expose stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub system_id: Vec<u8>,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    pub manufacturer_name: String,
    pub regulatory_cert_data: Vec<u8>,
    pub pnp_id: Option<PnpId>,
}
