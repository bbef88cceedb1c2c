//! BlueGatt - a user-space Bluetooth LE ATT/GATT session engine
//!
//! This library implements the Attribute Protocol (ATT) and the Generic
//! Attribute Profile (GATT) on top of an L2CAP connection-oriented channel
//! (LE CID 4). For each connected remote device one [`GattSession`] is
//! maintained, acting in either client or server role: it performs
//! service/characteristic/descriptor discovery, issues read/write
//! transactions (including long-attribute reads), delivers notifications
//! and indications to registered listeners, and - in server role - serves
//! an in-memory attribute database with MTU-aware response fragmentation
//! and a prepared-write queue.
//!
//! Device scanning, connection orchestration, pairing and HCI management
//! are out of scope; the L2CAP channel is consumed through the
//! [`l2cap::Transport`] seam.

pub mod att;
pub mod device;
pub mod error;
pub mod gatt;
pub mod l2cap;
pub mod uuid;

// Re-export common types for convenience
pub use device::{AddressType, BdAddr, DeviceLink, DisconnectReason};
pub use error::{GattError, GattResult};
pub use gatt::{
    CharListener, CharProps, Characteristic, Descriptor, GattConfig, GattDb, GattRole,
    GattSession, ServerListener, Service,
};
pub use l2cap::{L2capSocket, SecurityLevel, Transport};
pub use uuid::Uuid;
