//! Generic Attribute Profile (GATT) layer
//!
//! The session facade with its reader loop and request pipeline, the
//! server-side attribute database and responder, characteristic listeners
//! and the configuration envelope.

pub mod config;
pub mod db;
pub mod listener;
pub mod server;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;

pub use self::config::GattConfig;
pub use self::db::{DbCharacteristic, DbDescriptor, DbService, GattDb, ServerListener};
pub use self::listener::{CharListener, ListenerSet};
pub use self::session::GattSession;
pub use self::types::{
    CharProps, Characteristic, Descriptor, DeviceInformation, GattRole, GenericAccess, PnpId,
    PreferredConnParams, Service,
};
