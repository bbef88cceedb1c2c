//! Attribute Protocol (ATT) layer
//!
//! The PDU codec, wire constants and error codes, and the bounded blocking
//! ring buffer that carries responses from the reader loop to the request
//! pipeline. The GATT session in [`crate::gatt`] is built on top of this
//! module.

pub mod constants;
pub mod error;
pub mod pdu;
pub mod ring;

#[cfg(test)]
mod tests;

pub use self::constants::*;
pub use self::error::AttErrorCode;
pub use self::pdu::{pdu_type_of, AttPacket, AttPdu, Inbound, MalformedPdu, PduType};
pub use self::ring::PduRing;
