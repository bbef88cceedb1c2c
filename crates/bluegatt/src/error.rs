//! Caller-facing error types
use crate::att::pdu::MalformedPdu;
use crate::att::AttErrorCode;
use thiserror::Error;

/// Errors surfaced by the GATT session API.
#[derive(Debug, Error)]
pub enum GattError {
    /// Session not open or transport down
    #[error("session not connected")]
    NotConnected,

    /// Malformed input at the API boundary
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload does not fit the negotiated MTU
    #[error("payload of {0} bytes exceeds the negotiated MTU")]
    TooLarge(usize),

    /// No response within the configured deadline; the session disconnects
    #[error("timed out waiting for reply")]
    Timeout,

    /// Transport failure; the session disconnects
    #[error("transport I/O error")]
    IoError,

    /// Reply opcode not in the expected set
    #[error("unexpected reply opcode {0:#04x}")]
    UnexpectedReply(u8),

    /// Parser failure on a received frame
    #[error(transparent)]
    MalformedPdu(#[from] MalformedPdu),

    /// The owning device reference is gone
    #[error("device no longer available")]
    NotAvailable,

    /// The peer answered with an `ATT_ERROR_RSP`
    #[error("ATT error {code:?} on handle {handle:#06x}")]
    Att { code: AttErrorCode, handle: u16 },
}

/// Common result type of the GATT session API.
pub type GattResult<T> = Result<T, GattError>;
