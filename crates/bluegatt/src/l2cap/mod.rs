//! L2CAP transport boundary
//!
//! The session consumes the channel through the [`Transport`] seam: a
//! blocking byte-oriented connection with an interruptible, poll-timeout
//! read and an idempotent close that unblocks concurrent readers.
//! [`L2capSocket`] is the Linux implementation over
//! `AF_BLUETOOTH`/`BTPROTO_L2CAP` (LE signalling CID 4).

pub mod socket;

pub use self::socket::{L2capListener, L2capSocket};

use thiserror::Error;

/// Security level of the L2CAP connection, mapped onto the kernel's
/// `BT_SECURITY` levels. May be raised after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security requirement
    None,
    /// Low: no encryption required
    Low,
    /// Medium: encryption, no MITM protection
    Medium,
    /// High: authenticated encryption
    High,
    /// FIPS: authenticated LE Secure Connections
    Fips,
}

impl SecurityLevel {
    /// The kernel `BT_SECURITY` level value.
    pub fn bt_security_level(self) -> u8 {
        match self {
            SecurityLevel::None => 0,
            SecurityLevel::Low => 1,
            SecurityLevel::Medium => 2,
            SecurityLevel::High => 3,
            SecurityLevel::Fips => 4,
        }
    }
}

/// Transport failure modes. `Timeout` is an expected idle-poll outcome and
/// does not indicate a broken channel; `Interrupted` is raised when a
/// concurrent `close()` aborted the operation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel not open")]
    NotOpen,

    #[error("operation interrupted by close")]
    Interrupted,

    #[error("poll timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking byte-oriented connection to one peer.
///
/// `read` blocks up to the implementation's poll timeout and returns
/// [`TransportError::Timeout`] when nothing arrived; `close` is idempotent
/// and unblocks any concurrent `read`/`write`.
pub trait Transport: Send + Sync {
    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Whether a transmission error was observed
    fn has_ioerror(&self) -> bool;

    /// Closes the channel, unblocking concurrent readers and writers
    fn close(&self);

    /// Reads one frame into `buf`, blocking up to the poll timeout
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes `buf` fully
    fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Applies a security level to the connection; `false` when it could
    /// not be set
    fn set_security_level(&self, level: SecurityLevel) -> bool;

    /// One-line state summary for log output
    fn state_string(&self) -> String;
}
