//! Linux L2CAP socket transport
//!
//! Connects a `SOCK_SEQPACKET` L2CAP socket on the LE attribute channel
//! (CID 4). Reads are polled with a timeout so the reader loop stays
//! responsive to stop requests; `close()` flags the socket interrupted and
//! shuts it down, which wakes any thread blocked in `poll`.
use super::{SecurityLevel, Transport, TransportError};
use crate::att::constants::ATT_CID;
use crate::device::{AddressType, BdAddr};
use log::{debug, warn};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

// Bluetooth socket constants, not exposed by the libc crate
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_L2CAP: i32 = 0;
const SOL_BLUETOOTH: i32 = 274;
const BT_SECURITY: i32 = 4;

const BDADDR_LE_PUBLIC: u8 = 0x01;
const BDADDR_LE_RANDOM: u8 = 0x02;

/// Default read poll timeout in milliseconds.
const READ_POLL_TIMEOUT_MS: i32 = 10_000;

#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

#[repr(C)]
struct BtSecurity {
    level: u8,
    key_size: u8,
}

fn bdaddr_type(t: AddressType) -> u8 {
    match t {
        AddressType::Public => BDADDR_LE_PUBLIC,
        AddressType::Random => BDADDR_LE_RANDOM,
    }
}

/// An L2CAP connection-oriented channel on the LE attribute CID.
pub struct L2capSocket {
    fd: AtomicI32,
    is_open: AtomicBool,
    has_ioerror: AtomicBool,
    interrupted: AtomicBool,
    read_timeout_ms: i32,
    // serialises concurrent writers; reads are single-threaded by design
    write_lock: Mutex<()>,
}

impl L2capSocket {
    /// Opens and connects the channel to `remote`, optionally raising the
    /// security level before connecting.
    pub fn connect(
        local: BdAddr,
        local_type: AddressType,
        remote: BdAddr,
        remote_type: AddressType,
        security: SecurityLevel,
    ) -> Result<L2capSocket, TransportError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if fd < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }

        let local_addr = SockaddrL2 {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: 0,
            l2_bdaddr: local.0,
            l2_cid: ATT_CID.to_le(),
            l2_bdaddr_type: bdaddr_type(local_type),
        };
        let res = unsafe {
            libc::bind(
                fd,
                &local_addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }

        let socket = L2capSocket {
            fd: AtomicI32::new(fd),
            is_open: AtomicBool::new(false),
            has_ioerror: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            read_timeout_ms: READ_POLL_TIMEOUT_MS,
            write_lock: Mutex::new(()),
        };

        if security > SecurityLevel::None && !socket.set_security_raw(security) {
            warn!("l2cap: could not set security level {:?}", security);
        }

        let remote_addr = SockaddrL2 {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: 0,
            l2_bdaddr: remote.0,
            l2_cid: ATT_CID.to_le(),
            l2_bdaddr_type: bdaddr_type(remote_type),
        };
        let res = unsafe {
            libc::connect(
                fd,
                &remote_addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }

        debug!("l2cap: connected to {} (cid {})", remote, ATT_CID);
        socket.is_open.store(true, Ordering::SeqCst);
        Ok(socket)
    }

    fn set_security_raw(&self, level: SecurityLevel) -> bool {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return false;
        }
        let sec = BtSecurity {
            level: level.bt_security_level(),
            key_size: 0,
        };
        let res = unsafe {
            libc::setsockopt(
                fd,
                SOL_BLUETOOTH,
                BT_SECURITY,
                &sec as *const _ as *const libc::c_void,
                std::mem::size_of::<BtSecurity>() as libc::socklen_t,
            )
        };
        res == 0
    }
}

impl Transport for L2capSocket {
    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn has_ioerror(&self) -> bool {
        self.has_ioerror.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.interrupted.store(true, Ordering::SeqCst);
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            // shutdown wakes any thread blocked in poll/read
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
                libc::close(fd);
            }
        }
        debug!("l2cap: closed");
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 || !self.is_open() {
            return Err(TransportError::NotOpen);
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, self.read_timeout_ms) };
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(TransportError::Interrupted);
        }
        if res == 0 {
            return Err(TransportError::Timeout);
        }
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(TransportError::Interrupted);
            }
            self.has_ioerror.store(true, Ordering::SeqCst);
            return Err(TransportError::Io(err));
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(TransportError::Interrupted);
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(TransportError::Interrupted);
            }
            self.has_ioerror.store(true, Ordering::SeqCst);
            return Err(TransportError::Io(err));
        }
        if n == 0 {
            // orderly shutdown by the peer
            self.has_ioerror.store(true, Ordering::SeqCst);
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the channel",
            )));
        }
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let _guard = self.write_lock.lock().unwrap();
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 || !self.is_open() {
            return Err(TransportError::NotOpen);
        }

        let mut written = 0usize;
        while written < buf.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            };
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(TransportError::Interrupted);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.has_ioerror.store(true, Ordering::SeqCst);
                return Err(TransportError::Io(err));
            }
            written += n as usize;
        }
        Ok(written)
    }

    fn set_security_level(&self, level: SecurityLevel) -> bool {
        self.set_security_raw(level)
    }

    fn state_string(&self) -> String {
        format!(
            "State[open {}, interrupted {}, ioerror {}]",
            self.is_open(),
            self.interrupted.load(Ordering::SeqCst),
            self.has_ioerror()
        )
    }
}

impl Drop for L2capSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening L2CAP socket accepting inbound ATT connections (server role).
pub struct L2capListener {
    fd: RawFd,
}

impl L2capListener {
    /// Binds and listens on the LE attribute CID of the local adapter.
    pub fn bind(local: BdAddr, local_type: AddressType) -> Result<L2capListener, TransportError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if fd < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        let addr = SockaddrL2 {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: 0,
            l2_bdaddr: local.0,
            l2_cid: ATT_CID.to_le(),
            l2_bdaddr_type: bdaddr_type(local_type),
        };
        let res = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }
        if unsafe { libc::listen(fd, 1) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }
        Ok(L2capListener { fd })
    }

    /// Blocks for the next inbound connection. Returns the connected
    /// transport and the remote address.
    pub fn accept(&self) -> Result<(L2capSocket, BdAddr), TransportError> {
        let mut peer = SockaddrL2 {
            l2_family: 0,
            l2_psm: 0,
            l2_bdaddr: [0; 6],
            l2_cid: 0,
            l2_bdaddr_type: 0,
        };
        let mut len = std::mem::size_of::<SockaddrL2>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.fd,
                &mut peer as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        let socket = L2capSocket {
            fd: AtomicI32::new(fd),
            is_open: AtomicBool::new(true),
            has_ioerror: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            read_timeout_ms: READ_POLL_TIMEOUT_MS,
            write_lock: Mutex::new(()),
        };
        Ok((socket, BdAddr(peer.l2_bdaddr)))
    }
}

impl Drop for L2capListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
