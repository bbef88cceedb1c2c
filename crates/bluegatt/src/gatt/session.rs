//! The GATT session facade
//!
//! One session per connected remote device. The session owns the transport
//! and a dedicated reader thread; callers drive the client-side request
//! pipeline, which keeps exactly one request outstanding per session via
//! the transaction lock. Server-originated notifications and indications
//! fan out to registered [`CharListener`]s; in server role, request PDUs
//! are answered by the responder in [`super::server`].
use crate::att::constants::*;
use crate::att::pdu::{
    AttPdu, ExchangeMtuRequest, FindInformationRequest, HandleValueConfirmation,
    HandleValueIndication, HandleValueNotification, Inbound, ReadBlobRequest, ReadByGroupTypeRequest,
    ReadByTypeRequest, ReadRequest, WriteCommand, WriteRequest,
};
use crate::att::ring::PduRing;
use crate::att::{AttErrorCode, MalformedPdu, PduType};
use crate::device::{DeviceLink, DisconnectReason};
use crate::error::{GattError, GattResult};
use crate::gatt::config::GattConfig;
use crate::gatt::db::GattDb;
use crate::gatt::listener::{CharListener, ListenerSet};
use crate::gatt::types::{
    CharProps, Characteristic, Descriptor, DeviceInformation, GattRole, GenericAccess, PnpId,
    PreferredConnParams, Service,
};
use crate::l2cap::{Transport, TransportError};
use crate::uuid::Uuid;
use log::{debug, error, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// One staged fragment of the server-side prepared-write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PreparedWrite {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

struct ReaderCtl {
    running: bool,
    tid: Option<thread::ThreadId>,
}

pub(crate) struct SessionInner {
    pub(crate) config: GattConfig,
    role: GattRole,
    pub(crate) transport: Arc<dyn Transport>,
    device: Weak<dyn DeviceLink>,
    pub(crate) peer: String,
    pub(crate) server_db: Option<Arc<Mutex<GattDb>>>,
    is_connected: AtomicBool,
    has_ioerror: AtomicBool,
    send_indication_confirmation: AtomicBool,
    reader_should_stop: AtomicBool,
    reader_ctl: Mutex<ReaderCtl>,
    reader_cv: Condvar,
    // serialises compound client operations (discovery, long reads)
    op_lock: Mutex<()>,
    // serialises one request/response transaction; never taken by the reader
    tx_lock: Mutex<()>,
    ring: PduRing,
    listeners: ListenerSet,
    services: Mutex<Vec<Service>>,
    pub(crate) server_mtu: AtomicU16,
    pub(crate) used_mtu: AtomicU16,
    pub(crate) prepared_writes: Mutex<Vec<PreparedWrite>>,
}

/// A bidirectional ATT session over one L2CAP channel.
///
/// Dropping the session closes it. `close()` is the universal
/// cancellation: it pulls down the transport, which unblocks the reader
/// and any in-flight transaction.
pub struct GattSession {
    inner: Arc<SessionInner>,
}

impl GattSession {
    /// Creates a session over an open transport and starts the reader.
    ///
    /// In client role the initial MTU exchange runs before this returns;
    /// its transport or timeout failures tear the session down and are
    /// returned as errors. Server role requires a database.
    pub fn new(
        transport: Arc<dyn Transport>,
        role: GattRole,
        device: Weak<dyn DeviceLink>,
        server_db: Option<Arc<Mutex<GattDb>>>,
        config: GattConfig,
    ) -> GattResult<GattSession> {
        if !transport.is_open() {
            return Err(GattError::NotConnected);
        }
        if role == GattRole::Server && server_db.is_none() {
            return Err(GattError::InvalidArgument(
                "server role requires an attribute database".into(),
            ));
        }

        let peer = device
            .upgrade()
            .map(|d| d.address_and_type().0.to_string())
            .unwrap_or_else(|| "<unknown>".into());
        let server_mtu = match &server_db {
            Some(db) if role == GattRole::Server => db.lock().unwrap().server_mtu,
            _ => ATT_MIN_MTU,
        };
        let ring_capacity = config.pdu_ring_capacity;

        let inner = Arc::new(SessionInner {
            config,
            role,
            transport,
            device,
            peer,
            server_db,
            is_connected: AtomicBool::new(true),
            has_ioerror: AtomicBool::new(false),
            send_indication_confirmation: AtomicBool::new(true),
            reader_should_stop: AtomicBool::new(false),
            reader_ctl: Mutex::new(ReaderCtl {
                running: false,
                tid: None,
            }),
            reader_cv: Condvar::new(),
            op_lock: Mutex::new(()),
            tx_lock: Mutex::new(()),
            ring: PduRing::new(ring_capacity),
            listeners: ListenerSet::new(),
            services: Mutex::new(Vec::new()),
            server_mtu: AtomicU16::new(server_mtu),
            used_mtu: AtomicU16::new(ATT_MIN_MTU),
            prepared_writes: Mutex::new(Vec::new()),
        });

        {
            let reader_inner = Arc::clone(&inner);
            // detached on purpose: the lifecycle condvar replaces join()
            let _ = thread::Builder::new()
                .name("gatt-reader".into())
                .spawn(move || reader_loop(reader_inner))
                .map_err(|_| GattError::IoError)?;
            let mut ctl = inner.reader_ctl.lock().unwrap();
            while !ctl.running {
                ctl = inner.reader_cv.wait(ctl).unwrap();
            }
        }

        let session = GattSession { inner };
        if role == GattRole::Client {
            session.inner.exchange_mtu()?;
        }
        Ok(session)
    }

    /// Local role of this session.
    pub fn role(&self) -> GattRole {
        self.inner.role
    }

    /// Whether the session is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected.load(Ordering::SeqCst)
    }

    /// Whether a transport failure was observed.
    pub fn has_ioerror(&self) -> bool {
        self.inner.has_ioerror.load(Ordering::SeqCst)
    }

    /// The peer's Rx MTU as learned at MTU exchange.
    pub fn get_server_mtu(&self) -> u16 {
        self.inner.server_mtu.load(Ordering::SeqCst)
    }

    /// The negotiated MTU in effect.
    pub fn get_used_mtu(&self) -> u16 {
        self.inner.used_mtu.load(Ordering::SeqCst)
    }

    /// One-line state summary for diagnostics.
    pub fn get_state_string(&self) -> String {
        format!(
            "GattSession[{:?}, {}, connected {}, ioerror {}, mtu {}/{}, {}]",
            self.inner.role,
            self.inner.peer,
            self.is_connected(),
            self.has_ioerror(),
            self.get_used_mtu(),
            self.get_server_mtu(),
            self.inner.transport.state_string()
        )
    }

    /// Enables or disables automatic `HANDLE_VALUE_CFM` replies to
    /// received indications. Enabled by default.
    pub fn set_send_indication_confirmation(&self, v: bool) {
        self.inner
            .send_indication_confirmation
            .store(v, Ordering::SeqCst);
    }

    pub fn get_send_indication_confirmation(&self) -> bool {
        self.inner.send_indication_confirmation.load(Ordering::SeqCst)
    }

    /// Registers a characteristic listener. Returns `false` when the same
    /// listener is already registered.
    pub fn add_char_listener(&self, listener: Arc<dyn CharListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    /// Removes a characteristic listener by identity.
    pub fn remove_char_listener(&self, listener: &Arc<dyn CharListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Removes all listeners matching `characteristic`; returns the count.
    pub fn remove_all_associated_char_listener(&self, characteristic: &Characteristic) -> usize {
        self.inner.listeners.remove_matching(characteristic)
    }

    /// Removes all listeners; returns the count.
    pub fn remove_all_char_listener(&self) -> usize {
        self.inner.listeners.clear()
    }

    /// Closes the session: flips the connection state exactly once, pulls
    /// down the transport and waits for the reader to stop. Idempotent.
    pub fn close(&self) {
        self.inner.disconnect(false, false);
    }

    /// The discovered services as cached by the last discovery run.
    pub fn get_services(&self) -> Vec<Service> {
        self.inner.services.lock().unwrap().clone()
    }

    /// Resolves a characteristic by its value handle in the discovery cache.
    pub fn find_characteristic_by_value_handle(&self, value_handle: u16) -> Option<Characteristic> {
        self.inner.find_characteristic_by_value_handle(value_handle)
    }

    /// Discovers all primary services with their characteristics and
    /// descriptors, caches and returns them.
    pub fn discover_complete_primary_services(&self) -> GattResult<Vec<Service>> {
        let _op = self.inner.op_lock.lock().unwrap();
        let mut services = self.inner.discover_primary_services()?;
        for service in &mut services {
            if self.inner.discover_characteristics(service)? {
                self.inner.discover_descriptors(service)?;
            }
        }
        *self.inner.services.lock().unwrap() = services.clone();
        Ok(services)
    }

    /// Reads a characteristic value; see [`GattSession::read_value`] for
    /// the meaning of `expected_length`.
    pub fn read_characteristic_value(
        &self,
        characteristic: &Characteristic,
        expected_length: i32,
    ) -> GattResult<Vec<u8>> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner
            .read_value(characteristic.value_handle, expected_length)
    }

    /// Reads a descriptor value.
    pub fn read_descriptor_value(
        &self,
        descriptor: &Descriptor,
        expected_length: i32,
    ) -> GattResult<Vec<u8>> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.read_value(descriptor.handle, expected_length)
    }

    /// Reads the attribute value at `handle`, following the long-read
    /// procedure: `expected_length > 0` reads until that many bytes
    /// accumulated, `== 0` issues a single read, `< 0` reads until a short
    /// chunk, an empty blob or `ATTRIBUTE_NOT_LONG` terminates the loop.
    pub fn read_value(&self, handle: u16, expected_length: i32) -> GattResult<Vec<u8>> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.read_value(handle, expected_length)
    }

    /// Writes a characteristic value and awaits the `WRITE_RSP`.
    pub fn write_characteristic_value(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> GattResult<()> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.write_value(characteristic.value_handle, value, true)
    }

    /// Writes a characteristic value as an unacknowledged `WRITE_CMD`.
    pub fn write_characteristic_value_no_resp(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> GattResult<()> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner
            .write_value(characteristic.value_handle, value, false)
    }

    /// Writes a descriptor value and awaits the `WRITE_RSP`.
    pub fn write_descriptor_value(&self, descriptor: &Descriptor, value: &[u8]) -> GattResult<()> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.write_value(descriptor.handle, value, true)
    }

    /// Writes the CCC bitfield of `cccd`. Fails with `InvalidArgument`
    /// when the descriptor is not a Client Characteristic Configuration.
    /// When disabling both bits, a write failure is downgraded to a
    /// warning and reported as `Ok(false)`: losing the connection while
    /// unsubscribing is acceptable.
    pub fn configure_notification_indication(
        &self,
        cccd: &Descriptor,
        enable_notification: bool,
        enable_indication: bool,
    ) -> GattResult<bool> {
        if !cccd.is_client_char_config() {
            return Err(GattError::InvalidArgument(format!(
                "descriptor {:#06x} is not a Client Characteristic Configuration",
                cccd.handle
            )));
        }
        let ccc_value: u16 = (enable_notification as u16) | ((enable_indication as u16) << 1);
        let _op = self.inner.op_lock.lock().unwrap();
        match self
            .inner
            .write_value(cccd.handle, &ccc_value.to_le_bytes(), true)
        {
            Ok(()) => Ok(true),
            Err(e) if !enable_notification && !enable_indication => {
                warn!(
                    "{}: CCC disable write failed, ignoring: {}",
                    self.inner.peer, e
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Assembles the Generic Access service values from the discovery
    /// cache, reading each characteristic. `None` when the peer exposes no
    /// device name.
    pub fn get_generic_access(&self) -> GattResult<Option<GenericAccess>> {
        let _op = self.inner.op_lock.lock().unwrap();
        let services = self.inner.services.lock().unwrap().clone();
        let mut device_name = String::new();
        let mut appearance = 0u16;
        let mut preferred_conn_params = None;
        for service in services.iter().filter(|s| s.uuid == GATT_GENERIC_ACCESS_UUID) {
            for c in &service.characteristics {
                if c.uuid == GATT_DEVICE_NAME_UUID {
                    if let Ok(v) = self.inner.read_value(c.value_handle, -1) {
                        device_name = String::from_utf8_lossy(&v).into_owned();
                    }
                } else if c.uuid == GATT_APPEARANCE_UUID {
                    if let Ok(v) = self.inner.read_value(c.value_handle, -1) {
                        if v.len() >= 2 {
                            appearance = u16::from_le_bytes([v[0], v[1]]);
                        }
                    }
                } else if c.uuid == GATT_PREFERRED_CONN_PARAMS_UUID {
                    if let Ok(v) = self.inner.read_value(c.value_handle, -1) {
                        preferred_conn_params = PreferredConnParams::parse(&v);
                    }
                }
            }
        }
        if device_name.is_empty() {
            return Ok(None);
        }
        Ok(Some(GenericAccess {
            device_name,
            appearance,
            preferred_conn_params,
        }))
    }

    /// Assembles the Device Information service values from the discovery
    /// cache. `None` when the peer exposes no such service.
    pub fn get_device_information(&self) -> GattResult<Option<DeviceInformation>> {
        let _op = self.inner.op_lock.lock().unwrap();
        let services = self.inner.services.lock().unwrap().clone();
        let mut found = false;
        let mut di = DeviceInformation::default();
        for service in services
            .iter()
            .filter(|s| s.uuid == GATT_DEVICE_INFORMATION_UUID)
        {
            found = true;
            for c in &service.characteristics {
                let value = match self.inner.read_value(c.value_handle, -1) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if c.uuid == GATT_SYSTEM_ID_UUID {
                    di.system_id = value;
                } else if c.uuid == GATT_MODEL_NUMBER_UUID {
                    di.model_number = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_SERIAL_NUMBER_UUID {
                    di.serial_number = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_FIRMWARE_REVISION_UUID {
                    di.firmware_revision = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_HARDWARE_REVISION_UUID {
                    di.hardware_revision = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_SOFTWARE_REVISION_UUID {
                    di.software_revision = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_MANUFACTURER_NAME_UUID {
                    di.manufacturer_name = String::from_utf8_lossy(&value).into_owned();
                } else if c.uuid == GATT_REGULATORY_CERT_DATA_UUID {
                    di.regulatory_cert_data = value;
                } else if c.uuid == GATT_PNP_ID_UUID {
                    di.pnp_id = PnpId::parse(&value);
                }
            }
        }
        Ok(if found { Some(di) } else { None })
    }

    /// Liveness probe: re-reads the Generic Access Appearance value. On
    /// any failure the session is disconnected and `false` returned.
    pub fn ping(&self) -> bool {
        {
            let _op = self.inner.op_lock.lock().unwrap();
            let services = self.inner.services.lock().unwrap().clone();
            for service in services.iter().filter(|s| s.uuid == GATT_GENERIC_ACCESS_UUID) {
                for c in &service.characteristics {
                    if c.uuid == GATT_APPEARANCE_UUID {
                        if self.inner.read_value(c.value_handle, 0).is_ok() {
                            return true;
                        }
                        info!("{}: ping read failed, disconnecting", self.inner.peer);
                        self.inner.disconnect(true, true);
                        return false;
                    }
                }
            }
        }
        info!(
            "{}: no Generic Access / Appearance to ping, disconnecting",
            self.inner.peer
        );
        self.inner.disconnect(true, true);
        false
    }

    /// Sends an unacknowledged notification for a characteristic value
    /// handle of the local database. Server role only.
    pub fn send_notification(&self, value_handle: u16, value: &[u8]) -> GattResult<()> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.check_server_value_handle(value_handle)?;
        let used = self.inner.used_mtu.load(Ordering::SeqCst) as usize;
        let mut data = value.to_vec();
        data.truncate(used - 3);
        self.inner
            .send_frame(&AttPdu::ValueNtf(HandleValueNotification {
                handle: value_handle,
                value: data,
            }))
    }

    /// Sends an indication for a characteristic value handle of the local
    /// database and awaits the peer's confirmation. Server role only.
    pub fn send_indication(&self, value_handle: u16, value: &[u8]) -> GattResult<()> {
        let _op = self.inner.op_lock.lock().unwrap();
        self.inner.check_server_value_handle(value_handle)?;
        let used = self.inner.used_mtu.load(Ordering::SeqCst) as usize;
        let mut data = value.to_vec();
        data.truncate(used - 3);
        let reply = self.inner.send_with_reply(
            &AttPdu::ValueInd(HandleValueIndication {
                handle: value_handle,
                value: data,
            }),
            self.inner.config.write_reply_timeout,
        )?;
        match reply.pdu {
            AttPdu::ValueCfm(_) => Ok(()),
            other => Err(GattError::UnexpectedReply(other.opcode())),
        }
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        self.inner.disconnect(false, false);
    }
}

impl SessionInner {
    fn validate_connected(&self) -> bool {
        if self.has_ioerror.load(Ordering::SeqCst) || self.transport.has_ioerror() {
            self.has_ioerror.store(true, Ordering::SeqCst);
            return false;
        }
        self.is_connected.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// Writes one PDU. Transport writes are frame-atomic (the transport
    /// serialises its writers), so this is safe from both callers and the
    /// reader. Write failures flag the I/O error and disconnect.
    pub(crate) fn send_frame(&self, pdu: &AttPdu) -> GattResult<()> {
        if !self.validate_connected() {
            return Err(GattError::NotConnected);
        }
        let frame = pdu.serialize();
        let used = self.used_mtu.load(Ordering::SeqCst) as usize;
        if frame.len() > used {
            return Err(GattError::TooLarge(frame.len()));
        }
        if self.config.debug_data {
            debug!("{}: send {}: {:02x?}", self.peer, pdu.name(), frame);
        }
        match self.transport.write(&frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => {
                error!(
                    "{}: short write {}/{} on {}, disconnecting",
                    self.peer,
                    n,
                    frame.len(),
                    pdu.name()
                );
                self.has_ioerror.store(true, Ordering::SeqCst);
                self.disconnect(true, true);
                Err(GattError::IoError)
            }
            Err(e) => {
                error!("{}: write failed on {}: {}, disconnecting", self.peer, pdu.name(), e);
                self.has_ioerror.store(true, Ordering::SeqCst);
                self.disconnect(true, true);
                Err(GattError::IoError)
            }
        }
    }

    /// Sends one request and blocks for its reply with `timeout`. The
    /// transaction lock guarantees a single outstanding request. A timeout
    /// flags the I/O error and disconnects.
    pub(crate) fn send_with_reply(&self, pdu: &AttPdu, timeout: Duration) -> GattResult<Inbound> {
        let _tx = self.tx_lock.lock().unwrap();
        self.send_frame(pdu)?;
        match self.ring.get_blocking(timeout) {
            Some(reply) => Ok(reply),
            None => {
                error!(
                    "{}: no reply to {} within {:?}, disconnecting",
                    self.peer,
                    pdu.name(),
                    timeout
                );
                self.has_ioerror.store(true, Ordering::SeqCst);
                self.disconnect(true, true);
                Err(GattError::Timeout)
            }
        }
    }

    /// Client-role MTU exchange, run once at session start. A peer that
    /// does not support the request leaves the session at the minimum MTU.
    fn exchange_mtu(&self) -> GattResult<()> {
        let req = AttPdu::ExchangeMtuReq(ExchangeMtuRequest {
            client_mtu: ATT_MAX_MTU,
        });
        let reply = self.send_with_reply(&req, self.config.initial_reply_timeout)?;
        match reply.pdu {
            AttPdu::ExchangeMtuRsp(rsp) => {
                let used = rsp.server_mtu.clamp(ATT_MIN_MTU, ATT_MAX_MTU);
                self.server_mtu.store(rsp.server_mtu, Ordering::SeqCst);
                self.used_mtu.store(used, Ordering::SeqCst);
                debug!("{}: MTU exchanged, using {}", self.peer, used);
            }
            AttPdu::Error(e) if e.error_code == AttErrorCode::RequestNotSupported => {
                // peer has no MTU exchange, the default applies
                debug!("{}: MTU exchange unsupported, using {}", self.peer, ATT_MIN_MTU);
            }
            AttPdu::Error(e) => {
                warn!(
                    "{}: MTU exchange failed with {:?}, keeping {}",
                    self.peer, e.error_code, ATT_MIN_MTU
                );
            }
            other => {
                warn!(
                    "{}: unexpected MTU exchange reply {}, keeping {}",
                    self.peer,
                    other.name(),
                    ATT_MIN_MTU
                );
            }
        }
        Ok(())
    }

    /// Repeated `READ_BY_GROUP_TYPE_REQ` walk over the full handle range.
    /// Terminates on `ERROR_RSP` or when the last end handle is 0xFFFF.
    fn discover_primary_services(&self) -> GattResult<Vec<Service>> {
        let mut services = Vec::new();
        let mut start_handle = ATT_HANDLE_MIN;
        loop {
            let req = AttPdu::ReadByGroupTypeReq(ReadByGroupTypeRequest {
                start_handle,
                end_handle: ATT_HANDLE_MAX,
                group_type: Uuid::from_u16(GATT_PRIMARY_SERVICE_UUID),
            });
            let reply = self.send_with_reply(&req, self.config.read_reply_timeout)?;
            match reply.pdu {
                AttPdu::ReadByGroupTypeRsp(rsp) => {
                    for e in &rsp.elements {
                        let uuid =
                            Uuid::try_from_slice_le(&e.value).ok_or(MalformedPdu)?;
                        services.push(Service {
                            primary: true,
                            start_handle: e.handle,
                            end_handle: e.end_group_handle,
                            uuid,
                            characteristics: Vec::new(),
                        });
                    }
                    // parse guarantees at least one element
                    let last_end = rsp.elements.last().map(|e| e.end_group_handle).unwrap_or(0);
                    if last_end < ATT_HANDLE_MAX {
                        start_handle = last_end + 1;
                    } else {
                        break;
                    }
                }
                AttPdu::Error(_) => break,
                other => {
                    warn!(
                        "{}: unexpected service discovery reply {}",
                        self.peer,
                        other.name()
                    );
                    break;
                }
            }
        }
        Ok(services)
    }

    /// Repeated `READ_BY_TYPE_REQ(CHARACTERISTIC)` walk over one service.
    fn discover_characteristics(&self, service: &mut Service) -> GattResult<bool> {
        let mut handle = service.start_handle;
        service.characteristics.clear();
        loop {
            let req = AttPdu::ReadByTypeReq(ReadByTypeRequest {
                start_handle: handle,
                end_handle: service.end_handle,
                attribute_type: Uuid::from_u16(GATT_CHARACTERISTIC_UUID),
            });
            let reply = self.send_with_reply(&req, self.config.read_reply_timeout)?;
            match reply.pdu {
                AttPdu::ReadByTypeRsp(rsp) => {
                    for e in &rsp.elements {
                        // declaration value: properties, value handle, value type
                        if e.value.len() < 5 {
                            warn!(
                                "{}: short characteristic declaration at {:#06x}",
                                self.peer, e.handle
                            );
                            continue;
                        }
                        let properties = CharProps::from_bits_truncate(e.value[0]);
                        let value_handle = u16::from_le_bytes([e.value[1], e.value[2]]);
                        let uuid =
                            Uuid::try_from_slice_le(&e.value[3..]).ok_or(MalformedPdu)?;
                        service.characteristics.push(Characteristic {
                            handle: e.handle,
                            value_handle,
                            end_handle: service.end_handle,
                            uuid,
                            properties,
                            descriptors: Vec::new(),
                            ccc_index: None,
                        });
                    }
                    let last = rsp.elements.last().map(|e| e.handle).unwrap_or(0);
                    if last < service.end_handle {
                        handle = last + 1;
                    } else {
                        break;
                    }
                }
                AttPdu::Error(_) => break,
                other => {
                    warn!(
                        "{}: unexpected characteristic discovery reply {}",
                        self.peer,
                        other.name()
                    );
                    break;
                }
            }
        }
        // each characteristic ends right before the next declaration
        let count = service.characteristics.len();
        for i in 0..count {
            service.characteristics[i].end_handle = if i + 1 < count {
                service.characteristics[i + 1].handle - 1
            } else {
                service.end_handle
            };
        }
        Ok(count > 0)
    }

    /// Repeated `FIND_INFORMATION_REQ` walks over each characteristic's
    /// descriptor range, reading every descriptor value as it is found.
    fn discover_descriptors(&self, service: &mut Service) -> GattResult<()> {
        for ci in 0..service.characteristics.len() {
            let (value_handle, range_end) = {
                let c = &service.characteristics[ci];
                (c.value_handle, c.end_handle)
            };
            let mut start = value_handle + 1;
            let mut descriptors = Vec::new();
            let mut ccc_index = None;

            'scan: while start <= range_end {
                let req = AttPdu::FindInformationReq(FindInformationRequest {
                    start_handle: start,
                    end_handle: range_end,
                });
                let reply = self.send_with_reply(&req, self.config.read_reply_timeout)?;
                match reply.pdu {
                    AttPdu::FindInformationRsp(rsp) => {
                        for (handle, uuid) in &rsp.entries {
                            if *handle <= value_handle || *handle > range_end {
                                error!(
                                    "{}: descriptor handle {:#06x} outside ]{:#06x}..{:#06x}]",
                                    self.peer, handle, value_handle, range_end
                                );
                                break 'scan;
                            }
                            let value = match self.read_value(*handle, 0) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!(
                                        "{}: descriptor {:#06x} value read failed: {}",
                                        self.peer, handle, e
                                    );
                                    break 'scan;
                                }
                            };
                            let descriptor = Descriptor {
                                handle: *handle,
                                uuid: *uuid,
                                value,
                            };
                            if descriptor.is_client_char_config() {
                                ccc_index = Some(descriptors.len());
                            }
                            descriptors.push(descriptor);
                        }
                        let last = rsp.entries.last().map(|(h, _)| *h).unwrap_or(0);
                        if last < range_end {
                            start = last + 1;
                        } else {
                            break;
                        }
                    }
                    AttPdu::Error(_) => break,
                    other => {
                        warn!(
                            "{}: unexpected descriptor discovery reply {}",
                            self.peer,
                            other.name()
                        );
                        break;
                    }
                }
            }

            let c = &mut service.characteristics[ci];
            c.descriptors = descriptors;
            c.ccc_index = ccc_index;
        }
        Ok(())
    }

    /// Long-read loop: `READ_REQ` for the first chunk, `READ_BLOB_REQ`
    /// for subsequent offsets.
    pub(crate) fn read_value(&self, handle: u16, expected_length: i32) -> GattResult<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        loop {
            if expected_length > 0 && out.len() >= expected_length as usize {
                break;
            }
            if expected_length == 0 && !out.is_empty() {
                break;
            }
            let req = if out.is_empty() {
                AttPdu::ReadReq(ReadRequest { handle })
            } else {
                AttPdu::ReadBlobReq(ReadBlobRequest {
                    handle,
                    offset: out.len() as u16,
                })
            };
            let reply = self.send_with_reply(&req, self.config.read_reply_timeout)?;
            let max_chunk = self.used_mtu.load(Ordering::SeqCst) as usize - 1;
            match reply.pdu {
                AttPdu::ReadRsp(rsp) => {
                    let n = rsp.value.len();
                    out.extend_from_slice(&rsp.value);
                    if n < max_chunk {
                        break;
                    }
                }
                AttPdu::ReadBlobRsp(rsp) => {
                    if rsp.value.is_empty() {
                        break;
                    }
                    let n = rsp.value.len();
                    out.extend_from_slice(&rsp.value);
                    if n < max_chunk {
                        break;
                    }
                }
                AttPdu::Error(e) if e.error_code == AttErrorCode::AttributeNotLong => break,
                AttPdu::Error(e) => {
                    if out.is_empty() {
                        return Err(GattError::Att {
                            code: e.error_code,
                            handle: e.handle,
                        });
                    }
                    warn!(
                        "{}: read at offset {} failed with {:?}",
                        self.peer,
                        out.len(),
                        e.error_code
                    );
                    break;
                }
                other => {
                    warn!("{}: unexpected read reply {}", self.peer, other.name());
                    if out.is_empty() {
                        return Err(GattError::UnexpectedReply(other.opcode()));
                    }
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Single-PDU write, acknowledged (`WRITE_REQ`) or not (`WRITE_CMD`).
    pub(crate) fn write_value(
        &self,
        handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> GattResult<()> {
        if value.is_empty() {
            return Err(GattError::InvalidArgument("empty write value".into()));
        }
        let used = self.used_mtu.load(Ordering::SeqCst) as usize;
        if value.len() > used - 3 {
            return Err(GattError::TooLarge(value.len()));
        }

        if !with_response {
            return self.send_frame(&AttPdu::WriteCmd(WriteCommand {
                handle,
                value: value.to_vec(),
            }));
        }

        let reply = self.send_with_reply(
            &AttPdu::WriteReq(WriteRequest {
                handle,
                value: value.to_vec(),
            }),
            self.config.write_reply_timeout,
        )?;
        match reply.pdu {
            AttPdu::WriteRsp(_) => Ok(()),
            AttPdu::Error(e) => Err(GattError::Att {
                code: e.error_code,
                handle: e.handle,
            }),
            other => Err(GattError::UnexpectedReply(other.opcode())),
        }
    }

    fn check_server_value_handle(&self, value_handle: u16) -> GattResult<()> {
        if self.role != GattRole::Server {
            return Err(GattError::InvalidArgument(
                "not in server role".into(),
            ));
        }
        let db = self
            .server_db
            .as_ref()
            .ok_or(GattError::NotAvailable)?
            .lock()
            .unwrap();
        if !db.is_value_handle(value_handle) {
            return Err(GattError::InvalidArgument(format!(
                "handle {:#06x} is not a characteristic value",
                value_handle
            )));
        }
        Ok(())
    }

    fn find_characteristic_by_value_handle(&self, value_handle: u16) -> Option<Characteristic> {
        let services = self.services.lock().unwrap();
        for s in services.iter() {
            for c in &s.characteristics {
                if c.value_handle == value_handle {
                    return Some(c.clone());
                }
            }
        }
        None
    }

    fn handle_notification(&self, inbound: &Inbound) {
        let (handle, value) = match &inbound.pdu {
            AttPdu::ValueNtf(n) => (n.handle, &n.value),
            _ => return,
        };
        let Some(characteristic) = self.find_characteristic_by_value_handle(handle) else {
            debug!(
                "{}: notification for unknown value handle {:#06x}",
                self.peer, handle
            );
            return;
        };
        let listeners = self.listeners.snapshot();
        for l in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if l.matches(&characteristic) {
                    l.on_notification(&characteristic, value, inbound.ts_creation);
                }
            }));
            if outcome.is_err() {
                error!("{}: listener panicked in notification callback", self.peer);
            }
        }
    }

    fn handle_indication(&self, inbound: &Inbound) {
        let (handle, value) = match &inbound.pdu {
            AttPdu::ValueInd(i) => (i.handle, &i.value),
            _ => return,
        };
        let mut cfm_sent = false;
        if self.send_indication_confirmation.load(Ordering::SeqCst) {
            match self.send_frame(&AttPdu::ValueCfm(HandleValueConfirmation)) {
                Ok(()) => cfm_sent = true,
                Err(e) => warn!("{}: could not confirm indication: {}", self.peer, e),
            }
        }
        let Some(characteristic) = self.find_characteristic_by_value_handle(handle) else {
            debug!(
                "{}: indication for unknown value handle {:#06x}",
                self.peer, handle
            );
            return;
        };
        let listeners = self.listeners.snapshot();
        for l in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if l.matches(&characteristic) {
                    l.on_indication(&characteristic, value, inbound.ts_creation, cfm_sent);
                }
            }));
            if outcome.is_err() {
                error!("{}: listener panicked in indication callback", self.peer);
            }
        }
    }

    fn dispatch_inbound(&self, inbound: Inbound) {
        if self.config.debug_data {
            debug!("{}: recv {}", self.peer, inbound.pdu.name());
        }
        if matches!(inbound.pdu, AttPdu::ValueNtf(_)) {
            self.handle_notification(&inbound);
            return;
        }
        if matches!(inbound.pdu, AttPdu::ValueInd(_)) {
            self.handle_indication(&inbound);
            return;
        }
        match inbound.pdu.pdu_type() {
            PduType::Request | PduType::Command => {
                if self.role == GattRole::Server {
                    self.handle_server_pdu(&inbound.pdu);
                } else {
                    debug!(
                        "{}: dropping {} in client role",
                        self.peer,
                        inbound.pdu.name()
                    );
                }
            }
            PduType::Response | PduType::Confirmation => self.ring.put_blocking(inbound),
            _ => warn!(
                "{}: dropping unhandled PDU {} ({:#04x})",
                self.peer,
                inbound.pdu.name(),
                inbound.pdu.opcode()
            ),
        }
    }

    /// Tears the session down. Entered exactly once via the connection
    /// CAS; later calls only clear listeners. Never takes the transaction
    /// lock, so it is safe to call from a failed transaction that still
    /// holds it, and it skips the reader join when called from the reader
    /// itself.
    pub(crate) fn disconnect(&self, disconnect_device: bool, io_error_cause: bool) -> bool {
        // aborts any in-flight transport read/write
        self.transport.close();

        if self
            .is_connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.listeners.clear();
            return false;
        }
        debug!(
            "{}: disconnect, device {}, ioerror {}",
            self.peer, disconnect_device, io_error_cause
        );
        self.listeners.clear();
        self.reader_should_stop.store(true, Ordering::SeqCst);
        // unblock a reader stuck on a full ring
        self.ring.clear();
        {
            let mut ctl = self.reader_ctl.lock().unwrap();
            let is_reader = ctl.tid == Some(thread::current().id());
            if !is_reader {
                while ctl.running {
                    ctl = self.reader_cv.wait(ctl).unwrap();
                }
            }
        }
        if disconnect_device {
            if let Some(device) = self.device.upgrade() {
                device.disconnect(if io_error_cause {
                    DisconnectReason::IoError
                } else {
                    DisconnectReason::UserTerminated
                });
            }
        }
        true
    }
}

/// The reader: one PDU per transport read, classified and dispatched.
fn reader_loop(inner: Arc<SessionInner>) {
    {
        let mut ctl = inner.reader_ctl.lock().unwrap();
        ctl.running = true;
        ctl.tid = Some(thread::current().id());
        inner.reader_cv.notify_all();
    }
    debug!("{}: reader started", inner.peer);

    let mut buf = vec![0u8; ATT_MAX_MTU as usize];
    let mut io_failed = false;
    while !inner.reader_should_stop.load(Ordering::SeqCst) {
        if !inner.validate_connected() {
            io_failed = true;
            break;
        }
        match inner.transport.read(&mut buf) {
            Ok(n) => match Inbound::parse(&buf[..n]) {
                Ok(inbound) => inner.dispatch_inbound(inbound),
                Err(_) => warn!("{}: dropping malformed {}-byte frame", inner.peer, n),
            },
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Interrupted) | Err(TransportError::NotOpen) => break,
            Err(e) => {
                if !inner.reader_should_stop.load(Ordering::SeqCst) {
                    error!("{}: reader transport failure: {}", inner.peer, e);
                    inner.has_ioerror.store(true, Ordering::SeqCst);
                    io_failed = true;
                }
                break;
            }
        }
    }

    inner.ring.clear();
    {
        let mut ctl = inner.reader_ctl.lock().unwrap();
        ctl.running = false;
        inner.reader_cv.notify_all();
    }
    debug!("{}: reader stopped", inner.peer);
    let io_error_cause = io_failed || inner.has_ioerror.load(Ordering::SeqCst);
    inner.disconnect(true, io_error_cause);
}
