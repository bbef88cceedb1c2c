//! Integration tests for the GATT session
//!
//! S1..S3 run a client session against a scripted peer; S4..S6 run two
//! real sessions (client and server) over the in-memory duplex transport.
use super::config::GattConfig;
use super::db::{DbCharacteristic, DbDescriptor, DbService, GattDb, ServerListener};
use super::listener::CharListener;
use super::session::GattSession;
use super::types::{CharProps, Characteristic, GattRole};
use crate::att::constants::*;
use crate::att::pdu::*;
use crate::att::AttErrorCode;
use crate::device::{AddressType, BdAddr, DeviceLink, DisconnectReason};
use crate::error::GattError;
use crate::l2cap::{SecurityLevel, Transport, TransportError};
use crate::uuid::Uuid;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// One direction of the duplex transport: a frame queue with a condvar.
struct MailBox {
    queue: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
    closed: AtomicBool,
}

impl MailBox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        self.queue.lock().unwrap().push_back(frame);
        self.cv.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }
}

/// In-memory frame-oriented transport; `pair()` returns both ends.
struct DuplexTransport {
    rx: Arc<MailBox>,
    tx: Arc<MailBox>,
    open: AtomicBool,
    ioerror: AtomicBool,
}

impl DuplexTransport {
    fn pair() -> (Arc<DuplexTransport>, Arc<DuplexTransport>) {
        let ab = Arc::new(MailBox::new());
        let ba = Arc::new(MailBox::new());
        let a = Arc::new(DuplexTransport {
            rx: Arc::clone(&ba),
            tx: Arc::clone(&ab),
            open: AtomicBool::new(true),
            ioerror: AtomicBool::new(false),
        });
        let b = Arc::new(DuplexTransport {
            rx: ab,
            tx: ba,
            open: AtomicBool::new(true),
            ioerror: AtomicBool::new(false),
        });
        (a, b)
    }
}

impl Transport for DuplexTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn has_ioerror(&self) -> bool {
        self.ioerror.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rx.close();
        self.tx.close();
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        match self.rx.pop(Duration::from_millis(50)) {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => {
                if !self.is_open() {
                    Err(TransportError::Interrupted)
                } else if self.rx.closed.load(Ordering::SeqCst) {
                    self.ioerror.store(true, Ordering::SeqCst);
                    Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed",
                    )))
                } else {
                    Err(TransportError::Timeout)
                }
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.tx.closed.load(Ordering::SeqCst) {
            self.ioerror.store(true, Ordering::SeqCst);
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer closed",
            )));
        }
        self.tx.push(buf.to_vec());
        Ok(buf.len())
    }

    fn set_security_level(&self, _level: SecurityLevel) -> bool {
        true
    }

    fn state_string(&self) -> String {
        format!("State[open {}, ioerror {}]", self.is_open(), self.has_ioerror())
    }
}

struct MockDevice {
    addr: BdAddr,
    disconnects: Mutex<Vec<DisconnectReason>>,
}

impl MockDevice {
    fn new() -> Arc<MockDevice> {
        Arc::new(MockDevice {
            addr: BdAddr::from_str("00:11:22:33:44:55").unwrap(),
            disconnects: Mutex::new(Vec::new()),
        })
    }
}

impl DeviceLink for MockDevice {
    fn address_and_type(&self) -> (BdAddr, AddressType) {
        (self.addr, AddressType::Public)
    }

    fn disconnect(&self, reason: DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason);
    }
}

fn device_link(device: &Arc<MockDevice>) -> Weak<dyn DeviceLink> {
    let weak: Weak<MockDevice> = Arc::downgrade(device);
    weak
}

fn peer_recv(t: &DuplexTransport) -> AttPdu {
    let mut buf = [0u8; 1024];
    loop {
        match t.read(&mut buf) {
            Ok(n) => return AttPdu::parse(&buf[..n]).expect("peer received malformed frame"),
            Err(TransportError::Timeout) => continue,
            Err(e) => panic!("peer read failed: {}", e),
        }
    }
}

fn peer_send(t: &DuplexTransport, pdu: &AttPdu) {
    t.write(&pdu.serialize()).expect("peer write failed");
}

/// Runs a scripted peer: for each step, receive one PDU, assert its
/// opcode, send the canned response.
fn scripted_peer(
    transport: Arc<DuplexTransport>,
    script: Vec<(u8, AttPdu)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for (expected_opcode, response) in script {
            let req = peer_recv(&transport);
            assert_eq!(
                req.opcode(),
                expected_opcode,
                "peer expected {} but got {}",
                opcode_name(expected_opcode),
                req.name()
            );
            peer_send(&transport, &response);
        }
    })
}

fn wait_until(what: &str, deadline: Duration, f: impl Fn() -> bool) {
    let start = Instant::now();
    while !f() {
        assert!(start.elapsed() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn mtu_unsupported_rsp() -> AttPdu {
    AttPdu::Error(ErrorResponse {
        request_opcode: ATT_EXCHANGE_MTU_REQ,
        handle: 0,
        error_code: AttErrorCode::RequestNotSupported,
    })
}

fn not_found_rsp(request_opcode: u8) -> AttPdu {
    AttPdu::Error(ErrorResponse {
        request_opcode,
        handle: 0,
        error_code: AttErrorCode::AttributeNotFound,
    })
}

// S1: a server that rejects MTU exchange leaves the client at the minimum
// MTU, still connected and able to write.
#[test]
fn mtu_exchange_falls_back_to_minimum_on_unsupported_request() {
    let (client_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();

    let peer = scripted_peer(
        peer_end,
        vec![
            (ATT_EXCHANGE_MTU_REQ, mtu_unsupported_rsp()),
            (ATT_WRITE_REQ, AttPdu::WriteRsp(WriteResponse)),
        ],
    );

    let session = GattSession::new(
        client_end,
        GattRole::Client,
        device_link(&device),
        None,
        GattConfig::default(),
    )
    .expect("session must come up despite MTU rejection");

    assert!(session.is_connected());
    assert_eq!(session.get_used_mtu(), ATT_MIN_MTU);

    // a write request whose parameters total 21 bytes fits MTU 23
    let characteristic = Characteristic {
        handle: 0x0009,
        value_handle: 0x000A,
        end_handle: 0x000A,
        uuid: Uuid::from_u16(0xA00B),
        properties: CharProps::WRITE,
        descriptors: vec![],
        ccc_index: None,
    };
    session
        .write_characteristic_value(&characteristic, &[0x42; 19])
        .expect("small write must succeed at minimum MTU");

    // anything beyond used_mtu - 3 value bytes is rejected locally
    let err = session
        .write_characteristic_value(&characteristic, &[0x42; 21])
        .unwrap_err();
    assert!(matches!(err, GattError::TooLarge(21)));

    peer.join().unwrap();
    session.close();
}

// S2: primary service discovery paginates until the end handle 0xFFFF.
#[test]
fn primary_service_discovery_paginates_to_end_of_range() {
    let (client_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();

    let group_rsp = |start: u16, end: u16, uuid16: u16| {
        AttPdu::ReadByGroupTypeRsp(ReadByGroupTypeResponse {
            element_len: 6,
            elements: vec![GroupElement {
                handle: start,
                end_group_handle: end,
                value: uuid16.to_le_bytes().to_vec(),
            }],
        })
    };
    let peer = scripted_peer(
        peer_end,
        vec![
            (ATT_EXCHANGE_MTU_REQ, mtu_unsupported_rsp()),
            (ATT_READ_BY_GROUP_TYPE_REQ, group_rsp(1, 7, 0x1800)),
            (ATT_READ_BY_GROUP_TYPE_REQ, group_rsp(8, 11, 0x180A)),
            (ATT_READ_BY_GROUP_TYPE_REQ, group_rsp(12, 0xFFFF, 0x180F)),
            (ATT_READ_BY_TYPE_REQ, not_found_rsp(ATT_READ_BY_TYPE_REQ)),
            (ATT_READ_BY_TYPE_REQ, not_found_rsp(ATT_READ_BY_TYPE_REQ)),
            (ATT_READ_BY_TYPE_REQ, not_found_rsp(ATT_READ_BY_TYPE_REQ)),
        ],
    );

    let session = GattSession::new(
        client_end,
        GattRole::Client,
        device_link(&device),
        None,
        GattConfig::default(),
    )
    .unwrap();

    let services = session.discover_complete_primary_services().unwrap();
    assert_eq!(services.len(), 3);
    assert_eq!(
        (services[0].start_handle, services[0].end_handle),
        (1, 7)
    );
    assert_eq!(
        (services[1].start_handle, services[1].end_handle),
        (8, 11)
    );
    assert_eq!(
        (services[2].start_handle, services[2].end_handle),
        (12, 0xFFFF)
    );
    assert_eq!(services[2].uuid, 0x180Fu16);

    peer.join().unwrap();
    session.close();
}

// S3: an 85-byte value at MTU 23 takes one READ_REQ plus three
// READ_BLOB_REQs; the short 19-byte chunk terminates the loop.
#[test]
fn long_read_accumulates_blob_chunks() {
    let (client_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();

    let value: Vec<u8> = (0u8..85).collect();
    let peer = scripted_peer(
        peer_end,
        vec![
            (
                ATT_EXCHANGE_MTU_REQ,
                AttPdu::ExchangeMtuRsp(ExchangeMtuResponse { server_mtu: 23 }),
            ),
            (
                ATT_READ_REQ,
                AttPdu::ReadRsp(ReadResponse {
                    value: value[..22].to_vec(),
                }),
            ),
            (
                ATT_READ_BLOB_REQ,
                AttPdu::ReadBlobRsp(ReadBlobResponse {
                    value: value[22..44].to_vec(),
                }),
            ),
            (
                ATT_READ_BLOB_REQ,
                AttPdu::ReadBlobRsp(ReadBlobResponse {
                    value: value[44..66].to_vec(),
                }),
            ),
            (
                ATT_READ_BLOB_REQ,
                AttPdu::ReadBlobRsp(ReadBlobResponse {
                    value: value[66..85].to_vec(),
                }),
            ),
        ],
    );

    let session = GattSession::new(
        client_end,
        GattRole::Client,
        device_link(&device),
        None,
        GattConfig::default(),
    )
    .unwrap();
    assert_eq!(session.get_used_mtu(), 23);

    let read = session.read_value(0x0040, -1).unwrap();
    assert_eq!(read, value);

    peer.join().unwrap();
    session.close();
}

fn test_db() -> Arc<Mutex<GattDb>> {
    let mut db = GattDb::new();
    db.add_service(DbService::new(
        true,
        Uuid::from_u16(0xA00A),
        vec![DbCharacteristic::new(
            Uuid::from_u16(0xA00B),
            CharProps::READ | CharProps::WRITE | CharProps::NOTIFY | CharProps::INDICATE,
            vec![0x00, 0x00],
            true,
            vec![
                DbDescriptor::client_char_config(),
                DbDescriptor::user_description("Data"),
            ],
        )],
    ));
    db.assign_handles();
    Arc::new(Mutex::new(db))
}

// Handle numbering: one contiguous pass, nested ranges, uniqueness.
#[test]
fn handle_assignment_is_contiguous_and_nested() {
    let db = test_db();
    let db = db.lock().unwrap();
    let s = &db.services[0];
    let c = &s.characteristics[0];
    assert_eq!(s.handle, 1);
    assert_eq!(c.handle, 2);
    assert_eq!(c.value_handle, 3);
    assert_eq!(c.descriptors[0].handle, 4);
    assert_eq!(c.descriptors[1].handle, 5);
    assert_eq!(c.end_handle, 5);
    assert_eq!(s.end_handle, 5);
    assert!(s.handle <= c.handle);
    assert!(c.handle < c.value_handle);
    assert!(c.value_handle <= c.end_handle);
    assert!(c.end_handle <= s.end_handle);
    assert_eq!(c.ccc_index, Some(0));
    assert_eq!(c.user_description_index, Some(1));
}

#[test]
fn handle_assignment_spans_multiple_services() {
    let mut db = GattDb::new();
    db.add_service(DbService::new(
        true,
        Uuid::from_u16(0x1800),
        vec![
            DbCharacteristic::new(
                Uuid::from_u16(GATT_DEVICE_NAME_UUID),
                CharProps::READ,
                b"demo".to_vec(),
                true,
                vec![],
            ),
            DbCharacteristic::new(
                Uuid::from_u16(GATT_APPEARANCE_UUID),
                CharProps::READ,
                vec![0, 0],
                false,
                vec![],
            ),
        ],
    ));
    db.add_service(DbService::new(
        true,
        Uuid::from_u16(0x180F),
        vec![DbCharacteristic::new(
            Uuid::from_u16(0x2A19),
            CharProps::READ | CharProps::NOTIFY,
            vec![100],
            false,
            vec![DbDescriptor::client_char_config()],
        )],
    ));
    let count = db.assign_handles();
    assert_eq!(count, 9);
    assert_eq!(db.services[0].handle, 1);
    assert_eq!(db.services[0].end_handle, 5);
    assert_eq!(db.services[1].handle, 6);
    assert_eq!(db.services[1].end_handle, 9);

    // every handle unique
    let mut handles = Vec::new();
    for s in &db.services {
        handles.push(s.handle);
        for c in &s.characteristics {
            handles.push(c.handle);
            handles.push(c.value_handle);
            for d in &c.descriptors {
                handles.push(d.handle);
            }
        }
    }
    let mut deduped = handles.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), handles.len());
}

// S4: prepared writes commit in order; cancel discards without effect.
#[test]
fn prepared_write_commit_and_cancel() {
    let (server_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();
    let db = test_db();
    let value_handle = 3u16;

    let session = GattSession::new(
        server_end,
        GattRole::Server,
        device_link(&device),
        Some(Arc::clone(&db)),
        GattConfig::default(),
    )
    .unwrap();

    // stage two fragments
    peer_send(
        &peer_end,
        &AttPdu::PrepareWriteReq(PrepareWriteRequest {
            handle: value_handle,
            offset: 0,
            value: vec![0x01, 0x02],
        }),
    );
    let rsp = peer_recv(&peer_end);
    assert_eq!(
        rsp,
        AttPdu::PrepareWriteRsp(PrepareWriteResponse {
            handle: value_handle,
            offset: 0,
            value: vec![0x01, 0x02],
        })
    );
    peer_send(
        &peer_end,
        &AttPdu::PrepareWriteReq(PrepareWriteRequest {
            handle: value_handle,
            offset: 2,
            value: vec![0x03, 0x04],
        }),
    );
    assert_eq!(
        peer_recv(&peer_end),
        AttPdu::PrepareWriteRsp(PrepareWriteResponse {
            handle: value_handle,
            offset: 2,
            value: vec![0x03, 0x04],
        })
    );

    // commit
    peer_send(
        &peer_end,
        &AttPdu::ExecuteWriteReq(ExecuteWriteRequest {
            flags: ATT_EXEC_WRITE_COMMIT,
        }),
    );
    assert_eq!(peer_recv(&peer_end), AttPdu::ExecuteWriteRsp(ExecuteWriteResponse));
    assert_eq!(
        db.lock().unwrap().services[0].characteristics[0].value,
        vec![0x01, 0x02, 0x03, 0x04]
    );

    // stage an entry that would fail, then cancel: no side effects
    peer_send(
        &peer_end,
        &AttPdu::PrepareWriteReq(PrepareWriteRequest {
            handle: value_handle,
            offset: 60,
            value: vec![0xFF],
        }),
    );
    assert!(matches!(peer_recv(&peer_end), AttPdu::PrepareWriteRsp(_)));
    peer_send(
        &peer_end,
        &AttPdu::ExecuteWriteReq(ExecuteWriteRequest {
            flags: ATT_EXEC_WRITE_CANCEL,
        }),
    );
    assert_eq!(peer_recv(&peer_end), AttPdu::ExecuteWriteRsp(ExecuteWriteResponse));
    assert_eq!(
        db.lock().unwrap().services[0].characteristics[0].value,
        vec![0x01, 0x02, 0x03, 0x04]
    );

    session.close();
}

// A commit whose entry violates the apply-write rules reports the
// offending handle and clears the queue.
#[test]
fn prepared_write_commit_failure_reports_offending_handle() {
    let (server_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();
    let db = test_db();

    let session = GattSession::new(
        server_end,
        GattRole::Server,
        device_link(&device),
        Some(Arc::clone(&db)),
        GattConfig::default(),
    )
    .unwrap();

    // offset beyond the current length
    peer_send(
        &peer_end,
        &AttPdu::PrepareWriteReq(PrepareWriteRequest {
            handle: 3,
            offset: 40,
            value: vec![0xFF],
        }),
    );
    assert!(matches!(peer_recv(&peer_end), AttPdu::PrepareWriteRsp(_)));
    peer_send(
        &peer_end,
        &AttPdu::ExecuteWriteReq(ExecuteWriteRequest {
            flags: ATT_EXEC_WRITE_COMMIT,
        }),
    );
    assert_eq!(
        peer_recv(&peer_end),
        AttPdu::Error(ErrorResponse {
            request_opcode: ATT_EXECUTE_WRITE_REQ,
            handle: 3,
            error_code: AttErrorCode::InvalidOffset,
        })
    );

    session.close();
}

struct RecordingListener {
    accept: Box<dyn Fn(&Characteristic) -> bool + Send + Sync>,
    notifications: Mutex<Vec<(u16, Vec<u8>)>>,
    indications: Mutex<Vec<(u16, Vec<u8>, bool)>>,
}

impl RecordingListener {
    fn accepting_all() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            accept: Box::new(|_| true),
            notifications: Mutex::new(Vec::new()),
            indications: Mutex::new(Vec::new()),
        })
    }

    fn rejecting_all() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            accept: Box::new(|_| false),
            notifications: Mutex::new(Vec::new()),
            indications: Mutex::new(Vec::new()),
        })
    }
}

impl CharListener for RecordingListener {
    fn matches(&self, characteristic: &Characteristic) -> bool {
        (self.accept)(characteristic)
    }

    fn on_notification(&self, characteristic: &Characteristic, data: &[u8], _ts: Instant) {
        self.notifications
            .lock()
            .unwrap()
            .push((characteristic.value_handle, data.to_vec()));
    }

    fn on_indication(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        _ts: Instant,
        cfm_sent: bool,
    ) {
        self.indications
            .lock()
            .unwrap()
            .push((characteristic.value_handle, data.to_vec(), cfm_sent));
    }
}

#[derive(Default)]
struct CccRecorder {
    changes: Mutex<Vec<(u16, bool, bool)>>,
}

impl ServerListener for CccRecorder {
    fn ccc_changed(
        &self,
        _s: &DbService,
        c: &DbCharacteristic,
        notify: bool,
        indicate: bool,
    ) {
        self.changes
            .lock()
            .unwrap()
            .push((c.value_handle, notify, indicate));
    }
}

struct Loopback {
    client: GattSession,
    server: GattSession,
    db: Arc<Mutex<GattDb>>,
    ccc_recorder: Arc<CccRecorder>,
    _client_device: Arc<MockDevice>,
    _server_device: Arc<MockDevice>,
}

/// Brings up a full client/server pair over the duplex transport and runs
/// complete discovery on the client.
fn loopback() -> Loopback {
    let (client_end, server_end) = DuplexTransport::pair();
    let client_device = MockDevice::new();
    let server_device = MockDevice::new();
    let db = test_db();
    let ccc_recorder = Arc::new(CccRecorder::default());
    {
        let listener: Arc<dyn ServerListener> = ccc_recorder.clone();
        db.lock().unwrap().add_listener(listener);
    }

    let server = GattSession::new(
        server_end,
        GattRole::Server,
        device_link(&server_device),
        Some(Arc::clone(&db)),
        GattConfig::default(),
    )
    .unwrap();
    let client = GattSession::new(
        client_end,
        GattRole::Client,
        device_link(&client_device),
        None,
        GattConfig::default(),
    )
    .unwrap();

    let services = client.discover_complete_primary_services().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].characteristics.len(), 1);

    Loopback {
        client,
        server,
        db,
        ccc_recorder,
        _client_device: client_device,
        _server_device: server_device,
    }
}

#[test]
fn loopback_discovery_and_mtu_negotiation() {
    let lb = loopback();
    // both sides settle on the maximum
    assert_eq!(lb.client.get_used_mtu(), ATT_MAX_MTU);
    assert_eq!(lb.server.get_used_mtu(), ATT_MAX_MTU);

    let services = lb.client.get_services();
    let c = &services[0].characteristics[0];
    assert_eq!(c.handle, 2);
    assert_eq!(c.value_handle, 3);
    assert_eq!(c.end_handle, 5);
    assert!(c.properties.contains(CharProps::NOTIFY));
    assert_eq!(c.descriptors.len(), 2);
    assert_eq!(c.ccc_index, Some(0));
    let user_desc = &c.descriptors[1];
    assert_eq!(user_desc.value, b"Data".to_vec());

    lb.client.close();
    lb.server.close();
}

#[test]
fn loopback_read_and_write_roundtrip() {
    let lb = loopback();
    let services = lb.client.get_services();
    let c = services[0].characteristics[0].clone();

    lb.client
        .write_characteristic_value(&c, &[0xDE, 0xAD, 0xBE, 0xEF])
        .unwrap();
    assert_eq!(
        lb.db.lock().unwrap().services[0].characteristics[0].value,
        vec![0xDE, 0xAD, 0xBE, 0xEF]
    );
    let read = lb.client.read_characteristic_value(&c, -1).unwrap();
    assert_eq!(read, vec![0xDE, 0xAD, 0xBE, 0xEF]);

    // user descriptions are read-only to clients
    let user_desc = c.descriptors[1].clone();
    let err = lb
        .client
        .write_descriptor_value(&user_desc, b"nope")
        .unwrap_err();
    assert!(matches!(
        err,
        GattError::Att {
            code: AttErrorCode::WriteNotPermitted,
            ..
        }
    ));

    lb.client.close();
    lb.server.close();
}

// S5: enabling notifications fires the config-changed callback once and
// routes notifications exactly to matching listeners.
#[test]
fn ccc_enable_and_notification_fan_out() {
    let lb = loopback();
    let services = lb.client.get_services();
    let c = services[0].characteristics[0].clone();
    let cccd = c.client_char_config().unwrap().clone();

    let matching = RecordingListener::accepting_all();
    let non_matching = RecordingListener::rejecting_all();
    assert!(lb.client.add_char_listener(matching.clone()));
    assert!(lb.client.add_char_listener(non_matching.clone()));
    // duplicate registration is refused
    assert!(!lb.client.add_char_listener(matching.clone()));

    assert!(lb
        .client
        .configure_notification_indication(&cccd, true, false)
        .unwrap());
    wait_until("ccc change callback", Duration::from_secs(2), || {
        !lb.ccc_recorder.changes.lock().unwrap().is_empty()
    });
    assert_eq!(
        lb.ccc_recorder.changes.lock().unwrap().as_slice(),
        &[(3, true, false)]
    );

    // rewriting the same encoded value emits no second callback
    assert!(lb
        .client
        .configure_notification_indication(&cccd, true, false)
        .unwrap());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(lb.ccc_recorder.changes.lock().unwrap().len(), 1);

    lb.server.send_notification(3, &[0xAA, 0xBB]).unwrap();
    wait_until("notification delivery", Duration::from_secs(2), || {
        !matching.notifications.lock().unwrap().is_empty()
    });
    assert_eq!(
        matching.notifications.lock().unwrap().as_slice(),
        &[(3, vec![0xAA, 0xBB])]
    );
    assert!(non_matching.notifications.lock().unwrap().is_empty());

    lb.client.close();
    lb.server.close();
}

// S6: with auto-confirmation enabled the confirmation precedes the
// listener callback, and the sender's await succeeds.
#[test]
fn indication_with_auto_confirmation() {
    let lb = loopback();
    let listener = RecordingListener::accepting_all();
    lb.client.add_char_listener(listener.clone());
    assert!(lb.client.get_send_indication_confirmation());

    lb.server.send_indication(3, &[0xCC]).unwrap();
    wait_until("indication delivery", Duration::from_secs(2), || {
        !listener.indications.lock().unwrap().is_empty()
    });
    assert_eq!(
        listener.indications.lock().unwrap().as_slice(),
        &[(3, vec![0xCC], true)]
    );

    lb.client.close();
    lb.server.close();
}

// Without auto-confirmation the sender times out and tears down.
#[test]
fn indication_without_confirmation_times_out() {
    let lb = loopback();
    lb.client.set_send_indication_confirmation(false);
    let listener = RecordingListener::accepting_all();
    lb.client.add_char_listener(listener.clone());

    let err = lb.server.send_indication(3, &[0xCC]).unwrap_err();
    assert!(matches!(err, GattError::Timeout));
    assert!(!lb.server.is_connected());
    // delivered to the listener with cfm_sent == false
    wait_until("unconfirmed indication", Duration::from_secs(2), || {
        !listener.indications.lock().unwrap().is_empty()
    });
    assert_eq!(listener.indications.lock().unwrap()[0].2, false);
}

// Invariant 5: close() stops the reader promptly and later calls fail
// with NotConnected.
#[test]
fn close_terminates_the_session() {
    let lb = loopback();
    let services = lb.client.get_services();
    let c = services[0].characteristics[0].clone();

    lb.client.close();
    assert!(!lb.client.is_connected());
    let err = lb.client.read_characteristic_value(&c, 0).unwrap_err();
    assert!(matches!(err, GattError::NotConnected));

    // the server notices the dead peer and pulls down as well
    wait_until("server teardown", Duration::from_secs(2), || {
        !lb.server.is_connected()
    });
}

// Read veto: one rejecting server listener turns reads into
// READ_NOT_PERMITTED.
#[test]
fn server_read_veto_is_enforced() {
    struct DenyReads;
    impl ServerListener for DenyReads {
        fn read_char_value(&self, _s: &DbService, _c: &DbCharacteristic) -> bool {
            false
        }
    }

    let lb = loopback();
    let listener: Arc<dyn ServerListener> = Arc::new(DenyReads);
    lb.db.lock().unwrap().add_listener(listener);

    let services = lb.client.get_services();
    let c = services[0].characteristics[0].clone();
    let err = lb.client.read_characteristic_value(&c, 0).unwrap_err();
    assert!(matches!(
        err,
        GattError::Att {
            code: AttErrorCode::ReadNotPermitted,
            ..
        }
    ));

    lb.client.close();
    lb.server.close();
}

// Unsupported requests are answered, not dropped.
#[test]
fn unsupported_requests_get_an_error_response() {
    let (server_end, peer_end) = DuplexTransport::pair();
    let device = MockDevice::new();
    let session = GattSession::new(
        server_end,
        GattRole::Server,
        device_link(&device),
        Some(test_db()),
        GattConfig::default(),
    )
    .unwrap();

    peer_send(
        &peer_end,
        &AttPdu::ReadMultipleReq(ReadMultipleRequest {
            handles: vec![3, 5],
        }),
    );
    assert_eq!(
        peer_recv(&peer_end),
        AttPdu::Error(ErrorResponse {
            request_opcode: ATT_READ_MULTIPLE_REQ,
            handle: 0,
            error_code: AttErrorCode::RequestNotSupported,
        })
    );

    session.close();
}

// Notifications to an unknown value handle are refused locally.
#[test]
fn send_notification_validates_role_and_handle() {
    let lb = loopback();
    let err = lb.server.send_notification(0x00FF, &[1]).unwrap_err();
    assert!(matches!(err, GattError::InvalidArgument(_)));

    let err = lb.client.send_notification(3, &[1]).unwrap_err();
    assert!(matches!(err, GattError::InvalidArgument(_)));

    lb.client.close();
    lb.server.close();
}

// Listener registry: removal by identity and by association.
#[test]
fn listener_registry_removal() {
    let lb = loopback();
    let a = RecordingListener::accepting_all();
    let b = RecordingListener::rejecting_all();
    lb.client.add_char_listener(a.clone());
    lb.client.add_char_listener(b.clone());

    let a_dyn: Arc<dyn CharListener> = a.clone();
    assert!(lb.client.remove_char_listener(&a_dyn));
    assert!(!lb.client.remove_char_listener(&a_dyn));

    let services = lb.client.get_services();
    let c = &services[0].characteristics[0];
    // `b` matches nothing, so association-based removal removes none
    assert_eq!(lb.client.remove_all_associated_char_listener(c), 0);
    assert_eq!(lb.client.remove_all_char_listener(), 1);

    lb.client.close();
    lb.server.close();
}
