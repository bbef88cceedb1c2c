//! GATT server example
//!
//! Serves a battery service to one inbound LE connection and notifies a
//! fake battery level every two seconds.
use bluegatt::gatt::db::{DbCharacteristic, DbDescriptor, DbService};
use bluegatt::{
    AddressType, BdAddr, CharProps, DeviceLink, DisconnectReason, GattConfig, GattDb, GattRole,
    GattSession, Uuid,
};
use bluegatt::l2cap::L2capListener;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const BATTERY_SERVICE: u16 = 0x180F;
const BATTERY_LEVEL: u16 = 0x2A19;

struct RemoteDevice {
    addr: BdAddr,
}

impl DeviceLink for RemoteDevice {
    fn address_and_type(&self) -> (BdAddr, AddressType) {
        (self.addr, AddressType::Public)
    }

    fn disconnect(&self, reason: DisconnectReason) {
        log::info!("{}: session requested disconnect ({:?})", self.addr, reason);
    }
}

fn battery_db() -> Arc<Mutex<GattDb>> {
    let mut db = GattDb::new();
    db.add_service(DbService::new(
        true,
        Uuid::from_u16(BATTERY_SERVICE),
        vec![DbCharacteristic::new(
            Uuid::from_u16(BATTERY_LEVEL),
            CharProps::READ | CharProps::NOTIFY,
            vec![100],
            false,
            vec![
                DbDescriptor::client_char_config(),
                DbDescriptor::user_description("Battery Level"),
            ],
        )],
    ));
    let count = db.assign_handles();
    log::info!("database ready, {} handles", count);
    Arc::new(Mutex::new(db))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let db = battery_db();
    let level_handle = db.lock().unwrap().services[0].characteristics[0].value_handle;

    let listener = L2capListener::bind(BdAddr([0; 6]), AddressType::Public)?;
    println!("waiting for an LE central to connect...");
    let (socket, peer) = listener.accept()?;
    println!("accepted {}", peer);

    let device: Arc<dyn DeviceLink> = Arc::new(RemoteDevice { addr: peer });
    let link: Weak<dyn DeviceLink> = Arc::downgrade(&device);
    let session = GattSession::new(
        Arc::new(socket),
        GattRole::Server,
        link,
        Some(Arc::clone(&db)),
        GattConfig::default(),
    )?;

    let mut level = 100u8;
    while session.is_connected() {
        std::thread::sleep(Duration::from_secs(2));
        level = level.saturating_sub(1).max(1);
        db.lock().unwrap().services[0].characteristics[0].value = vec![level];
        let (notify, _) = db.lock().unwrap().services[0].characteristics[0].ccc_state();
        if notify {
            if let Err(e) = session.send_notification(level_handle, &[level]) {
                log::warn!("notification failed: {}", e);
                break;
            }
        }
    }

    session.close();
    Ok(())
}
