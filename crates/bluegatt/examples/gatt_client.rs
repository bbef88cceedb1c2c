//! GATT client example
//!
//! Connects to a remote LE device, discovers its services and prints the
//! Generic Access values.
//!
//! Usage: gatt_client <remote-address> [public|random]
use bluegatt::{
    AddressType, BdAddr, DeviceLink, DisconnectReason, GattConfig, GattRole, GattSession,
    L2capSocket, SecurityLevel,
};
use std::str::FromStr;
use std::sync::{Arc, Weak};

struct RemoteDevice {
    addr: BdAddr,
    addr_type: AddressType,
}

impl DeviceLink for RemoteDevice {
    fn address_and_type(&self) -> (BdAddr, AddressType) {
        (self.addr, self.addr_type)
    }

    fn disconnect(&self, reason: DisconnectReason) {
        log::info!("{}: session requested disconnect ({:?})", self.addr, reason);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let remote = BdAddr::from_str(&args.next().ok_or("usage: gatt_client <address> [type]")?)?;
    let addr_type = match args.next().as_deref() {
        Some("random") => AddressType::Random,
        _ => AddressType::Public,
    };

    let local = BdAddr([0; 6]); // BDADDR_ANY
    let transport = Arc::new(L2capSocket::connect(
        local,
        AddressType::Public,
        remote,
        addr_type,
        SecurityLevel::None,
    )?);

    let device: Arc<dyn DeviceLink> = Arc::new(RemoteDevice {
        addr: remote,
        addr_type,
    });
    let link: Weak<dyn DeviceLink> = Arc::downgrade(&device);
    let session = GattSession::new(
        transport,
        GattRole::Client,
        link,
        None,
        GattConfig::default(),
    )?;
    println!("{}", session.get_state_string());

    for service in session.discover_complete_primary_services()? {
        println!(
            "service {} [{:#06x}..{:#06x}]",
            service.uuid, service.start_handle, service.end_handle
        );
        for c in &service.characteristics {
            println!(
                "  char {} value-handle {:#06x} props {:?}",
                c.uuid, c.value_handle, c.properties
            );
            for d in &c.descriptors {
                println!("    desc {} handle {:#06x}", d.uuid, d.handle);
            }
        }
    }

    if let Some(ga) = session.get_generic_access()? {
        println!("device name: {:?}", ga.device_name);
        println!("appearance: {:#06x}", ga.appearance);
    }

    session.close();
    Ok(())
}
