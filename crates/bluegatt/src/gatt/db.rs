//! Server-side attribute database
//!
//! A pure in-memory tree of services, characteristics and descriptors.
//! The embedding application builds it before the session starts serving;
//! afterwards only the server responder mutates attribute values and CCC
//! state. Handles are assigned in one contiguous pass by
//! [`GattDb::assign_handles`].
use super::types::CharProps;
use crate::att::constants::*;
use crate::uuid::Uuid;
use std::sync::{Arc, Mutex};

/// A characteristic descriptor, server side.
#[derive(Debug, Clone)]
pub struct DbDescriptor {
    /// Handle, 0 until assigned
    pub handle: u16,
    /// Descriptor type
    pub uuid: Uuid,
    /// Descriptor value
    pub value: Vec<u8>,
    /// Whether writes may resize the value (up to 512 bytes)
    pub variable_length: bool,
}

impl DbDescriptor {
    pub fn new(uuid: Uuid, value: Vec<u8>, variable_length: bool) -> Self {
        Self {
            handle: 0,
            uuid,
            value,
            variable_length,
        }
    }

    /// A Client Characteristic Configuration descriptor with both bits off.
    pub fn client_char_config() -> Self {
        Self::new(Uuid::from_u16(GATT_CLIENT_CHAR_CONFIG_UUID), vec![0, 0], false)
    }

    /// A Characteristic User Description descriptor; read-only to clients.
    pub fn user_description(text: &str) -> Self {
        Self::new(
            Uuid::from_u16(GATT_USER_DESCRIPTION_UUID),
            text.as_bytes().to_vec(),
            false,
        )
    }

    pub fn is_client_char_config(&self) -> bool {
        self.uuid == GATT_CLIENT_CHAR_CONFIG_UUID
    }

    pub fn is_user_description(&self) -> bool {
        self.uuid == GATT_USER_DESCRIPTION_UUID
    }

    /// Largest value length a write may produce.
    pub fn capacity(&self) -> usize {
        if self.variable_length {
            ATT_MAX_VALUE_LEN
        } else {
            self.value.len()
        }
    }
}

impl PartialEq for DbDescriptor {
    // attribute handles are unique within one database
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

/// A characteristic, server side.
#[derive(Debug, Clone)]
pub struct DbCharacteristic {
    /// Handle of the characteristic declaration, 0 until assigned
    pub handle: u16,
    /// Last handle belonging to this characteristic, inclusive
    pub end_handle: u16,
    /// Handle of the characteristic value
    pub value_handle: u16,
    /// Characteristic value type
    pub uuid: Uuid,
    /// Property bits
    pub properties: CharProps,
    /// Characteristic value
    pub value: Vec<u8>,
    /// Whether writes may resize the value (up to 512 bytes)
    pub variable_length: bool,
    /// Descriptors, in declaration order
    pub descriptors: Vec<DbDescriptor>,
    /// Index of the CCC descriptor within `descriptors`
    pub ccc_index: Option<usize>,
    /// Index of the User Description descriptor within `descriptors`
    pub user_description_index: Option<usize>,
}

impl DbCharacteristic {
    pub fn new(
        uuid: Uuid,
        properties: CharProps,
        value: Vec<u8>,
        variable_length: bool,
        descriptors: Vec<DbDescriptor>,
    ) -> Self {
        let ccc_index = descriptors.iter().position(|d| d.is_client_char_config());
        let user_description_index = descriptors.iter().position(|d| d.is_user_description());
        Self {
            handle: 0,
            end_handle: 0,
            value_handle: 0,
            uuid,
            properties,
            value,
            variable_length,
            descriptors,
            ccc_index,
            user_description_index,
        }
    }

    /// The CCC descriptor, if declared.
    pub fn client_char_config(&self) -> Option<&DbDescriptor> {
        self.ccc_index.and_then(|i| self.descriptors.get(i))
    }

    /// Current CCC bits as `(notify, indicate)`.
    pub fn ccc_state(&self) -> (bool, bool) {
        match self.client_char_config() {
            Some(d) if d.value.len() >= 2 => {
                let v = u16::from_le_bytes([d.value[0], d.value[1]]);
                (v & CCC_NOTIFY_BIT != 0, v & CCC_INDICATE_BIT != 0)
            }
            _ => (false, false),
        }
    }

    /// Largest value length a write may produce.
    pub fn capacity(&self) -> usize {
        if self.variable_length {
            ATT_MAX_VALUE_LEN
        } else {
            self.value.len()
        }
    }
}

impl PartialEq for DbCharacteristic {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

/// A service, server side.
#[derive(Debug, Clone)]
pub struct DbService {
    /// Whether this is a primary service
    pub primary: bool,
    /// First handle of the group, 0 until assigned
    pub handle: u16,
    /// Last handle of the group, inclusive
    pub end_handle: u16,
    /// Service type
    pub uuid: Uuid,
    /// Characteristics, in declaration order
    pub characteristics: Vec<DbCharacteristic>,
}

impl DbService {
    pub fn new(primary: bool, uuid: Uuid, characteristics: Vec<DbCharacteristic>) -> Self {
        Self {
            primary,
            handle: 0,
            end_handle: 0,
            uuid,
            characteristics,
        }
    }

    /// Finds a characteristic by value type.
    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&DbCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }

    /// Assigns handles to this service and its children, starting at
    /// `start_handle`. Returns the number of handles consumed, i.e.
    /// `(end_handle - handle) + 1`.
    fn assign_handles(&mut self, start_handle: u16) -> u16 {
        let mut h = start_handle;
        self.handle = h;
        h += 1;
        for c in &mut self.characteristics {
            c.handle = h;
            h += 1;
            c.value_handle = h;
            h += 1;
            for d in &mut c.descriptors {
                d.handle = h;
                h += 1;
            }
            c.end_handle = h - 1;
        }
        self.end_handle = h - 1;
        (self.end_handle - self.handle) + 1
    }
}

impl PartialEq for DbService {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.end_handle == other.end_handle
    }
}

/// Location of one addressable attribute value within the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttrLoc {
    /// Characteristic value: service and characteristic index
    CharValue { s: usize, c: usize },
    /// Descriptor value: service, characteristic and descriptor index
    Desc { s: usize, c: usize, d: usize },
}

/// Listener to remote client operations on the local database. Read and
/// write callbacks veto the operation by returning `false`; the operation
/// is allowed only when every registered listener accepts it.
pub trait ServerListener: Send + Sync {
    fn read_char_value(&self, _s: &DbService, _c: &DbCharacteristic) -> bool {
        true
    }

    fn read_desc_value(&self, _s: &DbService, _c: &DbCharacteristic, _d: &DbDescriptor) -> bool {
        true
    }

    fn write_char_value(
        &self,
        _s: &DbService,
        _c: &DbCharacteristic,
        _value: &[u8],
        _offset: u16,
    ) -> bool {
        true
    }

    fn write_desc_value(
        &self,
        _s: &DbService,
        _c: &DbCharacteristic,
        _d: &DbDescriptor,
        _value: &[u8],
        _offset: u16,
    ) -> bool {
        true
    }

    /// The client changed the CCC of `c` to the given state.
    fn ccc_changed(&self, _s: &DbService, _c: &DbCharacteristic, _notify: bool, _indicate: bool) {}

    /// An MTU exchange settled the session on `mtu`.
    fn mtu_changed(&self, _mtu: u16) {}
}

/// The server attribute database: ordered services plus the attribute-MTU
/// preference advertised during MTU exchange.
pub struct GattDb {
    /// Services in declaration order
    pub services: Vec<DbService>,
    /// Server Rx MTU preference
    pub server_mtu: u16,
    listeners: Mutex<Arc<Vec<Arc<dyn ServerListener>>>>,
}

impl GattDb {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            server_mtu: ATT_MAX_MTU,
            listeners: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// Adds a service. Returns `false` when a service of the same type is
    /// already present.
    pub fn add_service(&mut self, service: DbService) -> bool {
        if self.find_service(&service.uuid).is_some() {
            return false;
        }
        self.services.push(service);
        true
    }

    /// Walks all services and assigns handles in one contiguous pass
    /// starting at 1: one handle per service declaration, characteristic
    /// declaration, characteristic value and descriptor. Returns the total
    /// handle count.
    pub fn assign_handles(&mut self) -> u16 {
        let mut count = 0u16;
        let mut h = ATT_HANDLE_MIN;
        for s in &mut self.services {
            let used = s.assign_handles(h);
            count += used;
            h += used;
        }
        count
    }

    /// Finds a service by type.
    pub fn find_service(&self, uuid: &Uuid) -> Option<&DbService> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Finds a characteristic by service type and value type.
    pub fn find_characteristic(
        &self,
        service_uuid: &Uuid,
        char_uuid: &Uuid,
    ) -> Option<&DbCharacteristic> {
        self.find_service(service_uuid)
            .and_then(|s| s.find_characteristic(char_uuid))
    }

    /// Locates the attribute value addressed by `handle`.
    pub(crate) fn locate(&self, handle: u16) -> Option<AttrLoc> {
        if handle == 0 {
            return None;
        }
        for (si, s) in self.services.iter().enumerate() {
            if handle < s.handle || handle > s.end_handle {
                continue;
            }
            for (ci, c) in s.characteristics.iter().enumerate() {
                if handle == c.value_handle {
                    return Some(AttrLoc::CharValue { s: si, c: ci });
                }
                for (di, d) in c.descriptors.iter().enumerate() {
                    if handle == d.handle {
                        return Some(AttrLoc::Desc {
                            s: si,
                            c: ci,
                            d: di,
                        });
                    }
                }
            }
        }
        None
    }

    /// Whether `handle` addresses a characteristic value.
    pub fn is_value_handle(&self, handle: u16) -> bool {
        matches!(self.locate(handle), Some(AttrLoc::CharValue { .. }))
    }

    /// Registers a server listener. Returns `false` on duplicate identity.
    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) -> bool {
        let mut guard = self.listeners.lock().unwrap();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Removes a server listener by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn ServerListener>) -> bool {
        let mut guard = self.listeners.lock().unwrap();
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        let removed = next.len() < guard.len();
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Snapshot of the registered listeners for one dispatch.
    pub(crate) fn listener_snapshot(&self) -> Arc<Vec<Arc<dyn ServerListener>>> {
        self.listeners.lock().unwrap().clone()
    }
}

impl Default for GattDb {
    fn default() -> Self {
        Self::new()
    }
}
