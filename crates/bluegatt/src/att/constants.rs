//! Constants for the ATT protocol

/// L2CAP channel identifier for ATT over LE
pub const ATT_CID: u16 = 0x0004;

/// Minimum ATT MTU (LE default)
pub const ATT_MIN_MTU: u16 = 23;
/// Maximum ATT MTU supported: 512 byte attribute value plus 1 opcode byte
pub const ATT_MAX_MTU: u16 = 513;
/// Maximum attribute value length
pub const ATT_MAX_VALUE_LEN: usize = 512;

/// Smallest valid attribute handle; 0 is invalid
pub const ATT_HANDLE_MIN: u16 = 0x0001;
/// Largest attribute handle
pub const ATT_HANDLE_MAX: u16 = 0xFFFF;

// ATT opcodes (BT Core Spec v5.2, Vol 3, Part F, 3.4.8)
pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFO_REQ: u8 = 0x04;
pub const ATT_FIND_INFO_RSP: u8 = 0x05;
pub const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0A;
pub const ATT_READ_RSP: u8 = 0x0B;
pub const ATT_READ_BLOB_REQ: u8 = 0x0C;
pub const ATT_READ_BLOB_RSP: u8 = 0x0D;
pub const ATT_READ_MULTIPLE_REQ: u8 = 0x0E;
pub const ATT_READ_MULTIPLE_RSP: u8 = 0x0F;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_WRITE_CMD: u8 = 0x52;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_READ_MULTIPLE_VARIABLE_REQ: u8 = 0x20;
pub const ATT_READ_MULTIPLE_VARIABLE_RSP: u8 = 0x21;
pub const ATT_MULTIPLE_HANDLE_VALUE_NTF: u8 = 0x23;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub const ATT_HANDLE_VALUE_CFM: u8 = 0x1E;
pub const ATT_SIGNED_WRITE_CMD: u8 = 0xD2;

/// Find Information Response: 16-bit UUID pairs
pub const ATT_FIND_INFO_FORMAT_16BIT: u8 = 0x01;
/// Find Information Response: 128-bit UUID pairs
pub const ATT_FIND_INFO_FORMAT_128BIT: u8 = 0x02;

/// Execute Write Request flag: discard the prepared-write queue
pub const ATT_EXEC_WRITE_CANCEL: u8 = 0x00;
/// Execute Write Request flag: commit the prepared-write queue
pub const ATT_EXEC_WRITE_COMMIT: u8 = 0x01;

// ATT error codes (BT Core Spec v5.2, Vol 3, Part F, 3.4.1.1)
pub const ATT_ERROR_INVALID_HANDLE: u8 = 0x01;
pub const ATT_ERROR_READ_NOT_PERMITTED: u8 = 0x02;
pub const ATT_ERROR_WRITE_NOT_PERMITTED: u8 = 0x03;
pub const ATT_ERROR_INVALID_PDU: u8 = 0x04;
pub const ATT_ERROR_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
pub const ATT_ERROR_REQUEST_NOT_SUPPORTED: u8 = 0x06;
pub const ATT_ERROR_INVALID_OFFSET: u8 = 0x07;
pub const ATT_ERROR_INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
pub const ATT_ERROR_PREPARE_QUEUE_FULL: u8 = 0x09;
pub const ATT_ERROR_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
pub const ATT_ERROR_ATTRIBUTE_NOT_LONG: u8 = 0x0B;
pub const ATT_ERROR_INSUFFICIENT_ENCRYPTION_KEY_SIZE: u8 = 0x0C;
pub const ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH: u8 = 0x0D;
pub const ATT_ERROR_UNLIKELY: u8 = 0x0E;
pub const ATT_ERROR_INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
pub const ATT_ERROR_UNSUPPORTED_GROUP_TYPE: u8 = 0x10;
pub const ATT_ERROR_INSUFFICIENT_RESOURCES: u8 = 0x11;
pub const ATT_ERROR_DATABASE_OUT_OF_SYNC: u8 = 0x12;
pub const ATT_ERROR_VALUE_NOT_ALLOWED: u8 = 0x13;
pub const ATT_ERROR_APPLICATION_ERROR_START: u8 = 0x80;
pub const ATT_ERROR_APPLICATION_ERROR_END: u8 = 0x9F;
pub const ATT_ERROR_COMMON_PROFILE_ERROR_START: u8 = 0xE0;
pub const ATT_ERROR_COMMON_PROFILE_ERROR_END: u8 = 0xFF;

// GATT attribute type UUIDs (16-bit, BT Core Spec v5.2, Vol 3, Part G)
pub const GATT_PRIMARY_SERVICE_UUID: u16 = 0x2800;
pub const GATT_SECONDARY_SERVICE_UUID: u16 = 0x2801;
pub const GATT_INCLUDE_DECLARATION_UUID: u16 = 0x2802;
pub const GATT_CHARACTERISTIC_UUID: u16 = 0x2803;

// Descriptor type UUIDs
pub const GATT_EXT_PROPERTIES_UUID: u16 = 0x2900;
pub const GATT_USER_DESCRIPTION_UUID: u16 = 0x2901;
pub const GATT_CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;
pub const GATT_SERVER_CHAR_CONFIG_UUID: u16 = 0x2903;

// Well-known service and characteristic UUIDs used by the session helpers
pub const GATT_GENERIC_ACCESS_UUID: u16 = 0x1800;
pub const GATT_DEVICE_INFORMATION_UUID: u16 = 0x180A;
pub const GATT_DEVICE_NAME_UUID: u16 = 0x2A00;
pub const GATT_APPEARANCE_UUID: u16 = 0x2A01;
pub const GATT_PREFERRED_CONN_PARAMS_UUID: u16 = 0x2A04;
pub const GATT_SYSTEM_ID_UUID: u16 = 0x2A23;
pub const GATT_MODEL_NUMBER_UUID: u16 = 0x2A24;
pub const GATT_SERIAL_NUMBER_UUID: u16 = 0x2A25;
pub const GATT_FIRMWARE_REVISION_UUID: u16 = 0x2A26;
pub const GATT_HARDWARE_REVISION_UUID: u16 = 0x2A27;
pub const GATT_SOFTWARE_REVISION_UUID: u16 = 0x2A28;
pub const GATT_MANUFACTURER_NAME_UUID: u16 = 0x2A29;
pub const GATT_REGULATORY_CERT_DATA_UUID: u16 = 0x2A2A;
pub const GATT_PNP_ID_UUID: u16 = 0x2A50;

/// Client Characteristic Configuration: notification bit
pub const CCC_NOTIFY_BIT: u16 = 0x0001;
/// Client Characteristic Configuration: indication bit
pub const CCC_INDICATE_BIT: u16 = 0x0002;
