//! Server responder
//!
//! Handles request and command PDUs arriving on a server-role session:
//! walks the attribute database, enforces the per-attribute veto
//! callbacks, fragments responses to the negotiated MTU, maintains the
//! prepared-write queue and the Client Characteristic Configuration state.
//! Failures never disconnect; they are mapped to `ERROR_RSP` toward the
//! peer.
use super::session::{PreparedWrite, SessionInner};
use crate::att::constants::*;
use crate::att::pdu::{
    AttPdu, ErrorResponse, ExchangeMtuRequest, ExchangeMtuResponse, ExecuteWriteRequest,
    ExecuteWriteResponse, FindInformationRequest, FindInformationResponse, GroupElement,
    HandleValue, PrepareWriteRequest, PrepareWriteResponse, ReadBlobRequest, ReadBlobResponse,
    ReadByGroupTypeRequest, ReadByGroupTypeResponse, ReadByTypeRequest, ReadByTypeResponse,
    ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use crate::att::AttErrorCode;
use crate::gatt::db::{AttrLoc, GattDb};
use crate::gatt::types::CharProps;
use crate::uuid::Uuid;
use log::{debug, warn};
use std::sync::atomic::Ordering;

/// Upper bound on staged prepare-write fragments per session.
const PREPARE_QUEUE_MAX: usize = 32;

impl SessionInner {
    /// Entry point from the reader loop for request and command PDUs.
    pub(crate) fn handle_server_pdu(&self, pdu: &AttPdu) {
        match pdu {
            AttPdu::ExchangeMtuReq(r) => self.reply_exchange_mtu(r),
            AttPdu::ReadByGroupTypeReq(r) => self.reply_read_by_group_type(r),
            AttPdu::ReadByTypeReq(r) => self.reply_read_by_type(r),
            AttPdu::FindInformationReq(r) => self.reply_find_information(r),
            AttPdu::ReadReq(r) => self.reply_read(r),
            AttPdu::ReadBlobReq(r) => self.reply_read_blob(r),
            AttPdu::WriteReq(r) => self.reply_write(r),
            AttPdu::WriteCmd(r) => {
                // commands never elicit replies, success or failure
                let err = self.server_apply_write(r.handle, &r.value, 0);
                if err != AttErrorCode::NoError {
                    debug!(
                        "{}: write command on {:#06x} failed with {:?}",
                        self.peer, r.handle, err
                    );
                }
            }
            AttPdu::PrepareWriteReq(r) => self.reply_prepare_write(r),
            AttPdu::ExecuteWriteReq(r) => self.reply_execute_write(r),
            other => {
                self.error_rsp(other.opcode(), 0, AttErrorCode::RequestNotSupported);
            }
        }
    }

    fn error_rsp(&self, request_opcode: u8, handle: u16, error_code: AttErrorCode) {
        let rsp = AttPdu::Error(ErrorResponse {
            request_opcode,
            handle,
            error_code,
        });
        if let Err(e) = self.send_frame(&rsp) {
            warn!("{}: could not send error response: {}", self.peer, e);
        }
    }

    fn send_reply(&self, pdu: AttPdu) {
        if let Err(e) = self.send_frame(&pdu) {
            warn!("{}: could not send {}: {}", self.peer, pdu.name(), e);
        }
    }

    /// Response payload budget for the element-list responses.
    fn element_budget(&self) -> usize {
        (self.used_mtu.load(Ordering::SeqCst) as usize - 2).min(255)
    }

    fn reply_exchange_mtu(&self, req: &ExchangeMtuRequest) {
        let server_mtu = self.server_mtu.load(Ordering::SeqCst);
        let used = server_mtu
            .min(req.client_mtu)
            .clamp(ATT_MIN_MTU, ATT_MAX_MTU);
        self.used_mtu.store(used, Ordering::SeqCst);
        debug!("{}: MTU exchange, client {}, using {}", self.peer, req.client_mtu, used);
        self.send_reply(AttPdu::ExchangeMtuRsp(ExchangeMtuResponse {
            server_mtu: used,
        }));
        if let Some(db) = &self.server_db {
            let listeners = db.lock().unwrap().listener_snapshot();
            for l in listeners.iter() {
                l.mtu_changed(used);
            }
        }
    }

    fn reply_read_by_group_type(&self, req: &ReadByGroupTypeRequest) {
        let want_primary = req.group_type == GATT_PRIMARY_SERVICE_UUID;
        let want_secondary = req.group_type == GATT_SECONDARY_SERVICE_UUID;
        if !want_primary && !want_secondary {
            self.error_rsp(
                ATT_READ_BY_GROUP_TYPE_REQ,
                req.start_handle,
                AttErrorCode::UnsupportedGroupType,
            );
            return;
        }

        let Some(db) = &self.server_db else { return };
        let db = db.lock().unwrap();
        let budget = self.element_budget();
        let mut elements: Vec<GroupElement> = Vec::new();
        let mut element_len = 0usize;
        for s in &db.services {
            if s.primary != want_primary {
                continue;
            }
            if s.handle < req.start_handle || s.handle > req.end_handle {
                continue;
            }
            let esz = 4 + s.uuid.att_size();
            if elements.is_empty() {
                element_len = esz;
            } else if esz != element_len {
                break;
            }
            if (elements.len() + 1) * element_len > budget {
                break;
            }
            let mut value = Vec::with_capacity(esz - 4);
            s.uuid.put_att(&mut value);
            elements.push(GroupElement {
                handle: s.handle,
                end_group_handle: s.end_handle,
                value,
            });
        }
        drop(db);

        if elements.is_empty() {
            self.error_rsp(
                ATT_READ_BY_GROUP_TYPE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
            return;
        }
        self.send_reply(AttPdu::ReadByGroupTypeRsp(ReadByGroupTypeResponse {
            element_len: element_len as u8,
            elements,
        }));
    }

    fn reply_read_by_type(&self, req: &ReadByTypeRequest) {
        if req.attribute_type == GATT_INCLUDE_DECLARATION_UUID {
            // TODO: include-declaration discovery once the database models
            // included services
            self.error_rsp(
                ATT_READ_BY_TYPE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
            return;
        }
        if req.attribute_type != GATT_CHARACTERISTIC_UUID {
            self.error_rsp(
                ATT_READ_BY_TYPE_REQ,
                req.start_handle,
                AttErrorCode::UnsupportedGroupType,
            );
            return;
        }

        let Some(db) = &self.server_db else { return };
        let db = db.lock().unwrap();
        let budget = self.element_budget();
        let mut elements: Vec<HandleValue> = Vec::new();
        let mut element_len = 0usize;
        'walk: for s in &db.services {
            for c in &s.characteristics {
                if c.handle < req.start_handle || c.handle > req.end_handle {
                    continue;
                }
                // declaration value: properties, value handle, value type
                let esz = 2 + 1 + 2 + c.uuid.att_size();
                if elements.is_empty() {
                    element_len = esz;
                } else if esz != element_len {
                    break 'walk;
                }
                if (elements.len() + 1) * element_len > budget {
                    break 'walk;
                }
                let mut value = Vec::with_capacity(esz - 2);
                value.push(c.properties.bits());
                value.extend_from_slice(&c.value_handle.to_le_bytes());
                c.uuid.put_att(&mut value);
                elements.push(HandleValue {
                    handle: c.handle,
                    value,
                });
            }
        }
        drop(db);

        if elements.is_empty() {
            self.error_rsp(
                ATT_READ_BY_TYPE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
            return;
        }
        self.send_reply(AttPdu::ReadByTypeRsp(ReadByTypeResponse {
            element_len: element_len as u8,
            elements,
        }));
    }

    fn reply_find_information(&self, req: &FindInformationRequest) {
        let Some(db) = &self.server_db else { return };
        let db = db.lock().unwrap();
        let budget = self.element_budget();
        let mut entries: Vec<(u16, Uuid)> = Vec::new();
        let mut entry_size = 0usize;
        'walk: for s in &db.services {
            for c in &s.characteristics {
                for d in &c.descriptors {
                    if d.handle < req.start_handle || d.handle > req.end_handle {
                        continue;
                    }
                    let esz = 2 + d.uuid.att_size();
                    if entries.is_empty() {
                        entry_size = esz;
                    } else if esz != entry_size {
                        break 'walk;
                    }
                    if (entries.len() + 1) * entry_size > budget {
                        break 'walk;
                    }
                    entries.push((d.handle, d.uuid));
                }
            }
        }
        drop(db);

        if entries.is_empty() {
            self.error_rsp(
                ATT_FIND_INFO_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
            return;
        }
        self.send_reply(AttPdu::FindInformationRsp(
            FindInformationResponse::from_entries(entries),
        ));
    }

    fn reply_read(&self, req: &ReadRequest) {
        match self.server_read_value(req.handle, None) {
            Ok(value) => self.send_reply(AttPdu::ReadRsp(ReadResponse { value })),
            Err(code) => self.error_rsp(ATT_READ_REQ, req.handle, code),
        }
    }

    fn reply_read_blob(&self, req: &ReadBlobRequest) {
        match self.server_read_value(req.handle, Some(req.offset)) {
            Ok(value) => self.send_reply(AttPdu::ReadBlobRsp(ReadBlobResponse { value })),
            Err(code) => self.error_rsp(ATT_READ_BLOB_REQ, req.handle, code),
        }
    }

    /// Shared read path for `READ_REQ` (`offset` None) and
    /// `READ_BLOB_REQ`. Returns the value chunk or the wire error code.
    fn server_read_value(&self, handle: u16, offset: Option<u16>) -> Result<Vec<u8>, AttErrorCode> {
        let Some(db) = &self.server_db else {
            return Err(AttErrorCode::Unlikely);
        };
        let db = db.lock().unwrap();
        let Some(loc) = db.locate(handle) else {
            return Err(AttErrorCode::AttributeNotFound);
        };
        let max_chunk = self.used_mtu.load(Ordering::SeqCst) as usize - 1;
        let listeners = db.listener_snapshot();

        let value: &Vec<u8> = match loc {
            AttrLoc::CharValue { s, c } => {
                let svc = &db.services[s];
                let chr = &svc.characteristics[c];
                if !listeners.iter().all(|l| l.read_char_value(svc, chr)) {
                    return Err(AttErrorCode::ReadNotPermitted);
                }
                &chr.value
            }
            AttrLoc::Desc { s, c, d } => {
                let svc = &db.services[s];
                let chr = &svc.characteristics[c];
                let desc = &chr.descriptors[d];
                if !listeners.iter().all(|l| l.read_desc_value(svc, chr, desc)) {
                    return Err(AttErrorCode::ReadNotPermitted);
                }
                &desc.value
            }
        };

        // blob reads of a value that fits one PDU get ATTRIBUTE_NOT_LONG
        if offset.is_some() && value.len() <= max_chunk {
            return Err(AttErrorCode::AttributeNotLong);
        }
        let off = offset.unwrap_or(0) as usize;
        if off > value.len() {
            return Err(AttErrorCode::InvalidOffset);
        }
        let mut chunk = value[off..].to_vec();
        chunk.truncate(max_chunk);
        Ok(chunk)
    }

    fn reply_write(&self, req: &WriteRequest) {
        match self.server_apply_write(req.handle, &req.value, 0) {
            AttErrorCode::NoError => self.send_reply(AttPdu::WriteRsp(WriteResponse)),
            code => self.error_rsp(ATT_WRITE_REQ, req.handle, code),
        }
    }

    fn reply_prepare_write(&self, req: &PrepareWriteRequest) {
        {
            let Some(db) = &self.server_db else { return };
            let db = db.lock().unwrap();
            if db.locate(req.handle).is_none() {
                drop(db);
                self.error_rsp(
                    ATT_PREPARE_WRITE_REQ,
                    req.handle,
                    AttErrorCode::InvalidHandle,
                );
                return;
            }
        }
        {
            let mut queue = self.prepared_writes.lock().unwrap();
            if queue.len() >= PREPARE_QUEUE_MAX {
                drop(queue);
                self.error_rsp(
                    ATT_PREPARE_WRITE_REQ,
                    req.handle,
                    AttErrorCode::PrepareQueueFull,
                );
                return;
            }
            queue.push(PreparedWrite {
                handle: req.handle,
                offset: req.offset,
                value: req.value.clone(),
            });
        }
        self.send_reply(AttPdu::PrepareWriteRsp(PrepareWriteResponse {
            handle: req.handle,
            offset: req.offset,
            value: req.value.clone(),
        }));
    }

    fn reply_execute_write(&self, req: &ExecuteWriteRequest) {
        let staged: Vec<PreparedWrite> = {
            let mut queue = self.prepared_writes.lock().unwrap();
            queue.drain(..).collect()
        };
        match req.flags {
            ATT_EXEC_WRITE_CANCEL => {
                self.send_reply(AttPdu::ExecuteWriteRsp(ExecuteWriteResponse));
            }
            ATT_EXEC_WRITE_COMMIT => {
                for entry in &staged {
                    let err = self.server_apply_write(entry.handle, &entry.value, entry.offset);
                    if err != AttErrorCode::NoError {
                        self.error_rsp(ATT_EXECUTE_WRITE_REQ, entry.handle, err);
                        return;
                    }
                }
                self.send_reply(AttPdu::ExecuteWriteRsp(ExecuteWriteResponse));
            }
            _ => self.error_rsp(ATT_EXECUTE_WRITE_REQ, 0, AttErrorCode::InvalidPdu),
        }
    }

    /// The apply-write rules shared by `WRITE_REQ`, `WRITE_CMD` and the
    /// prepared-write commit.
    fn server_apply_write(&self, handle: u16, value: &[u8], offset: u16) -> AttErrorCode {
        let Some(db) = &self.server_db else {
            return AttErrorCode::Unlikely;
        };
        let mut db = db.lock().unwrap();
        let Some(loc) = db.locate(handle) else {
            return AttErrorCode::InvalidHandle;
        };
        match loc {
            AttrLoc::CharValue { s, c } => {
                {
                    let chr = &db.services[s].characteristics[c];
                    if offset as usize > chr.value.len() {
                        return AttErrorCode::InvalidOffset;
                    }
                    if offset as usize + value.len() > chr.capacity() {
                        return AttErrorCode::InvalidAttributeValueLength;
                    }
                }
                {
                    let listeners = db.listener_snapshot();
                    let svc = &db.services[s];
                    let chr = &svc.characteristics[c];
                    if !listeners
                        .iter()
                        .all(|l| l.write_char_value(svc, chr, value, offset))
                    {
                        return AttErrorCode::WriteNotPermitted;
                    }
                }
                let chr = &mut db.services[s].characteristics[c];
                let variable = chr.variable_length;
                store_value(&mut chr.value, variable, value, offset);
                AttErrorCode::NoError
            }
            AttrLoc::Desc { s, c, d } => {
                {
                    let desc = &db.services[s].characteristics[c].descriptors[d];
                    if desc.is_user_description() {
                        return AttErrorCode::WriteNotPermitted;
                    }
                    if desc.is_client_char_config() {
                        return self.apply_ccc_write(&mut db, s, c, d, value);
                    }
                    if offset as usize > desc.value.len() {
                        return AttErrorCode::InvalidOffset;
                    }
                    if offset as usize + value.len() > desc.capacity() {
                        return AttErrorCode::InvalidAttributeValueLength;
                    }
                }
                {
                    let listeners = db.listener_snapshot();
                    let svc = &db.services[s];
                    let chr = &svc.characteristics[c];
                    let desc = &chr.descriptors[d];
                    if !listeners
                        .iter()
                        .all(|l| l.write_desc_value(svc, chr, desc, value, offset))
                    {
                        return AttErrorCode::WriteNotPermitted;
                    }
                }
                let desc = &mut db.services[s].characteristics[c].descriptors[d];
                let variable = desc.variable_length;
                store_value(&mut desc.value, variable, value, offset);
                AttErrorCode::NoError
            }
        }
    }

    /// CCC writes bypass the generic write callbacks: unsupported bits are
    /// masked by the characteristic's properties, unchanged or empty
    /// values are a no-op, and a real change is persisted and announced
    /// through the config-changed callback.
    fn apply_ccc_write(
        &self,
        db: &mut GattDb,
        s: usize,
        c: usize,
        d: usize,
        value: &[u8],
    ) -> AttErrorCode {
        if value.is_empty() {
            return AttErrorCode::NoError;
        }
        let requested = u16::from_le_bytes([value[0], value.get(1).copied().unwrap_or(0)]);
        let (new_v, old_v) = {
            let chr = &db.services[s].characteristics[c];
            let has_notify = chr.properties.contains(CharProps::NOTIFY);
            let has_indicate = chr.properties.contains(CharProps::INDICATE);
            let notify = requested & CCC_NOTIFY_BIT != 0 && has_notify;
            let indicate = requested & CCC_INDICATE_BIT != 0 && has_indicate;
            let new_v = (notify as u16) | ((indicate as u16) << 1);
            let desc = &chr.descriptors[d];
            let old_v = if desc.value.len() >= 2 {
                u16::from_le_bytes([desc.value[0], desc.value[1]])
            } else {
                0
            };
            (new_v, old_v)
        };
        if new_v == old_v {
            return AttErrorCode::NoError;
        }
        db.services[s].characteristics[c].descriptors[d].value = new_v.to_le_bytes().to_vec();
        let listeners = db.listener_snapshot();
        let svc = &db.services[s];
        let chr = &svc.characteristics[c];
        for l in listeners.iter() {
            l.ccc_changed(
                svc,
                chr,
                new_v & CCC_NOTIFY_BIT != 0,
                new_v & CCC_INDICATE_BIT != 0,
            );
        }
        AttErrorCode::NoError
    }
}

/// Stores `value` at `offset`, growing variable-length attributes as
/// needed. Bounds were validated by the caller.
fn store_value(target: &mut Vec<u8>, variable_length: bool, value: &[u8], offset: u16) {
    let end = offset as usize + value.len();
    if variable_length && end > target.len() {
        target.resize(end, 0);
    }
    target[offset as usize..end].copy_from_slice(value);
}
