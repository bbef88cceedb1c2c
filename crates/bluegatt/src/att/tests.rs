//! Unit tests for the ATT codec and the response ring
use super::constants::*;
use super::error::AttErrorCode;
use super::pdu::*;
use super::ring::PduRing;
use crate::uuid::Uuid;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn roundtrip(pdu: AttPdu) {
    let wire = pdu.serialize();
    let parsed = AttPdu::parse(&wire).expect("serialized PDU must parse");
    assert_eq!(parsed, pdu, "round-trip mismatch for {}", pdu.name());
}

#[test]
fn every_constructible_variant_roundtrips() {
    let long_uuid = Uuid::from_bytes_le([7u8; 16]);
    let pdus = vec![
        AttPdu::Error(ErrorResponse {
            request_opcode: ATT_READ_REQ,
            handle: 0x0040,
            error_code: AttErrorCode::AttributeNotFound,
        }),
        AttPdu::ExchangeMtuReq(ExchangeMtuRequest { client_mtu: 513 }),
        AttPdu::ExchangeMtuRsp(ExchangeMtuResponse { server_mtu: 247 }),
        AttPdu::FindInformationReq(FindInformationRequest {
            start_handle: 0x0004,
            end_handle: 0x0005,
        }),
        AttPdu::FindInformationRsp(FindInformationResponse::from_entries(vec![
            (0x0004, Uuid::from_u16(GATT_CLIENT_CHAR_CONFIG_UUID)),
            (0x0005, Uuid::from_u16(GATT_USER_DESCRIPTION_UUID)),
        ])),
        AttPdu::FindInformationRsp(FindInformationResponse::from_entries(vec![(
            0x0009, long_uuid,
        )])),
        AttPdu::FindByTypeValueReq(FindByTypeValueRequest {
            start_handle: 1,
            end_handle: 0xFFFF,
            attribute_type: GATT_PRIMARY_SERVICE_UUID,
            attribute_value: vec![0x00, 0x18],
        }),
        AttPdu::FindByTypeValueRsp(FindByTypeValueResponse {
            handles: vec![(1, 7), (8, 11)],
        }),
        AttPdu::ReadByTypeReq(ReadByTypeRequest {
            start_handle: 1,
            end_handle: 11,
            attribute_type: Uuid::from_u16(GATT_CHARACTERISTIC_UUID),
        }),
        AttPdu::ReadByTypeRsp(ReadByTypeResponse {
            element_len: 7,
            elements: vec![HandleValue {
                handle: 2,
                value: vec![0x12, 0x03, 0x00, 0x0B, 0xA0],
            }],
        }),
        AttPdu::ReadReq(ReadRequest { handle: 0x0040 }),
        AttPdu::ReadRsp(ReadResponse {
            value: vec![1, 2, 3],
        }),
        AttPdu::ReadBlobReq(ReadBlobRequest {
            handle: 0x0040,
            offset: 22,
        }),
        AttPdu::ReadBlobRsp(ReadBlobResponse {
            value: vec![4, 5, 6],
        }),
        AttPdu::ReadMultipleReq(ReadMultipleRequest {
            handles: vec![0x0003, 0x0005],
        }),
        AttPdu::ReadMultipleRsp(ReadMultipleResponse {
            values: vec![0xAA, 0xBB, 0xCC],
        }),
        AttPdu::ReadByGroupTypeReq(ReadByGroupTypeRequest {
            start_handle: 1,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(GATT_PRIMARY_SERVICE_UUID),
        }),
        AttPdu::ReadByGroupTypeRsp(ReadByGroupTypeResponse {
            element_len: 6,
            elements: vec![GroupElement {
                handle: 1,
                end_group_handle: 7,
                value: vec![0x0F, 0x18],
            }],
        }),
        AttPdu::WriteReq(WriteRequest {
            handle: 4,
            value: vec![0x01, 0x00],
        }),
        AttPdu::WriteRsp(WriteResponse),
        AttPdu::WriteCmd(WriteCommand {
            handle: 3,
            value: vec![0xFF],
        }),
        AttPdu::PrepareWriteReq(PrepareWriteRequest {
            handle: 3,
            offset: 2,
            value: vec![0x03, 0x04],
        }),
        AttPdu::PrepareWriteRsp(PrepareWriteResponse {
            handle: 3,
            offset: 2,
            value: vec![0x03, 0x04],
        }),
        AttPdu::ExecuteWriteReq(ExecuteWriteRequest {
            flags: ATT_EXEC_WRITE_COMMIT,
        }),
        AttPdu::ExecuteWriteRsp(ExecuteWriteResponse),
        AttPdu::ValueNtf(HandleValueNotification {
            handle: 3,
            value: vec![0xAA, 0xBB],
        }),
        AttPdu::ValueInd(HandleValueIndication {
            handle: 3,
            value: vec![0xCC],
        }),
        AttPdu::ValueCfm(HandleValueConfirmation),
    ];
    for pdu in pdus {
        roundtrip(pdu);
    }
}

#[test]
fn unknown_opcode_is_retained_as_undefined_blob() {
    let frame = vec![0xEE, 0x01, 0x02, 0x03];
    let pdu = AttPdu::parse(&frame).unwrap();
    assert_eq!(pdu, AttPdu::Undefined(frame.clone()));
    assert_eq!(pdu.opcode(), 0xEE);
    assert_eq!(pdu.pdu_type(), PduType::Undefined);
    assert_eq!(pdu.serialize(), frame);
}

#[test]
fn empty_frame_is_malformed() {
    assert!(AttPdu::parse(&[]).is_err());
}

#[test]
fn truncated_frames_are_malformed() {
    // ERROR_RSP is 5 bytes
    assert!(AttPdu::parse(&[ATT_ERROR_RSP, ATT_READ_REQ, 0x40]).is_err());
    // EXCHANGE_MTU_REQ is 3 bytes
    assert!(AttPdu::parse(&[ATT_EXCHANGE_MTU_REQ, 0x17]).is_err());
    // READ_BY_TYPE_REQ takes a 2- or 16-byte UUID only
    assert!(AttPdu::parse(&[ATT_READ_BY_TYPE_REQ, 1, 0, 0xFF, 0xFF, 0x03]).is_err());
}

#[test]
fn declared_element_size_must_cover_the_buffer() {
    // element_len 7, but only 5 body bytes present
    let frame = vec![ATT_READ_BY_TYPE_RSP, 7, 0x02, 0x00, 0x12, 0x03, 0x00];
    assert!(AttPdu::parse(&frame).is_err());

    // group elements of 6 bytes with a trailing partial element
    let mut frame = vec![ATT_READ_BY_GROUP_TYPE_RSP, 6];
    frame.extend_from_slice(&[0x01, 0x00, 0x07, 0x00, 0x0F, 0x18]);
    frame.extend_from_slice(&[0x08, 0x00]);
    assert!(AttPdu::parse(&frame).is_err());
}

#[test]
fn opcode_classification() {
    assert_eq!(pdu_type_of(ATT_READ_REQ), PduType::Request);
    assert_eq!(pdu_type_of(ATT_READ_RSP), PduType::Response);
    assert_eq!(pdu_type_of(ATT_ERROR_RSP), PduType::Response);
    assert_eq!(pdu_type_of(ATT_WRITE_CMD), PduType::Command);
    assert_eq!(pdu_type_of(ATT_SIGNED_WRITE_CMD), PduType::Command);
    assert_eq!(pdu_type_of(ATT_HANDLE_VALUE_NTF), PduType::Notification);
    assert_eq!(pdu_type_of(ATT_HANDLE_VALUE_IND), PduType::Indication);
    assert_eq!(pdu_type_of(ATT_HANDLE_VALUE_CFM), PduType::Confirmation);
    assert_eq!(pdu_type_of(0x55), PduType::Undefined);
}

#[test]
fn error_code_wire_roundtrip_covers_reserved_ranges() {
    for code in 0u8..=255 {
        let decoded = AttErrorCode::from(code);
        let encoded: u8 = decoded.into();
        assert_eq!(encoded, code);
    }
    assert_eq!(AttErrorCode::from(0x85), AttErrorCode::ApplicationError(0x85));
    assert_eq!(
        AttErrorCode::from(0xE2),
        AttErrorCode::CommonProfileError(0xE2)
    );
}

fn inbound(pdu: AttPdu) -> Inbound {
    Inbound {
        pdu,
        ts_creation: Instant::now(),
    }
}

#[test]
fn ring_preserves_fifo_order() {
    let ring = PduRing::new(64);
    ring.put_blocking(inbound(AttPdu::WriteRsp(WriteResponse)));
    ring.put_blocking(inbound(AttPdu::ValueCfm(HandleValueConfirmation)));
    assert_eq!(ring.len(), 2);
    assert_eq!(
        ring.get_blocking(Duration::from_millis(100)).unwrap().pdu,
        AttPdu::WriteRsp(WriteResponse)
    );
    assert_eq!(
        ring.get_blocking(Duration::from_millis(100)).unwrap().pdu,
        AttPdu::ValueCfm(HandleValueConfirmation)
    );
    assert!(ring.is_empty());
}

#[test]
fn ring_pop_times_out_when_empty() {
    let ring = PduRing::new(64);
    let start = Instant::now();
    assert!(ring.get_blocking(Duration::from_millis(50)).is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn ring_put_blocks_until_a_slot_frees_up() {
    let ring = Arc::new(PduRing::new(1));
    ring.put_blocking(inbound(AttPdu::WriteRsp(WriteResponse)));

    let producer = {
        let ring = Arc::clone(&ring);
        std::thread::spawn(move || {
            ring.put_blocking(inbound(AttPdu::ValueCfm(HandleValueConfirmation)));
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    assert!(!producer.is_finished());

    assert!(ring.get_blocking(Duration::from_millis(100)).is_some());
    producer.join().unwrap();
    assert_eq!(ring.len(), 1);
}

#[test]
fn ring_clear_unblocks_a_full_ring_producer() {
    let ring = Arc::new(PduRing::new(1));
    ring.put_blocking(inbound(AttPdu::WriteRsp(WriteResponse)));
    let producer = {
        let ring = Arc::clone(&ring);
        std::thread::spawn(move || {
            ring.put_blocking(inbound(AttPdu::ValueCfm(HandleValueConfirmation)));
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    ring.clear();
    producer.join().unwrap();
}
