#![allow(clippy::unwrap_used)]

use ike_crypto::{Cipher, Crypto, Integrity, Prf};

use crate::header::{FLAG_INITIATOR, FLAG_RESPONSE, VERSION_1, VERSION_2};
use crate::message::Message;
use crate::params::{ExchangeType, PayloadType};
use crate::payload::{NotifyPayload, Payload};
use crate::proposal::{Proposal, SaPayload, Transform};

#[test]
fn parse_empty_packet() {
    let buff = vec![
        0x00, 0x04, 0xc0, 0x1d, 0xb4, 0x00, 0xb0, 0xc9, // initiator
        0x00, 0x00, 0x00, 0x00, 0x11, 0xf1, 0x5b, 0xa3, // responder
        0x00, // next payload
        0x20, // version
        0x25, // exchange type
        0x20, // flags, 0b00100000
        0x3b, 0x9a, 0xc9, 0xff, // message ID
        0x00, 0x00, 0x00, 0x1c, // length
    ];
    let mut packet = Message::parse(buff.as_slice()).unwrap();
    packet.parse_payloads(None).unwrap();
    assert_eq!(packet.spi_i, 1337133713371337);
    assert_eq!(packet.spi_r, 301030307);
    assert_eq!(packet.message_id, 0x3b9ac9ff);
    assert_eq!(packet.exchange, ExchangeType::Informational);
    assert_eq!(packet.flags & FLAG_RESPONSE, FLAG_RESPONSE);
    assert_eq!(packet.payloads.len(), 0);
}

#[test]
fn generate_and_parse_sa_init() {
    let message = Message::new(
        0x48cfb887c03b2e7f,
        0,
        VERSION_2,
        ExchangeType::IkeSaInit,
        FLAG_INITIATOR,
        0,
        vec![
            Payload::SecurityAssociation(SaPayload {
                proposals: vec![Proposal {
                    number: 1,
                    protocol: 1,
                    spi: vec![],
                    transforms: vec![
                        Transform::encryption(12, 128),
                        Transform::new(crate::params::TransformType::PseudoRandomFunction, 5),
                    ],
                }],
            }),
            Payload::Nonce(vec![0x13, 0x37, 0x13, 0x37, 0x13, 0x37, 0x13, 0x37]),
            Payload::Notify(NotifyPayload {
                protocol: 0,
                notify_type: 16388,
                spi: vec![],
                data: vec![0xaa; 20],
            }),
        ],
    );
    let bytes = message.to_bytes(None).unwrap();
    assert_eq!(bytes[16], PayloadType::SecurityAssociation as u8);
    assert_eq!(
        u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize,
        bytes.len()
    );

    let mut parsed = Message::parse(&bytes).unwrap();
    parsed.parse_payloads(None).unwrap();
    assert_eq!(parsed.payloads, message.payloads);
    assert_eq!(parsed.spi_i, 0x48cfb887c03b2e7f);
    assert_eq!(parsed.exchange, ExchangeType::IkeSaInit);
}

#[test]
fn unknown_payloads_are_carried_raw() {
    let message = Message::new(
        1,
        2,
        VERSION_2,
        ExchangeType::Informational,
        FLAG_RESPONSE,
        9,
        vec![
            Payload::Unknown(49, vec![0xde, 0xad]), // GSPM, no parser
            Payload::Nonce(vec![0x01]),
        ],
    );
    let bytes = message.to_bytes(None).unwrap();
    let mut parsed = Message::parse(&bytes).unwrap();
    parsed.parse_payloads(None).unwrap();
    assert_eq!(parsed.payloads, message.payloads);
    // and the chain re-serializes bit-exact
    assert_eq!(parsed.to_bytes(None).unwrap(), bytes);
}

#[test]
fn unknown_critical_payload_is_rejected() {
    let mut bytes = Message::new(
        1,
        2,
        VERSION_2,
        ExchangeType::Informational,
        0,
        0,
        vec![Payload::Unknown(49, vec![])],
    )
    .to_bytes(None)
    .unwrap();
    bytes[29] |= 0x80; // set the critical bit of the first payload
    let mut parsed = Message::parse(&bytes).unwrap();
    assert!(parsed.parse_payloads(None).is_err());
}

fn ike2_crypto() -> Crypto {
    Crypto::ikev2(
        Cipher::AesCbc256,
        vec![0x11; 32],
        Integrity::ikev2(12).unwrap(),
        vec![0x22; 32],
        Prf::ikev2(5).unwrap(),
        vec![0x33; 32],
    )
}

#[test]
fn encrypted_payload_roundtrip() {
    let payloads = vec![
        Payload::IdResponder(crate::payload::IdPayload {
            id_type: 2,
            data: b"gw.example".to_vec(),
        }),
        Payload::Nonce(vec![0x42; 17]),
    ];
    let message = Message::new(
        0xa1a2a3a4a5a6a7a8,
        0xb1b2b3b4b5b6b7b8,
        VERSION_2,
        ExchangeType::IkeAuth,
        FLAG_RESPONSE,
        1,
        payloads.clone(),
    );
    let mut tx = ike2_crypto();
    let bytes = message.to_bytes(Some(&mut tx)).unwrap();
    // outer chain shows only the encrypted payload
    assert_eq!(bytes[16], PayloadType::EncryptedAndAuthenticated as u8);

    let mut parsed = Message::parse(&bytes).unwrap();
    assert!(parsed.payloads.is_empty());
    let mut rx = ike2_crypto();
    parsed.parse_payloads(Some(&mut rx)).unwrap();
    assert_eq!(parsed.payloads, payloads);
}

#[test]
fn encrypted_payload_detects_tampering() {
    let message = Message::new(
        1,
        2,
        VERSION_2,
        ExchangeType::Informational,
        FLAG_RESPONSE,
        2,
        vec![Payload::Nonce(vec![0x55; 8])],
    );
    let mut tx = ike2_crypto();
    let mut bytes = message.to_bytes(Some(&mut tx)).unwrap();
    let n = bytes.len();
    bytes[n - 1] ^= 0x01;
    let mut parsed = Message::parse(&bytes).unwrap();
    let mut rx = ike2_crypto();
    assert!(parsed.parse_payloads(Some(&mut rx)).is_err());
}

#[test]
fn v1_encrypted_tail_roundtrip() {
    let mk = || {
        Crypto::ikev1(
            Cipher::AesCbc128,
            vec![0x77; 16],
            Prf::ikev1(2).unwrap(),
            vec![0x99; 16],
        )
    };
    let payloads = vec![
        Payload::Hash1(vec![0xab; 20]),
        Payload::Nonce1(vec![0xcd; 24]),
    ];
    let message = Message::new(
        0xc1c2c3c4c5c6c7c8,
        0xd1d2d3d4d5d6d7d8,
        VERSION_1,
        ExchangeType::Quick1,
        0,
        0x4711,
        payloads.clone(),
    );
    let mut tx = mk();
    let bytes = message.to_bytes(Some(&mut tx)).unwrap();
    assert_eq!(bytes[19] & 0x01, 0x01); // encryption flag set

    let mut parsed = Message::parse(&bytes).unwrap();
    let mut rx = mk();
    parsed.parse_payloads(Some(&mut rx)).unwrap();
    assert_eq!(parsed.payloads, payloads);
}

#[test]
fn truncated_packets_are_rejected() {
    assert!(Message::parse(&[0u8; 27]).is_err());
    // header length larger than the datagram
    let mut buff = vec![0u8; 28];
    buff[17] = VERSION_2;
    buff[18] = 37;
    buff[27] = 64;
    assert!(Message::parse(&buff).is_err());
}
