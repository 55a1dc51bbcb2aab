//! Main mode, XAuth, mode config and quick mode against the gateway

#![allow(clippy::unwrap_used)]

mod common;

use std::net::SocketAddr;

use common::ClientV1;
use ike_wire::message::Message;
use ike_wire::params::{cfg, cp_attr, esp_attr_1, notify, ExchangeType, PayloadType};
use ike_wire::payload::{CpPayload1, NotifyPayload1, Payload};
use ike_wire::proposal::{DataAttribute, Proposal1, SaPayload1, Transform1};
use ikegate::config::Config;
use ikegate::session::{esp_key, ike_key, Entry, State};
use ikegate::Gateway;

async fn gateway() -> std::sync::Arc<Gateway> {
    Gateway::bind_to(Config::default(), "127.0.0.1:0", "127.0.0.1:0")
        .await
        .unwrap()
}

fn client_addr() -> SocketAddr {
    "192.0.2.33:500".parse().unwrap()
}

const CLIENT_ESP_SPI: [u8; 4] = [0xe1, 0xe2, 0xe3, 0xe4];

fn esp_sa(spi: [u8; 4]) -> SaPayload1 {
    SaPayload1 {
        doi: 1,
        situation: vec![0, 0, 0, 1],
        proposals: vec![Proposal1 {
            number: 1,
            protocol: 3,
            spi: spi.to_vec(),
            transforms: vec![Transform1 {
                number: 1,
                id: 12, // ESP_AES
                attributes: vec![
                    DataAttribute::short(esp_attr_1::KEY_LENGTH, 128),
                    DataAttribute::short(esp_attr_1::AUTHENTICATION_ALGORITHM, 2),
                    DataAttribute::short(esp_attr_1::ENCAPSULATION_MODE, 3),
                ],
            }],
        }],
    }
}

fn session_state(gateway: &Gateway, spi_r: u64) -> State {
    match gateway.lock_sessions().get(&ike_key(spi_r)) {
        Some(Entry::V1(session)) => session.state,
        _ => panic!("version 1 session not in the table"),
    }
}

#[tokio::test]
async fn main_mode_xauth_and_quick_mode() {
    let gateway = gateway().await;
    let mut client = ClientV1::new();

    // --- main mode message 1: SA proposal, echoed truncated
    let replies = gateway.process_ike(&client.sa_request(), client_addr());
    assert_eq!(replies.len(), 1);
    let mut response = Message::parse(&replies[0]).unwrap();
    response.parse_payloads(None).unwrap();
    client.spi_r = response.spi_r;
    assert_ne!(client.spi_r, 0);
    let Some(Payload::SecurityAssociation1(sa)) =
        response.get_payload(PayloadType::SecurityAssociation1)
    else {
        panic!("no SA in main mode response");
    };
    assert_eq!(sa.proposals[0].transforms.len(), 1);
    assert_eq!(session_state(&gateway, client.spi_r), State::SaSent);

    // --- main mode message 3: KE and nonces
    let replies = gateway.process_ike(&client.ke_request(), client_addr());
    assert_eq!(replies.len(), 1);
    client.digest_ke(&replies[0]);
    let mut response = Message::parse(&replies[0]).unwrap();
    response.parse_payloads(None).unwrap();
    assert_eq!(
        response.get_payloads(PayloadType::NatDetection1).count(),
        2
    );
    assert_eq!(session_state(&gateway, client.spi_r), State::KeSent);

    // --- main mode message 5: mutual authentication
    let replies = gateway.process_ike(&client.id_request(), client_addr());
    // the ID response plus the unsolicited XAuth request
    assert_eq!(replies.len(), 2);
    let response = client.open(&replies[0]);
    let Some(id_payload @ Payload::Identification1(idr)) =
        response.get_payload(PayloadType::Identification1)
    else {
        panic!("no IDr in main mode response");
    };
    assert_eq!(
        idr.data,
        format!("ikegate-{}", env!("CARGO_PKG_VERSION")).into_bytes()
    );
    let Some(Payload::Hash1(hash_r)) = response.get_payload(PayloadType::Hash1) else {
        panic!("no HASH in main mode response");
    };
    let expected = client.prf.prf(
        &client.skeyid,
        &[
            client.peer_public.as_slice(),
            &client.my_public,
            &client.spi_r.to_be_bytes(),
            &client.spi_i.to_be_bytes(),
            &client.sa_body,
            &id_payload.body(),
        ]
        .concat(),
    );
    assert_eq!(*hash_r, expected);

    let xauth = client.open(&replies[1]);
    assert_eq!(xauth.exchange, ExchangeType::Transaction1);
    client.check_hash(&xauth, &[]);
    let Some(Payload::Attributes1(cp)) = xauth.get_payload(PayloadType::Attributes1) else {
        panic!("no CP in the XAuth push");
    };
    assert_eq!(cp.cfg_type, cfg::CFG_REQUEST);
    assert!(cp.has_attr(cp_attr::XAUTH_USER_NAME));
    assert_eq!(session_state(&gateway, client.spi_r), State::HashSent);

    // --- XAuth credentials; the value is not checked, PSK already did
    let request = client.hashed_request(
        ExchangeType::Transaction1,
        xauth.message_id,
        vec![Payload::Attributes1(CpPayload1 {
            cfg_type: cfg::CFG_REPLY,
            identifier: 0,
            attrs: vec![
                DataAttribute::long(cp_attr::XAUTH_USER_NAME, b"user".to_vec()),
                DataAttribute::long(cp_attr::XAUTH_USER_PASSWORD, b"secret".to_vec()),
            ],
        })],
        &[],
    );
    let replies = gateway.process_ike(&request, client_addr());
    assert_eq!(replies.len(), 1);
    let response = client.open(&replies[0]);
    client.check_hash(&response, &[]);
    let Some(Payload::Attributes1(cp)) = response.get_payload(PayloadType::Attributes1) else {
        panic!("no CP in XAuth status");
    };
    assert_eq!(cp.cfg_type, cfg::CFG_SET);
    assert!(cp.has_attr(cp_attr::XAUTH_STATUS));
    assert_eq!(session_state(&gateway, client.spi_r), State::AuthSet);

    // --- acknowledge the status, no answer expected
    let request = client.hashed_request(
        ExchangeType::Transaction1,
        0x61ac,
        vec![Payload::Attributes1(CpPayload1 {
            cfg_type: cfg::CFG_ACK,
            identifier: 0,
            attrs: vec![DataAttribute::short(cp_attr::XAUTH_STATUS, 1)],
        })],
        &[],
    );
    assert!(gateway.process_ike(&request, client_addr()).is_empty());

    // --- mode config: ask for an address and DNS
    let request = client.hashed_request(
        ExchangeType::Transaction1,
        0x2f11,
        vec![Payload::Attributes1(CpPayload1 {
            cfg_type: cfg::CFG_REQUEST,
            identifier: 42,
            attrs: vec![
                DataAttribute::long(cp_attr::INTERNAL_IP4_ADDRESS, vec![]),
                DataAttribute::long(cp_attr::INTERNAL_IP4_DNS, vec![]),
            ],
        })],
        &[],
    );
    let replies = gateway.process_ike(&request, client_addr());
    assert_eq!(replies.len(), 1);
    let response = client.open(&replies[0]);
    client.check_hash(&response, &[]);
    let Some(Payload::Attributes1(cp)) = response.get_payload(PayloadType::Attributes1) else {
        panic!("no CP in mode config reply");
    };
    assert_eq!(cp.cfg_type, cfg::CFG_REPLY);
    assert_eq!(cp.identifier, 42);
    let address = cp
        .attrs
        .iter()
        .find(|a| a.attribute_type == cp_attr::INTERNAL_IP4_ADDRESS)
        .unwrap();
    assert_eq!(address.value, ike_wire::proposal::AttrValue::Long(vec![10, 0, 0, 1]));
    let dns = cp
        .attrs
        .iter()
        .find(|a| a.attribute_type == cp_attr::INTERNAL_IP4_DNS)
        .unwrap();
    assert_eq!(dns.value, ike_wire::proposal::AttrValue::Long(vec![1, 1, 1, 1]));
    assert_eq!(session_state(&gateway, client.spi_r), State::ConfSent);

    // --- quick mode, two-message form
    let quick_msgid = 0x7a7a7a7a;
    let nonce_q: Vec<u8> = (0..24).map(|_| rand::random()).collect();
    let request = client.hashed_request(
        ExchangeType::Quick1,
        quick_msgid,
        vec![
            Payload::SecurityAssociation1(esp_sa(CLIENT_ESP_SPI)),
            Payload::Nonce1(nonce_q.clone()),
        ],
        &[],
    );
    let replies = gateway.process_ike(&request, client_addr());
    assert_eq!(replies.len(), 1);
    let response = client.open(&replies[0]);
    client.check_hash(&response, &nonce_q);
    let Some(Payload::SecurityAssociation1(sa)) =
        response.get_payload(PayloadType::SecurityAssociation1)
    else {
        panic!("no SA in quick mode response");
    };
    let gateway_spi: [u8; 4] = sa.proposals[0].spi.as_slice().try_into().unwrap();
    assert_ne!(gateway_spi, CLIENT_ESP_SPI);
    let Some(Payload::Nonce1(nonce_r)) = response.get_payload(PayloadType::Nonce1) else {
        panic!("no nonce in quick mode response");
    };
    assert_eq!(nonce_r.len(), nonce_q.len());
    assert_eq!(session_state(&gateway, client.spi_r), State::ChildSaSent);
    {
        let mut sessions = gateway.lock_sessions();
        let sa = sessions.child_mut(gateway_spi).unwrap();
        assert_eq!(sa.spi_out, CLIENT_ESP_SPI);
        assert_eq!(sa.msgid_in, 1);
    }

    // --- the third quick mode message is a bare hash
    let request = client.hashed_request(ExchangeType::Quick1, quick_msgid, vec![], &[]);
    assert!(gateway.process_ike(&request, client_addr()).is_empty());
    assert_eq!(session_state(&gateway, client.spi_r), State::Established);

    // --- dead peer detection gets a fresh responder message id
    let dpd_msgid = 0x1dc0ffee;
    let request = client.hashed_request(
        ExchangeType::Informational1,
        dpd_msgid,
        vec![Payload::Notification1(NotifyPayload1 {
            doi: 1,
            protocol: 1,
            notify_type: notify::R_U_THERE,
            spi: vec![],
            data: vec![],
        })],
        &[],
    );
    let replies = gateway.process_ike(&request, client_addr());
    assert_eq!(replies.len(), 1);
    let response = client.open(&replies[0]);
    assert_ne!(response.message_id, dpd_msgid);
    client.check_hash(&response, &[]);
    let Some(Payload::Notification1(ack)) = response.get_payload(PayloadType::Notification1)
    else {
        panic!("no notification in DPD answer");
    };
    assert_eq!(ack.notify_type, notify::R_U_THERE_ACK);

    // --- deleting the ISAKMP SA tears the tunnel down
    let request = client.hashed_request(
        ExchangeType::Informational1,
        0x00d1e000,
        vec![Payload::Delete1(ike_wire::payload::DeletePayload1 {
            doi: 1,
            protocol: 1,
            spis: vec![client.spi_i.to_be_bytes().to_vec()],
        })],
        &[],
    );
    let replies = gateway.process_ike(&request, client_addr());
    assert_eq!(replies.len(), 1);
    let sessions = gateway.lock_sessions();
    assert!(sessions.get(&ike_key(client.spi_r)).is_none());
    assert!(sessions.get(&esp_key(gateway_spi)).is_none());
}
