//! Client-side halves of the exchanges the gateway responds to
//!
//! The tests drive the gateway with a hand-rolled initiator built on the
//! same codec and primitive crates, deriving its keys independently so a
//! successful exchange proves both sides agree on the wire format and the
//! key schedule.

#![allow(dead_code, clippy::unwrap_used)]

use ike_crypto::{Cipher, Crypto, DhSecret, Integrity, Prf};
use ike_wire::header::{FLAG_INITIATOR, VERSION_1, VERSION_2};
use ike_wire::message::Message;
use ike_wire::params::{auth_method, cfg, cp_attr, id_type, ExchangeType, PayloadType, TransformType};
use ike_wire::payload::{AuthPayload, CpPayload, IdPayload, IdPayload1, KePayload, Payload};
use ike_wire::proposal::{
    DataAttribute, Proposal, Proposal1, SaPayload, SaPayload1, Transform, Transform1,
};

pub const PSK: &str = "test";
pub const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// A 0.0.0.0/0 traffic selector payload body (one IPv4 address range)
pub fn ts_any() -> Vec<u8> {
    vec![
        1, 0, 0, 0, // one selector
        7, 0, 0, 16, // IPv4 range, any protocol, 16 octets
        0, 0, 0xff, 0xff, // ports 0..65535
        0, 0, 0, 0, // 0.0.0.0
        0xff, 0xff, 0xff, 0xff, // 255.255.255.255
    ]
}

/// An IKEv2 initiator for one SA
pub struct ClientV2 {
    pub spi_i: u64,
    pub spi_r: u64,
    pub nonce_i: Vec<u8>,
    pub nonce_r: Vec<u8>,
    pub sk_d: Vec<u8>,
    pub prf: Prf,
    pub tx: Option<Crypto>,
    pub rx: Option<Crypto>,
    pub sa_init_request: Vec<u8>,
    pub sa_init_response: Vec<u8>,
    dh: DhSecret,
    msgid: u32,
}

impl ClientV2 {
    pub fn new() -> Self {
        Self {
            spi_i: rand::random(),
            spi_r: 0,
            nonce_i: (0..32).map(|_| rand::random()).collect(),
            nonce_r: vec![],
            sk_d: vec![],
            prf: Prf::ikev2(5).unwrap(),
            tx: None,
            rx: None,
            sa_init_request: vec![],
            sa_init_response: vec![],
            dh: DhSecret::generate(14).unwrap(),
            msgid: 0,
        }
    }

    /// The proposal of scenario one: AES-CBC-256 / SHA-256 / PRF-SHA-256 / DH-14
    pub fn ike_proposal() -> SaPayload {
        SaPayload {
            proposals: vec![Proposal {
                number: 1,
                protocol: 1,
                spi: vec![],
                transforms: vec![
                    Transform::encryption(12, 256),
                    Transform::new(TransformType::PseudoRandomFunction, 5),
                    Transform::new(TransformType::IntegrityAlgorithm, 12),
                    Transform::new(TransformType::KeyExchangeMethod, 14),
                ],
            }],
        }
    }

    /// An ESP proposal for AES-CBC-128 / SHA-256 with the given client SPI
    pub fn esp_proposal(spi: [u8; 4]) -> SaPayload {
        SaPayload {
            proposals: vec![Proposal {
                number: 1,
                protocol: 3,
                spi: spi.to_vec(),
                transforms: vec![
                    Transform::encryption(12, 128),
                    Transform::new(TransformType::IntegrityAlgorithm, 12),
                ],
            }],
        }
    }

    pub fn sa_init_request(&mut self) -> Vec<u8> {
        let message = Message::new(
            self.spi_i,
            0,
            VERSION_2,
            ExchangeType::IkeSaInit,
            FLAG_INITIATOR,
            0,
            vec![
                Payload::SecurityAssociation(Self::ike_proposal()),
                Payload::Nonce(self.nonce_i.clone()),
                Payload::KeyExchange(KePayload {
                    dh_group: 14,
                    data: self.dh.public_key().to_vec(),
                }),
            ],
        );
        self.msgid = 1;
        self.sa_init_request = message.to_bytes(None).unwrap();
        self.sa_init_request.clone()
    }

    /// Digest the gateway's IKE_SA_INIT response and derive the SA keys
    pub fn digest_sa_init(&mut self, response: &[u8]) -> Message {
        self.sa_init_response = response.to_vec();
        let mut message = Message::parse(response).unwrap();
        message.parse_payloads(None).unwrap();
        assert_eq!(message.exchange, ExchangeType::IkeSaInit);
        self.spi_r = message.spi_r;

        let Some(Payload::Nonce(nonce_r)) = message.get_payload(PayloadType::Nonce) else {
            panic!("no nonce in IKE_SA_INIT response");
        };
        self.nonce_r = nonce_r.clone();
        let Some(Payload::KeyExchange(ke)) = message.get_payload(PayloadType::KeyExchange) else {
            panic!("no KE in IKE_SA_INIT response");
        };
        let shared = self.dh.agree(&ke.data).unwrap();

        let cipher = Cipher::AesCbc256;
        let integrity = || Integrity::ikev2(12).unwrap();
        let skeyseed = self
            .prf
            .prf(&[self.nonce_i.clone(), self.nonce_r.clone()].concat(), &shared);
        let seed = [
            self.nonce_i.as_slice(),
            &self.nonce_r,
            &self.spi_i.to_be_bytes(),
            &self.spi_r.to_be_bytes(),
        ]
        .concat();
        let keymat = self.prf.prfplus(
            &skeyseed,
            &seed,
            3 * self.prf.key_size() + 2 * integrity().key_size() + 2 * cipher.key_size(),
        );
        let mut offset = 0;
        let mut take = |n: usize| {
            offset += n;
            keymat[offset - n..offset].to_vec()
        };
        self.sk_d = take(self.prf.key_size());
        let sk_ai = take(integrity().key_size());
        let sk_ar = take(integrity().key_size());
        let sk_ei = take(cipher.key_size());
        let sk_er = take(cipher.key_size());
        let sk_pi = take(self.prf.key_size());
        let sk_pr = take(self.prf.key_size());

        self.tx = Some(Crypto::ikev2(cipher, sk_ei, integrity(), sk_ai, self.prf, sk_pi));
        self.rx = Some(Crypto::ikev2(cipher, sk_er, integrity(), sk_ar, self.prf, sk_pr));
        message
    }

    pub fn auth_payload(&self, id_body: &[u8]) -> Vec<u8> {
        let psk = self.prf.prf(PSK.as_bytes(), KEY_PAD);
        let id_hash = self
            .prf
            .prf(&self.tx.as_ref().unwrap().sk_p, id_body);
        self.prf.prf(
            &psk,
            &[self.sa_init_request.as_slice(), &self.nonce_r, &id_hash].concat(),
        )
    }

    /// Build the IKE_AUTH request of scenario one
    pub fn auth_request(&mut self, esp_spi: [u8; 4]) -> Vec<u8> {
        let idi = IdPayload {
            id_type: id_type::ID_FQDN,
            data: b"client@example".to_vec(),
        };
        let auth = self.auth_payload(&Payload::IdInitiator(idi.clone()).body());
        let payloads = vec![
            Payload::IdInitiator(idi),
            Payload::Authentication(AuthPayload {
                method: auth_method::PSK,
                data: auth,
            }),
            Payload::SecurityAssociation(Self::esp_proposal(esp_spi)),
            Payload::TsInitiator(ts_any()),
            Payload::TsResponder(ts_any()),
            Payload::Configuration(CpPayload {
                cfg_type: cfg::CFG_REQUEST,
                attrs: vec![
                    (cp_attr::INTERNAL_IP4_ADDRESS, vec![]),
                    (cp_attr::INTERNAL_IP4_DNS, vec![]),
                ],
            }),
        ];
        self.request(ExchangeType::IkeAuth, payloads)
    }

    /// Force the next request's message id
    pub fn msgid_override(&mut self, msgid: u32) {
        self.msgid = msgid;
    }

    /// Build any encrypted request and advance the message id
    pub fn request(&mut self, exchange: ExchangeType, payloads: Vec<Payload>) -> Vec<u8> {
        let message = Message::new(
            self.spi_i,
            self.spi_r,
            VERSION_2,
            exchange,
            FLAG_INITIATOR,
            self.msgid,
            payloads,
        );
        self.msgid += 1;
        message.to_bytes(Some(self.tx.as_mut().unwrap())).unwrap()
    }

    /// Decrypt and parse a response from the gateway
    pub fn open(&mut self, response: &[u8]) -> Message {
        let mut message = Message::parse(response).unwrap();
        message.parse_payloads(Some(self.rx.as_mut().unwrap())).unwrap();
        message
    }

    /// The child SA contexts: what the client sends with and expects back
    pub fn esp_contexts(&self) -> (Crypto, Crypto) {
        let cipher = Cipher::AesCbc128;
        let integrity = || Integrity::ikev2(12).unwrap();
        let keymat = self.prf.prfplus(
            &self.sk_d,
            &[self.nonce_i.clone(), self.nonce_r.clone()].concat(),
            2 * integrity().key_size() + 2 * cipher.key_size(),
        );
        let mut offset = 0;
        let mut take = |n: usize| {
            offset += n;
            keymat[offset - n..offset].to_vec()
        };
        let sk_ei = take(cipher.key_size());
        let sk_ai = take(integrity().key_size());
        let sk_er = take(cipher.key_size());
        let sk_ar = take(integrity().key_size());
        let tx = Crypto::esp(cipher, sk_ei, integrity(), sk_ai);
        let rx = Crypto::esp(cipher, sk_er, integrity(), sk_ar);
        (tx, rx)
    }
}

/// Seal one client-side ESP frame carrying `inner` as IPv4
pub fn esp_frame(tx: &Crypto, gateway_spi: [u8; 4], seq: u32, inner: &[u8]) -> Vec<u8> {
    let mut frame = gateway_spi.to_vec();
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend(tx.seal_esp(4, inner).unwrap());
    let checksum = tx.mac(&frame).unwrap();
    frame.extend(checksum);
    frame
}

/// Open one gateway-side ESP frame, checking SPI and sequence number
pub fn open_esp_frame(rx: &Crypto, client_spi: [u8; 4], frame: &[u8]) -> (u32, u8, Vec<u8>) {
    assert_eq!(frame[..4], client_spi);
    let seq = u32::from_be_bytes(frame[4..8].try_into().unwrap());
    rx.verify(frame).unwrap();
    let (next_header, inner) = rx
        .open_esp(&frame[8..frame.len() - rx.icv_len()])
        .unwrap();
    (seq, next_header, inner)
}

/// An IKEv1 initiator for one ISAKMP SA
pub struct ClientV1 {
    pub spi_i: u64,
    pub spi_r: u64,
    pub nonce_i: Vec<u8>,
    pub nonce_r: Vec<u8>,
    pub skeyid: Vec<u8>,
    pub skeyid_d: Vec<u8>,
    pub skeyid_a: Vec<u8>,
    pub crypto: Option<Crypto>,
    pub prf: Prf,
    pub sa_body: Vec<u8>,
    pub my_public: Vec<u8>,
    pub peer_public: Vec<u8>,
    dh: DhSecret,
}

impl ClientV1 {
    pub fn new() -> Self {
        Self {
            spi_i: rand::random(),
            spi_r: 0,
            nonce_i: (0..32).map(|_| rand::random()).collect(),
            nonce_r: vec![],
            skeyid: vec![],
            skeyid_d: vec![],
            skeyid_a: vec![],
            crypto: None,
            prf: Prf::ikev1(2).unwrap(),
            sa_body: vec![],
            my_public: vec![],
            peer_public: vec![],
            dh: DhSecret::generate(2).unwrap(),
        }
    }

    /// Main mode message 1: AES-CBC-128 / SHA1 / PSK / MODP-1024
    pub fn sa_request(&mut self) -> Vec<u8> {
        let sa = SaPayload1 {
            doi: 1,
            situation: vec![0, 0, 0, 1],
            proposals: vec![Proposal1 {
                number: 1,
                protocol: 1,
                spi: vec![],
                transforms: vec![Transform1 {
                    number: 1,
                    id: 1, // KEY_IKE
                    attributes: vec![
                        DataAttribute::short(1, 7),   // AES-CBC
                        DataAttribute::short(14, 128),
                        DataAttribute::short(2, 2),   // SHA1
                        DataAttribute::short(3, 1),   // pre-shared key
                        DataAttribute::short(4, 2),   // MODP-1024
                    ],
                }],
            }],
        };
        self.sa_body = Payload::SecurityAssociation1(sa.clone()).body();
        self.plain_request(vec![Payload::SecurityAssociation1(sa)])
    }

    /// Main mode message 3: KE and nonce
    pub fn ke_request(&mut self) -> Vec<u8> {
        self.my_public = self.dh.public_key().to_vec();
        self.plain_request(vec![
            Payload::KeyExchange1(self.my_public.clone()),
            Payload::Nonce1(self.nonce_i.clone()),
        ])
    }

    /// Digest the gateway's KE response and derive the phase 1 secrets
    pub fn digest_ke(&mut self, response: &[u8]) {
        let mut message = Message::parse(response).unwrap();
        message.parse_payloads(None).unwrap();
        let Some(Payload::KeyExchange1(peer_public)) =
            message.get_payload(PayloadType::KeyExchange1)
        else {
            panic!("no KE in response");
        };
        let Some(Payload::Nonce1(nonce_r)) = message.get_payload(PayloadType::Nonce1) else {
            panic!("no nonce in response");
        };
        self.peer_public = peer_public.clone();
        self.nonce_r = nonce_r.clone();
        let shared = self.dh.agree(&self.peer_public).unwrap();

        let cky_i = self.spi_i.to_be_bytes();
        let cky_r = self.spi_r.to_be_bytes();
        self.skeyid = self.prf.prf(
            PSK.as_bytes(),
            &[self.nonce_i.clone(), self.nonce_r.clone()].concat(),
        );
        self.skeyid_d = self
            .prf
            .prf(&self.skeyid, &[shared.as_slice(), &cky_i, &cky_r, &[0]].concat());
        self.skeyid_a = self.prf.prf(
            &self.skeyid,
            &[self.skeyid_d.as_slice(), &shared, &cky_i, &cky_r, &[1]].concat(),
        );
        let skeyid_e = self.prf.prf(
            &self.skeyid,
            &[self.skeyid_a.as_slice(), &shared, &cky_i, &cky_r, &[2]].concat(),
        );

        let cipher = Cipher::AesCbc128;
        let mut iv = self
            .prf
            .hash(&[self.my_public.clone(), self.peer_public.clone()].concat());
        iv.truncate(cipher.block_size());
        self.crypto = Some(Crypto::ikev1(
            cipher,
            skeyid_e[..cipher.key_size()].to_vec(),
            self.prf,
            iv,
        ));
    }

    /// Main mode message 5: identification and authentication hash
    pub fn id_request(&mut self) -> Vec<u8> {
        let id = IdPayload1 {
            id_type: id_type::ID_FQDN,
            protocol: 0,
            port: 0,
            data: b"client.example".to_vec(),
        };
        let cky_i = self.spi_i.to_be_bytes();
        let cky_r = self.spi_r.to_be_bytes();
        let hash_i = self.prf.prf(
            &self.skeyid,
            &[
                self.my_public.as_slice(),
                &self.peer_public,
                &cky_i,
                &cky_r,
                &self.sa_body,
                &Payload::Identification1(id.clone()).body(),
            ]
            .concat(),
        );
        self.encrypted_request(
            ExchangeType::Identity1,
            0,
            vec![Payload::Identification1(id), Payload::Hash1(hash_i)],
        )
    }

    /// A hash-authenticated phase 2 message
    pub fn hashed_request(
        &mut self,
        exchange: ExchangeType,
        message_id: u32,
        mut payloads: Vec<Payload>,
        nonce_prefix: &[u8],
    ) -> Vec<u8> {
        let mut buf = nonce_prefix.to_vec();
        buf.extend(Message::encode_payloads(&payloads));
        let hash = self.prf.prf(
            &self.skeyid_a,
            &[&message_id.to_be_bytes()[..], &buf].concat(),
        );
        payloads.insert(0, Payload::Hash1(hash));
        self.encrypted_request(exchange, message_id, payloads)
    }

    pub fn plain_request(&mut self, payloads: Vec<Payload>) -> Vec<u8> {
        Message::new(
            self.spi_i,
            self.spi_r,
            VERSION_1,
            ExchangeType::Identity1,
            0,
            0,
            payloads,
        )
        .to_bytes(None)
        .unwrap()
    }

    pub fn encrypted_request(
        &mut self,
        exchange: ExchangeType,
        message_id: u32,
        payloads: Vec<Payload>,
    ) -> Vec<u8> {
        Message::new(
            self.spi_i,
            self.spi_r,
            VERSION_1,
            exchange,
            0,
            message_id,
            payloads,
        )
        .to_bytes(Some(self.crypto.as_mut().unwrap()))
        .unwrap()
    }

    /// Decrypt and parse a response or pushed request from the gateway
    pub fn open(&mut self, datagram: &[u8]) -> Message {
        let mut message = Message::parse(datagram).unwrap();
        message
            .parse_payloads(self.crypto.as_mut())
            .unwrap();
        message
    }

    /// Verify the leading hash of a phase 2 message from the gateway
    pub fn check_hash(&self, message: &Message, nonce_prefix: &[u8]) {
        let Some(Payload::Hash1(received)) = message.payloads.first() else {
            panic!("no leading hash payload");
        };
        let mut buf = nonce_prefix.to_vec();
        buf.extend(Message::encode_payloads(&message.payloads[1..]));
        let expected = self.prf.prf(
            &self.skeyid_a,
            &[&message.message_id.to_be_bytes()[..], &buf].concat(),
        );
        assert_eq!(&expected, received, "gateway hash mismatch");
    }
}
