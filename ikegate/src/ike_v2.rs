//! The IKEv2 responder state machine
//!
//! One instance per IKE SA, driven exclusively by inbound requests:
//! IKE_SA_INIT derives the SA keys, IKE_AUTH authenticates against the
//! pre-shared key and installs the first child SA, INFORMATIONAL answers
//! liveness checks and deletes, CREATE_CHILD_SA handles both child rekeys
//! and the rekey of the IKE SA itself. Each processed request advances
//! `peer_msgid` and caches the serialized response; a request bearing the
//! previous message id is answered from that cache without re-processing.

use std::net::Ipv4Addr;

use ike_crypto::{diffie_hellman, Cipher, Crypto, Integrity, Prf};
use ike_wire::header::{FLAG_RESPONSE, VERSION_2};
use ike_wire::message::Message;
use ike_wire::params::{
    auth_method, cfg, cp_attr, id_type, notify, ExchangeType, PayloadType, SecurityProtocol,
    TransformType,
};
use ike_wire::payload::{
    AuthPayload, CpPayload, DeletePayload, IdPayload, KePayload, NotifyPayload, Payload,
};
use ike_wire::proposal::{Proposal, SaPayload};
use tracing::{debug, info};

use crate::config::{local_id, Config};
use crate::session::{ike_key, ChildSa, Entry, SessionError, Sessions, State};

const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// An IKEv2 SA in the responder role
pub struct Ikev2Session {
    /// Our SPI, the responder SPI of every message of this SA
    pub my_spi: u64,
    /// The initiator's SPI
    pub peer_spi: u64,
    /// Current state of the exchange
    pub state: State,
    /// Inbound SPIs of the child SAs negotiated over this SA
    pub child_sa: Vec<[u8; 4]>,
    /// Context encrypting our responses
    pub my_crypto: Option<Crypto>,
    /// Context decrypting the peer's requests
    pub peer_crypto: Option<Crypto>,
    peer_msgid: u32,
    my_nonce: Vec<u8>,
    peer_nonce: Vec<u8>,
    sk_d: Vec<u8>,
    request_data: Vec<u8>,
    response_data: Vec<u8>,
}

impl Ikev2Session {
    /// A fresh session for a peer SPI first seen in an IKE_SA_INIT
    pub fn new(sessions: &Sessions, peer_spi: u64) -> Self {
        Self {
            my_spi: sessions.fresh_ike_spi(),
            peer_spi,
            state: State::Initial,
            child_sa: vec![],
            my_crypto: None,
            peer_crypto: None,
            peer_msgid: 0,
            my_nonce: random_nonce(),
            peer_nonce: vec![],
            sk_d: vec![],
            request_data: vec![],
            response_data: vec![],
        }
    }

    /// Process one inbound request, appending any responses to `replies`
    pub fn process(
        &mut self,
        config: &Config,
        sessions: &mut Sessions,
        mut request: Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if request.message_id == self.peer_msgid.wrapping_sub(1) {
            debug!(msgid = request.message_id, "Retransmit, answering from cache");
            replies.push(self.response_data.clone());
            return Ok(());
        }
        if request.message_id != self.peer_msgid {
            debug!(
                msgid = request.message_id,
                expected = self.peer_msgid,
                "Message id outside the window, dropped"
            );
            return Ok(());
        }
        request.parse_payloads(self.peer_crypto.as_mut())?;

        match request.exchange {
            ExchangeType::IkeSaInit => self.ike_sa_init(&request, replies),
            ExchangeType::IkeAuth => self.ike_auth(config, sessions, &request, replies),
            ExchangeType::Informational => self.informational(sessions, &request, replies),
            ExchangeType::CreateChildSa => self.create_child_sa(sessions, &request, replies),
            _ => Err(SessionError::UnhandledExchange),
        }
    }

    fn ike_sa_init(
        &mut self,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::Initial {
            return Err(SessionError::UnexpectedState);
        }
        self.peer_nonce = nonce_of(request)?.to_vec();
        let chosen = sa_of(request)?
            .chosen_aes_cbc()
            .ok_or(SessionError::NoProposalChosen)?;
        let ke = ke_of(request)?;
        let (public_key, shared_secret) = diffie_hellman(ke.dh_group, &ke.data)?;
        self.create_key(&chosen, &shared_secret, None)?;

        let response_payloads = vec![
            Payload::SecurityAssociation(SaPayload {
                proposals: vec![chosen],
            }),
            Payload::Nonce(self.my_nonce.clone()),
            Payload::KeyExchange(KePayload {
                dh_group: ke.dh_group,
                data: public_key,
            }),
            nat_detection(notify::NAT_DETECTION_DESTINATION_IP),
            nat_detection(notify::NAT_DETECTION_SOURCE_IP),
        ];
        replies.push(self.respond(ExchangeType::IkeSaInit, response_payloads, false)?);
        self.state = State::SaSent;
        self.request_data = request.raw().to_vec();
        info!(spi = format_args!("{:016x}", self.my_spi), "IKE_SA_INIT answered");
        Ok(())
    }

    fn ike_auth(
        &mut self,
        config: &Config,
        sessions: &mut Sessions,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::SaSent {
            return Err(SessionError::UnexpectedState);
        }
        let Some(Payload::IdInitiator(idi)) = request.get_payload(PayloadType::IdInitiator) else {
            return Err(SessionError::MissingPayload("IDi"));
        };
        let Some(Payload::Authentication(auth)) = request.get_payload(PayloadType::Authentication)
        else {
            // an IKE_AUTH without AUTH asks for EAP, which is out of scope
            return Err(SessionError::UnhandledExchange);
        };
        let idi_bytes = Payload::IdInitiator(idi.clone()).body();
        let sk_pi = self
            .peer_crypto
            .as_ref()
            .ok_or(SessionError::UnexpectedState)?
            .sk_p
            .clone();
        let expected = self.auth_data(config, &self.request_data, &self.my_nonce, &idi_bytes, &sk_pi)?;
        if expected != auth.data {
            return Err(SessionError::AuthenticationFailed);
        }

        let mut chosen = sa_of(request)?
            .chosen_aes_cbc()
            .ok_or(SessionError::NoProposalChosen)?;
        let peer_nonce = self.peer_nonce.clone();
        let my_nonce = self.my_nonce.clone();
        let spi_in = self.create_child_key(sessions, &chosen, &peer_nonce, &my_nonce)?;
        chosen.spi = spi_in.to_vec();

        let idr = IdPayload {
            id_type: id_type::ID_FQDN,
            data: local_id().into_bytes(),
        };
        let idr_bytes = Payload::IdResponder(idr.clone()).body();
        let sk_pr = self
            .my_crypto
            .as_ref()
            .ok_or(SessionError::UnexpectedState)?
            .sk_p
            .clone();
        let auth_r = self.auth_data(config, &self.response_data, &self.peer_nonce, &idr_bytes, &sk_pr)?;

        let mut response_payloads = vec![
            Payload::SecurityAssociation(SaPayload {
                proposals: vec![chosen],
            }),
            cloned_payload(request, PayloadType::TsInitiator)?,
            cloned_payload(request, PayloadType::TsResponder)?,
            Payload::IdResponder(idr),
            Payload::Authentication(AuthPayload {
                method: auth_method::PSK,
                data: auth_r,
            }),
        ];
        if request.get_payload(PayloadType::Configuration).is_some() {
            response_payloads.push(Payload::Configuration(CpPayload {
                cfg_type: cfg::CFG_REPLY,
                attrs: vec![
                    (
                        cp_attr::INTERNAL_IP4_ADDRESS,
                        Ipv4Addr::new(1, 0, 0, 1).octets().to_vec(),
                    ),
                    (cp_attr::INTERNAL_IP4_DNS, config.dns.octets().to_vec()),
                ],
            }));
        }
        replies.push(self.respond(ExchangeType::IkeAuth, response_payloads, true)?);
        self.state = State::Established;
        info!(
            spi = format_args!("{:016x}", self.my_spi),
            "IKE SA established, child SA installed"
        );
        Ok(())
    }

    fn informational(
        &mut self,
        sessions: &mut Sessions,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::Established {
            return Err(SessionError::UnexpectedState);
        }
        let mut response_payloads = vec![];
        if request.payloads.is_empty() {
            // liveness check, answered with an empty acknowledgement
        } else if let Some(Payload::Delete(delete)) = request.get_payload(PayloadType::Delete) {
            if delete.protocol == SecurityProtocol::InternetKeyExchange as u8 {
                self.state = State::Deleted;
                for spi in self.child_sa.drain(..) {
                    sessions.remove_child(spi);
                }
                response_payloads.push(Payload::Delete(delete.clone()));
                info!(spi = format_args!("{:016x}", self.my_spi), "IKE SA deleted by peer");
            } else {
                let mut freed = vec![];
                for peer_spi in &delete.spis {
                    let found = self.child_sa.iter().copied().find(|spi_in| {
                        sessions
                            .child_mut(*spi_in)
                            .is_some_and(|sa| sa.spi_out.as_slice() == peer_spi.as_slice())
                    });
                    if let Some(spi_in) = found {
                        self.child_sa.retain(|s| *s != spi_in);
                        sessions.remove_child(spi_in);
                        freed.push(spi_in.to_vec());
                    }
                }
                response_payloads.push(Payload::Delete(DeletePayload {
                    protocol: delete.protocol,
                    spis: freed,
                }));
            }
        } else {
            return Err(SessionError::UnhandledExchange);
        }
        replies.push(self.respond(ExchangeType::Informational, response_payloads, true)?);
        Ok(())
    }

    fn create_child_sa(
        &mut self,
        sessions: &mut Sessions,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::Established {
            return Err(SessionError::UnexpectedState);
        }
        let mut chosen = sa_of(request)?
            .chosen_aes_cbc()
            .ok_or(SessionError::NoProposalChosen)?;

        let response_payloads = if chosen.protocol != SecurityProtocol::InternetKeyExchange as u8 {
            // child SA rekey, named by the REKEY_SA notification
            let rekey = request
                .get_payloads(PayloadType::Notify)
                .find_map(|p| match p {
                    Payload::Notify(n) if n.notify_type == notify::REKEY_SA => Some(n),
                    _ => None,
                })
                .ok_or(SessionError::UnhandledExchange)?;
            let old_spi_in = self
                .child_sa
                .iter()
                .copied()
                .find(|spi_in| {
                    sessions
                        .child_mut(*spi_in)
                        .is_some_and(|sa| sa.spi_out.as_slice() == rekey.spi.as_slice())
                })
                .ok_or(SessionError::UnknownSpi)?;

            let peer_nonce = nonce_of(request)?.to_vec();
            let my_nonce = random_nonce();
            let spi_in = self.create_child_key(sessions, &chosen, &peer_nonce, &my_nonce)?;
            chosen.spi = spi_in.to_vec();
            if let Some(old) = sessions.child_mut(old_spi_in) {
                old.child = Some(spi_in);
            }
            info!(
                old = format_args!("{:02x?}", old_spi_in),
                new = format_args!("{:02x?}", spi_in),
                "Child SA rekeyed"
            );
            vec![
                Payload::Notify(NotifyPayload {
                    protocol: chosen.protocol,
                    notify_type: notify::REKEY_SA,
                    spi: old_spi_in.to_vec(),
                    data: vec![],
                }),
                Payload::Nonce(my_nonce),
                Payload::SecurityAssociation(SaPayload {
                    proposals: vec![chosen],
                }),
                cloned_payload(request, PayloadType::TsInitiator)?,
                cloned_payload(request, PayloadType::TsResponder)?,
            ]
        } else {
            // rekey of the IKE SA itself: a fresh session object inherits
            // the child SA list, keyed from the old SK_d
            let peer_spi = u64::from_be_bytes(
                chosen
                    .spi
                    .as_slice()
                    .try_into()
                    .map_err(|_| SessionError::MissingPayload("SPI"))?,
            );
            let mut child = Ikev2Session::new(sessions, peer_spi);
            child.state = State::Established;
            child.peer_nonce = nonce_of(request)?.to_vec();
            child.child_sa = std::mem::take(&mut self.child_sa);
            let ke = ke_of(request)?;
            let (public_key, shared_secret) = diffie_hellman(ke.dh_group, &ke.data)?;
            chosen.spi = child.my_spi.to_be_bytes().to_vec();
            child.create_key(&chosen, &shared_secret, Some(&self.sk_d))?;
            let response = vec![
                Payload::SecurityAssociation(SaPayload {
                    proposals: vec![chosen],
                }),
                Payload::Nonce(child.my_nonce.clone()),
                Payload::KeyExchange(KePayload {
                    dh_group: ke.dh_group,
                    data: public_key,
                }),
            ];
            info!(
                old = format_args!("{:016x}", self.my_spi),
                new = format_args!("{:016x}", child.my_spi),
                "IKE SA rekeyed"
            );
            sessions.insert(ike_key(child.my_spi), Entry::V2(child));
            response
        };
        replies.push(self.respond(ExchangeType::CreateChildSa, response_payloads, true)?);
        Ok(())
    }

    /// Derive the IKE SA keys from a chosen proposal and DH secret
    fn create_key(
        &mut self,
        proposal: &Proposal,
        shared_secret: &[u8],
        old_sk_d: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        let (cipher, integrity) = negotiated(proposal)?;
        let prf = Prf::ikev2(
            proposal
                .get_transform(TransformType::PseudoRandomFunction)
                .ok_or(SessionError::NoProposalChosen)?
                .id,
        )?;

        let skeyseed = match old_sk_d {
            None => {
                let key = [self.peer_nonce.as_slice(), &self.my_nonce].concat();
                prf.prf(&key, shared_secret)
            }
            Some(old) => {
                let data = [shared_secret, &self.peer_nonce, &self.my_nonce].concat();
                prf.prf(old, &data)
            }
        };
        let seed = [
            self.peer_nonce.as_slice(),
            &self.my_nonce,
            &self.peer_spi.to_be_bytes(),
            &self.my_spi.to_be_bytes(),
        ]
        .concat();
        let keymat = prf.prfplus(
            &skeyseed,
            &seed,
            3 * prf.key_size() + 2 * integrity.key_size() + 2 * cipher.key_size(),
        );
        let mut take = consume(&keymat);
        self.sk_d = take(prf.key_size());
        let sk_ai = take(integrity.key_size());
        let sk_ar = take(integrity.key_size());
        let sk_ei = take(cipher.key_size());
        let sk_er = take(cipher.key_size());
        let sk_pi = take(prf.key_size());
        let sk_pr = take(prf.key_size());

        self.my_crypto = Some(Crypto::ikev2(
            cipher,
            sk_er,
            integrity.clone(),
            sk_ar,
            prf,
            sk_pr,
        ));
        self.peer_crypto = Some(Crypto::ikev2(cipher, sk_ei, integrity, sk_ai, prf, sk_pi));
        Ok(())
    }

    /// Derive and install a child SA, returning its inbound SPI
    fn create_child_key(
        &mut self,
        sessions: &mut Sessions,
        proposal: &Proposal,
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<[u8; 4], SessionError> {
        let (cipher, integrity) = negotiated(proposal)?;
        let prf = self
            .my_crypto
            .as_ref()
            .and_then(|c| c.prf)
            .ok_or(SessionError::UnexpectedState)?;
        let seed = [nonce_i, nonce_r].concat();
        let keymat = prf.prfplus(
            &self.sk_d,
            &seed,
            2 * integrity.key_size() + 2 * cipher.key_size(),
        );
        let mut take = consume(&keymat);
        let sk_ei = take(cipher.key_size());
        let sk_ai = take(integrity.key_size());
        let sk_er = take(cipher.key_size());
        let sk_ar = take(integrity.key_size());

        let spi_out: [u8; 4] = proposal
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::MissingPayload("SPI"))?;
        let spi_in = sessions.fresh_esp_spi();
        let crypto_in = Crypto::esp(cipher, sk_ei, integrity.clone(), sk_ai);
        let crypto_out = Crypto::esp(cipher, sk_er, integrity, sk_ar);
        sessions.insert_child(ChildSa::new(spi_in, spi_out, crypto_in, crypto_out));
        self.child_sa.push(spi_in);
        Ok(spi_in)
    }

    /// `prf(prf(PSK, pad), message || nonce || prf(SK_p, id))`
    fn auth_data(
        &self,
        config: &Config,
        message_data: &[u8],
        nonce: &[u8],
        id_payload: &[u8],
        sk_p: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let prf = self
            .peer_crypto
            .as_ref()
            .and_then(|c| c.prf)
            .ok_or(SessionError::UnexpectedState)?;
        let psk = prf.prf(config.passwd.as_bytes(), KEY_PAD);
        let id_hash = prf.prf(sk_p, id_payload);
        let data = [message_data, nonce, &id_hash].concat();
        Ok(prf.prf(&psk, &data))
    }

    /// Serialize a response under the current message id, advance it and
    /// cache the bytes for retransmit handling
    fn respond(
        &mut self,
        exchange: ExchangeType,
        payloads: Vec<Payload>,
        encrypted: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let message = Message::new(
            self.peer_spi,
            self.my_spi,
            VERSION_2,
            exchange,
            FLAG_RESPONSE,
            self.peer_msgid,
            payloads,
        );
        let bytes = message.to_bytes(if encrypted {
            self.my_crypto.as_mut()
        } else {
            None
        })?;
        self.peer_msgid += 1;
        self.response_data = bytes.clone();
        Ok(bytes)
    }
}

fn negotiated(proposal: &Proposal) -> Result<(Cipher, Integrity), SessionError> {
    let encryption = proposal
        .get_transform(TransformType::EncryptionAlgorithm)
        .ok_or(SessionError::NoProposalChosen)?;
    let cipher = Cipher::ikev2(encryption.id, encryption.key_length())?;
    let integrity = Integrity::ikev2(
        proposal
            .get_transform(TransformType::IntegrityAlgorithm)
            .ok_or(SessionError::NoProposalChosen)?
            .id,
    )?;
    Ok((cipher, integrity))
}

/// Split borrowed key material into consecutive chunks
fn consume(keymat: &[u8]) -> impl FnMut(usize) -> Vec<u8> + '_ {
    let mut offset = 0;
    move |n| {
        let chunk = keymat[offset..offset + n].to_vec();
        offset += n;
        chunk
    }
}

fn random_nonce() -> Vec<u8> {
    let len = 16 + rand::random::<usize>() % 240;
    (0..len).map(|_| rand::random()).collect()
}

fn nat_detection(notify_type: u16) -> Payload {
    Payload::Notify(NotifyPayload {
        protocol: 0,
        notify_type,
        spi: vec![],
        data: (0..20).map(|_| rand::random()).collect(),
    })
}

fn nonce_of(request: &Message) -> Result<&[u8], SessionError> {
    match request.get_payload(PayloadType::Nonce) {
        Some(Payload::Nonce(nonce)) => Ok(nonce),
        _ => Err(SessionError::MissingPayload("NONCE")),
    }
}

fn sa_of(request: &Message) -> Result<&SaPayload, SessionError> {
    match request.get_payload(PayloadType::SecurityAssociation) {
        Some(Payload::SecurityAssociation(sa)) => Ok(sa),
        _ => Err(SessionError::MissingPayload("SA")),
    }
}

fn ke_of(request: &Message) -> Result<&KePayload, SessionError> {
    match request.get_payload(PayloadType::KeyExchange) {
        Some(Payload::KeyExchange(ke)) => Ok(ke),
        _ => Err(SessionError::MissingPayload("KE")),
    }
}

fn cloned_payload(request: &Message, kind: PayloadType) -> Result<Payload, SessionError> {
    request
        .get_payload(kind)
        .cloned()
        .ok_or(SessionError::MissingPayload("TS"))
}
