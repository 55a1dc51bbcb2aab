//! The ISAKMP/IKEv1 responder state machine
//!
//! Main mode carries the SA, KE+NONCE and ID+HASH round trips of phase 1;
//! the responder then immediately pushes an XAuth credentials request and
//! walks the client through mode config before quick mode installs the
//! child SA. Phase 2 messages after the KE step are encrypted with the
//! phase 1 context and authenticated by an in-message HASH payload over
//! the re-serialized payload chain.

use std::net::IpAddr;

use ike_crypto::{diffie_hellman, Cipher, Crypto, CryptoError, Integrity, Prf};
use ike_wire::header::VERSION_1;
use ike_wire::message::Message;
use ike_wire::params::{attr_1, cfg, cp_attr, esp_attr_1, id_type, notify, ExchangeType, PayloadType, SecurityProtocol};
use ike_wire::payload::{CpPayload1, DeletePayload1, IdPayload1, Payload};
use ike_wire::proposal::{DataAttribute, Transform1};
use tracing::{debug, info};

use crate::config::{local_id, Config};
use crate::session::{ChildSa, SessionError, Sessions, State};

/// How a version 1 response is authenticated
enum HashMsg {
    /// No in-message hash (plain main mode messages)
    None,
    /// `HASH = prf(SKEYID_a, message_id || payloads)`
    Plain,
    /// Quick mode: the peer nonce is prepended inside the prf input
    Nonce(Vec<u8>),
}

/// An ISAKMP SA in the responder role
pub struct Ikev1Session {
    /// Our cookie, the responder cookie of every message of this SA
    pub my_spi: u64,
    /// The initiator's cookie
    pub peer_spi: u64,
    /// Current state of the negotiation
    pub state: State,
    /// The phase 1 crypto context (encryption plus the CBC IV chain)
    pub crypto: Option<Crypto>,
    remote: IpAddr,
    my_nonce: Vec<u8>,
    peer_nonce: Vec<u8>,
    my_public: Vec<u8>,
    peer_public: Vec<u8>,
    skeyid: Vec<u8>,
    skeyid_d: Vec<u8>,
    skeyid_a: Vec<u8>,
    skeyid_e: Vec<u8>,
    sa_bytes: Vec<u8>,
    transform: Option<Transform1>,
}

impl Ikev1Session {
    /// A fresh session for an initiator cookie first seen in main mode
    pub fn new(sessions: &Sessions, peer_spi: u64, remote: IpAddr) -> Self {
        Self {
            my_spi: sessions.fresh_ike_spi(),
            peer_spi,
            state: State::Initial,
            crypto: None,
            remote,
            my_nonce: (0..32).map(|_| rand::random()).collect(),
            peer_nonce: vec![],
            my_public: vec![],
            peer_public: vec![],
            skeyid: vec![],
            skeyid_d: vec![],
            skeyid_a: vec![],
            skeyid_e: vec![],
            sa_bytes: vec![],
            transform: None,
        }
    }

    /// Process one inbound message, appending any responses to `replies`
    pub fn process(
        &mut self,
        config: &Config,
        sessions: &mut Sessions,
        mut request: Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        request.parse_payloads(self.crypto.as_mut())?;

        match request.exchange {
            ExchangeType::Identity1
                if request.get_payload(PayloadType::SecurityAssociation1).is_some() =>
            {
                self.main_mode_sa(&mut request, replies)
            }
            ExchangeType::Identity1
                if request.get_payload(PayloadType::KeyExchange1).is_some() =>
            {
                self.main_mode_ke(config, &request, replies)
            }
            ExchangeType::Identity1
                if request.get_payload(PayloadType::Identification1).is_some() =>
            {
                self.main_mode_id(&request, replies)
            }
            ExchangeType::Transaction1 => self.transaction(config, &mut request, replies),
            ExchangeType::Quick1 if request.payloads.len() == 1 => {
                if !matches!(request.payloads[0], Payload::Hash1(_)) {
                    return Err(SessionError::MissingPayload("HASH"));
                }
                if self.state != State::ChildSaSent {
                    return Err(SessionError::UnexpectedState);
                }
                self.state = State::Established;
                info!(remote = %self.remote, "Quick mode acknowledged, tunnel established");
                Ok(())
            }
            ExchangeType::Quick1 => self.quick_mode(sessions, &mut request, replies),
            ExchangeType::Informational1 => self.informational(sessions, &mut request, replies),
            _ => Err(SessionError::UnhandledExchange),
        }
    }

    /// Main mode message 1: pick the first transform and echo the SA
    fn main_mode_sa(
        &mut self,
        request: &mut Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::Initial {
            return Err(SessionError::UnexpectedState);
        }
        let Some(Payload::SecurityAssociation1(sa)) =
            request.get_payload_mut(PayloadType::SecurityAssociation1)
        else {
            return Err(SessionError::MissingPayload("SA"));
        };
        self.sa_bytes = Payload::SecurityAssociation1(sa.clone()).body();
        let proposal = sa
            .proposals
            .first_mut()
            .ok_or(SessionError::NoProposalChosen)?;
        self.transform = Some(
            proposal
                .transforms
                .first()
                .cloned()
                .ok_or(SessionError::NoProposalChosen)?,
        );
        proposal.transforms.truncate(1);

        let response_payloads = std::mem::take(&mut request.payloads);
        replies.push(self.respond(
            ExchangeType::Identity1,
            response_payloads,
            0,
            false,
            HashMsg::None,
        )?);
        self.state = State::SaSent;
        Ok(())
    }

    /// Main mode message 3: Diffie-Hellman, nonces, SKEYID derivation
    fn main_mode_ke(
        &mut self,
        config: &Config,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::SaSent {
            return Err(SessionError::UnexpectedState);
        }
        let Some(Payload::KeyExchange1(peer_public)) =
            request.get_payload(PayloadType::KeyExchange1)
        else {
            return Err(SessionError::MissingPayload("KE"));
        };
        let Some(Payload::Nonce1(peer_nonce)) = request.get_payload(PayloadType::Nonce1) else {
            return Err(SessionError::MissingPayload("NONCE"));
        };
        let transform = self
            .transform
            .as_ref()
            .ok_or(SessionError::UnexpectedState)?;
        let group = transform
            .attr(attr_1::GROUP_DESCRIPTION)
            .ok_or(SessionError::NoProposalChosen)?;
        let (my_public, shared_secret) = diffie_hellman(group, peer_public)?;
        self.peer_public = peer_public.clone();
        self.my_public = my_public;
        self.peer_nonce = peer_nonce.clone();

        let cipher = Cipher::ikev1(
            transform
                .attr(attr_1::ENCRYPTION_ALGORITHM)
                .ok_or(SessionError::NoProposalChosen)?,
            transform.attr(attr_1::KEY_LENGTH),
        )?;
        let prf = Prf::ikev1(
            transform
                .attr(attr_1::HASH_ALGORITHM)
                .ok_or(SessionError::NoProposalChosen)?,
        )?;

        let cky_i = self.peer_spi.to_be_bytes();
        let cky_r = self.my_spi.to_be_bytes();
        self.skeyid = prf.prf(
            config.passwd.as_bytes(),
            &[self.peer_nonce.as_slice(), &self.my_nonce].concat(),
        );
        self.skeyid_d = prf.prf(
            &self.skeyid,
            &[shared_secret.as_slice(), &cky_i, &cky_r, &[0]].concat(),
        );
        self.skeyid_a = prf.prf(
            &self.skeyid,
            &[self.skeyid_d.as_slice(), &shared_secret, &cky_i, &cky_r, &[1]].concat(),
        );
        self.skeyid_e = prf.prf(
            &self.skeyid,
            &[self.skeyid_a.as_slice(), &shared_secret, &cky_i, &cky_r, &[2]].concat(),
        );
        if self.skeyid_e.len() < cipher.key_size() {
            return Err(CryptoError::InvalidKeyLength.into());
        }
        let mut iv = prf.hash(&[self.peer_public.as_slice(), &self.my_public].concat());
        iv.truncate(cipher.block_size());
        self.crypto = Some(Crypto::ikev1(
            cipher,
            self.skeyid_e[..cipher.key_size()].to_vec(),
            prf,
            iv,
        ));

        let response_payloads = vec![
            Payload::KeyExchange1(self.my_public.clone()),
            Payload::Nonce1(self.my_nonce.clone()),
            Payload::NatDetection1((0..32).map(|_| rand::random()).collect()),
            Payload::NatDetection1((0..32).map(|_| rand::random()).collect()),
        ];
        replies.push(self.respond(
            ExchangeType::Identity1,
            response_payloads,
            0,
            false,
            HashMsg::None,
        )?);
        self.state = State::KeSent;
        Ok(())
    }

    /// Main mode message 5: mutual authentication, then the XAuth push
    fn main_mode_id(
        &mut self,
        request: &Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::KeSent {
            return Err(SessionError::UnexpectedState);
        }
        let Some(payload_id @ Payload::Identification1(_)) =
            request.get_payload(PayloadType::Identification1)
        else {
            return Err(SessionError::MissingPayload("ID"));
        };
        let Some(Payload::Hash1(received)) = request.get_payload(PayloadType::Hash1) else {
            return Err(SessionError::MissingPayload("HASH"));
        };
        let prf = self.prf()?;
        let cky_i = self.peer_spi.to_be_bytes();
        let cky_r = self.my_spi.to_be_bytes();
        let hash_i = prf.prf(
            &self.skeyid,
            &[
                self.peer_public.as_slice(),
                &self.my_public,
                &cky_i,
                &cky_r,
                &self.sa_bytes,
                &payload_id.body(),
            ]
            .concat(),
        );
        if hash_i != *received {
            return Err(SessionError::AuthenticationFailed);
        }

        let response_id = Payload::Identification1(IdPayload1 {
            id_type: id_type::ID_FQDN,
            protocol: 0,
            port: 0,
            data: local_id().into_bytes(),
        });
        let hash_r = prf.prf(
            &self.skeyid,
            &[
                self.my_public.as_slice(),
                &self.peer_public,
                &cky_r,
                &cky_i,
                &self.sa_bytes,
                &response_id.body(),
            ]
            .concat(),
        );
        let response_payloads = vec![response_id, Payload::Hash1(hash_r)];
        replies.push(self.respond(
            ExchangeType::Identity1,
            response_payloads,
            0,
            true,
            HashMsg::None,
        )?);
        self.state = State::HashSent;
        info!(remote = %self.remote, "Phase 1 authenticated, requesting XAuth credentials");
        replies.push(self.xauth_init()?);
        Ok(())
    }

    /// Unsolicited XAuth credentials request sent right after phase 1
    fn xauth_init(&mut self) -> Result<Vec<u8>, SessionError> {
        let attrs = vec![
            DataAttribute::short(cp_attr::XAUTH_TYPE, 0),
            DataAttribute::long(cp_attr::XAUTH_USER_NAME, vec![]),
            DataAttribute::long(cp_attr::XAUTH_USER_PASSWORD, vec![]),
        ];
        let response_payloads = vec![Payload::Attributes1(CpPayload1 {
            cfg_type: cfg::CFG_REQUEST,
            identifier: 0,
            attrs,
        })];
        self.respond(
            ExchangeType::Transaction1,
            response_payloads,
            0,
            true,
            HashMsg::Plain,
        )
    }

    /// XAuth credentials and mode config transactions
    fn transaction(
        &mut self,
        config: &Config,
        request: &mut Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.verify_hash(request)?;
        let Some(Payload::Attributes1(cp)) = request.get_payload(PayloadType::Attributes1) else {
            return Err(SessionError::MissingPayload("CP"));
        };
        let response_payloads = if cp.has_attr(cp_attr::XAUTH_USER_NAME) {
            // the pre-shared key already authenticated the peer, the
            // credential value itself is not checked
            if self.state != State::HashSent {
                return Err(SessionError::UnexpectedState);
            }
            self.state = State::AuthSet;
            vec![Payload::Attributes1(CpPayload1 {
                cfg_type: cfg::CFG_SET,
                identifier: 0,
                attrs: vec![DataAttribute::short(cp_attr::XAUTH_STATUS, 1)],
            })]
        } else if cp.has_attr(cp_attr::INTERNAL_IP4_ADDRESS) {
            if self.state != State::AuthSet {
                return Err(SessionError::UnexpectedState);
            }
            let identifier = cp.identifier;
            self.state = State::ConfSent;
            vec![Payload::Attributes1(CpPayload1 {
                cfg_type: cfg::CFG_REPLY,
                identifier,
                attrs: vec![
                    DataAttribute::long(cp_attr::INTERNAL_IP4_ADDRESS, vec![10, 0, 0, 1]),
                    DataAttribute::long(cp_attr::INTERNAL_IP4_DNS, config.dns.octets().to_vec()),
                ],
            })]
        } else if cp.cfg_type == cfg::CFG_ACK {
            return Ok(());
        } else {
            return Err(SessionError::UnhandledExchange);
        };
        replies.push(self.respond(
            ExchangeType::Transaction1,
            response_payloads,
            request.message_id,
            true,
            HashMsg::Plain,
        )?);
        Ok(())
    }

    /// Quick mode: negotiate and install the child SA
    fn quick_mode(
        &mut self,
        sessions: &mut Sessions,
        request: &mut Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        if self.state != State::ConfSent && sessions.v1_children(self.remote).is_empty() {
            return Err(SessionError::UnexpectedState);
        }
        self.verify_hash(request)?;

        let Some(Payload::Nonce1(nonce)) = request.get_payload_mut(PayloadType::Nonce1) else {
            return Err(SessionError::MissingPayload("NONCE"));
        };
        let peer_nonce: Vec<u8> = std::mem::take(nonce);
        let my_nonce: Vec<u8> = (0..peer_nonce.len()).map(|_| rand::random()).collect();
        *nonce = my_nonce.clone();

        let Some(Payload::SecurityAssociation1(sa)) =
            request.get_payload_mut(PayloadType::SecurityAssociation1)
        else {
            return Err(SessionError::MissingPayload("SA"));
        };
        let proposal = sa
            .proposals
            .first_mut()
            .ok_or(SessionError::NoProposalChosen)?;
        proposal.transforms.truncate(1);
        let transform = proposal
            .transforms
            .first()
            .cloned()
            .ok_or(SessionError::NoProposalChosen)?;
        let protocol = proposal.protocol;
        let spi_out: [u8; 4] = proposal
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::MissingPayload("SPI"))?;
        let spi_in = sessions.fresh_esp_spi();
        proposal.spi = spi_in.to_vec();

        let response_payloads = std::mem::take(&mut request.payloads);
        replies.push(self.respond(
            ExchangeType::Quick1,
            response_payloads,
            request.message_id,
            true,
            HashMsg::Nonce(peer_nonce.clone()),
        )?);

        let cipher = Cipher::esp_v1(transform.id as u16, transform.attr(esp_attr_1::KEY_LENGTH))?;
        let integrity = Integrity::esp_v1(
            transform
                .attr(esp_attr_1::AUTHENTICATION_ALGORITHM)
                .ok_or(SessionError::NoProposalChosen)?,
        )?;
        let prf = self.prf()?;
        let derive = |spi: [u8; 4]| {
            let seed = [&[protocol][..], &spi, &peer_nonce, &my_nonce].concat();
            let keymat = prf.prfplus_1(
                &self.skeyid_d,
                &seed,
                integrity.key_size() + cipher.key_size(),
            );
            (
                keymat[..cipher.key_size()].to_vec(),
                keymat[cipher.key_size()..].to_vec(),
            )
        };
        let (sk_ei, sk_ai) = derive(spi_in);
        let (sk_er, sk_ar) = derive(spi_out);
        let crypto_in = Crypto::esp(cipher, sk_ei, integrity.clone(), sk_ai);
        let crypto_out = Crypto::esp(cipher, sk_er, integrity, sk_ar);
        sessions.insert_child(ChildSa::new(spi_in, spi_out, crypto_in, crypto_out));

        let old_children = sessions.v1_children(self.remote).clone();
        for old in old_children {
            if let Some(old_sa) = sessions.child_mut(old) {
                old_sa.child = Some(spi_in);
            }
        }
        sessions.v1_children(self.remote).push(spi_in);
        self.state = State::ChildSaSent;
        info!(
            remote = %self.remote,
            spi = format_args!("{:02x?}", spi_in),
            "Quick mode child SA installed"
        );
        Ok(())
    }

    /// Hash-authenticated notifications and deletes
    fn informational(
        &mut self,
        sessions: &mut Sessions,
        request: &mut Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.verify_hash(request)?;

        let mut response_payloads = vec![];
        let mut message_id = 0;
        if request.payloads.is_empty() {
            // nothing to answer beyond the hash-authenticated envelope
        } else if let Some(Payload::Delete1(delete)) = request.get_payload(PayloadType::Delete1) {
            if delete.protocol == SecurityProtocol::InternetKeyExchange as u8 {
                self.state = State::Deleted;
                for spi in std::mem::take(sessions.v1_children(self.remote)) {
                    sessions.remove_child(spi);
                }
                response_payloads.push(Payload::Delete1(delete.clone()));
                message_id = request.message_id;
                info!(remote = %self.remote, "ISAKMP SA deleted by peer");
            } else {
                let delete = delete.clone();
                let mut freed = vec![];
                for peer_spi in &delete.spis {
                    let children = sessions.v1_children(self.remote).clone();
                    let found = children.iter().copied().find(|spi_in| {
                        sessions
                            .child_mut(*spi_in)
                            .is_some_and(|sa| sa.spi_out.as_slice() == peer_spi.as_slice())
                    });
                    if let Some(spi_in) = found {
                        sessions.v1_children(self.remote).retain(|s| *s != spi_in);
                        sessions.remove_child(spi_in);
                        freed.push(spi_in.to_vec());
                    }
                }
                response_payloads.push(Payload::Delete1(DeletePayload1 {
                    doi: delete.doi,
                    protocol: delete.protocol,
                    spis: freed,
                }));
                message_id = request.message_id;
            }
        } else if let Some(Payload::Notification1(notification)) =
            request.get_payload(PayloadType::Notification1)
        {
            match notification.notify_type {
                notify::R_U_THERE => {
                    let mut ack = notification.clone();
                    ack.notify_type = notify::R_U_THERE_ACK;
                    response_payloads.push(Payload::Notification1(ack));
                    // answered under a fresh responder message id
                    debug!(remote = %self.remote, "DPD R_U_THERE acknowledged");
                }
                notify::INITIAL_CONTACT_1 => {
                    response_payloads.push(Payload::Notification1(notification.clone()));
                    message_id = request.message_id;
                }
                _ => return Err(SessionError::UnhandledExchange),
            }
        } else {
            return Err(SessionError::UnhandledExchange);
        }
        replies.push(self.respond(
            ExchangeType::Informational1,
            response_payloads,
            message_id,
            true,
            HashMsg::Plain,
        )?);
        Ok(())
    }

    /// Check the leading HASH payload over the remaining chain, removing it
    fn verify_hash(&self, request: &mut Message) -> Result<(), SessionError> {
        if request.payloads.is_empty() {
            return Err(SessionError::MissingPayload("HASH"));
        }
        let Payload::Hash1(received) = request.payloads.remove(0) else {
            return Err(SessionError::MissingPayload("HASH"));
        };
        let chain = Message::encode_payloads(&request.payloads);
        let data = [&request.message_id.to_be_bytes()[..], &chain].concat();
        let expected = self.prf()?.prf(&self.skeyid_a, &data);
        if expected != received {
            return Err(SessionError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Serialize a response, optionally prepending an in-message HASH
    ///
    /// A zero `message_id` together with a hash request allocates a fresh
    /// random id, as for unsolicited transactions and DPD answers.
    fn respond(
        &mut self,
        exchange: ExchangeType,
        mut payloads: Vec<Payload>,
        message_id: u32,
        encrypted: bool,
        hashmsg: HashMsg,
    ) -> Result<Vec<u8>, SessionError> {
        let message_id = match (&hashmsg, message_id) {
            (HashMsg::None, id) => id,
            (_, 0) => rand::random(),
            (_, id) => id,
        };
        if !matches!(hashmsg, HashMsg::None) {
            let mut buf = match &hashmsg {
                HashMsg::Nonce(nonce) => nonce.clone(),
                _ => vec![],
            };
            buf.extend(Message::encode_payloads(&payloads));
            let data = [&message_id.to_be_bytes()[..], &buf].concat();
            let hash = self.prf()?.prf(&self.skeyid_a, &data);
            payloads.insert(0, Payload::Hash1(hash));
        }
        let message = Message::new(
            self.peer_spi,
            self.my_spi,
            VERSION_1,
            exchange,
            0,
            message_id,
            payloads,
        );
        Ok(message.to_bytes(if encrypted { self.crypto.as_mut() } else { None })?)
    }

    fn prf(&self) -> Result<Prf, SessionError> {
        self.crypto
            .as_ref()
            .and_then(|c| c.prf)
            .ok_or(SessionError::UnexpectedState)
    }
}
