//! The payload sum type
//!
//! One arm per payload kind the gateway consumes, keyed by the wire
//! next-payload code; both protocol versions live in the same enum since
//! their numbering never collides. Kinds without a parser keep their raw
//! body and position in the chain, so a message containing them still
//! re-serializes bit-exact (version 1 hashes are computed over
//! re-serialized payload chains).

use log::warn;

use crate::errors::WireError;
use crate::params::PayloadType;
use crate::proposal::{DataAttribute, SaPayload, SaPayload1};

/// A version 2 key exchange payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// The Diffie-Hellman group the data was computed in
    pub dh_group: u16,
    /// The public key exchange data
    pub data: Vec<u8>,
}

/// A version 2 identification payload (IDi and IDr share the format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Id type, see [crate::params::id_type]
    pub id_type: u8,
    /// Identification data
    pub data: Vec<u8>,
}

/// A version 1 identification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload1 {
    /// Id type
    pub id_type: u8,
    /// DOI specific protocol id, 0 or UDP
    pub protocol: u8,
    /// DOI specific port, 0 or 500
    pub port: u16,
    /// Identification data
    pub data: Vec<u8>,
}

/// A version 2 authentication payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method, see [crate::params::auth_method]
    pub method: u8,
    /// Authentication data
    pub data: Vec<u8>,
}

/// A version 2 notify payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol of the SA the notification concerns, 0 if none
    pub protocol: u8,
    /// Notify message type, see [crate::params::notify]
    pub notify_type: u16,
    /// SPI of the SA the notification concerns, empty if none
    pub spi: Vec<u8>,
    /// Type specific notification data
    pub data: Vec<u8>,
}

/// A version 1 notification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload1 {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol of the SA the notification concerns
    pub protocol: u8,
    /// Notify message type
    pub notify_type: u16,
    /// SPI of the SA the notification concerns
    pub spi: Vec<u8>,
    /// Type specific notification data
    pub data: Vec<u8>,
}

/// A version 2 delete payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol: u8,
    /// The deleted SPIs, all of the same size
    pub spis: Vec<Vec<u8>>,
}

/// A version 1 delete payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload1 {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol of the SAs being deleted
    pub protocol: u8,
    /// The deleted SPIs, all of the same size
    pub spis: Vec<Vec<u8>>,
}

/// A version 2 configuration payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpPayload {
    /// CFG_REQUEST / CFG_REPLY / CFG_SET / CFG_ACK
    pub cfg_type: u8,
    /// Attributes as (type, value) pairs in TLV encoding
    pub attrs: Vec<(u16, Vec<u8>)>,
}

impl CpPayload {
    /// First value of the given attribute type
    pub fn attr(&self, attribute_type: u16) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == attribute_type)
            .map(|(_, v)| v.as_slice())
    }
}

/// A version 1 mode config attributes payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpPayload1 {
    /// CFG_REQUEST / CFG_REPLY / CFG_SET / CFG_ACK
    pub cfg_type: u8,
    /// Transaction identifier, echoed in the reply
    pub identifier: u16,
    /// Attributes in data attribute encoding
    pub attrs: Vec<DataAttribute>,
}

impl CpPayload1 {
    /// Whether the given attribute type is present
    pub fn has_attr(&self, attribute_type: u16) -> bool {
        self.attrs.iter().any(|a| a.attribute_type == attribute_type)
    }
}

/// A payload of the chain, tagged by its wire type
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Payload {
    SecurityAssociation1(SaPayload1),
    KeyExchange1(Vec<u8>),
    Identification1(IdPayload1),
    Hash1(Vec<u8>),
    Nonce1(Vec<u8>),
    Notification1(NotifyPayload1),
    Delete1(DeletePayload1),
    VendorId1(Vec<u8>),
    Attributes1(CpPayload1),
    NatDetection1(Vec<u8>),
    SecurityAssociation(SaPayload),
    KeyExchange(KePayload),
    IdInitiator(IdPayload),
    IdResponder(IdPayload),
    Authentication(AuthPayload),
    Nonce(Vec<u8>),
    Notify(NotifyPayload),
    Delete(DeletePayload),
    VendorId(Vec<u8>),
    TsInitiator(Vec<u8>),
    TsResponder(Vec<u8>),
    EncryptedAndAuthenticated(Vec<u8>),
    Configuration(CpPayload),
    /// Anything without a parser, kept raw to preserve the chain
    Unknown(u8, Vec<u8>),
}

impl Payload {
    /// The wire code of this payload
    pub fn kind(&self) -> u8 {
        match self {
            Payload::SecurityAssociation1(_) => PayloadType::SecurityAssociation1 as u8,
            Payload::KeyExchange1(_) => PayloadType::KeyExchange1 as u8,
            Payload::Identification1(_) => PayloadType::Identification1 as u8,
            Payload::Hash1(_) => PayloadType::Hash1 as u8,
            Payload::Nonce1(_) => PayloadType::Nonce1 as u8,
            Payload::Notification1(_) => PayloadType::Notification1 as u8,
            Payload::Delete1(_) => PayloadType::Delete1 as u8,
            Payload::VendorId1(_) => PayloadType::VendorId1 as u8,
            Payload::Attributes1(_) => PayloadType::Attributes1 as u8,
            Payload::NatDetection1(_) => PayloadType::NatDetection1 as u8,
            Payload::SecurityAssociation(_) => PayloadType::SecurityAssociation as u8,
            Payload::KeyExchange(_) => PayloadType::KeyExchange as u8,
            Payload::IdInitiator(_) => PayloadType::IdInitiator as u8,
            Payload::IdResponder(_) => PayloadType::IdResponder as u8,
            Payload::Authentication(_) => PayloadType::Authentication as u8,
            Payload::Nonce(_) => PayloadType::Nonce as u8,
            Payload::Notify(_) => PayloadType::Notify as u8,
            Payload::Delete(_) => PayloadType::Delete as u8,
            Payload::VendorId(_) => PayloadType::VendorId as u8,
            Payload::TsInitiator(_) => PayloadType::TsInitiator as u8,
            Payload::TsResponder(_) => PayloadType::TsResponder as u8,
            Payload::EncryptedAndAuthenticated(_) => PayloadType::EncryptedAndAuthenticated as u8,
            Payload::Configuration(_) => PayloadType::Configuration as u8,
            Payload::Unknown(kind, _) => *kind,
        }
    }

    /// Parse a payload body of the given wire type
    pub fn parse(kind: u8, body: &[u8]) -> Result<Payload, WireError> {
        let known = match PayloadType::try_from(kind) {
            Ok(t) => t,
            Err(_) => {
                warn!("Unknown payload type carried through raw: {kind}");
                return Ok(Payload::Unknown(kind, body.to_vec()));
            }
        };
        Ok(match known {
            PayloadType::SecurityAssociation1 => {
                Payload::SecurityAssociation1(SaPayload1::try_parse(body)?)
            }
            PayloadType::KeyExchange1 => Payload::KeyExchange1(body.to_vec()),
            PayloadType::Identification1 => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::Identification1(IdPayload1 {
                    id_type: body[0],
                    protocol: body[1],
                    port: u16::from_be_bytes([body[2], body[3]]),
                    data: body[4..].to_vec(),
                })
            }
            PayloadType::Hash1 => Payload::Hash1(body.to_vec()),
            PayloadType::Nonce1 => Payload::Nonce1(body.to_vec()),
            PayloadType::Notification1 => {
                if body.len() < 8 {
                    return Err(WireError::BufferTooSmall);
                }
                let spi_size = body[5] as usize;
                let spi_end = 8 + spi_size;
                if body.len() < spi_end {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::Notification1(NotifyPayload1 {
                    doi: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    protocol: body[4],
                    notify_type: u16::from_be_bytes([body[6], body[7]]),
                    spi: body[8..spi_end].to_vec(),
                    data: body[spi_end..].to_vec(),
                })
            }
            PayloadType::Delete1 => {
                if body.len() < 8 {
                    return Err(WireError::BufferTooSmall);
                }
                let spi_size = body[5] as usize;
                let count = u16::from_be_bytes([body[6], body[7]]) as usize;
                Payload::Delete1(DeletePayload1 {
                    doi: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    protocol: body[4],
                    spis: split_spis(&body[8..], spi_size, count)?,
                })
            }
            PayloadType::VendorId1 => Payload::VendorId1(body.to_vec()),
            PayloadType::Attributes1 => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::Attributes1(CpPayload1 {
                    cfg_type: body[0],
                    identifier: u16::from_be_bytes([body[2], body[3]]),
                    attrs: DataAttribute::parse_list(&body[4..])?,
                })
            }
            PayloadType::NatDetection1 => Payload::NatDetection1(body.to_vec()),
            PayloadType::SecurityAssociation => {
                Payload::SecurityAssociation(SaPayload::try_parse(body)?)
            }
            PayloadType::KeyExchange => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::KeyExchange(KePayload {
                    dh_group: u16::from_be_bytes([body[0], body[1]]),
                    data: body[4..].to_vec(),
                })
            }
            PayloadType::IdInitiator | PayloadType::IdResponder => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                let id = IdPayload {
                    id_type: body[0],
                    data: body[4..].to_vec(),
                };
                if known == PayloadType::IdInitiator {
                    Payload::IdInitiator(id)
                } else {
                    Payload::IdResponder(id)
                }
            }
            PayloadType::Authentication => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::Authentication(AuthPayload {
                    method: body[0],
                    data: body[4..].to_vec(),
                })
            }
            PayloadType::Nonce => Payload::Nonce(body.to_vec()),
            PayloadType::Notify => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                let spi_size = body[1] as usize;
                let spi_end = 4 + spi_size;
                if body.len() < spi_end {
                    return Err(WireError::BufferTooSmall);
                }
                Payload::Notify(NotifyPayload {
                    protocol: body[0],
                    notify_type: u16::from_be_bytes([body[2], body[3]]),
                    spi: body[4..spi_end].to_vec(),
                    data: body[spi_end..].to_vec(),
                })
            }
            PayloadType::Delete => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                let spi_size = body[1] as usize;
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                Payload::Delete(DeletePayload {
                    protocol: body[0],
                    spis: split_spis(&body[4..], spi_size, count)?,
                })
            }
            PayloadType::VendorId => Payload::VendorId(body.to_vec()),
            PayloadType::TsInitiator => Payload::TsInitiator(body.to_vec()),
            PayloadType::TsResponder => Payload::TsResponder(body.to_vec()),
            PayloadType::EncryptedAndAuthenticated => {
                Payload::EncryptedAndAuthenticated(body.to_vec())
            }
            PayloadType::Configuration => {
                if body.len() < 4 {
                    return Err(WireError::BufferTooSmall);
                }
                let mut attrs = vec![];
                let mut offset = 4;
                while offset < body.len() {
                    let rest = &body[offset..];
                    if rest.len() < 4 {
                        return Err(WireError::BufferTooSmall);
                    }
                    let attribute_type = u16::from_be_bytes([rest[0], rest[1]]) & 0x7fff;
                    let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
                    let value = rest
                        .get(4..4 + length)
                        .ok_or(WireError::BufferTooSmall)?
                        .to_vec();
                    attrs.push((attribute_type, value));
                    offset += 4 + length;
                }
                Payload::Configuration(CpPayload {
                    cfg_type: body[0],
                    attrs,
                })
            }
            // nested-only or unconsumed kinds stay raw
            _ => Payload::Unknown(kind, body.to_vec()),
        })
    }

    /// Serialize the payload body (without the generic payload header)
    pub fn body(&self) -> Vec<u8> {
        match self {
            Payload::SecurityAssociation1(sa) => sa.build(),
            Payload::KeyExchange1(data)
            | Payload::Hash1(data)
            | Payload::Nonce1(data)
            | Payload::VendorId1(data)
            | Payload::NatDetection1(data)
            | Payload::Nonce(data)
            | Payload::VendorId(data)
            | Payload::TsInitiator(data)
            | Payload::TsResponder(data)
            | Payload::EncryptedAndAuthenticated(data) => data.clone(),
            Payload::Identification1(id) => {
                let mut out = vec![id.id_type, id.protocol];
                out.extend_from_slice(&id.port.to_be_bytes());
                out.extend_from_slice(&id.data);
                out
            }
            Payload::Notification1(n) => {
                let mut out = n.doi.to_be_bytes().to_vec();
                out.push(n.protocol);
                out.push(n.spi.len() as u8);
                out.extend_from_slice(&n.notify_type.to_be_bytes());
                out.extend_from_slice(&n.spi);
                out.extend_from_slice(&n.data);
                out
            }
            Payload::Delete1(d) => {
                let spi_size = d.spis.first().map_or(0, Vec::len);
                let mut out = d.doi.to_be_bytes().to_vec();
                out.push(d.protocol);
                out.push(spi_size as u8);
                out.extend_from_slice(&(d.spis.len() as u16).to_be_bytes());
                for spi in &d.spis {
                    out.extend_from_slice(spi);
                }
                out
            }
            Payload::Attributes1(cp) => {
                let mut out = vec![cp.cfg_type, 0];
                out.extend_from_slice(&cp.identifier.to_be_bytes());
                out.extend(DataAttribute::build_list(&cp.attrs));
                out
            }
            Payload::SecurityAssociation(sa) => sa.build(),
            Payload::KeyExchange(ke) => {
                let mut out = ke.dh_group.to_be_bytes().to_vec();
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&ke.data);
                out
            }
            Payload::IdInitiator(id) | Payload::IdResponder(id) => {
                let mut out = vec![id.id_type, 0, 0, 0];
                out.extend_from_slice(&id.data);
                out
            }
            Payload::Authentication(auth) => {
                let mut out = vec![auth.method, 0, 0, 0];
                out.extend_from_slice(&auth.data);
                out
            }
            Payload::Notify(n) => {
                let mut out = vec![n.protocol, n.spi.len() as u8];
                out.extend_from_slice(&n.notify_type.to_be_bytes());
                out.extend_from_slice(&n.spi);
                out.extend_from_slice(&n.data);
                out
            }
            Payload::Delete(d) => {
                let spi_size = d.spis.first().map_or(0, Vec::len);
                let mut out = vec![d.protocol, spi_size as u8];
                out.extend_from_slice(&(d.spis.len() as u16).to_be_bytes());
                for spi in &d.spis {
                    out.extend_from_slice(spi);
                }
                out
            }
            Payload::Configuration(cp) => {
                let mut out = vec![cp.cfg_type, 0, 0, 0];
                for (attribute_type, value) in &cp.attrs {
                    out.extend_from_slice(&attribute_type.to_be_bytes());
                    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                    out.extend_from_slice(value);
                }
                out
            }
            Payload::Unknown(_, data) => data.clone(),
        }
    }
}

fn split_spis(buf: &[u8], spi_size: usize, count: usize) -> Result<Vec<Vec<u8>>, WireError> {
    if spi_size == 0 {
        return Ok(vec![]);
    }
    if buf.len() < spi_size * count {
        return Err(WireError::BufferTooSmall);
    }
    Ok(buf[..spi_size * count]
        .chunks(spi_size)
        .map(<[u8]>::to_vec)
        .collect())
}
