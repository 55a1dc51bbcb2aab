//! The message codec
//!
//! Parsing happens in two phases: [Message::parse] always succeeds on a
//! well-formed header and keeps the raw datagram, [Message::parse_payloads]
//! walks the payload chain and needs a [Crypto] context once a version 2
//! encrypted payload or a version 1 encrypted tail is involved. Generation
//! recomputes every next-payload and length field from the payload list.

use ike_crypto::Crypto;
use zerocopy::network_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::errors::WireError;
use crate::header::{GenericPayloadHeader, Header, FLAG_CRITICAL, FLAG_ENCRYPTION, VERSION_1, VERSION_2};
use crate::params::{ExchangeType, PayloadType};
use crate::payload::Payload;

/// A message of either protocol version
#[derive(Debug)]
pub struct Message {
    /// SPI chosen by the exchange initiator
    pub spi_i: u64,
    /// SPI chosen by the responder, zero before it answered
    pub spi_r: u64,
    /// Raw version octet, [VERSION_1] or [VERSION_2]
    pub version: u8,
    /// The exchange this message belongs to
    pub exchange: ExchangeType,
    /// Raw flag bits
    pub flags: u8,
    /// Message id, zero during phase 1 / IKE_SA_INIT
    pub message_id: u32,
    /// The parsed payload chain, empty until [Message::parse_payloads] ran
    pub payloads: Vec<Payload>,
    first_payload: u8,
    raw: Vec<u8>,
}

impl Message {
    /// Construct a message for generation
    pub fn new(
        spi_i: u64,
        spi_r: u64,
        version: u8,
        exchange: ExchangeType,
        flags: u8,
        message_id: u32,
        payloads: Vec<Payload>,
    ) -> Self {
        Self {
            spi_i,
            spi_r,
            version,
            exchange,
            flags,
            message_id,
            payloads,
            first_payload: 0,
            raw: vec![],
        }
    }

    /// Phase one: parse the fixed header and keep the raw datagram
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let header = Header::ref_from_prefix(buf).ok_or(WireError::BufferTooSmall)?;
        if header.version != VERSION_1 && header.version != VERSION_2 {
            return Err(WireError::UnsupportedVersion(header.version));
        }
        let length = header.length.get() as usize;
        if length < size_of::<Header>() || length > buf.len() {
            return Err(WireError::BufferTooSmall);
        }
        Ok(Self {
            spi_i: header.initiator_spi.get(),
            spi_r: header.responder_spi.get(),
            version: header.version,
            exchange: ExchangeType::try_from(header.exchange_type)?,
            flags: header.flags,
            message_id: header.message_id.get(),
            payloads: vec![],
            first_payload: header.next_payload,
            raw: buf[..length].to_vec(),
        })
    }

    /// The raw datagram this message was parsed from
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Phase two: walk the payload chain, decrypting where necessary
    pub fn parse_payloads(&mut self, mut crypto: Option<&mut Crypto>) -> Result<(), WireError> {
        let buf = &self.raw[size_of::<Header>()..];

        if self.version == VERSION_1 && self.flags & FLAG_ENCRYPTION != 0 {
            let crypto = crypto.as_deref_mut().ok_or(WireError::MissingCrypto)?;
            let plain = crypto.decrypt_1(buf, self.message_id)?;
            self.payloads = parse_chain(&plain, self.first_payload)?;
            return Ok(());
        }

        let mut payloads = vec![];
        let mut next = self.first_payload;
        let mut offset = 0;
        while next != PayloadType::NoNextPayload as u8 {
            let header = GenericPayloadHeader::ref_from_prefix(&buf[offset..])
                .ok_or(WireError::BufferTooSmall)?;
            let length = header.payload_length.get() as usize;
            if length < size_of::<GenericPayloadHeader>() || offset + length > buf.len() {
                return Err(WireError::BufferTooSmall);
            }
            let body = &buf[offset + size_of::<GenericPayloadHeader>()..offset + length];

            if next == PayloadType::EncryptedAndAuthenticated as u8 {
                // The encrypted payload must be the last payload of a
                // packet; its checksum covers the whole message.
                let crypto = crypto.as_deref_mut().ok_or(WireError::MissingCrypto)?;
                crypto.verify(&self.raw)?;
                let inner = body
                    .len()
                    .checked_sub(crypto.icv_len())
                    .ok_or(WireError::BufferTooSmall)?;
                let plain = crypto.open_sk(&body[..inner])?;
                payloads.extend(parse_chain(&plain, header.next_payload)?);
                break;
            }

            let payload = Payload::parse(next, body)?;
            if let Payload::Unknown(kind, _) = &payload {
                if header.reserved & FLAG_CRITICAL != 0 {
                    return Err(WireError::UnknownCriticalPayload(*kind));
                }
            }
            payloads.push(payload);
            next = header.next_payload;
            offset += length;
        }
        self.payloads = payloads;
        Ok(())
    }

    /// First payload of the given type
    pub fn get_payload(&self, kind: PayloadType) -> Option<&Payload> {
        self.payloads.iter().find(|p| p.kind() == kind as u8)
    }

    /// Mutable access to the first payload of the given type
    pub fn get_payload_mut(&mut self, kind: PayloadType) -> Option<&mut Payload> {
        self.payloads.iter_mut().find(|p| p.kind() == kind as u8)
    }

    /// All payloads of the given type
    pub fn get_payloads(&self, kind: PayloadType) -> impl Iterator<Item = &Payload> {
        self.payloads.iter().filter(move |p| p.kind() == kind as u8)
    }

    /// Serialize a payload chain with recomputed next-payload links
    pub fn encode_payloads(payloads: &[Payload]) -> Vec<u8> {
        let mut out = vec![];
        for (i, payload) in payloads.iter().enumerate() {
            let body = payload.body();
            let next = payloads
                .get(i + 1)
                .map_or(PayloadType::NoNextPayload as u8, Payload::kind);
            out.push(next);
            out.push(0);
            out.extend_from_slice(
                &((size_of::<GenericPayloadHeader>() + body.len()) as u16).to_be_bytes(),
            );
            out.extend(body);
        }
        out
    }

    /// Serialize the message; with a [Crypto] context the payload chain is
    /// wrapped into an encrypted payload (version 2) or encrypted in place
    /// behind the header (version 1)
    pub fn to_bytes(&self, crypto: Option<&mut Crypto>) -> Result<Vec<u8>, WireError> {
        let chain = Self::encode_payloads(&self.payloads);
        let first = self
            .payloads
            .first()
            .map_or(PayloadType::NoNextPayload as u8, Payload::kind);

        let Some(crypto) = crypto else {
            return Ok(self.assemble(first, self.flags, &chain, 0));
        };

        if self.version == VERSION_1 {
            let encrypted = crypto.encrypt_1(&chain, self.message_id)?;
            return Ok(self.assemble(first, self.flags | FLAG_ENCRYPTION, &encrypted, 0));
        }

        let sk_body = crypto.seal_sk(&chain)?;
        let icv_len = crypto.icv_len();
        let sk_length = size_of::<GenericPayloadHeader>() + sk_body.len() + icv_len;
        let mut tail = Vec::with_capacity(sk_length);
        tail.push(first);
        tail.push(0);
        tail.extend_from_slice(&(sk_length as u16).to_be_bytes());
        tail.extend(sk_body);
        let mut out = self.assemble(
            PayloadType::EncryptedAndAuthenticated as u8,
            self.flags,
            &tail,
            icv_len,
        );
        let checksum = crypto.mac(&out)?;
        out.extend(checksum);
        Ok(out)
    }

    /// Build header plus tail; `icv_len` is the length of a checksum the
    /// caller appends afterwards, already counted in the header length
    fn assemble(&self, first: u8, flags: u8, tail: &[u8], icv_len: usize) -> Vec<u8> {
        let header = Header {
            initiator_spi: U64::new(self.spi_i),
            responder_spi: U64::new(self.spi_r),
            next_payload: first,
            version: self.version,
            exchange_type: self.exchange as u8,
            flags,
            message_id: U32::new(self.message_id),
            length: U32::new((size_of::<Header>() + tail.len() + icv_len) as u32),
        };
        let mut out = Vec::with_capacity(size_of::<Header>() + tail.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(tail);
        out
    }
}

fn parse_chain(buf: &[u8], first: u8) -> Result<Vec<Payload>, WireError> {
    let mut payloads = vec![];
    let mut next = first;
    let mut offset = 0;
    while next != PayloadType::NoNextPayload as u8 {
        let header = GenericPayloadHeader::ref_from_prefix(&buf[offset..])
            .ok_or(WireError::BufferTooSmall)?;
        let length = header.payload_length.get() as usize;
        if length < size_of::<GenericPayloadHeader>() || offset + length > buf.len() {
            return Err(WireError::BufferTooSmall);
        }
        let body = &buf[offset + size_of::<GenericPayloadHeader>()..offset + length];
        let payload = Payload::parse(next, body)?;
        if let Payload::Unknown(kind, _) = &payload {
            if header.reserved & FLAG_CRITICAL != 0 {
                return Err(WireError::UnknownCriticalPayload(*kind));
            }
        }
        payloads.push(payload);
        next = header.next_payload;
        offset += length;
    }
    Ok(payloads)
}
