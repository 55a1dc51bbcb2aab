//! Security Association payload bodies of both versions
//!
//! Version 2 nests proposals and transforms with the last-substructure
//! convention of RFC 7296 section 3.3, version 1 chains them as ordinary
//! payloads (types 2 and 3) below a DOI/situation prefix. Both share the
//! data attribute encoding with its fixed/variable format bit.

use zerocopy::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::errors::WireError;
use crate::params::transform::{ATTR_KEY_LENGTH, ENCR_AES_CBC};
use crate::params::{PayloadType, TransformType};

/// Flag in the attribute type marking the fixed-length (TV) format
pub const FLAG_ATTRIBUTE_FORMAT: u16 = 0b1000_0000_0000_0000;

/// Protocol header for a version 2 Proposal
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |         Proposal Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                        SPI (variable)                         ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                        <Transforms>                           ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ProposalHeader {
    /// 0 for the last Proposal of the Security Association, 2 otherwise
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Proposal, including the header itself
    pub proposal_length: U16,
    /// Number of this Proposal, starting at 1
    pub proposal_num: u8,
    /// Protocol the Proposal negotiates, see [crate::params::SecurityProtocol]
    pub protocol_id: u8,
    /// Size of the SPI in octets, 0 for the initial IKE negotiation
    pub spi_size: u8,
    /// Number of transformations
    pub num_transforms: u8,
}

/// Protocol header for a version 2 Transform
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |        Transform Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |Transform Type |   RESERVED    |          Transform ID         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                      Transform Attributes                     ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TransformHeader {
    /// 0 for the last Transform of the Proposal, 3 otherwise
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Transform, including the header itself
    pub transform_length: U16,
    /// Type of transformation, see [TransformType]
    pub transform_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved2: u8,
    /// Identifier of the algorithm within the transform type registry
    pub transform_id: U16,
}

/// A data attribute in either its fixed-length (TV) or variable-length
/// (TLV) encoding; the encoding is preserved so re-serialization stays
/// bit-exact for hash computations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Fixed two-octet value (AF bit set)
    Short(u16),
    /// Variable-length value (AF bit clear)
    Long(Vec<u8>),
}

/// A single transform or configuration attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAttribute {
    /// Type of the attribute, without the format bit
    pub attribute_type: u16,
    /// The value in its original encoding
    pub value: AttrValue,
}

impl DataAttribute {
    /// Shorthand for a fixed-length attribute
    pub fn short(attribute_type: u16, value: u16) -> Self {
        Self {
            attribute_type,
            value: AttrValue::Short(value),
        }
    }

    /// Shorthand for a variable-length attribute
    pub fn long(attribute_type: u16, value: Vec<u8>) -> Self {
        Self {
            attribute_type,
            value: AttrValue::Long(value),
        }
    }

    /// The value as a number, regardless of encoding, if it fits
    pub fn as_number(&self) -> Option<u16> {
        match &self.value {
            AttrValue::Short(v) => Some(*v),
            AttrValue::Long(v) if v.len() <= 2 => {
                let mut n = 0u16;
                for b in v {
                    n = n << 8 | *b as u16;
                }
                Some(n)
            }
            AttrValue::Long(_) => None,
        }
    }

    /// Parse a list of attributes filling `buf` completely
    pub fn parse_list(buf: &[u8]) -> Result<Vec<DataAttribute>, WireError> {
        let mut attributes = vec![];
        let mut offset = 0;
        while offset < buf.len() {
            let rest = &buf[offset..];
            if rest.len() < 4 {
                return Err(WireError::BufferTooSmall);
            }
            let raw_type = u16::from_be_bytes([rest[0], rest[1]]);
            if raw_type & FLAG_ATTRIBUTE_FORMAT == FLAG_ATTRIBUTE_FORMAT {
                attributes.push(DataAttribute::short(
                    raw_type & !FLAG_ATTRIBUTE_FORMAT,
                    u16::from_be_bytes([rest[2], rest[3]]),
                ));
                offset += 4;
            } else {
                let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
                let value = rest
                    .get(4..4 + length)
                    .ok_or(WireError::BufferTooSmall)?
                    .to_vec();
                attributes.push(DataAttribute::long(raw_type, value));
                offset += 4 + length;
            }
        }
        Ok(attributes)
    }

    /// Serialize a list of attributes
    pub fn build_list(attributes: &[DataAttribute]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * attributes.len());
        for attribute in attributes {
            match &attribute.value {
                AttrValue::Short(v) => {
                    out.extend_from_slice(
                        &(attribute.attribute_type | FLAG_ATTRIBUTE_FORMAT).to_be_bytes(),
                    );
                    out.extend_from_slice(&v.to_be_bytes());
                }
                AttrValue::Long(v) => {
                    out.extend_from_slice(&attribute.attribute_type.to_be_bytes());
                    out.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    out.extend_from_slice(v);
                }
            }
        }
        out
    }
}

/// A version 2 transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Raw transform type, compared against [TransformType] values
    pub transform_type: u8,
    /// Algorithm id within the type's registry
    pub id: u16,
    /// Transform attributes, in practice at most a key length
    pub attributes: Vec<DataAttribute>,
}

impl Transform {
    /// Construct a transform without attributes
    pub fn new(transform_type: TransformType, id: u16) -> Self {
        Self {
            transform_type: transform_type as u8,
            id,
            attributes: vec![],
        }
    }

    /// Construct an encryption transform with a key length attribute
    pub fn encryption(id: u16, key_length: u16) -> Self {
        Self {
            transform_type: TransformType::EncryptionAlgorithm as u8,
            id,
            attributes: vec![DataAttribute::short(ATTR_KEY_LENGTH, key_length)],
        }
    }

    /// Whether this transform is of the given type
    pub fn is(&self, transform_type: TransformType) -> bool {
        self.transform_type == transform_type as u8
    }

    /// The key length attribute, if present
    pub fn key_length(&self) -> Option<u16> {
        self.attributes
            .iter()
            .find(|a| a.attribute_type == ATTR_KEY_LENGTH)
            .and_then(DataAttribute::as_number)
    }

    fn build(&self, last: bool) -> Vec<u8> {
        let attributes = DataAttribute::build_list(&self.attributes);
        let length = size_of::<TransformHeader>() + attributes.len();
        let header = TransformHeader {
            last_substruct: if last { 0 } else { 3 },
            reserved: 0,
            transform_length: U16::new(length as u16),
            transform_type: self.transform_type,
            reserved2: 0,
            transform_id: U16::new(self.id),
        };
        let mut out = Vec::with_capacity(length);
        out.extend_from_slice(header.as_bytes());
        out.extend(attributes);
        out
    }
}

/// A version 2 proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Number of the proposal within the Security Association, starting at 1
    pub number: u8,
    /// Raw protocol id, compared against [crate::params::SecurityProtocol]
    pub protocol: u8,
    /// The sending entity's SPI for the negotiated protocol
    pub spi: Vec<u8>,
    /// The transforms on offer
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// First transform of the given type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms.iter().find(|t| t.is(transform_type))
    }

    fn build(&self, last: bool) -> Vec<u8> {
        let mut transforms = Vec::with_capacity(12 * self.transforms.len());
        for (i, transform) in self.transforms.iter().enumerate() {
            transforms.extend(transform.build(i == self.transforms.len() - 1));
        }
        let length = size_of::<ProposalHeader>() + self.spi.len() + transforms.len();
        let header = ProposalHeader {
            last_substruct: if last { 0 } else { 2 },
            reserved: 0,
            proposal_length: U16::new(length as u16),
            proposal_num: self.number,
            protocol_id: self.protocol,
            spi_size: self.spi.len() as u8,
            num_transforms: self.transforms.len() as u8,
        };
        let mut out = Vec::with_capacity(length);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.spi);
        out.extend(transforms);
        out
    }
}

/// The body of a version 2 Security Association payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaPayload {
    /// The proposals on offer, in preference order
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Parse the payload body (everything after the generic payload header)
    pub fn try_parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut proposals = vec![];
        let mut offset = 0;
        while offset < buf.len() {
            let header = ProposalHeader::ref_from_prefix(&buf[offset..])
                .ok_or(WireError::BufferTooSmall)?;
            let length = header.proposal_length.get() as usize;
            if length < size_of::<ProposalHeader>() || offset + length > buf.len() {
                return Err(WireError::BufferTooSmall);
            }
            let spi_end = size_of::<ProposalHeader>() + header.spi_size as usize;
            if spi_end > length {
                return Err(WireError::BufferTooSmall);
            }
            let spi = buf[offset + size_of::<ProposalHeader>()..offset + spi_end].to_vec();
            let transforms = parse_transforms(&buf[offset + spi_end..offset + length])?;
            if transforms.len() != header.num_transforms as usize {
                return Err(WireError::UnexpectedPayload);
            }
            proposals.push(Proposal {
                number: header.proposal_num,
                protocol: header.protocol_id,
                spi,
                transforms,
            });
            offset += length;
            if header.last_substruct == 0 {
                break;
            }
        }
        Ok(Self { proposals })
    }

    /// Serialize the payload body
    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![];
        for (i, proposal) in self.proposals.iter().enumerate() {
            out.extend(proposal.build(i == self.proposals.len() - 1));
        }
        out
    }

    /// Select the first proposal whose encryption transform is AES-CBC and
    /// truncate it to a single transform per type
    ///
    /// The result is what gets echoed back to the peer as the chosen
    /// proposal; its SPI is still the peer's and must be substituted by the
    /// caller where the responder names its own.
    pub fn chosen_aes_cbc(&self) -> Option<Proposal> {
        for proposal in &self.proposals {
            let Some(encryption) = proposal
                .transforms
                .iter()
                .find(|t| t.is(TransformType::EncryptionAlgorithm) && t.id == ENCR_AES_CBC)
            else {
                continue;
            };
            let mut transforms = vec![encryption.clone()];
            for transform_type in [
                TransformType::PseudoRandomFunction,
                TransformType::IntegrityAlgorithm,
                TransformType::KeyExchangeMethod,
                TransformType::SequenceNumber,
            ] {
                if let Some(t) = proposal.get_transform(transform_type) {
                    transforms.push(t.clone());
                }
            }
            return Some(Proposal {
                number: proposal.number,
                protocol: proposal.protocol,
                spi: proposal.spi.clone(),
                transforms,
            });
        }
        None
    }
}

fn parse_transforms(buf: &[u8]) -> Result<Vec<Transform>, WireError> {
    let mut transforms = vec![];
    let mut offset = 0;
    while offset < buf.len() {
        let header =
            TransformHeader::ref_from_prefix(&buf[offset..]).ok_or(WireError::BufferTooSmall)?;
        let length = header.transform_length.get() as usize;
        if length < size_of::<TransformHeader>() || offset + length > buf.len() {
            return Err(WireError::BufferTooSmall);
        }
        let attributes =
            DataAttribute::parse_list(&buf[offset + size_of::<TransformHeader>()..offset + length])?;
        transforms.push(Transform {
            transform_type: header.transform_type,
            id: header.transform_id.get(),
            attributes,
        });
        offset += length;
        if header.last_substruct == 0 {
            break;
        }
    }
    Ok(transforms)
}

/// A version 1 transform, a payload of its own nested below a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform1 {
    /// Number of the transform within the proposal
    pub number: u8,
    /// Transform id; its registry depends on the proposal's protocol
    pub id: u8,
    /// The negotiated attributes
    pub attributes: Vec<DataAttribute>,
}

impl Transform1 {
    /// Numeric value of the given attribute type, if present
    pub fn attr(&self, attribute_type: u16) -> Option<u16> {
        self.attributes
            .iter()
            .find(|a| a.attribute_type == attribute_type)
            .and_then(DataAttribute::as_number)
    }
}

/// A version 1 proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal1 {
    /// Number of the proposal within the Security Association
    pub number: u8,
    /// Raw protocol id
    pub protocol: u8,
    /// The sending entity's SPI, empty during phase 1
    pub spi: Vec<u8>,
    /// The transforms on offer
    pub transforms: Vec<Transform1>,
}

/// The body of a version 1 Security Association payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload1 {
    /// Domain of interpretation, 1 for IPsec
    pub doi: u32,
    /// DOI specific situation field
    pub situation: Vec<u8>,
    /// The proposals on offer
    pub proposals: Vec<Proposal1>,
}

impl SaPayload1 {
    /// Parse the payload body (everything after the generic payload header)
    pub fn try_parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 8 {
            return Err(WireError::BufferTooSmall);
        }
        let doi = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let situation = buf[4..8].to_vec();

        let mut proposals = vec![];
        let mut offset = 8;
        let mut next = if offset < buf.len() {
            PayloadType::Proposal1
        } else {
            PayloadType::NoNextPayload
        };
        while next != PayloadType::NoNextPayload {
            if next != PayloadType::Proposal1 {
                return Err(WireError::UnexpectedPayload);
            }
            let rest = &buf[offset..];
            if rest.len() < 8 {
                return Err(WireError::BufferTooSmall);
            }
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if length < 8 || length > rest.len() {
                return Err(WireError::BufferTooSmall);
            }
            next = PayloadType::try_from(rest[0])?;
            let spi_size = rest[6] as usize;
            let num_transforms = rest[7];
            let spi = rest.get(8..8 + spi_size).ok_or(WireError::BufferTooSmall)?.to_vec();
            let transforms = parse_transforms_1(&rest[8 + spi_size..length])?;
            if transforms.len() != num_transforms as usize {
                return Err(WireError::UnexpectedPayload);
            }
            proposals.push(Proposal1 {
                number: rest[4],
                protocol: rest[5],
                spi,
                transforms,
            });
            offset += length;
        }
        Ok(Self {
            doi,
            situation,
            proposals,
        })
    }

    /// Serialize the payload body
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.doi.to_be_bytes());
        out.extend_from_slice(&self.situation);
        for (i, proposal) in self.proposals.iter().enumerate() {
            let mut transforms = vec![];
            for (j, transform) in proposal.transforms.iter().enumerate() {
                let attributes = DataAttribute::build_list(&transform.attributes);
                let length = 8 + attributes.len();
                transforms.push(if j == proposal.transforms.len() - 1 {
                    PayloadType::NoNextPayload as u8
                } else {
                    PayloadType::Transform1 as u8
                });
                transforms.push(0);
                transforms.extend_from_slice(&(length as u16).to_be_bytes());
                transforms.push(transform.number);
                transforms.push(transform.id);
                transforms.extend_from_slice(&[0, 0]);
                transforms.extend(attributes);
            }
            let length = 8 + proposal.spi.len() + transforms.len();
            out.push(if i == self.proposals.len() - 1 {
                PayloadType::NoNextPayload as u8
            } else {
                PayloadType::Proposal1 as u8
            });
            out.push(0);
            out.extend_from_slice(&(length as u16).to_be_bytes());
            out.push(proposal.number);
            out.push(proposal.protocol);
            out.push(proposal.spi.len() as u8);
            out.push(proposal.transforms.len() as u8);
            out.extend_from_slice(&proposal.spi);
            out.extend(transforms);
        }
        out
    }
}

fn parse_transforms_1(buf: &[u8]) -> Result<Vec<Transform1>, WireError> {
    let mut transforms = vec![];
    let mut offset = 0;
    let mut next = if buf.is_empty() {
        PayloadType::NoNextPayload
    } else {
        PayloadType::Transform1
    };
    while next != PayloadType::NoNextPayload {
        if next != PayloadType::Transform1 {
            return Err(WireError::UnexpectedPayload);
        }
        let rest = &buf[offset..];
        if rest.len() < 8 {
            return Err(WireError::BufferTooSmall);
        }
        let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if length < 8 || length > rest.len() {
            return Err(WireError::BufferTooSmall);
        }
        next = PayloadType::try_from(rest[0])?;
        transforms.push(Transform1 {
            number: rest[4],
            id: rest[5],
            attributes: DataAttribute::parse_list(&rest[8..length])?,
        });
        offset += length;
    }
    Ok(transforms)
}
