//! Protocol parameters shared by both versions
//!
//! Version 1 and version 2 payload and exchange numbering never overlaps
//! (version 1 uses 1-20, version 2 starts at 33/34), so a single set of
//! enums covers both wire dialects. Notify message types, configuration
//! attribute types and transform attribute types stay raw `u16` on the wire
//! structs so unrecognized values survive a round trip; the constants the
//! gateway actually interprets live in the child modules below.

/// When parsing a parameter from u8, there are several "regions" in the
/// definitions that can't be defined by Rusts enum. Typically, the last two
/// regions of the parameter definitions are unassigned and/or reserved for
/// private use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnparseableParameter {
    /// The parameter is reserved and must not be used, as it may conflict with older standards
    Reserved,
    /// The parameter has no recognized meaning by any known standard
    Unassigned,
    /// The parameter is reserved for Private Use by proprietary implementations
    /// and not part of a standard
    PrivateUse,
}

/// Type of the exchange being used
///
/// Values 1-6 and 32-33 belong to version 1 (RFC 2408 plus the IPsec DOI),
/// 34-37 to version 2 (RFC 7296).
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExchangeType {
    // RFC 2408
    Base1 = 1,
    // RFC 2408, "Identity Protection", the main mode of phase 1
    Identity1 = 2,
    // RFC 2408
    AuthOnly1 = 3,
    // RFC 2408
    Aggressive1 = 4,
    // RFC 2408
    Informational1 = 5,
    // draft-ietf-ipsec-isakmp-xauth, mode config / XAuth transactions
    Transaction1 = 6,
    // IPsec DOI, phase 2 quick mode
    Quick1 = 32,
    // IPsec DOI
    NewGroup1 = 33,
    // RFC 7296
    IkeSaInit = 34,
    // RFC 7296
    IkeAuth = 35,
    // RFC 7296
    CreateChildSa = 36,
    // RFC 7296
    Informational = 37,
}

impl TryFrom<u8> for ExchangeType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(ExchangeType::Base1),
            2 => Ok(ExchangeType::Identity1),
            3 => Ok(ExchangeType::AuthOnly1),
            4 => Ok(ExchangeType::Aggressive1),
            5 => Ok(ExchangeType::Informational1),
            6 => Ok(ExchangeType::Transaction1),
            7..=31 => Err(UnparseableParameter::Unassigned),
            32 => Ok(ExchangeType::Quick1),
            33 => Ok(ExchangeType::NewGroup1),
            34 => Ok(ExchangeType::IkeSaInit),
            35 => Ok(ExchangeType::IkeAuth),
            36 => Ok(ExchangeType::CreateChildSa),
            37 => Ok(ExchangeType::Informational),
            38..=239 => Err(UnparseableParameter::Unassigned),
            240..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a payload in the chain
///
/// Version 1 types come from RFC 2408 (plus the mode config attributes
/// payload and the RFC 3947 NAT discovery payload), version 2 types from
/// RFC 7296.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PayloadType {
    // Chain terminator in both versions
    NoNextPayload = 0,
    // RFC 2408
    SecurityAssociation1 = 1,
    // RFC 2408, only valid nested inside a Security Association
    Proposal1 = 2,
    // RFC 2408, only valid nested inside a Proposal
    Transform1 = 3,
    // RFC 2408
    KeyExchange1 = 4,
    // RFC 2408
    Identification1 = 5,
    // RFC 2408
    Certificate1 = 6,
    // RFC 2408
    CertificateRequest1 = 7,
    // RFC 2408
    Hash1 = 8,
    // RFC 2408
    Signature1 = 9,
    // RFC 2408
    Nonce1 = 10,
    // RFC 2408
    Notification1 = 11,
    // RFC 2408
    Delete1 = 12,
    // RFC 2408
    VendorId1 = 13,
    // draft-ietf-ipsec-isakmp-mode-cfg, the mode config attributes payload
    Attributes1 = 14,
    // RFC 3947
    NatDetection1 = 20,
    // RFC 7296
    SecurityAssociation = 33,
    // RFC 7296
    KeyExchange = 34,
    // RFC 7296
    IdInitiator = 35,
    // RFC 7296
    IdResponder = 36,
    // RFC 7296
    Certificate = 37,
    // RFC 7296
    CertificateRequest = 38,
    // RFC 7296
    Authentication = 39,
    // RFC 7296
    Nonce = 40,
    // RFC 7296
    Notify = 41,
    // RFC 7296
    Delete = 42,
    // RFC 7296
    VendorId = 43,
    // RFC 7296
    TsInitiator = 44,
    // RFC 7296
    TsResponder = 45,
    // RFC 7296
    EncryptedAndAuthenticated = 46,
    // RFC 7296
    Configuration = 47,
    // RFC 7296
    Eap = 48,
}

/// Security protocol inside proposals, notifications and deletes
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SecurityProtocol {
    InternetKeyExchange = 1,
    AuthenticationHeader = 2,
    EncapsulatingSecurityPayload = 3,
}

impl TryFrom<u8> for SecurityProtocol {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(SecurityProtocol::InternetKeyExchange),
            2 => Ok(SecurityProtocol::AuthenticationHeader),
            3 => Ok(SecurityProtocol::EncapsulatingSecurityPayload),
            4..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a version 2 transform inside a proposal
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    SequenceNumber = 5,
}

/// Transform ids and attribute types the gateway interprets
pub mod transform {
    /// ENCR_AES_CBC in the version 2 transform type 1 registry; the same
    /// number also names ESP_AES in the version 1 DOI
    pub const ENCR_AES_CBC: u16 = 12;
    /// Version 2 key length transform attribute type (without the AF bit)
    pub const ATTR_KEY_LENGTH: u16 = 14;
}

/// Version 1 phase 1 transform attribute types (RFC 2409 appendix A)
pub mod attr_1 {
    #![allow(missing_docs)]
    pub const ENCRYPTION_ALGORITHM: u16 = 1;
    pub const HASH_ALGORITHM: u16 = 2;
    pub const AUTHENTICATION_METHOD: u16 = 3;
    pub const GROUP_DESCRIPTION: u16 = 4;
    pub const LIFE_TYPE: u16 = 11;
    pub const LIFE_DURATION: u16 = 12;
    pub const KEY_LENGTH: u16 = 14;
}

/// Version 1 quick mode ESP transform attribute types (RFC 2407)
pub mod esp_attr_1 {
    #![allow(missing_docs)]
    pub const LIFE_TYPE: u16 = 1;
    pub const LIFE_DURATION: u16 = 2;
    pub const GROUP_DESCRIPTION: u16 = 3;
    pub const ENCAPSULATION_MODE: u16 = 4;
    pub const AUTHENTICATION_ALGORITHM: u16 = 5;
    pub const KEY_LENGTH: u16 = 6;
}

/// Notify message types the gateway interprets; everything else is carried
/// through as a raw number
pub mod notify {
    /// Version 2 error: authentication data did not verify
    pub const AUTHENTICATION_FAILED: u16 = 24;
    /// Version 2 status: NAT discovery hash of the source address
    pub const NAT_DETECTION_SOURCE_IP: u16 = 16388;
    /// Version 2 status: NAT discovery hash of the destination address
    pub const NAT_DETECTION_DESTINATION_IP: u16 = 16389;
    /// Version 2 status: names the child SA replaced by this CREATE_CHILD_SA
    pub const REKEY_SA: u16 = 16393;
    /// Version 1 IPsec DOI status: first contact of this peer
    pub const INITIAL_CONTACT_1: u16 = 24578;
    /// Version 1 dead peer detection request (RFC 3706)
    pub const R_U_THERE: u16 = 36136;
    /// Version 1 dead peer detection answer
    pub const R_U_THERE_ACK: u16 = 36137;
}

/// Configuration payload types (both versions use the same numbers)
pub mod cfg {
    #![allow(missing_docs)]
    pub const CFG_REQUEST: u8 = 1;
    pub const CFG_REPLY: u8 = 2;
    pub const CFG_SET: u8 = 3;
    pub const CFG_ACK: u8 = 4;
}

/// Configuration attribute types (RFC 7296 section 3.15.1 plus the XAuth
/// draft range)
pub mod cp_attr {
    #![allow(missing_docs)]
    pub const INTERNAL_IP4_ADDRESS: u16 = 1;
    pub const INTERNAL_IP4_DNS: u16 = 3;
    pub const XAUTH_TYPE: u16 = 16520;
    pub const XAUTH_USER_NAME: u16 = 16521;
    pub const XAUTH_USER_PASSWORD: u16 = 16522;
    pub const XAUTH_STATUS: u16 = 16527;
}

/// Identification payload id types
pub mod id_type {
    /// A fully qualified domain name
    pub const ID_FQDN: u8 = 2;
}

/// Authentication methods of the version 2 AUTH payload
pub mod auth_method {
    /// Shared key message integrity code, the only method the gateway accepts
    pub const PSK: u8 = 2;
}

impl TryFrom<u8> for PayloadType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::NoNextPayload),
            1 => Ok(PayloadType::SecurityAssociation1),
            2 => Ok(PayloadType::Proposal1),
            3 => Ok(PayloadType::Transform1),
            4 => Ok(PayloadType::KeyExchange1),
            5 => Ok(PayloadType::Identification1),
            6 => Ok(PayloadType::Certificate1),
            7 => Ok(PayloadType::CertificateRequest1),
            8 => Ok(PayloadType::Hash1),
            9 => Ok(PayloadType::Signature1),
            10 => Ok(PayloadType::Nonce1),
            11 => Ok(PayloadType::Notification1),
            12 => Ok(PayloadType::Delete1),
            13 => Ok(PayloadType::VendorId1),
            14 => Ok(PayloadType::Attributes1),
            15..=19 => Err(UnparseableParameter::Unassigned),
            20 => Ok(PayloadType::NatDetection1),
            21..=32 => Err(UnparseableParameter::Unassigned),
            33 => Ok(PayloadType::SecurityAssociation),
            34 => Ok(PayloadType::KeyExchange),
            35 => Ok(PayloadType::IdInitiator),
            36 => Ok(PayloadType::IdResponder),
            37 => Ok(PayloadType::Certificate),
            38 => Ok(PayloadType::CertificateRequest),
            39 => Ok(PayloadType::Authentication),
            40 => Ok(PayloadType::Nonce),
            41 => Ok(PayloadType::Notify),
            42 => Ok(PayloadType::Delete),
            43 => Ok(PayloadType::VendorId),
            44 => Ok(PayloadType::TsInitiator),
            45 => Ok(PayloadType::TsResponder),
            46 => Ok(PayloadType::EncryptedAndAuthenticated),
            47 => Ok(PayloadType::Configuration),
            48 => Ok(PayloadType::Eap),
            49..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}
