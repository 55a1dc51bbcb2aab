//! Module containing network level header structs for pieces of the protocol

use zerocopy::network_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Version octet of an ISAKMP (IKEv1) message, as <major>.<minor> in 4 bits each
pub const VERSION_1: u8 = 0b00010000;
/// Version octet of an IKEv2 message
pub const VERSION_2: u8 = 0b00100000;

/// Version 1 flag: the payload chain after the header is encrypted
pub const FLAG_ENCRYPTION: u8 = 0b00000001;
/// Version 2 flag: the sender is the original initiator of this SA
pub const FLAG_INITIATOR: u8 = 0b00001000;
/// Version 2 flag: the message is a response to a message with this message id
pub const FLAG_RESPONSE: u8 = 0b00100000;

/// Protocol header shared by ISAKMP and IKEv2 messages
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Initiator's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Responder's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                          Message ID                           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                            Length                             |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct Header {
    /// SPI (called cookie in version 1) chosen by the initiator
    pub initiator_spi: U64,
    /// SPI chosen by the responder, zero in the very first message of an exchange
    pub responder_spi: U64,
    /// Type of the first payload following the header
    pub next_payload: u8,
    /// Major and minor protocol version, see [VERSION_1] and [VERSION_2]
    pub version: u8,
    /// The exchange this message belongs to
    pub exchange_type: u8,
    /// Flag bits, their meaning depends on the major version
    pub flags: u8,
    /// Zero during version 1 phase 1 and all of IKE_SA_INIT, unique per
    /// request afterwards
    pub message_id: U32,
    /// Length of the total message including this header
    pub length: U32,
}

/// Protocol header preceding every payload in the chain
///
/// ```text
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Next Payload  |C|  RESERVED   |         Payload Length        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The C bit only exists in version 2, where it marks a payload the
/// receiver must understand; version 1 keeps the whole octet reserved.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct GenericPayloadHeader {
    /// Type of the next payload in the chain, 0 for the last payload
    pub next_payload: u8,
    /// Critical bit plus reserved bits
    pub reserved: u8,
    /// Length in octets of the payload, including this header
    pub payload_length: U16,
}

/// Mask for the critical bit inside [GenericPayloadHeader::reserved]
pub const FLAG_CRITICAL: u8 = 0b10000000;
