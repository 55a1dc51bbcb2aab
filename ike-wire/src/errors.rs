//! The errors of the codec

use thiserror::Error;

use crate::params::UnparseableParameter;
use ike_crypto::CryptoError;

/// The errors that can occur while parsing or generating an IKE message
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum WireError {
    #[error("Buffer is too small to parse the packet")]
    BufferTooSmall,

    #[error("Unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Encountered unparsable enum variant")]
    UnparsableVariant,

    #[error("Payload structure is inconsistent")]
    UnexpectedPayload,

    #[error("Unknown payload type {0} with the critical bit set")]
    UnknownCriticalPayload(u8),

    #[error("Message is encrypted but no keys are available yet")]
    MissingCrypto,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<UnparseableParameter> for WireError {
    fn from(_value: UnparseableParameter) -> Self {
        Self::UnparsableVariant
    }
}
