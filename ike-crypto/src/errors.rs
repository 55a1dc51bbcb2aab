//! The errors of the crypto suite

use thiserror::Error;

/// The errors that can occur while negotiating or applying cryptographic transforms
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum CryptoError {
    #[error("Unsupported {0} transform id {1}")]
    UnsupportedTransform(&'static str, u16),

    #[error("Unsupported key length of {0} bits")]
    UnsupportedKeyLength(u16),

    #[error("Key or IV has the wrong length for the negotiated cipher")]
    InvalidKeyLength,

    #[error("Ciphertext is not aligned to the cipher block size")]
    UnalignedCiphertext,

    #[error("Message is too short for the negotiated transforms")]
    TruncatedInput,

    #[error("Invalid padding after decryption")]
    InvalidPadding,

    #[error("Integrity checksum mismatch")]
    IntegrityMismatch,

    #[error("Unknown Diffie-Hellman group {0}")]
    UnknownDhGroup(u16),

    #[error("Peer public key is not a valid group element")]
    InvalidPublicKey,
}
