//! Encryption transforms
//!
//! AES-CBC is the only cipher the gateway negotiates; the three key sizes
//! share one block size, so callers only ever deal with 16-byte blocks.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use log::warn;

use crate::errors::CryptoError;

/// ENCR_AES_CBC in the IKEv2 transform type 1 registry
const ENCR_AES_CBC: u16 = 12;
/// AES-CBC in the IKEv1 phase 1 encryption algorithm attribute (RFC 2409 appendix A)
const IKE1_AES_CBC: u16 = 7;
/// ESP_AES in the IPsec DOI ESP transform registry
const ESP1_AES: u16 = 12;

/// An encryption transform selected from a proposal, carrying its key size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// AES-CBC with a 128 bit key
    AesCbc128,
    /// AES-CBC with a 192 bit key
    AesCbc192,
    /// AES-CBC with a 256 bit key
    AesCbc256,
}

impl Cipher {
    /// Resolve an IKEv2 ENCR transform id and optional key length attribute
    pub fn ikev2(transform_id: u16, key_length: Option<u16>) -> Result<Self, CryptoError> {
        match transform_id {
            ENCR_AES_CBC => Self::aes(key_length),
            other => {
                warn!("Unsupported ENCR transform id {other}");
                Err(CryptoError::UnsupportedTransform("ENCR", other))
            }
        }
    }

    /// Resolve an IKEv1 phase 1 encryption algorithm attribute value
    pub fn ikev1(attribute_value: u16, key_length: Option<u16>) -> Result<Self, CryptoError> {
        match attribute_value {
            IKE1_AES_CBC => Self::aes(key_length),
            other => {
                warn!("Unsupported phase 1 encryption algorithm {other}");
                Err(CryptoError::UnsupportedTransform("phase 1 encryption", other))
            }
        }
    }

    /// Resolve an IKEv1 quick mode ESP transform id
    pub fn esp_v1(transform_id: u16, key_length: Option<u16>) -> Result<Self, CryptoError> {
        match transform_id {
            ESP1_AES => Self::aes(key_length),
            other => {
                warn!("Unsupported ESP transform id {other}");
                Err(CryptoError::UnsupportedTransform("ESP", other))
            }
        }
    }

    /// A missing key length attribute means the smallest AES key
    fn aes(key_length: Option<u16>) -> Result<Self, CryptoError> {
        match key_length.unwrap_or(128) {
            128 => Ok(Cipher::AesCbc128),
            192 => Ok(Cipher::AesCbc192),
            256 => Ok(Cipher::AesCbc256),
            other => {
                warn!("Unsupported AES key length of {other} bits");
                Err(CryptoError::UnsupportedKeyLength(other))
            }
        }
    }

    /// Cipher block size in octets
    pub fn block_size(&self) -> usize {
        16
    }

    /// Key size in octets
    pub fn key_size(&self) -> usize {
        match self {
            Cipher::AesCbc128 => 16,
            Cipher::AesCbc192 => 24,
            Cipher::AesCbc256 => 32,
        }
    }

    /// CBC-encrypt `data`, which must already be padded to the block size
    pub fn encrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() % self.block_size() != 0 {
            return Err(CryptoError::UnalignedCiphertext);
        }
        let mut buf = data.to_vec();
        let n = buf.len();
        match self {
            Cipher::AesCbc128 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .encrypt_padded_mut::<NoPadding>(&mut buf, n),
            Cipher::AesCbc192 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .encrypt_padded_mut::<NoPadding>(&mut buf, n),
            Cipher::AesCbc256 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .encrypt_padded_mut::<NoPadding>(&mut buf, n),
        }
        .map_err(|_| CryptoError::UnalignedCiphertext)?;
        Ok(buf)
    }

    /// CBC-decrypt `data`; the caller interprets whatever padding is inside
    pub fn decrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() || data.len() % self.block_size() != 0 {
            return Err(CryptoError::UnalignedCiphertext);
        }
        let mut buf = data.to_vec();
        match self {
            Cipher::AesCbc128 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .decrypt_padded_mut::<NoPadding>(&mut buf),
            Cipher::AesCbc192 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .decrypt_padded_mut::<NoPadding>(&mut buf),
            Cipher::AesCbc256 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidKeyLength)?
                .decrypt_padded_mut::<NoPadding>(&mut buf),
        }
        .map_err(|_| CryptoError::UnalignedCiphertext)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::Cipher;

    // NIST SP 800-38A, F.2.1 CBC-AES128.Encrypt, first block
    #[test]
    #[allow(clippy::unwrap_used)]
    fn aes128_cbc_known_answer() {
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, //
            0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
        ];
        let iv = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, //
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        ];
        let plaintext = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, //
            0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
        ];
        let expected = [
            0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, //
            0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9, 0x19, 0x7d,
        ];
        let cipher = Cipher::ikev2(12, Some(128)).unwrap();
        let ct = cipher.encrypt(&key, &iv, &plaintext).unwrap();
        assert_eq!(ct, expected);
        let pt = cipher.decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn rejects_unknown_transform() {
        assert!(Cipher::ikev2(20, None).is_err()); // AES-GCM is not negotiable
        assert!(Cipher::ikev1(5, None).is_err()); // 3DES is not negotiable
        assert!(Cipher::ikev2(12, Some(512)).is_err());
    }

    #[test]
    fn rejects_unaligned_input() {
        let cipher = Cipher::AesCbc128;
        assert!(cipher.encrypt(&[0; 16], &[0; 16], &[0; 15]).is_err());
        assert!(cipher.decrypt(&[0; 16], &[0; 16], &[0; 17]).is_err());
    }
}
