//! # ike-crypto
//!
//! The negotiable cryptographic primitives for IKE and ESP: ciphers,
//! integrity transforms, pseudo-random functions, Diffie-Hellman groups and
//! the per-SA [Crypto] context tying one of each together with its keys.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

pub mod cipher;
pub mod dh;
pub mod errors;
pub mod integrity;
pub mod prf;

pub use cipher::Cipher;
pub use dh::{diffie_hellman, DhSecret};
pub use errors::CryptoError;
pub use integrity::Integrity;
pub use prf::Prf;

/// The keyed cryptographic context of one SA direction
///
/// An ESP context carries cipher and integrity material, an IKEv2 context
/// additionally the PRF and its `SK_p` key, and an IKEv1 context the PRF
/// plus the CBC IV chain that version 1 threads through a phase 1
/// negotiation and its phase 2 exchanges.
pub struct Crypto {
    /// The encryption transform
    pub cipher: Cipher,
    /// Encryption key
    pub sk_e: Vec<u8>,
    /// The integrity transform, absent on an IKEv1 context
    pub integrity: Option<Integrity>,
    /// Integrity key
    pub sk_a: Vec<u8>,
    /// The PRF transform, absent on an ESP context
    pub prf: Option<Prf>,
    /// PRF key for AUTH payload computation (IKEv2 only)
    pub sk_p: Vec<u8>,
    /// Version 1 CBC IV per message id; key 0 holds the phase 1 chain
    ivs: HashMap<u32, Vec<u8>>,
}

impl Crypto {
    /// Context for one direction of an ESP tunnel
    pub fn esp(cipher: Cipher, sk_e: Vec<u8>, integrity: Integrity, sk_a: Vec<u8>) -> Self {
        Self {
            cipher,
            sk_e,
            integrity: Some(integrity),
            sk_a,
            prf: None,
            sk_p: Vec::new(),
            ivs: HashMap::new(),
        }
    }

    /// Context for one direction of an IKEv2 SA
    pub fn ikev2(
        cipher: Cipher,
        sk_e: Vec<u8>,
        integrity: Integrity,
        sk_a: Vec<u8>,
        prf: Prf,
        sk_p: Vec<u8>,
    ) -> Self {
        Self {
            cipher,
            sk_e,
            integrity: Some(integrity),
            sk_a,
            prf: Some(prf),
            sk_p,
            ivs: HashMap::new(),
        }
    }

    /// Context for an IKEv1 SA, shared by both directions
    ///
    /// `iv` is the initial phase 1 IV, `hash(g^xi || g^xr)` truncated to the
    /// cipher block size.
    pub fn ikev1(cipher: Cipher, sk_e: Vec<u8>, prf: Prf, iv: Vec<u8>) -> Self {
        let mut ivs = HashMap::new();
        ivs.insert(0, iv);
        Self {
            cipher,
            sk_e,
            integrity: None,
            sk_a: Vec::new(),
            prf: Some(prf),
            sk_p: Vec::new(),
            ivs,
        }
    }

    /// Length in octets of the trailing integrity checksum, zero without one
    pub fn icv_len(&self) -> usize {
        self.integrity.as_ref().map_or(0, |i| i.hash_size())
    }

    /// Compute the trailing checksum over `data` (a message or ESP frame
    /// without its checksum)
    pub fn mac(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let integrity = self
            .integrity
            .as_ref()
            .ok_or(CryptoError::UnsupportedTransform("INTEG", 0))?;
        Ok(integrity.mac(&self.sk_a, data))
    }

    /// Verify the trailing checksum of `data` (a full message or ESP frame)
    pub fn verify(&self, data: &[u8]) -> Result<(), CryptoError> {
        let integrity = self
            .integrity
            .as_ref()
            .ok_or(CryptoError::UnsupportedTransform("INTEG", 0))?;
        let split = data
            .len()
            .checked_sub(integrity.hash_size())
            .ok_or(CryptoError::TruncatedInput)?;
        integrity.verify(&self.sk_a, &data[..split], &data[split..])
    }

    /// Wrap a plaintext payload chain into an IKEv2 SK body: random IV,
    /// zero padding, pad-length octet. The checksum is appended by the
    /// message generator once the full message exists.
    pub fn seal_sk(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.cipher.block_size();
        let pad = block - 1 - plaintext.len() % block;
        let mut data = plaintext.to_vec();
        data.resize(plaintext.len() + pad, 0);
        data.push(pad as u8);
        let iv = random_iv(block);
        let mut out = iv.clone();
        out.extend(self.cipher.encrypt(&self.sk_e, &iv, &data)?);
        Ok(out)
    }

    /// Unwrap an IKEv2 SK body (IV and ciphertext, checksum already removed)
    pub fn open_sk(&self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.cipher.block_size();
        if body.len() < 2 * block {
            return Err(CryptoError::TruncatedInput);
        }
        let (iv, ciphertext) = body.split_at(block);
        let mut data = self.cipher.decrypt(&self.sk_e, iv, ciphertext)?;
        let pad = *data.last().ok_or(CryptoError::TruncatedInput)? as usize;
        if pad + 1 > data.len() {
            return Err(CryptoError::InvalidPadding);
        }
        data.truncate(data.len() - pad - 1);
        Ok(data)
    }

    /// Encrypt a version 1 payload chain in place of the message tail
    ///
    /// Phase 2 IVs derive from the last phase 1 CBC block and the message
    /// id (RFC 2409 appendix B); every operation moves the chain forward to
    /// the last ciphertext block of the processed message.
    pub fn encrypt_1(&mut self, plaintext: &[u8], message_id: u32) -> Result<Vec<u8>, CryptoError> {
        let block = self.cipher.block_size();
        let iv = self.iv_for(message_id)?;
        let mut data = plaintext.to_vec();
        data.resize(plaintext.len().next_multiple_of(block).max(block), 0);
        let encrypted = self.cipher.encrypt(&self.sk_e, &iv, &data)?;
        self.ivs
            .insert(message_id, encrypted[encrypted.len() - block..].to_vec());
        Ok(encrypted)
    }

    /// Decrypt a version 1 message tail
    pub fn decrypt_1(&mut self, ciphertext: &[u8], message_id: u32) -> Result<Vec<u8>, CryptoError> {
        let block = self.cipher.block_size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(CryptoError::UnalignedCiphertext);
        }
        let iv = self.iv_for(message_id)?;
        let decrypted = self.cipher.decrypt(&self.sk_e, &iv, ciphertext)?;
        self.ivs
            .insert(message_id, ciphertext[ciphertext.len() - block..].to_vec());
        Ok(decrypted)
    }

    fn iv_for(&self, message_id: u32) -> Result<Vec<u8>, CryptoError> {
        if let Some(iv) = self.ivs.get(&message_id) {
            return Ok(iv.clone());
        }
        let prf = self
            .prf
            .as_ref()
            .ok_or(CryptoError::UnsupportedTransform("PRF", 0))?;
        let base = self.ivs.get(&0).ok_or(CryptoError::TruncatedInput)?;
        let mut data = base.clone();
        data.extend_from_slice(&message_id.to_be_bytes());
        let mut iv = prf.hash(&data);
        iv.truncate(self.cipher.block_size());
        Ok(iv)
    }

    /// Seal an inner packet into an ESP payload: random IV, monotonic
    /// padding, pad-length and next-header trailer (RFC 4303). The caller
    /// prepends SPI and sequence number and appends the checksum.
    pub fn seal_esp(&self, next_header: u8, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.cipher.block_size();
        let pad = (block - (payload.len() + 2) % block) % block;
        let mut data = payload.to_vec();
        data.extend((1..=pad).map(|i| i as u8));
        data.push(pad as u8);
        data.push(next_header);
        let iv = random_iv(block);
        let mut out = iv.clone();
        out.extend(self.cipher.encrypt(&self.sk_e, &iv, &data)?);
        Ok(out)
    }

    /// Open an ESP payload (IV and ciphertext, checksum already removed),
    /// returning the next-header octet and the inner packet
    pub fn open_esp(&self, body: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        let block = self.cipher.block_size();
        if body.len() < 2 * block {
            return Err(CryptoError::TruncatedInput);
        }
        let (iv, ciphertext) = body.split_at(block);
        let mut data = self.cipher.decrypt(&self.sk_e, iv, ciphertext)?;
        let next_header = data.pop().ok_or(CryptoError::TruncatedInput)?;
        let pad = data.pop().ok_or(CryptoError::TruncatedInput)? as usize;
        if pad > data.len() {
            return Err(CryptoError::InvalidPadding);
        }
        data.truncate(data.len() - pad);
        Ok((next_header, data))
    }
}

fn random_iv(block: usize) -> Vec<u8> {
    (0..block).map(|_| rand::random()).collect()
}
