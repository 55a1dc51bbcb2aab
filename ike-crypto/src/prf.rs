//! Pseudo-random function transforms
//!
//! Besides the plain keyed PRF this module provides the two iterated
//! expansion operators: `prfplus` appends the iteration counter to the seed
//! (IKEv2, RFC 7296 section 2.13) while `prfplus_1` prepends it (the
//! phase 2 key expansion used by the version 1 exchanges).

use hmac::Hmac;
use log::warn;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

use crate::errors::CryptoError;
use crate::integrity::hmac_digest;

/// The negotiable PRF algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PrfAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha2_256,
}

/// A PRF transform instance
#[derive(Debug, Clone, Copy)]
pub struct Prf {
    algorithm: PrfAlgorithm,
}

impl Prf {
    /// Resolve an IKEv2 PRF transform id (IANA transform type 2)
    pub fn ikev2(transform_id: u16) -> Result<Self, CryptoError> {
        let algorithm = match transform_id {
            1 => PrfAlgorithm::HmacMd5,
            2 => PrfAlgorithm::HmacSha1,
            5 => PrfAlgorithm::HmacSha2_256,
            other => {
                warn!("Unsupported PRF transform id {other}");
                return Err(CryptoError::UnsupportedTransform("PRF", other));
            }
        };
        Ok(Self { algorithm })
    }

    /// Resolve an IKEv1 phase 1 hash algorithm attribute value
    pub fn ikev1(attribute_value: u16) -> Result<Self, CryptoError> {
        let algorithm = match attribute_value {
            1 => PrfAlgorithm::HmacMd5,
            2 => PrfAlgorithm::HmacSha1,
            4 => PrfAlgorithm::HmacSha2_256,
            other => {
                warn!("Unsupported phase 1 hash algorithm {other}");
                return Err(CryptoError::UnsupportedTransform("phase 1 hash", other));
            }
        };
        Ok(Self { algorithm })
    }

    /// Output (and preferred key) size in octets
    pub fn key_size(&self) -> usize {
        match self.algorithm {
            PrfAlgorithm::HmacMd5 => 16,
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::HmacSha2_256 => 32,
        }
    }

    /// The keyed PRF itself
    pub fn prf(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            PrfAlgorithm::HmacMd5 => hmac_digest::<Hmac<Md5>>(key, data),
            PrfAlgorithm::HmacSha1 => hmac_digest::<Hmac<Sha1>>(key, data),
            PrfAlgorithm::HmacSha2_256 => hmac_digest::<Hmac<Sha256>>(key, data),
        }
    }

    /// The unkeyed hash underlying the PRF, used for version 1 IV derivation
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            PrfAlgorithm::HmacMd5 => Md5::digest(data).to_vec(),
            PrfAlgorithm::HmacSha1 => Sha1::digest(data).to_vec(),
            PrfAlgorithm::HmacSha2_256 => Sha256::digest(data).to_vec(),
        }
    }

    /// Expand `seed` into `n` octets of key material
    ///
    /// `T1 = prf(key, seed || 0x01)`, `Ti = prf(key, T(i-1) || seed || i)`.
    pub fn prfplus(&self, key: &[u8], seed: &[u8], n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n + self.key_size());
        let mut last = Vec::new();
        let mut counter = 1u8;
        while out.len() < n {
            let mut data = last.clone();
            data.extend_from_slice(seed);
            data.push(counter);
            last = self.prf(key, &data);
            out.extend_from_slice(&last);
            counter = counter.wrapping_add(1);
        }
        out.truncate(n);
        out
    }

    /// The version 1 expansion variant with the counter prepended to the seed
    pub fn prfplus_1(&self, key: &[u8], seed: &[u8], n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n + self.key_size());
        let mut last = Vec::new();
        let mut counter = 1u8;
        while out.len() < n {
            let mut data = last.clone();
            data.push(counter);
            data.extend_from_slice(seed);
            last = self.prf(key, &data);
            out.extend_from_slice(&last);
            counter = counter.wrapping_add(1);
        }
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::Prf;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn prfplus_first_block_is_plain_prf() {
        let prf = Prf::ikev2(5).unwrap();
        let key = b"0123456789abcdef0123456789abcdef";
        let seed = b"some seed";
        let mut data = seed.to_vec();
        data.push(0x01);
        assert_eq!(prf.prfplus(key, seed, 32), prf.prf(key, &data));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn prfplus_prefix_property() {
        let prf = Prf::ikev2(2).unwrap();
        let key = b"key";
        let seed = b"seed";
        let long = prf.prfplus(key, seed, 100);
        for n in [0, 1, 19, 20, 21, 64, 99] {
            assert_eq!(prf.prfplus(key, seed, n), long[..n]);
        }
        assert_eq!(long.len(), 100);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn prfplus_variants_differ() {
        let prf = Prf::ikev1(2).unwrap();
        assert_ne!(
            prf.prfplus(b"key", b"seed", 40),
            prf.prfplus_1(b"key", b"seed", 40)
        );
    }

    // RFC 2202 test case 2: HMAC-SHA1("Jefe", "what do ya want for nothing?")
    #[test]
    #[allow(clippy::unwrap_used)]
    fn prf_known_answer() {
        let prf = Prf::ikev2(2).unwrap();
        assert_eq!(
            prf.prf(b"Jefe", b"what do ya want for nothing?"),
            vec![
                0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, //
                0x16, 0xd5, 0xf1, 0x84, 0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79,
            ]
        );
    }
}
