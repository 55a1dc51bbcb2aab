//! Diffie-Hellman key exchange
//!
//! Covers the MODP groups 2, 5 and 14 to 18 (RFC 3526 primes, generator 2)
//! and the ECP groups 19 to 21 (RFC 5903, NIST P-256/P-384/P-521). Key
//! exchange data on the wire is the bare big-endian group element: MODP
//! values are left-padded to the prime length, ECP points are the
//! concatenation of the affine x and y coordinates.

use log::{debug, warn};
use num_bigint::{BigUint, RandBigInt};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use rand::rngs::OsRng;

use crate::errors::CryptoError;

const MODP_1024: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
);

const MODP_1536: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
);

const MODP_2048: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const MODP_3072: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
);

const MODP_4096: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF",
);

const MODP_6144: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DCC4024FFFFFFFFFFFFFFFF",
);

const MODP_8192: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E4",
    "38777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300741FA7BF8AFC47ED",
    "2576F6936BA424663AAB639C5AE4F5683423B4742BF1C978238F16CBE39D652D",
    "E3FDB8BEFC848AD922222E04A4037C0713EB57A81A23F0C73473FC646CEA306B",
    "4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A062B3CF5B3A278A6",
    "6D2A13F83F44F82DDF310EE074AB6A364597E899A0255DC164F31CC50846851D",
    "F9AB48195DED7EA1B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F92",
    "4009438B481C6CD7889A002ED5EE382BC9190DA6FC026E479558E4475677E9AA",
    "9E3050E2765694DFC81F56E880B96E7160C980DD98EDD3DFFFFFFFFFFFFFFFFF",
);
/// An ephemeral key exchange in progress: the local public value has been
/// generated, the shared secret still needs the peer's public value
pub enum DhSecret {
    /// MODP exponentiation over one of the RFC 3526 primes
    Modp {
        /// The group prime
        prime: BigUint,
        /// The private exponent
        exponent: BigUint,
        /// The public value, left-padded to the prime length
        public: Vec<u8>,
    },
    /// NIST P-256 (group 19)
    P256(p256::ecdh::EphemeralSecret, Vec<u8>),
    /// NIST P-384 (group 20)
    P384(p384::ecdh::EphemeralSecret, Vec<u8>),
    /// NIST P-521 (group 21)
    P521(p521::ecdh::EphemeralSecret, Vec<u8>),
}

impl DhSecret {
    /// Generate an ephemeral secret for the given IANA group id
    pub fn generate(group_id: u16) -> Result<Self, CryptoError> {
        match group_id {
            2 => Self::modp(MODP_1024),
            5 => Self::modp(MODP_1536),
            14 => Self::modp(MODP_2048),
            15 => Self::modp(MODP_3072),
            16 => Self::modp(MODP_4096),
            17 => Self::modp(MODP_6144),
            18 => Self::modp(MODP_8192),
            19 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let public = point.as_bytes()[1..].to_vec();
                Ok(DhSecret::P256(secret, public))
            }
            20 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let public = point.as_bytes()[1..].to_vec();
                Ok(DhSecret::P384(secret, public))
            }
            21 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let public = point.as_bytes()[1..].to_vec();
                Ok(DhSecret::P521(secret, public))
            }
            other => {
                warn!("Unknown Diffie-Hellman group {other}");
                Err(CryptoError::UnknownDhGroup(other))
            }
        }
    }

    fn modp(prime_hex: &str) -> Result<Self, CryptoError> {
        let prime = match BigUint::parse_bytes(prime_hex.as_bytes(), 16) {
            Some(p) => p,
            None => unreachable!("group primes are valid hex"),
        };
        let exponent = OsRng.gen_biguint_below(&prime);
        let public = BigUint::from(2u8).modpow(&exponent, &prime);
        let public = pad_to(&public, prime_hex.len() / 2);
        Ok(DhSecret::Modp {
            prime,
            exponent,
            public,
        })
    }

    /// The local public value in wire encoding
    pub fn public_key(&self) -> &[u8] {
        match self {
            DhSecret::Modp { public, .. } => public,
            DhSecret::P256(_, public) | DhSecret::P384(_, public) | DhSecret::P521(_, public) => {
                public
            }
        }
    }

    /// Complete the exchange against the peer's public value
    pub fn agree(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            DhSecret::Modp {
                prime, exponent, ..
            } => {
                let size = (prime.bits() as usize).div_ceil(8);
                if peer_public.len() != size {
                    return Err(CryptoError::InvalidPublicKey);
                }
                let peer = BigUint::from_bytes_be(peer_public);
                // reject the degenerate elements 0, 1 and p-1
                if peer <= BigUint::from(1u8) || peer >= prime - 1u8 {
                    debug!("Degenerate MODP peer value rejected");
                    return Err(CryptoError::InvalidPublicKey);
                }
                Ok(pad_to(&peer.modpow(exponent, prime), size))
            }
            DhSecret::P256(secret, _) => {
                if peer_public.len() != 64 {
                    return Err(CryptoError::InvalidPublicKey);
                }
                let point =
                    p256::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(peer_public));
                let peer = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(
                    &point,
                ))
                .ok_or(CryptoError::InvalidPublicKey)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            DhSecret::P384(secret, _) => {
                if peer_public.len() != 96 {
                    return Err(CryptoError::InvalidPublicKey);
                }
                let point =
                    p384::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(peer_public));
                let peer = Option::<p384::PublicKey>::from(p384::PublicKey::from_encoded_point(
                    &point,
                ))
                .ok_or(CryptoError::InvalidPublicKey)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            DhSecret::P521(secret, _) => {
                if peer_public.len() != 132 {
                    return Err(CryptoError::InvalidPublicKey);
                }
                let point =
                    p521::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(peer_public));
                let peer = Option::<p521::PublicKey>::from(p521::PublicKey::from_encoded_point(
                    &point,
                ))
                .ok_or(CryptoError::InvalidPublicKey)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// One-shot exchange: generate a secret, return the public value and the
/// shared secret against the supplied peer value
pub fn diffie_hellman(group_id: u16, peer_public: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let secret = DhSecret::generate(group_id)?;
    let shared = secret.agree(peer_public)?;
    Ok((secret.public_key().to_vec(), shared))
}

fn pad_to(value: &BigUint, size: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; size.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::{diffie_hellman, DhSecret};

    #[test]
    #[allow(clippy::unwrap_used)]
    fn modp_group14_agreement() {
        let alice = DhSecret::generate(14).unwrap();
        assert_eq!(alice.public_key().len(), 256);
        let (bob_public, bob_shared) = diffie_hellman(14, alice.public_key()).unwrap();
        let alice_shared = alice.agree(&bob_public).unwrap();
        assert_eq!(alice_shared, bob_shared);
        assert_eq!(alice_shared.len(), 256);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ecp_group19_agreement() {
        let alice = DhSecret::generate(19).unwrap();
        assert_eq!(alice.public_key().len(), 64);
        let (bob_public, bob_shared) = diffie_hellman(19, alice.public_key()).unwrap();
        let alice_shared = alice.agree(&bob_public).unwrap();
        assert_eq!(alice_shared, bob_shared);
        assert_eq!(alice_shared.len(), 32);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn rejects_degenerate_modp_elements() {
        let alice = DhSecret::generate(2).unwrap();
        assert!(alice.agree(&[0u8; 128]).is_err());
        let mut one = vec![0u8; 128];
        one[127] = 1;
        assert!(alice.agree(&one).is_err());
        assert!(alice.agree(&[0u8; 12]).is_err());
    }

    #[test]
    fn rejects_unknown_group() {
        assert!(DhSecret::generate(26).is_err());
    }
}
