//! Diffie-Hellman key exchange for the MODP groups spec §4.1 requires.
//! Group NONE means Child-SA rekeys without PFS and never reaches this
//! module.
//!
//! `ring` only exposes ECDH curves, not the classic MODP groups IKEv2 still
//! negotiates against legacy peers, so modular exponentiation is done with
//! `num-bigint` over the fixed RFC 3526 primes — the same approach other
//! from-scratch DH/key-exchange modules in the corpus take when they need a
//! group `ring` doesn't cover.

use super::{CryptoError, DhGroupId};
use num_bigint::BigUint;
use num_traits::One;

/// RFC 2409 §6.2 Oakley Group 2 (1024-bit MODP) prime, big-endian.
const MODP_1024_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519",
    "B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7",
    "EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F2",
    "4117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55",
    "D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED",
    "529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E",
    "36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9D",
    "E2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A",
    "8AACAA68FFFFFFFFFFFFFFFF"
);

/// RFC 3526 §3 Group 14 (2048-bit MODP) prime, big-endian.
const MODP_2048_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519",
    "B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7",
    "EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F2",
    "4117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55",
    "D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED",
    "529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E",
    "36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9D",
    "E2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A",
    "8AAAC42DAD33170D04507A33A85521ABDF1CBA64ECFB850458DBEF0A",
    "8AEA71575D060C7DB3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E0",
    "4A25619DCEE3D2261AD2EE6BF12FFA06D98A0864D87602733EC86A64",
    "521F2B18177B200CBBE117577A615D6C770988C0BAD946E208E24FA",
    "074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
);

const GENERATOR: u64 = 2;

fn prime_for(group: DhGroupId) -> Result<BigUint, CryptoError> {
    let hex = match group {
        DhGroupId::Modp1024 => MODP_1024_PRIME_HEX,
        DhGroupId::Modp2048 => MODP_2048_PRIME_HEX,
        DhGroupId::None => return Err(CryptoError::UnsupportedAlgorithm),
    };
    BigUint::parse_bytes(hex.as_bytes(), 16).ok_or(CryptoError::DhFailure)
}

/// A locally generated MODP key pair. The private exponent is kept only for
/// the lifetime of one IKE_SA_INIT/rekey exchange — it never goes into an SA
/// record.
pub struct DhKeyPair {
    group: DhGroupId,
    private: BigUint,
    pub public: Vec<u8>,
}

impl DhKeyPair {
    /// Generates a fresh key pair, sourcing the private exponent from the
    /// injectable randomness source (spec §9).
    pub fn generate(group: DhGroupId, rng: &mut dyn super::rng::SecureRandomSource) -> Result<Self, CryptoError> {
        let prime = prime_for(group)?;
        let byte_len = group.public_value_len();
        let mut priv_bytes = vec![0u8; byte_len];
        rng.fill(&mut priv_bytes).map_err(|_| CryptoError::DhFailure)?;
        let private = BigUint::from_bytes_be(&priv_bytes) % &prime;
        let public = private.modpow(&BigUint::from(GENERATOR), &prime);
        Ok(DhKeyPair {
            group,
            private,
            public: left_pad(&public.to_bytes_be(), byte_len),
        })
    }

    /// Computes `peer_public ^ private mod p`, the shared secret `g^ir`.
    pub fn compute_shared(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let prime = prime_for(self.group)?;
        let peer = BigUint::from_bytes_be(peer_public);
        if peer <= BigUint::one() || peer >= prime - BigUint::one() {
            // degenerate public value: rejects the small-subgroup attack
            // surface without needing a full subgroup-order check for these
            // MODP groups.
            return Err(CryptoError::DhFailure);
        }
        let shared = peer.modpow(&self.private, &prime_for(self.group)?);
        Ok(left_pad(&shared.to_bytes_be(), self.group.public_value_len()))
    }
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::crypto::rng::SystemRandomSource;

    #[test]
    fn modp_key_exchange_agrees() {
        let mut rng = SystemRandomSource::default();
        let a = DhKeyPair::generate(DhGroupId::Modp1024, &mut rng).unwrap();
        let b = DhKeyPair::generate(DhGroupId::Modp1024, &mut rng).unwrap();

        let shared_a = a.compute_shared(&b.public).unwrap();
        let shared_b = b.compute_shared(&a.public).unwrap();
        assert_eq!(shared_a, shared_b);
        assert_eq!(shared_a.len(), DhGroupId::Modp1024.public_value_len());
    }

    #[test]
    fn rejects_degenerate_public_value() {
        let mut rng = SystemRandomSource::default();
        let a = DhKeyPair::generate(DhGroupId::Modp2048, &mut rng).unwrap();
        assert!(a.compute_shared(&[0u8; 256]).is_err());
        assert!(a.compute_shared(&[1u8; 256]).is_err());
    }
}
