//! Integrity (MAC) transforms: NONE, HMAC-SHA1-96, AES-XCBC-96, and the
//! HMAC-SHA2 family, keyed by [`IntegrityAlgorithmId`] (spec §4.1).

use super::prf::aes128_xcbc_mac;
use super::{CryptoError, IntegrityAlgorithmId as Alg};
use ring::hmac;

/// Computes the truncated MAC over `data` under `key`.
pub fn mac(alg: Alg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if alg == Alg::None {
        return Ok(Vec::new());
    }
    if key.len() != alg.key_len() {
        return Err(CryptoError::InvalidKeyLength {
            expected: alg.key_len(),
            got: key.len(),
        });
    }

    let full = match alg {
        Alg::None => unreachable!(),
        Alg::HmacSha1_96 => {
            let k = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
            hmac::sign(&k, data).as_ref().to_vec()
        }
        Alg::HmacSha2_256_128 => {
            let k = hmac::Key::new(hmac::HMAC_SHA256, key);
            hmac::sign(&k, data).as_ref().to_vec()
        }
        Alg::HmacSha2_384_192 => {
            let k = hmac::Key::new(hmac::HMAC_SHA384, key);
            hmac::sign(&k, data).as_ref().to_vec()
        }
        Alg::HmacSha2_512_256 => {
            let k = hmac::Key::new(hmac::HMAC_SHA512, key);
            hmac::sign(&k, data).as_ref().to_vec()
        }
        Alg::AesXcbc96 => {
            let key_arr: [u8; 16] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: 16,
                got: key.len(),
            })?;
            aes128_xcbc_mac(&key_arr, data)?
        }
    };

    Ok(full[..alg.icv_len()].to_vec())
}

/// Verifies a received ICV in constant time, returning `Ok(())` on match.
pub fn verify(alg: Alg, key: &[u8], data: &[u8], icv: &[u8]) -> Result<(), CryptoError> {
    let expected = mac(alg, key, data)?;
    if expected.len() != icv.len() {
        return Err(CryptoError::MacMismatch);
    }
    // constant-time comparison: fold any mismatch into one accumulator
    let diff = expected
        .iter()
        .zip(icv.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(CryptoError::MacMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_produces_empty_mac() {
        assert_eq!(mac(Alg::None, &[], b"data").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn hmac_sha1_96_truncates_to_12_bytes() {
        let key = [0u8; 20];
        let m = mac(Alg::HmacSha1_96, &key, b"some auth span").unwrap();
        assert_eq!(m.len(), 12);
        verify(Alg::HmacSha1_96, &key, b"some auth span", &m).unwrap();
    }

    #[test]
    fn verify_rejects_any_bit_flip() {
        let key = [1u8; 32];
        let data = b"header||iv||ciphertext";
        let mut m = mac(Alg::HmacSha2_256_128, &key, data).unwrap();
        assert!(verify(Alg::HmacSha2_256_128, &key, data, &m).is_ok());
        m[0] ^= 0x01;
        assert!(verify(Alg::HmacSha2_256_128, &key, data, &m).is_err());
    }

    #[test]
    fn aes_xcbc_96_round_trips() {
        let key = [9u8; 16];
        let data = b"xcbc covers this span";
        let m = mac(Alg::AesXcbc96, &key, data).unwrap();
        assert_eq!(m.len(), 12);
        verify(Alg::AesXcbc96, &key, data, &m).unwrap();
    }
}
