//! Pseudo-random function and the `PRF+` key-material expander
//! (RFC 7296 §2.13), the sole key-material expander used by [`super::super::keys`].

use super::{CryptoError, PrfId};
use aes::cipher::{BlockEncrypt, KeyInit};
use ring::hmac;

/// A single PRF application, producing exactly `prf_id.output_len()` bytes.
pub fn prf(prf_id: PrfId, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match prf_id {
        PrfId::HmacSha1 => Ok(hmac_sha1(key, data)),
        PrfId::Aes128Xcbc => aes128_xcbc_prf(key, data),
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    hmac::sign(&hmac_key, data).as_ref().to_vec()
}

/// `PRF+(key, seed, n)`: concatenate `T1, T2, …` where
/// `Ti = PRF(key, T(i-1) | seed | i)` and `T1` omits `T(i-1)`, truncating the
/// concatenation to `n` bytes.
///
/// `i` is a single octet counter starting at 1; RFC 7296 bounds it to 255,
/// which bounds the usable output to `255 * prf_id.output_len()` bytes — far
/// beyond anything this core ever expands in one call.
pub fn prf_plus(prf_id: PrfId, key: &[u8], seed: &[u8], n: usize) -> Result<Vec<u8>, CryptoError> {
    let block_len = prf_id.output_len();
    let mut out = Vec::with_capacity(n + block_len);
    let mut t_prev: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;

    while out.len() < n {
        if counter == 0 {
            // wrapped past 255 iterations
            return Err(CryptoError::UnsupportedAlgorithm);
        }
        let mut input = Vec::with_capacity(t_prev.len() + seed.len() + 1);
        input.extend_from_slice(&t_prev);
        input.extend_from_slice(seed);
        input.push(counter);

        let t_i = prf(prf_id, key, &input)?;
        out.extend_from_slice(&t_i);
        t_prev = t_i;
        counter = counter.wrapping_add(1);
    }

    out.truncate(n);
    Ok(out)
}

/// AES-128-XCBC-PRF-128 (RFC 4434), the PRF variant of AES-XCBC-MAC-96 that
/// returns the full 128-bit MAC instead of truncating it. Keys that are not
/// exactly 128 bits are first folded down to 128 bits by running this same
/// algorithm with an all-zero key, per RFC 4434 §2.
fn aes128_xcbc_prf(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let k = if key.len() == 16 {
        key.to_vec()
    } else {
        aes128_xcbc_mac(&[0u8; 16], key)?
    };
    aes128_xcbc_mac(&k, data)
}

/// Core AES-XCBC-MAC-96 algorithm (RFC 3566) keyed by a 128-bit key,
/// returning the full 16-byte MAC (truncation to 96 bits, when required by
/// the integrity transform, happens in [`super::integrity`]).
pub(super) fn aes128_xcbc_mac(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    use aes::Aes128;
    use aes::cipher::generic_array::GenericArray;

    let k1_seed = derive_subkey(key, 0x01)?;
    let k2 = derive_subkey(key, 0x02)?;
    let k3 = derive_subkey(key, 0x03)?;

    let cipher_k1 =
        Aes128::new_from_slice(&k1_seed).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 16,
            got: k1_seed.len(),
        })?;

    let mut e = [0u8; 16];
    let full_blocks = if data.is_empty() {
        0
    } else if data.len() % 16 == 0 {
        data.len() / 16 - 1
    } else {
        data.len() / 16
    };

    for i in 0..full_blocks {
        let mut block = [0u8; 16];
        let chunk = &data[i * 16..(i + 1) * 16];
        for (b, (e_b, d_b)) in block.iter_mut().zip(e.iter().zip(chunk.iter())) {
            *b = e_b ^ d_b;
        }
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher_k1.encrypt_block(&mut ga);
        e.copy_from_slice(&ga);
    }

    let last_start = full_blocks * 16;
    let last_chunk = &data[last_start..];
    let mut last_block = [0u8; 16];
    let (pad_key, xored_len) = if last_chunk.len() == 16 {
        last_block.copy_from_slice(last_chunk);
        (k2, 16)
    } else {
        last_block[..last_chunk.len()].copy_from_slice(last_chunk);
        last_block[last_chunk.len()] = 0x80;
        (k3, last_chunk.len() + 1)
    };
    let _ = xored_len;

    for (b, e_b) in last_block.iter_mut().zip(e.iter()) {
        *b ^= e_b
    }
    let final_key_arr: [u8; 16] = pad_key.try_into().map_err(|_| CryptoError::DhFailure)?;
    let cipher_pad =
        Aes128::new_from_slice(&final_key_arr).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 16,
            got: final_key_arr.len(),
        })?;
    let mut ga = GenericArray::clone_from_slice(&last_block);
    cipher_pad.encrypt_block(&mut ga);

    Ok(ga.to_vec())
}

/// Derives one of the three XCBC-MAC subkeys by encrypting a constant
/// all-`const_byte` block under `key` (RFC 3566 §4).
fn derive_subkey(key: &[u8; 16], const_byte: u8) -> Result<Vec<u8>, CryptoError> {
    use aes::Aes128;
    use aes::cipher::generic_array::GenericArray;

    let cipher = Aes128::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 16,
        got: key.len(),
    })?;
    let mut block = GenericArray::clone_from_slice(&[const_byte; 16]);
    cipher.encrypt_block(&mut block);
    Ok(block.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    /// Worked vector from spec §8.2.
    #[test]
    fn hmac_sha1_prf_vector() {
        let key = hex("094787780EE466E2CB049FA327B43908BC57E485");
        let data = hex("010000000a50500d");
        let mac = prf(PrfId::HmacSha1, &key, &data).unwrap();
        assert_eq!(mac, hex("D83B20CC6A0932B2A7CEF26E4020ABAAB64F0C6A"));
    }

    #[test]
    fn prf_plus_is_prefix_consistent() {
        let key = b"0123456789abcdef";
        let seed = b"some-seed-material";
        let long = prf_plus(PrfId::HmacSha1, key, seed, 80).unwrap();
        let short = prf_plus(PrfId::HmacSha1, key, seed, 37).unwrap();
        assert_eq!(&long[..37], &short[..]);
    }

    #[test]
    fn prf_plus_respects_requested_length() {
        let key = b"key";
        let seed = b"seed";
        for n in [0usize, 1, 19, 20, 21, 64, 100] {
            let out = prf_plus(PrfId::HmacSha1, key, seed, n).unwrap();
            assert_eq!(out.len(), n);
        }
    }
}
