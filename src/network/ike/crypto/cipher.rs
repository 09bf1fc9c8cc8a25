//! Encryption transforms: 3DES-CBC, AES-CBC (128/192/256) and AES-GCM
//! (8/12/16-octet ICV), keyed by [`EncryptionAlgorithmId`] (spec §4.1).
//!
//! `ring` (already in the dependency tree for hashing and AEAD) has no raw
//! CBC mode, so the CBC ciphers are built from the RustCrypto `aes`/`des`
//! block ciphers plus the `cbc` mode crate — the same pairing the broader
//! corpus reaches for wherever a non-AEAD block cipher mode is needed.

use super::{CryptoError, EncryptionAlgorithmId as Alg};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use ring::aead;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;

/// Encrypts `plaintext` (already a whole number of blocks — callers pad the
/// inner IKE payload chain themselves per spec §4.2, never the cipher) under
/// `key`/`iv`, returning ciphertext for CBC modes or ciphertext||tag for GCM
/// modes. `aad` is only used by the GCM variants.
pub fn encrypt(
    alg: Alg,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match alg {
        Alg::TripleDesCbc => cbc_encrypt_tdes(key, iv, plaintext),
        Alg::AesCbc => cbc_encrypt_aes(key, iv, plaintext),
        Alg::AesGcm8 | Alg::AesGcm12 | Alg::AesGcm16 => gcm_encrypt(alg, key, iv, plaintext, aad),
    }
}

/// Inverse of [`encrypt`]. For GCM, `ciphertext` must include the trailing
/// authentication tag; it is verified and stripped.
pub fn decrypt(
    alg: Alg,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match alg {
        Alg::TripleDesCbc => cbc_decrypt_tdes(key, iv, ciphertext),
        Alg::AesCbc => cbc_decrypt_aes(key, iv, ciphertext),
        Alg::AesGcm8 | Alg::AesGcm12 | Alg::AesGcm16 => gcm_decrypt(alg, key, iv, ciphertext, aad),
    }
}

fn cbc_encrypt_tdes(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let enc = TdesCbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 24,
        got: key.len(),
    })?;
    let mut buf = plaintext.to_vec();
    encrypt_in_place_blocks(enc, &mut buf)?;
    Ok(buf)
}

fn cbc_decrypt_tdes(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let dec = TdesCbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 24,
        got: key.len(),
    })?;
    let mut buf = ciphertext.to_vec();
    decrypt_in_place_blocks(dec, &mut buf)?;
    Ok(buf)
}

fn cbc_encrypt_aes(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut buf = plaintext.to_vec();
    match key.len() {
        16 => {
            let enc = Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            encrypt_in_place_blocks(enc, &mut buf)?;
        }
        24 => {
            let enc = Aes192CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            encrypt_in_place_blocks(enc, &mut buf)?;
        }
        32 => {
            let enc = Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            encrypt_in_place_blocks(enc, &mut buf)?;
        }
        other => {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: other,
            });
        }
    }
    Ok(buf)
}

fn cbc_decrypt_aes(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut buf = ciphertext.to_vec();
    match key.len() {
        16 => {
            let dec = Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            decrypt_in_place_blocks(dec, &mut buf)?;
        }
        24 => {
            let dec = Aes192CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            decrypt_in_place_blocks(dec, &mut buf)?;
        }
        32 => {
            let dec = Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| CryptoError::InvalidNonce)?;
            decrypt_in_place_blocks(dec, &mut buf)?;
        }
        other => {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: other,
            });
        }
    }
    Ok(buf)
}

/// Runs a CBC encryptor over `buf` in place, block by block (no padding —
/// the inner IKE payload chain is already block-aligned by the caller).
fn encrypt_in_place_blocks<C: BlockEncryptMut + cbc::cipher::BlockSizeUser>(
    mut enc: C,
    buf: &mut [u8],
) -> Result<(), CryptoError> {
    let block_size = C::block_size();
    if buf.len() % block_size != 0 {
        return Err(CryptoError::InvalidNonce);
    }
    for chunk in buf.chunks_mut(block_size) {
        enc.encrypt_block_mut(cbc::cipher::generic_array::GenericArray::from_mut_slice(
            chunk,
        ));
    }
    Ok(())
}

fn decrypt_in_place_blocks<C: BlockDecryptMut + cbc::cipher::BlockSizeUser>(
    mut dec: C,
    buf: &mut [u8],
) -> Result<(), CryptoError> {
    let block_size = C::block_size();
    if buf.len() % block_size != 0 {
        return Err(CryptoError::InvalidNonce);
    }
    for chunk in buf.chunks_mut(block_size) {
        dec.decrypt_block_mut(cbc::cipher::generic_array::GenericArray::from_mut_slice(
            chunk,
        ));
    }
    Ok(())
}

fn gcm_algorithm(alg: Alg, key_len: usize) -> Result<&'static aead::Algorithm, CryptoError> {
    let _ = alg;
    match key_len {
        16 => Ok(&aead::AES_128_GCM),
        32 => Ok(&aead::AES_256_GCM),
        other => Err(CryptoError::InvalidKeyLength {
            expected: 32,
            got: other,
        }),
    }
}

fn gcm_encrypt(
    alg: Alg,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let algorithm = gcm_algorithm(alg, key.len())?;
    let unbound = aead::UnboundKey::new(algorithm, key).map_err(|_| CryptoError::AeadFailure)?;
    let sealing = aead::LessSafeKey::new(unbound);
    let nonce = aead::Nonce::try_assume_unique_for_key(iv).map_err(|_| CryptoError::InvalidNonce)?;
    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(nonce, aead::Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::AeadFailure)?;
    Ok(in_out)
}

fn gcm_decrypt(
    alg: Alg,
    key: &[u8],
    iv: &[u8],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let algorithm = gcm_algorithm(alg, key.len())?;
    let unbound = aead::UnboundKey::new(algorithm, key).map_err(|_| CryptoError::AeadFailure)?;
    let opening = aead::LessSafeKey::new(unbound);
    let nonce = aead::Nonce::try_assume_unique_for_key(iv).map_err(|_| CryptoError::InvalidNonce)?;
    let mut in_out = ciphertext_and_tag.to_vec();
    let plaintext = opening
        .open_in_place(nonce, aead::Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::AeadFailure)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_cbc_round_trips() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let plaintext = [0xABu8; 32];
        let ct = encrypt(Alg::AesCbc, &key, &iv, &plaintext, &[]).unwrap();
        let pt = decrypt(Alg::AesCbc, &key, &iv, &ct, &[]).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn aes_gcm16_round_trips_and_authenticates_aad() {
        let key = [0x33u8; 32];
        let iv = [0x44u8; 8];
        let plaintext = b"hello ike_auth payload chain!!!".to_vec();
        let aad = b"header-bytes";
        let ct = encrypt(Alg::AesGcm16, &key, &iv, &plaintext, aad).unwrap();
        let pt = decrypt(Alg::AesGcm16, &key, &iv, &ct, aad).unwrap();
        assert_eq!(pt, plaintext);

        // tampering the AAD must fail the tag check
        assert!(decrypt(Alg::AesGcm16, &key, &iv, &ct, b"wrong-aad").is_err());
    }

    #[test]
    fn tdes_cbc_round_trips() {
        let key = [0x55u8; 24];
        let iv = [0x66u8; 8];
        let plaintext = [0x77u8; 16];
        let ct = encrypt(Alg::TripleDesCbc, &key, &iv, &plaintext, &[]).unwrap();
        let pt = decrypt(Alg::TripleDesCbc, &key, &iv, &ct, &[]).unwrap();
        assert_eq!(pt, plaintext);
    }
}
