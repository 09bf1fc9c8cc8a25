//! The Encrypted (SK) payload envelope (RFC 7296 §3.14, AEAD variant per
//! RFC 5282): `IV | Ciphertext | Padding | Pad Length | ICV`, where for AEAD
//! ciphers the ICV is the AEAD tag folded into the ciphertext rather than a
//! separate trailing MAC.
//!
//! Sizes are fully determined before any byte is encrypted — [`total_encoded_len`]
//! lets a caller finalize the outer [`super::header::IkeHeader`] length field
//! first, then pass the now-final header bytes in as additional authenticated
//! data / MAC input, exactly as spec §4.2 requires.

use super::payload::{decode_generic_header, encode_generic_header, PayloadChain};
use super::{CodecError, PayloadType};
use crate::network::ike::crypto::{self, EncryptionAlgorithmId, IntegrityAlgorithmId, SecretBytes};
use crate::network::ike::crypto::rng::SecureRandomSource;

/// Number of bytes the encoded SK payload will occupy (generic header
/// included) for an inner plaintext chain of `inner_len` bytes.
pub fn total_encoded_len(
    encr_alg: EncryptionAlgorithmId,
    integ_alg: IntegrityAlgorithmId,
    inner_len: usize,
) -> usize {
    let padded = padded_len(encr_alg.block_size(), inner_len);
    let ciphertext_len = if encr_alg.is_aead() {
        padded + encr_alg.aead_icv_len()
    } else {
        padded
    };
    let trailing_icv = if encr_alg.is_aead() { 0 } else { integ_alg.icv_len() };
    4 + encr_alg.iv_len() + ciphertext_len + trailing_icv
}

fn padded_len(block_size: usize, inner_len: usize) -> usize {
    let remainder = (inner_len + 1) % block_size;
    if remainder == 0 {
        inner_len + 1
    } else {
        inner_len + 1 + (block_size - remainder)
    }
}

/// Builds the complete encoded SK payload (generic header + body) for
/// `inner_chain`, under the already-finalized `header_bytes` of the
/// enclosing message.
pub fn encrypt(
    encr_alg: EncryptionAlgorithmId,
    key_length_bits: Option<u16>,
    integ_alg: IntegrityAlgorithmId,
    sk_e: &SecretBytes,
    sk_a: &SecretBytes,
    header_bytes: &[u8],
    inner_chain: &PayloadChain,
    rng: &mut dyn SecureRandomSource,
) -> Result<Vec<u8>, CodecError> {
    let (first_payload, inner_bytes) = inner_chain.encode();

    let key_len = encr_alg
        .key_len(key_length_bits)
        .ok_or_else(|| CodecError::InvalidSyntax("unsupported encryption key length".into()))?;

    let block_size = encr_alg.block_size();
    let padded = padded_len(block_size, inner_bytes.len());
    let pad_len = padded - inner_bytes.len() - 1;
    let mut plaintext = Vec::with_capacity(padded);
    plaintext.extend_from_slice(&inner_bytes);
    let mut padding = vec![0u8; pad_len];
    rng.fill(&mut padding).map_err(|_| {
        CodecError::Crypto(crypto::CryptoError::InvalidNonce)
    })?;
    plaintext.extend_from_slice(&padding);
    plaintext.push(pad_len as u8);

    let ciphertext_len = if encr_alg.is_aead() {
        plaintext.len() + encr_alg.aead_icv_len()
    } else {
        plaintext.len()
    };
    let trailing_icv_len = if encr_alg.is_aead() { 0 } else { integ_alg.icv_len() };
    let body_len = encr_alg.iv_len() + ciphertext_len + trailing_icv_len;

    let mut generic_header = Vec::with_capacity(4);
    encode_generic_header(&mut generic_header, first_payload, false, body_len);

    let mut iv = vec![0u8; encr_alg.iv_len()];
    rng.fill(&mut iv).map_err(|_| CodecError::Crypto(crypto::CryptoError::InvalidNonce))?;

    let mut prefix = Vec::with_capacity(header_bytes.len() + generic_header.len());
    prefix.extend_from_slice(header_bytes);
    prefix.extend_from_slice(&generic_header);

    let body = if encr_alg.is_aead() {
        let salt_len = encr_alg.aead_salt_len();
        let key = &sk_e.as_slice()[..key_len];
        let salt = &sk_e.as_slice()[key_len..key_len + salt_len];
        let nonce: Vec<u8> = salt.iter().chain(iv.iter()).copied().collect();
        let ciphertext = crypto::cipher::encrypt(encr_alg, key, &nonce, &plaintext, &prefix)?;
        let mut body = Vec::with_capacity(iv.len() + ciphertext.len());
        body.extend_from_slice(&iv);
        body.extend_from_slice(&ciphertext);
        body
    } else {
        let key = &sk_e.as_slice()[..key_len];
        let ciphertext = crypto::cipher::encrypt(encr_alg, key, &iv, &plaintext, &[])?;
        let mut mac_span = prefix.clone();
        mac_span.extend_from_slice(&iv);
        mac_span.extend_from_slice(&ciphertext);
        let icv = crypto::integrity::mac(integ_alg, sk_a.as_slice(), &mac_span)?;
        let mut body = Vec::with_capacity(iv.len() + ciphertext.len() + icv.len());
        body.extend_from_slice(&iv);
        body.extend_from_slice(&ciphertext);
        body.extend_from_slice(&icv);
        body
    };

    let mut out = generic_header;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`encrypt`]: `generic_header_bytes` is the 4-byte header the
/// chain walker already consumed for this payload, `next_payload` is its
/// decoded Next Payload field, and `body` is everything after it
/// (`IV | Ciphertext | Padding | Pad Length | ICV`).
pub fn decrypt(
    encr_alg: EncryptionAlgorithmId,
    key_length_bits: Option<u16>,
    integ_alg: IntegrityAlgorithmId,
    sk_e: &SecretBytes,
    sk_a: &SecretBytes,
    header_bytes: &[u8],
    generic_header_bytes: &[u8],
    next_payload: PayloadType,
    body: &[u8],
) -> Result<PayloadChain, CodecError> {
    let key_len = encr_alg
        .key_len(key_length_bits)
        .ok_or_else(|| CodecError::InvalidSyntax("unsupported encryption key length".into()))?;

    let iv_len = encr_alg.iv_len();
    if body.len() < iv_len {
        return Err(CodecError::InvalidSyntax("encrypted payload shorter than IV".into()));
    }
    let iv = &body[..iv_len];
    let rest = &body[iv_len..];

    let mut prefix = Vec::with_capacity(header_bytes.len() + generic_header_bytes.len());
    prefix.extend_from_slice(header_bytes);
    prefix.extend_from_slice(generic_header_bytes);

    let plaintext_padded = if encr_alg.is_aead() {
        let salt_len = encr_alg.aead_salt_len();
        let key = &sk_e.as_slice()[..key_len];
        let salt = &sk_e.as_slice()[key_len..key_len + salt_len];
        let nonce: Vec<u8> = salt.iter().chain(iv.iter()).copied().collect();
        crypto::cipher::decrypt(encr_alg, key, &nonce, rest, &prefix)?
    } else {
        let icv_len = integ_alg.icv_len();
        if rest.len() < icv_len {
            return Err(CodecError::InvalidSyntax("encrypted payload shorter than ICV".into()));
        }
        let split = rest.len() - icv_len;
        let ciphertext = &rest[..split];
        let icv = &rest[split..];
        let mut mac_span = prefix.clone();
        mac_span.extend_from_slice(iv);
        mac_span.extend_from_slice(ciphertext);
        crypto::integrity::verify(integ_alg, sk_a.as_slice(), &mac_span, icv)?;
        let key = &sk_e.as_slice()[..key_len];
        crypto::cipher::decrypt(encr_alg, key, iv, ciphertext, &[])?
    };

    if plaintext_padded.is_empty() {
        return Err(CodecError::InvalidSyntax("decrypted payload is empty".into()));
    }
    let pad_len = plaintext_padded[plaintext_padded.len() - 1] as usize;
    if pad_len + 1 > plaintext_padded.len() {
        return Err(CodecError::InvalidSyntax("pad length exceeds decrypted payload".into()));
    }
    let inner_bytes = &plaintext_padded[..plaintext_padded.len() - pad_len - 1];

    PayloadChain::decode(next_payload, inner_bytes)
}

/// Splits a raw `Payload::Encrypted` body's leading 4 bytes back out as the
/// generic header bytes a caller needs for [`decrypt`]'s prefix, given the
/// original on-wire message and the offset the SK payload started at.
pub fn recover_generic_header_bytes(message: &[u8], sk_payload_offset: usize) -> Result<&[u8], CodecError> {
    let end = sk_payload_offset + crate::network::ike::GENERIC_PAYLOAD_HEADER_LEN;
    if end > message.len() {
        return Err(CodecError::InvalidSyntax(
            "message too short to contain SK payload generic header".into(),
        ));
    }
    let _ = decode_generic_header(&message[sk_payload_offset..])?;
    Ok(&message[sk_payload_offset..end])
}

/// Splits a full on-wire message immediately following the fixed IKE header
/// into the SK payload's `(inner first payload type, generic header bytes,
/// body)`, so a caller never has to reach into `decode_generic_header`
/// directly. The session layer uses this to locate the Encrypted payload
/// without routing it through [`PayloadChain::decode`], which would discard
/// the inner chain's first payload type once the SK payload is the last
/// entry in the outer chain.
pub fn split_sk_payload(message: &[u8]) -> Result<(PayloadType, &[u8], &[u8]), CodecError> {
    let offset = crate::network::ike::IKE_HEADER_LEN;
    let hdr_len = crate::network::ike::GENERIC_PAYLOAD_HEADER_LEN;
    if message.len() < offset + hdr_len {
        return Err(CodecError::InvalidSyntax(
            "message too short to contain an SK payload header".into(),
        ));
    }
    let header = decode_generic_header(&message[offset..])?;
    let generic_header_bytes = &message[offset..offset + hdr_len];
    let body_start = offset + hdr_len;
    let body_end = body_start + header.body_len;
    if body_end != message.len() {
        return Err(CodecError::InvalidSyntax(
            "SK payload length disagrees with message length".into(),
        ));
    }
    Ok((header.next_payload, generic_header_bytes, &message[body_start..body_end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::codec::payload::{NoncePayload, Payload};
    use crate::network::ike::crypto::rng::FixedRandomSource;

    fn sample_chain() -> PayloadChain {
        PayloadChain(vec![Payload::Nonce(NoncePayload(vec![0xAB; 16]))])
    }

    #[test]
    fn aes_gcm16_round_trips() {
        let sk_e = SecretBytes::new(vec![0x01; 16 + 4]); // key + 4-byte salt
        let sk_a = SecretBytes::new(vec![]);
        let header_bytes = [0u8; 28];
        let mut rng = FixedRandomSource::new(vec![0x42, 0x43, 0x44]);

        let encoded = encrypt(
            EncryptionAlgorithmId::AesGcm16,
            Some(128),
            IntegrityAlgorithmId::None,
            &sk_e,
            &sk_a,
            &header_bytes,
            &sample_chain(),
            &mut rng,
        )
        .unwrap();

        let generic_header = &encoded[..4];
        let body = &encoded[4..];
        let decoded = decrypt(
            EncryptionAlgorithmId::AesGcm16,
            Some(128),
            IntegrityAlgorithmId::None,
            &sk_e,
            &sk_a,
            &header_bytes,
            generic_header,
            PayloadType::Nonce,
            body,
        )
        .unwrap();
        assert_eq!(decoded, sample_chain());
    }

    #[test]
    fn aes_cbc_with_hmac_round_trips() {
        let sk_e = SecretBytes::new(vec![0x02; 16]);
        let sk_a = SecretBytes::new(vec![0x03; 20]);
        let header_bytes = [0u8; 28];
        let mut rng = FixedRandomSource::new(vec![0x55, 0x56, 0x57]);

        let encoded = encrypt(
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            IntegrityAlgorithmId::HmacSha1_96,
            &sk_e,
            &sk_a,
            &header_bytes,
            &sample_chain(),
            &mut rng,
        )
        .unwrap();

        let generic_header = &encoded[..4];
        let body = &encoded[4..];
        let decoded = decrypt(
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            IntegrityAlgorithmId::HmacSha1_96,
            &sk_e,
            &sk_a,
            &header_bytes,
            generic_header,
            PayloadType::Nonce,
            body,
        )
        .unwrap();
        assert_eq!(decoded, sample_chain());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let sk_e = SecretBytes::new(vec![0x02; 16]);
        let sk_a = SecretBytes::new(vec![0x03; 20]);
        let header_bytes = [0u8; 28];
        let mut rng = FixedRandomSource::new(vec![0x55, 0x56, 0x57]);

        let mut encoded = encrypt(
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            IntegrityAlgorithmId::HmacSha1_96,
            &sk_e,
            &sk_a,
            &header_bytes,
            &sample_chain(),
            &mut rng,
        )
        .unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        let generic_header = &encoded[..4];
        let body = &encoded[4..];
        let err = decrypt(
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            IntegrityAlgorithmId::HmacSha1_96,
            &sk_e,
            &sk_a,
            &header_bytes,
            generic_header,
            PayloadType::Nonce,
            body,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::Crypto(_)));
    }

    #[test]
    fn total_encoded_len_matches_actual_encoding() {
        let inner = sample_chain();
        let (_, inner_bytes) = inner.encode();
        let predicted =
            total_encoded_len(EncryptionAlgorithmId::AesGcm16, IntegrityAlgorithmId::None, inner_bytes.len());

        let sk_e = SecretBytes::new(vec![0x01; 20]);
        let sk_a = SecretBytes::new(vec![]);
        let header_bytes = [0u8; 28];
        let mut rng = FixedRandomSource::new(vec![0x09]);
        let encoded = encrypt(
            EncryptionAlgorithmId::AesGcm16,
            Some(128),
            IntegrityAlgorithmId::None,
            &sk_e,
            &sk_a,
            &header_bytes,
            &inner,
            &mut rng,
        )
        .unwrap();
        assert_eq!(encoded.len(), predicted);
    }
}
