//! IKE and Child SA key-material derivation (spec §4.3; RFC 7296 §2.14,
//! §2.17, §2.18).
//!
//! `SKEYSEED = PRF(Ni | Nr, g^ir)`, then `{SK_d, SK_ai, SK_ar, SK_ei, SK_er,
//! SK_pi, SK_pr} = PRF+(SKEYSEED, Ni | Nr | SPIi | SPIr)` split in that
//! order by the negotiated algorithms' key lengths. A rekeyed IKE SA folds
//! `g^ir(new)` (when PFS was negotiated) ahead of the fresh nonces and uses
//! the retiring SA's `SK_d` as the PRF key instead of fresh DH output
//! directly. Child SA keys follow the same `PRF+` shape over `SK_d`.

use super::crypto::prf::{prf, prf_plus};
use super::crypto::{CryptoError, EncryptionAlgorithmId, IntegrityAlgorithmId, PrfId, SecretBytes};

/// The seven key materials an IKE SA negotiation (or rekey) produces.
pub struct IkeKeys {
    pub sk_d: SecretBytes,
    pub sk_ai: SecretBytes,
    pub sk_ar: SecretBytes,
    pub sk_ei: SecretBytes,
    pub sk_er: SecretBytes,
    pub sk_pi: SecretBytes,
    pub sk_pr: SecretBytes,
}

/// The four key materials one Child SA's KEYMAT expands into.
pub struct ChildKeys {
    pub encr_i: SecretBytes,
    pub auth_i: SecretBytes,
    pub encr_r: SecretBytes,
    pub auth_r: SecretBytes,
}

/// Bytes of SK_ei/SK_er (or encr_i/encr_r) material one direction needs: the
/// raw cipher key, plus a 4-byte AEAD salt appended when the negotiated
/// cipher is AEAD (RFC 5282 §3.1 — this is what [`super::codec::encrypted`]
/// expects to find in the key it is handed).
fn encryption_key_material_len(
    encryption: EncryptionAlgorithmId,
    encryption_key_bits: Option<u16>,
) -> Result<usize, CryptoError> {
    let key_len = encryption
        .key_len(encryption_key_bits)
        .ok_or(CryptoError::UnsupportedAlgorithm)?;
    Ok(key_len + encryption.aead_salt_len())
}

/// Integrity key length for one direction; zero when the encryption
/// transform is AEAD, since AEAD ciphers carry their own integrity check and
/// no separate integrity transform is negotiated alongside them.
fn integrity_key_material_len(encryption: EncryptionAlgorithmId, integrity: IntegrityAlgorithmId) -> usize {
    if encryption.is_aead() {
        0
    } else {
        integrity.key_len()
    }
}

/// `SKEYSEED = PRF(Ni | Nr, g^ir)` for a fresh (non-rekey) IKE SA.
pub fn compute_skeyseed(prf_id: PrfId, ni: &[u8], nr: &[u8], shared_secret: &[u8]) -> Result<SecretBytes, CryptoError> {
    let mut key = Vec::with_capacity(ni.len() + nr.len());
    key.extend_from_slice(ni);
    key.extend_from_slice(nr);
    Ok(SecretBytes::new(prf(prf_id, &key, shared_secret)?))
}

/// `SKEYSEED = PRF(SK_d(old), [g^ir(new) |] Ni(new) | Nr(new))` for an IKE
/// SA rekey (RFC 7296 §2.18). `new_shared_secret` is `None` when the rekey
/// carries no PFS Diffie-Hellman transform.
pub fn compute_rekey_skeyseed(
    prf_id: PrfId,
    sk_d_old: &SecretBytes,
    new_shared_secret: Option<&[u8]>,
    ni_new: &[u8],
    nr_new: &[u8],
) -> Result<SecretBytes, CryptoError> {
    let mut data = Vec::new();
    if let Some(g) = new_shared_secret {
        data.extend_from_slice(g);
    }
    data.extend_from_slice(ni_new);
    data.extend_from_slice(nr_new);
    Ok(SecretBytes::new(prf(prf_id, sk_d_old.as_slice(), &data)?))
}

/// Expands `SKEYSEED` into the seven IKE SA key materials.
pub fn derive_ike_keys(
    prf_id: PrfId,
    integrity: IntegrityAlgorithmId,
    encryption: EncryptionAlgorithmId,
    encryption_key_bits: Option<u16>,
    skeyseed: &SecretBytes,
    ni: &[u8],
    nr: &[u8],
    spi_i: u64,
    spi_r: u64,
) -> Result<IkeKeys, CryptoError> {
    let sk_d_len = prf_id.output_len();
    let sk_a_len = integrity_key_material_len(encryption, integrity);
    let sk_e_len = encryption_key_material_len(encryption, encryption_key_bits)?;
    let sk_p_len = prf_id.output_len();

    let mut seed = Vec::with_capacity(ni.len() + nr.len() + 16);
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);
    seed.extend_from_slice(&spi_i.to_be_bytes());
    seed.extend_from_slice(&spi_r.to_be_bytes());

    let total = sk_d_len + 2 * sk_a_len + 2 * sk_e_len + 2 * sk_p_len;
    let stream = prf_plus(prf_id, skeyseed.as_slice(), &seed, total)?;

    let mut cursor = 0;
    let mut take = |len: usize| {
        let chunk = stream[cursor..cursor + len].to_vec();
        cursor += len;
        SecretBytes::new(chunk)
    };

    Ok(IkeKeys {
        sk_d: take(sk_d_len),
        sk_ai: take(sk_a_len),
        sk_ar: take(sk_a_len),
        sk_ei: take(sk_e_len),
        sk_er: take(sk_e_len),
        sk_pi: take(sk_p_len),
        sk_pr: take(sk_p_len),
    })
}

/// Derives a Child SA's KEYMAT: `PRF+(SK_d, [g^ir(new) |] Ni | Nr)` split as
/// `{encr_i, auth_i, encr_r, auth_r}` (spec §4.3; RFC 7296 §2.17).
pub fn derive_child_keys(
    prf_id: PrfId,
    integrity: IntegrityAlgorithmId,
    encryption: EncryptionAlgorithmId,
    encryption_key_bits: Option<u16>,
    sk_d: &SecretBytes,
    new_shared_secret: Option<&[u8]>,
    ni: &[u8],
    nr: &[u8],
) -> Result<ChildKeys, CryptoError> {
    let encr_len = encryption_key_material_len(encryption, encryption_key_bits)?;
    let auth_len = integrity_key_material_len(encryption, integrity);

    let mut seed = Vec::new();
    if let Some(g) = new_shared_secret {
        seed.extend_from_slice(g);
    }
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);

    let total = 2 * encr_len + 2 * auth_len;
    let stream = prf_plus(prf_id, sk_d.as_slice(), &seed, total)?;

    let mut cursor = 0;
    let mut take = |len: usize| {
        let chunk = stream[cursor..cursor + len].to_vec();
        cursor += len;
        SecretBytes::new(chunk)
    };

    Ok(ChildKeys {
        encr_i: take(encr_len),
        auth_i: take(auth_len),
        encr_r: take(encr_len),
        auth_r: take(auth_len),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ike_keys(ni: &[u8], nr: &[u8], shared: &[u8]) -> IkeKeys {
        let skeyseed = compute_skeyseed(PrfId::HmacSha1, ni, nr, shared).unwrap();
        derive_ike_keys(
            PrfId::HmacSha1,
            IntegrityAlgorithmId::HmacSha1_96,
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            &skeyseed,
            ni,
            nr,
            0x5F54BF6D8B48E6E1,
            0x0000000000000000,
        )
        .unwrap()
    }

    #[test]
    fn ike_key_lengths_match_negotiated_algorithms() {
        let keys = sample_ike_keys(b"initiator-nonce-material", b"responder-nonce-material", b"shared-dh-secret");
        assert_eq!(keys.sk_d.len(), 20); // HMAC-SHA1 PRF output length
        assert_eq!(keys.sk_ai.len(), 20); // HMAC-SHA1-96 key length
        assert_eq!(keys.sk_ar.len(), 20);
        assert_eq!(keys.sk_ei.len(), 16); // AES-128 key, no AEAD salt
        assert_eq!(keys.sk_er.len(), 16);
        assert_eq!(keys.sk_pi.len(), 20);
        assert_eq!(keys.sk_pr.len(), 20);
    }

    #[test]
    fn ike_key_derivation_is_deterministic() {
        let a = sample_ike_keys(b"nonce-i", b"nonce-r", b"secret");
        let b = sample_ike_keys(b"nonce-i", b"nonce-r", b"secret");
        assert_eq!(a.sk_d.as_slice(), b.sk_d.as_slice());
        assert_eq!(a.sk_ei.as_slice(), b.sk_ei.as_slice());
    }

    #[test]
    fn different_nonces_produce_different_keys() {
        let a = sample_ike_keys(b"nonce-i-one", b"nonce-r-one", b"secret");
        let b = sample_ike_keys(b"nonce-i-two", b"nonce-r-two", b"secret");
        assert_ne!(a.sk_d.as_slice(), b.sk_d.as_slice());
    }

    #[test]
    fn aead_encryption_yields_zero_length_integrity_keys_and_salted_encr_keys() {
        let skeyseed = compute_skeyseed(PrfId::HmacSha1, b"ni", b"nr", b"secret").unwrap();
        let keys = derive_ike_keys(
            PrfId::HmacSha1,
            IntegrityAlgorithmId::None,
            EncryptionAlgorithmId::AesGcm16,
            Some(128),
            &skeyseed,
            b"ni",
            b"nr",
            1,
            2,
        )
        .unwrap();
        assert_eq!(keys.sk_ai.len(), 0);
        assert_eq!(keys.sk_ar.len(), 0);
        assert_eq!(keys.sk_ei.len(), 16 + 4); // AES-128 key + 4-byte AEAD salt
    }

    #[test]
    fn child_keymat_splits_in_encr_auth_order_per_direction() {
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let child = derive_child_keys(
            PrfId::HmacSha1,
            IntegrityAlgorithmId::HmacSha1_96,
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            &sk_d,
            None,
            b"ni",
            b"nr",
        )
        .unwrap();
        assert_eq!(child.encr_i.len(), 16);
        assert_eq!(child.auth_i.len(), 20);
        assert_eq!(child.encr_r.len(), 16);
        assert_eq!(child.auth_r.len(), 20);
    }

    #[test]
    fn child_keymat_with_pfs_differs_from_without() {
        let sk_d = SecretBytes::new(vec![0xCD; 20]);
        let without_pfs = derive_child_keys(
            PrfId::HmacSha1,
            IntegrityAlgorithmId::HmacSha1_96,
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            &sk_d,
            None,
            b"ni",
            b"nr",
        )
        .unwrap();
        let with_pfs = derive_child_keys(
            PrfId::HmacSha1,
            IntegrityAlgorithmId::HmacSha1_96,
            EncryptionAlgorithmId::AesCbc,
            Some(128),
            &sk_d,
            Some(b"fresh-dh-output"),
            b"ni",
            b"nr",
        )
        .unwrap();
        assert_ne!(without_pfs.encr_i.as_slice(), with_pfs.encr_i.as_slice());
    }

    #[test]
    fn rekey_skeyseed_depends_on_old_sk_d() {
        let sk_d_a = SecretBytes::new(vec![0x01; 20]);
        let sk_d_b = SecretBytes::new(vec![0x02; 20]);
        let a = compute_rekey_skeyseed(PrfId::HmacSha1, &sk_d_a, Some(b"g_new"), b"ni", b"nr").unwrap();
        let b = compute_rekey_skeyseed(PrfId::HmacSha1, &sk_d_b, Some(b"g_new"), b"ni", b"nr").unwrap();
        assert_ne!(a.as_slice(), b.as_slice());
    }
}
