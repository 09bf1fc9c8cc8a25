//! Algorithm identifiers, per the IANA IKEv2 transform-type registries
//! (RFC 7296 §3.3.2). Each enum's discriminant is the registry's transform
//! ID, so encoding a negotiated transform is a plain `as u16`/`as u8` cast.

/// Transform Type 1 — Encryption Algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncryptionAlgorithmId {
    TripleDesCbc = 3,
    AesCbc = 12,
    AesGcm8 = 18,
    AesGcm12 = 19,
    AesGcm16 = 20,
}

impl EncryptionAlgorithmId {
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            3 => Some(Self::TripleDesCbc),
            12 => Some(Self::AesCbc),
            18 => Some(Self::AesGcm8),
            19 => Some(Self::AesGcm12),
            20 => Some(Self::AesGcm16),
            _ => None,
        }
    }

    pub fn transform_id(self) -> u16 {
        self as u16
    }

    /// Whether this algorithm is an AEAD cipher (carries its own integrity
    /// check, so the proposal's separate integrity transform must be NONE).
    pub fn is_aead(self) -> bool {
        matches!(self, Self::AesGcm8 | Self::AesGcm12 | Self::AesGcm16)
    }

    /// Cipher block size in bytes, used for SK payload padding (spec §4.2).
    pub fn block_size(self) -> usize {
        match self {
            Self::TripleDesCbc => 8,
            Self::AesCbc | Self::AesGcm8 | Self::AesGcm12 | Self::AesGcm16 => 16,
        }
    }

    /// Required key length in bytes. 3DES has a fixed key size; the AES
    /// variants carry an explicit Key Length transform attribute (RFC 7296
    /// §3.3.5) in 128/192/256-bit steps, so the negotiated attribute value
    /// must be supplied for them.
    pub fn key_len(self, key_length_bits: Option<u16>) -> Option<usize> {
        match self {
            Self::TripleDesCbc => Some(24),
            Self::AesCbc | Self::AesGcm8 | Self::AesGcm12 | Self::AesGcm16 => {
                match key_length_bits {
                    Some(128) => Some(16),
                    Some(192) => Some(24),
                    Some(256) => Some(32),
                    _ => None,
                }
            }
        }
    }

    /// ICV (integrity check value) length appended by an AEAD cipher; zero
    /// for non-AEAD ciphers, which rely on the separate integrity transform.
    pub fn aead_icv_len(self) -> usize {
        match self {
            Self::AesGcm8 => 8,
            Self::AesGcm12 => 12,
            Self::AesGcm16 => 16,
            Self::TripleDesCbc | Self::AesCbc => 0,
        }
    }

    /// Salt length prepended to the IV for AEAD ciphers per RFC 5282/7296.
    pub fn aead_salt_len(self) -> usize {
        if self.is_aead() {
            4
        } else {
            0
        }
    }

    pub fn iv_len(self) -> usize {
        if self.is_aead() {
            8
        } else {
            self.block_size()
        }
    }
}

/// Transform Type 3 — Integrity Algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IntegrityAlgorithmId {
    None = 0,
    HmacSha1_96 = 2,
    AesXcbc96 = 5,
    HmacSha2_256_128 = 12,
    HmacSha2_384_192 = 13,
    HmacSha2_512_256 = 14,
}

impl IntegrityAlgorithmId {
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            2 => Some(Self::HmacSha1_96),
            5 => Some(Self::AesXcbc96),
            12 => Some(Self::HmacSha2_256_128),
            13 => Some(Self::HmacSha2_384_192),
            14 => Some(Self::HmacSha2_512_256),
            _ => None,
        }
    }

    pub fn transform_id(self) -> u16 {
        self as u16
    }

    /// Truncated MAC (ICV) length in bytes.
    pub fn icv_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1_96 | Self::AesXcbc96 => 12,
            Self::HmacSha2_256_128 => 16,
            Self::HmacSha2_384_192 => 24,
            Self::HmacSha2_512_256 => 32,
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1_96 => 20,
            Self::AesXcbc96 => 16,
            Self::HmacSha2_256_128 => 32,
            Self::HmacSha2_384_192 => 48,
            Self::HmacSha2_512_256 => 64,
        }
    }
}

/// Transform Type 2 — Pseudo-Random Function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PrfId {
    HmacSha1 = 2,
    Aes128Xcbc = 4,
}

impl PrfId {
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            2 => Some(Self::HmacSha1),
            4 => Some(Self::Aes128Xcbc),
            _ => None,
        }
    }

    pub fn transform_id(self) -> u16 {
        self as u16
    }

    /// Output length of one PRF application, in bytes — this is also the
    /// `Ti` block size `PRF+` expands in (spec §4.1).
    pub fn output_len(self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::Aes128Xcbc => 16,
        }
    }
}

/// Transform Type 4 — Diffie-Hellman Group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DhGroupId {
    None = 0,
    Modp1024 = 2,
    Modp2048 = 14,
}

impl DhGroupId {
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            2 => Some(Self::Modp1024),
            14 => Some(Self::Modp2048),
            _ => None,
        }
    }

    pub fn transform_id(self) -> u16 {
        self as u16
    }

    /// Size in bytes of the public value / key-exchange data for this group.
    pub fn public_value_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Modp1024 => 128,
            Self::Modp2048 => 256,
        }
    }
}
