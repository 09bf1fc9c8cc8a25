//! Bit-exact parse/encode of the IKE header, every payload type this core
//! supports, and the encrypted-payload envelope (spec §4.2).

pub mod encrypted;
pub mod header;
pub mod payload;

pub use encrypted::{split_sk_payload, total_encoded_len as encrypted_payload_len};
pub use header::{ExchangeType, IkeHeader};
pub use payload::{
    AuthPayload, DeletePayload, IdPayload, KeyExchangePayload, NoncePayload, NotifyPayload, Payload,
    PayloadChain, Proposal, SaPayload, Transform, TransformAttribute, TrafficSelector, TransformKind,
    TsPayload,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unsupported critical payload: type {0}")]
    UnsupportedCritical(u8),
    #[error("crypto failure decoding/encoding encrypted payload: {0}")]
    Crypto(#[from] crate::network::ike::crypto::CryptoError),
}

/// Payload Type field values (RFC 7296 §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    NoNextPayload,
    SecurityAssociation,
    KeyExchange,
    IdentificationInitiator,
    IdentificationResponder,
    Certificate,
    CertificateRequest,
    Authentication,
    Nonce,
    Notify,
    Delete,
    VendorId,
    TrafficSelectorInitiator,
    TrafficSelectorResponder,
    Encrypted,
    Configuration,
    Eap,
    Unknown(u8),
}

impl PayloadType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NoNextPayload,
            33 => Self::SecurityAssociation,
            34 => Self::KeyExchange,
            35 => Self::IdentificationInitiator,
            36 => Self::IdentificationResponder,
            37 => Self::Certificate,
            38 => Self::CertificateRequest,
            39 => Self::Authentication,
            40 => Self::Nonce,
            41 => Self::Notify,
            42 => Self::Delete,
            43 => Self::VendorId,
            44 => Self::TrafficSelectorInitiator,
            45 => Self::TrafficSelectorResponder,
            46 => Self::Encrypted,
            47 => Self::Configuration,
            48 => Self::Eap,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::NoNextPayload => 0,
            Self::SecurityAssociation => 33,
            Self::KeyExchange => 34,
            Self::IdentificationInitiator => 35,
            Self::IdentificationResponder => 36,
            Self::Certificate => 37,
            Self::CertificateRequest => 38,
            Self::Authentication => 39,
            Self::Nonce => 40,
            Self::Notify => 41,
            Self::Delete => 42,
            Self::VendorId => 43,
            Self::TrafficSelectorInitiator => 44,
            Self::TrafficSelectorResponder => 45,
            Self::Encrypted => 46,
            Self::Configuration => 47,
            Self::Eap => 48,
            Self::Unknown(v) => v,
        }
    }
}

/// RFC 7296 §3.10.1 Notify Message Types this core produces or consumes.
pub mod notify {
    pub mod error {
        pub const UNSUPPORTED_CRITICAL_PAYLOAD: u16 = 1;
        pub const INVALID_SYNTAX: u16 = 7;
        pub const INVALID_KE_PAYLOAD: u16 = 17;
        pub const AUTHENTICATION_FAILED: u16 = 24;
        pub const NO_PROPOSAL_CHOSEN: u16 = 14;
        pub const TS_UNACCEPTABLE: u16 = 11;
        pub const TEMPORARY_FAILURE: u16 = 43;
        pub const CHILD_SA_NOT_FOUND: u16 = 44;
        pub const INVALID_MESSAGE_ID: u16 = 9;
    }

    pub mod status {
        pub const USE_TRANSPORT_MODE: u16 = 16391;
        pub const REKEY_SA: u16 = 16393;
        pub const ESP_TFC_PADDING_NOT_SUPPORTED: u16 = 16394;
        pub const NAT_DETECTION_SOURCE_IP: u16 = 16406;
        pub const NAT_DETECTION_DESTINATION_IP: u16 = 16407;
    }
}
