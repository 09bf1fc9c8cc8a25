//! IKEv2 / EAP authentication core.
//!
//! This is the protocol engine that negotiates and maintains IPsec security
//! associations with a remote IKE peer: the IKE Session and Child Session
//! state machines, the EAP sub-state-machine that runs inside IKE_AUTH, the
//! SA keying record model, and the exchange pipeline that serializes,
//! encrypts, authenticates and retransmits IKE messages.
//!
//! The kernel IPsec transform installer, the raw UDP transport, cellular-SIM
//! access, and platform cipher providers are external collaborators reached
//! through the traits in [`contracts`].

pub mod child;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod crypto;
pub mod eap;
pub mod keys;
pub mod sa;
pub mod scheduler;
pub mod session;

use thiserror::Error;

/// IKEv2 version value (major 2, minor 0) as carried in the header.
pub const IKE_VERSION: u8 = 0x20;

/// Fixed length in octets of the IKE header (RFC 7296 §3.1).
pub const IKE_HEADER_LEN: usize = 28;

/// Fixed length in octets of a generic payload header (RFC 7296 §3.2).
pub const GENERIC_PAYLOAD_HEADER_LEN: usize = 4;

/// Prefix prepended to every IKE datagram sent over the NAT-T (port 4500)
/// encapsulation socket to distinguish it from ESP traffic.
pub const NON_ESP_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Errors produced by the IKE core, per spec §7.
///
/// Each variant is the direct analogue of one of the error kinds the spec
/// enumerates; conversions from the codec and crypto layers fold their
/// failure types into the matching variant here so callers only ever match
/// on one error enum.
#[derive(Debug, Error)]
pub enum IkeError {
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unsupported critical payload: type {0}")]
    UnsupportedCriticalPayload(u8),
    #[error("no proposal chosen")]
    NoProposalChosen,
    #[error("invalid key exchange data (expected DH group {expected}, got {got})")]
    InvalidKe { expected: u16, got: u16 },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("traffic selectors unacceptable")]
    TsUnacceptable,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("child SA not found for SPI {0:?}")]
    ChildSaNotFound(Vec<u8>),
    #[error("unexpected message id: expected {expected}, got {got}")]
    InvalidMessageId { expected: u32, got: u32 },
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("timeout")]
    Timeout,
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl IkeError {
    /// Maps this error to the RFC 7296 notify message type to carry in an
    /// error response, where one exists. Errors that never appear in an
    /// outbound notify (e.g. purely local faults) return `None`.
    pub fn to_notify_type(&self) -> Option<u16> {
        use crate::network::ike::codec::notify::error as nt;
        match self {
            IkeError::InvalidSyntax(_) => Some(nt::INVALID_SYNTAX),
            IkeError::UnsupportedCriticalPayload(_) => Some(nt::UNSUPPORTED_CRITICAL_PAYLOAD),
            IkeError::NoProposalChosen => Some(nt::NO_PROPOSAL_CHOSEN),
            IkeError::InvalidKe { .. } => Some(nt::INVALID_KE_PAYLOAD),
            IkeError::AuthenticationFailed => Some(nt::AUTHENTICATION_FAILED),
            IkeError::TsUnacceptable => Some(nt::TS_UNACCEPTABLE),
            IkeError::TemporaryFailure => Some(nt::TEMPORARY_FAILURE),
            IkeError::ChildSaNotFound(_) => Some(nt::CHILD_SA_NOT_FOUND),
            IkeError::InvalidMessageId { .. } => Some(nt::INVALID_MESSAGE_ID),
            _ => None,
        }
    }

    /// Whether this error is fatal to the owning IKE SA per spec §7.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IkeError::AuthenticationFailed
                | IkeError::InvalidSyntax(_)
                | IkeError::UnsupportedCriticalPayload(_)
                | IkeError::IntegrityCheckFailed
                | IkeError::Timeout
        )
    }
}

/// Classification of an inbound IKE request, used to route it to the IKE
/// Session or to the Child Session owning the referenced SPI (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeExchangeSubType {
    RekeyIke,
    DeleteIke,
    CreateChild,
    RekeyChild,
    DeleteChild,
    InformationalOther,
}
