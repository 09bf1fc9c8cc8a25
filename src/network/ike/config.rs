//! Session configuration consumed at IKE Session creation (spec §6):
//! endpoints, proposals, EAP method selection, traffic selectors, SA
//! lifetimes, and the transport-vs-tunnel flag. This is not sourced from a
//! TOML/env layer — it is built in-process by the embedding application and
//! handed to the session directly, so it carries no `serde`/`config`
//! dependency of its own.

use std::net::SocketAddr;
use std::time::Duration;

use super::codec::{Proposal, TrafficSelector};
use super::IkeError;

/// Hard/soft lifetime bounds validated at config construction (spec §4.6).
pub const MIN_HARD_LIFETIME_SECS: u64 = 300;
pub const MAX_HARD_LIFETIME_SECS: u64 = 14_400;
pub const MIN_SOFT_LIFETIME_SECS: u64 = 120;
pub const SOFT_HARD_MARGIN_SECS: u64 = 60;

pub const DEFAULT_SOFT_LIFETIME_SECS: u64 = 3_600;
pub const DEFAULT_HARD_LIFETIME_SECS: u64 = 7_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaLifetime {
    pub soft_secs: u64,
    pub hard_secs: u64,
}

impl Default for SaLifetime {
    fn default() -> Self {
        SaLifetime {
            soft_secs: DEFAULT_SOFT_LIFETIME_SECS,
            hard_secs: DEFAULT_HARD_LIFETIME_SECS,
        }
    }
}

impl SaLifetime {
    pub fn validate(self) -> Result<Self, IkeError> {
        if !(MIN_HARD_LIFETIME_SECS..=MAX_HARD_LIFETIME_SECS).contains(&self.hard_secs) {
            return Err(IkeError::InternalError(format!(
                "hard lifetime {} outside [{}, {}]",
                self.hard_secs, MIN_HARD_LIFETIME_SECS, MAX_HARD_LIFETIME_SECS
            )));
        }
        if self.soft_secs < MIN_SOFT_LIFETIME_SECS {
            return Err(IkeError::InternalError(format!(
                "soft lifetime {} below minimum {}",
                self.soft_secs, MIN_SOFT_LIFETIME_SECS
            )));
        }
        if self.soft_secs > self.hard_secs.saturating_sub(SOFT_HARD_MARGIN_SECS) {
            return Err(IkeError::InternalError(format!(
                "soft lifetime {} must be at least {} below hard lifetime {}",
                self.soft_secs, SOFT_HARD_MARGIN_SECS, self.hard_secs
            )));
        }
        Ok(self)
    }
}

/// EAP method selection presented in the `Identity` state's NAK list
/// (spec §4.5). Only one method may be configured — the peer either accepts
/// it or the exchange fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapMethod {
    Sim,
    Aka,
    AkaPrime,
}

impl EapMethod {
    pub fn eap_type(self) -> u8 {
        match self {
            EapMethod::Sim => 18,
            EapMethod::Aka => 23,
            EapMethod::AkaPrime => 50,
        }
    }
}

/// The ESP transforms this side offers for a Child SA, independent of the
/// IKE SA's own negotiated transforms (spec §4.1: the registries are shared,
/// but IKE and ESP proposals are negotiated separately).
#[derive(Debug, Clone, Copy)]
pub struct ChildProposalParams {
    pub encryption: super::crypto::EncryptionAlgorithmId,
    pub encryption_key_bits: Option<u16>,
    pub integrity: super::crypto::IntegrityAlgorithmId,
    /// `None` means no PFS DH transform is offered for Child SA rekeys.
    pub dh_group: Option<super::crypto::DhGroupId>,
}

impl Default for ChildProposalParams {
    fn default() -> Self {
        ChildProposalParams {
            encryption: super::crypto::EncryptionAlgorithmId::AesGcm16,
            encryption_key_bits: Some(256),
            integrity: super::crypto::IntegrityAlgorithmId::None,
            dh_group: None,
        }
    }
}

#[derive(Clone)]
pub struct ChildSessionConfig {
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub is_transport: bool,
    pub lifetime: SaLifetime,
    pub proposal: ChildProposalParams,
}

impl Default for ChildSessionConfig {
    fn default() -> Self {
        ChildSessionConfig {
            local_ts: vec![TrafficSelector::all_ipv4()],
            remote_ts: vec![TrafficSelector::all_ipv4()],
            is_transport: false,
            lifetime: SaLifetime::default(),
            proposal: ChildProposalParams::default(),
        }
    }
}

#[derive(Clone)]
pub struct IkeSessionConfig {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub ike_proposals: Vec<Proposal>,
    pub eap_method: EapMethod,
    pub default_child: ChildSessionConfig,
    /// Soft/hard lifetime for the IKE SA itself, independent of any Child
    /// SA's own lifetime (spec §4.4 Rekey-IKE).
    pub ike_lifetime: SaLifetime,
    pub retransmit_base: Duration,
    pub retransmit_multiplier: u32,
    pub retransmit_max_attempts: u32,
    pub eap_step_timeout: Duration,
    pub rekey_remote_delete_watchdog: Duration,
}

impl IkeSessionConfig {
    pub fn validate(&self) -> Result<(), IkeError> {
        if self.ike_proposals.is_empty() {
            return Err(IkeError::InternalError("at least one IKE proposal is required".into()));
        }
        self.default_child.lifetime.validate()?;
        self.ike_lifetime.validate()?;
        Ok(())
    }
}

/// Defaults matching spec §4.4/§5's named timing constants: ~500 ms base
/// backoff doubling to a cap of 8 attempts, a ~30 s aggregate retransmission
/// window, a 250 ms EAP step bound, and a ~180 s rekey-remote-delete
/// watchdog.
impl IkeSessionConfig {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, ike_proposals: Vec<Proposal>) -> Self {
        IkeSessionConfig {
            local_addr,
            remote_addr,
            ike_proposals,
            eap_method: EapMethod::Aka,
            default_child: ChildSessionConfig::default(),
            ike_lifetime: SaLifetime::default(),
            retransmit_base: Duration::from_millis(500),
            retransmit_multiplier: 2,
            retransmit_max_attempts: 8,
            eap_step_timeout: Duration::from_millis(250),
            rekey_remote_delete_watchdog: Duration::from_secs(180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lifetime_validates() {
        assert!(SaLifetime::default().validate().is_ok());
    }

    #[test]
    fn hard_lifetime_out_of_range_rejected() {
        let lt = SaLifetime {
            soft_secs: 200,
            hard_secs: 100,
        };
        assert!(lt.validate().is_err());
        let lt = SaLifetime {
            soft_secs: 200,
            hard_secs: 20_000,
        };
        assert!(lt.validate().is_err());
    }

    #[test]
    fn soft_lifetime_below_minimum_rejected() {
        let lt = SaLifetime {
            soft_secs: 60,
            hard_secs: 7200,
        };
        assert!(lt.validate().is_err());
    }

    #[test]
    fn soft_lifetime_too_close_to_hard_rejected() {
        let lt = SaLifetime {
            soft_secs: 7180,
            hard_secs: 7200,
        };
        assert!(lt.validate().is_err());
        let lt = SaLifetime {
            soft_secs: 7140,
            hard_secs: 7200,
        };
        assert!(lt.validate().is_ok());
    }
}
