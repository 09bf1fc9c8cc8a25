//! EAP sub-state-machine run inside IKE_AUTH (spec §4.5): `Created` →
//! `Identity` → `Method` (SIM/AKA/AKA') → `Success`/`Failure`. Consumes raw
//! [`EapPacket`]s and produces a response packet, a key-bearing success, a
//! failure, or an error — never touches the network or the IKE SA directly.

pub mod packet;

use thiserror::Error;

use crate::network::ike::config::EapMethod;
use crate::network::ike::contracts::SimAuthProvider;
use crate::network::ike::crypto::prf::prf_plus;
use crate::network::ike::crypto::{PrfId, SecretBytes};

pub use packet::{EapCode, EapPacket, EapPacketError};
use packet::{EAP_TYPE_AKA, EAP_TYPE_AKA_PRIME, EAP_TYPE_IDENTITY, EAP_TYPE_LEGACY_NAK, EAP_TYPE_NOTIFICATION, EAP_TYPE_SIM};

#[derive(Debug, Error)]
pub enum EapError {
    #[error("invalid EAP request for current state")]
    InvalidRequest,
    #[error("Success/Failure received before the method produced key material")]
    UnexpectedSuccessOrFailure,
    #[error("SIM/AKA provider failure: {0}")]
    SimProvider(String),
    #[error("malformed EAP packet: {0}")]
    Packet(#[from] EapPacketError),
}

/// The single EAP method this session is configured to accept (spec §4.5:
/// "At most one method is active").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapMethodKind {
    Sim,
    Aka,
    AkaPrime,
}

impl EapMethodKind {
    pub fn from_config(method: EapMethod) -> Self {
        match method {
            EapMethod::Sim => EapMethodKind::Sim,
            EapMethod::Aka => EapMethodKind::Aka,
            EapMethod::AkaPrime => EapMethodKind::AkaPrime,
        }
    }

    pub fn from_eap_type(t: u8) -> Option<Self> {
        match t {
            EAP_TYPE_SIM => Some(EapMethodKind::Sim),
            EAP_TYPE_AKA => Some(EapMethodKind::Aka),
            EAP_TYPE_AKA_PRIME => Some(EapMethodKind::AkaPrime),
            _ => None,
        }
    }

    pub fn eap_type(self) -> u8 {
        match self {
            EapMethodKind::Sim => EAP_TYPE_SIM,
            EapMethodKind::Aka => EAP_TYPE_AKA,
            EapMethodKind::AkaPrime => EAP_TYPE_AKA_PRIME,
        }
    }

    /// `app_type` passed to [`SimAuthProvider`] to distinguish the SIM/USIM
    /// application the challenge is computed against.
    fn app_type(self) -> u8 {
        match self {
            EapMethodKind::Sim => 1,
            EapMethodKind::Aka => 2,
            EapMethodKind::AkaPrime => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodSubState {
    AwaitingChallenge,
    AwaitingSuccessOrFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EapState {
    Created,
    Identity,
    Method(EapMethodKind, MethodSubState),
    Success,
    Failure,
}

/// Output of one packet handed to [`EapSession::handle_packet`] (spec §4.5).
pub enum EapOutcome {
    Respond(EapPacket),
    Success { msk: SecretBytes, emsk: SecretBytes },
    Failure,
}

/// Created when IKE_AUTH requires EAP; destroyed once `Success` produces
/// MSK/EMSK or `Failure` is received (spec §3 EAP Session State lifecycle).
pub struct EapSession {
    state: EapState,
    identity: Vec<u8>,
    configured_method: EapMethodKind,
    method_response_data: Option<Vec<u8>>,
}

impl EapSession {
    pub fn new(configured_method: EapMethod) -> Self {
        EapSession {
            state: EapState::Created,
            identity: Vec::new(),
            configured_method: EapMethodKind::from_config(configured_method),
            method_response_data: None,
        }
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    fn nak_response(&self, identifier: u8) -> EapPacket {
        EapPacket::response(identifier, EAP_TYPE_LEGACY_NAK, vec![self.configured_method.eap_type()])
    }

    fn notification_response(packet: &EapPacket) -> EapPacket {
        EapPacket::response(packet.identifier, EAP_TYPE_NOTIFICATION, packet.type_data.clone())
    }

    /// Consumes one inbound EAP packet, advancing the state machine and
    /// producing the next action (spec §4.5).
    pub async fn handle_packet(
        &mut self,
        packet: &EapPacket,
        sim: &dyn SimAuthProvider,
    ) -> Result<EapOutcome, EapError> {
        // Notification is answered identically from any state and never
        // transitions (spec §4.5: "at any state").
        if packet.code == EapCode::Request && packet.type_field == Some(EAP_TYPE_NOTIFICATION) {
            return Ok(EapOutcome::Respond(Self::notification_response(packet)));
        }

        match self.state {
            EapState::Created => self.handle_created(packet, sim).await,
            EapState::Identity => self.handle_identity(packet, sim).await,
            EapState::Method(kind, sub) => self.handle_method(kind, sub, packet, sim).await,
            EapState::Success | EapState::Failure => Err(EapError::InvalidRequest),
        }
    }

    async fn handle_created(&mut self, packet: &EapPacket, sim: &dyn SimAuthProvider) -> Result<EapOutcome, EapError> {
        if packet.code != EapCode::Request {
            return Err(EapError::InvalidRequest);
        }
        match packet.type_field {
            Some(EAP_TYPE_IDENTITY) => {
                self.identity = packet.type_data.clone();
                self.state = EapState::Identity;
                Ok(EapOutcome::Respond(EapPacket::response(
                    packet.identifier,
                    EAP_TYPE_IDENTITY,
                    self.identity.clone(),
                )))
            }
            Some(t) if EapMethodKind::from_eap_type(t) == Some(self.configured_method) => {
                self.state = EapState::Method(self.configured_method, MethodSubState::AwaitingChallenge);
                self.handle_challenge(self.configured_method, packet, sim).await
            }
            _ => Err(EapError::InvalidRequest),
        }
    }

    async fn handle_identity(&mut self, packet: &EapPacket, sim: &dyn SimAuthProvider) -> Result<EapOutcome, EapError> {
        if packet.code != EapCode::Request {
            return Err(EapError::InvalidRequest);
        }
        match packet.type_field {
            Some(t) if EapMethodKind::from_eap_type(t) == Some(self.configured_method) => {
                self.state = EapState::Method(self.configured_method, MethodSubState::AwaitingChallenge);
                self.handle_challenge(self.configured_method, packet, sim).await
            }
            _ => Ok(EapOutcome::Respond(self.nak_response(packet.identifier))),
        }
    }

    async fn handle_method(
        &mut self,
        kind: EapMethodKind,
        sub: MethodSubState,
        packet: &EapPacket,
        sim: &dyn SimAuthProvider,
    ) -> Result<EapOutcome, EapError> {
        match packet.code {
            EapCode::Request => {
                if packet.type_field != Some(kind.eap_type()) {
                    // Peer switched methods mid-exchange: NAK, no transition
                    // (spec §4.5: "if the peer later sends a different
                    // method type, a NAK is returned").
                    return Ok(EapOutcome::Respond(self.nak_response(packet.identifier)));
                }
                match sub {
                    MethodSubState::AwaitingChallenge => self.handle_challenge(kind, packet, sim).await,
                    MethodSubState::AwaitingSuccessOrFailure => {
                        // Re-Auth request after key material was already
                        // produced; answer with the same challenge flow.
                        self.handle_challenge(kind, packet, sim).await
                    }
                }
            }
            EapCode::Success => {
                if sub != MethodSubState::AwaitingSuccessOrFailure {
                    return Err(EapError::UnexpectedSuccessOrFailure);
                }
                let (msk, emsk) = self.derive_method_keys(kind, packet)?;
                self.state = EapState::Success;
                Ok(EapOutcome::Success { msk, emsk })
            }
            EapCode::Failure => {
                self.state = EapState::Failure;
                Ok(EapOutcome::Failure)
            }
            EapCode::Response => Err(EapError::InvalidRequest),
        }
    }

    async fn handle_challenge(
        &mut self,
        kind: EapMethodKind,
        packet: &EapPacket,
        sim: &dyn SimAuthProvider,
    ) -> Result<EapOutcome, EapError> {
        let response_data = sim
            .compute_auts_or_kc(kind.app_type(), &packet.type_data)
            .await
            .map_err(|e| EapError::SimProvider(e.to_string()))?;
        self.method_response_data = Some(response_data.clone());
        self.state = EapState::Method(kind, MethodSubState::AwaitingSuccessOrFailure);
        Ok(EapOutcome::Respond(EapPacket::response(packet.identifier, kind.eap_type(), response_data)))
    }

    /// Expands the method's challenge response into MSK/EMSK via `PRF+`
    /// (RFC 4186/4187/5448 each define their own KDF over the same shape:
    /// identity, challenge material, and the computed response; `PRF+`
    /// keyed on the response is used here as the one expander this core
    /// already implements for §4.3, rather than hand-rolling each method's
    /// distinct PRF').
    fn derive_method_keys(&self, _kind: EapMethodKind, _packet: &EapPacket) -> Result<(SecretBytes, SecretBytes), EapError> {
        let response_data = self
            .method_response_data
            .as_ref()
            .ok_or(EapError::UnexpectedSuccessOrFailure)?;
        let mut seed = Vec::with_capacity(self.identity.len() + response_data.len());
        seed.extend_from_slice(&self.identity);
        seed.extend_from_slice(response_data);
        let keymat = prf_plus(PrfId::HmacSha1, response_data, &seed, 128)
            .map_err(|e| EapError::SimProvider(e.to_string()))?;
        let msk = SecretBytes::new(keymat[..64].to_vec());
        let emsk = SecretBytes::new(keymat[64..128].to_vec());
        Ok((msk, emsk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::network::ike::IkeError;

    struct MockSim;

    #[async_trait]
    impl SimAuthProvider for MockSim {
        async fn identity(&self, _app_type: u8) -> Result<Vec<u8>, IkeError> {
            Ok(b"mock-identity".to_vec())
        }

        async fn compute_auts_or_kc(&self, _app_type: u8, challenge: &[u8]) -> Result<Vec<u8>, IkeError> {
            Ok(challenge.iter().map(|b| b.wrapping_add(1)).collect())
        }
    }

    #[tokio::test]
    async fn created_to_identity_on_request_identity() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let req = EapPacket::request(1, EAP_TYPE_IDENTITY, b"peer-id".to_vec());
        let outcome = eap.handle_packet(&req, &MockSim).await.unwrap();
        assert!(matches!(eap.state, EapState::Identity));
        match outcome {
            EapOutcome::Respond(resp) => {
                assert_eq!(resp.code, EapCode::Response);
                assert_eq!(resp.type_field, Some(EAP_TYPE_IDENTITY));
            }
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn request_notification_echoed_without_transition() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let req = EapPacket::request(2, EAP_TYPE_NOTIFICATION, b"hello".to_vec());
        let outcome = eap.handle_packet(&req, &MockSim).await.unwrap();
        assert!(matches!(eap.state, EapState::Created));
        match outcome {
            EapOutcome::Respond(resp) => {
                assert_eq!(resp.code, EapCode::Response);
                assert_eq!(resp.type_field, Some(EAP_TYPE_NOTIFICATION));
            }
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn request_nak_in_created_is_invalid() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let req = EapPacket::request(3, EAP_TYPE_LEGACY_NAK, vec![]);
        let err = eap.handle_packet(&req, &MockSim).await.unwrap_err();
        assert!(matches!(err, EapError::InvalidRequest));
    }

    #[tokio::test]
    async fn response_notification_is_invalid() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let resp = EapPacket::response(4, EAP_TYPE_NOTIFICATION, vec![]);
        let err = eap.handle_packet(&resp, &MockSim).await.unwrap_err();
        assert!(matches!(err, EapError::InvalidRequest));
    }

    #[tokio::test]
    async fn identity_state_naks_unsupported_method() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let id_req = EapPacket::request(1, EAP_TYPE_IDENTITY, b"id".to_vec());
        eap.handle_packet(&id_req, &MockSim).await.unwrap();

        let sim_req = EapPacket::request(2, EAP_TYPE_SIM, vec![1, 2, 3]);
        let outcome = eap.handle_packet(&sim_req, &MockSim).await.unwrap();
        assert!(matches!(eap.state, EapState::Identity));
        match outcome {
            EapOutcome::Respond(resp) => {
                assert_eq!(resp.type_field, Some(EAP_TYPE_LEGACY_NAK));
                assert_eq!(resp.type_data, vec![EAP_TYPE_AKA]);
            }
            _ => panic!("expected a NAK response"),
        }
    }

    #[tokio::test]
    async fn full_method_flow_produces_keys() {
        let mut eap = EapSession::new(EapMethod::Aka);
        let id_req = EapPacket::request(1, EAP_TYPE_IDENTITY, b"id".to_vec());
        eap.handle_packet(&id_req, &MockSim).await.unwrap();

        let challenge = EapPacket::request(2, EAP_TYPE_AKA, vec![9, 9, 9]);
        let outcome = eap.handle_packet(&challenge, &MockSim).await.unwrap();
        assert!(matches!(outcome, EapOutcome::Respond(_)));
        assert!(matches!(eap.state, EapState::Method(EapMethodKind::Aka, MethodSubState::AwaitingSuccessOrFailure)));

        let success = EapPacket::success(3);
        let outcome = eap.handle_packet(&success, &MockSim).await.unwrap();
        match outcome {
            EapOutcome::Success { msk, emsk } => {
                assert_eq!(msk.len(), 64);
                assert_eq!(emsk.len(), 64);
            }
            _ => panic!("expected success"),
        }
        assert!(matches!(eap.state, EapState::Success));
    }

    #[tokio::test]
    async fn success_with_no_preceding_method_exchange_is_error() {
        let mut eap = EapSession::new(EapMethod::Sim);
        let success = EapPacket::success(1);
        let err = eap.handle_packet(&success, &MockSim).await.unwrap_err();
        assert!(matches!(err, EapError::InvalidRequest));
    }
}
