//! Child Session state machine (spec §4.6): Create / Delete / Rekey
//! lifecycle for one Child SA, driven by messages posted from the owning
//! IKE Session rather than by direct synchronous calls (spec §5, §9 "Nested
//! state machines with cross-references").
//!
//! Grounded on the teacher's `TunnelManager` (`tunnels.rs`) for the
//! "own a map of live objects, look up by id, async create/close/rekey"
//! shape, generalized into per-IKE-SA maps keyed by local Child SPI.

use std::sync::Arc;
use std::time::Duration;

use crate::network::ike::codec::{
    notify, DeletePayload, KeyExchangePayload, NoncePayload, NotifyPayload, Payload, PayloadChain, Proposal,
    SaPayload, Transform, TransformAttribute, TransformKind, TrafficSelector, TsPayload,
};
use crate::network::ike::config::{ChildProposalParams, ChildSessionConfig};
use crate::network::ike::contracts::{
    ChildSessionCallback, ChildTransformKeys, Direction, IpsecTransformInstaller, UserExecutor,
};
use crate::network::ike::crypto::dh::DhKeyPair;
use crate::network::ike::crypto::rng::SecureRandomSource;
use crate::network::ike::crypto::{DhGroupId, PrfId};
use crate::network::ike::keys::derive_child_keys;
use crate::network::ike::sa::ChildSaRecord;
use crate::network::ike::IkeError;

const PROTO_ESP: u8 = 3;

/// Child Session states (spec §4.6). `KillChildSessionParent` is the
/// force-close path entered from any state on `kill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSessionState {
    Initial,
    CreateChildLocalCreate,
    Idle,
    DeleteChildLocalDelete,
    DeleteChildRemoteDelete,
    RekeyChildLocalCreate,
    RekeyChildRemoteCreate,
    RekeyChildLocalDelete,
    RekeyChildRemoteDelete,
    Closed,
}

/// One side effect a Child Session handler asks the owning IKE Session to
/// perform. Handlers return a `Vec` of these rather than acting directly —
/// crossing the IKE-to-Child boundary is messages, never synchronous calls
/// into foreign code (spec §5).
pub enum ChildAction {
    /// Send a new locally-initiated request over the CREATE_CHILD_SA or
    /// Informational exchange (the IKE Session wraps it in a full message
    /// and manages retransmission via its own `PendingExchange`).
    SendCreateChildRequest(PayloadChain),
    SendDeleteRequest(PayloadChain),
    /// Send the response to an inbound request.
    SendResponse(PayloadChain),
    /// Register `remote_spi` as routing to this Child Session immediately,
    /// before the rest of the response is validated (spec §9 provisional
    /// registration race).
    RegisterProvisionalSpi(u32),
    DeregisterProvisionalSpi(u32),
    ScheduleRekeyTimer(Duration),
    CancelRekeyTimer,
    Closed,
}

/// Computed negotiated parameters carried out of a completed create/rekey
/// exchange, used by the caller to finish building the `ChildSaRecord`.
struct NegotiatedChild {
    remote_spi: u32,
    proposal: Proposal,
    local_ts: Vec<TrafficSelector>,
    remote_ts: Vec<TrafficSelector>,
    is_transport: bool,
    peer_public_ke: Option<Vec<u8>>,
}

/// Outbound key material held back during a remote-initiated rekey until
/// the peer's Delete of the old SA arrives (spec §4.6 install-order
/// asymmetry).
struct PendingOutboundInstall {
    remote_spi: u32,
    is_transport: bool,
    encr_key: crate::network::ike::crypto::SecretBytes,
    auth_key: crate::network::ike::crypto::SecretBytes,
}

pub struct ChildSession {
    state: ChildSessionState,
    config: ChildSessionConfig,
    local_spi: u32,
    current: Option<ChildSaRecord>,
    /// The not-yet-swapped-in record created by an in-progress create or
    /// rekey exchange.
    pending: Option<ChildSaRecord>,
    /// Outbound install deferred from a remote-initiated rekey, applied by
    /// `observe_old_sa_delete_during_remote_rekey`.
    pending_outbound: Option<PendingOutboundInstall>,
    dh_keypair: Option<DhKeyPair>,
    local_nonce: Vec<u8>,
    remote_nonce: Vec<u8>,
    callback: Arc<dyn ChildSessionCallback>,
    executor: Arc<dyn UserExecutor>,
    rekey_error_retries: u32,
}

impl ChildSession {
    pub fn new(
        local_spi: u32,
        config: ChildSessionConfig,
        callback: Arc<dyn ChildSessionCallback>,
        executor: Arc<dyn UserExecutor>,
    ) -> Self {
        ChildSession {
            state: ChildSessionState::Initial,
            config,
            local_spi,
            current: None,
            pending: None,
            pending_outbound: None,
            dh_keypair: None,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            callback,
            executor,
            rekey_error_retries: 0,
        }
    }

    pub fn state(&self) -> ChildSessionState {
        self.state
    }

    pub fn local_spi(&self) -> u32 {
        self.local_spi
    }

    pub fn current_remote_spi(&self) -> Option<u32> {
        self.current.as_ref().map(|sa| sa.remote_spi)
    }

    fn fire<F: FnOnce(&dyn ChildSessionCallback) + Send + 'static>(&self, f: F) {
        let cb = self.callback.clone();
        self.executor.execute(Box::new(move || f(&*cb)));
    }

    fn proposal_transforms(params: &ChildProposalParams) -> Vec<Transform> {
        let mut transforms = vec![Transform {
            kind: TransformKind::Encryption,
            transform_id: params.encryption.transform_id(),
            attributes: params
                .encryption_key_bits
                .map(|b| vec![TransformAttribute::key_length(b)])
                .unwrap_or_default(),
        }];
        if !params.encryption.is_aead() {
            transforms.push(Transform {
                kind: TransformKind::Integrity,
                transform_id: params.integrity.transform_id(),
                attributes: vec![],
            });
        }
        if let Some(dh) = params.dh_group {
            transforms.push(Transform {
                kind: TransformKind::DiffieHellman,
                transform_id: dh.transform_id(),
                attributes: vec![],
            });
        }
        transforms.push(Transform {
            kind: TransformKind::ExtendedSequenceNumbers,
            transform_id: 0, // no extended sequence numbers
            attributes: vec![],
        });
        transforms
    }

    pub(crate) fn build_sa_offer(&self) -> SaPayload {
        SaPayload {
            proposals: vec![Proposal {
                proposal_num: 1,
                protocol_id: PROTO_ESP,
                spi: self.local_spi.to_be_bytes().to_vec(),
                transforms: Self::proposal_transforms(&self.config.proposal),
            }],
        }
    }

    fn transport_mode_notify(&self) -> Option<NotifyPayload> {
        if self.config.is_transport {
            Some(NotifyPayload {
                protocol_id: 0,
                spi: vec![],
                message_type: notify::status::USE_TRANSPORT_MODE,
                data: vec![],
            })
        } else {
            None
        }
    }

    // -----------------------------------------------------------------
    // Create (local initiator) — spec §4.6 "Create (local)"
    // -----------------------------------------------------------------

    /// Builds the CREATE_CHILD_SA request for a brand-new Child SA.
    pub fn build_create_request(&mut self, nonce: Vec<u8>, rng: &mut dyn SecureRandomSource) -> Result<PayloadChain, IkeError> {
        self.local_nonce = nonce.clone();
        let mut payloads = vec![Payload::Sa(self.build_sa_offer()), Payload::Nonce(NoncePayload(nonce))];

        if let Some(dh_group) = self.config.proposal.dh_group {
            if dh_group != DhGroupId::None {
                let kp = DhKeyPair::generate(dh_group, rng)?;
                payloads.push(Payload::KeyExchange(KeyExchangePayload {
                    dh_group: dh_group.transform_id(),
                    data: kp.public.clone(),
                }));
                self.dh_keypair = Some(kp);
            }
        }

        payloads.push(Payload::TsInitiator(TsPayload {
            selectors: self.config.local_ts.clone(),
        }));
        payloads.push(Payload::TsResponder(TsPayload {
            selectors: self.config.remote_ts.clone(),
        }));
        if let Some(n) = self.transport_mode_notify() {
            payloads.push(Payload::Notify(n));
        }

        self.state = ChildSessionState::CreateChildLocalCreate;
        Ok(PayloadChain(payloads))
    }

    /// Parses and validates a create/rekey response's shared shape (spec
    /// §4.6 invariants: exactly one proposal, TSi/TSr subset, transport-mode
    /// notify presence matches). Returns the registration action first, as
    /// the provisional-registration race requires (spec §9).
    fn parse_negotiated_response(
        &self,
        response: &PayloadChain,
        actions: &mut Vec<ChildAction>,
    ) -> Result<NegotiatedChild, IkeError> {
        let sa = response
            .0
            .iter()
            .find_map(|p| match p {
                Payload::Sa(sa) => Some(sa),
                _ => None,
            })
            .ok_or(IkeError::NoProposalChosen)?;
        if sa.proposals.len() != 1 {
            return Err(IkeError::NoProposalChosen);
        }
        let proposal = sa.proposals[0].clone();
        if proposal.spi.len() != 4 {
            return Err(IkeError::InvalidSyntax("Child SA proposal SPI is not 4 bytes".into()));
        }
        let remote_spi = u32::from_be_bytes(proposal.spi.clone().try_into().unwrap());
        actions.push(ChildAction::RegisterProvisionalSpi(remote_spi));

        let tsi = response.0.iter().find_map(|p| match p {
            Payload::TsInitiator(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let tsr = response.0.iter().find_map(|p| match p {
            Payload::TsResponder(ts) => Some(ts.selectors.clone()),
            _ => None,
        });
        let (tsi, tsr) = match (tsi, tsr) {
            (Some(i), Some(r)) => (i, r),
            _ => return Err(IkeError::TsUnacceptable),
        };
        for sel in &tsi {
            if !self.config.local_ts.iter().any(|offered| sel.is_subset_of(offered)) {
                return Err(IkeError::TsUnacceptable);
            }
        }
        for sel in &tsr {
            if !self.config.remote_ts.iter().any(|offered| sel.is_subset_of(offered)) {
                return Err(IkeError::TsUnacceptable);
            }
        }

        let transport_notified = response.0.iter().any(|p| {
            matches!(p, Payload::Notify(n) if n.message_type == notify::status::USE_TRANSPORT_MODE)
        });
        if transport_notified != self.config.is_transport {
            return Err(IkeError::TsUnacceptable);
        }

        let peer_public_ke = response.0.iter().find_map(|p| match p {
            Payload::KeyExchange(ke) => Some(ke.data.clone()),
            _ => None,
        });

        Ok(NegotiatedChild {
            remote_spi,
            proposal,
            local_ts: tsi,
            remote_ts: tsr,
            is_transport: self.config.is_transport,
            peer_public_ke,
        })
    }

    fn negotiated_child_keys(
        &self,
        negotiated: &NegotiatedChild,
        sk_d: &crate::network::ike::crypto::SecretBytes,
        prf_id: PrfId,
        ni: &[u8],
        nr: &[u8],
    ) -> Result<crate::network::ike::keys::ChildKeys, IkeError> {
        let encryption = self.config.proposal.encryption;
        let encryption_key_bits = negotiated
            .proposal
            .transforms
            .iter()
            .find(|t| t.kind == TransformKind::Encryption)
            .and_then(|t| t.attributes.iter().find_map(|a| a.key_length_bits()))
            .or(self.config.proposal.encryption_key_bits);
        let integrity = self.config.proposal.integrity;

        let shared = match (&self.dh_keypair, &negotiated.peer_public_ke) {
            (Some(kp), Some(peer)) => Some(kp.compute_shared(peer)?),
            _ => None,
        };

        Ok(derive_child_keys(
            prf_id,
            integrity,
            encryption,
            encryption_key_bits,
            sk_d,
            shared.as_deref(),
            ni,
            nr,
        )?)
    }

    /// Finishes a create/rekey exchange: derives keys, installs both
    /// directions, fires callbacks, and schedules the rekey timer. Shared by
    /// "Create (local)" completion and a remote-initiated Create-equivalent
    /// (this core never receives a bare peer-initiated additional Create,
    /// only Rekey — see `handle_rekey_request`).
    #[allow(clippy::too_many_arguments)]
    async fn install_new_child(
        &mut self,
        negotiated: NegotiatedChild,
        encr_i: crate::network::ike::crypto::SecretBytes,
        auth_i: crate::network::ike::crypto::SecretBytes,
        encr_r: crate::network::ike::crypto::SecretBytes,
        auth_r: crate::network::ike::crypto::SecretBytes,
        is_local_init: bool,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<ChildSaRecord, IkeError> {
        let mut record = ChildSaRecord::new(
            self.local_spi,
            negotiated.remote_spi,
            is_local_init,
            negotiated.is_transport,
            negotiated.local_ts,
            negotiated.remote_ts,
        );

        let (out_encr, out_auth, in_encr, in_auth) = if is_local_init {
            (encr_i, auth_i, encr_r, auth_r)
        } else {
            (encr_r, auth_r, encr_i, auth_i)
        };

        let encryption = self.config.proposal.encryption;
        let integrity = self.config.proposal.integrity;
        let encryption_key_bits = self.config.proposal.encryption_key_bits;

        let inbound = installer
            .install(
                Direction::Inbound,
                ChildTransformKeys {
                    encryption,
                    encryption_key_bits,
                    integrity,
                    encr_key: in_encr,
                    auth_key: in_auth,
                },
                self.local_spi,
                remote_addr,
                negotiated.is_transport,
            )
            .await?;
        record.set_inbound_transform(inbound);

        let outbound = installer
            .install(
                Direction::Outbound,
                ChildTransformKeys {
                    encryption,
                    encryption_key_bits,
                    integrity,
                    encr_key: out_encr,
                    auth_key: out_auth,
                },
                negotiated.remote_spi,
                remote_addr,
                negotiated.is_transport,
            )
            .await?;
        record.set_outbound_transform(outbound);

        Ok(record)
    }

    fn schedule_rekey(&self, actions: &mut Vec<ChildAction>) {
        actions.push(ChildAction::ScheduleRekeyTimer(Duration::from_secs(
            self.config.lifetime.soft_secs,
        )));
    }

    /// Completes `build_create_request`'s exchange on receiving a response.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_create_response(
        &mut self,
        response: &PayloadChain,
        sk_d: &crate::network::ike::crypto::SecretBytes,
        prf_id: PrfId,
        nr: &[u8],
        is_ike_local_init: bool,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<Vec<ChildAction>, IkeError> {
        let mut actions = Vec::new();
        let negotiated = match self.parse_negotiated_response(response, &mut actions) {
            Ok(n) => n,
            Err(e) => {
                if let Some(ChildAction::RegisterProvisionalSpi(spi)) = actions.first() {
                    actions.push(ChildAction::DeregisterProvisionalSpi(*spi));
                }
                self.fire(move |cb| cb.on_error(&IkeError::InternalError("child create rejected".into())));
                return Err(e);
            }
        };
        self.remote_nonce = nr.to_vec();

        let keys = self.negotiated_child_keys(&negotiated, sk_d, prf_id, &self.local_nonce.clone(), nr)?;
        let record = self
            .install_new_child(
                negotiated,
                keys.encr_i,
                keys.auth_i,
                keys.encr_r,
                keys.auth_r,
                is_ike_local_init,
                installer,
                remote_addr,
            )
            .await?;

        let local_spi = self.local_spi;
        let remote_spi = record.remote_spi;
        self.current = Some(record);
        self.state = ChildSessionState::Idle;

        self.fire(move |cb| {
            cb.on_opened();
            cb.on_ipsec_transform_created(Direction::Inbound, local_spi);
            cb.on_ipsec_transform_created(Direction::Outbound, remote_spi);
        });
        self.schedule_rekey(&mut actions);
        Ok(actions)
    }

    /// Installs a Child SA negotiated inline within an IKE_AUTH exchange
    /// (the first Child SA of the IKE SA), where there is no dedicated
    /// CREATE_CHILD_SA round trip and no fresh nonces or KE — the original
    /// IKE_SA_INIT Ni/Nr are reused for KEYMAT (RFC 7296 §2.17).
    #[allow(clippy::too_many_arguments)]
    pub async fn install_from_ike_auth(
        &mut self,
        remote_spi: u32,
        local_ts: Vec<TrafficSelector>,
        remote_ts: Vec<TrafficSelector>,
        is_transport: bool,
        sk_d: &crate::network::ike::crypto::SecretBytes,
        prf_id: PrfId,
        ni: &[u8],
        nr: &[u8],
        is_ike_local_init: bool,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<Vec<ChildAction>, IkeError> {
        let negotiated = NegotiatedChild {
            remote_spi,
            proposal: Proposal {
                proposal_num: 1,
                protocol_id: PROTO_ESP,
                spi: remote_spi.to_be_bytes().to_vec(),
                transforms: Self::proposal_transforms(&self.config.proposal),
            },
            local_ts,
            remote_ts,
            is_transport,
            peer_public_ke: None,
        };
        let keys = self.negotiated_child_keys(&negotiated, sk_d, prf_id, ni, nr)?;
        let record = self
            .install_new_child(
                negotiated,
                keys.encr_i,
                keys.auth_i,
                keys.encr_r,
                keys.auth_r,
                is_ike_local_init,
                installer,
                remote_addr,
            )
            .await?;

        let local_spi = self.local_spi;
        let remote_spi = record.remote_spi;
        self.current = Some(record);
        self.state = ChildSessionState::Idle;

        let mut actions = vec![ChildAction::RegisterProvisionalSpi(remote_spi)];
        self.fire(move |cb| {
            cb.on_opened();
            cb.on_ipsec_transform_created(Direction::Inbound, local_spi);
            cb.on_ipsec_transform_created(Direction::Outbound, remote_spi);
        });
        self.schedule_rekey(&mut actions);
        Ok(actions)
    }

    // -----------------------------------------------------------------
    // Rekey (local initiator) — spec §4.6 "Rekey"
    // -----------------------------------------------------------------

    /// Re-uses the previously negotiated proposal and traffic selectors
    /// (spec §4.6: "Rekey: re-use the previously negotiated proposal and
    /// traffic selectors").
    pub fn build_rekey_request(&mut self, nonce: Vec<u8>, rng: &mut dyn SecureRandomSource) -> Result<PayloadChain, IkeError> {
        let current = self.current.as_ref().ok_or(IkeError::ChildSaNotFound(vec![]))?;
        self.local_nonce = nonce.clone();
        let mut payloads = vec![
            Payload::Sa(self.build_sa_offer()),
            Payload::Nonce(NoncePayload(nonce)),
        ];
        if let Some(dh_group) = self.config.proposal.dh_group {
            if dh_group != DhGroupId::None {
                let kp = DhKeyPair::generate(dh_group, rng)?;
                payloads.push(Payload::KeyExchange(KeyExchangePayload {
                    dh_group: dh_group.transform_id(),
                    data: kp.public.clone(),
                }));
                self.dh_keypair = Some(kp);
            }
        }
        payloads.push(Payload::TsInitiator(TsPayload {
            selectors: current.local_ts.clone(),
        }));
        payloads.push(Payload::TsResponder(TsPayload {
            selectors: current.remote_ts.clone(),
        }));
        payloads.push(Payload::Notify(NotifyPayload {
            protocol_id: PROTO_ESP,
            spi: current.local_spi.to_be_bytes().to_vec(),
            message_type: notify::status::REKEY_SA,
            data: vec![],
        }));

        self.state = ChildSessionState::RekeyChildLocalCreate;
        Ok(PayloadChain(payloads))
    }

    /// On successful response: moves to `RekeyChildLocalDelete`. The caller
    /// must follow up with a Delete of the old SA; `finish_local_rekey_delete`
    /// completes the swap once that Delete's response arrives.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_rekey_response(
        &mut self,
        response: &PayloadChain,
        sk_d: &crate::network::ike::crypto::SecretBytes,
        prf_id: PrfId,
        nr: &[u8],
        is_ike_local_init: bool,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<Vec<ChildAction>, IkeError> {
        let mut actions = Vec::new();
        let negotiated = self.parse_negotiated_response(response, &mut actions)?;
        self.remote_nonce = nr.to_vec();
        let keys = self.negotiated_child_keys(&negotiated, sk_d, prf_id, &self.local_nonce.clone(), nr)?;
        let record = self
            .install_new_child(
                negotiated,
                keys.encr_i,
                keys.auth_i,
                keys.encr_r,
                keys.auth_r,
                is_ike_local_init,
                installer,
                remote_addr,
            )
            .await?;
        self.pending = Some(record);
        self.state = ChildSessionState::RekeyChildLocalDelete;

        let old_spi = self.current.as_ref().map(|sa| sa.local_spi).unwrap_or(self.local_spi);
        actions.push(ChildAction::SendDeleteRequest(PayloadChain(vec![Payload::Delete(DeletePayload {
            protocol_id: PROTO_ESP,
            spi_size: 4,
            spis: vec![old_spi.to_be_bytes().to_vec()],
        })])));
        Ok(actions)
    }

    /// Completes `RekeyChildLocalDelete`: releases the old SA, swaps the
    /// pending record in, and re-arms the rekey timer.
    pub async fn finish_local_rekey_delete(&mut self, installer: &dyn IpsecTransformInstaller) -> Result<Vec<ChildAction>, IkeError> {
        if let Some(mut old) = self.current.take() {
            let (inbound, outbound) = old.take_transforms();
            if let Some(t) = inbound {
                installer.release(t).await?;
            }
            if let Some(t) = outbound {
                installer.release(t).await?;
            }
        }
        self.current = self.pending.take();
        self.state = ChildSessionState::Idle;
        let mut actions = Vec::new();
        self.schedule_rekey(&mut actions);
        Ok(actions)
    }

    // -----------------------------------------------------------------
    // Rekey (remote initiator) — symmetric but install order reversed
    // -----------------------------------------------------------------

    /// A peer-initiated Rekey-Child request. Installs only the new SA's
    /// inbound transform now; the outbound transform is installed only
    /// after the peer's Delete of the old SA is observed, avoiding a
    /// transient traffic drop (spec §4.6).
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_rekey_request(
        &mut self,
        request: &PayloadChain,
        sk_d: &crate::network::ike::crypto::SecretBytes,
        prf_id: PrfId,
        ni: &[u8],
        nonce: Vec<u8>,
        is_ike_local_init: bool,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<Vec<ChildAction>, IkeError> {
        let mut actions = Vec::new();
        let negotiated = self.parse_negotiated_response(request, &mut actions)?;
        self.remote_nonce = ni.to_vec();
        self.local_nonce = nonce.clone();
        let keys = self.negotiated_child_keys(&negotiated, sk_d, prf_id, ni, &nonce)?;

        let remote_spi = negotiated.remote_spi;
        let mut record = ChildSaRecord::new(
            self.local_spi,
            remote_spi,
            is_ike_local_init,
            negotiated.is_transport,
            negotiated.local_ts.clone(),
            negotiated.remote_ts.clone(),
        );
        let (in_encr, in_auth, out_encr, out_auth) = if is_ike_local_init {
            (keys.encr_r, keys.auth_r, keys.encr_i, keys.auth_i)
        } else {
            (keys.encr_i, keys.auth_i, keys.encr_r, keys.auth_r)
        };
        let encryption = self.config.proposal.encryption;
        let integrity = self.config.proposal.integrity;
        let inbound = installer
            .install(
                Direction::Inbound,
                ChildTransformKeys {
                    encryption,
                    encryption_key_bits: self.config.proposal.encryption_key_bits,
                    integrity,
                    encr_key: in_encr,
                    auth_key: in_auth,
                },
                self.local_spi,
                remote_addr,
                negotiated.is_transport,
            )
            .await?;
        record.set_inbound_transform(inbound);
        self.pending = Some(record);
        self.pending_outbound = Some(PendingOutboundInstall {
            remote_spi,
            is_transport: negotiated.is_transport,
            encr_key: out_encr,
            auth_key: out_auth,
        });
        self.state = ChildSessionState::RekeyChildRemoteCreate;

        let mut response_payloads = vec![Payload::Sa(self.build_sa_offer()), Payload::Nonce(NoncePayload(nonce))];
        response_payloads.push(Payload::TsInitiator(TsPayload {
            selectors: negotiated.local_ts,
        }));
        response_payloads.push(Payload::TsResponder(TsPayload {
            selectors: negotiated.remote_ts,
        }));
        actions.push(ChildAction::SendResponse(PayloadChain(response_payloads)));
        Ok(actions)
    }

    /// The peer's Delete of the old SA, observed while
    /// `RekeyChildRemoteCreate` — finishes installing the new SA's outbound
    /// transform and swaps it in.
    pub async fn observe_old_sa_delete_during_remote_rekey(
        &mut self,
        installer: &dyn IpsecTransformInstaller,
        remote_addr: std::net::SocketAddr,
    ) -> Result<Vec<ChildAction>, IkeError> {
        let mut pending = self.pending.take().ok_or(IkeError::ChildSaNotFound(vec![]))?;
        let outbound_keys = self
            .pending_outbound
            .take()
            .ok_or(IkeError::ChildSaNotFound(vec![]))?;

        let outbound = installer
            .install(
                Direction::Outbound,
                ChildTransformKeys {
                    encryption: self.config.proposal.encryption,
                    encryption_key_bits: self.config.proposal.encryption_key_bits,
                    integrity: self.config.proposal.integrity,
                    encr_key: outbound_keys.encr_key,
                    auth_key: outbound_keys.auth_key,
                },
                outbound_keys.remote_spi,
                remote_addr,
                outbound_keys.is_transport,
            )
            .await?;
        pending.set_outbound_transform(outbound);

        if let Some(mut old) = self.current.take() {
            let (inbound, outbound) = old.take_transforms();
            if let Some(t) = inbound {
                installer.release(t).await?;
            }
            if let Some(t) = outbound {
                installer.release(t).await?;
            }
        }
        self.current = Some(pending);
        self.state = ChildSessionState::Idle;
        let mut actions = Vec::new();
        self.schedule_rekey(&mut actions);
        Ok(actions)
    }

    // -----------------------------------------------------------------
    // Delete — spec §4.6 "Delete"
    // -----------------------------------------------------------------

    pub fn build_delete_request(&mut self) -> Result<PayloadChain, IkeError> {
        let sa = self.current.as_ref().ok_or(IkeError::ChildSaNotFound(vec![]))?;
        self.state = ChildSessionState::DeleteChildLocalDelete;
        Ok(PayloadChain(vec![Payload::Delete(DeletePayload {
            protocol_id: PROTO_ESP,
            spi_size: 4,
            spis: vec![sa.local_spi.to_be_bytes().to_vec()],
        })]))
    }

    /// Valid delete response, or an empty informational response in the
    /// simultaneous-delete case (spec §4.6). The Open Question on
    /// simultaneous-delete permissiveness is resolved strict here: a peer
    /// that echoes the SPI we just deleted back in its own Delete payload
    /// within this response is rejected as `InvalidSyntax` rather than
    /// warned about and ignored.
    pub async fn handle_delete_response(
        &mut self,
        response: &PayloadChain,
        installer: &dyn IpsecTransformInstaller,
    ) -> Result<Vec<ChildAction>, IkeError> {
        if let Some(sa) = &self.current {
            let local_spi_bytes = sa.local_spi.to_be_bytes();
            for p in &response.0 {
                if let Payload::Delete(d) = p {
                    if d.protocol_id == PROTO_ESP && d.spis.iter().any(|s| s.as_slice() == local_spi_bytes) {
                        return Err(IkeError::InvalidSyntax(
                            "peer echoed the current SPI in a simultaneous-delete response".into(),
                        ));
                    }
                }
            }
        }
        self.teardown(installer).await
    }

    /// A peer-initiated Delete-Child request: answer with our own Delete
    /// carrying the local SPI, then tear down (spec §4.6).
    pub async fn handle_delete_request(&mut self, installer: &dyn IpsecTransformInstaller) -> Result<Vec<ChildAction>, IkeError> {
        let local_spi = self.local_spi;
        self.state = ChildSessionState::DeleteChildRemoteDelete;
        let mut actions = self.teardown(installer).await?;
        actions.insert(
            0,
            ChildAction::SendResponse(PayloadChain(vec![Payload::Delete(DeletePayload {
                protocol_id: PROTO_ESP,
                spi_size: 4,
                spis: vec![local_spi.to_be_bytes().to_vec()],
            })])),
        );
        Ok(actions)
    }

    async fn teardown(&mut self, installer: &dyn IpsecTransformInstaller) -> Result<Vec<ChildAction>, IkeError> {
        if let Some(mut sa) = self.current.take() {
            let (inbound, outbound) = sa.take_transforms();
            if let Some(t) = inbound {
                installer.release(t).await?;
            }
            if let Some(t) = outbound {
                installer.release(t).await?;
            }
        }
        self.state = ChildSessionState::Closed;
        self.fire(|cb| cb.on_closed());
        Ok(vec![ChildAction::CancelRekeyTimer, ChildAction::Closed])
    }

    /// Force-close (`KillChildSessionParent`, spec §5): deallocates without
    /// emitting network traffic.
    pub async fn kill(&mut self, installer: &dyn IpsecTransformInstaller) -> Result<(), IkeError> {
        if let Some(mut sa) = self.current.take() {
            let (inbound, outbound) = sa.take_transforms();
            if let Some(t) = inbound {
                installer.release(t).await?;
            }
            if let Some(t) = outbound {
                installer.release(t).await?;
            }
        }
        if let Some(mut sa) = self.pending.take() {
            let (inbound, outbound) = sa.take_transforms();
            if let Some(t) = inbound {
                installer.release(t).await?;
            }
            if let Some(t) = outbound {
                installer.release(t).await?;
            }
        }
        self.pending_outbound = None;
        self.state = ChildSessionState::Closed;
        self.fire(|cb| cb.on_closed());
        Ok(())
    }

    // -----------------------------------------------------------------
    // Simultaneous-rekey tie-break (spec §4.4/§4.6)
    // -----------------------------------------------------------------

    /// The side with the lexicographically smaller nonce (as unsigned
    /// big-endian byte strings) keeps its new SA; returns `true` when the
    /// local side's nonce wins and should keep its in-progress new SA.
    pub fn local_wins_tie_break(local_nonce: &[u8], remote_nonce: &[u8]) -> bool {
        local_nonce < remote_nonce
    }

    /// The local side lost a simultaneous rekey: the in-progress pending SA
    /// must be torn down (its creator initiates the Delete), without
    /// disturbing `current`. Returns the discarded record so the caller can
    /// release its installed transforms through the installer.
    pub fn discard_losing_pending(&mut self) -> Option<ChildSaRecord> {
        self.pending_outbound = None;
        let pending = self.pending.take();
        if pending.is_some() {
            self.state = ChildSessionState::Idle;
        }
        pending
    }

    // -----------------------------------------------------------------
    // Error policy for Rekey-Child (spec §4.6)
    // -----------------------------------------------------------------

    /// Classifies a remote error notification during an in-flight
    /// Rekey-Child exchange.
    pub fn classify_rekey_error(&mut self, notify_type: u16) -> RekeyErrorOutcome {
        match notify_type {
            notify::error::TEMPORARY_FAILURE => RekeyErrorOutcome::SilentRetry,
            notify::error::INVALID_SYNTAX => RekeyErrorOutcome::Fatal,
            _ => {
                self.rekey_error_retries += 1;
                RekeyErrorOutcome::ScheduleRetry
            }
        }
    }
}

/// Outcome of classifying a Rekey-Child error notification (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyErrorOutcome {
    SilentRetry,
    ScheduleRetry,
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::network::ike::crypto::SecretBytes;

    struct MockInstaller {
        next_spi: AtomicU32,
        released: Mutex<Vec<u32>>,
    }

    impl MockInstaller {
        fn new() -> Self {
            MockInstaller {
                next_spi: AtomicU32::new(100),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IpsecTransformInstaller for MockInstaller {
        async fn allocate_spi(&self, _remote_addr: SocketAddr) -> Result<crate::network::ike::contracts::OwnedSpi, IkeError> {
            Ok(crate::network::ike::contracts::OwnedSpi(
                self.next_spi.fetch_add(1, Ordering::SeqCst),
            ))
        }

        async fn install(
            &self,
            _direction: Direction,
            _keys: ChildTransformKeys,
            spi: u32,
            _remote_addr: SocketAddr,
            _is_transport: bool,
        ) -> Result<crate::network::ike::contracts::OwnedTransform, IkeError> {
            Ok(crate::network::ike::contracts::OwnedTransform(Box::new(spi)))
        }

        async fn release(&self, transform: crate::network::ike::contracts::OwnedTransform) -> Result<(), IkeError> {
            if let Ok(spi) = transform.0.downcast::<u32>() {
                self.released.lock().unwrap().push(*spi);
            }
            Ok(())
        }
    }

    struct NoopCallback;
    impl ChildSessionCallback for NoopCallback {
        fn on_opened(&self) {}
        fn on_closed(&self) {}
        fn on_ipsec_transform_created(&self, _direction: Direction, _local_spi: u32) {}
        fn on_ipsec_transform_deleted(&self, _direction: Direction, _local_spi: u32) {}
        fn on_error(&self, _error: &IkeError) {}
    }

    struct InlineExecutor;
    impl UserExecutor for InlineExecutor {
        fn execute(&self, callback: Box<dyn FnOnce() + Send>) {
            callback();
        }
    }

    fn remote_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 500)
    }

    fn test_session() -> ChildSession {
        ChildSession::new(
            7,
            ChildSessionConfig::default(),
            Arc::new(NoopCallback),
            Arc::new(InlineExecutor),
        )
    }

    fn success_response(remote_spi: u32, config: &ChildSessionConfig) -> PayloadChain {
        PayloadChain(vec![
            Payload::Sa(SaPayload {
                proposals: vec![Proposal {
                    proposal_num: 1,
                    protocol_id: PROTO_ESP,
                    spi: remote_spi.to_be_bytes().to_vec(),
                    transforms: ChildSession::proposal_transforms(&config.proposal),
                }],
            }),
            Payload::Nonce(NoncePayload(b"responder-nonce".to_vec())),
            Payload::TsInitiator(TsPayload {
                selectors: vec![TrafficSelector::all_ipv4()],
            }),
            Payload::TsResponder(TsPayload {
                selectors: vec![TrafficSelector::all_ipv4()],
            }),
        ])
    }

    #[test]
    fn build_create_request_carries_offer_and_transitions_state() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        let request = session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::CreateChildLocalCreate);
        assert!(matches!(request.0[0], Payload::Sa(_)));
    }

    #[tokio::test]
    async fn handle_create_response_installs_both_directions_and_goes_idle() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();

        let response = success_response(42, &session.config.clone());
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();

        let actions = session
            .handle_create_response(&response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();

        assert_eq!(session.state(), ChildSessionState::Idle);
        assert_eq!(session.current_remote_spi(), Some(42));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ChildAction::RegisterProvisionalSpi(42))));
        assert!(actions.iter().any(|a| matches!(a, ChildAction::ScheduleRekeyTimer(_))));
    }

    #[tokio::test]
    async fn handle_create_response_rejects_multi_proposal_sa() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();

        let mut response = success_response(42, &session.config.clone());
        if let Payload::Sa(sa) = &mut response.0[0] {
            sa.proposals.push(sa.proposals[0].clone());
        }
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();

        let err = session
            .handle_create_response(&response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap_err();
        assert!(matches!(err, IkeError::NoProposalChosen));
    }

    #[tokio::test]
    async fn local_initiated_rekey_swaps_sa_after_old_delete_response() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        let create_response = success_response(42, &session.config.clone());
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();
        session
            .handle_create_response(&create_response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();
        let old_local_spi = session.local_spi();

        session
            .build_rekey_request(b"rekey-initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::RekeyChildLocalCreate);

        let rekey_response = success_response(99, &session.config.clone());
        let actions = session
            .handle_rekey_response(&rekey_response, &sk_d, PrfId::HmacSha1, b"rekey-responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::RekeyChildLocalDelete);
        assert!(actions.iter().any(|a| matches!(a, ChildAction::SendDeleteRequest(_))));

        let final_actions = session.finish_local_rekey_delete(&installer).await.unwrap();
        assert_eq!(session.state(), ChildSessionState::Idle);
        assert_eq!(session.current_remote_spi(), Some(99));
        assert!(final_actions.iter().any(|a| matches!(a, ChildAction::ScheduleRekeyTimer(_))));
        assert!(installer.released.lock().unwrap().contains(&old_local_spi));
    }

    #[tokio::test]
    async fn remote_initiated_rekey_defers_outbound_install_until_old_sa_delete_observed() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        let create_response = success_response(42, &session.config.clone());
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();
        session
            .handle_create_response(&create_response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();

        let rekey_request = success_response(77, &session.config.clone());
        session
            .handle_rekey_request(&rekey_request, &sk_d, PrfId::HmacSha1, b"peer-nonce", b"our-response-nonce".to_vec(), true, &installer, remote_addr())
            .await
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::RekeyChildRemoteCreate);
        // Inbound direction installed already, but the old SA is still current.
        assert_eq!(session.current_remote_spi(), Some(42));

        let actions = session
            .observe_old_sa_delete_during_remote_rekey(&installer, remote_addr())
            .await
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::Idle);
        assert_eq!(session.current_remote_spi(), Some(77));
        assert!(actions.iter().any(|a| matches!(a, ChildAction::ScheduleRekeyTimer(_))));
    }

    #[tokio::test]
    async fn delete_response_echoing_current_spi_is_rejected_strict() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        let create_response = success_response(42, &session.config.clone());
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();
        session
            .handle_create_response(&create_response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();

        session.build_delete_request().unwrap();
        let local_spi = session.local_spi();
        let simultaneous_delete = PayloadChain(vec![Payload::Delete(DeletePayload {
            protocol_id: PROTO_ESP,
            spi_size: 4,
            spis: vec![local_spi.to_be_bytes().to_vec()],
        })]);

        let err = session
            .handle_delete_response(&simultaneous_delete, &installer)
            .await
            .unwrap_err();
        assert!(matches!(err, IkeError::InvalidSyntax(_)));
        // The SA must still be considered live; the strict response was rejected.
        assert_eq!(session.current_remote_spi(), Some(42));
    }

    #[tokio::test]
    async fn delete_response_without_echoed_spi_tears_down() {
        let mut session = test_session();
        let mut rng = crate::network::ike::crypto::rng::SystemRandomSource::default();
        session
            .build_create_request(b"initiator-nonce".to_vec(), &mut rng)
            .unwrap();
        let create_response = success_response(42, &session.config.clone());
        let sk_d = SecretBytes::new(vec![0xAB; 20]);
        let installer = MockInstaller::new();
        session
            .handle_create_response(&create_response, &sk_d, PrfId::HmacSha1, b"responder-nonce", true, &installer, remote_addr())
            .await
            .unwrap();

        session.build_delete_request().unwrap();
        let actions = session
            .handle_delete_response(&PayloadChain(vec![]), &installer)
            .await
            .unwrap();
        assert_eq!(session.state(), ChildSessionState::Closed);
        assert!(actions.iter().any(|a| matches!(a, ChildAction::Closed)));
        assert_eq!(session.current_remote_spi(), None);
    }

    #[test]
    fn tie_break_prefers_lexicographically_smaller_nonce() {
        assert!(ChildSession::local_wins_tie_break(&[0x01], &[0x02]));
        assert!(!ChildSession::local_wins_tie_break(&[0x03], &[0x02]));
    }

    #[test]
    fn classify_rekey_error_distinguishes_outcomes() {
        let mut session = test_session();
        assert_eq!(
            session.classify_rekey_error(notify::error::TEMPORARY_FAILURE),
            RekeyErrorOutcome::SilentRetry
        );
        assert_eq!(
            session.classify_rekey_error(notify::error::INVALID_SYNTAX),
            RekeyErrorOutcome::Fatal
        );
        assert_eq!(
            session.classify_rekey_error(notify::error::NO_PROPOSAL_CHOSEN),
            RekeyErrorOutcome::ScheduleRetry
        );
    }
}
