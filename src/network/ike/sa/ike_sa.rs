//! IKE SA Record (spec §3): SPIs, negotiated transforms, the seven derived
//! keys, and the per-direction message id counters the window-size-1
//! exchange discipline (spec §4.4) relies on.

use crate::network::ike::crypto::{DhGroupId, EncryptionAlgorithmId, IntegrityAlgorithmId, PrfId, SecretBytes};
use crate::network::ike::keys::IkeKeys;

/// The transform ids negotiated for this IKE SA (one proposal, one
/// transform per type — the result of SA payload matching, not the offered
/// list).
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedIkeTransforms {
    pub encryption: EncryptionAlgorithmId,
    pub encryption_key_bits: Option<u16>,
    pub integrity: IntegrityAlgorithmId,
    pub prf: PrfId,
    pub dh_group: DhGroupId,
}

/// Created at the end of IKE_SA_INIT; replaced atomically at the end of a
/// Rekey-IKE exchange; destroyed on close (spec §3).
pub struct IkeSaRecord {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub is_local_init: bool,
    pub transforms: NegotiatedIkeTransforms,
    pub sk_d: SecretBytes,
    sk_ai: SecretBytes,
    sk_ar: SecretBytes,
    sk_ei: SecretBytes,
    sk_er: SecretBytes,
    sk_pi: SecretBytes,
    sk_pr: SecretBytes,
    next_local_message_id: u32,
    last_handled_remote_message_id: Option<u32>,
}

impl IkeSaRecord {
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        is_local_init: bool,
        transforms: NegotiatedIkeTransforms,
        keys: IkeKeys,
    ) -> Self {
        IkeSaRecord {
            initiator_spi,
            responder_spi,
            is_local_init,
            transforms,
            sk_d: keys.sk_d,
            sk_ai: keys.sk_ai,
            sk_ar: keys.sk_ar,
            sk_ei: keys.sk_ei,
            sk_er: keys.sk_er,
            sk_pi: keys.sk_pi,
            sk_pr: keys.sk_pr,
            next_local_message_id: 0,
            last_handled_remote_message_id: None,
        }
    }

    /// The integrity key this side MACs outbound messages with. When the
    /// local side is the IKE SA's initiator this is `SK_ai`; otherwise
    /// `SK_ar` (spec §4.3: "its outbound keys are the `_i` halves;
    /// responder-view reverses").
    pub fn outbound_integrity_key(&self) -> &SecretBytes {
        if self.is_local_init {
            &self.sk_ai
        } else {
            &self.sk_ar
        }
    }

    pub fn inbound_integrity_key(&self) -> &SecretBytes {
        if self.is_local_init {
            &self.sk_ar
        } else {
            &self.sk_ai
        }
    }

    pub fn outbound_encryption_key(&self) -> &SecretBytes {
        if self.is_local_init {
            &self.sk_ei
        } else {
            &self.sk_er
        }
    }

    pub fn inbound_encryption_key(&self) -> &SecretBytes {
        if self.is_local_init {
            &self.sk_er
        } else {
            &self.sk_ei
        }
    }

    /// `SK_pi` is always the key used to compute/verify the initiator's
    /// AUTH payload, `SK_pr` the responder's — regardless of which side is
    /// local. `acting_as_initiator` picks which payload is being handled.
    pub fn auth_prf_key(&self, acting_as_initiator: bool) -> &SecretBytes {
        if acting_as_initiator {
            &self.sk_pi
        } else {
            &self.sk_pr
        }
    }

    /// Allocates and returns the next outbound message id, advancing the
    /// local counter (spec §4.4: starts at 0, increments per request).
    pub fn take_next_local_message_id(&mut self) -> u32 {
        let id = self.next_local_message_id;
        self.next_local_message_id += 1;
        id
    }

    pub fn next_local_message_id(&self) -> u32 {
        self.next_local_message_id
    }

    /// Expected id of the next inbound request.
    pub fn expected_remote_message_id(&self) -> u32 {
        match self.last_handled_remote_message_id {
            Some(last) => last.wrapping_add(1),
            None => 0,
        }
    }

    /// Whether `id` is a retransmission of the last request we already
    /// handled (spec §4.4: "if equal to the last handled id, re-sends the
    /// cached response").
    pub fn is_duplicate_remote_request(&self, id: u32) -> bool {
        self.last_handled_remote_message_id == Some(id)
    }

    pub fn record_handled_remote_message_id(&mut self, id: u32) {
        self.last_handled_remote_message_id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys() -> IkeKeys {
        IkeKeys {
            sk_d: SecretBytes::new(vec![1; 20]),
            sk_ai: SecretBytes::new(vec![2; 20]),
            sk_ar: SecretBytes::new(vec![3; 20]),
            sk_ei: SecretBytes::new(vec![4; 16]),
            sk_er: SecretBytes::new(vec![5; 16]),
            sk_pi: SecretBytes::new(vec![6; 20]),
            sk_pr: SecretBytes::new(vec![7; 20]),
        }
    }

    fn sample_transforms() -> NegotiatedIkeTransforms {
        NegotiatedIkeTransforms {
            encryption: EncryptionAlgorithmId::AesCbc,
            encryption_key_bits: Some(128),
            integrity: IntegrityAlgorithmId::HmacSha1_96,
            prf: PrfId::HmacSha1,
            dh_group: DhGroupId::Modp2048,
        }
    }

    #[test]
    fn message_id_counter_is_monotonic() {
        let mut sa = IkeSaRecord::new(1, 2, true, sample_transforms(), sample_keys());
        assert_eq!(sa.take_next_local_message_id(), 0);
        assert_eq!(sa.take_next_local_message_id(), 1);
        assert_eq!(sa.next_local_message_id(), 2);
    }

    #[test]
    fn direction_keys_reverse_by_role() {
        let initiator = IkeSaRecord::new(1, 2, true, sample_transforms(), sample_keys());
        let responder = IkeSaRecord::new(1, 2, false, sample_transforms(), sample_keys());
        assert_eq!(initiator.outbound_integrity_key().as_slice(), responder.inbound_integrity_key().as_slice());
        assert_eq!(initiator.inbound_integrity_key().as_slice(), responder.outbound_integrity_key().as_slice());
    }

    #[test]
    fn duplicate_remote_request_detection() {
        let mut sa = IkeSaRecord::new(1, 2, true, sample_transforms(), sample_keys());
        assert_eq!(sa.expected_remote_message_id(), 0);
        sa.record_handled_remote_message_id(0);
        assert!(sa.is_duplicate_remote_request(0));
        assert!(!sa.is_duplicate_remote_request(1));
        assert_eq!(sa.expected_remote_message_id(), 1);
    }
}
