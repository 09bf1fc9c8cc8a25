//! Child SA Record (spec §3): SPIs, installed transform handles, traffic
//! selectors, and the lifecycle invariant that both directions are
//! installed for every live Child SA and released together on deletion.

use crate::network::ike::codec::TrafficSelector;
use crate::network::ike::contracts::OwnedTransform;

pub struct ChildSaRecord {
    pub local_spi: u32,
    pub remote_spi: u32,
    pub is_local_init: bool,
    pub is_transport: bool,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    inbound_transform: Option<OwnedTransform>,
    outbound_transform: Option<OwnedTransform>,
}

impl ChildSaRecord {
    pub fn new(
        local_spi: u32,
        remote_spi: u32,
        is_local_init: bool,
        is_transport: bool,
        local_ts: Vec<TrafficSelector>,
        remote_ts: Vec<TrafficSelector>,
    ) -> Self {
        ChildSaRecord {
            local_spi,
            remote_spi,
            is_local_init,
            is_transport,
            local_ts,
            remote_ts,
            inbound_transform: None,
            outbound_transform: None,
        }
    }

    pub fn set_inbound_transform(&mut self, transform: OwnedTransform) {
        self.inbound_transform = Some(transform);
    }

    pub fn set_outbound_transform(&mut self, transform: OwnedTransform) {
        self.outbound_transform = Some(transform);
    }

    pub fn is_fully_installed(&self) -> bool {
        self.inbound_transform.is_some() && self.outbound_transform.is_some()
    }

    pub fn has_inbound_transform(&self) -> bool {
        self.inbound_transform.is_some()
    }

    pub fn has_outbound_transform(&self) -> bool {
        self.outbound_transform.is_some()
    }

    /// Takes both transform handles for release, leaving the record with
    /// neither installed. Callers must pass both to
    /// `IpsecTransformInstaller::release` in the same teardown critical
    /// section (spec §3 invariant).
    pub fn take_transforms(&mut self) -> (Option<OwnedTransform>, Option<OwnedTransform>) {
        (self.inbound_transform.take(), self.outbound_transform.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_fully_installed_until_both_directions_set() {
        let mut sa = ChildSaRecord::new(1, 2, true, false, vec![TrafficSelector::all_ipv4()], vec![TrafficSelector::all_ipv4()]);
        assert!(!sa.is_fully_installed());
        sa.set_inbound_transform(OwnedTransform(Box::new(())));
        assert!(!sa.is_fully_installed());
        sa.set_outbound_transform(OwnedTransform(Box::new(())));
        assert!(sa.is_fully_installed());
    }

    #[test]
    fn take_transforms_clears_record() {
        let mut sa = ChildSaRecord::new(1, 2, true, false, vec![], vec![]);
        sa.set_inbound_transform(OwnedTransform(Box::new(())));
        sa.set_outbound_transform(OwnedTransform(Box::new(())));
        let (inbound, outbound) = sa.take_transforms();
        assert!(inbound.is_some());
        assert!(outbound.is_some());
        assert!(!sa.has_inbound_transform());
        assert!(!sa.has_outbound_transform());
    }
}
