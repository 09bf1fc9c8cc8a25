//! Pending Exchange (spec §3): the single in-flight locally-initiated
//! request an IKE SA may have outstanding at any instant (window size 1),
//! its retransmission timer state, and the response class the session is
//! waiting to match against.

use std::time::Duration;

use crate::network::ike::codec::ExchangeType;

/// What kind of response this exchange expects, used to validate an inbound
/// response actually answers the outstanding request rather than merely
/// carrying a matching message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitedResponse {
    IkeSaInit,
    IkeAuth,
    CreateChildSa,
    Informational,
}

impl AwaitedResponse {
    pub fn exchange_type(self) -> ExchangeType {
        match self {
            AwaitedResponse::IkeSaInit => ExchangeType::IkeSaInit,
            AwaitedResponse::IkeAuth => ExchangeType::IkeAuth,
            AwaitedResponse::CreateChildSa => ExchangeType::CreateChildSa,
            AwaitedResponse::Informational => ExchangeType::Informational,
        }
    }
}

pub struct PendingExchange {
    pub message_id: u32,
    pub request_bytes: Vec<u8>,
    pub awaited: AwaitedResponse,
    attempts: u32,
    next_fire_at_millis: u64,
}

impl PendingExchange {
    pub fn new(message_id: u32, request_bytes: Vec<u8>, awaited: AwaitedResponse, now_millis: u64, base: Duration) -> Self {
        PendingExchange {
            message_id,
            request_bytes,
            awaited,
            attempts: 0,
            next_fire_at_millis: now_millis + base.as_millis() as u64,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the retransmission timer has fired and a resend is due.
    pub fn due(&self, now_millis: u64) -> bool {
        now_millis >= self.next_fire_at_millis
    }

    /// Records one retransmission attempt and reschedules the next fire
    /// time with exponential backoff (spec §4.4: base ~500ms, multiplier 2).
    pub fn record_retransmit(&mut self, now_millis: u64, base: Duration, multiplier: u32) {
        self.attempts += 1;
        let factor = multiplier.saturating_pow(self.attempts);
        let delay_millis = (base.as_millis() as u64).saturating_mul(factor as u64);
        self.next_fire_at_millis = now_millis + delay_millis;
    }

    /// Whether the retransmission cap has been reached (spec §4.4: cap 8
    /// attempts, after which the SA enters fatal error / `Timeout`).
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let mut pending = PendingExchange::new(0, vec![], AwaitedResponse::IkeSaInit, 0, Duration::from_millis(500));
        assert!(!pending.due(100));
        assert!(pending.due(500));

        pending.record_retransmit(500, Duration::from_millis(500), 2);
        assert_eq!(pending.attempts(), 1);
        // next fire at 500 + 500*2^1 = 1500
        assert!(!pending.due(1400));
        assert!(pending.due(1500));
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut pending = PendingExchange::new(0, vec![], AwaitedResponse::IkeAuth, 0, Duration::from_millis(500));
        for _ in 0..8 {
            pending.record_retransmit(0, Duration::from_millis(500), 2);
        }
        assert!(pending.is_exhausted(8));
    }
}
