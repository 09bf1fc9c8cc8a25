//! SA record types (spec §3): the IKE SA Record, Child SA Record, and
//! Pending Exchange that the session and child-session state machines own.

pub mod child_sa;
pub mod ike_sa;
pub mod pending_exchange;

pub use child_sa::ChildSaRecord;
pub use ike_sa::{IkeSaRecord, NegotiatedIkeTransforms};
pub use pending_exchange::{AwaitedResponse, PendingExchange};
