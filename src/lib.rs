pub mod network;

pub use network::ike::{session::IKEDaemon, IkeError};
