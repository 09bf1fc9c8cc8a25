//! External collaborators this core reaches through abstract contracts
//! instead of owning directly (spec §6): kernel IPsec transform
//! installation, cellular-SIM access, the raw datagram transport, and the
//! monotonic clock/timer facility. Production wiring supplies `Tokio`-backed
//! implementations of the latter two; `IpsecTransformInstaller` and
//! `SimAuthProvider` are always supplied by the embedding application.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use super::crypto::SecretBytes;
use super::IkeError;

/// Direction a Child SA's installed transform applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An allocated kernel SPI for a Child SA, owned by whichever `ChildSaRecord`
/// requested it. Dropping without an explicit `release` through the
/// installer is a resource leak the owning record's teardown path must
/// avoid (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedSpi(pub u32);

/// An opaque handle to one direction's installed IPsec transform. The core
/// never inspects its contents; it only threads it between `install` and
/// `release`.
#[derive(Debug)]
pub struct OwnedTransform(pub Box<dyn std::any::Any + Send + Sync>);

/// Per-direction key material and algorithm identifiers handed to the
/// installer for one Child SA transform.
pub struct ChildTransformKeys {
    pub encryption: super::crypto::EncryptionAlgorithmId,
    pub encryption_key_bits: Option<u16>,
    pub integrity: super::crypto::IntegrityAlgorithmId,
    pub encr_key: SecretBytes,
    pub auth_key: SecretBytes,
}

/// The kernel-facing IPsec transform installation facility (spec §6). Out of
/// scope for this core's own logic — implemented by the embedding
/// application against its platform's IPsec stack.
#[async_trait]
pub trait IpsecTransformInstaller: Send + Sync {
    async fn allocate_spi(&self, remote_addr: SocketAddr) -> Result<OwnedSpi, IkeError>;

    async fn install(
        &self,
        direction: Direction,
        keys: ChildTransformKeys,
        spi: u32,
        remote_addr: SocketAddr,
        is_transport: bool,
    ) -> Result<OwnedTransform, IkeError>;

    async fn release(&self, transform: OwnedTransform) -> Result<(), IkeError>;
}

/// Cellular-SIM access for EAP-SIM/AKA/AKA' identity and authentication
/// vectors (spec §6). `app_type` distinguishes SIM from USIM/AKA contexts.
#[async_trait]
pub trait SimAuthProvider: Send + Sync {
    async fn identity(&self, app_type: u8) -> Result<Vec<u8>, IkeError>;
    async fn compute_auts_or_kc(&self, app_type: u8, challenge: &[u8]) -> Result<Vec<u8>, IkeError>;
}

/// The raw datagram transport: UDP port 500 (no NAT) or the port 4500
/// NAT-T encapsulation socket. The session layer is responsible for
/// prefixing/stripping [`super::NON_ESP_MARKER`] on the 4500 socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), IkeError>;
}

/// Monotonic clock and one-shot timer scheduling, injected so session timers
/// (retransmission backoff, rekey, EAP step bound) are deterministic in
/// tests (spec §9 RNG/clock determinism note).
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    /// Fires once, after `delay`, delivering `token` back to the scheduler.
    async fn schedule(&self, delay: Duration, token: u64);
}

/// Production [`DatagramSocket`] backed by a bound `tokio::net::UdpSocket`.
pub struct TokioDatagramSocket {
    socket: tokio::net::UdpSocket,
}

impl TokioDatagramSocket {
    pub fn new(socket: tokio::net::UdpSocket) -> Self {
        TokioDatagramSocket { socket }
    }
}

#[async_trait]
impl DatagramSocket for TokioDatagramSocket {
    async fn send(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), IkeError> {
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }
}

/// Runs user callbacks off the protocol loop (spec §5: "User callbacks are
/// invoked via a user-supplied executor abstraction so that client code
/// never runs on the protocol loop"). The core only ever calls `execute`; it
/// never awaits the callback's own work.
pub trait UserExecutor: Send + Sync {
    fn execute(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Production [`UserExecutor`] that hands callbacks to the Tokio runtime's
/// blocking-friendly task pool, matching the teacher's `tokio::spawn` use
/// throughout `session.rs`.
pub struct TokioUserExecutor;

impl UserExecutor for TokioUserExecutor {
    fn execute(&self, callback: Box<dyn FnOnce() + Send>) {
        tokio::task::spawn_blocking(callback);
    }
}

/// IKE Session lifecycle callbacks (spec §6): `on_opened`/`on_closed`/`on_error`.
pub trait IkeSessionCallback: Send + Sync {
    fn on_opened(&self);
    fn on_closed(&self);
    fn on_error(&self, error: &IkeError);
}

/// Per-Child-Session lifecycle and per-direction transform callbacks (spec §6).
pub trait ChildSessionCallback: Send + Sync {
    fn on_opened(&self);
    fn on_closed(&self);
    fn on_ipsec_transform_created(&self, direction: Direction, local_spi: u32);
    fn on_ipsec_transform_deleted(&self, direction: Direction, local_spi: u32);
    fn on_error(&self, error: &IkeError);
}

/// EAP callbacks (spec §6): the four outcomes the inner sub-state-machine
/// can produce, surfaced to the embedding application.
pub trait EapCallback: Send + Sync {
    fn on_success(&self, msk: &SecretBytes, emsk: &SecretBytes);
    fn on_fail(&self);
    fn on_response(&self, bytes: &[u8]);
    fn on_error(&self, error: &IkeError);
}

/// Production [`Clock`] backed by `tokio::time`, delivering the token
/// through an `mpsc` channel the caller owns the receiving half of.
pub struct TokioClock {
    sink: tokio::sync::mpsc::UnboundedSender<u64>,
}

impl TokioClock {
    pub fn new(sink: tokio::sync::mpsc::UnboundedSender<u64>) -> Self {
        TokioClock { sink }
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn schedule(&self, delay: Duration, token: u64) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(token);
        });
    }
}
