//! Datagram- and stream-oriented transports between agent endpoints.
//!
//! Both variants present the same surface: `start` binds the local endpoint
//! and forwards decoded packets into the runtime's incoming channel, `send`
//! is non-blocking best-effort, `stop` releases sockets within a bounded
//! grace period. Handler code never runs on a socket-reading task. Loss
//! injection is the runtime's concern, not the transport's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::{Endpoint, Packet};

mod tcp;
mod udp;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Channel end the transports deliver `(packet, wire source)` pairs into.
pub type IncomingTx = mpsc::UnboundedSender<(Packet, Endpoint)>;

/// Wire mode shared by every agent in a deployment; the two modes do not
/// interoperate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Udp,
    Tcp,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds `local` and spawns the reader task(s).
    async fn start(&self, local: Endpoint, incoming: IncomingTx) -> Result<(), TransportError>;

    /// Serializes and ships a packet. Failures are logged and swallowed;
    /// the caller stays unaware by design.
    fn send(&self, packet: Packet, remote: &Endpoint);

    /// Releases sockets. Idempotent.
    async fn stop(&self);
}

/// Builds the transport for the given mode.
pub fn make(mode: TransportMode) -> Box<dyn Transport> {
    match mode {
        TransportMode::Udp => Box::new(UdpTransport::new()),
        TransportMode::Tcp => Box::new(TcpTransport::new()),
    }
}
