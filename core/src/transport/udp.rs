//! Connectionless datagram transport.
//!
//! One socket bound on the local endpoint; every packet travels as a single
//! datagram (protocol packets are well under any sane MTU). Socket-level
//! errors such as ICMP unreachable notifications are swallowed with a log
//! line, matching the best-effort contract.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::error::TransportError;
use crate::transport::{IncomingTx, Transport};
use crate::types::{Endpoint, Packet};

const RECV_BUF_LEN: usize = 1 << 16;

pub struct UdpTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            handle: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&self, local: Endpoint, incoming: IncomingTx) -> Result<(), TransportError> {
        if self.socket.lock().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let addr = local
            .socket_addr()
            .map_err(|_| TransportError::InvalidEndpoint(local.to_string()))?;
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(|source| TransportError::Bind {
            endpoint: local.to_string(),
            source,
        })?);

        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_LEN];
            loop {
                let (len, from) = match reader_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        debug!(error = %err, "udp recv error");
                        continue;
                    }
                };
                match codec::decode(&buf[..len]) {
                    Ok(packet) => {
                        let src = Endpoint::new(from.to_string());
                        if incoming.send((packet, src)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%from, error = %err, "dropping malformed datagram"),
                }
            }
        });

        *self.socket.lock() = Some(socket);
        *self.handle.lock() = Some(tokio::runtime::Handle::current());
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    fn send(&self, packet: Packet, remote: &Endpoint) {
        let socket = match self.socket.lock().as_ref() {
            Some(socket) => socket.clone(),
            None => {
                warn!(%remote, "udp transport not started; dropping packet");
                return;
            }
        };
        let handle = match self.handle.lock().as_ref() {
            Some(handle) => handle.clone(),
            None => return,
        };
        let frame = match codec::encode(&packet) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%remote, error = %err, "refusing to send unencodable packet");
                return;
            }
        };
        let addr: SocketAddr = match remote.socket_addr() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(%remote, "invalid remote endpoint");
                return;
            }
        };
        handle.spawn(async move {
            if let Err(err) = socket.send_to(&frame, addr).await {
                warn!(%addr, error = %err, "udp send failed");
            }
        });
    }

    async fn stop(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
            // Wait for the task to die so the socket is really released.
            let _ = reader.await;
        }
        self.socket.lock().take();
        self.handle.lock().take();
    }
}
