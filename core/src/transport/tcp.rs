//! Stream transport in the router/dealer style.
//!
//! The listener demultiplexes peers by their declared identity: a connecting
//! peer's first length-prefixed frame carries its own endpoint string, every
//! later frame an encoded packet. Outbound, a per-remote client connection
//! is opened lazily, announces the local identity, then drains a per-peer
//! queue so per-peer ordering is preserved. Connections close hard
//! (`SO_LINGER = 0`); lingering sockets have proven to block shutdown.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::codec;
use crate::error::TransportError;
use crate::transport::{IncomingTx, Transport};
use crate::types::{Endpoint, Packet};

const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct TcpTransport {
    local: Mutex<Option<Endpoint>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
    peers: Mutex<HashMap<Endpoint, mpsc::UnboundedSender<Bytes>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            local: Mutex::new(None),
            handle: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn spawn_writer(&self, remote: Endpoint) -> Option<mpsc::UnboundedSender<Bytes>> {
        let handle = self.handle.lock().clone()?;
        let local = self.local.lock().clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        self.tracker.spawn_on(
            async move {
                let addr = match remote.socket_addr() {
                    Ok(addr) => addr,
                    Err(_) => {
                        warn!(%remote, "invalid remote endpoint");
                        return;
                    }
                };
                let stream = match TcpStream::connect(addr).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%remote, error = %err, "tcp connect failed");
                        return;
                    }
                };
                if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
                    debug!(%remote, error = %err, "failed to set linger");
                }
                let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
                if let Some(local) = local {
                    let identity = Bytes::copy_from_slice(local.as_str().as_bytes());
                    if framed.send(identity).await.is_err() {
                        return;
                    }
                }
                while let Some(frame) = rx.recv().await {
                    if let Err(err) = framed.send(frame).await {
                        warn!(%remote, error = %err, "tcp send failed");
                        break;
                    }
                }
            },
            &handle,
        );
        Some(tx)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, local: Endpoint, incoming: IncomingTx) -> Result<(), TransportError> {
        if self.listener.lock().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let addr = local
            .socket_addr()
            .map_err(|_| TransportError::InvalidEndpoint(local.to_string()))?;
        let listener = TcpListener::bind(addr).await.map_err(|source| TransportError::Bind {
            endpoint: local.to_string(),
            source,
        })?;

        let tracker = self.tracker.clone();
        let token = self.shutdown.clone();
        let accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                debug!(error = %err, "tcp accept failed");
                                continue;
                            }
                        };
                        tracker.spawn(serve_peer(stream, peer_addr.to_string(), incoming.clone(), token.clone()));
                    }
                }
            }
        });

        *self.local.lock() = Some(local);
        *self.handle.lock() = Some(tokio::runtime::Handle::current());
        *self.listener.lock() = Some(accept);
        Ok(())
    }

    fn send(&self, packet: Packet, remote: &Endpoint) {
        if self.handle.lock().is_none() {
            warn!(%remote, "tcp transport not started; dropping packet");
            return;
        }
        let frame = match codec::encode(&packet) {
            Ok(frame) => Bytes::from(frame),
            Err(err) => {
                warn!(%remote, error = %err, "refusing to send unencodable packet");
                return;
            }
        };

        let mut peers = self.peers.lock();
        let tx = match peers.get(remote) {
            Some(tx) => tx.clone(),
            None => match self.spawn_writer(remote.clone()) {
                Some(tx) => {
                    peers.insert(remote.clone(), tx.clone());
                    tx
                }
                None => return,
            },
        };
        if tx.send(frame.clone()).is_err() {
            // Writer died (connect failure or a broken pipe); retry once on
            // a fresh connection.
            peers.remove(remote);
            if let Some(tx) = self.spawn_writer(remote.clone()) {
                let _ = tx.send(frame);
                peers.insert(remote.clone(), tx);
            }
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.peers.lock().clear();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
            // Wait for the accept loop to die so the port is really released.
            let _ = listener.await;
        }
        self.tracker.close();
        if tokio::time::timeout(STOP_GRACE, self.tracker.wait()).await.is_err() {
            warn!("tcp transport tasks did not stop within the grace period");
        }
    }
}

async fn serve_peer(stream: TcpStream, peer_addr: String, incoming: IncomingTx, token: CancellationToken) {
    let mut framed = FramedRead::new(stream, LengthDelimitedCodec::new());

    // The first frame declares who is talking; everything after is payload.
    let identity = tokio::select! {
        _ = token.cancelled() => return,
        first = framed.next() => match first {
            Some(Ok(frame)) => match std::str::from_utf8(&frame) {
                Ok(name) => Endpoint::new(name),
                Err(_) => {
                    warn!(%peer_addr, "invalid identity preamble");
                    return;
                }
            },
            Some(Err(err)) => {
                debug!(%peer_addr, error = %err, "tcp read error before preamble");
                return;
            }
            None => return,
        },
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => match codec::decode(&frame) {
                    Ok(packet) => {
                        if incoming.send((packet, identity.clone())).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(peer = %identity, error = %err, "dropping malformed frame"),
                },
                Some(Err(err)) => {
                    debug!(peer = %identity, error = %err, "tcp read error");
                    break;
                }
                None => break,
            },
        }
    }
}
