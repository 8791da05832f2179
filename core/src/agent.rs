//! Generic agent runtime: one transport, one scheduler, one endpoint.
//!
//! The runtime is the glue between the wire and the worker. Incoming frames
//! are dispatched onto the scheduler so that all protocol state stays
//! single-writer; outgoing packets pass through the optional loss model
//! first. Role-specific behavior lives in `crate::allocator` and
//! `crate::load`, which install their receive handlers here.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::GridError;
use crate::scheduler::{EventHandle, Scheduler};
use crate::transport::{self, Transport, TransportMode};
use crate::types::{Endpoint, Packet};

/// Upper bound on how long a cross-thread `schedule` call may wait for the
/// runtime to come up.
const SCHEDULE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Role tag of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Allocator,
    Load,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Allocator => "allocator",
            AgentKind::Load => "load",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stochastic loss model applied symmetrically on send and receive.
///
/// `rate` is the delivery rate: each packet independently survives with
/// probability `rate` and is silently dropped otherwise.
pub struct ErrorModel {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl ErrorModel {
    pub fn new(rate: f64) -> Self {
        Self { rate, rng: Mutex::new(StdRng::from_entropy()) }
    }

    /// Seeded variant for reproducible loss experiments.
    pub fn seeded(rate: f64, seed: u64) -> Self {
        Self { rate, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Draws the per-packet loss decision.
    pub fn corrupt(&self) -> bool {
        self.rng.lock().gen::<f64>() >= self.rate
    }
}

/// Blocking latch for callers crossing a thread boundary before the runtime
/// has started.
struct Latch {
    flag: Mutex<bool>,
    cvar: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self { flag: Mutex::new(false), cvar: Condvar::new() }
    }

    fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cvar.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cvar.wait_for(&mut flag, deadline - now);
        }
        *flag
    }
}

/// Handler the role-specific state machines install; invoked on the
/// scheduler worker for every accepted inbound packet.
pub type ReceiveHandler = Arc<dyn Fn(Packet, Endpoint) + Send + Sync>;

pub struct AgentRuntime {
    kind: AgentKind,
    local: Endpoint,
    scheduler: Arc<Scheduler>,
    transport: Box<dyn Transport>,
    error_model: Arc<Mutex<Option<ErrorModel>>>,
    handler: Arc<Mutex<Option<ReceiveHandler>>>,
    started: Latch,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

impl AgentRuntime {
    pub fn new(kind: AgentKind, local: Endpoint, mode: TransportMode) -> Self {
        Self {
            kind,
            local,
            scheduler: Arc::new(Scheduler::new()),
            transport: transport::make(mode),
            error_model: Arc::new(Mutex::new(None)),
            handler: Arc::new(Mutex::new(None)),
            started: Latch::new(),
            dispatch: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Monotonic seconds since the agent was constructed; handed to
    /// embedder callbacks so they never need their own clock.
    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn set_error_model(&self, model: Option<ErrorModel>) {
        *self.error_model.lock() = model;
    }

    pub fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts transport and scheduler, then the dispatch task that moves
    /// inbound packets onto the worker. Signals readiness to concurrent
    /// `schedule` callers last.
    pub async fn run(&self) -> Result<(), GridError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.transport.start(self.local.clone(), tx).await?;
        self.scheduler.start();

        let scheduler = self.scheduler.clone();
        let error_model = self.error_model.clone();
        let handler = self.handler.clone();
        let local = self.local.clone();
        let kind = self.kind;
        let dispatch = tokio::spawn(async move {
            while let Some((packet, src)) = rx.recv().await {
                let dropped = error_model.lock().as_ref().map(ErrorModel::corrupt).unwrap_or(false);
                if dropped {
                    info!(agent = %local, "packet error occurred on receive");
                    continue;
                }
                let handler = match handler.lock().clone() {
                    Some(handler) => handler,
                    None => {
                        warn!(agent = %local, %kind, "no receive handler installed; dropping packet");
                        continue;
                    }
                };
                scheduler.schedule(Duration::ZERO, move || handler(packet, src));
            }
        });
        *self.dispatch.lock() = Some(dispatch);

        self.started.set();
        info!(agent = %self.local, kind = %self.kind, "agent runtime started");
        Ok(())
    }

    /// Applies the loss model, then hands the packet to the transport.
    pub fn send(&self, packet: Packet, remote: &Endpoint) {
        let dropped = self.error_model.lock().as_ref().map(ErrorModel::corrupt).unwrap_or(false);
        if dropped {
            info!(agent = %self.local, %remote, "packet error occurred on send");
            return;
        }
        self.transport.send(packet, remote);
    }

    /// Schedules work on the agent's worker, waiting (bounded) for startup
    /// when called from another thread before `run` has completed.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> EventHandle {
        if !self.started.wait(SCHEDULE_READY_TIMEOUT) {
            warn!(agent = %self.local, "runtime not started yet; scheduling anyway");
        }
        self.scheduler.schedule(delay, action)
    }

    /// Stops scheduler, transport and dispatch. Idempotent; subsequent
    /// operations become no-ops.
    pub async fn stop(&self) {
        self.scheduler.shutdown().await;
        self.transport.stop().await;
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
        self.handler.lock().take();
        info!(agent = %self.local, kind = %self.kind, "agent runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_model_rate_one_never_drops() {
        let model = ErrorModel::seeded(1.0, 42);
        assert!((0..1000).all(|_| !model.corrupt()));
    }

    #[test]
    fn error_model_rate_zero_always_drops() {
        let model = ErrorModel::seeded(0.0, 42);
        assert!((0..1000).all(|_| model.corrupt()));
    }

    #[test]
    fn error_model_long_run_fraction_matches_rate() {
        let model = ErrorModel::seeded(0.8, 7);
        let n = 20_000;
        let dropped = (0..n).filter(|_| model.corrupt()).count();
        let fraction = dropped as f64 / n as f64;
        assert!((fraction - 0.2).abs() < 0.02, "drop fraction {fraction}");
    }

    #[test]
    fn latch_wait_times_out_and_succeeds() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.wait(Duration::from_millis(30)));

        let latch2 = latch.clone();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            latch2.set();
        });
        assert!(latch.wait(Duration::from_secs(2)));
        setter.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runtime_round_trips_a_packet_to_its_handler() {
        use crate::types::{Packet, PacketKind};

        let local = Endpoint::from("127.0.0.1:46021");
        let peer = Endpoint::from("127.0.0.1:46022");

        let runtime = Arc::new(AgentRuntime::new(AgentKind::Allocator, local.clone(), TransportMode::Udp));
        let seen: Arc<Mutex<Vec<Packet>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runtime.set_receive_handler(Arc::new(move |packet, _src| sink.lock().push(packet)));
        runtime.run().await.unwrap();

        let sender = AgentRuntime::new(AgentKind::Load, peer.clone(), TransportMode::Udp);
        sender.set_receive_handler(Arc::new(|_, _| {}));
        sender.run().await.unwrap();

        let packet = Packet::empty(PacketKind::Stop, peer.clone(), Some(local.clone()));
        sender.send(packet.clone(), &local);

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.lock().as_slice(), &[packet]);

        sender.stop().await;
        runtime.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_model_rate_zero_blocks_all_sends() {
        let local = Endpoint::from("127.0.0.1:46023");
        let peer = Endpoint::from("127.0.0.1:46024");

        let receiver = Arc::new(AgentRuntime::new(AgentKind::Allocator, local.clone(), TransportMode::Udp));
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        receiver.set_receive_handler(Arc::new(move |_, _| *sink.lock() += 1));
        receiver.run().await.unwrap();

        let sender = AgentRuntime::new(AgentKind::Load, peer.clone(), TransportMode::Udp);
        sender.set_receive_handler(Arc::new(|_, _| {}));
        sender.set_error_model(Some(ErrorModel::seeded(0.0, 1)));
        sender.run().await.unwrap();

        for _ in 0..20 {
            sender.send(
                crate::types::Packet::empty(crate::types::PacketKind::Leave, peer.clone(), None),
                &local,
            );
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock(), 0);

        sender.stop().await;
        receiver.stop().await;
    }
}
