//! The central allocator agent.
//!
//! Keeps the registry of joined loads, stamps and dispatches allocations
//! with ack timers, and coordinates network shutdown. All registry mutation
//! happens on the agent's worker; the controller reaches in through
//! [`NetworkAllocator::send_allocation`], which re-stamps the allocation id
//! and defers the actual dispatch onto the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentKind, AgentRuntime, ErrorModel};
use crate::config::AllocatorConfig;
use crate::error::GridError;
use crate::scheduler::EventHandle;
use crate::transport::TransportMode;
use crate::types::{Allocation, Endpoint, Packet, PacketKind, Payload, Report};

/// Last reported state of a joined load.
pub type NodeRecord = Report;

/// Callback fired on every `curr_allocation` a load reports.
pub type AllocationUpdated = Arc<dyn Fn(&Report, &Endpoint) + Send + Sync>;

const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

struct AllocatorState {
    nodes: HashMap<Endpoint, NodeRecord>,
    alloc_timers: HashMap<u64, EventHandle>,
    stop_timers: HashMap<Endpoint, EventHandle>,
    allocation_updated: Option<AllocationUpdated>,
    stopping: bool,
}

struct AllocatorInner {
    runtime: AgentRuntime,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    aid_counter: AtomicU64,
}

/// Handle to an allocator agent; clones share the same agent.
#[derive(Clone)]
pub struct NetworkAllocator {
    inner: Arc<AllocatorInner>,
}

impl NetworkAllocator {
    pub fn new(local: impl Into<Endpoint>, mode: TransportMode) -> Self {
        Self::with_config(local, mode, AllocatorConfig::default())
    }

    pub fn with_config(local: impl Into<Endpoint>, mode: TransportMode, config: AllocatorConfig) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                runtime: AgentRuntime::new(AgentKind::Allocator, local.into(), mode),
                config,
                state: Mutex::new(AllocatorState {
                    nodes: HashMap::new(),
                    alloc_timers: HashMap::new(),
                    stop_timers: HashMap::new(),
                    allocation_updated: None,
                    stopping: false,
                }),
                aid_counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn local(&self) -> &Endpoint {
        self.inner.runtime.local()
    }

    pub fn set_allocation_updated(&self, callback: AllocationUpdated) {
        self.inner.state.lock().allocation_updated = Some(callback);
    }

    pub fn set_error_model(&self, model: Option<ErrorModel>) {
        self.inner.runtime.set_error_model(model);
    }

    /// Starts the agent: installs the receive handler and brings up
    /// transport and scheduler.
    pub async fn run(&self) -> Result<(), GridError> {
        let inner = self.inner.clone();
        self.inner
            .runtime
            .set_receive_handler(Arc::new(move |packet, src| AllocatorInner::receive_handle(&inner, packet, src)));
        self.inner.runtime.run().await
    }

    /// Injects work onto the allocator's worker.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> EventHandle {
        self.inner.runtime.schedule(delay, action)
    }

    /// Stamps a fresh allocation id and dispatches the set-point to `nid`.
    /// Safe to call from any thread (the controller's, typically); the wire
    /// send and timer bookkeeping run on the worker. Returns the stamped id.
    pub fn send_allocation(&self, nid: &Endpoint, allocation: Allocation) -> u64 {
        let aid = self.inner.aid_counter.fetch_add(1, Ordering::SeqCst);
        let stamped = Allocation { aid, ..allocation };
        let inner = self.inner.clone();
        let nid = nid.clone();
        self.inner
            .runtime
            .scheduler()
            .schedule(Duration::ZERO, move || AllocatorInner::dispatch_allocation(&inner, nid, stamped));
        aid
    }

    /// Stops every joined load, waits for the registry to drain (bounded by
    /// twice the stop-ack timeout), then stops the agent itself.
    pub async fn stop_network(&self) {
        AllocatorInner::stop_network(&self.inner).await;
    }

    /// Stops this agent only, leaving remote loads running.
    pub async fn stop(&self) {
        self.inner.runtime.stop().await;
    }

    pub fn nodes(&self) -> Vec<Endpoint> {
        self.inner.state.lock().nodes.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.state.lock().nodes.len()
    }

    pub fn node_record(&self, nid: &Endpoint) -> Option<NodeRecord> {
        self.inner.state.lock().nodes.get(nid).cloned()
    }

    /// Whether an allocation is still waiting for its ack.
    pub fn has_pending_ack(&self, aid: u64) -> bool {
        self.inner.state.lock().alloc_timers.contains_key(&aid)
    }
}

impl AllocatorInner {
    fn receive_handle(inner: &Arc<Self>, packet: Packet, src: Endpoint) {
        debug!(allocator = %inner.runtime.local(), kind = %packet.kind, src = %packet.src, "handling packet");
        // The wire source can differ from the declared one (ephemeral UDP
        // ports); the declared endpoint is the node's identity.
        let nid = packet.src.clone();
        match packet.kind {
            PacketKind::Join => {
                let record = record_from(&packet.payload);
                {
                    let mut state = inner.state.lock();
                    // The registry is frozen once shutdown has begun.
                    if state.stopping {
                        debug!(node = %nid, "ignoring join during shutdown");
                        return;
                    }
                    state.nodes.insert(nid.clone(), record);
                }
                info!(node = %nid, "node joined");
                let reply = inner.clone();
                inner.runtime.scheduler().schedule(Duration::ZERO, move || reply.send_join_ack(&nid));
            }
            PacketKind::AllocationAck => {
                let Some(allocation) = packet.payload.allocation().copied() else {
                    warn!(node = %nid, "allocation_ack without allocation payload");
                    return;
                };
                let timer = inner.state.lock().alloc_timers.remove(&allocation.aid);
                match timer {
                    Some(timer) => {
                        timer.cancel();
                        info!(node = %nid, aid = allocation.aid, "allocation acknowledged");
                    }
                    None => warn!(node = %nid, aid = allocation.aid, "ack for unknown or expired allocation"),
                }
            }
            PacketKind::CurrAllocation => {
                let record = record_from(&packet.payload);
                let callback = {
                    let mut state = inner.state.lock();
                    if state.stopping {
                        debug!(node = %nid, "ignoring report during shutdown");
                        return;
                    }
                    state.nodes.insert(nid.clone(), record.clone());
                    state.allocation_updated.clone()
                };
                if let Some(callback) = callback {
                    callback(&record, &nid);
                }
            }
            PacketKind::Leave => {
                inner.state.lock().nodes.remove(&nid);
                info!(node = %nid, "node left");
            }
            PacketKind::Stop => {
                let shutdown = inner.clone();
                tokio::spawn(async move { AllocatorInner::stop_network(&shutdown).await });
            }
            PacketKind::StopAck => {
                debug!(node = %nid, "received stop_ack");
                let mut state = inner.state.lock();
                if let Some(timer) = state.stop_timers.remove(&nid) {
                    timer.cancel();
                }
                state.nodes.remove(&nid);
            }
            other => warn!(node = %src, kind = %other, "unhandled packet kind"),
        }
    }

    fn send_join_ack(&self, dst: &Endpoint) {
        info!(allocator = %self.runtime.local(), node = %dst, "sending join ack");
        let packet = Packet::empty(PacketKind::JoinAck, self.runtime.local().clone(), Some(dst.clone()));
        self.runtime.send(packet, dst);
    }

    fn dispatch_allocation(inner: &Arc<Self>, nid: Endpoint, allocation: Allocation) {
        info!(node = %nid, aid = allocation.aid, p = allocation.p, q = allocation.q, "sending allocation");
        let packet = Packet::new(
            PacketKind::Allocation,
            Payload::Allocation(allocation),
            inner.runtime.local().clone(),
            Some(nid.clone()),
        );
        inner.runtime.send(packet, &nid);

        // Unacknowledged allocations are dropped, not retransmitted; the
        // controller's next tick computes a fresh set-point anyway.
        let expired = inner.clone();
        let timer_nid = nid.clone();
        let timer = inner.runtime.scheduler().schedule(inner.config.alloc_ack_timeout, move || {
            warn!(node = %timer_nid, aid = allocation.aid, "no allocation_ack before timeout");
            expired.state.lock().alloc_timers.remove(&allocation.aid);
        });
        inner.state.lock().alloc_timers.insert(allocation.aid, timer);
    }

    async fn stop_network(inner: &Arc<Self>) {
        {
            let mut state = inner.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
        }
        let targets: Vec<Endpoint> = inner.state.lock().nodes.keys().cloned().collect();
        info!(allocator = %inner.runtime.local(), nodes = targets.len(), "stopping network");

        for nid in &targets {
            let packet = Packet::empty(PacketKind::Stop, inner.runtime.local().clone(), Some(nid.clone()));
            inner.runtime.send(packet, nid);

            let expired = inner.clone();
            let timer_nid = nid.clone();
            let timer = inner.runtime.scheduler().schedule(inner.config.stop_ack_timeout, move || {
                warn!(node = %timer_nid, "no stop_ack before timeout");
                expired.state.lock().stop_timers.remove(&timer_nid);
            });
            inner.state.lock().stop_timers.insert(nid.clone(), timer);
        }

        let deadline = Instant::now() + inner.config.stop_ack_timeout * 2;
        loop {
            {
                let state = inner.state.lock();
                if state.nodes.is_empty() {
                    info!("all nodes stopped");
                    break;
                }
                if state.stop_timers.is_empty() {
                    warn!(remaining = state.nodes.len(), "stop timers exhausted; giving up on stragglers");
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("network shutdown deadline reached");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        inner.runtime.stop().await;
    }
}

/// Builds the registry record out of a `join`/`curr_allocation` payload.
fn record_from(payload: &Payload) -> NodeRecord {
    match payload {
        Payload::Report(report) => report.clone(),
        Payload::Allocation(allocation) => Report { allocation: *allocation, max_allocation: None, measure: 0.0 },
        Payload::Ack(ack) => Report { allocation: ack.allocation, max_allocation: None, measure: ack.measure },
        Payload::Empty => Report::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aids_are_strictly_increasing() {
        let allocator = NetworkAllocator::new("127.0.0.1:46031", TransportMode::Udp);
        let nid = Endpoint::from("127.0.0.1:46032");
        // Without a running worker the dispatches stay queued, but stamping
        // happens at call time and must stay monotonic.
        let aids: Vec<u64> = (0..16)
            .map(|i| allocator.send_allocation(&nid, Allocation::new(0, i as f64, 0.0, 1.0)))
            .collect();
        for pair in aids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn record_from_covers_all_payload_shapes() {
        let allocation = Allocation::new(3, 1.0, 2.0, 3.0);
        let report = Report { allocation, max_allocation: Some(allocation), measure: 1.01 };
        assert_eq!(record_from(&Payload::Report(report.clone())), report);
        assert_eq!(record_from(&Payload::Allocation(allocation)).allocation, allocation);
        assert_eq!(record_from(&Payload::Empty), Report::default());
    }
}
