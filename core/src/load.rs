//! A peripheral load agent.
//!
//! Models a consuming or producing grid node: joins an allocator (with
//! fixed-period retry), periodically refreshes its local cap and measure,
//! reports its state, and enforces whatever set-point the allocator sends,
//! clamped by the local cap.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentKind, AgentRuntime, ErrorModel};
use crate::config::LoadConfig;
use crate::error::GridError;
use crate::scheduler::EventHandle;
use crate::transport::TransportMode;
use crate::types::{Ack, Allocation, Endpoint, Packet, PacketKind, Payload, Report};

/// Produces the load's next local cap. Must not block: it runs on the
/// agent's worker.
pub type GenerateAllocations = Arc<dyn Fn(&Endpoint, &Allocation, f64) -> Option<Allocation> + Send + Sync>;

/// Maps the effective allocation to a fresh measure (typically by querying
/// the embedding simulation). Must not block: it runs on the agent's worker.
pub type UpdateMeasure = Arc<dyn Fn(&Allocation, &Endpoint, f64) -> Option<f64> + Send + Sync>;

/// Fired once per successful join handshake with `(local, remote)`.
pub type JoinedCallback = Arc<dyn Fn(&Endpoint, &Endpoint) + Send + Sync>;

#[derive(Default)]
struct LoadCallbacks {
    generate_allocations: Option<GenerateAllocations>,
    update_measure: Option<UpdateMeasure>,
    joined: Option<JoinedCallback>,
}

struct LoadState {
    remote: Option<Endpoint>,
    curr_allocation: Allocation,
    max_allocation: Allocation,
    curr_measure: f64,
    join_ack_timer: Option<EventHandle>,
    get_allocation_task: Option<EventHandle>,
    update_measure_task: Option<EventHandle>,
    report_measure_task: Option<EventHandle>,
    stopped: bool,
}

struct LoadInner {
    runtime: AgentRuntime,
    config: LoadConfig,
    state: Mutex<LoadState>,
    callbacks: Mutex<LoadCallbacks>,
}

/// Handle to a load agent; clones share the same agent.
#[derive(Clone)]
pub struct NetworkLoad {
    inner: Arc<LoadInner>,
}

impl NetworkLoad {
    pub fn new(local: impl Into<Endpoint>, mode: TransportMode) -> Self {
        Self::with_config(local, mode, LoadConfig::default())
    }

    pub fn with_config(local: impl Into<Endpoint>, mode: TransportMode, config: LoadConfig) -> Self {
        Self {
            inner: Arc::new(LoadInner {
                runtime: AgentRuntime::new(AgentKind::Load, local.into(), mode),
                config,
                state: Mutex::new(LoadState {
                    remote: None,
                    curr_allocation: Allocation::default(),
                    max_allocation: Allocation::unbounded(),
                    curr_measure: 0.0,
                    join_ack_timer: None,
                    get_allocation_task: None,
                    update_measure_task: None,
                    report_measure_task: None,
                    stopped: false,
                }),
                callbacks: Mutex::new(LoadCallbacks::default()),
            }),
        }
    }

    pub fn local(&self) -> &Endpoint {
        self.inner.runtime.local()
    }

    pub fn remote(&self) -> Option<Endpoint> {
        self.inner.state.lock().remote.clone()
    }

    pub fn curr_allocation(&self) -> Allocation {
        self.inner.state.lock().curr_allocation
    }

    pub fn max_allocation(&self) -> Allocation {
        self.inner.state.lock().max_allocation
    }

    pub fn curr_measure(&self) -> f64 {
        self.inner.state.lock().curr_measure
    }

    pub fn is_running(&self) -> bool {
        !self.inner.state.lock().stopped
    }

    pub fn set_generate_allocations(&self, callback: GenerateAllocations) {
        self.inner.callbacks.lock().generate_allocations = Some(callback);
    }

    pub fn set_update_measure(&self, callback: UpdateMeasure) {
        self.inner.callbacks.lock().update_measure = Some(callback);
    }

    pub fn set_joined_callback(&self, callback: JoinedCallback) {
        self.inner.callbacks.lock().joined = Some(callback);
    }

    pub fn set_error_model(&self, model: Option<ErrorModel>) {
        self.inner.runtime.set_error_model(model);
    }

    /// Starts the agent and its three periodic tasks.
    pub async fn run(&self) -> Result<(), GridError> {
        let inner = self.inner.clone();
        self.inner
            .runtime
            .set_receive_handler(Arc::new(move |packet, src| LoadInner::receive_handle(&inner, packet, src)));
        self.inner.runtime.run().await?;

        LoadInner::schedule_get_allocation(&self.inner, self.inner.config.generate_allocations_period);
        LoadInner::schedule_update_measure(&self.inner);
        LoadInner::schedule_report_measure(&self.inner);
        Ok(())
    }

    /// Injects work onto the load's worker.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> EventHandle {
        self.inner.runtime.schedule(delay, action)
    }

    /// Sends a join request and arms the retry timer.
    pub fn send_join(&self, dst: &Endpoint) {
        LoadInner::send_join(&self.inner, dst);
    }

    /// Announces departure; the allocator drops this node from its registry.
    pub fn send_leave(&self, dst: &Endpoint) {
        info!(load = %self.local(), allocator = %dst, "leaving");
        let packet = Packet::empty(PacketKind::Leave, self.local().clone(), Some(dst.clone()));
        self.inner.runtime.send(packet, dst);
    }

    /// Cancels timers and periodic tasks and stops the runtime. Idempotent.
    pub async fn stop(&self) {
        LoadInner::stop(&self.inner).await;
    }
}

impl LoadInner {
    fn receive_handle(inner: &Arc<Self>, packet: Packet, src: Endpoint) {
        let local = inner.runtime.local();
        if let Some(dst) = &packet.dst {
            if dst != local {
                warn!(load = %local, dst = %dst, "packet not addressed to this node");
                return;
            }
        }
        debug!(load = %local, kind = %packet.kind, src = %packet.src, wire_src = %src, "handling packet");

        match packet.kind {
            PacketKind::JoinAck => {
                {
                    let mut state = inner.state.lock();
                    state.remote = Some(packet.src.clone());
                    if let Some(timer) = state.join_ack_timer.take() {
                        timer.cancel();
                    }
                }
                info!(load = %local, allocator = %packet.src, "joined allocator");
                let joined = inner.callbacks.lock().joined.clone();
                if let Some(joined) = joined {
                    joined(local, &packet.src);
                }
            }
            PacketKind::Allocation => {
                let Some(allocation) = packet.payload.allocation().copied() else {
                    warn!(load = %local, "allocation packet without allocation payload");
                    return;
                };
                info!(load = %local, aid = allocation.aid, p = allocation.p, "received allocation");
                let measure = inner.state.lock().curr_measure;
                let ack = Packet::new(
                    PacketKind::AllocationAck,
                    Payload::Ack(Ack { allocation, measure }),
                    local.clone(),
                    Some(packet.src.clone()),
                );
                inner.runtime.send(ack, &packet.src);
                // The new set-point implicitly supersedes the previous one.
                inner.state.lock().curr_allocation = allocation;
            }
            PacketKind::Stop => {
                info!(load = %local, src = %packet.src, "received stop");
                let ack = Packet::empty(PacketKind::StopAck, local.clone(), Some(packet.src.clone()));
                inner.runtime.send(ack, &packet.src);
                let stopping = inner.clone();
                tokio::spawn(async move { LoadInner::stop(&stopping).await });
            }
            other => warn!(load = %local, kind = %other, "unhandled packet kind"),
        }
    }

    fn send_join(inner: &Arc<Self>, dst: &Endpoint) {
        let local = inner.runtime.local().clone();
        info!(load = %local, allocator = %dst, "joining");
        let report = {
            let state = inner.state.lock();
            Report {
                allocation: state.curr_allocation,
                max_allocation: None,
                measure: state.curr_measure,
            }
        };
        let packet = Packet::new(PacketKind::Join, Payload::Report(report), local, Some(dst.clone()));

        // Fixed-period retry until the allocator answers or we are stopped.
        let retry = inner.clone();
        let retry_dst = dst.clone();
        let log_dst = dst.clone();
        let timer = inner.runtime.scheduler().schedule_with_callbacks(
            inner.config.join_ack_timeout,
            move || info!(allocator = %log_dst, "no join ack before timeout"),
            vec![Box::new(move || {
                if !retry.state.lock().stopped {
                    LoadInner::send_join(&retry, &retry_dst);
                }
            })],
        );
        {
            let mut state = inner.state.lock();
            if let Some(previous) = state.join_ack_timer.replace(timer) {
                previous.cancel();
            }
        }
        inner.runtime.send(packet, dst);
    }

    fn schedule_get_allocation(inner: &Arc<Self>, delay: Duration) {
        let task = inner.clone();
        let handle = inner.runtime.scheduler().schedule(delay, move || {
            let next = task.get_allocation();
            if !task.state.lock().stopped {
                Self::schedule_get_allocation(&task, next);
            }
        });
        inner.state.lock().get_allocation_task = Some(handle);
    }

    /// Queries the allocation source for a new local cap; returns the delay
    /// until the next refresh.
    fn get_allocation(&self) -> Duration {
        let fallback = self.config.generate_allocations_period;
        let callback = self.callbacks.lock().generate_allocations.clone();
        let Some(callback) = callback else {
            debug!(load = %self.runtime.local(), "no source defined to generate allocations");
            return fallback;
        };
        let curr = self.state.lock().curr_allocation;
        match callback(self.runtime.local(), &curr, self.runtime.now_secs()) {
            Some(generated) => {
                debug!(load = %self.runtime.local(), p = generated.p, duration = generated.duration, "new local cap");
                self.state.lock().max_allocation = generated;
                if generated.duration > 0.0 {
                    Duration::from_secs_f64(generated.duration)
                } else {
                    fallback
                }
            }
            None => fallback,
        }
    }

    fn schedule_update_measure(inner: &Arc<Self>) {
        let task = inner.clone();
        let handle = inner.runtime.scheduler().schedule(inner.config.update_measure_period, move || {
            task.update_measure();
            if !task.state.lock().stopped {
                Self::schedule_update_measure(&task);
            }
        });
        inner.state.lock().update_measure_task = Some(handle);
    }

    fn update_measure(&self) {
        let callback = self.callbacks.lock().update_measure.clone();
        let Some(callback) = callback else { return };
        let effective = self.effective_allocation();
        // Invoked without holding the state lock; the callback may call
        // back into this agent.
        if let Some(measure) = callback(&effective, self.runtime.local(), self.runtime.now_secs()) {
            self.state.lock().curr_measure = measure;
            debug!(load = %self.runtime.local(), measure, "new measure");
        }
    }

    fn schedule_report_measure(inner: &Arc<Self>) {
        let task = inner.clone();
        let handle = inner.runtime.scheduler().schedule(inner.config.report_measure_period, move || {
            task.report_measure();
            if !task.state.lock().stopped {
                Self::schedule_report_measure(&task);
            }
        });
        inner.state.lock().report_measure_task = Some(handle);
    }

    fn report_measure(&self) {
        let (remote, report) = {
            let state = self.state.lock();
            let Some(remote) = state.remote.clone() else {
                debug!(load = %self.runtime.local(), "not reporting, remote not defined yet");
                return;
            };
            let effective = state.curr_allocation.capped_by(state.max_allocation);
            (
                remote,
                Report {
                    allocation: effective,
                    max_allocation: Some(state.max_allocation),
                    measure: state.curr_measure,
                },
            )
        };
        debug!(load = %self.runtime.local(), allocator = %remote, measure = report.measure, "reporting");
        let packet = Packet::new(
            PacketKind::CurrAllocation,
            Payload::Report(report),
            self.runtime.local().clone(),
            None,
        );
        self.runtime.send(packet, &remote);
    }

    /// The set-point actually enforced: the current allocation clamped by
    /// the local cap.
    fn effective_allocation(&self) -> Allocation {
        let state = self.state.lock();
        state.curr_allocation.capped_by(state.max_allocation)
    }

    async fn stop(inner: &Arc<Self>) {
        {
            let mut state = inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.remote = None;
            for timer in [
                state.join_ack_timer.take(),
                state.get_allocation_task.take(),
                state.update_measure_task.take(),
                state.report_measure_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.cancel();
            }
        }
        inner.runtime.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn drops_packets_addressed_elsewhere() {
        let load = NetworkLoad::new("127.0.0.1:46041", TransportMode::Udp);
        load.run().await.unwrap();

        let stranger = Packet::empty(
            PacketKind::JoinAck,
            Endpoint::from("127.0.0.1:46042"),
            Some(Endpoint::from("127.0.0.1:9999")),
        );
        LoadInner::receive_handle(&load.inner, stranger, Endpoint::from("127.0.0.1:46042"));
        assert_eq!(load.remote(), None);

        load.stop().await;
        assert!(!load.is_running());
        // Stopping twice is a no-op.
        load.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn adopting_an_allocation_keeps_the_cap() {
        let load = NetworkLoad::new("127.0.0.1:46043", TransportMode::Udp);
        load.run().await.unwrap();

        let allocator = Endpoint::from("127.0.0.1:46044");
        let allocation = Allocation::new(5, 4.0, 0.5, 10.0);
        let packet = Packet::new(
            PacketKind::Allocation,
            Payload::Allocation(allocation),
            allocator.clone(),
            Some(load.local().clone()),
        );
        LoadInner::receive_handle(&load.inner, packet, allocator);
        assert_eq!(load.curr_allocation(), allocation);
        assert_eq!(load.inner.effective_allocation(), allocation);

        // A tighter cap clamps the effective set-point but not the stored one.
        load.inner.state.lock().max_allocation = Allocation::new(0, 2.0, 0.0, 1.0);
        assert_eq!(load.inner.effective_allocation(), Allocation::new(0, 2.0, 0.0, 1.0));
        assert_eq!(load.curr_allocation(), allocation);

        load.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_allocations_sets_the_cap_and_cadence() {
        let load = NetworkLoad::new("127.0.0.1:46045", TransportMode::Udp);
        load.set_generate_allocations(Arc::new(|_, _, _| Some(Allocation::new(0, -8.0, 0.0, 7.5))));
        load.run().await.unwrap();

        let next = load.inner.get_allocation();
        assert_eq!(next, Duration::from_secs_f64(7.5));
        assert_eq!(load.max_allocation(), Allocation::new(0, -8.0, 0.0, 7.5));

        load.stop().await;
    }
}
