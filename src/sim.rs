//! Local deployment harness.
//!
//! Builds the agents of a co-simulation on one machine and wires the three
//! cross-thread hand-offs: the bounded allocations queue feeding the
//! power-flow worker, the per-load single-slot measure channels flowing
//! back, and the bounded voltage queue feeding the controller. Producers
//! drop with a warning when a bounded queue is full; the measure slots
//! overwrite unread values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use gridlink_core::{
    AllocatorConfig, Endpoint, GridModel, LoadConfig, LoadFlow, LoadUpdate, NetworkAllocator,
    NetworkLoad, OpfStrategy, PiStrategy, TransportMode, VoltageObservation,
};

const QUEUE_DEPTH: usize = 1000;

/// One co-simulation: a single allocator, any number of loads, and the
/// queue plumbing between them, the solver and the controller.
pub struct Simulation {
    mode: TransportMode,
    allocator: Option<NetworkAllocator>,
    loads: Vec<NetworkLoad>,
    joined: Arc<AtomicUsize>,
    updates_tx: mpsc::Sender<LoadUpdate>,
    updates_rx: Option<mpsc::Receiver<LoadUpdate>>,
    voltage_tx: mpsc::Sender<VoltageObservation>,
    voltage_rx: Option<mpsc::Receiver<VoltageObservation>>,
    measures: Arc<Mutex<HashMap<Endpoint, watch::Sender<f64>>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Simulation {
    pub fn new(mode: TransportMode) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(QUEUE_DEPTH);
        let (voltage_tx, voltage_rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            mode,
            allocator: None,
            loads: Vec::new(),
            joined: Arc::new(AtomicUsize::new(0)),
            updates_tx,
            updates_rx: Some(updates_rx),
            voltage_tx,
            voltage_rx: Some(voltage_rx),
            measures: Arc::new(Mutex::new(HashMap::new())),
            workers: Vec::new(),
        }
    }

    pub fn allocator(&self) -> Option<&NetworkAllocator> {
        self.allocator.as_ref()
    }

    pub fn loads(&self) -> &[NetworkLoad] {
        &self.loads
    }

    /// Creates and starts the allocator, wiring every reported measure into
    /// the controller's voltage queue.
    pub async fn create_allocator(&mut self, addr: impl Into<Endpoint>) -> Result<NetworkAllocator> {
        self.create_allocator_with(addr, AllocatorConfig::default()).await
    }

    pub async fn create_allocator_with(
        &mut self,
        addr: impl Into<Endpoint>,
        config: AllocatorConfig,
    ) -> Result<NetworkAllocator> {
        if self.allocator.is_some() {
            anyhow::bail!("simulation already has an allocator");
        }
        let allocator = NetworkAllocator::with_config(addr, self.mode, config);
        let voltage_tx = self.voltage_tx.clone();
        allocator.set_allocation_updated(Arc::new(move |report, node| {
            let observation = VoltageObservation { node: node.clone(), report: report.clone() };
            if voltage_tx.try_send(observation).is_err() {
                warn!(node = %node, "voltage queue full; dropping observation");
            }
        }));
        allocator.run().await.context("starting allocator")?;
        self.allocator = Some(allocator.clone());
        Ok(allocator)
    }

    /// Creates and starts a load, giving it a single-slot measure channel
    /// and a measure callback that feeds the allocations queue.
    pub async fn create_load(&mut self, addr: impl Into<Endpoint>) -> Result<NetworkLoad> {
        self.create_load_with(addr, LoadConfig::default()).await
    }

    pub async fn create_load_with(
        &mut self,
        addr: impl Into<Endpoint>,
        config: LoadConfig,
    ) -> Result<NetworkLoad> {
        let load = NetworkLoad::with_config(addr, self.mode, config);

        let (measure_tx, measure_rx) = watch::channel(0.0f64);
        self.measures.lock().insert(load.local().clone(), measure_tx);
        let slot = Mutex::new(measure_rx);
        let updates_tx = self.updates_tx.clone();
        load.set_update_measure(Arc::new(move |effective, node, now| {
            let update = LoadUpdate { timestamp: now, node: node.clone(), p: effective.p, q: effective.q };
            if updates_tx.try_send(update).is_err() {
                warn!(node = %node, "allocations queue full; dropping update");
            }
            let mut slot = slot.lock();
            match slot.has_changed() {
                Ok(true) => Some(*slot.borrow_and_update()),
                _ => None,
            }
        }));

        let joined = self.joined.clone();
        load.set_joined_callback(Arc::new(move |_, _| {
            joined.fetch_add(1, Ordering::SeqCst);
        }));

        load.run().await.context("starting load")?;
        self.loads.push(load.clone());
        Ok(load)
    }

    /// Points every load at the allocator.
    pub fn join_all(&self) -> Result<()> {
        let allocator = self.allocator.as_ref().context("allocator not created")?;
        for load in &self.loads {
            load.send_join(allocator.local());
        }
        Ok(())
    }

    /// Waits until every load has completed its join handshake.
    pub async fn wait_network_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.joined.load(Ordering::SeqCst) >= self.loads.len() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Spawns the power-flow worker: drains the allocations queue on
    /// `period`, re-solves, and publishes fresh per-node voltages into the
    /// measure slots.
    pub fn spawn_load_flow<S: LoadFlow + 'static>(&mut self, mut solver: S, period: Duration) -> Result<()> {
        let mut updates_rx = self.updates_rx.take().context("load-flow worker already attached")?;
        let measures = self.measures.clone();
        let worker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                let mut updates = Vec::new();
                while let Ok(update) = updates_rx.try_recv() {
                    updates.push(update);
                }
                if updates.is_empty() {
                    continue;
                }
                match solver.solve(&updates) {
                    Ok(voltages) => {
                        let measures = measures.lock();
                        for (node, vm_pu) in voltages {
                            if let Some(slot) = measures.get(&node) {
                                let _ = slot.send(vm_pu);
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "load flow failed"),
                }
            }
        });
        self.workers.push(worker);
        Ok(())
    }

    /// Spawns the PI control loop on its duty cycle.
    pub fn spawn_pi_controller(&mut self, mut strategy: PiStrategy, duty_cycle: Duration) -> Result<()> {
        let allocator = self.allocator.clone().context("allocator not created")?;
        let mut voltage_rx = self.voltage_rx.take().context("controller already attached")?;
        let worker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(duty_cycle);
            loop {
                ticks.tick().await;
                let mut observations = Vec::new();
                while let Ok(observation) = voltage_rx.try_recv() {
                    observations.push(observation);
                }
                strategy.step(&allocator, observations);
            }
        });
        self.workers.push(worker);
        Ok(())
    }

    /// Spawns the OPF control loop on its duty cycle.
    pub fn spawn_opf_controller<G: GridModel + 'static>(
        &mut self,
        mut strategy: OpfStrategy<G>,
        duty_cycle: Duration,
    ) -> Result<()> {
        let allocator = self.allocator.clone().context("allocator not created")?;
        let mut voltage_rx = self.voltage_rx.take().context("controller already attached")?;
        let worker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(duty_cycle);
            loop {
                ticks.tick().await;
                let mut observations = Vec::new();
                while let Ok(observation) = voltage_rx.try_recv() {
                    observations.push(observation);
                }
                strategy.step(&allocator, observations);
            }
        });
        self.workers.push(worker);
        Ok(())
    }

    /// Shuts the network down (allocator first, which stops every load),
    /// then kills the worker loops.
    pub async fn stop(&mut self) {
        if let Some(allocator) = &self.allocator {
            allocator.stop_network().await;
        }
        for load in &self.loads {
            load.stop().await;
        }
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}
