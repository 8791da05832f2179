//! The power-flow solver boundary.
//!
//! The core never inspects the grid model; it only pushes observed load
//! updates in and reads voltages or optimized set-points out through these
//! traits. The embedding application supplies the implementations.

use thiserror::Error;

use crate::types::Endpoint;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("load flow did not converge")]
    LoadFlowDiverged,
    #[error("optimal power flow did not converge")]
    OpfDiverged,
    #[error("{0}")]
    Other(String),
}

/// One load-level p/q update, as queued by the loads' measure callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadUpdate {
    /// Monotonic seconds (the reporting agent's clock).
    pub timestamp: f64,
    pub node: Endpoint,
    /// Active power in kW.
    pub p: f64,
    /// Reactive power in kvar.
    pub q: f64,
}

/// Plain load-flow: apply the queued updates, re-solve, report per-node bus
/// voltage magnitudes in p.u.
pub trait LoadFlow: Send {
    fn solve(&mut self, updates: &[LoadUpdate]) -> Result<Vec<(Endpoint, f64)>, SolverError>;
}

/// Optimal-power-flow view of the grid, one snapshot per controller.
pub trait GridModel: Send {
    /// Records a node's reported active power.
    fn update_load(&mut self, node: &Endpoint, p: f64);

    /// Records a producing node's reported cap as its production bound
    /// (forecast mode).
    fn update_forecast(&mut self, node: &Endpoint, min_p: f64);

    /// The nodes the optimizer may curtail.
    fn controllables(&self) -> Vec<Endpoint>;

    /// Runs the optimization; on convergence returns `(node, p, q)` per
    /// controllable.
    fn run_opf(&mut self) -> Result<Vec<(Endpoint, f64, f64)>, SolverError>;
}
