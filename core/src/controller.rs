//! Allocation generators closing the voltage control loop.
//!
//! Two strategies, both driven from outside on a duty cycle with the
//! observations the allocator queued up: a proportional-integral rule that
//! scales generator output, and an OPF-backed rule that asks the external
//! optimizer for feasible set-points. Both are stateless across invocations
//! except for the PI integral term.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::allocator::NetworkAllocator;
use crate::solver::GridModel;
use crate::types::{Allocation, Endpoint, Report};

/// Proportional gain, in 1/V.
pub const DEFAULT_SIGMA: f64 = 5e-2;
/// Integral gain, in 1/(V·s).
pub const DEFAULT_TAU: f64 = 4e-5;

/// Margin below the hard limit at which the PI branch already engages.
const PI_TRIGGER_MARGIN: f64 = 0.01;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("the maximum voltage must be positive: {0}V provided")]
    NegativeVoltageLimit(f64),
}

/// A voltage observation as queued by the allocator's report handler.
#[derive(Debug, Clone)]
pub struct VoltageObservation {
    pub node: Endpoint,
    pub report: Report,
}

/// Keeps the most recent report per endpoint; reports may arrive faster
/// than the controller drains them.
fn coalesce(observations: Vec<VoltageObservation>) -> HashMap<Endpoint, Report> {
    let mut latest = HashMap::with_capacity(observations.len());
    for observation in observations {
        latest.insert(observation.node, observation.report);
    }
    latest
}

/// Proportional-integral controller limiting *active* power production.
///
/// Only generators are controlled: the scale factor `mu` in `[0, 1]` is
/// applied to each generator's maximum production.
pub struct PiController {
    maximum_voltage: f64,
    sigma: f64,
    tau: f64,
    duration: f64,
    integral_error: f64,
    mu: f64,
    next_aid: u64,
}

impl PiController {
    pub fn new(maximum_voltage: f64, duration: f64) -> Result<Self, ControllerError> {
        Self::with_gains(maximum_voltage, DEFAULT_SIGMA, DEFAULT_TAU, duration)
    }

    pub fn with_gains(
        maximum_voltage: f64,
        sigma: f64,
        tau: f64,
        duration: f64,
    ) -> Result<Self, ControllerError> {
        if maximum_voltage < 0.0 {
            return Err(ControllerError::NegativeVoltageLimit(maximum_voltage));
        }
        if !(0.0..=1.0).contains(&sigma) {
            warn!(sigma, "sigma outside the advised [0, 1] range");
        }
        if !(0.0..=1e-3).contains(&tau) {
            warn!(tau, "tau outside the advised [0, 1e-3] range");
        }
        Ok(Self {
            maximum_voltage,
            sigma,
            tau,
            duration,
            integral_error: 0.0,
            mu: 1.0,
            next_aid: 0,
        })
    }

    /// The scale factor computed by the last [`generate`](Self::generate).
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// One controller tick: updates the integral error from the maximal
    /// violation and emits one allocation per generator cap.
    pub fn generate(&mut self, voltages: &[f64], generator_maximum_powers: &[f64]) -> Vec<Allocation> {
        if voltages.is_empty() {
            return self.allocate(generator_maximum_powers);
        }
        let epsilon = voltages.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - self.maximum_voltage;
        self.integral_error = (self.integral_error + epsilon * self.duration).max(0.0);
        self.mu = (1.0 - self.sigma * epsilon - self.tau * self.integral_error).clamp(0.0, 1.0);
        self.allocate(generator_maximum_powers)
    }

    fn allocate(&mut self, generator_maximum_powers: &[f64]) -> Vec<Allocation> {
        generator_maximum_powers
            .iter()
            .map(|p_max| {
                let aid = self.next_aid;
                self.next_aid += 1;
                Allocation::new(aid, self.mu * p_max, 0.0, self.duration)
            })
            .collect()
    }
}

/// PI strategy driver: drains queued observations, decides whether the loop
/// must engage, and pushes the resulting set-points through the allocator.
pub struct PiStrategy {
    controller: PiController,
    max_vm: f64,
    check_limit: bool,
    generators: Vec<(Endpoint, f64)>,
}

impl PiStrategy {
    /// `generators` lists the controllable nodes with their maximum
    /// production (negative kW).
    pub fn new(
        max_vm: f64,
        duty_cycle: f64,
        generators: Vec<(Endpoint, f64)>,
    ) -> Result<Self, ControllerError> {
        Ok(Self {
            controller: PiController::new(max_vm, duty_cycle)?,
            max_vm,
            check_limit: true,
            generators,
        })
    }

    /// Disabling the limit check makes every tick regulate unconditionally.
    pub fn with_check_limit(mut self, check_limit: bool) -> Self {
        self.check_limit = check_limit;
        self
    }

    pub fn step(&mut self, allocator: &NetworkAllocator, observations: Vec<VoltageObservation>) {
        let latest = coalesce(observations);
        let engaged = latest.values().any(|report| report.measure >= self.max_vm - PI_TRIGGER_MARGIN);
        if self.check_limit && !engaged {
            return;
        }
        let voltages: Vec<f64> = latest.values().map(|report| report.measure).collect();
        let caps: Vec<f64> = self.generators.iter().map(|(_, p_max)| *p_max).collect();
        let allocations = self.controller.generate(&voltages, &caps);
        info!(mu = self.controller.mu(), generators = self.generators.len(), "regulating production");
        for ((nid, _), allocation) in self.generators.iter().zip(allocations) {
            allocator.send_allocation(nid, allocation);
        }
    }
}

/// OPF strategy driver: feeds the observation backlog into the grid
/// snapshot and asks the external optimizer for feasible set-points.
pub struct OpfStrategy<G: GridModel> {
    net: G,
    max_vm: f64,
    duty_cycle: f64,
    check_limit: bool,
    forecast: bool,
}

impl<G: GridModel> OpfStrategy<G> {
    pub fn new(net: G, max_vm: f64, duty_cycle: f64) -> Self {
        Self { net, max_vm, duty_cycle, check_limit: true, forecast: true }
    }

    pub fn with_check_limit(mut self, check_limit: bool) -> Self {
        self.check_limit = check_limit;
        self
    }

    pub fn with_forecast(mut self, forecast: bool) -> Self {
        self.forecast = forecast;
        self
    }

    pub fn step(&mut self, allocator: &NetworkAllocator, observations: Vec<VoltageObservation>) {
        let latest = coalesce(observations);
        if latest.is_empty() && self.check_limit {
            return;
        }
        let mut violation = false;
        for (node, report) in &latest {
            self.net.update_load(node, report.allocation.p);
            if self.forecast && report.allocation.p <= 0.0 {
                if let Some(cap) = &report.max_allocation {
                    self.net.update_forecast(node, cap.p);
                }
            }
            if report.measure >= self.max_vm {
                violation = true;
            }
        }
        if self.check_limit && !violation {
            return;
        }

        // Set-points outlive one duty cycle so a single missed solve does
        // not starve the loads.
        let duration = self.duty_cycle * 3.0;
        match self.net.run_opf() {
            Ok(setpoints) => {
                info!(nodes = setpoints.len(), "dispatching optimized set-points");
                for (nid, p, q) in setpoints {
                    allocator.send_allocation(&nid, Allocation::new(0, p, q, duration));
                }
            }
            Err(err) => {
                warn!(error = %err, "optimization failed; curtailing all controllables");
                for nid in self.net.controllables() {
                    allocator.send_allocation(&nid, Allocation::new(0, 0.0, 0.0, duration));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SolverError;

    #[test]
    fn rejects_negative_voltage_limit() {
        assert!(matches!(
            PiController::new(-1.0, 10.0),
            Err(ControllerError::NegativeVoltageLimit(_))
        ));
    }

    #[test]
    fn mu_decreases_monotonically_under_sustained_violation() {
        let max_vm = 1.05;
        let mut controller = PiController::new(max_vm, 1.0).unwrap();
        let mut previous = 1.0;
        let mut mus = Vec::new();
        for _ in 0..10 {
            let allocations = controller.generate(&[max_vm + 0.01], &[-30.0]);
            assert_eq!(allocations.len(), 1);
            let mu = controller.mu();
            assert!(mu < 1.0);
            assert!(mu <= previous, "mu must be non-increasing: {mu} > {previous}");
            previous = mu;
            mus.push(mu);
        }
        assert!(mus[9] < mus[0]);
    }

    #[test]
    fn mu_recovers_once_voltage_drops() {
        let mut controller = PiController::new(1.05, 1.0).unwrap();
        for _ in 0..5 {
            controller.generate(&[1.10], &[-30.0]);
        }
        let depressed = controller.mu();
        assert!(depressed < 1.0);
        for _ in 0..200 {
            controller.generate(&[0.95], &[-30.0]);
        }
        assert!(controller.mu() > depressed);
    }

    #[test]
    fn allocations_scale_generator_caps() {
        let mut controller = PiController::with_gains(1.05, 0.5, 0.0, 2.0).unwrap();
        let allocations = controller.generate(&[1.15], &[-30.0, -10.0]);
        // epsilon = 0.1 -> mu = 1 - 0.5 * 0.1 = 0.95
        assert!((controller.mu() - 0.95).abs() < 1e-9);
        assert!((allocations[0].p - (-28.5)).abs() < 1e-9);
        assert!((allocations[1].p - (-9.5)).abs() < 1e-9);
        assert_eq!(allocations[0].duration, 2.0);
        assert!(allocations[0].aid < allocations[1].aid);
    }

    #[test]
    fn coalesce_keeps_the_most_recent_report() {
        let node = Endpoint::from("127.0.0.1:5100");
        let old = Report { measure: 1.0, ..Report::default() };
        let new = Report { measure: 1.2, ..Report::default() };
        let latest = coalesce(vec![
            VoltageObservation { node: node.clone(), report: old },
            VoltageObservation { node: node.clone(), report: new.clone() },
        ]);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[&node], new);
    }

    struct FailingGrid {
        controllables: Vec<Endpoint>,
    }

    impl GridModel for FailingGrid {
        fn update_load(&mut self, _node: &Endpoint, _p: f64) {}
        fn update_forecast(&mut self, _node: &Endpoint, _min_p: f64) {}
        fn controllables(&self) -> Vec<Endpoint> {
            self.controllables.clone()
        }
        fn run_opf(&mut self) -> Result<Vec<(Endpoint, f64, f64)>, SolverError> {
            Err(SolverError::OpfDiverged)
        }
    }

    #[test]
    fn opf_failure_curtails_all_controllables() {
        use crate::transport::TransportMode;

        let allocator = crate::allocator::NetworkAllocator::new("127.0.0.1:46051", TransportMode::Udp);
        let pv = Endpoint::from("127.0.0.1:46052");
        let mut strategy = OpfStrategy::new(FailingGrid { controllables: vec![pv.clone()] }, 1.05, 10.0);

        let before = allocator.send_allocation(&pv, Allocation::default());
        strategy.step(
            &allocator,
            vec![VoltageObservation {
                node: pv.clone(),
                report: Report { measure: 1.10, ..Report::default() },
            }],
        );
        let after = allocator.send_allocation(&pv, Allocation::default());
        // The safe-mode pass stamped exactly one allocation in between.
        assert_eq!(after, before + 2);
    }
}
