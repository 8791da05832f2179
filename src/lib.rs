//! gridlink - real-time multi-agent coordination for smart-grid
//! co-simulation.
//!
//! The protocol core (agents, scheduler, transports, controllers) lives in
//! `gridlink-core` and is re-exported here. This crate adds the local
//! deployment harness: [`sim::Simulation`] builds an allocator plus a fleet
//! of loads on loopback, wires the cross-thread queues and drives the
//! power-flow worker and a controller loop.

pub mod sim;

pub use gridlink_core::*;
