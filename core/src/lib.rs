//! Core library for gridlink - real-time multi-agent grid coordination
//!
//! # Architecture
//! - `types` / `codec`: the wire-level data model and its MessagePack framing
//! - `transport`: UDP and router/dealer-style TCP fabrics
//! - `scheduler`: the per-agent single-worker event loop
//! - `agent`: the runtime binding transport + scheduler, with loss injection
//! - `allocator` / `load`: the two protocol state machines
//! - `controller` / `solver`: the voltage control strategies and the
//!   external power-flow boundary

#![deny(unsafe_code)]

pub mod agent;
pub mod allocator;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod load;
pub mod scheduler;
pub mod solver;
pub mod transport;
pub mod types;

pub use agent::{AgentKind, AgentRuntime, ErrorModel, ReceiveHandler};
pub use allocator::{AllocationUpdated, NetworkAllocator, NodeRecord};
pub use codec::CodecError;
pub use config::{AllocatorConfig, LoadConfig};
pub use controller::{ControllerError, OpfStrategy, PiController, PiStrategy, VoltageObservation};
pub use error::{GridError, TransportError};
pub use load::{GenerateAllocations, JoinedCallback, NetworkLoad, UpdateMeasure};
pub use scheduler::{Action, EventHandle, Scheduler};
pub use solver::{GridModel, LoadFlow, LoadUpdate, SolverError};
pub use transport::{Transport, TransportMode};
pub use types::{Ack, Allocation, Endpoint, Packet, PacketError, PacketKind, Payload, Report};
