//! Agent configuration.
//!
//! Defaults mirror the protocol's canonical timings; embedders usually
//! deserialize these from their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Periods and timeouts of a load agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// How often the effective allocation is re-measured.
    pub update_measure_period: Duration,
    /// How often the current state is reported to the allocator.
    pub report_measure_period: Duration,
    /// Fallback cadence of the local allocation generator when it does not
    /// return a duration of its own.
    pub generate_allocations_period: Duration,
    /// How long to wait for a `join_ack` before retrying the join.
    pub join_ack_timeout: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            update_measure_period: Duration::from_secs(1),
            report_measure_period: Duration::from_secs(1),
            generate_allocations_period: Duration::from_secs(2),
            join_ack_timeout: Duration::from_secs(3),
        }
    }
}

/// Timeouts of the allocator agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// How long to wait for an `allocation_ack` before giving up on it.
    pub alloc_ack_timeout: Duration,
    /// How long to wait for each `stop_ack` during network shutdown.
    pub stop_ack_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            alloc_ack_timeout: Duration::from_secs(3),
            stop_ack_timeout: Duration::from_secs(5),
        }
    }
}
