//! Agent-side operator for Tether
//!
//! Keeps the agent's managed resources applied and reports whether the
//! credentials it uses to reach the hub still work.
//!
//! Related crates:
//! - `tether-common`: errors, status types, retry and telemetry helpers

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod guard;
pub mod health;
pub mod resources;
pub mod runner;

pub use config::OperatorConfig;
pub use controller::{
    error_policy, reconcile, sync, AgentClient, AgentClientImpl, Context, SyncOutcome,
};
pub use guard::{ProbeGuard, ProbeLease};
pub use health::HealthProbe;
pub use resources::ApplyEngine;

pub use tether_common::{Error, Result};
