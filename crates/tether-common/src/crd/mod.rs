//! Custom Resource Definitions for tether
//!
//! The `TetherAgent` resource describes one agent installation and carries the
//! status document that the operator's conditions and generations live in.

mod agent;

pub use agent::{NodePlacement, TetherAgent, TetherAgentSpec, TetherAgentStatus};
