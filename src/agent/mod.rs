//! Agent module: the driver that schedules heartbeats, telemetry and worker
//! supervision.

pub mod agent_loop;

pub use agent_loop::{Agent, AgentDeps, AgentOp};
