//! Worker system: supervised periodic units.
//!
//! Core components:
//! - `unit`: the contract a supervised unit implements
//! - `state`: worker state machine (Constructed → Running → Stopped/Failed)
//! - `worker`: runs one unit's actions on a period, counts errors
//! - `manager`: registry with start/stop fan-out, healing and period edits

pub mod manager;
pub mod state;
pub mod unit;
#[allow(clippy::module_inception)]
pub mod worker;

pub use manager::{MIN_WORKER_PERIOD, ManagedWorker, WorkerManager};
pub use state::WorkerState;
pub use unit::Unit;
pub use worker::{MAX_WORKER_ERRORS, Worker, WorkerSummary};
pub(crate) use worker::as_millis;
