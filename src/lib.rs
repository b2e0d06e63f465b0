//! NuvlaEdge agent core: supervised workers, monitors and telemetry.

pub mod agent;
pub mod coe;
pub mod commissioner;
pub mod config;
pub mod error;
pub mod monitor;
pub mod nuvla;
pub mod status;
pub mod telemetry;
pub mod timed_actions;
pub mod worker;

pub use error::{Error, Result};
