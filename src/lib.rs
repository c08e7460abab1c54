// === Public Modules (The Canonical Paths) ===
pub mod assets;
pub mod calendar;
pub mod data;
pub mod error;
pub mod finance;
pub mod metrics;
pub mod report;
pub mod sim;

// === Private Implementation Details ===
mod macros;

// === Convenience ===
pub use crate::error::{TradesimError, TradesimResult};
pub use crate::sim::{
    SimulationDriver, SimulationParams, SimulationResult, Strategy,
};
