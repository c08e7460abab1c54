pub mod clock;
pub mod context;
pub mod driver;
pub mod params;
pub mod schedule;
pub mod strategy;

pub use clock::{ClockEvent, ClockEventKind, SimulationClock};
pub use context::{Context, Phase};
pub use driver::{SimulationDriver, SimulationResult, StrategyErrorRecord};
pub use params::{BenchmarkSpec, SimulationParams};
pub use schedule::{DateRule, EventRule, Schedule, TimeRule};
pub use strategy::Strategy;
