pub mod benchmark;
pub mod packet;
pub mod risk;
pub mod tracker;

pub use benchmark::BenchmarkSource;
pub use packet::{CumulativeRiskMetrics, DailyPerf, MinutePerf, PerfPacket, PositionSnapshot, RiskReport};
pub use tracker::{Metric, MetricsTracker, standard_metrics};
