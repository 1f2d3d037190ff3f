//! Handshake latency measurement under emulated WAN conditions.
//!
//! Sweeps a client/server namespace pair through latency tiers and loss
//! rates, and at every point collects handshake timings from an external
//! timing program through a fixed-size worker pool. Results land in one CSV
//! table per (configuration, measured RTT).

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod timer;
pub mod writer;

pub use config::{ConfigError, RunConfig, RunConfigInput};
pub use error::{ExperimentError, StageFailure, TimerFailure};
pub use orchestrator::{ExperimentOrchestrator, Phase, RunSummary};
pub use pool::MeasurementPool;
pub use timer::{HandshakeTimer, SampleVector};
pub use writer::ResultWriter;
