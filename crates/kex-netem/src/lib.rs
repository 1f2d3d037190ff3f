//! Network condition toolkit for handshake latency experiments.
//!
//! Provides external command execution, Linux network namespace scopes,
//! `tc netem` shaping of a client/server namespace pair, and the echo probe
//! that labels each latency tier with its measured round-trip time.

pub mod command;
pub mod impairment;
pub mod probe;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use command::{CommandFailure, CommandRunner, Invocation, ProcessRunner};
pub use impairment::{LinkCondition, NetworkConditionController, ShapingLimits, ShapingProfile};
pub use probe::{LatencyProbe, ProbeFailure};
pub use topology::NetworkScope;
