//! Echo-based round-trip measurement used to label each latency tier.

use std::sync::Arc;

use thiserror::Error;

use crate::command::{CommandFailure, CommandRunner, Invocation};
use crate::topology::NetworkScope;

/// Echoes sent per probe.
pub const DEFAULT_ECHO_COUNT: u32 = 30;

#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("echo probe failed: {0}")]
    Command(#[from] CommandFailure),
    #[error("echo probe produced no summary line")]
    MissingSummary,
    #[error("malformed echo summary line: {line:?}")]
    Malformed { line: String },
    #[error("average RTT {field:?} in echo summary is not a number")]
    NotNumeric { field: String },
}

/// Derives the file-name-safe RTT label from `ping` output.
///
/// Reads the last line (`rtt min/avg/max/mdev = a/b/c/d ms`), takes the
/// fifth `/`-separated field (the average) and replaces its decimal point
/// with `p`: `21.345` becomes `21p345`.
pub fn rtt_label(ping_output: &str) -> Result<String, ProbeFailure> {
    let line = ping_output.lines().last().ok_or(ProbeFailure::MissingSummary)?;
    if line.trim().is_empty() {
        return Err(ProbeFailure::MissingSummary);
    }

    let field = line.split('/').nth(4).ok_or_else(|| ProbeFailure::Malformed {
        line: line.to_string(),
    })?;
    let field = field.trim();
    match field.parse::<f64>() {
        Ok(avg) if avg.is_finite() && avg >= 0.0 => Ok(field.replace('.', "p")),
        _ => Err(ProbeFailure::NotNumeric {
            field: field.to_string(),
        }),
    }
}

/// Measures the mean RTT from inside a scope to a fixed peer.
pub struct LatencyProbe {
    runner: Arc<dyn CommandRunner>,
    peer: String,
    count: u32,
}

impl LatencyProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, peer: &str, count: u32) -> Self {
        Self {
            runner,
            peer: peer.to_string(),
            count,
        }
    }

    pub fn measure_rtt_label(&self, scope: &NetworkScope) -> Result<String, ProbeFailure> {
        let count = self.count.to_string();
        let argv = scope.exec_argv("ping", &[&self.peer, "-c", &count]);
        let invocation = Invocation::new(&argv);
        tracing::info!(command = %invocation.command_line(), "exec");
        let output = self.runner.run(&invocation)?;
        rtt_label(&output)
    }
}
