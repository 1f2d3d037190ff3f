use std::path::PathBuf;

use kex_netem::{CommandFailure, ProbeFailure};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TimerFailure {
    #[error("timer invocation failed: {0}")]
    Command(#[from] CommandFailure),
    #[error("timer output token {token:?} is not a number")]
    NotNumeric { token: String },
    #[error("timer returned {actual} samples, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("timer worker {worker} panicked")]
    WorkerPanicked { worker: usize },
    #[error("{missing} timer tasks never reported back")]
    WorkerLost { missing: usize },
    #[error("timer pool is shut down")]
    PoolClosed,
    /// Skipped because a sibling task of the same collection failed.
    #[error("timer task cancelled")]
    Cancelled,
}

/// A failure inside one step of the tier loops.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("network shaping: {0}")]
    Shaping(#[source] CommandFailure),
    #[error(transparent)]
    Probe(#[from] ProbeFailure),
    #[error(transparent)]
    Timer(#[from] TimerFailure),
    #[error("writing {}: {source}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("measurement requested while shaping was not in effect on both scopes")]
    ConditionUnsettled,
    #[error("RTT label {rtt_label} was already produced by latency {earlier}")]
    DuplicateLabel { rtt_label: String, earlier: String },
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("failed to start timer pool: {0}")]
    PoolStart(#[source] std::io::Error),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run aborted at {}: {source}", describe_triple(.latency, .configuration, .loss_rate))]
    Aborted {
        latency: String,
        configuration: Option<String>,
        loss_rate: Option<f64>,
        #[source]
        source: StageFailure,
    },
}

impl ExperimentError {
    /// The stage failure behind an aborted run, if any.
    pub fn stage(&self) -> Option<&StageFailure> {
        match self {
            ExperimentError::Aborted { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn describe_triple(latency: &str, configuration: &Option<String>, loss_rate: &Option<f64>) -> String {
    let mut out = format!("latency {latency}");
    if let Some(cfg) = configuration {
        out.push_str(&format!(", configuration {cfg}"));
    }
    if let Some(loss) = loss_rate {
        out.push_str(&format!(", loss {loss}%"));
    }
    out
}
