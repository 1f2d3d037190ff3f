//! Single invocations of the external handshake timing program.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kex_netem::{CommandRunner, Invocation, NetworkScope};

use crate::config::RunConfig;
use crate::error::TimerFailure;

/// Handshake latencies in the unit the timing program reports.
pub type SampleVector = Vec<f64>;

/// Runs `<program> <configuration> <count>` inside the client scope.
pub struct HandshakeTimer {
    runner: Arc<dyn CommandRunner>,
    scope: NetworkScope,
    program: String,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl HandshakeTimer {
    pub fn new(runner: Arc<dyn CommandRunner>, scope: NetworkScope, program: &str) -> Self {
        Self {
            runner,
            scope,
            program: program.to_string(),
            working_dir: PathBuf::from("."),
            timeout: None,
        }
    }

    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &RunConfig) -> Self {
        Self::new(runner, config.client.clone(), &config.timer.program)
            .in_dir(config.timer.working_dir.clone())
            .with_timeout(config.timer.timeout)
    }

    pub fn in_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn time_once(
        &self,
        configuration: &str,
        sample_count: usize,
    ) -> Result<SampleVector, TimerFailure> {
        let count = sample_count.to_string();
        let argv = self.scope.exec_argv(&self.program, &[configuration, &count]);
        let invocation = Invocation::new(&argv)
            .in_dir(&self.working_dir)
            .with_timeout(self.timeout);
        tracing::debug!(command = %invocation.command_line(), "exec");

        let output = self.runner.run(&invocation)?;
        parse_samples(&output, sample_count)
    }
}

/// Parses one line of comma-separated latencies, requiring exactly
/// `expected` values.
pub fn parse_samples(output: &str, expected: usize) -> Result<SampleVector, TimerFailure> {
    let line = output.trim();
    if line.is_empty() {
        return Err(TimerFailure::CountMismatch {
            expected,
            actual: 0,
        });
    }

    let samples = line
        .split(',')
        .map(|token| {
            token.trim().parse::<f64>().map_err(|_| TimerFailure::NotNumeric {
                token: token.to_string(),
            })
        })
        .collect::<Result<SampleVector, _>>()?;

    if samples.len() != expected {
        return Err(TimerFailure::CountMismatch {
            expected,
            actual: samples.len(),
        });
    }
    Ok(samples)
}
