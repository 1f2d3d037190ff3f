//! The experiment control loop.
//!
//! For every latency tier: shape both scopes with no loss, probe the RTT to
//! label the tier, then for every configuration fill one table by walking the
//! loss rates in order. Each loss rate reshapes both scopes before the pool
//! measures, so no measurement ever runs against a half-applied condition.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kex_netem::{CommandRunner, LatencyProbe, LinkCondition, NetworkConditionController};
use serde::Serialize;

use crate::checkpoint::Checkpoint;
use crate::config::RunConfig;
use crate::error::{ExperimentError, StageFailure};
use crate::pool::MeasurementPool;
use crate::timer::{HandshakeTimer, SampleVector};
use crate::writer::{ProducedFile, ResultWriter};

/// Name of the run manifest written next to the tables.
pub const MANIFEST_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ConfiguringLatency,
    ProbingRtt,
    ConfiguringLoss,
    Measuring,
    Writing,
    NextLatency,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierFile {
    pub latency: String,
    #[serde(flatten)]
    pub file: ProducedFile,
    /// Already complete in an earlier run and skipped by `--resume`.
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pool_size: usize,
    pub timers: usize,
    pub measurements_per_timer: usize,
    pub configurations: Vec<String>,
    pub latencies: Vec<String>,
    pub loss_rates: Vec<f64>,
    pub files: Vec<TierFile>,
}

impl RunSummary {
    fn new(config: &RunConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            timers: config.timers,
            measurements_per_timer: config.measurements_per_timer,
            configurations: config.configurations.clone(),
            latencies: config.latencies.clone(),
            loss_rates: config.loss_rates.clone(),
            files: Vec::new(),
        }
    }

    pub fn write_manifest(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let mut out = io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()?;
        Ok(path)
    }
}

pub struct ExperimentOrchestrator {
    config: RunConfig,
    controller: NetworkConditionController,
    probe: LatencyProbe,
    pool: MeasurementPool,
    writer: ResultWriter,
    condition: LinkCondition,
    checkpoint: Checkpoint,
    phase: Phase,
    resume: bool,
}

impl ExperimentOrchestrator {
    /// Creates the output directory and starts the timer pool.
    pub fn new(config: RunConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, ExperimentError> {
        let writer = ResultWriter::new(&config.output_dir).map_err(|source| ExperimentError::Io {
            path: config.output_dir.clone(),
            source,
        })?;
        let timer = Arc::new(HandshakeTimer::from_config(runner.clone(), &config));
        let pool =
            MeasurementPool::new(config.pool_size, timer).map_err(ExperimentError::PoolStart)?;
        let controller = NetworkConditionController::new(runner.clone(), config.shaping.clone());
        let probe = LatencyProbe::new(runner, &config.probe.peer, config.probe.count);

        Ok(Self {
            config,
            controller,
            probe,
            pool,
            writer,
            condition: LinkCondition::Unknown,
            checkpoint: Checkpoint::default(),
            phase: Phase::Idle,
            resume: false,
        })
    }

    /// Continue an earlier run in the same output directory: tiers keep the
    /// RTT label they were first written under and completed tables are
    /// skipped.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn condition(&self) -> &LinkCondition {
        &self.condition
    }

    /// Live timer workers; zero once [`run`](Self::run) has returned.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Runs every latency × configuration × loss rate and writes the
    /// manifest. The timer pool is shut down before returning, whatever the
    /// outcome. The first failure aborts the whole run.
    pub fn run(&mut self) -> Result<RunSummary, ExperimentError> {
        let started = Instant::now();
        tracing::info!(
            latencies = self.config.latencies.len(),
            configurations = self.config.configurations.len(),
            loss_rates = self.config.loss_rates.len(),
            samples_per_row = self.config.samples_per_row(),
            pool_size = self.config.pool_size,
            "experiment starting"
        );

        let result = self.run_tiers();
        self.pool.shutdown();

        match &result {
            Ok(summary) => {
                self.enter(Phase::Done);
                tracing::info!(
                    files = summary.files.len(),
                    elapsed = ?started.elapsed(),
                    "experiment complete"
                );
            }
            Err(err) => {
                self.enter(Phase::Failed);
                tracing::error!(error = %err, "experiment aborted");
            }
        }
        result
    }

    fn run_tiers(&mut self) -> Result<RunSummary, ExperimentError> {
        let latencies = self.config.latencies.clone();
        let configurations = self.config.configurations.clone();
        let loss_rates = self.config.loss_rates.clone();
        let mut summary = RunSummary::new(&self.config);
        // RTT label -> latency tier that produced it.
        let mut labelled: HashMap<String, String> = HashMap::new();

        self.checkpoint = if self.resume {
            Checkpoint::load(self.writer.dir()).map_err(|source| ExperimentError::Io {
                path: Checkpoint::path(self.writer.dir()),
                source,
            })?
        } else {
            Checkpoint::default()
        };

        for latency in &latencies {
            let _tier = tracing::info_span!("tier", latency = %latency).entered();

            self.enter(Phase::ConfiguringLatency);
            self.settle(0.0, latency)
                .map_err(|e| aborted(latency, None, None, e))?;

            self.enter(Phase::ProbingRtt);
            let rtt_label = match self.checkpoint.tier_label(latency) {
                Some(label) => {
                    tracing::info!(rtt_label = %label, "tier RTT label kept from earlier run");
                    label.to_string()
                }
                None => {
                    let label = self
                        .probe
                        .measure_rtt_label(&self.config.client)
                        .map_err(|e| aborted(latency, None, None, e.into()))?;
                    tracing::info!(rtt_label = %label, "tier RTT measured");
                    label
                }
            };
            if let Some(earlier) = labelled.insert(rtt_label.clone(), latency.clone()) {
                return Err(aborted(
                    latency,
                    None,
                    None,
                    StageFailure::DuplicateLabel { rtt_label, earlier },
                ));
            }
            self.checkpoint.set_tier_label(latency, &rtt_label);
            self.save_checkpoint(latency, None)?;

            for configuration in &configurations {
                if let Some(file) = self.completed_table(latency, configuration, &rtt_label)? {
                    summary.files.push(file);
                    continue;
                }
                let file = self.fill_table(latency, configuration, &rtt_label, &loss_rates)?;
                self.checkpoint.mark_complete(latency, configuration);
                self.save_checkpoint(latency, Some(configuration.as_str()))?;
                summary.files.push(TierFile {
                    latency: latency.clone(),
                    file,
                    resumed: false,
                });
            }

            self.enter(Phase::NextLatency);
        }

        summary
            .write_manifest(self.writer.dir())
            .map_err(|source| ExperimentError::Io {
                path: self.writer.dir().join(MANIFEST_FILE),
                source,
            })?;
        Ok(summary)
    }

    fn save_checkpoint(
        &self,
        latency: &str,
        configuration: Option<&str>,
    ) -> Result<(), ExperimentError> {
        self.checkpoint.save(self.writer.dir()).map_err(|source| {
            aborted(
                latency,
                configuration,
                None,
                StageFailure::Output {
                    path: Checkpoint::path(self.writer.dir()),
                    source,
                },
            )
        })
    }

    /// With resume enabled, returns the table for this tier if an earlier
    /// run completed it and it is still whole on disk.
    fn completed_table(
        &self,
        latency: &str,
        configuration: &str,
        rtt_label: &str,
    ) -> Result<Option<TierFile>, ExperimentError> {
        if !self.resume || !self.checkpoint.is_complete(latency, configuration) {
            return Ok(None);
        }
        let rows = self
            .writer
            .completed_rows(configuration, rtt_label)
            .map_err(|source| {
                aborted(
                    latency,
                    Some(configuration),
                    None,
                    StageFailure::Output {
                        path: self.writer.final_path(configuration, rtt_label),
                        source,
                    },
                )
            })?;

        match rows {
            Some(rows) if rows == self.config.loss_rates.len() => {
                tracing::info!(configuration, rtt_label, rows, "table complete, skipping");
                Ok(Some(TierFile {
                    latency: latency.to_string(),
                    file: ProducedFile {
                        path: self.writer.final_path(configuration, rtt_label),
                        configuration: configuration.to_string(),
                        rtt_label: rtt_label.to_string(),
                        rows,
                    },
                    resumed: true,
                }))
            }
            _ => Ok(None),
        }
    }

    fn fill_table(
        &mut self,
        latency: &str,
        configuration: &str,
        rtt_label: &str,
        loss_rates: &[f64],
    ) -> Result<ProducedFile, ExperimentError> {
        let mut out = self.writer.open(configuration, rtt_label).map_err(|source| {
            aborted(
                latency,
                Some(configuration),
                None,
                StageFailure::Output {
                    path: self.writer.final_path(configuration, rtt_label),
                    source,
                },
            )
        })?;

        for &loss_rate in loss_rates {
            let fail = |source| aborted(latency, Some(configuration), Some(loss_rate), source);

            // Loss 0 is reapplied here even though the tier was just probed
            // under it.
            self.enter(Phase::ConfiguringLoss);
            self.settle(loss_rate, latency).map_err(fail)?;

            self.enter(Phase::Measuring);
            let samples = self.measure(configuration).map_err(fail)?;

            self.enter(Phase::Writing);
            out.append_row(loss_rate, &samples).map_err(|source| {
                fail(StageFailure::Output {
                    path: out.partial_path().to_path_buf(),
                    source,
                })
            })?;
        }

        let partial = out.partial_path().to_path_buf();
        out.finish().map_err(|source| {
            aborted(
                latency,
                Some(configuration),
                None,
                StageFailure::Output {
                    path: partial,
                    source,
                },
            )
        })
    }

    fn settle(&mut self, loss_rate: f64, delay: &str) -> Result<(), StageFailure> {
        self.controller
            .apply_pair(
                &mut self.condition,
                &self.config.client,
                &self.config.server,
                loss_rate,
                delay,
            )
            .map_err(StageFailure::Shaping)
    }

    fn measure(&self, configuration: &str) -> Result<SampleVector, StageFailure> {
        let profile = self
            .condition
            .in_effect()
            .ok_or(StageFailure::ConditionUnsettled)?;
        tracing::info!(
            configuration,
            loss_percent = profile.loss_percent,
            delay = %profile.delay,
            timers = self.config.timers,
            "measuring"
        );
        let samples = self.pool.collect(
            configuration,
            self.config.timers,
            self.config.measurements_per_timer,
        )?;
        Ok(samples)
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }
}

fn aborted(
    latency: &str,
    configuration: Option<&str>,
    loss_rate: Option<f64>,
    source: StageFailure,
) -> ExperimentError {
    ExperimentError::Aborted {
        latency: latency.to_string(),
        configuration: configuration.map(str::to_string),
        loss_rate,
        source,
    }
}
