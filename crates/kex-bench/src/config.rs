use std::path::{Path, PathBuf};
use std::time::Duration;

use kex_netem::impairment::{DEFAULT_NETEM_LIMIT, DEFAULT_RATE};
use kex_netem::probe::DEFAULT_ECHO_COUNT;
use kex_netem::{NetworkScope, ShapingLimits};
use serde::Deserialize;
use thiserror::Error;

/// Worker count of the timer pool. The full-scale reference run used 40.
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_MEASUREMENTS_PER_TIMER: usize = 100;
pub const DEFAULT_TIMERS: usize = 50;
pub const DEFAULT_TIMER_PROGRAM: &str = "./s_timer.o";
pub const DEFAULT_OUTPUT_DIR: &str = "data";
pub const DEFAULT_PROBE_PEER: &str = "10.0.0.1";

pub const DEFAULT_CONFIGURATIONS: [&str; 3] = [
    "PQ-TLS-1-3-KYBER512",
    "PQ-TLS-1-3-KYBER768",
    "PQ-TLS-1-3-KYBER1024",
];

pub const DEFAULT_LATENCIES: [&str; 5] = [
    "0.08ms", // localhost
    "0.69ms", // PDX => PDX
    "21ms",   // PDX => SFO
    "133ms",  // PDX => LHR
    "230ms",  // PDX => BOM
];

pub const DEFAULT_LOSS_RATES: [f64; 8] = [0.0, 0.1, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfigInput {
    pub output_dir: Option<PathBuf>,
    pub pool_size: Option<usize>,
    pub measurements_per_timer: Option<usize>,
    pub timers: Option<usize>,
    pub sudo: Option<bool>,
    pub configurations: Option<Vec<String>>,
    pub latencies: Option<Vec<String>>,
    pub loss_rates: Option<Vec<f64>>,
    pub timer: TimerConfigInput,
    pub client: ScopeConfigInput,
    pub server: ScopeConfigInput,
    pub probe: ProbeConfigInput,
    pub shaping: ShapingConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimerConfigInput {
    pub program: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScopeConfigInput {
    pub namespace: Option<String>,
    pub interface: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub peer: Option<String>,
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShapingConfigInput {
    pub limit: Option<u32>,
    pub rate: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub program: String,
    pub working_dir: PathBuf,
    /// Per-invocation deadline; `None` waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub peer: String,
    pub count: u32,
}

/// Validated run parameters, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub pool_size: usize,
    pub measurements_per_timer: usize,
    pub timers: usize,
    pub configurations: Vec<String>,
    pub latencies: Vec<String>,
    /// Strictly ascending.
    pub loss_rates: Vec<f64>,
    pub timer: TimerConfig,
    pub client: NetworkScope,
    pub server: NetworkScope,
    pub probe: ProbeConfig,
    pub shaping: ShapingLimits,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            pool_size: DEFAULT_POOL_SIZE,
            measurements_per_timer: DEFAULT_MEASUREMENTS_PER_TIMER,
            timers: DEFAULT_TIMERS,
            configurations: DEFAULT_CONFIGURATIONS.iter().map(|s| s.to_string()).collect(),
            latencies: DEFAULT_LATENCIES.iter().map(|s| s.to_string()).collect(),
            loss_rates: DEFAULT_LOSS_RATES.to_vec(),
            timer: TimerConfig {
                program: DEFAULT_TIMER_PROGRAM.to_string(),
                working_dir: PathBuf::from("."),
                timeout: None,
            },
            client: NetworkScope::new("cli_ns", "cli_ve", "10.0.0.2/24"),
            server: NetworkScope::new("srv_ns", "srv_ve", "10.0.0.1/24"),
            probe: ProbeConfig {
                peer: DEFAULT_PROBE_PEER.to_string(),
                count: DEFAULT_ECHO_COUNT,
            },
            shaping: ShapingLimits {
                limit: DEFAULT_NETEM_LIMIT,
                rate: DEFAULT_RATE.to_string(),
            },
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        RunConfigInput::from_toml_str(input)?.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        RunConfigInput::load(path)?.resolve()
    }

    /// Samples collected per (latency, configuration, loss rate).
    pub fn samples_per_row(&self) -> usize {
        self.timers * self.measurements_per_timer
    }
}

impl RunConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let defaults = RunConfig::default();

        let pool_size = positive("pool_size", self.pool_size, defaults.pool_size)?;
        let measurements_per_timer = positive(
            "measurements_per_timer",
            self.measurements_per_timer,
            defaults.measurements_per_timer,
        )?;
        let timers = positive("timers", self.timers, defaults.timers)?;

        let configurations = self.configurations.unwrap_or(defaults.configurations);
        if configurations.is_empty() {
            return Err(invalid("at least one configuration is required"));
        }
        for cfg in &configurations {
            if cfg.is_empty() || cfg.contains(['/', '\\']) || cfg.chars().any(char::is_whitespace)
            {
                return Err(invalid(format!(
                    "configuration {cfg:?} must be non-empty without whitespace or path separators"
                )));
            }
        }

        let latencies = self.latencies.unwrap_or(defaults.latencies);
        if latencies.is_empty() {
            return Err(invalid("at least one latency is required"));
        }
        if let Some(bad) = latencies
            .iter()
            .find(|d| d.is_empty() || d.chars().any(char::is_whitespace))
        {
            return Err(invalid(format!("latency {bad:?} is not a netem delay")));
        }

        let loss_rates = self.loss_rates.unwrap_or(defaults.loss_rates);
        validate_loss_rates(&loss_rates)?;

        let timeout = match self.timer.timeout_secs {
            None => defaults.timer.timeout,
            Some(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(_) => {
                    return Err(invalid(format!(
                        "timer.timeout_secs {secs} is out of range"
                    )))
                }
            },
            Some(secs) => {
                return Err(invalid(format!(
                    "timer.timeout_secs must be positive, got {secs}"
                )))
            }
        };
        let timer = TimerConfig {
            program: non_empty(self.timer.program).unwrap_or(defaults.timer.program),
            working_dir: self.timer.working_dir.unwrap_or(defaults.timer.working_dir),
            timeout,
        };

        let sudo = self.sudo.unwrap_or(true);
        let client = self.client.resolve(defaults.client).with_sudo(sudo);
        let server = self.server.resolve(defaults.server).with_sudo(sudo);
        if client.namespace == server.namespace || client.interface == server.interface {
            return Err(invalid("client and server scopes must be distinct"));
        }

        let probe = ProbeConfig {
            peer: non_empty(self.probe.peer).unwrap_or(defaults.probe.peer),
            count: positive_u32("probe.count", self.probe.count, defaults.probe.count)?,
        };

        let shaping = ShapingLimits {
            limit: positive_u32("shaping.limit", self.shaping.limit, defaults.shaping.limit)?,
            rate: non_empty(self.shaping.rate).unwrap_or(defaults.shaping.rate),
        };

        Ok(RunConfig {
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            pool_size,
            measurements_per_timer,
            timers,
            configurations,
            latencies,
            loss_rates,
            timer,
            client,
            server,
            probe,
            shaping,
        })
    }
}

impl ScopeConfigInput {
    fn resolve(self, fallback: NetworkScope) -> NetworkScope {
        NetworkScope::new(
            &non_empty(self.namespace).unwrap_or(fallback.namespace),
            &non_empty(self.interface).unwrap_or(fallback.interface),
            &non_empty(self.address).unwrap_or(fallback.address),
        )
    }
}

fn validate_loss_rates(loss_rates: &[f64]) -> Result<(), ConfigError> {
    if loss_rates.is_empty() {
        return Err(invalid("at least one loss rate is required"));
    }
    if let Some(bad) = loss_rates
        .iter()
        .find(|l| !l.is_finite() || **l < 0.0 || **l > 100.0)
    {
        return Err(invalid(format!("loss rate {bad} is outside 0..=100")));
    }
    if let Some(pair) = loss_rates.windows(2).find(|w| w[0] >= w[1]) {
        return Err(invalid(format!(
            "loss rates must be strictly ascending ({} then {})",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

fn positive(name: &str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(invalid(format!("{name} must be at least 1"))),
        Some(v) => Ok(v),
    }
}

fn positive_u32(name: &str, value: Option<u32>, default: u32) -> Result<u32, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(invalid(format!("{name} must be at least 1"))),
        Some(v) => Ok(v),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
