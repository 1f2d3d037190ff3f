use std::sync::Arc;

use crate::command::{CommandFailure, CommandRunner, Invocation};
use crate::topology::NetworkScope;

/// Netem queue limit (packets) used for every shaping change.
pub const DEFAULT_NETEM_LIMIT: u32 = 1000;
/// Rate cap used for every shaping change.
pub const DEFAULT_RATE: &str = "1000mbit";

/// Queue limit and rate cap shared by every profile of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingLimits {
    pub limit: u32,
    pub rate: String,
}

impl Default for ShapingLimits {
    fn default() -> Self {
        Self {
            limit: DEFAULT_NETEM_LIMIT,
            rate: DEFAULT_RATE.to_string(),
        }
    }
}

/// Netem parameters applied to one scope's interface.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapingProfile {
    pub loss_percent: f64,
    /// Unit-suffixed delay passed through to netem, e.g. `"21ms"`.
    pub delay: String,
    pub limits: ShapingLimits,
}

impl ShapingProfile {
    pub fn new(loss_percent: f64, delay: &str) -> Self {
        Self::with_limits(loss_percent, delay, ShapingLimits::default())
    }

    pub fn with_limits(loss_percent: f64, delay: &str, limits: ShapingLimits) -> Self {
        Self {
            loss_percent,
            delay: delay.to_string(),
            limits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscVerb {
    Add,
    Change,
}

impl QdiscVerb {
    fn as_str(self) -> &'static str {
        match self {
            QdiscVerb::Add => "add",
            QdiscVerb::Change => "change",
        }
    }
}

/// Builds `tc` arguments: `qdisc <verb> dev <iface> root netem limit N
/// [loss X%] delay D rate R`.
///
/// A zero loss omits the loss clause entirely. netem treats "no loss clause"
/// and "loss 0%" differently, so the two must not be conflated.
pub fn netem_args(interface: &str, profile: &ShapingProfile, verb: QdiscVerb) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        verb.as_str().into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
        "limit".into(),
        profile.limits.limit.to_string(),
    ];

    if profile.loss_percent != 0.0 {
        args.push("loss".into());
        args.push(format!("{}%", profile.loss_percent));
    }

    args.push("delay".into());
    args.push(profile.delay.clone());
    args.push("rate".into());
    args.push(profile.limits.rate.clone());
    args
}

/// Shaping state of the client/server pair.
///
/// Owned by whoever sequences condition changes; a measurement may only run
/// while the pair is [`LinkCondition::InEffect`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LinkCondition {
    #[default]
    Unknown,
    /// One side may already carry the profile, the other not yet.
    Transitioning(ShapingProfile),
    InEffect(ShapingProfile),
}

impl LinkCondition {
    pub fn in_effect(&self) -> Option<&ShapingProfile> {
        match self {
            LinkCondition::InEffect(profile) => Some(profile),
            _ => None,
        }
    }
}

/// Issues netem shaping changes to namespace interfaces.
pub struct NetworkConditionController {
    runner: Arc<dyn CommandRunner>,
    limits: ShapingLimits,
}

impl NetworkConditionController {
    pub fn new(runner: Arc<dyn CommandRunner>, limits: ShapingLimits) -> Self {
        Self { runner, limits }
    }

    pub fn profile(&self, loss_percent: f64, delay: &str) -> ShapingProfile {
        ShapingProfile::with_limits(loss_percent, delay, self.limits.clone())
    }

    /// Changes the root qdisc of one scope's interface.
    pub fn apply(
        &self,
        scope: &NetworkScope,
        loss_percent: f64,
        delay: &str,
    ) -> Result<(), CommandFailure> {
        let profile = self.profile(loss_percent, delay);
        let args = netem_args(&scope.interface, &profile, QdiscVerb::Change);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let argv = scope.exec_argv("tc", &args);
        let invocation = Invocation::new(&argv);
        tracing::info!(command = %invocation.command_line(), "exec");
        self.runner.run(&invocation).map(drop)
    }

    /// Applies the same profile to the client, then the server.
    ///
    /// `condition` is `Transitioning` while the two changes are in flight and
    /// becomes `InEffect` only once both succeeded. On failure it stays
    /// `Transitioning`.
    pub fn apply_pair(
        &self,
        condition: &mut LinkCondition,
        client: &NetworkScope,
        server: &NetworkScope,
        loss_percent: f64,
        delay: &str,
    ) -> Result<(), CommandFailure> {
        let profile = self.profile(loss_percent, delay);
        *condition = LinkCondition::Transitioning(profile.clone());
        self.apply(client, loss_percent, delay)?;
        self.apply(server, loss_percent, delay)?;
        tracing::debug!(loss_percent, delay, "shaping in effect on both scopes");
        *condition = LinkCondition::InEffect(profile);
        Ok(())
    }
}
