//! Resume state kept next to the tables.
//!
//! A tier's RTT label is measured live and jitters between runs, so the label
//! a tier was first written under is recorded here together with the
//! configurations whose tables are complete. A resumed run reuses the stored
//! label instead of probing again.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub tiers: Vec<TierCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCheckpoint {
    pub latency: String,
    pub rtt_label: String,
    /// Configurations whose table for this tier is complete.
    #[serde(default)]
    pub completed: Vec<String>,
}

impl Checkpoint {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Reads the checkpoint in `dir`; a missing file is an empty checkpoint.
    pub fn load(dir: &Path) -> io::Result<Self> {
        let text = match fs::read_to_string(Self::path(dir)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Replaces the checkpoint in `dir` atomically.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let path = Self::path(dir);
        let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let mut out = io::BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp, &path)
    }

    pub fn tier_label(&self, latency: &str) -> Option<&str> {
        self.tier(latency).map(|t| t.rtt_label.as_str())
    }

    pub fn is_complete(&self, latency: &str, configuration: &str) -> bool {
        self.tier(latency)
            .map_or(false, |t| t.completed.iter().any(|c| c == configuration))
    }

    /// Records the label a tier is written under. A changed label drops the
    /// tier's completed tables, since they were written under the old one.
    pub fn set_tier_label(&mut self, latency: &str, rtt_label: &str) {
        match self.tiers.iter_mut().find(|t| t.latency == latency) {
            Some(tier) if tier.rtt_label == rtt_label => {}
            Some(tier) => {
                tier.rtt_label = rtt_label.to_string();
                tier.completed.clear();
            }
            None => self.tiers.push(TierCheckpoint {
                latency: latency.to_string(),
                rtt_label: rtt_label.to_string(),
                completed: Vec::new(),
            }),
        }
    }

    /// Marks a table complete. The tier must already have a label.
    pub fn mark_complete(&mut self, latency: &str, configuration: &str) {
        if let Some(tier) = self.tiers.iter_mut().find(|t| t.latency == latency) {
            if !tier.completed.iter().any(|c| c == configuration) {
                tier.completed.push(configuration.to_string());
            }
        }
    }

    fn tier(&self, latency: &str) -> Option<&TierCheckpoint> {
        self.tiers.iter().find(|t| t.latency == latency)
    }
}
