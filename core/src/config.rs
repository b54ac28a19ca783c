//! Configuration for schedulers and the counting barrier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use testfan_common::error::{CommonError, ErrorContext, Result};

use crate::grouping::Grouping;

/// Distribution mode, named after the `--dist` option values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistMode {
    #[default]
    Load,
    LoadScope,
    LoadFile,
    LoadGroup,
    LoadScopeShuffled,
    SingleCollect,
    IsoScope,
    CustomGroup,
}

impl DistMode {
    pub const ALL: [DistMode; 8] = [
        DistMode::Load,
        DistMode::LoadScope,
        DistMode::LoadFile,
        DistMode::LoadGroup,
        DistMode::LoadScopeShuffled,
        DistMode::SingleCollect,
        DistMode::IsoScope,
        DistMode::CustomGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DistMode::Load => "load",
            DistMode::LoadScope => "loadscope",
            DistMode::LoadFile => "loadfile",
            DistMode::LoadGroup => "loadgroup",
            DistMode::LoadScopeShuffled => "loadscopeshuffled",
            DistMode::SingleCollect => "singlecollect",
            DistMode::IsoScope => "isoscope",
            DistMode::CustomGroup => "customgroup",
        }
    }

    /// Default grouping of the mode.
    pub fn grouping(&self) -> Grouping {
        match self {
            DistMode::Load | DistMode::SingleCollect => Grouping::Identity,
            DistMode::LoadScope | DistMode::LoadScopeShuffled | DistMode::IsoScope => {
                Grouping::Scope
            }
            DistMode::LoadFile => Grouping::File,
            DistMode::LoadGroup => Grouping::Label,
            DistMode::CustomGroup => Grouping::Phase,
        }
    }
}

impl fmt::Display for DistMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistMode {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        DistMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                CommonError::configuration_error(format!("unknown distribution mode '{}'", s))
            })
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling policy
    pub mode: DistMode,
    /// Number of collections required before the authoritative one is fixed
    pub expected_workers: usize,
    /// Upper bound on the number of items sent in one refill
    pub max_sched_chunk: Option<usize>,
    /// Seed for the shuffling schedulers; entropy when unset
    pub seed: Option<u64>,
    /// Completions at least this slow defer refilling a busy worker
    pub slow_item_threshold_ms: u64,
    /// Worker limit per `customgroup` phase, keyed by marker
    pub group_workers: BTreeMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: DistMode::default(),
            expected_workers: num_cpus::get(),
            max_sched_chunk: None,
            seed: None,
            slow_item_threshold_ms: 100,
            group_workers: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(mode: DistMode, expected_workers: usize) -> Self {
        Self {
            mode,
            expected_workers,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_sched_chunk(mut self, chunk: usize) -> Self {
        self.max_sched_chunk = Some(chunk);
        self
    }

    /// Run the `marker` phase on at most `workers` workers.
    pub fn with_group_workers(mut self, marker: impl Into<String>, workers: usize) -> Self {
        self.group_workers.insert(marker.into(), workers);
        self
    }

    pub fn slow_item_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_item_threshold_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommonError::configuration_error_with_source("invalid scheduler config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_io_context(|| format!("reading scheduler config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expected_workers == 0 {
            return Err(CommonError::configuration_error(
                "expected_workers must be at least 1",
            ));
        }
        if self.max_sched_chunk == Some(0) {
            return Err(CommonError::configuration_error(
                "max_sched_chunk must be at least 1",
            ));
        }
        if let Some((marker, _)) = self.group_workers.iter().find(|(_, workers)| **workers == 0) {
            return Err(CommonError::configuration_error(format!(
                "group '{}' must run on at least 1 worker",
                marker
            )));
        }
        Ok(())
    }
}

/// Counting barrier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Shared directory visible to every worker
    pub base_dir: PathBuf,
    /// Identifier of the test run, shared by its workers
    pub run_uid: String,
    /// How long to wait for the barrier lock
    pub lock_timeout_secs: u64,
    /// Delay between two lock attempts
    pub poll_interval_ms: u64,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            run_uid: uuid::Uuid::new_v4().simple().to_string(),
            lock_timeout_secs: 90,
            poll_interval_ms: 10,
        }
    }
}

impl BarrierConfig {
    pub fn new(base_dir: impl Into<PathBuf>, run_uid: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            run_uid: run_uid.into(),
            ..Default::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommonError::configuration_error_with_source("invalid barrier config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_io_context(|| format!("reading barrier config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_uid.is_empty() || self.run_uid.contains(['/', '\\']) {
            return Err(CommonError::configuration_error(format!(
                "run_uid '{}' is not a valid directory name",
                self.run_uid
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(CommonError::configuration_error(
                "poll_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }
}
