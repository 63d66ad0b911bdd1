use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// How workers are hosted.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionMode {
    /// Worker tasks inside this process.
    #[default]
    #[strum(to_string = "threaded", serialize = "thread", serialize = "t")]
    Threaded,

    /// One child process per worker.
    #[strum(
        to_string = "multi-process",
        serialize = "multiprocess",
        serialize = "process",
        serialize = "p"
    )]
    MultiProcess,
}

impl ExecutionMode {
    pub fn parse(value: &str) -> Result<Self> {
        Self::from_str(value.trim().to_ascii_lowercase().as_str())
            .map_err(|_| Error::InvalidExecutionMode(value.to_string()))
    }
}

impl TryFrom<String> for ExecutionMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ExecutionMode> for String {
    fn from(value: ExecutionMode) -> Self {
        value.to_string()
    }
}

/// Two workers per available core plus one.
#[must_use]
pub fn default_max_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores * 2 + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub duration: Duration,
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// Upper bound on each wait for a completion once submission has stopped.
    pub flush_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            max_workers: default_max_workers(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidWorkers);
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidDuration(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(Error::InvalidDuration(
                "report interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn execution_mode_aliases() {
        for s in ["threaded", "thread", "t", "THREADED"] {
            assert_eq!(ExecutionMode::parse(s).unwrap(), ExecutionMode::Threaded);
        }
        for s in ["multi-process", "multiprocess", "process", "p", " Process "] {
            assert_eq!(
                ExecutionMode::parse(s).unwrap(),
                ExecutionMode::MultiProcess
            );
        }
        assert_eq!(ExecutionMode::MultiProcess.to_string(), "multi-process");
    }

    #[test]
    fn unknown_execution_mode_is_configuration_error() {
        let err = ExecutionMode::parse("fibers").unwrap_err();
        assert!(matches!(&err, Error::InvalidExecutionMode(s) if s == "fibers"));
        assert!(err.is_configuration());
    }

    #[test]
    fn execution_mode_serde_uses_canonical_names() {
        let mode: ExecutionMode = serde_json::from_str("\"p\"").unwrap();
        assert_eq!(mode, ExecutionMode::MultiProcess);
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Threaded).unwrap(),
            "\"threaded\""
        );
        assert!(serde_json::from_str::<ExecutionMode>("\"bogus\"").is_err());
    }

    #[test]
    fn default_workers_is_odd_and_positive() {
        let n = default_max_workers();
        assert!(n >= 3);
        assert_eq!(n % 2, 1);
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = ControllerConfig {
            max_workers: 0,
            ..ControllerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidWorkers)));

        let zero_duration = ControllerConfig {
            duration: Duration::ZERO,
            ..ControllerConfig::default()
        };
        assert!(zero_duration.validate().is_ok());
    }
}
