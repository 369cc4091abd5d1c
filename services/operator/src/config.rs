//! Configuration for the operator.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::driver::DriverConfig;
use crate::worker::{BackoffPolicy, ControllerConfig, RestartPolicy};

const PREFIX: &str = "CRDB_OPERATOR_";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => bail!("unknown log format {other:?}, expected json or pretty"),
        }
    }
}

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Passes allowed to run at the same time across all clusters.
    pub max_concurrent_reconciles: usize,

    /// Bound on every platform and database call.
    pub api_timeout: Duration,

    /// Delay before the next pass while an actor waits on the cluster.
    pub requeue_in_progress: Duration,

    /// Delay before the next pass after a completed step.
    pub requeue_after_step: Duration,

    pub backoff_base: Duration,

    pub backoff_max: Duration,

    /// How often workers are woken to run due passes.
    pub tick_interval: Duration,

    /// How often the cluster list is re-read.
    pub resync_interval: Duration,

    pub max_conflict_retries: u32,

    /// Smallest node count a cluster may ask for.
    pub min_nodes: u32,

    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is
    /// not set.
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 4,
            api_timeout: Duration::from_secs(10),
            requeue_in_progress: Duration::from_secs(5),
            requeue_after_step: Duration::from_secs(1),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            resync_interval: Duration::from_secs(300),
            max_conflict_retries: 3,
            min_nodes: 1,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from `CRDB_OPERATOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a full variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("{PREFIX}{name}"));

        let config = Self {
            max_concurrent_reconciles: parse(&get, "MAX_CONCURRENT_RECONCILES")?
                .unwrap_or(defaults.max_concurrent_reconciles),
            api_timeout: millis(&get, "API_TIMEOUT_MS")?.unwrap_or(defaults.api_timeout),
            requeue_in_progress: millis(&get, "REQUEUE_IN_PROGRESS_MS")?
                .unwrap_or(defaults.requeue_in_progress),
            requeue_after_step: millis(&get, "REQUEUE_AFTER_STEP_MS")?
                .unwrap_or(defaults.requeue_after_step),
            backoff_base: millis(&get, "BACKOFF_BASE_MS")?.unwrap_or(defaults.backoff_base),
            backoff_max: millis(&get, "BACKOFF_MAX_MS")?.unwrap_or(defaults.backoff_max),
            tick_interval: millis(&get, "TICK_INTERVAL_MS")?.unwrap_or(defaults.tick_interval),
            resync_interval: parse(&get, "RESYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.resync_interval),
            max_conflict_retries: parse(&get, "MAX_CONFLICT_RETRIES")?
                .unwrap_or(defaults.max_conflict_retries),
            min_nodes: parse(&get, "MIN_NODES")?.unwrap_or(defaults.min_nodes),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse(&get, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        };

        if config.max_concurrent_reconciles == 0 {
            bail!("{PREFIX}MAX_CONCURRENT_RECONCILES must be at least 1");
        }
        if config.tick_interval.is_zero() {
            bail!("{PREFIX}TICK_INTERVAL_MS must be positive");
        }
        if config.resync_interval.is_zero() {
            bail!("{PREFIX}RESYNC_INTERVAL_SECS must be positive");
        }
        if config.backoff_base > config.backoff_max {
            bail!(
                "{PREFIX}BACKOFF_BASE_MS ({:?}) exceeds {PREFIX}BACKOFF_MAX_MS ({:?})",
                config.backoff_base,
                config.backoff_max
            );
        }
        Ok(config)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            api_timeout: self.api_timeout,
            requeue_after_step: self.requeue_after_step,
            requeue_in_progress: self.requeue_in_progress,
            max_conflict_retries: self.max_conflict_retries,
            min_nodes: self.min_nodes,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
            ..BackoffPolicy::default()
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            tick_interval: self.tick_interval,
            resync_interval: self.resync_interval,
            backoff: self.backoff(),
            restart: RestartPolicy::default(),
            ..ControllerConfig::default()
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("invalid {PREFIX}{name}={raw:?}"))
        })
        .transpose()
}

fn millis(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(get, name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<OperatorConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{PREFIX}{k}"), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(config.min_nodes, 1);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.driver_config().api_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MAX_CONCURRENT_RECONCILES", "8"),
            ("API_TIMEOUT_MS", "2500"),
            ("MIN_NODES", "3"),
            ("LOG_FORMAT", "pretty"),
            ("BACKOFF_BASE_MS", "50"),
            ("BACKOFF_MAX_MS", "1000"),
        ])
        .unwrap();

        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.api_timeout, Duration::from_millis(2500));
        assert_eq!(config.driver_config().min_nodes, 3);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.backoff().max, Duration::from_secs(1));
        assert_eq!(config.controller_config().max_concurrent_reconciles, 8);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = load(&[("MIN_NODES", "three")]).unwrap_err();
        assert!(err.to_string().contains("CRDB_OPERATOR_MIN_NODES"));

        assert!(load(&[("MAX_CONCURRENT_RECONCILES", "0")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("BACKOFF_BASE_MS", "5000"), ("BACKOFF_MAX_MS", "100")]).is_err());
    }
}
