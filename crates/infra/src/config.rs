//! Environment-driven configuration.
//!
//! Every knob has a default; `IM2_*` variables override them. Durations are
//! given in the unit named by the variable suffix (`_MS` / `_SECS`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use im2_core::{BackoffStrategy, RetryPolicy, Stage};

use crate::detector::DetectorSettings;
use crate::handoff::HandoffArea;
use crate::router::RouterSettings;
use crate::sweeper::SweeperSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub intake_root: PathBuf,
    pub staging_root: PathBuf,
    pub output_root: PathBuf,
    pub quarantine_root: PathBuf,
    pub checkpoint_path: Option<PathBuf>,

    pub quiescence: Duration,
    pub detector_poll: Duration,
    pub detector_max_attempts: u32,
    pub require_atomic_rename: bool,

    pub lease: Duration,
    pub lock_timeout: Duration,
    pub stage_timeout: Duration,
    pub stage_timeouts: BTreeMap<Stage, Duration>,
    pub retry_ceiling: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_backoff: BackoffStrategy,
    /// Fraction of each retry delay randomised, `0.0..=1.0`.
    pub retry_jitter: f64,

    pub stuck_threshold: Duration,
    pub sweep_interval: Duration,
    pub workers_per_stage: usize,

    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub stage_commands: BTreeMap<Stage, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            intake_root: PathBuf::from("data/intake"),
            staging_root: PathBuf::from("data/staging"),
            output_root: PathBuf::from("data/output"),
            quarantine_root: PathBuf::from("data/quarantine"),
            checkpoint_path: None,
            quiescence: Duration::from_secs(5),
            detector_poll: Duration::from_secs(1),
            detector_max_attempts: 5,
            require_atomic_rename: true,
            lease: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
            stage_timeout: Duration::from_secs(30 * 60),
            stage_timeouts: BTreeMap::new(),
            retry_ceiling: 3,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
            retry_backoff: BackoffStrategy::Exponential,
            retry_jitter: 0.1,
            stuck_threshold: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(30),
            workers_per_stage: 1,
            database_url: None,
            redis_url: None,
            stage_commands: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let mut stage_timeouts = BTreeMap::new();
        let mut stage_commands = BTreeMap::new();
        for stage in Stage::ALL {
            let upper = stage.as_str().to_ascii_uppercase();
            if let Some(secs) = env.parsed::<u64>(&format!("IM2_STAGE_TIMEOUT_{upper}_SECS"))? {
                stage_timeouts.insert(stage, Duration::from_secs(secs));
            }
            if let Some(cmd) = env.string(&format!("IM2_STAGE_CMD_{upper}")) {
                stage_commands.insert(stage, cmd);
            }
        }

        let config = Self {
            intake_root: env.path("IM2_INTAKE_ROOT").unwrap_or(d.intake_root),
            staging_root: env.path("IM2_STAGING_ROOT").unwrap_or(d.staging_root),
            output_root: env.path("IM2_OUTPUT_ROOT").unwrap_or(d.output_root),
            quarantine_root: env.path("IM2_QUARANTINE_ROOT").unwrap_or(d.quarantine_root),
            checkpoint_path: env.path("IM2_CHECKPOINT_PATH"),
            quiescence: env.millis("IM2_QUIESCENCE_MS")?.unwrap_or(d.quiescence),
            detector_poll: env.millis("IM2_DETECTOR_POLL_MS")?.unwrap_or(d.detector_poll),
            detector_max_attempts: env
                .parsed("IM2_DETECTOR_MAX_ATTEMPTS")?
                .unwrap_or(d.detector_max_attempts),
            require_atomic_rename: env
                .parsed("IM2_REQUIRE_ATOMIC_RENAME")?
                .unwrap_or(d.require_atomic_rename),
            lease: env.millis("IM2_LEASE_MS")?.unwrap_or(d.lease),
            lock_timeout: env.millis("IM2_LOCK_TIMEOUT_MS")?.unwrap_or(d.lock_timeout),
            stage_timeout: env.secs("IM2_STAGE_TIMEOUT_SECS")?.unwrap_or(d.stage_timeout),
            stage_timeouts,
            retry_ceiling: env.parsed("IM2_RETRY_CEILING")?.unwrap_or(d.retry_ceiling),
            retry_base: env.millis("IM2_RETRY_BASE_MS")?.unwrap_or(d.retry_base),
            retry_max: env.millis("IM2_RETRY_MAX_MS")?.unwrap_or(d.retry_max),
            retry_backoff: env.parsed("IM2_RETRY_BACKOFF")?.unwrap_or(d.retry_backoff),
            retry_jitter: env.parsed("IM2_RETRY_JITTER")?.unwrap_or(d.retry_jitter),
            stuck_threshold: env.secs("IM2_STUCK_THRESHOLD_SECS")?.unwrap_or(d.stuck_threshold),
            sweep_interval: env.secs("IM2_SWEEP_INTERVAL_SECS")?.unwrap_or(d.sweep_interval),
            workers_per_stage: env.parsed("IM2_WORKERS_PER_STAGE")?.unwrap_or(d.workers_per_stage),
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            stage_commands,
        };

        if config.retry_ceiling == 0 {
            return Err(ConfigError::Invalid {
                key: "IM2_RETRY_CEILING".into(),
                value: "0".into(),
            });
        }
        if !(0.0..=1.0).contains(&config.retry_jitter) {
            return Err(ConfigError::Invalid {
                key: "IM2_RETRY_JITTER".into(),
                value: config.retry_jitter.to_string(),
            });
        }
        if config.lease.is_zero() {
            return Err(ConfigError::Invalid {
                key: "IM2_LEASE_MS".into(),
                value: "0".into(),
            });
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_ceiling, self.retry_base, self.retry_max)
            .with_strategy(self.retry_backoff)
            .with_jitter(self.retry_jitter)
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        self.stage_timeouts.get(&stage).copied().unwrap_or(self.stage_timeout)
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        let mut settings = DetectorSettings::new(&self.intake_root, &self.quarantine_root);
        settings.quiescence = self.quiescence;
        settings.require_atomic_rename = self.require_atomic_rename;
        settings.retry = RetryPolicy::exponential(
            self.detector_max_attempts,
            self.detector_poll,
            self.detector_poll * 32,
        );
        settings
    }

    pub fn router_settings(&self) -> RouterSettings {
        let mut settings = RouterSettings::new(self.lease, self.lock_timeout, self.retry_policy());
        settings.default_stage_timeout = self.stage_timeout;
        settings.stage_timeouts = self.stage_timeouts.clone();
        settings
    }

    pub fn sweeper_settings(&self) -> SweeperSettings {
        SweeperSettings {
            interval: self.sweep_interval,
            stuck_threshold: self.stuck_threshold,
        }
    }

    pub fn handoff_area(&self) -> HandoffArea {
        HandoffArea::new(&self.staging_root, &self.output_root)
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.string(key).map(PathBuf::from)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(key)?.map(Duration::from_millis))
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(key)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        OrchestratorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.retry_ceiling, 3);
        assert!(c.require_atomic_rename);
        assert!(c.database_url.is_none());
        assert_eq!(c.stage_timeout(Stage::Separating), Duration::from_secs(1800));
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("IM2_QUIESCENCE_MS", "250"),
            ("IM2_RETRY_CEILING", "5"),
            ("IM2_REQUIRE_ATOMIC_RENAME", "false"),
            ("IM2_STAGE_TIMEOUT_SECS", "60"),
            ("IM2_STAGE_TIMEOUT_SEPARATING_SECS", "900"),
            ("IM2_STAGE_CMD_CATEGORIZING", "/usr/bin/classify --fast"),
            ("IM2_INTAKE_ROOT", "/srv/intake"),
        ])
        .unwrap();

        assert_eq!(c.quiescence, Duration::from_millis(250));
        assert_eq!(c.retry_policy().max_attempts, 5);
        assert!(!c.detector_settings().require_atomic_rename);
        assert_eq!(c.stage_timeout(Stage::Separating), Duration::from_secs(900));
        assert_eq!(c.stage_timeout(Stage::Staging), Duration::from_secs(60));
        assert_eq!(
            c.stage_commands.get(&Stage::Categorizing).map(String::as_str),
            Some("/usr/bin/classify --fast")
        );
        assert_eq!(c.detector_settings().intake_root, PathBuf::from("/srv/intake"));
    }

    #[test]
    fn retry_backoff_is_configurable() {
        let c = config(&[
            ("IM2_RETRY_BACKOFF", "linear"),
            ("IM2_RETRY_JITTER", "0"),
            ("IM2_RETRY_BASE_MS", "100"),
            ("IM2_RETRY_MAX_MS", "10000"),
        ])
        .unwrap();
        let policy = c.retry_policy();
        assert_eq!(policy.strategy, BackoffStrategy::Linear);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(c.router_settings().retry, policy);

        assert_eq!(config(&[]).unwrap().retry_policy().strategy, BackoffStrategy::Exponential);
        assert!(config(&[("IM2_RETRY_BACKOFF", "random")]).is_err());
        assert!(config(&[("IM2_RETRY_JITTER", "1.5")]).is_err());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = config(&[("IM2_LEASE_MS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "IM2_LEASE_MS".into(),
                value: "soon".into()
            }
        );
        assert!(config(&[("IM2_RETRY_CEILING", "0")]).is_err());
    }
}
