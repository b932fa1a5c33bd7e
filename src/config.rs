use crate::cluster::MembershipSettings;
use crate::error::Error;
use crate::racing;
use crate::strategy::{self, RuntimeRanking, StrategyFactory};
use crate::task::Key;
use crate::worker::WorkerSettings;
use parse_duration::parse::parse;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse(&value).map_err(serde::de::Error::custom)
}

const MAX_PENALIZATION_FACTOR: f64 = 1e6;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TunerConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub cpu_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub penalization_factor: f64,
    pub enable_racing: bool,
    pub winner_count: usize,
    pub terminate_with_running_tasks: bool,
    pub workers_per_node: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub heartbeat_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub heartbeat_timeout: Duration,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            cpu_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            penalization_factor: 10.0,
            enable_racing: false,
            winner_count: 1,
            terminate_with_running_tasks: false,
            workers_per_node: 1,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

impl TunerConfig {
    pub fn from_yaml_str(yaml_str: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cpu_timeout.is_zero() {
            return Err(Error::ZeroTimeout);
        }
        if !(1.0..=MAX_PENALIZATION_FACTOR).contains(&self.penalization_factor) {
            return Err(Error::InvalidPenalizationFactor(self.penalization_factor));
        }
        if self.winner_count == 0 {
            return Err(Error::ZeroWinnerCount);
        }
        if self.workers_per_node == 0 {
            return Err(Error::ZeroWorkersPerNode);
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(Error::HeartbeatTimeoutTooShort {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            timeout: self.cpu_timeout,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn membership_settings(&self) -> MembershipSettings {
        MembershipSettings {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    pub fn ranking(&self) -> RuntimeRanking {
        RuntimeRanking::new(self.penalization_factor)
    }

    pub fn strategy_factory<G: Key, I: Key>(&self) -> StrategyFactory<G, I> {
        if self.enable_racing {
            racing::racing(
                self.ranking(),
                self.winner_count,
                self.terminate_with_running_tasks,
            )
        } else {
            strategy::full_evaluation(self.ranking())
        }
    }
}

#[derive(Default)]
pub struct TunerConfigBuilder {
    config: TunerConfig,
}

impl TunerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu_timeout(&mut self, cpu_timeout: Duration) -> &mut Self {
        self.config.cpu_timeout = cpu_timeout;
        self
    }

    pub fn max_consecutive_failures(&mut self, max_consecutive_failures: u32) -> &mut Self {
        self.config.max_consecutive_failures = max_consecutive_failures;
        self
    }

    pub fn penalization_factor(&mut self, penalization_factor: f64) -> &mut Self {
        self.config.penalization_factor = penalization_factor;
        self
    }

    pub fn racing(&mut self, winner_count: usize) -> &mut Self {
        self.config.enable_racing = true;
        self.config.winner_count = winner_count;
        self
    }

    pub fn terminate_with_running_tasks(&mut self, terminate: bool) -> &mut Self {
        self.config.terminate_with_running_tasks = terminate;
        self
    }

    pub fn workers_per_node(&mut self, workers_per_node: usize) -> &mut Self {
        self.config.workers_per_node = workers_per_node;
        self
    }

    pub fn heartbeat(&mut self, interval: Duration, timeout: Duration) -> &mut Self {
        self.config.heartbeat_interval = interval;
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn build(&self) -> Result<TunerConfig, Error> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}
