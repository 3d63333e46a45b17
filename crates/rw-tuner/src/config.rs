use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rw_scheduler::SchedulerConfig;
use rw_surrogate::{AcquisitionConfig, SurrogateConfig};
use rw_types::{config_error, ObjectiveDirection, RwResult};

/// When the run stops dispatching trials. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingCriterion {
    /// Trials to start; once reached, running trials are drained.
    pub max_trials: Option<usize>,
    pub max_wallclock_secs: Option<f64>,
    /// Total resource consumed over all trials.
    pub max_cost: Option<f64>,
    /// Stop once an observation is at least this good.
    pub target_metric: Option<f64>,
}

impl StoppingCriterion {
    pub fn max_trials(n: usize) -> Self {
        Self {
            max_trials: Some(n),
            ..Self::default()
        }
    }

    pub fn with_wallclock(mut self, secs: f64) -> Self {
        self.max_wallclock_secs = Some(secs);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.max_cost = Some(cost);
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target_metric = Some(target);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_trials.is_none()
            && self.max_wallclock_secs.is_none()
            && self.max_cost.is_none()
            && self.target_metric.is_none()
    }
}

/// When to refit the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefitPolicy {
    /// Refit after this many new observations.
    pub min_new_observations: usize,
    /// Refit at least this often while new data arrives.
    pub max_interval_secs: f64,
}

impl Default for RefitPolicy {
    fn default() -> Self {
        Self {
            min_new_observations: 10,
            max_interval_secs: 60.0,
        }
    }
}

impl RefitPolicy {
    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub direction: ObjectiveDirection,
    /// Trials allowed to run at the same time.
    pub num_workers: usize,
    pub seed: u64,
    pub scheduler: SchedulerConfig,
    pub surrogate: SurrogateConfig,
    pub acquisition: AcquisitionConfig,
    pub refit: RefitPolicy,
    pub stopping: StoppingCriterion,
    /// Trial failures tolerated before the run is aborted.
    pub max_failures: usize,
    /// Sleep between polls that returned nothing.
    pub poll_interval_ms: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            direction: ObjectiveDirection::Minimize,
            num_workers: 4,
            seed: 0,
            scheduler: SchedulerConfig::default(),
            surrogate: SurrogateConfig::default(),
            acquisition: AcquisitionConfig::default(),
            refit: RefitPolicy::default(),
            stopping: StoppingCriterion::max_trials(100),
            max_failures: 10,
            poll_interval_ms: 100,
        }
    }
}

impl TunerConfig {
    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_surrogate(mut self, surrogate: SurrogateConfig) -> Self {
        self.surrogate = surrogate;
        self
    }

    pub fn with_acquisition(mut self, acquisition: AcquisitionConfig) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_refit(mut self, refit: RefitPolicy) -> Self {
        self.refit = refit;
        self
    }

    pub fn with_stopping(mut self, stopping: StoppingCriterion) -> Self {
        self.stopping = stopping;
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> RwResult<()> {
        if self.num_workers == 0 {
            return Err(config_error!("num_workers must be at least 1"));
        }
        if self.stopping.is_unbounded() {
            return Err(config_error!("at least one stopping criterion is required"));
        }
        if self.stopping.max_trials == Some(0) {
            return Err(config_error!("max_trials must be at least 1"));
        }
        for (name, value) in [
            ("max_wallclock_secs", self.stopping.max_wallclock_secs),
            ("max_cost", self.stopping.max_cost),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(config_error!("{} must be positive, got {}", name, v));
                }
            }
        }
        if self.stopping.target_metric.is_some_and(|t| !t.is_finite()) {
            return Err(config_error!("target_metric must be finite"));
        }
        if self.refit.min_new_observations == 0 {
            return Err(config_error!("refit.min_new_observations must be at least 1"));
        }
        if !self.refit.max_interval_secs.is_finite() || self.refit.max_interval_secs < 0.0 {
            return Err(config_error!(
                "refit.max_interval_secs must be non-negative, got {}",
                self.refit.max_interval_secs
            ));
        }
        if self.surrogate.num_samples == 0 {
            return Err(config_error!("surrogate.num_samples must be at least 1"));
        }
        if self.acquisition.pool_size == 0 {
            return Err(config_error!("acquisition.pool_size must be at least 1"));
        }
        let s = &self.scheduler;
        if s.r_min == 0 || s.r_max < s.r_min {
            return Err(config_error!(
                "invalid resource range [{}, {}]",
                s.r_min,
                s.r_max
            ));
        }
        if s.eta < 2 {
            return Err(config_error!("scheduler.eta must be at least 2, got {}", s.eta));
        }
        if s.num_brackets == 0 {
            return Err(config_error!("scheduler.num_brackets must be at least 1"));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> RwResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> RwResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
