//! In-process simulated backend.
//!
//! Trials "train" by advancing one resource level per poll and report
//! `objective(config, r)` plus Gaussian noise drawn from a per-trial ChaCha
//! stream, so a run is reproducible no matter how trials interleave. Useful
//! for tests and demos of the full tuning loop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rw_types::{BackendError, Configuration, ReportStatus, TrialId, TrialReport};

use crate::backend::{Backend, BackendResult};

/// Metric of a configuration after `r` units of resource, before noise.
pub type Objective = Arc<dyn Fn(&Configuration, u64) -> f64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedBackendConfig {
    pub r_min: u64,
    pub r_max: u64,
    /// Standard deviation of the additive observation noise.
    pub noise_std: f64,
    pub seed: u64,
    /// Probability that a trial crashes at any single step.
    pub failure_rate: f64,
    pub supports_pause: bool,
    /// Trials that may run at the same time.
    pub capacity: usize,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            r_min: 1,
            r_max: 81,
            noise_std: 0.0,
            seed: 0,
            failure_rate: 0.0,
            supports_pause: true,
            capacity: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    Running,
    Paused,
    Stopped,
    Finished,
}

struct SimTrial {
    config: Configuration,
    rng: ChaCha8Rng,
    next_resource: u64,
    state: SimState,
}

pub struct SimulatedBackend {
    config: SimulatedBackendConfig,
    objective: Objective,
    trials: BTreeMap<TrialId, SimTrial>,
    /// Forced crash level per trial.
    fail_at: BTreeMap<TrialId, u64>,
    stop_requests: Vec<TrialId>,
    pause_requests: Vec<TrialId>,
    resume_requests: Vec<(TrialId, u64)>,
    polls: u64,
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("config", &self.config)
            .field("trials", &self.trials.len())
            .field("polls", &self.polls)
            .finish()
    }
}

impl SimulatedBackend {
    pub fn new<F>(config: SimulatedBackendConfig, objective: F) -> Self
    where
        F: Fn(&Configuration, u64) -> f64 + Send + Sync + 'static,
    {
        Self {
            config,
            objective: Arc::new(objective),
            trials: BTreeMap::new(),
            fail_at: BTreeMap::new(),
            stop_requests: Vec::new(),
            pause_requests: Vec::new(),
            resume_requests: Vec::new(),
            polls: 0,
        }
    }

    pub fn config(&self) -> &SimulatedBackendConfig {
        &self.config
    }

    /// Make `trial_id` crash when it reaches `resource`.
    pub fn fail_trial_at(&mut self, trial_id: TrialId, resource: u64) {
        self.fail_at.insert(trial_id, resource);
    }

    pub fn stop_requests(&self) -> &[TrialId] {
        &self.stop_requests
    }

    pub fn pause_requests(&self) -> &[TrialId] {
        &self.pause_requests
    }

    pub fn resume_requests(&self) -> &[(TrialId, u64)] {
        &self.resume_requests
    }

    pub fn num_started(&self) -> usize {
        self.trials.len()
    }

    pub fn num_running(&self) -> usize {
        self.trials
            .values()
            .filter(|t| t.state == SimState::Running)
            .count()
    }

    /// Resource the trial will report next.
    pub fn next_resource(&self, trial_id: TrialId) -> Option<u64> {
        self.trials.get(&trial_id).map(|t| t.next_resource)
    }

    fn trial_mut(&mut self, trial_id: TrialId) -> BackendResult<&mut SimTrial> {
        self.trials
            .get_mut(&trial_id)
            .ok_or(BackendError::TrialNotFound { trial_id })
    }

    fn step(&mut self, trial_id: TrialId) -> Option<TrialReport> {
        let r_max = self.config.r_max;
        let noise_std = self.config.noise_std;
        let failure_rate = self.config.failure_rate;
        let forced = self.fail_at.get(&trial_id).copied();
        let objective = Arc::clone(&self.objective);

        let trial = self.trials.get_mut(&trial_id)?;
        if trial.state != SimState::Running {
            return None;
        }
        let resource = trial.next_resource;

        let crashed = forced == Some(resource)
            || (failure_rate > 0.0 && trial.rng.gen_bool(failure_rate.min(1.0)));
        if crashed {
            trial.state = SimState::Finished;
            debug!(trial_id = %trial_id, resource, "simulated trial crashed");
            return Some(TrialReport::failed(trial_id, resource));
        }

        let noise: f64 = trial.rng.sample(StandardNormal);
        let value = objective(&trial.config, resource) + noise_std * noise;
        trial.next_resource += 1;

        let status = if resource >= r_max {
            trial.state = SimState::Finished;
            ReportStatus::Completed
        } else {
            ReportStatus::InProgress
        };
        Some(TrialReport {
            trial_id,
            resource,
            value,
            status,
        })
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn start_trial(
        &mut self,
        trial_id: TrialId,
        config: &Configuration,
        milestone: u64,
    ) -> BackendResult<()> {
        if self.num_running() >= self.config.capacity {
            return Err(BackendError::NoCapacity { trial_id });
        }
        if self.trials.contains_key(&trial_id) {
            return Err(BackendError::Internal {
                message: format!("trial {} already started", trial_id),
            });
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(trial_id.0);
        self.trials.insert(
            trial_id,
            SimTrial {
                config: config.clone(),
                rng,
                next_resource: self.config.r_min,
                state: SimState::Running,
            },
        );
        info!(trial_id = %trial_id, milestone, "simulated trial started");
        Ok(())
    }

    async fn stop_trial(&mut self, trial_id: TrialId) -> BackendResult<()> {
        let trial = self.trial_mut(trial_id)?;
        if trial.state != SimState::Finished {
            trial.state = SimState::Stopped;
        }
        self.stop_requests.push(trial_id);
        debug!(trial_id = %trial_id, "simulated trial stopped");
        Ok(())
    }

    async fn pause_trial(&mut self, trial_id: TrialId) -> BackendResult<()> {
        if !self.config.supports_pause {
            return Err(BackendError::PauseUnsupported);
        }
        let trial = self.trial_mut(trial_id)?;
        if trial.state == SimState::Running {
            trial.state = SimState::Paused;
        }
        self.pause_requests.push(trial_id);
        Ok(())
    }

    async fn resume_trial(&mut self, trial_id: TrialId, milestone: u64) -> BackendResult<()> {
        if !self.config.supports_pause {
            return Err(BackendError::PauseUnsupported);
        }
        if self.num_running() >= self.config.capacity {
            return Err(BackendError::NoCapacity { trial_id });
        }
        let trial = self.trial_mut(trial_id)?;
        if trial.state != SimState::Paused {
            return Err(BackendError::Internal {
                message: format!("trial {} is not paused", trial_id),
            });
        }
        trial.state = SimState::Running;
        self.resume_requests.push((trial_id, milestone));
        debug!(trial_id = %trial_id, milestone, "simulated trial resumed");
        Ok(())
    }

    fn supports_pause_resume(&self) -> bool {
        self.config.supports_pause
    }

    async fn poll_reports(&mut self) -> BackendResult<Vec<TrialReport>> {
        self.polls += 1;
        let ids: Vec<TrialId> = self.trials.keys().copied().collect();
        Ok(ids.into_iter().filter_map(|id| self.step(id)).collect())
    }
}
