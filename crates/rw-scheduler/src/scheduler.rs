use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rw_surrogate::{PendingTrial, SurrogateState};
use rw_types::{
    Configuration, ObjectiveDirection, ReportStatus, SchedulerError, Trial, TrialId, TrialReport,
    TrialStatus,
};

use crate::bracket::RungSystem;
use crate::rung::{quantile_cutoff, RungLevel};

/// How trials move between rungs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Trials keep running and are stopped when they fall below the rung
    /// cutoff.
    #[default]
    Stopping,
    /// Trials pause at every rung and resume only when promoted.
    Promotion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub r_min: u64,
    pub r_max: u64,
    /// Reduction factor between rungs.
    pub eta: u64,
    /// Number of Hyperband brackets; 1 is plain ASHA.
    pub num_brackets: usize,
    pub scheduler_type: SchedulerType,
    /// Below this many values at a rung every trial continues.
    pub min_comparisons: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            r_min: 1,
            r_max: 81,
            eta: 3,
            num_brackets: 1,
            scheduler_type: SchedulerType::Stopping,
            min_comparisons: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn with_resources(mut self, r_min: u64, r_max: u64) -> Self {
        self.r_min = r_min;
        self.r_max = r_max;
        self
    }

    pub fn with_eta(mut self, eta: u64) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_brackets(mut self, num_brackets: usize) -> Self {
        self.num_brackets = num_brackets;
        self
    }

    pub fn with_type(mut self, scheduler_type: SchedulerType) -> Self {
        self.scheduler_type = scheduler_type;
        self
    }

    pub fn with_min_comparisons(mut self, min_comparisons: usize) -> Self {
        self.min_comparisons = min_comparisons;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    Stop,
    Pause,
    Complete,
    Fail,
    /// The report was not acted on (trial not running, or stale level).
    Ignore,
}

/// One scheduling decision, as logged by the tuner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub trial_id: TrialId,
    pub resource: u64,
    pub value: f64,
    pub decision: Decision,
    /// Rung level the decision was taken at, if any.
    pub rung: Option<u64>,
    pub cutoff: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Estimates a trial's metric at a resource it has not reached yet.
pub trait RungEstimator {
    fn estimate(&self, trial_id: TrialId, resource: u64) -> Option<f64>;
}

impl RungEstimator for SurrogateState {
    fn estimate(&self, trial_id: TrialId, resource: u64) -> Option<f64> {
        self.predict_trial(trial_id, resource).ok().map(|m| m.mean())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungSummary {
    pub bracket: usize,
    pub resource: u64,
    pub recorded: usize,
    pub promoted: usize,
    pub best: Option<f64>,
    pub cutoff: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub stopped: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn active(&self) -> usize {
        self.pending + self.running
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.stopped + self.completed + self.failed
    }
}

/// Asynchronous successive halving over Hyperband brackets.
///
/// Owns every trial; decisions are taken one report at a time.
#[derive(Debug, Clone)]
pub struct AsyncScheduler {
    config: SchedulerConfig,
    direction: ObjectiveDirection,
    rungs: RungSystem,
    /// `levels[s][k]` is rung `s + k` of bracket `s`.
    levels: Vec<Vec<RungLevel>>,
    trials: BTreeMap<TrialId, Trial>,
    next_id: u64,
}

impl AsyncScheduler {
    pub fn new(config: SchedulerConfig, direction: ObjectiveDirection) -> Result<Self, SchedulerError> {
        let rungs = RungSystem::new(config.r_min, config.r_max, config.eta, config.num_brackets)?;
        let levels = (0..rungs.num_brackets())
            .map(|s| {
                rungs.levels()[s..]
                    .iter()
                    .map(|&r| RungLevel::new(r))
                    .collect()
            })
            .collect();

        info!(
            levels = ?rungs.levels(),
            brackets = rungs.num_brackets(),
            scheduler_type = ?config.scheduler_type,
            "scheduler initialized"
        );

        Ok(Self {
            config,
            direction,
            rungs,
            levels,
            trials: BTreeMap::new(),
            next_id: 0,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn rungs(&self) -> &RungSystem {
        &self.rungs
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    pub fn scheduler_type(&self) -> SchedulerType {
        self.config.scheduler_type
    }

    /// Fall back to early stopping, for backends that cannot pause.
    pub fn downgrade_to_stopping(&mut self) {
        if self.config.scheduler_type == SchedulerType::Promotion {
            warn!("backend cannot pause trials, falling back to the stopping scheduler");
            self.config.scheduler_type = SchedulerType::Stopping;
        }
    }

    pub fn trial(&self, trial_id: TrialId) -> Option<&Trial> {
        self.trials.get(&trial_id)
    }

    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for trial in self.trials.values() {
            match trial.status {
                TrialStatus::Pending => counts.pending += 1,
                TrialStatus::Running => counts.running += 1,
                TrialStatus::Paused => counts.paused += 1,
                TrialStatus::Stopped => counts.stopped += 1,
                TrialStatus::Completed => counts.completed += 1,
                TrialStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn trials_with_status(&self, status: TrialStatus) -> Vec<TrialId> {
        self.trials
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    /// Register a new trial in a sampled bracket. Returns its id and the
    /// first rung level it will be judged at.
    pub fn create_trial<R: Rng + ?Sized>(&mut self, config: Configuration, rng: &mut R) -> (TrialId, u64) {
        let bracket = self.rungs.sample_bracket(rng);
        let id = TrialId(self.next_id);
        self.next_id += 1;

        let mut trial = Trial::new(id, config, bracket);
        trial.rung = bracket;
        let milestone = self.rungs.level(bracket);
        debug!(trial_id = %id, bracket, milestone, "trial created");
        self.trials.insert(id, trial);
        (id, milestone)
    }

    pub fn mark_running(&mut self, trial_id: TrialId) -> Result<(), SchedulerError> {
        self.trial_mut(trial_id)?.transition(TrialStatus::Running)
    }

    pub fn mark_failed(&mut self, trial_id: TrialId, error: String) -> Result<(), SchedulerError> {
        self.trial_mut(trial_id)?.mark_failed(error)
    }

    /// Stop a running or paused trial (shutdown).
    pub fn mark_stopped(&mut self, trial_id: TrialId) -> Result<(), SchedulerError> {
        self.trial_mut(trial_id)?.transition(TrialStatus::Stopped)
    }

    fn trial_mut(&mut self, trial_id: TrialId) -> Result<&mut Trial, SchedulerError> {
        self.trials
            .get_mut(&trial_id)
            .ok_or(SchedulerError::UnknownTrial { trial_id })
    }

    fn rung_mut(&mut self, bracket: usize, index: usize) -> &mut RungLevel {
        &mut self.levels[bracket][index - bracket]
    }

    fn rung(&self, bracket: usize, index: usize) -> &RungLevel {
        &self.levels[bracket][index - bracket]
    }

    /// Decide what happens to a trial after one of its reports.
    pub fn on_report(
        &mut self,
        report: &TrialReport,
        estimator: Option<&dyn RungEstimator>,
    ) -> Result<ScheduleDecision, SchedulerError> {
        let r_max = self.rungs.r_max();
        let direction = self.direction;
        let trial = self.trial_mut(report.trial_id)?;

        let mut decision = ScheduleDecision {
            trial_id: report.trial_id,
            resource: report.resource,
            value: report.value,
            decision: Decision::Ignore,
            rung: None,
            cutoff: None,
            timestamp: Utc::now(),
        };

        if trial.status != TrialStatus::Running {
            debug!(trial_id = %report.trial_id, status = ?trial.status, "report for non-running trial ignored");
            return Ok(decision);
        }

        if report.status == ReportStatus::Failed {
            trial.mark_failed(format!("trial failed at resource {}", report.resource))?;
            decision.decision = Decision::Fail;
            warn!(trial_id = %report.trial_id, resource = report.resource, "trial failed");
            return Ok(decision);
        }

        if trial.last_resource().is_some_and(|last| report.resource <= last) {
            return Ok(decision);
        }
        trial.observations.push((report.resource, report.value));
        let bracket = trial.bracket;

        let rung_index = self.rungs.rung_index(bracket, report.resource);
        if let Some(k) = rung_index {
            self.rung_mut(bracket, k).record(report.trial_id, report.value);
            decision.rung = Some(report.resource);
        }

        if report.status == ReportStatus::Completed || report.resource >= r_max {
            self.trial_mut(report.trial_id)?
                .transition(TrialStatus::Completed)?;
            decision.decision = Decision::Complete;
            info!(trial_id = %report.trial_id, resource = report.resource, value = report.value, "trial completed");
            return Ok(decision);
        }

        let Some(k) = rung_index else {
            decision.decision = Decision::Continue;
            return Ok(decision);
        };
        self.trial_mut(report.trial_id)?.rung = k + 1;

        match self.config.scheduler_type {
            SchedulerType::Stopping => {
                let values = self.comparison_values(report.trial_id, bracket, k, estimator);
                if values.len() < self.config.min_comparisons.max(1) {
                    decision.decision = Decision::Continue;
                } else {
                    let cutoff = quantile_cutoff(&values, self.rungs.eta(), direction);
                    decision.cutoff = cutoff;
                    let keep = cutoff.map_or(true, |c| direction.at_least_as_good(report.value, c));
                    if keep {
                        decision.decision = Decision::Continue;
                    } else {
                        self.trial_mut(report.trial_id)?
                            .transition(TrialStatus::Stopped)?;
                        decision.decision = Decision::Stop;
                    }
                }
            }
            SchedulerType::Promotion => {
                self.trial_mut(report.trial_id)?
                    .transition(TrialStatus::Paused)?;
                decision.decision = Decision::Pause;
            }
        }

        debug!(
            trial_id = %report.trial_id,
            resource = report.resource,
            value = report.value,
            decision = ?decision.decision,
            cutoff = ?decision.cutoff,
            "rung decision"
        );
        Ok(decision)
    }

    /// Values a report at rung `k` of `bracket` is compared against. When the
    /// rung has fewer than `min_comparisons` values, surrogate estimates for
    /// running trials of the bracket that have not reached it yet are added.
    fn comparison_values(
        &self,
        trial_id: TrialId,
        bracket: usize,
        k: usize,
        estimator: Option<&dyn RungEstimator>,
    ) -> Vec<f64> {
        let rung = self.rung(bracket, k);
        let mut values: Vec<f64> = rung.values().iter().map(|(_, v)| *v).collect();
        if values.len() >= self.config.min_comparisons {
            return values;
        }
        let Some(estimator) = estimator else {
            return values;
        };

        let resource = rung.resource();
        let mut estimated = 0;
        for trial in self.trials.values() {
            if trial.id == trial_id
                || trial.bracket != bracket
                || trial.status != TrialStatus::Running
                || trial.last_resource().is_some_and(|r| r >= resource)
            {
                continue;
            }
            if let Some(v) = estimator.estimate(trial.id, resource).filter(|v| v.is_finite()) {
                values.push(v);
                estimated += 1;
            }
        }
        if estimated > 0 {
            debug!(resource, estimated, "rung comparison completed with surrogate estimates");
        }
        values
    }

    /// Resume the paused trial at the highest rung that sits inside the
    /// top `⌊n/η⌋` and has not been promoted yet. A rung holding fewer than
    /// `min_comparisons` values promotes its best paused trial outright.
    /// Returns the trial and the next rung level it now runs to.
    pub fn next_promotion(&mut self) -> Option<(TrialId, u64)> {
        let eta = self.rungs.eta();
        let direction = self.direction;
        let min_comparisons = self.config.min_comparisons;
        let top = self.rungs.levels().len().saturating_sub(1);

        let mut found = None;
        'scan: for k in (0..top).rev() {
            for bracket in 0..self.levels.len() {
                if k < bracket {
                    continue;
                }
                let trials = &self.trials;
                let paused = |id: TrialId| {
                    trials
                        .get(&id)
                        .is_some_and(|t| t.status == TrialStatus::Paused)
                };
                let rung = self.rung(bracket, k);
                let candidate = if rung.len() < min_comparisons {
                    rung.best_unpromoted(direction, paused)
                } else {
                    rung.promotable(eta, direction, paused)
                };
                if let Some(id) = candidate {
                    found = Some((bracket, k, id));
                    break 'scan;
                }
            }
        }

        let (bracket, k, trial_id) = found?;
        self.rung_mut(bracket, k).mark_promoted(trial_id);
        let next = self.rungs.level(k + 1);
        let trial = self.trials.get_mut(&trial_id)?;
        if let Err(e) = trial.transition(TrialStatus::Running) {
            warn!(trial_id = %trial_id, error = %e, "promotion rejected");
            return None;
        }
        info!(trial_id = %trial_id, from = self.rungs.level(k), to = next, "trial promoted");
        Some((trial_id, next))
    }

    /// Running and paused trials with the resource their curve is heading to.
    pub fn pending_trials(&self) -> Vec<PendingTrial> {
        self.trials
            .values()
            .filter(|t| matches!(t.status, TrialStatus::Running | TrialStatus::Paused))
            .map(|t| PendingTrial {
                trial_id: t.id,
                config: t.config.clone(),
                target_resource: self.rungs.level(t.rung),
            })
            .collect()
    }

    pub fn rung_summaries(&self) -> Vec<RungSummary> {
        let eta = self.rungs.eta();
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(bracket, rungs)| {
                rungs.iter().map(move |rung| RungSummary {
                    bracket,
                    resource: rung.resource(),
                    recorded: rung.len(),
                    promoted: rung.num_promoted(),
                    best: rung.best(self.direction),
                    cutoff: rung.cutoff(eta, self.direction),
                })
            })
            .collect()
    }
}
