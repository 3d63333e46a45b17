use std::cmp::Ordering;
use std::collections::BTreeSet;

use rw_types::{ObjectiveDirection, TrialId};
use serde::{Deserialize, Serialize};

/// Order statistic `⌈n / η⌉` of `values` ranked best-first; `None` when
/// `values` is empty.
pub fn quantile_cutoff(values: &[f64], eta: u64, direction: ObjectiveDirection) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| rank(direction, *a, *b));
    let eta = eta.max(1) as usize;
    let k = ((sorted.len() + eta - 1) / eta).max(1);
    Some(sorted[k - 1])
}

fn rank(direction: ObjectiveDirection, a: f64, b: f64) -> Ordering {
    let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
    match direction {
        ObjectiveDirection::Minimize => ordering,
        ObjectiveDirection::Maximize => ordering.reverse(),
    }
}

/// Metric values recorded at one resource threshold, and the trials already
/// promoted out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungLevel {
    resource: u64,
    values: Vec<(TrialId, f64)>,
    promoted: BTreeSet<TrialId>,
}

impl RungLevel {
    pub fn new(resource: u64) -> Self {
        Self {
            resource,
            values: Vec::new(),
            promoted: BTreeSet::new(),
        }
    }

    pub fn resource(&self) -> u64 {
        self.resource
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[(TrialId, f64)] {
        &self.values
    }

    pub fn value_of(&self, trial_id: TrialId) -> Option<f64> {
        self.values
            .iter()
            .find(|(id, _)| *id == trial_id)
            .map(|(_, v)| *v)
    }

    /// Record a trial's value; a second value for the same trial is ignored.
    pub fn record(&mut self, trial_id: TrialId, value: f64) -> bool {
        if self.value_of(trial_id).is_some() {
            return false;
        }
        self.values.push((trial_id, value));
        true
    }

    pub fn num_promoted(&self) -> usize {
        self.promoted.len()
    }

    pub fn is_promoted(&self, trial_id: TrialId) -> bool {
        self.promoted.contains(&trial_id)
    }

    pub fn mark_promoted(&mut self, trial_id: TrialId) -> bool {
        self.promoted.insert(trial_id)
    }

    /// Best recorded value.
    pub fn best(&self, direction: ObjectiveDirection) -> Option<f64> {
        self.values
            .iter()
            .map(|(_, v)| *v)
            .min_by(|a, b| rank(direction, *a, *b))
    }

    /// Continuation cutoff over the recorded values.
    pub fn cutoff(&self, eta: u64, direction: ObjectiveDirection) -> Option<f64> {
        let values: Vec<f64> = self.values.iter().map(|(_, v)| *v).collect();
        quantile_cutoff(&values, eta, direction)
    }

    /// The `⌊n / η⌋` best trials, best first. Ties keep recording order.
    pub fn top_fraction(&self, eta: u64, direction: ObjectiveDirection) -> Vec<TrialId> {
        let k = self.values.len() / eta.max(1) as usize;
        let mut ranked: Vec<&(TrialId, f64)> = self.values.iter().collect();
        ranked.sort_by(|a, b| rank(direction, a.1, b.1));
        ranked.into_iter().take(k).map(|(id, _)| *id).collect()
    }

    /// Best trial in the top fraction that is not yet promoted and passes
    /// `eligible`.
    pub fn promotable<F>(&self, eta: u64, direction: ObjectiveDirection, eligible: F) -> Option<TrialId>
    where
        F: Fn(TrialId) -> bool,
    {
        self.top_fraction(eta, direction)
            .into_iter()
            .find(|id| !self.promoted.contains(id) && eligible(*id))
    }

    /// Best recorded trial, over the whole rung, that is not yet promoted
    /// and passes `eligible`.
    pub fn best_unpromoted<F>(&self, direction: ObjectiveDirection, eligible: F) -> Option<TrialId>
    where
        F: Fn(TrialId) -> bool,
    {
        let mut ranked: Vec<&(TrialId, f64)> = self.values.iter().collect();
        ranked.sort_by(|a, b| rank(direction, a.1, b.1));
        ranked
            .into_iter()
            .map(|(id, _)| *id)
            .find(|id| !self.promoted.contains(id) && eligible(*id))
    }

    /// Synchronous successive halving on the recorded batch: promote the top
    /// `⌊n / η⌋` and return every trial promoted so far. Earlier promotions
    /// are kept even if later values rank above them.
    pub fn promote_top_fraction(&mut self, eta: u64, direction: ObjectiveDirection) -> Vec<TrialId> {
        for id in self.top_fraction(eta, direction) {
            self.promoted.insert(id);
        }
        self.promoted.iter().copied().collect()
    }
}
