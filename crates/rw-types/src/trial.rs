//! Trials, observations and backend reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::SchedulerError;
use crate::space::Configuration;

/// Sequential trial identifier, assigned by the scheduler on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub u64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    #[serde(alias = "max")]
    Maximize,
    #[serde(alias = "min")]
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Map a metric value onto a loss (smaller is better).
    pub fn to_loss(self, value: f64) -> f64 {
        match self {
            Self::Minimize => value,
            Self::Maximize => -value,
        }
    }

    /// Inverse of [`ObjectiveDirection::to_loss`].
    pub fn from_loss(self, loss: f64) -> f64 {
        self.to_loss(loss)
    }

    /// Whether `candidate` strictly improves on `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }

    /// Whether `value` is at least as good as `cutoff` (ties count as good).
    pub fn at_least_as_good(self, value: f64, cutoff: f64) -> bool {
        match self {
            Self::Minimize => value <= cutoff,
            Self::Maximize => value >= cutoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Legal lifecycle edges. Paused trials only return to running through a
    /// promotion; terminal states never change.
    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopped)
        )
    }
}

/// A single trial (one configuration trained under the scheduler's control).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub config: Configuration,
    pub status: TrialStatus,
    /// (resource level, metric value), strictly increasing in resource.
    pub observations: Vec<(u64, f64)>,
    /// Hyperband bracket the trial was assigned to.
    pub bracket: usize,
    /// Index of the next rung level the trial is heading to.
    pub rung: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(id: TrialId, config: Configuration, bracket: usize) -> Self {
        Self {
            id,
            config,
            status: TrialStatus::Pending,
            observations: Vec::new(),
            bracket,
            rung: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Move to `next`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, next: TrialStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                trial_id: self.id,
                from: self.status,
                to: next,
            });
        }
        match next {
            TrialStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> Result<(), SchedulerError> {
        self.transition(TrialStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn last_resource(&self) -> Option<u64> {
        self.observations.last().map(|(r, _)| *r)
    }

    pub fn latest_value(&self) -> Option<f64> {
        self.observations.last().map(|(_, v)| *v)
    }

    pub fn value_at(&self, resource: u64) -> Option<f64> {
        self.observations
            .iter()
            .find(|(r, _)| *r == resource)
            .map(|(_, v)| *v)
    }
}

/// Immutable record of one metric report. The ledger only ever appends these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trial_id: TrialId,
    pub config: Configuration,
    pub resource: u64,
    pub value: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    InProgress,
    Completed,
    Failed,
}

/// A metric report streamed back by the execution backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial_id: TrialId,
    pub resource: u64,
    pub value: f64,
    pub status: ReportStatus,
}

impl TrialReport {
    pub fn in_progress(trial_id: TrialId, resource: u64, value: f64) -> Self {
        Self {
            trial_id,
            resource,
            value,
            status: ReportStatus::InProgress,
        }
    }

    pub fn failed(trial_id: TrialId, resource: u64) -> Self {
        Self {
            trial_id,
            resource,
            value: f64::NAN,
            status: ReportStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_lifecycle() {
        let mut trial = Trial::new(TrialId(0), Configuration::new(), 0);
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.transition(TrialStatus::Running).unwrap();
        assert!(trial.started_at.is_some());

        trial.transition(TrialStatus::Paused).unwrap();
        trial.transition(TrialStatus::Running).unwrap();
        trial.transition(TrialStatus::Completed).unwrap();
        assert!(trial.finished_at.is_some());
        assert!(trial.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut trial = Trial::new(TrialId(3), Configuration::new(), 0);
        trial.transition(TrialStatus::Running).unwrap();
        trial.transition(TrialStatus::Stopped).unwrap();

        let err = trial.transition(TrialStatus::Running).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                trial_id: TrialId(3),
                from: TrialStatus::Stopped,
                to: TrialStatus::Running,
            }
        );
    }

    #[test]
    fn pending_cannot_pause() {
        let mut trial = Trial::new(TrialId(1), Configuration::new(), 0);
        assert!(trial.transition(TrialStatus::Paused).is_err());
        assert_eq!(trial.status, TrialStatus::Pending);
    }

    #[test]
    fn trial_failure() {
        let mut trial = Trial::new(TrialId(2), Configuration::new(), 0);
        trial.transition(TrialStatus::Running).unwrap();
        trial.mark_failed("worker crashed".into()).unwrap();
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.error.as_deref(), Some("worker crashed"));
    }

    #[test]
    fn direction_helpers() {
        let min = ObjectiveDirection::Minimize;
        let max = ObjectiveDirection::Maximize;
        assert!(min.is_better(0.1, 0.2));
        assert!(max.is_better(0.9, 0.2));
        assert!(min.at_least_as_good(0.3, 0.3));
        assert_eq!(max.to_loss(0.8), -0.8);
        assert_eq!(max.from_loss(max.to_loss(0.8)), 0.8);
    }

    #[test]
    fn direction_accepts_short_aliases() {
        let min: ObjectiveDirection = serde_json::from_str("\"min\"").unwrap();
        let max: ObjectiveDirection = serde_json::from_str("\"Maximize\"").unwrap();
        assert_eq!(min, ObjectiveDirection::Minimize);
        assert_eq!(max, ObjectiveDirection::Maximize);
    }
}
