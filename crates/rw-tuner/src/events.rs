//! Telemetry emitted by the tuner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rw_scheduler::{Decision, RungSummary};
use rw_types::TrialId;

use crate::tuner::RunOutcome;

/// Events emitted by the tuner for external consumption (logging, dashboards,
/// tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TunerEvent {
    RunStarted {
        run_id: Uuid,
        num_workers: usize,
    },
    RunFinished {
        run_id: Uuid,
        outcome: RunOutcome,
        elapsed_secs: f64,
    },
    TrialStarted {
        trial_id: TrialId,
        bracket: usize,
        milestone: u64,
        /// Expected improvement of the pick; `None` during random warm-up.
        score: Option<f64>,
    },
    TrialResumed {
        trial_id: TrialId,
        milestone: u64,
    },
    TrialDispatchFailed {
        trial_id: TrialId,
        error: String,
    },
    ReportRejected {
        trial_id: TrialId,
        resource: u64,
        reason: String,
    },
    Decision {
        trial_id: TrialId,
        resource: u64,
        value: f64,
        decision: Decision,
        cutoff: Option<f64>,
    },
    RefitCompleted {
        num_curves: usize,
        num_samples: usize,
        mean_log_likelihood: f64,
        fantasized_levels: usize,
    },
    RefitFailed {
        error: String,
    },
    BestUpdated {
        trial_id: TrialId,
        resource: u64,
        value: f64,
        elapsed_secs: f64,
    },
    RungSummaries {
        rungs: Vec<RungSummary>,
    },
}
