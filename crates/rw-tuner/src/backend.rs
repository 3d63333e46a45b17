//! Execution backend abstraction.

use async_trait::async_trait;
use rw_types::{BackendError, Configuration, TrialId, TrialReport};

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Runs trials on behalf of the tuner.
///
/// Implementations may drive a real training cluster or simulate execution
/// in-process (see [`crate::simulated::SimulatedBackend`]). Every call is a
/// request; the trial's progress only ever reaches the tuner through
/// [`Backend::poll_reports`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start training `config` from scratch. `milestone` is the first
    /// resource level the scheduler will judge the trial at.
    async fn start_trial(
        &mut self,
        trial_id: TrialId,
        config: &Configuration,
        milestone: u64,
    ) -> BackendResult<()>;

    /// Stop a trial for good.
    async fn stop_trial(&mut self, trial_id: TrialId) -> BackendResult<()>;

    /// Suspend a trial, keeping its state so it can be resumed.
    async fn pause_trial(&mut self, trial_id: TrialId) -> BackendResult<()>;

    /// Resume a paused trial until it reaches `milestone`.
    async fn resume_trial(&mut self, trial_id: TrialId, milestone: u64) -> BackendResult<()>;

    /// Whether [`Backend::pause_trial`] and [`Backend::resume_trial`] work.
    fn supports_pause_resume(&self) -> bool;

    /// Reports produced since the previous poll, in arrival order.
    async fn poll_reports(&mut self) -> BackendResult<Vec<TrialReport>>;
}
