//! The tuning loop that ties the store, the scheduler, the surrogate and a
//! [`Backend`] together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::Sender;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rw_scheduler::{
    AsyncScheduler, Decision, RungEstimator, RungSummary, ScheduleDecision, SchedulerType,
    StatusCounts,
};
use rw_store::ObservationStore;
use rw_surrogate::{CandidateSelector, ResourceGrid, SurrogateModel, SurrogateState};
use rw_types::{
    internal_error, Configuration, ConfigurationSpace, Observation, ReportStatus, RwResult,
    SchedulerError, SurrogateError, TrialId, TrialReport, TrialStatus,
};

use crate::backend::Backend;
use crate::config::TunerConfig;
use crate::events::TunerEvent;

/// Budget that ended a run normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxTrials,
    Wallclock,
    Cost,
    TargetReached,
    /// Every configuration of the space has been tried.
    SpaceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Finished(StopReason),
    FailureBudgetExceeded { failures: usize },
    Cancelled,
}

/// Handle to cancel a running tuner from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub best: Option<Observation>,
    pub trials: StatusCounts,
    pub num_observations: usize,
    pub rejected_reports: usize,
    pub refits: usize,
    pub failed_refits: usize,
    /// Total resource consumed.
    pub cost: f64,
    pub elapsed_secs: f64,
    pub rungs: Vec<RungSummary>,
}

/// Asynchronous multi-fidelity tuner.
///
/// A single task owns every trial, rung and surrogate state; trials execute
/// inside the backend and only reach the tuner through polled reports.
pub struct Tuner<B: Backend> {
    run_id: Uuid,
    config: TunerConfig,
    space: ConfigurationSpace,
    backend: B,
    store: ObservationStore,
    scheduler: AsyncScheduler,
    model: SurrogateModel,
    selector: CandidateSelector,
    state: Option<SurrogateState>,
    rng: ChaCha8Rng,
    cancel: CancelHandle,
    events: Option<Sender<TunerEvent>>,
    decisions: Vec<ScheduleDecision>,
    best: Option<Observation>,
    /// Highest resource recorded per trial.
    consumed: BTreeMap<TrialId, u64>,
    cost: f64,
    failures: usize,
    rejected_reports: usize,
    new_observations: usize,
    refits: usize,
    failed_refits: usize,
    stop_sent: BTreeSet<TrialId>,
    space_exhausted: bool,
    started_at: Instant,
    last_refit: Instant,
}

impl<B: Backend> Tuner<B> {
    pub fn new(config: TunerConfig, space: ConfigurationSpace, backend: B) -> RwResult<Self> {
        config.validate()?;
        space.validate()?;

        let scheduler = AsyncScheduler::new(config.scheduler.clone(), config.direction)?;
        let grid = ResourceGrid::new(config.scheduler.r_min, config.scheduler.r_max);
        let model = SurrogateModel::new(
            space.clone(),
            grid,
            config.direction,
            config.surrogate.clone(),
        );
        let selector = CandidateSelector::new(config.acquisition.clone());
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let now = Instant::now();

        Ok(Self {
            run_id: Uuid::new_v4(),
            config,
            space,
            backend,
            store: ObservationStore::new(),
            scheduler,
            model,
            selector,
            state: None,
            rng,
            cancel: CancelHandle::default(),
            events: None,
            decisions: Vec::new(),
            best: None,
            consumed: BTreeMap::new(),
            cost: 0.0,
            failures: 0,
            rejected_reports: 0,
            new_observations: 0,
            refits: 0,
            failed_refits: 0,
            stop_sent: BTreeSet::new(),
            space_exhausted: false,
            started_at: now,
            last_refit: now,
        })
    }

    /// Send telemetry to `tx`.
    pub fn with_event_sender(mut self, tx: Sender<TunerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    // -- accessors ----------------------------------------------------------

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn scheduler(&self) -> &AsyncScheduler {
        &self.scheduler
    }

    pub fn surrogate(&self) -> Option<&SurrogateState> {
        self.state.as_ref()
    }

    /// Every scheduling decision, in the order it was taken.
    pub fn decisions(&self) -> &[ScheduleDecision] {
        &self.decisions
    }

    pub fn best(&self) -> Option<&Observation> {
        self.best.as_ref()
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    fn emit(&self, event: TunerEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }
    }

    // -- main loop ----------------------------------------------------------

    /// Run until a stopping criterion fires, the failure budget is exceeded
    /// or the run is cancelled.
    pub async fn run(&mut self) -> RwResult<TuningSummary> {
        self.started_at = Instant::now();
        self.last_refit = self.started_at;

        if !self.backend.supports_pause_resume() {
            self.scheduler.downgrade_to_stopping();
        }

        info!(
            run_id = %self.run_id,
            workers = self.config.num_workers,
            seed = self.config.seed,
            scheduler_type = ?self.scheduler.scheduler_type(),
            "tuning run started"
        );
        self.emit(TunerEvent::RunStarted {
            run_id: self.run_id,
            num_workers: self.config.num_workers,
        });

        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "tuning run aborted");
                if let Err(shutdown_err) = self.shutdown().await {
                    warn!(error = %shutdown_err, "shutdown after abort failed");
                }
                return Err(e);
            }
        };

        let summary = self.summary(outcome);
        self.emit(TunerEvent::RungSummaries {
            rungs: summary.rungs.clone(),
        });
        self.emit(TunerEvent::RunFinished {
            run_id: self.run_id,
            outcome,
            elapsed_secs: summary.elapsed_secs,
        });
        info!(
            run_id = %self.run_id,
            outcome = ?outcome,
            trials = summary.trials.total(),
            best = ?summary.best.as_ref().map(|o| o.value),
            cost = summary.cost,
            "tuning run finished"
        );
        Ok(summary)
    }

    /// The decision loop; returns once the run is over.
    async fn drive(&mut self) -> RwResult<RunOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                info!(run_id = %self.run_id, "run cancelled");
                self.shutdown().await?;
                return Ok(RunOutcome::Cancelled);
            }
            if self.failure_budget_exceeded() {
                error!(
                    failures = self.failures,
                    max_failures = self.config.max_failures,
                    "failure budget exceeded"
                );
                self.shutdown().await?;
                return Ok(RunOutcome::FailureBudgetExceeded {
                    failures: self.failures,
                });
            }
            if let Some(reason) = self.exhausted_budget() {
                info!(reason = ?reason, "stopping criterion reached");
                self.shutdown().await?;
                return Ok(RunOutcome::Finished(reason));
            }

            self.fill_slots().await?;
            if let Some(reason) = self.drain_reason() {
                if self.scheduler.counts().running == 0 {
                    self.shutdown().await?;
                    return Ok(RunOutcome::Finished(reason));
                }
            }

            let reports = self.backend.poll_reports().await?;
            if reports.is_empty() {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
            for report in &reports {
                match self.process_report(report) {
                    Ok(decision) => self.forward(&decision).await,
                    Err(e) => {
                        self.rejected_reports += 1;
                        warn!(trial_id = %report.trial_id, error = %e, "report dropped");
                        self.emit(TunerEvent::ReportRejected {
                            trial_id: report.trial_id,
                            resource: report.resource,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            self.maybe_refit().await?;
        }
    }

    /// Ingest one backend report: record it, update the incumbent and cost,
    /// and let the scheduler decide. Does not talk to the backend.
    pub fn process_report(&mut self, report: &TrialReport) -> RwResult<ScheduleDecision> {
        let trial = self
            .scheduler
            .trial(report.trial_id)
            .ok_or(SchedulerError::UnknownTrial {
                trial_id: report.trial_id,
            })?;

        if report.status != ReportStatus::Failed {
            let observation = Observation {
                trial_id: report.trial_id,
                config: trial.config.clone(),
                resource: report.resource,
                value: report.value,
                seed: self.config.seed,
            };
            if let Err(e) = self.store.record(observation.clone()) {
                self.rejected_reports += 1;
                self.emit(TunerEvent::ReportRejected {
                    trial_id: report.trial_id,
                    resource: report.resource,
                    reason: e.to_string(),
                });
                return Ok(ScheduleDecision {
                    trial_id: report.trial_id,
                    resource: report.resource,
                    value: report.value,
                    decision: Decision::Ignore,
                    rung: None,
                    cutoff: None,
                    timestamp: Utc::now(),
                });
            }

            let previous = self.consumed.insert(report.trial_id, report.resource);
            self.cost += report.resource.saturating_sub(previous.unwrap_or(0)) as f64;
            self.new_observations += 1;
            self.update_best(observation);
        }

        let estimator = self.state.as_ref().map(|s| s as &dyn RungEstimator);
        let decision = self.scheduler.on_report(report, estimator)?;
        if decision.decision == Decision::Fail {
            self.failures += 1;
        }

        debug!(
            trial_id = %decision.trial_id,
            resource = decision.resource,
            value = decision.value,
            decision = ?decision.decision,
            "report processed"
        );
        self.emit(TunerEvent::Decision {
            trial_id: decision.trial_id,
            resource: decision.resource,
            value: decision.value,
            decision: decision.decision,
            cutoff: decision.cutoff,
        });
        self.decisions.push(decision.clone());
        Ok(decision)
    }

    fn update_best(&mut self, observation: Observation) {
        let improved = self.best.as_ref().map_or(true, |b| {
            self.config.direction.is_better(observation.value, b.value)
        });
        if !improved {
            return;
        }
        let elapsed_secs = self.elapsed_secs();
        info!(
            trial_id = %observation.trial_id,
            resource = observation.resource,
            value = observation.value,
            "new best observation"
        );
        self.emit(TunerEvent::BestUpdated {
            trial_id: observation.trial_id,
            resource: observation.resource,
            value: observation.value,
            elapsed_secs,
        });
        self.best = Some(observation);
    }

    /// Pass a stop or pause decision on to the backend.
    async fn forward(&mut self, decision: &ScheduleDecision) {
        match decision.decision {
            Decision::Stop => self.request_stop(decision.trial_id).await,
            Decision::Pause => {
                if let Err(e) = self.backend.pause_trial(decision.trial_id).await {
                    warn!(trial_id = %decision.trial_id, error = %e, "pause request failed");
                }
            }
            _ => {}
        }
    }

    async fn request_stop(&mut self, trial_id: TrialId) {
        if !self.stop_sent.insert(trial_id) {
            return;
        }
        if let Err(e) = self.backend.stop_trial(trial_id).await {
            warn!(trial_id = %trial_id, error = %e, "stop request failed");
        }
    }

    /// Occupy free workers: promoted trials first, then new ones.
    async fn fill_slots(&mut self) -> RwResult<()> {
        while self.scheduler.counts().running < self.config.num_workers {
            if self.scheduler.scheduler_type() == SchedulerType::Promotion {
                if let Some((trial_id, milestone)) = self.scheduler.next_promotion() {
                    match self.backend.resume_trial(trial_id, milestone).await {
                        Ok(()) => self.emit(TunerEvent::TrialResumed {
                            trial_id,
                            milestone,
                        }),
                        Err(e) => {
                            warn!(trial_id = %trial_id, error = %e, "resume failed, stopping trial");
                            self.scheduler.mark_stopped(trial_id)?;
                            self.request_stop(trial_id).await;
                        }
                    }
                    continue;
                }
            }

            if self.drain_reason().is_some() || self.failure_budget_exceeded() {
                break;
            }
            self.start_trial().await?;
        }
        Ok(())
    }

    async fn start_trial(&mut self) -> RwResult<()> {
        let exclude: Vec<Configuration> = self
            .scheduler
            .trials()
            .map(|t| t.config.clone())
            .collect();
        let state = if self.scheduler.num_trials() < self.config.acquisition.num_initial_random {
            None
        } else {
            self.state.as_ref()
        };
        let candidate = match self.selector.select(state, &self.space, &exclude, &mut self.rng) {
            Ok(candidate) => candidate,
            Err(SurrogateError::EmptyCandidatePool { attempts }) => {
                info!(
                    trials = self.scheduler.num_trials(),
                    attempts,
                    "no untried configuration left, draining running trials"
                );
                self.space_exhausted = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let (trial_id, milestone) = self
            .scheduler
            .create_trial(candidate.config.clone(), &mut self.rng);
        let bracket = self
            .scheduler
            .trial(trial_id)
            .map(|t| t.bracket)
            .unwrap_or(0);

        match self
            .backend
            .start_trial(trial_id, &candidate.config, milestone)
            .await
        {
            Ok(()) => {
                self.scheduler.mark_running(trial_id)?;
                info!(
                    trial_id = %trial_id,
                    bracket,
                    milestone,
                    score = ?candidate.score,
                    "trial started"
                );
                self.emit(TunerEvent::TrialStarted {
                    trial_id,
                    bracket,
                    milestone,
                    score: candidate.score,
                });
            }
            Err(e) => {
                self.failures += 1;
                warn!(trial_id = %trial_id, error = %e, "trial dispatch failed");
                self.scheduler.mark_failed(trial_id, e.to_string())?;
                self.emit(TunerEvent::TrialDispatchFailed {
                    trial_id,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn maybe_refit(&mut self) -> RwResult<()> {
        if self.new_observations == 0 {
            return Ok(());
        }
        let due = self.new_observations >= self.config.refit.min_new_observations
            || self.last_refit.elapsed() >= self.config.refit.max_interval();
        if due {
            self.refit().await?;
        }
        Ok(())
    }

    /// Refit the surrogate on a snapshot of the store. A failed fit keeps the
    /// previous state.
    pub async fn refit(&mut self) -> RwResult<()> {
        let snapshot = self.store.snapshot();
        let pending = self.scheduler.pending_trials();
        let model = self.model.clone();
        let seed: u64 = self.rng.gen();
        self.new_observations = 0;
        self.last_refit = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            model.fit(&snapshot, &pending, &mut rng)
        })
        .await
        .map_err(|e| internal_error!("refit task failed: {}", e))?;

        match result {
            Ok(state) => {
                self.refits += 1;
                let d = state.diagnostics();
                self.emit(TunerEvent::RefitCompleted {
                    num_curves: d.num_curves,
                    num_samples: d.num_samples,
                    mean_log_likelihood: d.mean_log_likelihood,
                    fantasized_levels: d.fantasized_levels,
                });
                self.state = Some(state);
                self.emit(TunerEvent::RungSummaries {
                    rungs: self.scheduler.rung_summaries(),
                });
            }
            Err(e) => {
                self.failed_refits += 1;
                warn!(error = %e, "refit failed, keeping the previous surrogate state");
                self.emit(TunerEvent::RefitFailed {
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    // -- budgets ------------------------------------------------------------

    fn max_trials_reached(&self) -> bool {
        self.config
            .stopping
            .max_trials
            .is_some_and(|n| self.scheduler.num_trials() >= n)
    }

    /// Why no new trial may be dispatched while running ones finish.
    fn drain_reason(&self) -> Option<StopReason> {
        if self.max_trials_reached() {
            Some(StopReason::MaxTrials)
        } else if self.space_exhausted {
            Some(StopReason::SpaceExhausted)
        } else {
            None
        }
    }

    fn failure_budget_exceeded(&self) -> bool {
        self.failures > self.config.max_failures
    }

    fn exhausted_budget(&self) -> Option<StopReason> {
        let stopping = &self.config.stopping;
        if let (Some(target), Some(best)) = (stopping.target_metric, &self.best) {
            if self.config.direction.at_least_as_good(best.value, target) {
                return Some(StopReason::TargetReached);
            }
        }
        if stopping.max_cost.is_some_and(|c| self.cost >= c) {
            return Some(StopReason::Cost);
        }
        if stopping
            .max_wallclock_secs
            .is_some_and(|w| self.elapsed_secs() >= w)
        {
            return Some(StopReason::Wallclock);
        }
        None
    }

    /// Stop every running and paused trial.
    async fn shutdown(&mut self) -> RwResult<()> {
        let mut active = self.scheduler.trials_with_status(TrialStatus::Running);
        active.extend(self.scheduler.trials_with_status(TrialStatus::Paused));
        if !active.is_empty() {
            info!(trials = active.len(), "stopping active trials");
        }
        for trial_id in active {
            self.scheduler.mark_stopped(trial_id)?;
            self.request_stop(trial_id).await;
        }
        Ok(())
    }

    fn summary(&self, outcome: RunOutcome) -> TuningSummary {
        TuningSummary {
            run_id: self.run_id,
            outcome,
            best: self.best.clone(),
            trials: self.scheduler.counts(),
            num_observations: self.store.len(),
            rejected_reports: self.rejected_reports,
            refits: self.refits,
            failed_refits: self.failed_refits,
            cost: self.cost,
            elapsed_secs: self.elapsed_secs(),
            rungs: self.scheduler.rung_summaries(),
        }
    }
}
