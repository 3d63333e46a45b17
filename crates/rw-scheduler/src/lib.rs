//! # rw-scheduler
//!
//! Asynchronous successive halving (ASHA) over Hyperband brackets.
//!
//! Every trial reports its metric at increasing resource levels. At each
//! rung level the scheduler compares the report with everything recorded
//! there so far and either lets the trial continue, stops it, or (in
//! promotion mode) pauses it until it ranks in the top `1/η` of its rung.

pub mod bracket;
pub mod rung;
pub mod scheduler;

pub use bracket::RungSystem;
pub use rung::{quantile_cutoff, RungLevel};
pub use scheduler::{
    AsyncScheduler, Decision, RungEstimator, RungSummary, ScheduleDecision, SchedulerConfig,
    SchedulerType, StatusCounts,
};
