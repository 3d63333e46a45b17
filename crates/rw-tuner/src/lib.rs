//! # rw-tuner
//!
//! Asynchronous orchestration loop for Rungwise.
//!
//! A [`Tuner`] asks the acquisition component for configurations, the
//! scheduler for lifecycle decisions and an execution [`Backend`] for results,
//! refitting the Freeze-Thaw surrogate as observations accumulate.

pub mod backend;
pub mod config;
pub mod events;
pub mod simulated;
pub mod tuner;

pub use backend::{Backend, BackendResult};
pub use config::{RefitPolicy, StoppingCriterion, TunerConfig};
pub use events::TunerEvent;
pub use simulated::{Objective, SimulatedBackend, SimulatedBackendConfig};
pub use tuner::{CancelHandle, RunOutcome, StopReason, Tuner, TuningSummary};
