//! Append-only observation ledger for Rungwise.
//!
//! Reports are appended as they arrive; the surrogate and the scheduler read
//! immutable [`Snapshot`]s so a refit never sees a half-written report.

pub mod store;

pub use store::{ObservationStore, Snapshot, StoreStats};
