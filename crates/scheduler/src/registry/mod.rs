//! Job registry -- owns jobs, drives the scheduling tick, applies reports.
//!
//! Split into focused submodules:
//! - `core`: JobRegistry struct, creation, registration and lookups
//! - `placement`: worker capacity reconciliation and slot queries
//! - `scheduling`: the tick and the run loop
//! - `reports`: execution report application
//! - `control`: pause/resume/stop/cancel, table drops and purging
//! - `recovery`: edit log replay

mod control;
mod core;
mod placement;
mod recovery;
mod reports;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::core::JobRegistry;
pub use self::recovery::ReplaySummary;
pub use self::reports::ReportDisposition;
pub use self::scheduling::TickSummary;
