//! Long-running background processors.
//!
//! - `ReconciliationPipeline`: one runner per chain, matches transfers to orders
//! - `MaintenanceRunner`: reservation purge, stale-job requeue, job retention

pub mod maintenance;
pub mod reconciliation;

pub use maintenance::{MaintenanceRunner, SweepReport};
pub use reconciliation::{CycleReport, ReconcileError, ReconciliationPipeline, TransferOutcome};
