//! IMRT planning workflow against an external treatment planning system.
//!
//! Loads a curated patient dataset, builds a fluence optimization problem
//! from a clinical protocol, exports the optimal fluence for leaf sequencing
//! and final dose calculation outside this crate, and runs a fixed-point
//! correction loop that closes the gap between the truncated influence
//! matrix used during optimization and the full one.
//!
//! The high-level entry points live in [`entry`]:
//! [`entry::run_plan_workflow`] for plan-and-export,
//! [`entry::run_correction_workflow`] for the full exchange including the
//! correction loop and optional re-import of externally calculated dose.

pub mod data;
pub mod entry;
pub mod eval;
pub mod io;
pub mod optim;
pub mod plan;
pub mod utils;

pub use entry::{run_correction_workflow, run_plan_workflow, WorkflowConfig};
pub use optim::{FluenceProblem, FluenceSolver, Solution};
pub use plan::Plan;
