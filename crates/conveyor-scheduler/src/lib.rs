//! Scheduling and execution for Conveyor CI.
//!
//! Provides:
//! - Input resolution across `passed` constraints
//! - The job scheduler and its trigger and concurrency policies
//! - The build plan factory
//! - The execution engine running plans on the worker pool
//! - Resource checks feeding the version history
//! - The [`ControlPlane`] facade tying them together

pub mod check;
pub mod engine;
pub mod inputs;
pub mod planner;
pub mod runner;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod fixtures;

pub use check::ResourceChecker;
pub use engine::{BuildEvent, ExecutionEngine, StepOutcome};
pub use inputs::InputResolver;
pub use planner::BuildPlanFactory;
pub use scheduler::{JobScheduler, ScheduleOutcome, TickReport, TriggerOutcome};
pub use service::{ControlPlane, DestroyReport};
