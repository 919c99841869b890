//! Pipeline orchestration for tdpflow.
//!
//! This crate ties steps from `tdpflow-agents` to document bookkeeping:
//! the [`WorkflowRunner`] executes single steps, and [`AgentGroup`] runs
//! declarative [`PipelineSpec`]s from the [`GroupCatalog`].

pub mod groups;
pub mod pipeline;
pub mod runner;

pub use groups::GroupCatalog;
pub use pipeline::{AgentGroup, Input, Parent, PipelineSpec, StepSpec, StepTarget};
pub use runner::{ProgressReporter, SilentProgress, StepOutcome, WorkflowRunner};
