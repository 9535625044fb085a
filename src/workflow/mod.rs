pub mod batch;
pub mod chart;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use chart::Workflow;
pub use types::{
    GenerationResult, PhaseResult, ReflectionResult, RunQuality, WorkflowRequest, WorkflowResult,
    WorkflowState,
};
