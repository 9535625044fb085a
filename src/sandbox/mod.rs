pub mod isolation;
pub mod output;
pub mod python;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

pub use isolation::{Confinement, Isolation};
pub use output::{OutputDir, Version};
pub use python::PythonSandbox;

/// A value made available to generated code under a variable name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    /// CSV file loaded as a DataFrame; calendar columns are derived from `date`.
    Table { csv_path: PathBuf },
    /// Plain JSON value.
    Value { value: serde_json::Value },
}

/// Everything one execution needs besides the code itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub bindings: BTreeMap<String, Binding>,
    /// Where the code is expected to write its chart.
    pub artifact_path: PathBuf,
}

impl ExecutionContext {
    pub fn new(artifact_path: PathBuf) -> Self {
        Self {
            bindings: BTreeMap::new(),
            artifact_path,
        }
    }

    pub fn bind(mut self, name: &str, binding: Binding) -> Self {
        self.bindings.insert(name.to_string(), binding);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Code ran to completion without raising.
    Succeeded,
    /// There was no code to run.
    NoOp,
    SyntaxError { message: String, line: Option<u32> },
    RuntimeError { message: String },
    Timeout { limit_ms: u64 },
    /// Code tried an import, file access or network call outside its allowance.
    CapabilityViolation { message: String },
    /// The interpreter could not be started.
    LaunchFailed { message: String },
    /// Code ran cleanly but never wrote its chart.
    MissingArtifact,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub chart_path: PathBuf,
    /// Whether `chart_path` existed after the run.
    pub artifact_present: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn new(status: ExecutionStatus, chart_path: PathBuf) -> Self {
        Self {
            status,
            chart_path,
            artifact_present: false,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
        }
    }

    pub fn no_op(chart_path: PathBuf) -> Self {
        Self::new(ExecutionStatus::NoOp, chart_path)
    }

    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self.status,
            ExecutionStatus::Succeeded | ExecutionStatus::NoOp
        )
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self.status {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::NoOp => "no_op",
            ExecutionStatus::SyntaxError { .. } => "syntax_error",
            ExecutionStatus::RuntimeError { .. } => "runtime_error",
            ExecutionStatus::Timeout { .. } => "timeout",
            ExecutionStatus::CapabilityViolation { .. } => "capability_violation",
            ExecutionStatus::LaunchFailed { .. } => "launch_failed",
            ExecutionStatus::MissingArtifact => "missing_artifact",
        }
    }
}

/// Runs generated code in isolation from the caller.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Never fails: every problem is reported through the outcome's status.
    async fn execute(&self, code: &str, context: &ExecutionContext) -> ExecutionOutcome;
}
