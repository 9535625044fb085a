use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::parser::{extract_code, FeedbackSource};
use crate::error::Result;
use crate::sandbox::output::validate_basename;
use crate::sandbox::ExecutionOutcome;

/// Input to one generate-execute-reflect run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub dataset_path: PathBuf,
    pub instruction: String,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    #[serde(default = "default_reflection_model")]
    pub reflection_model: String,
    #[serde(default = "default_basename")]
    pub output_basename: String,
}

impl WorkflowRequest {
    pub fn new(dataset_path: impl Into<PathBuf>, instruction: &str) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            instruction: instruction.to_string(),
            generation_model: default_generation_model(),
            reflection_model: default_reflection_model(),
            output_basename: default_basename(),
        }
    }

    pub fn with_models(mut self, generation: &str, reflection: &str) -> Self {
        self.generation_model = generation.to_string();
        self.reflection_model = reflection.to_string();
        self
    }

    pub fn with_basename(mut self, basename: &str) -> Self {
        self.output_basename = basename.to_string();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_basename(&self.output_basename)
    }
}

pub fn default_generation_model() -> String {
    "gpt-4.1-mini".to_string()
}

pub fn default_reflection_model() -> String {
    "o4-mini".to_string()
}

pub fn default_basename() -> String {
    "chart".to_string()
}

/// Model output for one generation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub raw: String,
    pub code: Option<String>,
    /// A sentinel-delimited block was present.
    pub well_formed: bool,
}

impl GenerationResult {
    pub fn from_response(raw: String) -> Self {
        let code = extract_code(&raw);
        Self {
            well_formed: code.is_some(),
            code,
            raw,
        }
    }

    /// Code worth executing, if any.
    pub fn runnable_code(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReflectionResult {
    #[serde(flatten)]
    pub generation: GenerationResult,
    pub feedback: String,
    pub feedback_source: FeedbackSource,
    /// The refined code in sentinel-wrapped form.
    pub refined_block: String,
}

/// Result of one phase, tagged by how well it went.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseResult<T> {
    Success { value: T },
    /// Usable but incomplete output.
    Degraded { value: T, reason: String },
    /// No output; later phases run with empty inputs.
    Failed { error: String },
}

impl<T> PhaseResult<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            PhaseResult::Success { value } | PhaseResult::Degraded { value, .. } => Some(value),
            PhaseResult::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseResult::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseResult::Failed { .. })
    }

    /// `Success` when there are no reasons, `Degraded` otherwise.
    pub fn from_reasons(value: T, reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            PhaseResult::Success { value }
        } else {
            PhaseResult::Degraded {
                value,
                reason: reasons.join("; "),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Linear run states; each run visits all of them exactly once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Start,
    DataLoaded,
    V1Generated,
    V1Executed,
    Reflected,
    V2Executed,
    Done,
}

impl WorkflowState {
    pub fn next(self) -> Option<Self> {
        match self {
            WorkflowState::Start => Some(WorkflowState::DataLoaded),
            WorkflowState::DataLoaded => Some(WorkflowState::V1Generated),
            WorkflowState::V1Generated => Some(WorkflowState::V1Executed),
            WorkflowState::V1Executed => Some(WorkflowState::Reflected),
            WorkflowState::Reflected => Some(WorkflowState::V2Executed),
            WorkflowState::V2Executed => Some(WorkflowState::Done),
            WorkflowState::Done => None,
        }
    }
}

/// Overall quality of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunQuality {
    /// Every phase succeeded and both charts were produced.
    Complete,
    /// At least one chart was produced but something degraded along the way.
    Degraded,
    /// Neither execution produced a chart.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub request: WorkflowRequest,
    pub dataset: PhaseResult<DatasetInfo>,
    pub draft: PhaseResult<GenerationResult>,
    pub draft_execution: ExecutionOutcome,
    pub reflection: PhaseResult<ReflectionResult>,
    pub refined_execution: ExecutionOutcome,
    pub states: Vec<WorkflowState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn quality(&self) -> RunQuality {
        let v1 = self.draft_execution.success();
        let v2 = self.refined_execution.success();

        if !v1 && !v2 {
            RunQuality::Failed
        } else if v1
            && v2
            && self.draft_execution.artifact_present
            && self.refined_execution.artifact_present
            && self.dataset.is_success()
            && self.draft.is_success()
            && self.reflection.is_success()
        {
            RunQuality::Complete
        } else {
            RunQuality::Degraded
        }
    }

    pub fn feedback(&self) -> Option<&str> {
        self.reflection.value().map(|r| r.feedback.as_str())
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} [{:?}]: v1 {} ({}), v2 {} ({}), feedback: {}",
            self.request.output_basename,
            self.quality(),
            self.draft_execution.label(),
            self.draft_execution.chart_path.display(),
            self.refined_execution.label(),
            self.refined_execution.chart_path.display(),
            self.feedback().unwrap_or("<none>"),
        )
    }
}
