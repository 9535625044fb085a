use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::agent::parser::{ensure_wrapped, extract_code, extract_feedback_and_code, FeedbackSource};
use crate::agent::prompt::{self, CodeConstraints, DatasetSchema};
use crate::config::AppConfig;
use crate::error::Result;
use crate::llm::{media_type_for, HttpGateway, ModelGateway};
use crate::sandbox::{
    Binding, ExecutionContext, ExecutionOutcome, ExecutionStatus, Executor, OutputDir,
    PythonSandbox, Version,
};
use crate::workflow::types::{
    DatasetInfo, GenerationResult, PhaseResult, ReflectionResult, WorkflowRequest, WorkflowResult,
    WorkflowState,
};

/// Draft, execute, reflect, and re-execute one chart.
///
/// Phases never abort the run. A failed or degraded phase is recorded and
/// the next phase proceeds with whatever is left (possibly nothing). This
/// is a best-effort demo policy: callers judge a run by its
/// [`WorkflowResult::quality`], not by an error.
pub struct Workflow {
    gateway: Arc<dyn ModelGateway>,
    executor: Arc<dyn Executor>,
    output: OutputDir,
    schema: DatasetSchema,
    constraints: CodeConstraints,
    dataset_binding: String,
    require_artifact: bool,
}

impl Workflow {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        executor: Arc<dyn Executor>,
        config: &AppConfig,
    ) -> Self {
        Self {
            gateway,
            executor,
            output: OutputDir::new(config.sandbox.output_dir.clone()),
            schema: config.workflow.schema(),
            constraints: CodeConstraints {
                dpi: config.workflow.dpi,
                dataset_binding: config.workflow.dataset_binding.clone(),
            },
            dataset_binding: config.workflow.dataset_binding.clone(),
            require_artifact: config.workflow.require_artifact,
        }
    }

    /// Workflow backed by the HTTP gateway and the Python sandbox.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let gateway: Arc<dyn ModelGateway> = Arc::new(HttpGateway::new(config)?);
        let executor: Arc<dyn Executor> = Arc::new(PythonSandbox::new(&config.sandbox));
        Ok(Self::new(gateway, executor, config))
    }

    pub fn output_dir(&self) -> &OutputDir {
        &self.output
    }

    /// Run all phases. Only an invalid request is an error; everything that
    /// goes wrong after the first phase starts is reported in the result.
    pub async fn run(&self, request: &WorkflowRequest) -> Result<WorkflowResult> {
        request.validate()?;
        let chart_v1 = self.output.chart_path(&request.output_basename, Version::V1)?;
        let chart_v2 = self.output.chart_path(&request.output_basename, Version::V2)?;

        let started_at = Utc::now();
        let mut states = StateLog::new(&request.output_basename);

        tracing::info!(
            run = %request.output_basename,
            dataset = %request.dataset_path.display(),
            generation_model = %request.generation_model,
            reflection_model = %request.reflection_model,
            "Starting chart workflow"
        );

        if let Err(e) = self.output.ensure().await {
            tracing::warn!(error = %e, "Output directory unavailable");
        }

        let dataset = self.load_dataset(&request.dataset_path).await;
        states.advance(WorkflowState::DataLoaded);

        let draft = self.generate_draft(request, &chart_v1).await;
        states.advance(WorkflowState::V1Generated);

        let draft_code = draft.value().and_then(|g| g.runnable_code());
        let draft_execution = self
            .execute(draft_code, &request.dataset_path, &chart_v1)
            .await;
        states.advance(WorkflowState::V1Executed);

        let original_code = match draft.value() {
            Some(g) => g.code.clone().unwrap_or_else(|| g.raw.clone()),
            None => String::new(),
        };
        let reflection = self
            .reflect(request, &original_code, &chart_v1, &chart_v2)
            .await;
        states.advance(WorkflowState::Reflected);

        let refined_code = reflection.value().and_then(|r| r.generation.runnable_code());
        let refined_execution = self
            .execute(refined_code, &request.dataset_path, &chart_v2)
            .await;
        states.advance(WorkflowState::V2Executed);
        states.advance(WorkflowState::Done);

        let result = WorkflowResult {
            request: request.clone(),
            dataset,
            draft,
            draft_execution,
            reflection,
            refined_execution,
            states: states.into_states(),
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            run = %request.output_basename,
            quality = ?result.quality(),
            "{}",
            result.summary()
        );

        Ok(result)
    }

    async fn load_dataset(&self, path: &Path) -> PhaseResult<DatasetInfo> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => PhaseResult::Success {
                value: DatasetInfo {
                    path: path.to_path_buf(),
                    size_bytes: meta.len(),
                },
            },
            Ok(_) => PhaseResult::Failed {
                error: format!("dataset is not a file: {}", path.display()),
            },
            Err(e) => {
                tracing::warn!(dataset = %path.display(), error = %e, "Dataset unavailable");
                PhaseResult::Failed {
                    error: format!("dataset unavailable: {e}"),
                }
            }
        }
    }

    async fn generate_draft(
        &self,
        request: &WorkflowRequest,
        chart_v1: &Path,
    ) -> PhaseResult<GenerationResult> {
        let prompt = prompt::build_generation_prompt(
            &request.instruction,
            &self.schema,
            &file_name(chart_v1),
            &self.constraints,
        );

        match self.gateway.call(&request.generation_model, &prompt).await {
            Ok(raw) => {
                let generation = GenerationResult::from_response(raw);
                let mut reasons = Vec::new();
                if !generation.well_formed {
                    reasons.push("response had no <execute_python> block".to_string());
                } else if generation.runnable_code().is_none() {
                    reasons.push("code block was empty".to_string());
                }
                PhaseResult::from_reasons(generation, reasons)
            }
            Err(e) => PhaseResult::Failed {
                error: e.to_string(),
            },
        }
    }

    async fn reflect(
        &self,
        request: &WorkflowRequest,
        original_code: &str,
        chart_v1: &Path,
        chart_v2: &Path,
    ) -> PhaseResult<ReflectionResult> {
        let prompt = prompt::build_reflection_prompt(
            &request.instruction,
            &self.schema,
            original_code,
            &file_name(chart_v2),
            &self.constraints,
        );

        let mut reasons = Vec::new();
        let response = match tokio::fs::read(chart_v1).await {
            Ok(image) => {
                self.gateway
                    .call_with_image(
                        &request.reflection_model,
                        &prompt,
                        &image,
                        media_type_for(chart_v1),
                    )
                    .await
            }
            Err(e) => {
                tracing::warn!(
                    chart = %chart_v1.display(),
                    error = %e,
                    "Draft chart unavailable, reflecting on code only"
                );
                reasons.push(format!("draft chart unavailable: {e}"));
                self.gateway.call(&request.reflection_model, &prompt).await
            }
        };

        let raw = match response {
            Ok(raw) => raw,
            Err(e) => {
                return PhaseResult::Failed {
                    error: e.to_string(),
                }
            }
        };

        let parsed = extract_feedback_and_code(&raw);
        if parsed.source == FeedbackSource::Placeholder {
            reasons.push(format!("feedback not parsed: {}", parsed.feedback));
        }
        if parsed.code.is_none() {
            reasons.push("response had no <execute_python> block".to_string());
        }

        let refined_block = ensure_wrapped(parsed.code.as_deref().unwrap_or(""));
        let code = extract_code(&refined_block);

        let reflection = ReflectionResult {
            generation: GenerationResult {
                well_formed: parsed.code.is_some(),
                code,
                raw,
            },
            feedback: parsed.feedback,
            feedback_source: parsed.source,
            refined_block,
        };
        PhaseResult::from_reasons(reflection, reasons)
    }

    async fn execute(
        &self,
        code: Option<&str>,
        dataset_path: &Path,
        chart_path: &Path,
    ) -> ExecutionOutcome {
        clear_stale_chart(chart_path).await;

        let Some(code) = code else {
            tracing::info!(chart = %chart_path.display(), "No code to execute");
            return ExecutionOutcome::no_op(chart_path.to_path_buf());
        };

        let context = ExecutionContext::new(chart_path.to_path_buf()).bind(
            &self.dataset_binding,
            Binding::Table {
                csv_path: absolute(dataset_path),
            },
        );

        let mut outcome = self.executor.execute(code, &context).await;
        self.check_artifact(&mut outcome).await;
        outcome
    }

    /// Record whether the chart exists; optionally fail clean runs without one.
    async fn check_artifact(&self, outcome: &mut ExecutionOutcome) {
        outcome.artifact_present = tokio::fs::try_exists(&outcome.chart_path)
            .await
            .unwrap_or(false);

        if outcome.success() && !outcome.artifact_present {
            tracing::warn!(
                chart = %outcome.chart_path.display(),
                "Code ran cleanly but the chart was not written"
            );
            if self.require_artifact {
                outcome.status = ExecutionStatus::MissingArtifact;
            }
        }
    }
}

/// Visited states, logged as they happen.
struct StateLog {
    run: String,
    states: Vec<WorkflowState>,
}

impl StateLog {
    fn new(run: &str) -> Self {
        Self {
            run: run.to_string(),
            states: vec![WorkflowState::Start],
        }
    }

    fn advance(&mut self, state: WorkflowState) {
        let current = *self.states.last().unwrap_or(&WorkflowState::Start);
        debug_assert_eq!(current.next(), Some(state), "out-of-order transition");
        tracing::info!(run = %self.run, from = ?current, to = ?state, "Workflow transition");
        self.states.push(state);
    }

    fn into_states(self) -> Vec<WorkflowState> {
        self.states
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Remove a chart left by an earlier run with the same basename, so presence
/// checks and reflection only ever see this run's output.
async fn clear_stale_chart(chart_path: &Path) {
    match tokio::fs::remove_file(chart_path).await {
        Ok(()) => {
            tracing::debug!(chart = %chart_path.display(), "Removed chart from a previous run")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            chart = %chart_path.display(),
            error = %e,
            "Could not remove previous chart"
        ),
    }
}

/// The sandbox runs in the output directory, so relative dataset paths
/// must be resolved first.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::sandbox::ExecutionStatus;
    use crate::workflow::testing::{RecordingExecutor, ScriptedGateway};
    use crate::workflow::types::RunQuality;

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: AppConfig,
        dataset: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = tmp.path().join("coffee_sales.csv");
        std::fs::write(&dataset, "date,price\n1/5/24,3.5\n").unwrap();
        let mut config = AppConfig::default();
        config.sandbox.output_dir = tmp.path().join("charts");
        Fixture {
            _tmp: tmp,
            config,
            dataset,
        }
    }

    fn workflow(
        fx: &Fixture,
        gateway: &Arc<ScriptedGateway>,
        executor: &Arc<RecordingExecutor>,
    ) -> Workflow {
        let gateway: Arc<dyn ModelGateway> = gateway.clone();
        let executor: Arc<dyn Executor> = executor.clone();
        Workflow::new(gateway, executor, &fx.config)
    }

    const DRAFT: &str = "<execute_python>import m\nm.savefig(\"out_v1.png\")</execute_python>";
    const REFLECTION: &str =
        "{\"feedback\": \"too cluttered\"}\n<execute_python>code</execute_python>";

    #[tokio::test]
    async fn test_draft_code_is_executed_and_chart_recorded() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(&fx.dataset, "plot X").with_basename("out");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        assert!(result.draft_execution.success());
        assert_eq!(
            result.draft_execution.chart_path,
            fx.config.sandbox.output_dir.join("out_v1.png")
        );
        assert!(result.draft_execution.artifact_present);
        assert_eq!(executor.executed()[0], "import m\nm.savefig(\"out_v1.png\")");
        assert_eq!(result.quality(), RunQuality::Complete);
    }

    #[tokio::test]
    async fn test_missing_sentinels_make_draft_execution_a_no_op() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok("import matplotlib.pyplot as plt\nplt.plot([1, 2])"),
            Ok(REFLECTION),
        ]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        let draft = result.draft.value().unwrap();
        assert_eq!(draft.code, None);
        assert!(!draft.well_formed);
        assert!(matches!(result.draft, PhaseResult::Degraded { .. }));
        assert_eq!(result.draft_execution.status, ExecutionStatus::NoOp);
        assert!(!result.draft_execution.is_error());
        // Only the refined code reached the executor.
        assert_eq!(executor.executed(), vec!["code".to_string()]);
    }

    #[tokio::test]
    async fn test_reflection_parses_feedback_and_code() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(&fx.dataset, "plot X").with_models("gpt-4.1-mini", "claude-3-7-sonnet");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        let reflection = result.reflection.value().unwrap();
        assert_eq!(reflection.feedback, "too cluttered");
        assert_eq!(reflection.feedback_source, FeedbackSource::FirstLine);
        assert_eq!(reflection.generation.code.as_deref(), Some("code"));
        assert_eq!(reflection.refined_block, "<execute_python>\ncode\n</execute_python>");
        assert_eq!(result.feedback(), Some("too cluttered"));

        let calls = gateway.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model, "gpt-4.1-mini");
        assert!(calls[0].image.is_none());
        assert_eq!(calls[1].model, "claude-3-7-sonnet");
        let (image, media_type) = calls[1].image.clone().unwrap();
        assert_eq!(image, b"\x89PNG fake".to_vec());
        assert_eq!(media_type, "image/png");
        assert!(calls[1].prompt.contains("import m\nm.savefig(\"out_v1.png\")"));
        assert!(calls[1].prompt.contains("Save to 'chart_v2.png'"));
    }

    #[tokio::test]
    async fn test_timeout_is_visible_and_run_completes() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::with_status(
            ExecutionStatus::Timeout { limit_ms: 30_000 },
            false,
        ));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        assert_eq!(
            result.draft_execution.status,
            ExecutionStatus::Timeout { limit_ms: 30_000 }
        );
        assert!(result.draft_execution.is_error());
        // Reflection still ran, on code only since no chart exists.
        assert!(matches!(result.reflection, PhaseResult::Degraded { .. }));
        assert!(gateway.calls()[1].image.is_none());
        assert_eq!(result.quality(), RunQuality::Failed);
        assert_eq!(result.states.last(), Some(&WorkflowState::Done));
    }

    #[tokio::test]
    async fn test_model_failure_does_not_stop_later_phases() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Err("401 unauthorized"), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        match &result.draft {
            PhaseResult::Failed { error } => assert!(error.contains("401 unauthorized")),
            other => panic!("expected failed draft, got {other:?}"),
        }
        assert_eq!(result.draft_execution.status, ExecutionStatus::NoOp);
        assert!(gateway.calls()[1].prompt.contains("(no code was produced)"));
        assert!(result.refined_execution.success());
        assert_eq!(result.quality(), RunQuality::Degraded);
    }

    #[tokio::test]
    async fn test_all_states_visited_in_order() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Err("down"), Err("down")]));
        let executor = Arc::new(RecordingExecutor::succeeding(false));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        assert_eq!(
            result.states,
            vec![
                WorkflowState::Start,
                WorkflowState::DataLoaded,
                WorkflowState::V1Generated,
                WorkflowState::V1Executed,
                WorkflowState::Reflected,
                WorkflowState::V2Executed,
                WorkflowState::Done,
            ]
        );
        assert!(result.reflection.is_failed());
        assert_eq!(result.refined_execution.status, ExecutionStatus::NoOp);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_recorded_but_not_fatal_by_default() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(false));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();
        assert!(result.draft_execution.success());
        assert!(!result.draft_execution.artifact_present);
    }

    #[tokio::test]
    async fn test_require_artifact_turns_missing_chart_into_failure() {
        let mut fx = fixture();
        fx.config.workflow.require_artifact = true;
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(false));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();
        assert_eq!(result.draft_execution.status, ExecutionStatus::MissingArtifact);
        assert_eq!(result.refined_execution.status, ExecutionStatus::MissingArtifact);
        assert_eq!(result.quality(), RunQuality::Failed);
    }

    #[tokio::test]
    async fn test_charts_from_a_previous_run_are_not_reported() {
        let mut fx = fixture();
        fx.config.workflow.require_artifact = true;
        let charts = &fx.config.sandbox.output_dir;
        std::fs::create_dir_all(charts).unwrap();
        std::fs::write(charts.join("chart_v1.png"), b"OLD RUN").unwrap();
        std::fs::write(charts.join("chart_v2.png"), b"OLD RUN").unwrap();

        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(false));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        assert_eq!(result.draft_execution.status, ExecutionStatus::MissingArtifact);
        assert!(!result.draft_execution.artifact_present);
        assert_eq!(result.refined_execution.status, ExecutionStatus::MissingArtifact);
        assert!(!result.refined_execution.artifact_present);
        assert_eq!(result.quality(), RunQuality::Failed);
        // The old draft chart must not reach the reflection model.
        assert!(gateway.calls()[1].image.is_none());
        assert!(matches!(result.reflection, PhaseResult::Degraded { .. }));
    }

    #[tokio::test]
    async fn test_stale_chart_is_cleared_even_without_code() {
        let fx = fixture();
        let charts = &fx.config.sandbox.output_dir;
        std::fs::create_dir_all(charts).unwrap();
        std::fs::write(charts.join("chart_v1.png"), b"OLD RUN").unwrap();

        let gateway = Arc::new(ScriptedGateway::new(vec![Ok("no code here"), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(false));
        let request = WorkflowRequest::new(&fx.dataset, "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();

        assert_eq!(result.draft_execution.status, ExecutionStatus::NoOp);
        assert!(!charts.join("chart_v1.png").exists());
        assert!(gateway.calls()[1].image.is_none());
    }

    #[tokio::test]
    async fn test_missing_dataset_is_recorded() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(DRAFT), Ok(REFLECTION)]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(fx.dataset.with_file_name("missing.csv"), "plot X");

        let result = workflow(&fx, &gateway, &executor).run(&request).await.unwrap();
        assert!(result.dataset.is_failed());
        assert_eq!(result.quality(), RunQuality::Degraded);
    }

    #[tokio::test]
    async fn test_invalid_basename_is_rejected_before_any_call() {
        let fx = fixture();
        let gateway = Arc::new(ScriptedGateway::new(vec![]));
        let executor = Arc::new(RecordingExecutor::succeeding(true));
        let request = WorkflowRequest::new(&fx.dataset, "plot X").with_basename("../escape");

        let err = workflow(&fx, &gateway, &executor).run(&request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOutputPath(_)));
        assert!(gateway.calls().is_empty());
    }
}
