use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::workflow::{Workflow, WorkflowRequest, WorkflowResult};

type InFlight = Arc<Mutex<HashSet<String>>>;

pub struct AppState {
    pub config: AppConfig,
    pub workflow: Arc<Workflow>,
    /// Basenames of runs currently writing charts.
    in_flight: InFlight,
}

/// Holds a basename for the lifetime of one run. Dropping it releases the
/// name, including when the handler future is cancelled or panics.
pub struct RunClaim {
    in_flight: InFlight,
    basename: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.basename);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let workflow = Arc::new(Workflow::from_config(&config)?);
        Ok(Self::with_workflow(config, workflow))
    }

    pub fn with_workflow(config: AppConfig, workflow: Arc<Workflow>) -> Self {
        Self {
            config,
            workflow,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn get_in_flight_runs(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Claim `basename`, or `None` if another run holds it.
    fn claim(&self, basename: &str) -> Option<RunClaim> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(basename.to_string());
        inserted.then(|| RunClaim {
            in_flight: Arc::clone(&self.in_flight),
            basename: basename.to_string(),
        })
    }
}

/// Resolve a requested dataset path inside `data_dir` (path traversal and
/// symlink escapes are rejected).
pub async fn confine_dataset(data_dir: &Path, requested: &Path) -> Result<PathBuf> {
    let canonical_root = tokio::fs::canonicalize(data_dir).await.map_err(|e| {
        AppError::InvalidDataset(format!(
            "data directory {} unavailable: {e}",
            data_dir.display()
        ))
    })?;

    let full_path = canonical_root.join(requested);
    let canonical = tokio::fs::canonicalize(&full_path).await.map_err(|e| {
        AppError::InvalidDataset(format!("{}: {e}", requested.display()))
    })?;

    if !canonical.starts_with(&canonical_root) {
        return Err(AppError::InvalidDataset(format!(
            "{} is outside the data directory",
            requested.display()
        )));
    }

    Ok(canonical)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(run_chart))
        .route("/agents", get(list_agents))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "agents": [{
            "name": "chart_agent",
            "description": "Writes matplotlib code for a dataset, runs it, critiques the chart image, and runs a refined version.",
            "input": {
                "dataset_path": "CSV file path relative to the server's data directory",
                "instruction": "what the chart should show",
                "generation_model": "model for the first draft (default gpt-4.1-mini)",
                "reflection_model": "image-capable model for the critique (default o4-mini)",
                "output_basename": "distinct name for the chart files (default chart)"
            },
            "output_dir": state.config.sandbox.output_dir,
        }]
    }))
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

async fn run_chart(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<WorkflowRequest>,
) -> std::result::Result<Json<WorkflowResult>, ApiError> {
    if let Err(e) = request.validate() {
        return Err(api_error(StatusCode::BAD_REQUEST, e));
    }

    request.dataset_path = confine_dataset(&state.config.server.data_dir, &request.dataset_path)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected dataset path");
            api_error(StatusCode::BAD_REQUEST, e)
        })?;

    let basename = request.output_basename.clone();
    let Some(_claim) = state.claim(&basename) else {
        tracing::warn!(run = %basename, "Rejected run with an in-flight basename");
        return Err(api_error(
            StatusCode::CONFLICT,
            AppError::BasenameCollision(basename),
        ));
    };

    match state.workflow.run(&request).await {
        Ok(result) => Ok(Json(result)),
        Err(e @ AppError::InvalidOutputPath(_)) => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e) => {
            tracing::error!(run = %basename, error = %e, "Run failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::llm::ModelGateway;
    use crate::sandbox::Executor;
    use crate::workflow::testing::{RecordingExecutor, ScriptedGateway};

    /// Never answers, like a model backend that hangs.
    struct StalledGateway;

    #[async_trait]
    impl ModelGateway for StalledGateway {
        async fn call(&self, _model_id: &str, _prompt: &str) -> Result<String> {
            std::future::pending().await
        }

        async fn call_with_image(
            &self,
            _model_id: &str,
            _prompt: &str,
            _image: &[u8],
            _media_type: &str,
        ) -> Result<String> {
            std::future::pending().await
        }
    }

    fn state_with(tmp: &tempfile::TempDir, gateway: Arc<dyn ModelGateway>) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.sandbox.output_dir = tmp.path().join("charts");
        config.server.data_dir = tmp.path().join("data");
        std::fs::create_dir_all(&config.server.data_dir).unwrap();
        std::fs::write(config.server.data_dir.join("d.csv"), "date,price\n1/5/24,3.5\n").unwrap();
        let executor: Arc<dyn Executor> = Arc::new(RecordingExecutor::succeeding(true));
        let workflow = Arc::new(Workflow::new(gateway, executor, &config));
        Arc::new(AppState::with_workflow(config, workflow))
    }

    fn state(tmp: &tempfile::TempDir, responses: Vec<std::result::Result<&str, &str>>) -> Arc<AppState> {
        state_with(tmp, Arc::new(ScriptedGateway::new(responses)))
    }

    #[tokio::test]
    async fn test_run_returns_result_and_releases_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(
            &tmp,
            vec![
                Ok("<execute_python>x = 1</execute_python>"),
                Ok("{\"feedback\": \"fine\"}\n<execute_python>x = 2</execute_python>"),
            ],
        );
        let request = WorkflowRequest::new("d.csv", "plot").with_basename("api");

        let Json(result) = run_chart(State(Arc::clone(&state)), Json(request))
            .await
            .unwrap();
        assert_eq!(result.feedback(), Some("fine"));
        assert!(result.dataset.is_success());
        assert!(state.get_in_flight_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_basename_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp, vec![]);
        let _held = state.claim("busy").unwrap();

        let request = WorkflowRequest::new("d.csv", "plot").with_basename("busy");
        let (status, _) = run_chart(State(Arc::clone(&state)), Json(request))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with(&tmp, Arc::new(StalledGateway));

        let request = WorkflowRequest::new("d.csv", "plot");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            run_chart(State(Arc::clone(&state)), Json(request.clone())),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(state.get_in_flight_runs().await.is_empty());

        // The same basename is accepted again.
        let claim = state.claim(&request.output_basename);
        assert!(claim.is_some());
    }

    #[tokio::test]
    async fn test_claim_is_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp, vec![]);
        let claim = state.claim("chart").unwrap();
        assert!(state.claim("chart").is_none());
        drop(claim);
        assert!(state.claim("chart").is_some());
    }

    #[tokio::test]
    async fn test_invalid_basename_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp, vec![]);
        let request = WorkflowRequest::new("d.csv", "plot").with_basename("../x");
        let (status, Json(body)) = run_chart(State(state), Json(request)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("plain file name"));
    }

    #[tokio::test]
    async fn test_dataset_outside_data_dir_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("secret.csv"), "x\n1\n").unwrap();
        let state = state(&tmp, vec![]);

        for path in [tmp.path().join("secret.csv"), PathBuf::from("../secret.csv")] {
            let request = WorkflowRequest::new(path, "plot");
            let (status, Json(body)) = run_chart(State(Arc::clone(&state)), Json(request))
                .await
                .unwrap_err();
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().unwrap().contains("outside the data directory"));
        }
        assert!(state.get_in_flight_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_confine_dataset_resolves_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(data.join("sales")).unwrap();
        std::fs::write(data.join("sales/coffee.csv"), "date\n").unwrap();

        let resolved = confine_dataset(&data, Path::new("sales/coffee.csv")).await.unwrap();
        assert_eq!(resolved, data.canonicalize().unwrap().join("sales/coffee.csv"));
        assert!(confine_dataset(&data, Path::new("sales/missing.csv")).await.is_err());
    }

    #[tokio::test]
    async fn test_agents_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let Json(body) = list_agents(State(state(&tmp, vec![]))).await;
        assert_eq!(body["agents"][0]["name"], "chart_agent");
    }
}
