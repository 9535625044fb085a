//! Scripted stand-ins for the model gateway and the sandbox.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::llm::ModelGateway;
use crate::sandbox::{ExecutionContext, ExecutionOutcome, ExecutionStatus, Executor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub model: String,
    pub prompt: String,
    pub image: Option<(Vec<u8>, String)>,
}

/// Returns queued responses in order; `Err` entries become model call errors.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<std::result::Result<&str, &str>>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, call: RecordedCall) -> Result<String> {
        self.calls.lock().unwrap().push(call);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(AppError::model_call("scripted", message)),
            None => Err(AppError::model_call("scripted", "no scripted response left")),
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn call(&self, model_id: &str, prompt: &str) -> Result<String> {
        self.next(RecordedCall {
            model: model_id.to_string(),
            prompt: prompt.to_string(),
            image: None,
        })
    }

    async fn call_with_image(
        &self,
        model_id: &str,
        prompt: &str,
        image: &[u8],
        media_type: &str,
    ) -> Result<String> {
        self.next(RecordedCall {
            model: model_id.to_string(),
            prompt: prompt.to_string(),
            image: Some((image.to_vec(), media_type.to_string())),
        })
    }
}

/// Records the code it is given and "succeeds", writing a fake chart when
/// `write_charts` is set.
pub struct RecordingExecutor {
    pub write_charts: bool,
    pub status: ExecutionStatus,
    executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn succeeding(write_charts: bool) -> Self {
        Self::with_status(ExecutionStatus::Succeeded, write_charts)
    }

    pub fn with_status(status: ExecutionStatus, write_charts: bool) -> Self {
        Self {
            write_charts,
            status,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, code: &str, context: &ExecutionContext) -> ExecutionOutcome {
        self.executed.lock().unwrap().push(code.to_string());
        if self.write_charts {
            if let Some(parent) = context.artifact_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(&context.artifact_path, b"\x89PNG fake");
        }
        ExecutionOutcome::new(self.status.clone(), context.artifact_path.clone())
    }
}
