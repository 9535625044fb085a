use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{AppError, Result};
use crate::workflow::chart::Workflow;
use crate::workflow::types::{WorkflowRequest, WorkflowResult};

/// Reject batches where two runs would write the same chart files.
pub fn check_distinct_basenames(requests: &[WorkflowRequest]) -> Result<()> {
    let mut seen = HashSet::new();
    for request in requests {
        request.validate()?;
        if !seen.insert(request.output_basename.as_str()) {
            return Err(AppError::BasenameCollision(request.output_basename.clone()));
        }
    }
    Ok(())
}

/// Run independent workflows concurrently, at most `max_concurrency` at a
/// time. Results come back in request order.
pub async fn run_batch(
    workflow: Arc<Workflow>,
    requests: Vec<WorkflowRequest>,
    max_concurrency: usize,
) -> Result<Vec<WorkflowResult>> {
    check_distinct_basenames(&requests)?;

    let total = requests.len();
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    tracing::info!(runs = total, max_concurrency, "Starting batch");

    for (index, request) in requests.into_iter().enumerate() {
        let workflow = Arc::clone(&workflow);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("batch semaphore closed: {e}")))?;
            let result = workflow.run(&request).await?;
            Ok::<_, AppError>((index, result))
        });
    }

    let mut results: Vec<Option<WorkflowResult>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, result) =
            joined.map_err(|e| AppError::Internal(format!("batch task panicked: {e}")))??;
        results[index] = Some(result);
    }

    tracing::info!(runs = total, "Batch finished");
    results
        .into_iter()
        .map(|r| r.ok_or_else(|| AppError::Internal("batch run produced no result".to_string())))
        .collect()
}
