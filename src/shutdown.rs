use std::sync::Arc;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Report runs that were still in flight when the server stopped; their
/// chart files may be missing or partial.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    let in_flight = state.get_in_flight_runs().await;

    if in_flight.is_empty() {
        tracing::info!("No in-flight runs at shutdown");
        return;
    }

    for run in &in_flight {
        tracing::warn!(
            run = %run,
            output_dir = %state.config.sandbox.output_dir.display(),
            "Run interrupted by shutdown; charts may be incomplete"
        );
    }

    tracing::info!(count = in_flight.len(), "Graceful shutdown complete");
}
