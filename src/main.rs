use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chartloop::config::AppConfig;
use chartloop::server::{create_router, AppState};
use chartloop::shutdown::{graceful_shutdown, wait_for_shutdown};
use chartloop::workflow::batch::run_batch;
use chartloop::workflow::types::{
    default_basename, default_generation_model, default_reflection_model,
};
use chartloop::workflow::{Workflow, WorkflowRequest};

#[derive(Parser)]
#[command(name = "chartloop", about = "Generate, critique, and refine charts with LLM-written code")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workflow once and print the result as JSON
    Run {
        /// CSV dataset bound to the generated code
        #[arg(long)]
        dataset: PathBuf,
        /// What the chart should show
        #[arg(long)]
        instruction: String,
        #[arg(long, default_value_t = default_generation_model())]
        generation_model: String,
        #[arg(long, default_value_t = default_reflection_model())]
        reflection_model: String,
        /// Chart files are written as <basename>_v1.png and <basename>_v2.png
        #[arg(long, default_value_t = default_basename())]
        basename: String,
    },
    /// Run every request in a JSON array file concurrently
    Batch {
        file: PathBuf,
        #[arg(long, default_value_t = 4)]
        max_concurrency: usize,
    },
    /// Serve the workflow over HTTP
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for results.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    tracing::debug!(?config, "Loaded configuration");

    match cli.command {
        Command::Run {
            dataset,
            instruction,
            generation_model,
            reflection_model,
            basename,
        } => {
            let workflow = Workflow::from_config(&config)?;
            let request = WorkflowRequest::new(dataset, &instruction)
                .with_models(&generation_model, &reflection_model)
                .with_basename(&basename);
            let result = workflow.run(&request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Batch {
            file,
            max_concurrency,
        } => {
            let body = tokio::fs::read(&file).await?;
            let requests: Vec<WorkflowRequest> = serde_json::from_slice(&body)?;
            let workflow = Arc::new(Workflow::from_config(&config)?);
            let results = run_batch(workflow, requests, max_concurrency).await?;
            for result in &results {
                tracing::info!("{}", result.summary());
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting chartloop server"
    );

    let state = Arc::new(AppState::new(config.clone())?);
    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    graceful_shutdown(&state).await;

    Ok(())
}
