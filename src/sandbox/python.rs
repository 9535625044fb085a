use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::{AppError, Result};
use crate::sandbox::isolation::Isolator;
use crate::sandbox::{Binding, ExecutionContext, ExecutionOutcome, ExecutionStatus, Executor};

const HARNESS: &str = include_str!("harness.py");

const MIB: u64 = 1024 * 1024;

/// Executes generated Python in a child interpreter wrapped by the harness.
pub struct PythonSandbox {
    interpreter: PathBuf,
    timeout: Duration,
    allowed_modules: Vec<String>,
    capture_limit: usize,
    limits: Limits,
    isolator: Isolator,
    /// Shared matplotlib cache, so the font list is built once per host.
    mpl_config_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct Limits {
    memory_bytes: Option<u64>,
    file_size_bytes: Option<u64>,
}

impl PythonSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        let megabytes = |mb: u64| (mb > 0).then(|| mb * MIB);
        Self {
            interpreter: config.interpreter.clone(),
            timeout: config.timeout(),
            allowed_modules: config.allowed_modules.clone(),
            capture_limit: config.capture_limit_bytes,
            limits: Limits {
                memory_bytes: megabytes(config.memory_limit_mb),
                file_size_bytes: megabytes(config.max_file_size_mb),
            },
            isolator: Isolator::new(
                config.isolation,
                config.bwrap_path.clone(),
                config.unshare_path.clone(),
            ),
            mpl_config_dir: std::env::temp_dir().join("chartloop-mplconfig"),
        }
    }

    async fn run(&self, code: &str, context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let chart_path = context.artifact_path.clone();
        // Checked here because a wrapper would report a missing program as
        // an ordinary non-zero exit.
        let Some(interpreter) = resolve_program(&self.interpreter) else {
            return Ok(ExecutionOutcome::new(
                ExecutionStatus::LaunchFailed {
                    message: format!("interpreter not found: {}", self.interpreter.display()),
                },
                chart_path,
            ));
        };
        let output_dir = chart_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        tokio::fs::create_dir_all(&output_dir).await?;
        let output_dir = tokio::fs::canonicalize(&output_dir).await?;
        tokio::fs::create_dir_all(&self.mpl_config_dir).await?;

        let scratch = tempfile::Builder::new()
            .prefix("chartloop-")
            .tempdir()
            .map_err(|e| AppError::Sandbox(format!("Failed to create scratch dir: {e}")))?;

        let harness_path = scratch.path().join("harness.py");
        let code_path = scratch.path().join("generated.py");
        let manifest_path = scratch.path().join("manifest.json");
        let status_path = scratch.path().join("status.json");

        let manifest = Manifest {
            code_path: &code_path,
            status_path: &status_path,
            output_dir: &output_dir,
            config_dir: &self.mpl_config_dir,
            allowed_modules: &self.allowed_modules,
            limits: self.limits,
            bindings: &context.bindings,
        };

        tokio::fs::write(&harness_path, HARNESS).await?;
        tokio::fs::write(&code_path, code).await?;
        tokio::fs::write(&manifest_path, serde_json::to_vec(&manifest)?).await?;

        let confinement = self.isolator.confinement().await;
        let mut command = self.isolator.command(
            confinement,
            &interpreter,
            &[output_dir.as_path(), scratch.path(), self.mpl_config_dir.as_path()],
        );
        command
            .arg("-B")
            .arg(&harness_path)
            .arg(&manifest_path)
            .current_dir(&output_dir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", &output_dir)
            .env("MPLBACKEND", "Agg")
            .env("MPLCONFIGDIR", &self.mpl_config_dir)
            .env("PYTHONIOENCODING", "utf-8");

        tracing::debug!(?confinement, chart = %chart_path.display(), "Launching interpreter");

        let started = Instant::now();
        let raw = run_with_timeout(command, self.timeout, self.capture_limit).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, stdout, stderr) = match raw {
            RawRun::LaunchFailed(message) => (
                ExecutionStatus::LaunchFailed { message },
                Vec::new(),
                Vec::new(),
            ),
            RawRun::TimedOut => (
                ExecutionStatus::Timeout {
                    limit_ms: self.timeout.as_millis() as u64,
                },
                Vec::new(),
                Vec::new(),
            ),
            RawRun::Exited {
                code,
                stdout,
                stderr,
            } => {
                tracing::debug!(exit_code = ?code, "Interpreter exited");
                let status = match tokio::fs::read(&status_path).await {
                    Ok(bytes) => status_from_report(&bytes),
                    // The harness always writes a status unless the process died.
                    Err(_) => ExecutionStatus::RuntimeError {
                        message: format!(
                            "interpreter exited without a status: {}",
                            tail(&stderr, 512)
                        ),
                    },
                };
                (status, stdout, stderr)
            }
        };

        let mut outcome = ExecutionOutcome::new(status, chart_path);
        outcome.stdout = tail(&stdout, self.capture_limit);
        outcome.stderr = tail(&stderr, self.capture_limit);
        outcome.elapsed_ms = elapsed_ms;
        Ok(outcome)
    }
}

#[async_trait]
impl Executor for PythonSandbox {
    async fn execute(&self, code: &str, context: &ExecutionContext) -> ExecutionOutcome {
        if code.trim().is_empty() {
            return ExecutionOutcome::no_op(context.artifact_path.clone());
        }

        match self.run(code, context).await {
            Ok(outcome) => {
                tracing::info!(
                    status = outcome.label(),
                    elapsed_ms = outcome.elapsed_ms,
                    chart = %outcome.chart_path.display(),
                    "Sandbox execution finished"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(error = %e, "Sandbox setup failed");
                ExecutionOutcome::new(
                    ExecutionStatus::LaunchFailed {
                        message: e.to_string(),
                    },
                    context.artifact_path.clone(),
                )
            }
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    code_path: &'a Path,
    status_path: &'a Path,
    output_dir: &'a Path,
    config_dir: &'a Path,
    allowed_modules: &'a [String],
    limits: Limits,
    bindings: &'a std::collections::BTreeMap<String, Binding>,
}

#[derive(Debug, Deserialize)]
struct HarnessReport {
    status: String,
    #[serde(default)]
    message: String,
    line: Option<u32>,
}

fn status_from_report(bytes: &[u8]) -> ExecutionStatus {
    let report: HarnessReport = match serde_json::from_slice(bytes) {
        Ok(r) => r,
        Err(e) => {
            return ExecutionStatus::RuntimeError {
                message: format!("unreadable harness status: {e}"),
            }
        }
    };

    match report.status.as_str() {
        "ok" => ExecutionStatus::Succeeded,
        "syntax_error" => ExecutionStatus::SyntaxError {
            message: report.message,
            line: report.line,
        },
        "capability_violation" => ExecutionStatus::CapabilityViolation {
            message: report.message,
        },
        "setup_error" => ExecutionStatus::RuntimeError {
            message: format!("failed to prepare bindings: {}", report.message),
        },
        _ => ExecutionStatus::RuntimeError {
            message: match report.line {
                Some(line) => format!("{} (line {line})", report.message),
                None => report.message,
            },
        },
    }
}

/// Result of running a child process under a deadline.
#[derive(Debug)]
pub(crate) enum RawRun {
    LaunchFailed(String),
    TimedOut,
    Exited {
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

/// Spawn `command` and wait at most `timeout`; the child is killed when the
/// deadline passes. Only the last `capture_limit` bytes of each output
/// stream are kept while it runs.
pub(crate) async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    capture_limit: usize,
) -> RawRun {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return RawRun::LaunchFailed(format!("failed to start interpreter: {e}")),
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = async {
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            read_tail(stdout, capture_limit),
            read_tail(stderr, capture_limit),
        );
        status.map(|status| (status, stdout, stderr))
    };

    match tokio::time::timeout(timeout, finished).await {
        Ok(Ok((status, stdout, stderr))) => RawRun::Exited {
            code: status.code(),
            stdout,
            stderr,
        },
        Ok(Err(e)) => RawRun::LaunchFailed(format!("failed to wait for interpreter: {e}")),
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Sandbox timed out, killing child");
            RawRun::TimedOut
        }
    }
}

/// Drain `reader`, keeping at most the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut kept = Vec::with_capacity(limit.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                }
            }
        }
    }
    kept
}

/// Locate `program` on `PATH` unless it already names a path.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Last `limit` bytes of `bytes` as lossy UTF-8.
fn tail(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
