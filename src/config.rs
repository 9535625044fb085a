use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::prompt::{Column, DatasetSchema};
use crate::error::{AppError, Result};
use crate::llm::{Backend, RouteRule};
use crate::sandbox::Isolation;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Datasets named in HTTP requests must live under this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            max_tokens: default_max_tokens(),
        }
    }
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_anthropic_base_url(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Ordered substring rules; the first match picks the backend.
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,
    #[serde(default = "default_backend")]
    pub default_backend: Backend,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            default_backend: default_backend(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,
    /// Bytes of stdout/stderr kept in an outcome.
    #[serde(default = "default_capture_limit")]
    pub capture_limit_bytes: usize,
    #[serde(default)]
    pub isolation: Isolation,
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: PathBuf,
    #[serde(default = "default_unshare_path")]
    pub unshare_path: PathBuf,
    /// Address space limit for the interpreter; 0 disables it.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Largest file the interpreter may write; 0 disables it.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_sandbox_timeout(),
            output_dir: default_output_dir(),
            allowed_modules: default_allowed_modules(),
            capture_limit_bytes: default_capture_limit(),
            isolation: Isolation::default(),
            bwrap_path: default_bwrap_path(),
            unshare_path: default_unshare_path(),
            memory_limit_mb: default_memory_limit_mb(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Name the dataset is bound to inside generated code.
    #[serde(default = "default_dataset_binding")]
    pub dataset_binding: String,
    /// Treat a run that exits cleanly without writing its chart as a failure.
    #[serde(default)]
    pub require_artifact: bool,
    #[serde(default = "default_columns")]
    pub columns: Vec<Column>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            dataset_binding: default_dataset_binding(),
            require_artifact: false,
            columns: default_columns(),
        }
    }
}

impl WorkflowConfig {
    pub fn schema(&self) -> DatasetSchema {
        DatasetSchema::new(self.columns.clone())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_system_prompt() -> String {
    "You are a careful assistant. Follow the user's output format exactly.".to_string()
}

fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("claude", Backend::Anthropic),
        RouteRule::new("anthropic", Backend::Anthropic),
    ]
}

fn default_backend() -> Backend {
    Backend::OpenAi
}

fn default_request_timeout() -> u64 {
    120
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("python3")
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("charts")
}

fn default_allowed_modules() -> Vec<String> {
    [
        "matplotlib",
        "pandas",
        "numpy",
        "math",
        "datetime",
        "calendar",
        "collections",
        "itertools",
        "functools",
        "statistics",
        "time",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_capture_limit() -> usize {
    16 * 1024
}

fn default_bwrap_path() -> PathBuf {
    PathBuf::from("bwrap")
}

fn default_unshare_path() -> PathBuf {
    PathBuf::from("unshare")
}

fn default_memory_limit_mb() -> u64 {
    8192
}

fn default_max_file_size_mb() -> u64 {
    64
}

fn default_dpi() -> u32 {
    300
}

fn default_dataset_binding() -> String {
    "df".to_string()
}

fn default_columns() -> Vec<Column> {
    DatasetSchema::coffee_sales().columns
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("chartloop").required(false));
        }

        // Environment variable overrides with CHARTLOOP_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("CHARTLOOP")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut app: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        app.apply_standard_env();
        app.validate()?;
        Ok(app)
    }

    /// Fill empty API keys from the providers' conventional variables.
    fn apply_standard_env(&mut self) {
        if self.openai.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.openai.api_key = key;
            }
        }
        if self.anthropic.api_key.is_empty() {
            if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
                self.anthropic.api_key = key;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.timeout_secs == 0 {
            return Err(AppError::Config(
                "sandbox.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.workflow.dpi == 0 {
            return Err(AppError::Config("workflow.dpi must be greater than zero".to_string()));
        }
        if self.workflow.columns.is_empty() {
            return Err(AppError::Config("workflow.columns must not be empty".to_string()));
        }
        let binding = &self.workflow.dataset_binding;
        let is_identifier = binding
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && binding.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier {
            return Err(AppError::Config(format!(
                "workflow.dataset_binding is not a valid identifier: {binding}"
            )));
        }
        Ok(())
    }
}
