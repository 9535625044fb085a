pub mod anthropic;
pub mod gateway;
pub mod openai;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use gateway::HttpGateway;

/// Inference backends the gateway can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[serde(alias = "open_ai")]
    OpenAi,
    Anthropic,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::OpenAi => write!(f, "openai"),
            Backend::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Maps model identifiers containing `contains` (case-insensitive) to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub contains: String,
    pub backend: Backend,
}

impl RouteRule {
    pub fn new(contains: &str, backend: Backend) -> Self {
        Self {
            contains: contains.to_string(),
            backend,
        }
    }
}

/// Resolves a model identifier to a backend from configured rules.
#[derive(Debug, Clone)]
pub struct BackendRouter {
    rules: Vec<RouteRule>,
    default: Backend,
}

impl BackendRouter {
    pub fn new(rules: Vec<RouteRule>, default: Backend) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| RouteRule {
                contains: r.contains.to_lowercase(),
                backend: r.backend,
            })
            .collect();
        Self { rules, default }
    }

    pub fn resolve(&self, model_id: &str) -> Backend {
        let lower = model_id.to_lowercase();
        self.rules
            .iter()
            .find(|r| !r.contains.is_empty() && lower.contains(&r.contains))
            .map(|r| r.backend)
            .unwrap_or(self.default)
    }
}

/// Text-in, text-out access to language models.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send a text-only prompt and return the raw text content.
    async fn call(&self, model_id: &str, prompt: &str) -> Result<String>;

    /// Send a prompt with one attached image.
    async fn call_with_image(
        &self,
        model_id: &str,
        prompt: &str,
        image: &[u8],
        media_type: &str,
    ) -> Result<String>;
}

/// Guess an image media type from the file extension.
pub fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}
