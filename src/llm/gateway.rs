use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::Result;
use crate::llm::anthropic::AnthropicClient;
use crate::llm::openai::OpenAiClient;
use crate::llm::{Backend, BackendRouter, ModelGateway};

/// Gateway that routes each call to one of the HTTP backends.
pub struct HttpGateway {
    router: BackendRouter,
    openai: OpenAiClient,
    anthropic: AnthropicClient,
}

impl HttpGateway {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let timeout = config.gateway.request_timeout();
        Ok(Self {
            router: BackendRouter::new(
                config.gateway.routes.clone(),
                config.gateway.default_backend,
            ),
            openai: OpenAiClient::new(&config.openai, timeout)?,
            anthropic: AnthropicClient::new(&config.anthropic, timeout)?,
        })
    }

    async fn dispatch(
        &self,
        model_id: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
    ) -> Result<String> {
        let backend = self.router.resolve(model_id);
        tracing::info!(
            model = model_id,
            backend = %backend,
            with_image = image.is_some(),
            "Calling model"
        );

        let result = match backend {
            Backend::OpenAi => self.openai.complete(model_id, prompt, image).await,
            Backend::Anthropic => self.anthropic.complete(model_id, prompt, image).await,
        };

        if let Err(e) = &result {
            tracing::warn!(model = model_id, backend = %backend, error = %e, "Model call failed");
        }
        result
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn call(&self, model_id: &str, prompt: &str) -> Result<String> {
        self.dispatch(model_id, prompt, None).await
    }

    async fn call_with_image(
        &self,
        model_id: &str,
        prompt: &str,
        image: &[u8],
        media_type: &str,
    ) -> Result<String> {
        self.dispatch(model_id, prompt, Some((image, media_type))).await
    }
}
