use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AnthropicConfig;
use crate::error::{AppError, Result};
use crate::llm::Backend;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    system_prompt: String,
}

impl AnthropicClient {
    pub fn new(config: &AnthropicConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// Send a single user turn and return all text blocks joined by newlines.
    pub async fn complete(
        &self,
        model: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
    ) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AppError::model_call(
                Backend::Anthropic,
                "no API key configured (set ANTHROPIC_API_KEY)",
            ));
        }

        let mut content = Vec::new();
        if let Some((bytes, media_type)) = image {
            content.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".to_string(),
                    media_type: media_type.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                },
            });
        }
        content.push(ContentBlock::Text {
            text: prompt.to_string(),
        });

        let request = MessagesRequest {
            model: model.to_string(),
            max_tokens: self.max_tokens,
            system: self.system_prompt.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content,
            }],
        };

        let response = self.send_message(&request).await?;

        tracing::debug!(
            model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            stop_reason = ?response.stop_reason,
            "Anthropic response"
        );

        let text = extract_text(&response.content);
        if text.trim().is_empty() {
            return Err(AppError::model_call(Backend::Anthropic, "response contained no text"));
        }
        Ok(text)
    }

    async fn send_message(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::model_call(Backend::Anthropic, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::model_call(
                Backend::Anthropic,
                format!("API returned {status}: {body}"),
            ));
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| AppError::model_call(Backend::Anthropic, format!("invalid response: {e}")))
    }
}

fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| {
            if let ContentBlock::Text { text } = block {
                Some(text.as_str())
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Request types ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

// --- Response types ---

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joins_all_text_blocks() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "{\"feedback\": \"ok\"}"},
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "<execute_python>x = 1</execute_python>"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            extract_text(&response.content),
            "{\"feedback\": \"ok\"}\n<execute_python>x = 1</execute_python>"
        );
    }

    #[test]
    fn test_image_block_serializes_as_base64_source() {
        let block = ContentBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["source"]["type"], "base64");
        assert_eq!(value["source"]["media_type"], "image/png");
        assert_eq!(value["source"]["data"], "AAAA");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_model_call_error() {
        let client = AnthropicClient::new(&AnthropicConfig::default(), Duration::from_secs(1)).unwrap();
        let err = client.complete("claude-sonnet-4", "hi", None).await.unwrap_err();
        assert!(matches!(err, AppError::ModelCall { .. }));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
