//! OpenAI-compatible chat completions client (OpenRouter, OpenAI, local servers).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use storyforge_shared::{ProviderConfig, Result, StoryforgeError};

use crate::{ChatMessage, LanguageModel, Role, USER_AGENT, api_key, endpoint, snippet};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Language model reached over `POST {base_url}/chat/completions`.
pub struct OpenAiChatClient {
    provider_id: String,
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl OpenAiChatClient {
    /// Create a client with an explicit API key.
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let provider_id = provider_id.into();
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| {
                StoryforgeError::provider(&provider_id, format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            provider_id,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Create a client from a provider entry, reading the key from the environment.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(&config.id, &config.base_url, &config.model, api_key(config)?)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    #[instrument(skip_all, fields(provider = %self.provider_id, model = %self.model))]
    async fn complete(&self, system_prompt: &str, messages: &[ChatMessage]) -> Result<String> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(ChatMessage {
            role: Role::System,
            content: system_prompt.to_string(),
        });
        all.extend_from_slice(messages);

        let request = ChatRequest {
            model: &self.model,
            messages: all,
        };

        let url = endpoint(&self.base_url, "chat/completions");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| StoryforgeError::provider(&self.provider_id, format!("{url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoryforgeError::provider(&self.provider_id, format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(StoryforgeError::provider(
                &self.provider_id,
                format!("HTTP {status}: {}", snippet(&body, 200)),
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            StoryforgeError::provider(
                &self.provider_id,
                format!("invalid completion response: {e} (got: {})", snippet(&body, 200)),
            )
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                StoryforgeError::provider(&self.provider_id, "completion returned no content")
            })?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new("test", server.uri(), "test-model", "test-key").unwrap();
        let text = client
            .complete("be brief", &[ChatMessage::user("hello")])
            .await
            .expect("completion");
        assert_eq!(text, "hi there");
    }

    #[tokio::test]
    async fn non_success_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new("test", server.uri(), "m", "k").unwrap();
        let err = client.complete("s", &[ChatMessage::user("u")]).await.unwrap_err();
        assert!(matches!(err, StoryforgeError::Provider { .. }));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn empty_choices_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new("test", server.uri(), "m", "k").unwrap();
        let err = client.complete("s", &[]).await.unwrap_err();
        assert!(err.to_string().contains("no content"));
    }
}
