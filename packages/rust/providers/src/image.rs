//! OpenAI-compatible image generation client.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use storyforge_shared::{ProviderConfig, Result, StoryforgeError};

use crate::{GenerationRequest, MediaGenerator, USER_AGENT, api_key, endpoint, snippet};

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    /// Not part of the OpenAI schema; accepted by many compatible servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

/// Media generator reached over `POST {base_url}/images/generations`.
///
/// Images are requested as base64 and written to the request's output
/// directory as `{prompt-hash}-{n}.png`, so re-issuing an identical
/// request overwrites rather than accumulates files.
pub struct OpenAiImageClient {
    provider_id: String,
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl OpenAiImageClient {
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
            .timeout(Duration::from_secs(300))
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

/// Stable file stem for a prompt.
fn prompt_stem(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[async_trait]
impl MediaGenerator for OpenAiImageClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    #[instrument(skip_all, fields(provider = %self.provider_id, count = request.count))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>> {
        if request.reference_media.is_some() {
            debug!("reference media is not supported by this backend, ignoring");
        }

        let body = ImageRequest {
            model: &self.model,
            prompt: &request.prompt,
            n: request.count.max(1),
            size: request.dimensions.map(|(w, h)| format!("{w}x{h}")),
            negative_prompt: request.negative_prompt.as_deref(),
            response_format: "b64_json",
        };

        let url = endpoint(&self.base_url, "images/generations");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoryforgeError::provider(&self.provider_id, format!("{url}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoryforgeError::provider(&self.provider_id, format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(StoryforgeError::provider(
                &self.provider_id,
                format!("HTTP {status}: {}", snippet(&text, 200)),
            ));
        }

        let parsed: ImageResponse = serde_json::from_str(&text).map_err(|e| {
            StoryforgeError::provider(&self.provider_id, format!("invalid image response: {e}"))
        })?;

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| StoryforgeError::io(&request.output_dir, e))?;

        let stem = request
            .output_stem
            .clone()
            .unwrap_or_else(|| prompt_stem(&request.prompt));
        let mut paths = Vec::new();
        for (i, image) in parsed.data.iter().enumerate() {
            let Some(encoded) = image.b64_json.as_deref() else {
                continue;
            };
            let bytes = BASE64.decode(encoded).map_err(|e| {
                StoryforgeError::provider(&self.provider_id, format!("invalid base64 image: {e}"))
            })?;
            let path = request.output_dir.join(format!("{stem}-{i}.png"));
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| StoryforgeError::io(&path, e))?;
            paths.push(path);
        }

        if paths.is_empty() {
            return Err(StoryforgeError::provider(&self.provider_id, "response contained no images"));
        }

        debug!(images = paths.len(), "images written");
        Ok(paths)
    }
}
