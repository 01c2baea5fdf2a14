//! Generation backends.
//!
//! The orchestrator only sees two capabilities:
//! - [`LanguageModel`]: `complete(system_prompt, messages) -> text`
//! - [`MediaGenerator`]: `generate(request) -> output paths`
//!
//! Each provider implements one of them behind this boundary. The HTTP
//! clients here speak the OpenAI-compatible wire format that most hosted
//! and local providers accept.

pub mod chat;
pub mod image;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use storyforge_shared::{ProviderConfig, Result, StoryforgeError};

pub use chat::OpenAiChatClient;
pub use image::OpenAiImageClient;

/// User-Agent string for provider requests.
pub(crate) const USER_AGENT: &str = concat!("storyforge/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A chat-completion backend. The returned text is untrusted.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identity used for rate limiting and logs.
    fn provider_id(&self) -> &str;

    async fn complete(&self, system_prompt: &str, messages: &[ChatMessage]) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Media generation
// ---------------------------------------------------------------------------

/// Parameters for one media-generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Directory the backend writes its outputs into.
    pub output_dir: PathBuf,
    /// File name stem for the outputs; derived from the prompt when unset.
    pub output_stem: Option<String>,
    /// Number of independent outputs requested.
    pub count: u32,
    /// `(width, height)` in pixels.
    pub dimensions: Option<(u32, u32)>,
    /// Style or character reference passed through to the provider.
    pub reference_media: Option<PathBuf>,
}

/// A media-generation backend.
#[async_trait]
pub trait MediaGenerator: Send + Sync {
    /// Identity used for rate limiting and logs.
    fn provider_id(&self) -> &str;

    /// Generate media and return the paths written under `output_dir`.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>>;
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

/// Read a provider's API key from its configured env var.
pub(crate) fn api_key(config: &ProviderConfig) -> Result<String> {
    storyforge_shared::validate_api_key(config)?;
    std::env::var(&config.api_key_env).map_err(|e| {
        StoryforgeError::config(format!("reading {}: {e}", config.api_key_env))
    })
}

/// Build the language-model client for a provider entry.
pub fn language_model_from_config(config: &ProviderConfig) -> Result<Arc<dyn LanguageModel>> {
    Ok(Arc::new(OpenAiChatClient::from_config(config)?))
}

/// Build the media client for a provider entry.
pub fn media_generator_from_config(config: &ProviderConfig) -> Result<Arc<dyn MediaGenerator>> {
    Ok(Arc::new(OpenAiImageClient::from_config(config)?))
}

/// Join an API base URL and an endpoint path.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// First `max` characters of a response body, for error messages.
pub(crate) fn snippet(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}
