//! Application configuration for storyforge.
//!
//! User config lives at `~/.storyforge/storyforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoryforgeError};
use crate::types::GenerationKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "storyforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".storyforge";

// ---------------------------------------------------------------------------
// Config structs (matching storyforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Generation providers, referenced by id from the per-kind sections.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Illustration settings.
    #[serde(default)]
    pub illustration: IllustrationConfig,

    /// Translation settings.
    #[serde(default)]
    pub translation: TranslationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            providers: default_providers(),
            illustration: IllustrationConfig::default(),
            translation: TranslationConfig::default(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root for the database and generated media. `~` expands to home.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Token budget per chunk.
    #[serde(default = "default_chunk_token_budget")]
    pub chunk_token_budget: usize,

    /// How often a paused run rechecks the pause flag.
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,

    /// Chapters shorter than this (in characters) produce no chunks.
    #[serde(default = "default_min_chapter_chars")]
    pub min_chapter_chars: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_token_budget: default_chunk_token_budget(),
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            min_chapter_chars: default_min_chapter_chars(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.storyforge/data".into()
}
fn default_chunk_token_budget() -> usize {
    5000
}
fn default_pause_poll_interval_ms() -> u64 {
    1000
}
fn default_min_chapter_chars() -> usize {
    500
}

/// What a provider generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LanguageModel,
    Media,
}

/// `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Identity used for rate limiting and config references.
    pub id: String,
    pub kind: ProviderKind,
    /// OpenAI-compatible API base (e.g. `https://openrouter.ai/api/v1`).
    pub base_url: String,
    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,
    pub model: String,
    /// Maximum simultaneous in-flight calls.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
    /// Call starts allowed per minute; 0 disables the limiter.
    #[serde(default)]
    pub requests_per_minute: u32,
}

fn default_concurrency_limit() -> u32 {
    2
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            id: "openrouter".into(),
            kind: ProviderKind::LanguageModel,
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
            model: "openai/gpt-4o-mini".into(),
            concurrency_limit: 4,
            requests_per_minute: 60,
        },
        ProviderConfig {
            id: "openai-images".into(),
            kind: ProviderKind::Media,
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            model: "gpt-image-1".into(),
            concurrency_limit: 2,
            requests_per_minute: 10,
        },
    ]
}

/// When a run writes the book and chunk list back to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// After every settled chunk.
    EveryChunk,
    /// Once, after all submissions settle.
    EndOfRun,
}

/// `[illustration]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IllustrationConfig {
    /// Provider id used for scene extraction.
    #[serde(default = "default_llm_provider")]
    pub language_model: String,
    /// Provider id used for media generation.
    #[serde(default = "default_media_provider")]
    pub media: String,
    /// Illustrations per eligible chapter.
    #[serde(default = "default_units_per_chapter")]
    pub units_per_chapter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Fallback negative prompt when a scene does not supply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Style reference passed to every media call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_media: Option<String>,
    #[serde(default = "default_every_chunk")]
    pub save_policy: SavePolicy,
}

impl Default for IllustrationConfig {
    fn default() -> Self {
        Self {
            language_model: default_llm_provider(),
            media: default_media_provider(),
            units_per_chapter: default_units_per_chapter(),
            width: None,
            height: None,
            negative_prompt: None,
            reference_media: None,
            save_policy: default_every_chunk(),
        }
    }
}

/// `[translation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default = "default_llm_provider")]
    pub language_model: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_end_of_run")]
    pub save_policy: SavePolicy,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            language_model: default_llm_provider(),
            target_language: default_target_language(),
            save_policy: default_end_of_run(),
        }
    }
}

fn default_llm_provider() -> String {
    "openrouter".into()
}
fn default_media_provider() -> String {
    "openai-images".into()
}
fn default_units_per_chapter() -> u32 {
    3
}
fn default_target_language() -> String {
    "English".into()
}
fn default_every_chunk() -> SavePolicy {
    SavePolicy::EveryChunk
}
fn default_end_of_run() -> SavePolicy {
    SavePolicy::EndOfRun
}

impl AppConfig {
    /// Look up a provider by id.
    pub fn provider(&self, id: &str) -> Result<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| StoryforgeError::config(format!("unknown provider '{id}'")))
    }

    fn provider_of_kind(&self, id: &str, kind: ProviderKind) -> Result<&ProviderConfig> {
        let provider = self.provider(id)?;
        if provider.kind != kind {
            return Err(StoryforgeError::config(format!(
                "provider '{id}' is {:?}, expected {kind:?}",
                provider.kind
            )));
        }
        Ok(provider)
    }

    /// Language-model provider used by a generation kind.
    pub fn language_model_for(&self, kind: GenerationKind) -> Result<&ProviderConfig> {
        let id = match kind {
            GenerationKind::Illustration => &self.illustration.language_model,
            GenerationKind::Translation => &self.translation.language_model,
        };
        self.provider_of_kind(id, ProviderKind::LanguageModel)
    }

    /// Media provider used by a generation kind, if it has one.
    pub fn media_for(&self, kind: GenerationKind) -> Result<Option<&ProviderConfig>> {
        match kind {
            GenerationKind::Illustration => self
                .provider_of_kind(&self.illustration.media, ProviderKind::Media)
                .map(Some),
            GenerationKind::Translation => Ok(None),
        }
    }

    /// Resolved data directory with `~` expanded.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.data_dir)
    }

    /// Check provider ids, URLs, and the chunk budget.
    ///
    /// Provider references are resolved per generation kind by
    /// [`RunConfig::for_kind`], so a file that only configures one kind
    /// still loads.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(StoryforgeError::config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            url::Url::parse(&provider.base_url).map_err(|e| {
                StoryforgeError::config(format!(
                    "provider '{}' has invalid base_url: {e}",
                    provider.id
                ))
            })?;
        }
        if self.defaults.chunk_token_budget == 0 {
            return Err(StoryforgeError::config("chunk_token_budget must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime config (resolved per run)
// ---------------------------------------------------------------------------

/// Scheduling parameters for one run of one generation kind.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub chunk_token_budget: usize,
    pub min_chapter_chars: usize,
    pub pause_poll_interval: Duration,
    /// Primary (language-model) pool size, at least 1.
    pub llm_pool_size: usize,
    /// Media pool size, at least 1.
    pub media_pool_size: usize,
    pub save_policy: SavePolicy,
}

impl RunConfig {
    /// Resolve the run parameters for `kind` from the file config.
    pub fn for_kind(config: &AppConfig, kind: GenerationKind) -> Result<Self> {
        let llm = config.language_model_for(kind)?;
        let media = config.media_for(kind)?;
        let save_policy = match kind {
            GenerationKind::Illustration => config.illustration.save_policy,
            GenerationKind::Translation => config.translation.save_policy,
        };
        Ok(Self {
            chunk_token_budget: config.defaults.chunk_token_budget,
            min_chapter_chars: config.defaults.min_chapter_chars,
            pause_poll_interval: Duration::from_millis(config.defaults.pause_poll_interval_ms),
            llm_pool_size: pool_size(llm.concurrency_limit),
            media_pool_size: media.map(|m| pool_size(m.concurrency_limit)).unwrap_or(1),
            save_policy,
        })
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chunk_token_budget: default_chunk_token_budget(),
            min_chapter_chars: default_min_chapter_chars(),
            pause_poll_interval: Duration::from_millis(default_pause_poll_interval_ms()),
            llm_pool_size: 1,
            media_pool_size: 1,
            save_policy: SavePolicy::EveryChunk,
        }
    }
}

fn pool_size(limit: u32) -> usize {
    limit.max(1) as usize
}

/// Resolved illustration parameters.
#[derive(Debug, Clone)]
pub struct IllustrationSettings {
    pub units_per_chapter: u32,
    pub dimensions: Option<(u32, u32)>,
    pub negative_prompt: Option<String>,
    pub reference_media: Option<PathBuf>,
    /// Generated media lands under `{media_root}/{book_id}/illustration/`.
    pub media_root: PathBuf,
}

impl IllustrationSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let dimensions = match (config.illustration.width, config.illustration.height) {
            (Some(w), Some(h)) => Some((w, h)),
            (None, None) => None,
            _ => {
                return Err(StoryforgeError::config(
                    "illustration width and height must be set together",
                ));
            }
        };
        let reference_media = config
            .illustration
            .reference_media
            .as_deref()
            .map(expand_home)
            .transpose()?;
        Ok(Self {
            units_per_chapter: config.illustration.units_per_chapter,
            dimensions,
            negative_prompt: config.illustration.negative_prompt.clone(),
            reference_media,
            media_root: config.data_dir()?.join("media"),
        })
    }
}

/// Resolved translation parameters.
#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub target_language: String,
}

impl From<&AppConfig> for TranslationSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            target_language: config.translation.target_language.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.storyforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StoryforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.storyforge/storyforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StoryforgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        StoryforgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StoryforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StoryforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StoryforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that a provider's API key env var is set and non-empty.
pub fn validate_api_key(provider: &ProviderConfig) -> Result<()> {
    let var_name = &provider.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(StoryforgeError::config(format!(
            "API key for provider '{}' not found. Set the {var_name} environment variable.",
            provider.id
        ))),
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| StoryforgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("chunk_token_budget"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.chunk_token_budget, 5000);
        assert_eq!(parsed.providers.len(), 2);
        assert_eq!(parsed.illustration.save_policy, SavePolicy::EveryChunk);
        assert_eq!(parsed.translation.save_policy, SavePolicy::EndOfRun);
        parsed.validate().expect("defaults validate");
    }

    #[test]
    fn config_with_custom_provider() {
        let toml_str = r#"
[defaults]
chunk_token_budget = 2000

[[providers]]
id = "local-llm"
kind = "language_model"
base_url = "http://localhost:8080/v1"
api_key_env = "LOCAL_KEY"
model = "llama"
concurrency_limit = 0

[translation]
language_model = "local-llm"
target_language = "French"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.providers.len(), 1);
        let run = RunConfig::for_kind(&config, GenerationKind::Translation).expect("run config");
        assert_eq!(run.chunk_token_budget, 2000);
        // concurrency_limit of 0 still yields a usable pool
        assert_eq!(run.llm_pool_size, 1);
        assert_eq!(run.save_policy, SavePolicy::EndOfRun);

        // the default illustration section points at providers that are
        // absent, which only matters once an illustration run resolves them
        config.validate().expect("translation-only config validates");
        let err = RunConfig::for_kind(&config, GenerationKind::Illustration).unwrap_err();
        assert!(matches!(err, StoryforgeError::Config { .. }));
    }

    #[test]
    fn translation_only_config_file_loads() {
        let path = std::env::temp_dir().join(format!("storyforge-{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(
            &path,
            r#"
[[providers]]
id = "local-llm"
kind = "language_model"
base_url = "http://localhost:8080/v1"
api_key_env = "LOCAL_KEY"
model = "llama"

[translation]
language_model = "local-llm"
"#,
        )
        .expect("write config");

        let loaded = load_config_from(&path);
        let _ = std::fs::remove_file(&path);
        let config = loaded.expect("translation-only config loads");

        let run = RunConfig::for_kind(&config, GenerationKind::Translation).expect("translation");
        assert_eq!(run.llm_pool_size, 2);
        let err = RunConfig::for_kind(&config, GenerationKind::Illustration).unwrap_err();
        assert!(err.to_string().contains("openrouter"), "{err}");
    }

    #[test]
    fn duplicate_provider_ids_fail_validation() {
        let mut config = AppConfig::default();
        let mut copy = config.providers[0].clone();
        copy.kind = ProviderKind::Media;
        config.providers.push(copy);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate provider id"));
    }

    #[test]
    fn provider_kind_mismatch_is_rejected() {
        let mut config = AppConfig::default();
        config.illustration.media = "openrouter".into();
        let err = config.media_for(GenerationKind::Illustration).unwrap_err();
        assert!(err.to_string().contains("expected Media"));
    }

    #[test]
    fn run_config_for_illustration() {
        let config = AppConfig::default();
        let run = RunConfig::for_kind(&config, GenerationKind::Illustration).expect("run config");
        assert_eq!(run.llm_pool_size, 4);
        assert_eq!(run.media_pool_size, 2);
        assert_eq!(run.pause_poll_interval, Duration::from_secs(1));
        assert_eq!(run.min_chapter_chars, 500);
    }

    #[test]
    fn illustration_dimensions_must_pair() {
        let mut config = AppConfig::default();
        config.defaults.data_dir = "/tmp/sf".into();
        config.illustration.width = Some(512);
        assert!(IllustrationSettings::from_config(&config).is_err());

        config.illustration.height = Some(768);
        let settings = IllustrationSettings::from_config(&config).expect("settings");
        assert_eq!(settings.dimensions, Some((512, 768)));
        assert_eq!(settings.media_root, PathBuf::from("/tmp/sf/media"));
    }

    #[test]
    fn api_key_validation() {
        let mut provider = AppConfig::default().providers[0].clone();
        // Use a unique env var name to avoid interfering with other tests
        provider.api_key_env = "SF_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&provider);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key for provider"));
    }
}
