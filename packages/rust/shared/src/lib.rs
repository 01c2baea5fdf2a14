//! Shared types, error model, and configuration for storyforge.
//!
//! This crate is the foundation depended on by all other storyforge crates.
//! It provides:
//! - [`StoryforgeError`]: the unified error type
//! - Domain types ([`Book`], [`Chapter`], [`Line`], [`Chunk`], [`TaskEntry`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, IllustrationConfig, IllustrationSettings, ProviderConfig,
    ProviderKind, RunConfig, SavePolicy, TranslationConfig, TranslationSettings, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{Result, StoryforgeError};
pub use types::{
    Book, BookId, Chapter, Chunk, ChunkStatus, GenerationKind, Illustration, Line, Scene,
    TaskEntry, TaskStatus,
};
