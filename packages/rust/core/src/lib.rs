//! Core run orchestration and domain logic for storyforge.
//!
//! This crate ties together splitting, scheduling, the generation backends
//! and storage into resumable runs (e.g., [`Orchestrator::run`]).

pub mod extract;
pub mod illustration;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod tasks;
pub mod translation;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tracing::debug;

use storyforge_providers::{language_model_from_config, media_generator_from_config};
use storyforge_scheduler::RateLimiterRegistry;
use storyforge_shared::{
    AppConfig, GenerationKind, IllustrationSettings, Result, StoryforgeError, TranslationSettings,
};

pub use illustration::IllustrationProcessor;
pub use orchestrator::{Orchestrator, RunSummary};
pub use processor::{ChunkOutput, ChunkProcessor, ChunkWork, ProcessContext};
pub use progress::{RunProgress, SilentProgress};
pub use tasks::{ensure_task_entry, split_options};
pub use translation::TranslationProcessor;

/// Build the processor for `kind` from the file config.
///
/// Rate limiters come from `limiters`, so two kinds sharing a provider
/// share its request budget.
pub fn build_processor(
    config: &AppConfig,
    kind: GenerationKind,
    limiters: &RateLimiterRegistry,
) -> Result<Arc<dyn ChunkProcessor>> {
    let llm = config.language_model_for(kind)?;
    let language_model = language_model_from_config(llm)?;
    let llm_limiter = limiters.get_or_create(&llm.id, llm.requests_per_minute);
    debug!(%kind, provider = %llm.id, rpm = llm.requests_per_minute, "language model ready");

    match kind {
        GenerationKind::Illustration => {
            let media = config.media_for(kind)?.ok_or_else(|| {
                StoryforgeError::config("illustration requires a media provider")
            })?;
            let generator = media_generator_from_config(media)?;
            let media_limiter = limiters.get_or_create(&media.id, media.requests_per_minute);
            debug!(provider = %media.id, rpm = media.requests_per_minute, "media generator ready");
            Ok(Arc::new(IllustrationProcessor::new(
                language_model,
                llm_limiter,
                generator,
                media_limiter,
                IllustrationSettings::from_config(config)?,
            )))
        }
        GenerationKind::Translation => Ok(Arc::new(TranslationProcessor::new(
            language_model,
            llm_limiter,
            TranslationSettings::from(config),
        ))),
    }
}
