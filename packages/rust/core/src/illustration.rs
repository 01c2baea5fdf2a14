//! Illustration chunks: scene selection followed by media fan-out.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use storyforge_providers::{GenerationRequest, LanguageModel, MediaGenerator};
use storyforge_scheduler::RateLimiter;
use storyforge_shared::{
    GenerationKind, Illustration, IllustrationSettings, Result, Scene, StoryforgeError,
};

use crate::extract::parse_model_json;
use crate::processor::{ChunkOutput, ChunkProcessor, ChunkWork, ProcessContext, complete_parsed};
use crate::prompts;

/// Accepted reply shapes: `{"scenes": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SceneReply {
    Wrapped { scenes: Vec<Scene> },
    Bare(Vec<Scene>),
}

/// Parse a scene reply, keeping at most `limit` scenes with a usable prompt.
fn parse_scenes(reply: &str, limit: usize) -> Result<Vec<Scene>> {
    let scenes = match parse_model_json::<SceneReply>(reply)? {
        SceneReply::Wrapped { scenes } | SceneReply::Bare(scenes) => scenes,
    };
    let scenes: Vec<Scene> = scenes
        .into_iter()
        .filter(|s| !s.prompt.trim().is_empty())
        .take(limit)
        .collect();
    if scenes.is_empty() {
        return Err(StoryforgeError::malformed("reply contained no usable scenes"));
    }
    Ok(scenes)
}

/// Generates `units_to_generate` illustrations per chunk.
pub struct IllustrationProcessor {
    language_model: Arc<dyn LanguageModel>,
    llm_limiter: Arc<RateLimiter>,
    media: Arc<dyn MediaGenerator>,
    media_limiter: Arc<RateLimiter>,
    settings: IllustrationSettings,
}

impl IllustrationProcessor {
    pub fn new(
        language_model: Arc<dyn LanguageModel>,
        llm_limiter: Arc<RateLimiter>,
        media: Arc<dyn MediaGenerator>,
        media_limiter: Arc<RateLimiter>,
        settings: IllustrationSettings,
    ) -> Self {
        Self {
            language_model,
            llm_limiter,
            media,
            media_limiter,
            settings,
        }
    }

    /// `{media_root}/{book}/illustration/{chunk}`; `#` and friends become `_`.
    fn output_dir(&self, work: &ChunkWork) -> PathBuf {
        let chunk_dir: String = work
            .chunk
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.settings
            .media_root
            .join(work.book_id.to_string())
            .join(GenerationKind::Illustration.as_str())
            .join(chunk_dir)
    }

    /// Scenes share the chunk directory, so each gets its own file stem.
    fn request_for(&self, scene: &Scene, index: usize, output_dir: PathBuf) -> GenerationRequest {
        GenerationRequest {
            prompt: scene.prompt.clone(),
            negative_prompt: scene
                .negative_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .or_else(|| self.settings.negative_prompt.clone()),
            output_dir,
            output_stem: Some(format!("scene-{index}")),
            count: 1,
            dimensions: self.settings.dimensions,
            reference_media: self.settings.reference_media.clone(),
        }
    }
}

#[async_trait]
impl ChunkProcessor for IllustrationProcessor {
    fn kind(&self) -> GenerationKind {
        GenerationKind::Illustration
    }

    #[instrument(skip_all, fields(chunk = %work.chunk.id))]
    async fn process(&self, work: &ChunkWork, ctx: &ProcessContext) -> Result<ChunkOutput> {
        let units = work.chunk.units_to_generate.unwrap_or(1).max(1);
        let messages = prompts::scene_request(work.chapter_title.as_deref(), &work.lines, units);

        let mut scenes = complete_parsed(
            self.language_model.as_ref(),
            &self.llm_limiter,
            ctx,
            prompts::SCENE_SYSTEM_PROMPT,
            &messages,
            |reply| parse_scenes(reply, units as usize),
        )
        .await?;

        // Scenes pointing outside the chunk are pinned to its first line.
        for scene in &mut scenes {
            if !work.contains_line(&scene.line_id) {
                debug!(line = %scene.line_id, "scene anchored outside chunk, using chunk start");
                scene.line_id = work.chunk.start_line_id.clone();
            }
        }

        // No media call starts after cancellation.
        ctx.cancel.check()?;

        let output_dir = self.output_dir(work);
        let mut handles = Vec::with_capacity(scenes.len());
        for (index, scene) in scenes.into_iter().enumerate() {
            let request = self.request_for(&scene, index, output_dir.clone());
            let media = self.media.clone();
            let limiter = self.media_limiter.clone();
            let ctx = ctx.clone();

            handles.push((
                scene,
                tokio::spawn(async move {
                    // Pool slot before rate-limit token.
                    let _slot = ctx.media_pool.acquire(&ctx.cancel).await?;
                    ctx.ready().await?;
                    limiter.acquire(&ctx.cancel).await?;
                    media.generate(&request).await
                }),
            ));
        }

        let mut placed = Vec::new();
        let mut errors = Vec::new();
        for (scene, handle) in handles {
            match handle.await {
                Ok(Ok(paths)) if !paths.is_empty() => {
                    placed.push((
                        scene.line_id.clone(),
                        Illustration {
                            chunk_id: work.chunk.id.clone(),
                            paths,
                            scene: Some(scene),
                        },
                    ));
                }
                Ok(Ok(_)) => errors.push(StoryforgeError::provider(
                    self.media.provider_id(),
                    "generation returned no outputs",
                )),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(StoryforgeError::provider(
                    self.media.provider_id(),
                    format!("media task failed: {e}"),
                )),
            }
        }

        if placed.is_empty() {
            if errors.iter().any(StoryforgeError::is_cancelled) {
                return Err(StoryforgeError::Cancelled);
            }
            return Err(errors
                .into_iter()
                .next()
                .unwrap_or_else(|| StoryforgeError::malformed("no scenes to render")));
        }
        if !errors.is_empty() {
            warn!(
                produced = placed.len(),
                failed = errors.len(),
                first_error = %errors[0],
                "some scenes failed to render"
            );
        }

        Ok(ChunkOutput::Illustrations(placed))
    }
}
