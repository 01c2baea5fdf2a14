//! Translation chunks: one language-model call per chunk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use storyforge_providers::LanguageModel;
use storyforge_scheduler::RateLimiter;
use storyforge_shared::{GenerationKind, Result, StoryforgeError, TranslationSettings};

use crate::extract::parse_model_json;
use crate::processor::{ChunkOutput, ChunkProcessor, ChunkWork, ProcessContext, complete_parsed};
use crate::prompts;

#[derive(Debug, Deserialize)]
struct TranslatedLine {
    id: String,
    text: String,
}

/// Accepted reply shapes: `{"translations": [...]}`, a bare array, or an
/// `{"<line id>": "<text>"}` map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TranslationReply {
    Wrapped { translations: Vec<TranslatedLine> },
    Bare(Vec<TranslatedLine>),
    Map(HashMap<String, String>),
}

/// Parse a translation reply; every id in `expected` must be present.
fn parse_translations(reply: &str, expected: &[String]) -> Result<Vec<(String, String)>> {
    let mut by_id: HashMap<String, String> = match parse_model_json::<TranslationReply>(reply)? {
        TranslationReply::Wrapped { translations } | TranslationReply::Bare(translations) => {
            translations.into_iter().map(|t| (t.id, t.text)).collect()
        }
        TranslationReply::Map(map) => map,
    };

    let missing: Vec<&str> = expected
        .iter()
        .filter(|id| !by_id.contains_key(id.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(StoryforgeError::malformed(format!(
            "translation is missing {} of {} lines (first: {})",
            missing.len(),
            expected.len(),
            missing[0]
        )));
    }

    // Ids the model invented are dropped.
    Ok(expected
        .iter()
        .filter_map(|id| by_id.remove(id).map(|text| (id.clone(), text)))
        .collect())
}

/// Translates every line of a chunk into the configured target language.
pub struct TranslationProcessor {
    language_model: Arc<dyn LanguageModel>,
    llm_limiter: Arc<RateLimiter>,
    settings: TranslationSettings,
}

impl TranslationProcessor {
    pub fn new(
        language_model: Arc<dyn LanguageModel>,
        llm_limiter: Arc<RateLimiter>,
        settings: TranslationSettings,
    ) -> Self {
        Self {
            language_model,
            llm_limiter,
            settings,
        }
    }
}

#[async_trait]
impl ChunkProcessor for TranslationProcessor {
    fn kind(&self) -> GenerationKind {
        GenerationKind::Translation
    }

    #[instrument(skip_all, fields(chunk = %work.chunk.id, lines = work.lines.len()))]
    async fn process(&self, work: &ChunkWork, ctx: &ProcessContext) -> Result<ChunkOutput> {
        let expected: Vec<String> = work.lines.iter().map(|l| l.id.clone()).collect();
        let messages = prompts::translation_request(&self.settings.target_language, &work.lines);

        let translations = complete_parsed(
            self.language_model.as_ref(),
            &self.llm_limiter,
            ctx,
            prompts::TRANSLATION_SYSTEM_PROMPT,
            &messages,
            |reply| parse_translations(reply, &expected),
        )
        .await?;

        Ok(ChunkOutput::Translations(translations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeLanguageModel, book_with_chapters, translation_reply};
    use storyforge_scheduler::{CancellationToken, WorkerPool};
    use storyforge_shared::Chunk;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn processor(model: Arc<FakeLanguageModel>) -> TranslationProcessor {
        TranslationProcessor::new(
            model,
            Arc::new(RateLimiter::per_minute("fake-llm", 0)),
            TranslationSettings {
                target_language: "French".into(),
            },
        )
    }

    fn run_ctx() -> ProcessContext {
        ProcessContext::new(WorkerPool::new("media", 1), CancellationToken::new())
    }

    #[test]
    fn accepts_wrapped_bare_and_map_replies() {
        let expected = ids(&["a", "b"]);
        let wrapped = r#"{"translations": [{"id": "b", "text": "deux"}, {"id": "a", "text": "un"}]}"#;
        assert_eq!(
            parse_translations(wrapped, &expected).unwrap(),
            vec![("a".to_string(), "un".to_string()), ("b".to_string(), "deux".to_string())]
        );

        let bare = r#"[{"id": "a", "text": "un"}, {"id": "b", "text": "deux"}]"#;
        assert_eq!(parse_translations(bare, &expected).unwrap().len(), 2);

        let map = "```json\n{\"a\": \"un\", \"b\": \"deux\", \"zzz\": \"extra\"}\n```";
        assert_eq!(parse_translations(map, &expected).unwrap().len(), 2);
    }

    #[test]
    fn incomplete_reply_is_malformed() {
        let reply = r#"{"translations": [{"id": "a", "text": "un"}]}"#;
        let err = parse_translations(reply, &ids(&["a", "b"])).unwrap_err();
        assert!(err.is_retryable_parse());
        assert!(err.to_string().contains("missing 1 of 2"));
    }

    #[tokio::test]
    async fn translates_every_line_in_chunk() {
        let book = book_with_chapters(&[3]);
        let work =
            ChunkWork::prepare(&book, Chunk::new("ch0#0", "ch0", "ch0-0", "ch0-2", None)).unwrap();
        let model = Arc::new(FakeLanguageModel::responding(translation_reply));

        let ChunkOutput::Translations(items) =
            processor(model.clone()).process(&work, &run_ctx()).await.unwrap()
        else {
            panic!("expected translations");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], ("ch0-2".to_string(), "[fr] ch0-2".to_string()));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn incomplete_then_complete_reply_succeeds_on_retry() {
        let book = book_with_chapters(&[2]);
        let work =
            ChunkWork::prepare(&book, Chunk::new("ch0#0", "ch0", "ch0-0", "ch0-1", None)).unwrap();
        let model = Arc::new(FakeLanguageModel::scripted(vec![
            Ok(r#"{"translations": [{"id": "ch0-0", "text": "un"}]}"#.into()),
            Ok(r#"{"ch0-0": "un", "ch0-1": "deux"}"#.into()),
        ]));

        let output = processor(model.clone()).process(&work, &run_ctx()).await.unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(model.calls(), 2);
    }
}
