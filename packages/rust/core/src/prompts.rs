//! Prompt construction for each generation kind.
//!
//! Prompts depend only on the chunk's text and settings, so a retried
//! chunk re-derives exactly the same request.

use serde::Serialize;

use storyforge_providers::ChatMessage;
use storyforge_shared::Line;

pub const SCENE_SYSTEM_PROMPT: &str = "You are an illustrator's assistant. You read a passage \
of a novel and pick the moments most worth illustrating. Reply with JSON only, in the form \
{\"scenes\": [{\"line_id\": string, \"description\": string, \"prompt\": string, \
\"negative_prompt\": string | null}]}. `line_id` must be the id of the line the scene depicts. \
`prompt` is a self-contained image-generation prompt describing subject, setting, lighting and \
composition. Do not include text or captions in the image.";

pub const TRANSLATION_SYSTEM_PROMPT: &str = "You are a literary translator. Translate every \
line you are given, preserving tone, register and line boundaries. Reply with JSON only, in \
the form {\"translations\": [{\"id\": string, \"text\": string}]}, with exactly one entry per \
input line id.";

/// Request `scene_count` scenes for the given lines.
pub fn scene_request(chapter_title: Option<&str>, lines: &[Line], scene_count: u32) -> Vec<ChatMessage> {
    let mut body = String::new();
    if let Some(title) = chapter_title {
        body.push_str(&format!("Chapter: {title}\n"));
    }
    body.push_str(&format!("Scenes requested: {scene_count}\n\nPassage:\n"));
    for line in lines {
        body.push_str(&format!("[{}] {}\n", line.id, line.text));
    }
    vec![ChatMessage::user(body)]
}

#[derive(Serialize)]
struct SourceLine<'a> {
    id: &'a str,
    text: &'a str,
}

/// Request a translation of every line into `target_language`.
pub fn translation_request(target_language: &str, lines: &[Line]) -> Vec<ChatMessage> {
    let source: Vec<SourceLine<'_>> = lines
        .iter()
        .map(|l| SourceLine {
            id: &l.id,
            text: &l.text,
        })
        .collect();
    // Serializing borrowed strings cannot fail.
    let json = serde_json::to_string(&source).unwrap_or_default();
    vec![ChatMessage::user(format!(
        "Target language: {target_language}\n\nLines:\n{json}"
    ))]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines() -> Vec<Line> {
        vec![Line::new("ch1-1", "Rain fell."), Line::new("ch1-2", "She said \"no\".")]
    }

    #[test]
    fn scene_request_lists_line_ids() {
        let messages = scene_request(Some("Arrival"), &lines(), 2);
        assert_eq!(messages.len(), 1);
        let body = &messages[0].content;
        assert!(body.starts_with("Chapter: Arrival\n"));
        assert!(body.contains("Scenes requested: 2"));
        assert!(body.contains("[ch1-1] Rain fell."));
        assert!(body.contains("[ch1-2] She said \"no\"."));
    }

    #[test]
    fn translation_request_embeds_lines_as_json() {
        let messages = translation_request("French", &lines());
        let body = &messages[0].content;
        assert!(body.contains("Target language: French"));
        assert!(body.contains(r#"{"id":"ch1-2","text":"She said \"no\"."}"#));
    }

    #[test]
    fn requests_are_deterministic() {
        assert_eq!(scene_request(None, &lines(), 1), scene_request(None, &lines(), 1));
    }
}
