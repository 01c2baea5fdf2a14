//! Terminal progress for generation runs.

use indicatif::{ProgressBar, ProgressStyle};

use storyforge_core::{RunProgress, RunSummary};
use storyforge_shared::{Chunk, ChunkStatus};

/// Progress bar fed by the orchestrator's callbacks.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chunks {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }

    pub(crate) fn abandon(&self) {
        self.bar.abandon();
    }
}

impl RunProgress for CliProgress {
    fn started(&self, total: usize, already_completed: usize, _runnable: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(already_completed as u64);
    }

    fn chunk_update(&self, fraction: f64, chunk: &Chunk) {
        let len = self.bar.length().unwrap_or(0);
        self.bar.set_position((fraction * len as f64).round() as u64);
        match chunk.status {
            ChunkStatus::Running => self.bar.set_message(format!("running {}", chunk.id)),
            ChunkStatus::Failed => self.bar.println(format!(
                "  chunk {} failed: {}",
                chunk.id,
                chunk.last_error.as_deref().unwrap_or("unknown error")
            )),
            ChunkStatus::Completed | ChunkStatus::Pending => {}
        }
    }

    fn finished(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}
