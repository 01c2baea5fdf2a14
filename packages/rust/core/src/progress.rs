//! Progress reporting for generation runs.

use storyforge_shared::Chunk;

use crate::orchestrator::RunSummary;

/// Progress callback for a run.
///
/// Called from worker tasks, so implementations must be cheap and must not
/// block.
pub trait RunProgress: Send + Sync {
    /// Called once work is about to be submitted.
    fn started(&self, total: usize, already_completed: usize, runnable: usize);
    /// Called when a chunk starts and again when it settles.
    ///
    /// `fraction` is completed/total over the whole entry, including chunks
    /// completed by earlier runs.
    fn chunk_update(&self, fraction: f64, chunk: &Chunk);
    /// Called when the run finishes without cancellation.
    fn finished(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn started(&self, _total: usize, _already_completed: usize, _runnable: usize) {}
    fn chunk_update(&self, _fraction: f64, _chunk: &Chunk) {}
    fn finished(&self, _summary: &RunSummary) {}
}
