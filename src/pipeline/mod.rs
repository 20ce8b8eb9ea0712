//! The four-stage generation pipeline and its state machine.
//!
//! Each submodule implements exactly one stage. Keeping stages separate
//! makes each independently resumable: every stage persists a checkpoint,
//! and a re-run starts from the first stage whose checkpoint is missing.
//!
//! ## Data Flow
//!
//! ```text
//! retrieve ──▶ summarize ──▶ plan ──▶ render
//! (ingest+query) (extraction)  (deck plan)  (images, pdf, decks)
//! ```
//!
//! 1. [`retrieve`]  — ingest the document into the retrieval service and run
//!    the configured query set
//! 2. [`summarize`] — distil the retrieved answers into a structured summary
//!    plus a figure/table inventory
//! 3. [`plan`]      — turn the summary into a per-slide (or poster) plan
//! 4. [`render`]    — generate slide images, the combined PDF, editable
//!    decks, and optional per-slide asset bundles
//!
//! Stage status lives in `state.json` next to the checkpoints; the pipeline
//! persists every transition so a crash or cancellation is observable and a
//! re-run continues instead of starting over.

pub mod plan;
pub mod render;
pub mod retrieve;
pub mod summarize;

use crate::checkpoint::{self, detect_start_stage, ProjectPaths, StageStatus};
use crate::config::{EngineConfig, GenerationConfig};
use crate::error::EngineError;
use crate::model::{ModelClient, Retriever};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

// ── Stages ───────────────────────────────────────────────────────────────

/// One pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Retrieve,
    Summarize,
    Plan,
    Render,
}

impl Stage {
    /// All stages in execution order.
    pub fn all() -> &'static [Stage] {
        &[Stage::Retrieve, Stage::Summarize, Stage::Plan, Stage::Render]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieve => "retrieve",
            Stage::Summarize => "summarize",
            Stage::Plan => "plan",
            Stage::Render => "render",
        }
    }

    /// Position in the execution order, starting at 0.
    pub fn order(&self) -> usize {
        match self {
            Stage::Retrieve => 0,
            Stage::Summarize => 1,
            Stage::Plan => 2,
            Stage::Render => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retrieve" => Ok(Stage::Retrieve),
            "summarize" => Ok(Stage::Summarize),
            "plan" => Ok(Stage::Plan),
            "render" => Ok(Stage::Render),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown stage \"{other}\" (expected retrieve, summarize, plan or render)"
            ))),
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative cancellation flag, observed at stage boundaries only.
///
/// Clones share the flag. A running stage is never interrupted mid-flight;
/// the pipeline checks the token before starting each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Sequences the four stages over one project configuration.
///
/// Holds the collaborators every stage needs; stage modules borrow the
/// pipeline rather than receiving a dozen arguments each.
pub struct Pipeline {
    paths: ProjectPaths,
    request: GenerationConfig,
    engine: EngineConfig,
    model: Arc<dyn ModelClient>,
    retriever: Arc<dyn Retriever>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        output_root: &Path,
        request: GenerationConfig,
        engine: EngineConfig,
        model: Arc<dyn ModelClient>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            paths: ProjectPaths::new(output_root, &request),
            request,
            engine,
            model,
            retriever,
            cancel: CancelToken::new(),
        }
    }

    /// Install a shared cancellation token (for external cancel buttons).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn request(&self) -> &GenerationConfig {
        &self.request
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }

    /// Run the pipeline from `from`, or from the first stage whose
    /// checkpoint is missing.
    ///
    /// Every status transition is persisted before the next step: a crash
    /// mid-stage leaves `running` behind and the stage is simply re-run on
    /// resume. A stage error stops execution, is recorded in `state.json`,
    /// and is returned to the caller.
    pub async fn run(&self, from: Option<Stage>) -> Result<(), EngineError> {
        let start = from.unwrap_or_else(|| detect_start_stage(&self.paths));
        info!("Starting from stage: {start}");

        let mut state = match checkpoint::load_state(&self.paths)? {
            Some(mut state) => {
                // Re-executed stages go back to pending so observers see
                // accurate progress.
                state.reset_from(start);
                if self.request.session_id.is_some() {
                    state.session_id = self.request.session_id.clone();
                }
                state
            }
            None => checkpoint::PipelineState::new(self.request.clone()),
        };
        checkpoint::save_state(&self.paths, &mut state)?;

        let mut failure: Option<EngineError> = None;
        for stage in &Stage::all()[start.order()..] {
            if self.cancel.is_cancelled() {
                info!("Pipeline cancelled at stage: {stage}");
                state.set_status(*stage, StageStatus::Cancelled);
                state.error = Some("Cancelled by user".into());
                checkpoint::save_state(&self.paths, &mut state)?;
                return Err(EngineError::Cancelled);
            }

            info!("=== Stage: {stage} ===");
            state.set_status(*stage, StageStatus::Running);
            checkpoint::save_state(&self.paths, &mut state)?;

            match self.run_stage(*stage).await {
                Ok(()) => {
                    state.set_status(*stage, StageStatus::Completed);
                    checkpoint::save_state(&self.paths, &mut state)?;
                }
                Err(e) => {
                    error!("Stage {stage} failed: {e}");
                    state.set_status(*stage, StageStatus::Failed);
                    state.error = Some(e.to_string());
                    checkpoint::save_state(&self.paths, &mut state)?;
                    failure = Some(e);
                    break;
                }
            }
        }

        for stage in Stage::all() {
            info!("  [{}] {}", status_mark(state.status(*stage)), stage);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_stage(&self, stage: Stage) -> Result<(), EngineError> {
        match stage {
            Stage::Retrieve => retrieve::run(self).await,
            Stage::Summarize => summarize::run(self).await,
            Stage::Plan => plan::run(self).await,
            Stage::Render => render::run(self).await,
        }
    }
}

fn status_mark(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "ok",
        StageStatus::Failed => "failed",
        StageStatus::Cancelled => "cancelled",
        StageStatus::Running => "running",
        StageStatus::Pending => "-",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BoxError, GeneratedImage, ImageRequest, RetrievalMode, TextRequest,
    };
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopModel;

    #[async_trait]
    impl ModelClient for NoopModel {
        async fn generate_text(&self, _request: TextRequest) -> Result<String, BoxError> {
            Err("no model in this test".into())
        }

        async fn generate_image(&self, _request: ImageRequest) -> Result<GeneratedImage, BoxError> {
            Err("no model in this test".into())
        }
    }

    struct NoopRetriever;

    #[async_trait]
    impl Retriever for NoopRetriever {
        async fn ingest(
            &self,
            _input: &Path,
            _index_dir: &Path,
            _artifact_dir: &Path,
        ) -> Result<(), BoxError> {
            Err("no retriever in this test".into())
        }

        async fn query(&self, _query: &str, _mode: RetrievalMode) -> Result<String, BoxError> {
            Err("no retriever in this test".into())
        }
    }

    fn pipeline_at(root: &Path) -> Pipeline {
        Pipeline::new(
            root,
            GenerationConfig::new("demo", root.join("demo.pdf")),
            EngineConfig::default(),
            Arc::new(NoopModel),
            Arc::new(NoopRetriever),
        )
    }

    #[test]
    fn stages_are_ordered_and_named() {
        let all = Stage::all();
        assert_eq!(all.len(), 4);
        for (i, stage) in all.iter().enumerate() {
            assert_eq!(stage.order(), i);
        }
        assert_eq!(Stage::Retrieve.to_string(), "retrieve");
        assert_eq!("render".parse::<Stage>().unwrap(), Stage::Render);
        assert!("analysis".parse::<Stage>().is_err());
    }

    #[tokio::test]
    async fn pre_cancelled_run_marks_first_stage() {
        let root = TempDir::new().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel();
        let pipeline = pipeline_at(root.path()).with_cancel(cancel);

        let err = pipeline.run(None).await.expect_err("must cancel");
        assert!(matches!(err, EngineError::Cancelled));

        let state = checkpoint::load_state(pipeline.paths())
            .expect("state readable")
            .expect("state written");
        assert_eq!(state.status(Stage::Retrieve), StageStatus::Cancelled);
        assert_eq!(state.status(Stage::Summarize), StageStatus::Pending);
        assert_eq!(state.error.as_deref(), Some("Cancelled by user"));
    }

    #[tokio::test]
    async fn failing_stage_is_recorded_and_returned() {
        let root = TempDir::new().expect("tempdir");
        let pipeline = pipeline_at(root.path());

        let err = pipeline.run(None).await.expect_err("retriever fails");
        let state = checkpoint::load_state(pipeline.paths())
            .expect("state readable")
            .expect("state written");
        assert_eq!(state.status(Stage::Retrieve), StageStatus::Failed);
        assert_eq!(state.error.as_deref(), Some(err.to_string().as_str()));
        // Later stages were never reached.
        assert_eq!(state.status(Stage::Summarize), StageStatus::Pending);
    }

    #[tokio::test]
    async fn resume_resets_later_stage_statuses() {
        let root = TempDir::new().expect("tempdir");
        let pipeline = pipeline_at(root.path());

        let mut state = checkpoint::PipelineState::new(pipeline.request().clone());
        state.set_status(Stage::Retrieve, StageStatus::Completed);
        state.set_status(Stage::Summarize, StageStatus::Completed);
        state.set_status(Stage::Plan, StageStatus::Failed);
        state.error = Some("earlier failure".into());
        checkpoint::save_state(pipeline.paths(), &mut state).expect("seed state");

        // Cancel immediately: run() records the reset before the first
        // stage check, so the persisted state shows the effect of resuming
        // from plan without executing anything real.
        let cancel = CancelToken::new();
        cancel.cancel();
        let pipeline = pipeline_at(root.path()).with_cancel(cancel);
        let _ = pipeline.run(Some(Stage::Plan)).await;

        let state = checkpoint::load_state(pipeline.paths())
            .expect("state readable")
            .expect("state written");
        assert_eq!(state.status(Stage::Retrieve), StageStatus::Completed);
        assert_eq!(state.status(Stage::Summarize), StageStatus::Completed);
        assert_eq!(state.status(Stage::Plan), StageStatus::Cancelled);
        assert_eq!(state.status(Stage::Render), StageStatus::Pending);
    }
}
