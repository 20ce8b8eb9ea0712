//! Checkpoint store: the project directory scheme, atomic JSON persistence,
//! and the persisted pipeline state.
//!
//! Everything a run produces lives under one project tree:
//!
//! ```text
//! <output_root>/<project>/<content_type>/        base dir
//!   retrieval_index/                             retrieval service index
//!   retrieval_output/                            parsed artifacts (markdown, figures)
//!   <fast|normal>/                               mode dir
//!     checkpoint_retrieve.json                   shared across output configs
//!     checkpoint_summarize.json
//!     summary.md
//!     <output>_<style>_<length|density>/         config dir
//!       checkpoint_plan.json
//!       state.json
//!       <YYYYMMDD_HHMMSS>/                       one run dir per render pass
//! ```
//!
//! Retrieve and summarize results depend only on the document and mode, so
//! they sit above the config dir and are reused across styles and lengths.
//! All JSON goes through temp-file-then-rename so a crash never leaves a
//! half-written checkpoint behind.

use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::GenerationConfig;
use crate::error::EngineError;
use crate::pipeline::Stage;

static RUN_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    // Timestamped run dirs sort lexicographically in creation order.
    Regex::new(r"^\d{8}_\d{6}$").unwrap_or_else(|e| panic!("invalid run dir regex: {e}"))
});

// ── Directory scheme ─────────────────────────────────────────────────────

/// Resolved paths for one project/configuration pair.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    base_dir: PathBuf,
    mode_dir: PathBuf,
    config_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(output_root: &Path, config: &GenerationConfig) -> Self {
        let base_dir = output_root
            .join(&config.project)
            .join(config.content_type.as_str());
        let mode_dir = base_dir.join(config.mode_name());
        let config_dir = mode_dir.join(config.config_name());
        Self {
            base_dir,
            mode_dir,
            config_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn mode_dir(&self) -> &Path {
        &self.mode_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Index storage for the retrieval service.
    pub fn retrieval_index(&self) -> PathBuf {
        self.base_dir.join("retrieval_index")
    }

    /// Parsed artifacts written by ingestion (markdown, figures, layout dumps).
    pub fn retrieval_output(&self) -> PathBuf {
        self.base_dir.join("retrieval_output")
    }

    pub fn retrieve_checkpoint(&self) -> PathBuf {
        self.mode_dir.join("checkpoint_retrieve.json")
    }

    pub fn summarize_checkpoint(&self) -> PathBuf {
        self.mode_dir.join("checkpoint_summarize.json")
    }

    pub fn summary_markdown(&self) -> PathBuf {
        self.mode_dir.join("summary.md")
    }

    pub fn plan_checkpoint(&self) -> PathBuf {
        self.config_dir.join("checkpoint_plan.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    /// Fresh timestamped run directory path (not created).
    pub fn new_run_dir(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.config_dir.join(stamp)
    }

    /// Most recent run directory, by lexicographic order of the timestamp
    /// names. Non-run entries under the config dir are ignored.
    pub fn latest_run_dir(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.config_dir).ok()?;
        let mut latest: Option<(String, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !RUN_DIR_RE.is_match(name) {
                continue;
            }
            match &latest {
                Some((best, _)) if best.as_str() >= name => {}
                _ => latest = Some((name.to_string(), path)),
            }
        }
        latest.map(|(_, path)| path)
    }
}

// ── Atomic JSON persistence ──────────────────────────────────────────────

/// Write a JSON document via temp file + rename in the target directory.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| EngineError::Internal(format!("serialize {}: {e}", path.display())))?;
    write_bytes_atomic(path, &bytes)
}

/// Write text via temp file + rename.
pub fn write_text_atomic(path: &Path, text: &str) -> Result<(), EngineError> {
    write_bytes_atomic(path, text.as_bytes())
}

/// Write raw bytes via temp file + rename.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let map_err = |source| EngineError::OutputWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(map_err)?;
    }
    let tmp = tmp_sibling(path);
    fs::write(&tmp, bytes).map_err(map_err)?;
    fs::rename(&tmp, path).map_err(map_err)?;
    Ok(())
}

// The temp file must live on the same filesystem as the target for the
// rename to stay atomic.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read and parse a JSON document. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EngineError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(EngineError::CheckpointRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| EngineError::CheckpointParse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(Some(value))
}

// ── Pipeline state ───────────────────────────────────────────────────────

/// Status of one pipeline stage as recorded in `state.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Persisted pipeline state, one per configuration directory.
///
/// Consumers poll this file for progress, so every transition is written
/// immediately rather than batched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub config: GenerationConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stages: BTreeMap<String, StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(config: GenerationConfig) -> Self {
        let now = Utc::now();
        let stages = Stage::all()
            .iter()
            .map(|s| (s.as_str().to_string(), StageStatus::Pending))
            .collect();
        Self {
            config,
            created_at: now,
            updated_at: now,
            stages,
            session_id: None,
            error: None,
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stages
            .get(stage.as_str())
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        self.stages.insert(stage.as_str().to_string(), status);
    }

    /// Reset `from` and every later stage to pending, ahead of a re-run.
    /// Earlier stages keep their recorded status.
    pub fn reset_from(&mut self, from: Stage) {
        for stage in Stage::all() {
            if stage.order() >= from.order() {
                self.set_status(*stage, StageStatus::Pending);
            }
        }
        self.error = None;
    }

    /// First stage recorded as failed, with its error message.
    pub fn first_failure(&self) -> Option<(Stage, String)> {
        for stage in Stage::all() {
            if self.status(*stage) == StageStatus::Failed {
                let detail = self.error.clone().unwrap_or_else(|| "unknown error".into());
                return Some((*stage, detail));
            }
        }
        None
    }
}

/// Load `state.json`; `Ok(None)` when no run has been recorded yet.
pub fn load_state(paths: &ProjectPaths) -> Result<Option<PipelineState>, EngineError> {
    read_json(&paths.state_file())
}

/// Persist the state, refreshing `updated_at`.
pub fn save_state(paths: &ProjectPaths, state: &mut PipelineState) -> Result<(), EngineError> {
    state.updated_at = Utc::now();
    write_json_atomic(&paths.state_file(), state)
}

/// Earliest stage whose checkpoint is missing.
///
/// Checkpoints are keyed by what they depend on: retrieve and summarize by
/// document and mode, plan by output configuration. Render output is never a
/// checkpoint; a run with all three checkpoints present starts at render.
pub fn detect_start_stage(paths: &ProjectPaths) -> Stage {
    if !paths.retrieve_checkpoint().exists() {
        return Stage::Retrieve;
    }
    if !paths.summarize_checkpoint().exists() {
        return Stage::Summarize;
    }
    if !paths.plan_checkpoint().exists() {
        return Stage::Plan;
    }
    Stage::Render
}
