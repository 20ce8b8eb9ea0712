//! Error types for the slideforge library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`EngineError`] — **Fatal**: the request cannot proceed (bad
//!   configuration, unreadable checkpoint, model output unusable after every
//!   repair pass, deck container unwritable). A stage that returns this stops
//!   the pipeline and the failure is persisted in `state.json`.
//!
//! * [`Skipped`] — **Non-fatal**: one refinement sub-step declined or failed
//!   (crop below the minimum size, tightened bbox rejected by the guards,
//!   cleanup call returned nothing usable). The element keeps its original
//!   form and processing continues. Sub-steps return `Result<T, Skipped>` so
//!   "continue with the original" is a structural outcome, not an
//!   exception-shaped accident.
//!
//! The separation keeps degradation visible: every `Skipped` is logged at the
//! point it happens, while only `EngineError` values ever abort a run.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the slideforge library.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Request / configuration errors ───────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request itself is unusable (no input files, empty name, …).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ── Checkpoint & state errors ────────────────────────────────────────
    /// A checkpoint or state document could not be read.
    #[error("Failed to read '{path}': {source}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint or state document exists but is not valid JSON.
    #[error("Corrupt checkpoint '{path}': {detail}")]
    CheckpointParse { path: PathBuf, detail: String },

    /// A checkpoint, state document, or output artifact could not be written.
    #[error("Failed to write '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stage needs an earlier stage's checkpoint that does not exist.
    #[error("Missing checkpoint for stage '{stage}'. Run the pipeline from an earlier stage first.")]
    MissingCheckpoint { stage: String },

    /// A previously persisted run recorded a failed stage.
    ///
    /// Surfaced when a cache entry is consulted and its `state.json` shows
    /// the pipeline stopped on an error rather than completing.
    #[error("stage \"{stage}\" failed: {detail}")]
    StageFailed { stage: String, detail: String },

    /// The run was cancelled via the cooperative cancellation flag.
    #[error("Pipeline cancelled by user")]
    Cancelled,

    // ── Cache errors ─────────────────────────────────────────────────────
    /// Filesystem operation inside the cache root failed.
    #[error("Cache I/O error at '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The exclusive lock on a cache entry could not be acquired at all.
    ///
    /// Contention is NOT an error (callers block); this fires only when the
    /// lock file itself cannot be created or the lock syscall fails.
    #[error("Failed to lock cache entry '{path}': {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Model boundary errors ────────────────────────────────────────────
    /// The model client returned an error for a call the stage cannot
    /// continue without.
    #[error("Model call failed ({context}): {detail}")]
    ModelCall { context: String, detail: String },

    /// Model output stayed unusable after the full repair ladder.
    #[error("Unusable model output ({context}): {detail}")]
    ModelOutput { context: String, detail: String },

    /// The retrieval service returned an error.
    #[error("Retrieval failed ({context}): {detail}")]
    Retrieval { context: String, detail: String },

    // ── Render / export errors ───────────────────────────────────────────
    /// An image file could not be decoded.
    #[error("Failed to decode image '{path}': {detail}")]
    ImageDecode { path: PathBuf, detail: String },

    /// Rasterising a source document page failed.
    #[error("Failed to render source '{path}': {detail}")]
    SourceRender { path: PathBuf, detail: String },

    /// The presentation container could not be assembled.
    #[error("Failed to build deck: {0}")]
    DeckBuild(String),

    /// The combined PDF could not be assembled.
    #[error("Failed to build PDF: {0}")]
    PdfBuild(String),

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error (panicked blocking task, runtime failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal reason a refinement sub-step left an element unchanged.
///
/// Returned as the `Err` arm of every optional transform in asset
/// refinement and background reconstruction. Callers log the reason and
/// keep the original data; nothing here ever propagates to [`EngineError`].
#[derive(Debug, Clone, Error)]
pub enum Skipped {
    /// The feature is switched off in configuration.
    #[error("disabled by configuration")]
    Disabled,

    /// The crop is below the minimum size worth refining.
    #[error("crop {width}x{height}px below minimum {min}px")]
    TooSmall { width: u32, height: u32, min: u32 },

    /// The tightened bbox failed the area or side-length guards.
    #[error("refined bbox rejected: {detail}")]
    Rejected { detail: String },

    /// The scoped model call failed or returned nothing usable.
    #[error("model call yielded nothing usable: {detail}")]
    ModelUnusable { detail: String },

    /// Returned bytes could not be decoded as an image.
    #[error("undecodable image payload: {detail}")]
    Undecodable { detail: String },

    /// Background color estimation or keying fell outside its guards.
    #[error("color key abandoned: {detail}")]
    ColorKey { detail: String },
}
