//! # slideforge
//!
//! Turn documents into presentation decks and posters with generative
//! image models.
//!
//! ## Why this crate?
//!
//! Template-driven slide generators produce decks that look like templates:
//! text boxes poured into fixed layouts, figures shrunk into corners.
//! Instead this engine asks an image model to *design* each slide as a
//! single picture, then reconstructs editable artifacts (PPTX decks, a
//! combined PDF) around those images. Every stage checkpoints its output,
//! so a crashed or cancelled run resumes where it stopped and a repeated
//! run with identical inputs is served from a content-addressed cache.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Retrieve   ingest via the injected retrieval service, query per topic
//!  ├─ 2. Summarize  condense answers, inventory the document's tables/figures
//!  ├─ 3. Plan       one JSON call → per-slide briefs with table/figure refs
//!  └─ 4. Render     one image call per slide (opening first, as the style
//!                   anchor), then PDF + PPTX exports and, on request,
//!                   per-slide layout extraction into editable decks
//! ```
//!
//! Stage boundaries are durable: each writes a `checkpoint_<stage>.json`
//! under the project directory and `state.json` tracks per-stage status for
//! external observers. Model and retrieval access go through the
//! [`ModelClient`] and [`Retriever`] traits, injected as `Arc<dyn …>` so
//! callers own credentials, routing, and rate limits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use slideforge::{EngineConfig, GenerationConfig, Pipeline};
//! # use std::sync::Arc;
//! # fn my_model() -> Arc<dyn slideforge::ModelClient> { unimplemented!() }
//! # fn my_retriever() -> Arc<dyn slideforge::Retriever> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = GenerationConfig::new("attention-paper", "paper.pdf");
//!     let engine = EngineConfig::builder().build()?;
//!     let pipeline = Pipeline::new(
//!         Path::new("output"),
//!         request,
//!         engine,
//!         my_model(),
//!         my_retriever(),
//!     );
//!     // None: resume from the first stage whose checkpoint is missing.
//!     pipeline.run(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Outputs
//!
//! Each render run writes a timestamped directory under the project's
//! config dir containing:
//!
//! | File | When |
//! |------|------|
//! | `slide_NN.png` / `poster.png` | always (the model's images) |
//! | `slides.pdf` | decks with more than one slide |
//! | `slides.pptx` | every deck (full-bleed images) |
//! | `slides_editable.pptx` | a parsed document layout was found |
//! | `slides_editable_assets.pptx` | `extract_assets` was requested |
//!
//! Only the images are load-bearing: every export after them logs a
//! warning on failure and leaves the run green.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod deck;
pub mod error;
pub mod export;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheStore, InputFile, SlideOutputs};
pub use checkpoint::{PipelineState, ProjectPaths, StageStatus};
pub use config::{
    ContentType, EngineConfig, EngineConfigBuilder, GenerationConfig, OutputType, PosterDensity,
    SlidesLength, Style,
};
pub use error::EngineError;
pub use model::{
    BoxError, GeneratedImage, ImageData, ImageRequest, ModelClient, ReferenceImage, RetrievalMode,
    Retriever, TextRequest,
};
pub use pipeline::{CancelToken, Pipeline, Stage};
