//! Configuration types for the generation engine.
//!
//! Two layers, deliberately separate:
//!
//! * [`EngineConfig`] — process-scoped tunables (cache root, concurrency,
//!   refinement knobs), built once via its builder and shared across requests.
//! * [`GenerationConfig`] — the immutable per-request descriptor. It is
//!   serialised into `state.json`, determines the checkpoint directory name,
//!   and (minus its volatile fields) feeds the cache key.
//!
//! # Design choice: builder over constructor
//! The engine has a dozen-plus knobs and grows more with every refinement
//! pass. The builder lets callers set only what they care about, clamps
//! obviously-invalid values at the setter, and validates the rest in
//! `build()`.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-scoped engine tunables.
///
/// Built via [`EngineConfig::builder()`] or [`EngineConfig::default()`].
///
/// # Example
/// ```rust
/// use slideforge::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .concurrency(8)
///     .cache_root("/var/cache/slideforge")
///     .clean_assets(false)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory of the content-addressed cache. Default: None.
    ///
    /// `None` means no caching: each request runs in an ephemeral directory
    /// that is deleted afterwards regardless of outcome. Set this to reuse
    /// results across identical requests and to get cross-process
    /// serialisation of duplicate work.
    pub cache_root: Option<PathBuf>,

    /// Maximum number of cache entries kept on disk. Default: 100.
    ///
    /// When a request enters the cache and more than this many entries
    /// exist, the oldest (by directory mtime) unlocked entries beyond the
    /// cap are deleted. `0` disables eviction entirely — the cache grows
    /// without bound.
    pub cache_max_items: usize,

    /// Number of concurrent model calls within one stage. Default: 4.
    ///
    /// Slide-image generation and per-slide layout extraction fan out up to
    /// this many calls at once; results are reassembled in request order.
    /// Stages themselves always run sequentially.
    pub concurrency: usize,

    /// Extra attempts for the layout-extraction call when its JSON cannot be
    /// salvaged. Default: 1.
    ///
    /// The retry uses a stricter JSON-only prompt. Retries beyond one rarely
    /// help: a model that ignores the strict instruction twice will keep
    /// ignoring it.
    pub layout_max_retries: u32,

    /// Token budget for the layout-extraction call. Default: 8192.
    ///
    /// Dense slides can need several thousand tokens of element JSON. Too
    /// low a budget truncates mid-document — the repair ladder recovers the
    /// balanced prefix, but trailing elements are lost.
    pub layout_max_tokens: usize,

    /// Token budget for the summarize-stage call. Default: 4096.
    pub summary_max_tokens: usize,

    /// Token budget for the plan-stage call. Default: 8192.
    pub plan_max_tokens: usize,

    /// Tighten loose bounding boxes with a scoped second model call. Default: true.
    pub refine_assets: bool,

    /// Regenerate assets as standalone, background-free images. Default: true.
    pub clean_assets: bool,

    /// Let one model call adjust text element geometry after extraction. Default: true.
    ///
    /// The pass may change bbox/text/font_size/align of *existing* text
    /// elements only; it can never add elements or invent content.
    pub refine_text_layout: bool,

    /// Token budget for one bbox-tightening call. Default: 512.
    pub refine_max_tokens: usize,

    /// Token budget for the text-layout refinement call. Default: 2048.
    pub refine_text_max_tokens: usize,

    /// Extra attempts for the asset-cleaning image call. Default: 1.
    pub clean_max_retries: u32,

    /// Minimum crop side (px) worth refining. Default: 40.
    ///
    /// Below this the crop carries too little signal for the model to find a
    /// tighter box, and the call is wasted money.
    pub refine_min_size: u32,

    /// Minimum crop side (px) worth cleaning. Default: 40.
    pub clean_min_size: u32,

    /// Per-channel tolerance for background color-key transparency. Default: 18.
    ///
    /// Pixels within this distance of the estimated border color become
    /// transparent. `<= 0` disables keying and cleaned assets stay opaque.
    pub clean_bg_tolerance: i32,

    /// Target pixel width for decks built from parsed document layouts. Default: 1920.
    pub deck_target_width: u32,

    /// Target pixel height for decks built from parsed document layouts. Default: 1080.
    pub deck_target_height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            cache_max_items: 100,
            concurrency: 4,
            layout_max_retries: 1,
            layout_max_tokens: 8192,
            summary_max_tokens: 4096,
            plan_max_tokens: 8192,
            refine_assets: true,
            clean_assets: true,
            refine_text_layout: true,
            refine_max_tokens: 512,
            refine_text_max_tokens: 2048,
            clean_max_retries: 1,
            refine_min_size: 40,
            clean_min_size: 40,
            clean_bg_tolerance: 18,
            deck_target_width: 1920,
            deck_target_height: 1080,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.cache_root = Some(root.into());
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.config.cache_root = None;
        self
    }

    pub fn cache_max_items(mut self, n: usize) -> Self {
        self.config.cache_max_items = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn layout_max_retries(mut self, n: u32) -> Self {
        self.config.layout_max_retries = n;
        self
    }

    pub fn layout_max_tokens(mut self, n: usize) -> Self {
        self.config.layout_max_tokens = n.max(256);
        self
    }

    pub fn summary_max_tokens(mut self, n: usize) -> Self {
        self.config.summary_max_tokens = n.max(256);
        self
    }

    pub fn plan_max_tokens(mut self, n: usize) -> Self {
        self.config.plan_max_tokens = n.max(256);
        self
    }

    pub fn refine_assets(mut self, v: bool) -> Self {
        self.config.refine_assets = v;
        self
    }

    pub fn clean_assets(mut self, v: bool) -> Self {
        self.config.clean_assets = v;
        self
    }

    pub fn refine_text_layout(mut self, v: bool) -> Self {
        self.config.refine_text_layout = v;
        self
    }

    pub fn refine_max_tokens(mut self, n: usize) -> Self {
        self.config.refine_max_tokens = n.max(64);
        self
    }

    pub fn refine_text_max_tokens(mut self, n: usize) -> Self {
        self.config.refine_text_max_tokens = n.max(64);
        self
    }

    pub fn clean_max_retries(mut self, n: u32) -> Self {
        self.config.clean_max_retries = n;
        self
    }

    pub fn refine_min_size(mut self, px: u32) -> Self {
        self.config.refine_min_size = px;
        self
    }

    pub fn clean_min_size(mut self, px: u32) -> Self {
        self.config.clean_min_size = px;
        self
    }

    pub fn clean_bg_tolerance(mut self, tol: i32) -> Self {
        self.config.clean_bg_tolerance = tol.min(255);
        self
    }

    pub fn deck_target_size(mut self, width: u32, height: u32) -> Self {
        self.config.deck_target_width = width;
        self.config.deck_target_height = height;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.deck_target_width == 0 || c.deck_target_height == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "Deck target size must be positive, got {}x{}",
                c.deck_target_width, c.deck_target_height
            )));
        }
        Ok(self.config)
    }
}

// ── Request descriptor ───────────────────────────────────────────────────

/// What to produce from the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// A multi-slide deck (default).
    #[default]
    Slides,
    /// A single poster image.
    Poster,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Slides => "slides",
            OutputType::Poster => "poster",
        }
    }
}

/// How to read the document: as an academic paper or as free-form content.
///
/// Papers get the structured query set (background, method, results, …);
/// general documents get the topic-driven one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Paper,
    General,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Paper => "paper",
            ContentType::General => "general",
        }
    }
}

/// Visual style family for generated slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    /// Clean, restrained, conference-presentation look (default).
    #[default]
    Academic,
    /// Saturated colors and illustrative shapes.
    Vivid,
    /// Free-form style described by [`GenerationConfig::custom_style`].
    Custom,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Academic => "academic",
            Style::Vivid => "vivid",
            Style::Custom => "custom",
        }
    }
}

/// Deck length band. Maps to a page-count range passed to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidesLength {
    Short,
    #[default]
    Medium,
    Long,
}

impl SlidesLength {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlidesLength::Short => "short",
            SlidesLength::Medium => "medium",
            SlidesLength::Long => "long",
        }
    }

    /// Inclusive page-count range handed to the planner.
    pub fn page_range(&self) -> (usize, usize) {
        match self {
            SlidesLength::Short => (5, 8),
            SlidesLength::Medium => (8, 12),
            SlidesLength::Long => (12, 15),
        }
    }
}

/// Content density for poster output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosterDensity {
    Sparse,
    #[default]
    Medium,
    Dense,
}

impl PosterDensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PosterDensity::Sparse => "sparse",
            PosterDensity::Medium => "medium",
            PosterDensity::Dense => "dense",
        }
    }
}

/// Immutable per-request descriptor.
///
/// Determines the checkpoint directory name (via [`Self::config_name`] and
/// [`Self::mode_name`]) and — minus the volatile fields — the cache key (via
/// [`Self::cache_options`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Project name; usually the sanitized stem of the uploaded document.
    pub project: String,

    /// Path of the input document (file or directory of files).
    pub input_path: PathBuf,

    pub content_type: ContentType,
    pub output_type: OutputType,
    pub style: Style,

    /// Style description used when `style == Custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_style: Option<String>,

    pub slides_length: SlidesLength,
    pub poster_density: PosterDensity,

    /// Fast mode trades retrieval depth for latency; checkpoints live in a
    /// separate `fast/` directory so both modes can coexist per document.
    pub fast_mode: bool,

    /// Build per-slide asset bundles and the asset-based editable deck.
    pub extract_assets: bool,

    /// Caller-supplied identifier recorded in `state.json` for external
    /// progress/cancellation tracking. Never part of the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl GenerationConfig {
    /// A new request descriptor with default knobs.
    pub fn new(project: impl Into<String>, input_path: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            input_path: input_path.into(),
            content_type: ContentType::default(),
            output_type: OutputType::default(),
            style: Style::default(),
            custom_style: None,
            slides_length: SlidesLength::default(),
            poster_density: PosterDensity::default(),
            fast_mode: false,
            extract_assets: false,
            session_id: None,
        }
    }

    /// Checkpoint mode directory name.
    pub fn mode_name(&self) -> &'static str {
        if self.fast_mode {
            "fast"
        } else {
            "normal"
        }
    }

    /// Configuration directory name: `{output}_{style}_{length-or-density}`.
    ///
    /// A custom style contributes `custom_<first 16 sanitized chars>` so two
    /// different custom prompts land in two different directories.
    pub fn config_name(&self) -> String {
        let style_part = match self.style {
            Style::Custom => {
                let raw = self.custom_style.as_deref().unwrap_or("");
                let cleaned: String = raw
                    .chars()
                    .take(16)
                    .map(|c| if c == ' ' || c == '/' || c == '\\' { '_' } else { c })
                    .collect();
                if cleaned.is_empty() {
                    "custom".to_string()
                } else {
                    format!("custom_{cleaned}")
                }
            }
            other => other.as_str().to_string(),
        };
        let param = match self.output_type {
            OutputType::Slides => self.slides_length.as_str(),
            OutputType::Poster => self.poster_density.as_str(),
        };
        format!("{}_{}_{}", self.output_type.as_str(), style_part, param)
    }

    /// The request fields that participate in the cache key.
    ///
    /// Volatile fields are removed: `input_path` points inside the cache
    /// entry itself, `project` is derived from file names already hashed as
    /// (name, bytes) pairs, and `session_id` changes per caller. serde_json
    /// maps iterate in sorted key order, so the serialised form is already
    /// canonical.
    pub fn cache_options(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("input_path");
            map.remove("project");
            map.remove("session_id");
        }
        value
    }
}
