//! Plan stage: one model call over the summary producing the slide plan.
//!
//! The model answers with a JSON object holding a `slides` array (decks) or a
//! `sections` array (posters). Both are normalised into the same
//! [`PlannedSlide`] list: positional ids, a layout kind derived from deck
//! position, and table/figure references resolved against the summarize
//! inventory. The checkpoint also carries that inventory forward so the
//! render stage never re-reads the parsed document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::OutputType;
use crate::error::EngineError;
use crate::layout::repair;
use crate::model::TextRequest;
use crate::pipeline::summarize::{FigureInfo, SummarizeCheckpoint, TableInfo};
use crate::pipeline::{Pipeline, Stage};
use crate::prompts::{self, SlidePosition};

// ── Plan types ───────────────────────────────────────────────────────────

/// Reference to an inventoried table placed on a slide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRef {
    pub table_id: String,
    /// Partial HTML extract the model chose to show instead of the full table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
    /// What the slide should emphasise about the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// Reference to an inventoried figure placed on a slide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigureRef {
    pub figure_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// Layout kind of a planned slide, decided by deck position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideKind {
    Opening,
    #[default]
    Content,
    Ending,
}

impl SlideKind {
    pub fn position(self) -> SlidePosition {
        match self {
            SlideKind::Opening => SlidePosition::Opening,
            SlideKind::Content => SlidePosition::Content,
            SlideKind::Ending => SlidePosition::Ending,
        }
    }
}

/// One planned slide, or one poster section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSlide {
    /// Stable id used for output file names (`slide_01`, `poster_method`).
    /// Normalisation rewrites unusable model ids, so a missing one is fine.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: SlideKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tables: Vec<TableRef>,
    #[serde(default)]
    pub figures: Vec<FigureRef>,
}

/// The full plan for a deck or poster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidePlan {
    /// `slides` or `poster`.
    pub output_type: String,
    pub sections: Vec<PlannedSlide>,
}

/// Table/figure inventory carried forward from the summarize stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginElements {
    #[serde(default)]
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub figures: Vec<FigureInfo>,
    /// Directory figure paths are relative to.
    #[serde(default)]
    pub base_path: String,
}

impl OriginElements {
    pub fn table(&self, id: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn figure(&self, id: &str) -> Option<&FigureInfo> {
        self.figures.iter().find(|f| f.id == id)
    }
}

/// Persisted output of the plan stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCheckpoint {
    pub content_type: String,
    pub origin: OriginElements,
    pub plan: SlidePlan,
}

// ── Stage ────────────────────────────────────────────────────────────────

pub async fn run(pipeline: &Pipeline) -> Result<(), EngineError> {
    let paths = pipeline.paths();
    let request = pipeline.request();
    let summary: SummarizeCheckpoint = checkpoint::read_json(&paths.summarize_checkpoint())?
        .ok_or_else(|| EngineError::MissingCheckpoint {
            stage: Stage::Summarize.as_str().to_string(),
        })?;

    let assets = assets_section(&summary.tables, &summary.figures);
    let is_paper = summary.content_type == "paper";
    let prompt = match request.output_type {
        OutputType::Slides => {
            let (min_pages, max_pages) = request.slides_length.page_range();
            prompts::slides_plan_prompt(is_paper, min_pages, max_pages, &summary.content, &assets)
        }
        OutputType::Poster => {
            prompts::poster_plan_prompt(request.poster_density.as_str(), &summary.content, &assets)
        }
    };

    let model_request = TextRequest::new(prompt)
        .json()
        .with_max_tokens(pipeline.engine().plan_max_tokens);
    let raw = pipeline
        .model()
        .generate_text(model_request)
        .await
        .map_err(|e| EngineError::ModelCall {
            context: "plan".into(),
            detail: e.to_string(),
        })?;

    let mut sections = parse_plan(&raw).ok_or_else(|| EngineError::ModelOutput {
        context: "plan".into(),
        detail: "no slide plan found in model output".into(),
    })?;
    normalize_sections(&mut sections, request.output_type);
    if request.output_type == OutputType::Slides {
        let (min_pages, max_pages) = request.slides_length.page_range();
        bound_page_count(&mut sections, min_pages, max_pages);
    }
    info!(
        "Planned {} {}",
        sections.len(),
        match request.output_type {
            OutputType::Slides => "slide(s)",
            OutputType::Poster => "poster section(s)",
        }
    );

    let data = PlanCheckpoint {
        content_type: summary.content_type.clone(),
        origin: OriginElements {
            tables: summary.tables,
            figures: summary.figures,
            base_path: summary.base_path,
        },
        plan: SlidePlan {
            output_type: request.output_type.as_str().to_string(),
            sections,
        },
    };
    checkpoint::write_json_atomic(&paths.plan_checkpoint(), &data)?;
    Ok(())
}

// ── Prompt assembly ──────────────────────────────────────────────────────

/// Inventory block inserted into the planning prompt. Tables carry their
/// full HTML so the model can quote real values in `extract`; figures are
/// listed by id and caption only.
fn assets_section(tables: &[TableInfo], figures: &[FigureInfo]) -> String {
    let mut out = String::new();
    if !tables.is_empty() {
        out.push_str("\n## Available Tables\n");
        for table in tables {
            out.push_str(&format!("\n{}\n", table.to_markdown()));
        }
    }
    if !figures.is_empty() {
        out.push_str("\n## Available Figures\n");
        for figure in figures {
            match &figure.caption {
                Some(caption) => out.push_str(&format!("- **{}**: {caption}\n", figure.id)),
                None => out.push_str(&format!("- **{}**\n", figure.id)),
            }
        }
    }
    out
}

// ── Response parsing ─────────────────────────────────────────────────────

/// First repair candidate holding a non-empty `slides` or `sections` array.
fn parse_plan(raw: &str) -> Option<Vec<PlannedSlide>> {
    repair::parse_candidates(raw).iter().find_map(|candidate| {
        let array = candidate
            .get("slides")
            .or_else(|| candidate.get("sections"))?
            .as_array()?;
        let sections: Vec<PlannedSlide> = array.iter().filter_map(parse_section).collect();
        if sections.is_empty() {
            None
        } else {
            Some(sections)
        }
    })
}

/// One planned slide from the model's JSON; entries with neither title nor
/// content are dropped.
fn parse_section(value: &Value) -> Option<PlannedSlide> {
    let section: PlannedSlide = serde_json::from_value(value.clone()).ok()?;
    if section.title.trim().is_empty() && section.content.trim().is_empty() {
        debug!("Dropping empty plan entry: {value}");
        return None;
    }
    Some(section)
}

// ── Normalisation ────────────────────────────────────────────────────────

/// Reassign ids positionally and derive each slide's layout kind. Deck ids
/// become `slide_01`, `slide_02`, … regardless of what the model produced;
/// poster sections keep a model id that is already a safe `poster_*` name.
fn normalize_sections(sections: &mut [PlannedSlide], output_type: OutputType) {
    let count = sections.len();
    for (idx, section) in sections.iter_mut().enumerate() {
        match output_type {
            OutputType::Slides => {
                section.id = format!("slide_{:02}", idx + 1);
                section.kind = if idx == 0 {
                    SlideKind::Opening
                } else if idx + 1 == count && count > 1 {
                    SlideKind::Ending
                } else {
                    SlideKind::Content
                };
            }
            OutputType::Poster => {
                if !is_safe_section_id(&section.id) {
                    section.id = format!("poster_{:02}", idx + 1);
                }
                section.kind = SlideKind::Content;
            }
        }
    }
}

/// Ids become file names, so only `poster_` names in `[a-z0-9_]` survive.
fn is_safe_section_id(id: &str) -> bool {
    id.starts_with("poster_")
        && id.len() > "poster_".len()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Truncate plans that overshoot the configured page range. An undershoot
/// is only logged; inventing filler slides would dilute the content.
fn bound_page_count(sections: &mut Vec<PlannedSlide>, min_pages: usize, max_pages: usize) {
    if sections.len() > max_pages {
        warn!(
            "Plan has {} slides, truncating to the configured maximum of {max_pages}",
            sections.len()
        );
        sections.truncate(max_pages);
        if let Some(last) = sections.last_mut() {
            last.kind = SlideKind::Ending;
        }
    } else if sections.len() < min_pages {
        warn!(
            "Plan has {} slides, below the configured minimum of {min_pages}",
            sections.len()
        );
    }
}
