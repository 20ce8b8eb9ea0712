//! Prompt templates for every model call the engine makes.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — tightening a rule (say, how tables must be
//!    extracted) requires editing exactly one place.
//!
//! 2. **Testability** — unit and scenario tests can match on distinctive
//!    prompt fragments to decide which scripted reply a mock client should
//!    return, without spinning up a real model.
//!
//! Templates use `{name}` placeholders filled by the builder functions below
//! with plain `str::replace`, so JSON braces inside the templates stay
//! readable.

use crate::model::RetrievalMode;

// ── Retrieval queries ────────────────────────────────────────────────────

/// Query set for one retrieval category.
pub struct QueryGroup {
    /// Category key, also the key under which answers are checkpointed.
    pub category: &'static str,
    pub queries: &'static [&'static str],
    pub mode: RetrievalMode,
}

/// Categorised query plan for academic papers.
///
/// Categories line up with the summary extraction templates below; each
/// category's answers are merged and restructured by the matching template.
pub fn paper_query_groups() -> &'static [QueryGroup] {
    &[
        QueryGroup {
            category: "motivation",
            queries: &[
                "What research problem does this paper address, and why does it matter?",
                "What are the specific limitations of existing approaches that this work targets?",
                "What gap or challenge motivates the proposed approach?",
            ],
            mode: RetrievalMode::Global,
        },
        QueryGroup {
            category: "solution",
            queries: &[
                "Describe the proposed framework or method, naming each component and its role.",
                "What are the key mathematical formulations, with notation, used by the method?",
                "Describe the complete processing pipeline step by step, including implementation details and parameters.",
            ],
            mode: RetrievalMode::Local,
        },
        QueryGroup {
            category: "results",
            queries: &[
                "Which datasets or benchmarks are used, with exact sizes, splits, and categories?",
                "What are the main experimental results, with exact metric values for all compared methods?",
                "What do the ablation studies show, with specific numbers for each variant?",
            ],
            mode: RetrievalMode::Local,
        },
        QueryGroup {
            category: "contributions",
            queries: &[
                "List all stated contributions and novelty claims of this work.",
                "What limitations are acknowledged and what future directions are suggested?",
            ],
            mode: RetrievalMode::Global,
        },
    ]
}

/// Opening queries for documents without a fixed academic structure.
///
/// Their answers seed [`general_query_gen_prompt`], which asks the model for
/// document-specific follow-up queries.
pub const GENERAL_OVERVIEW_QUERIES: &[&str] = &[
    "What is this document about? Summarize its purpose and overall structure.",
    "What are the main topics or sections covered in this document?",
];

const GENERAL_QUERY_GEN_TEMPLATE: &str = "\
Based on this document overview, write {count} retrieval queries that together \
would surface all of the document's important content: key topics, specific \
numbers and data, examples, and conclusions.

Overview:
{overview}

Return JSON only: {\"queries\": [\"...\"]}";

pub fn general_query_gen_prompt(overview: &str, count: usize) -> String {
    GENERAL_QUERY_GEN_TEMPLATE
        .replace("{count}", &count.to_string())
        .replace("{overview}", overview)
}

// ── Summary extraction ───────────────────────────────────────────────────

const EXTRACT_MOTIVATION: &str = "\
Organize the following research motivation text into a structured format.
IMPORTANT: Keep ALL information, do NOT summarize or omit any details.

Text:
{content}

Output format (use exact headers):
## RESEARCH PROBLEM
[Complete description of the main research problem with full context]

## LIMITATIONS OF EXISTING METHODS
[List ALL limitations mentioned, with full details]

## RESEARCH GAP
[Complete description of the gap being addressed]

## KEY CHALLENGES
[List all challenges mentioned with details]

## BACKGROUND CONTEXT
[Any relevant background information mentioned]";

const EXTRACT_SOLUTION: &str = "\
Organize the following methodology text into a structured format.
CRITICAL: Keep ALL technical details, ALL formulas/equations, and ALL component descriptions. Do NOT summarize.

Text:
{content}

Output format (use exact headers):
## FRAMEWORK OVERVIEW
[Complete description of the framework/approach]

## KEY COMPONENTS
[List ALL components with their FULL descriptions]

## MATHEMATICAL FORMULATIONS
[List ALL formulas exactly as they appear, each with notation explained and its purpose]

## TECHNICAL PIPELINE
[Describe the complete processing pipeline step by step]

## IMPLEMENTATION DETAILS
[Any specific parameters, settings, or implementation notes mentioned]

## KEY INNOVATIONS
[What makes this approach novel or different from prior work]";

const EXTRACT_RESULTS: &str = "\
Organize the following experimental results into a structured format.
CRITICAL: Keep ALL numbers, ALL percentages, ALL table data EXACTLY as they appear. Do NOT round or omit any values.
IMPORTANT: Use HTML table format (<table>) for ALL tables, NOT markdown format (| xxx |).

Text:
{content}

Output format (use exact headers):
## DATASET / BENCHMARK
[Complete dataset information: name, exact size, categories/splits with exact numbers]

## EVALUATION METRICS
[List all metrics used with what each measures]

## MAIN RESULTS
[Reproduce the COMPLETE performance comparison table with ALL methods and ALL metrics, as an HTML <table>]

## ABLATION STUDY
[If available, complete ablation results with ALL numbers, as an HTML <table>]

## DETAILED FINDINGS
[List ALL findings with specific numbers and percentages]";

const EXTRACT_CONTRIBUTIONS: &str = "\
Extract all contributions, novelty claims, limitations, and future directions from the text.
Keep ALL details, do NOT summarize.

Text:
{content}

Output format (use exact headers):
## MAIN CONTRIBUTIONS
[List ALL contributions with complete explanations]

## NOVELTY & INNOVATIONS
[Detailed explanation of what's new, with comparison to prior work]

## LIMITATIONS
[All acknowledged limitations]

## FUTURE DIRECTIONS
[All suggested future work]";

/// Restructuring template for one paper category, or `None` for categories
/// (and non-paper content) whose merged answers are used verbatim.
pub fn extract_template(category: &str) -> Option<&'static str> {
    match category {
        "motivation" => Some(EXTRACT_MOTIVATION),
        "solution" => Some(EXTRACT_SOLUTION),
        "results" => Some(EXTRACT_RESULTS),
        "contributions" => Some(EXTRACT_CONTRIBUTIONS),
        _ => None,
    }
}

pub fn extract_prompt(template: &str, content: &str) -> String {
    template.replace("{content}", content)
}

// ── Content planning ─────────────────────────────────────────────────────

const PLAN_OUTPUT_FIELDS: &str = "\
## Output Fields
- **id**: Identifier for the slide or section
- **title**: A concise title, such as the document title, method name, or topic name
- **content**: The main text. This is the MOST IMPORTANT field. Requirements:
  - **DETAILED DESCRIPTIONS**: If there are multiple steps or components, describe each one. Do not compress into one vague sentence.
  - **PRESERVE KEY FORMULAS**: If the source has formulas, include 1-2 relevant ones in LaTeX with variable meanings. In JSON, escape backslashes as \\\\.
  - **PRESERVE SPECIFIC NUMBERS**: Key percentages, metrics, dataset sizes, and comparison values with EXACT values.
  - **SUBSTANTIAL CONTENT**: Enough detail to fully explain the topic, at least 150-200 words (except the title slide).
  - **COPY FROM SOURCE**: Extract and adapt text from the summary. Only use information provided above. Do not invent details.
- **tables**: Tables to show here
  - table_id: e.g., \"Table 1\", \"Doc Table 1\"
  - extract: (optional) Partial table in HTML format. INCLUDE ACTUAL DATA VALUES from the original table, not placeholders
  - focus: (optional) What aspect to emphasize
- **figures**: Figures to show here
  - figure_id: e.g., \"Figure 1\", \"Doc Figure 1\"
  - focus: (optional) What to highlight
- Note: tables and figures can appear together when they complement each other.";

const PAPER_SLIDES_GUIDELINES: &str = "\
## Content Guidelines

Distribute content across {min_pages}-{max_pages} slides covering these areas:

1. **Title/Cover**: Paper title or method name, all author names, affiliations
2. **Background/Problem**: The research problem with full context, each specific limitation of existing approaches, and why those limitations matter
3. **Method/Approach** (can span multiple slides): Framework overview with component names and roles, each stage described in detail, 1-2 key formulas with variable explanations, technical details; match figures showing architecture or pipeline
4. **Results/Experiments** (can span multiple slides): Dataset details with EXACT numbers, metrics and what they measure, performance numbers with EXACT values and comparisons, ablation findings; match tables showing results
5. **Conclusion**: Each main contribution listed explicitly, key findings with specific numbers";

const GENERAL_SLIDES_GUIDELINES: &str = "\
## Content Guidelines

Distribute content across {min_pages}-{max_pages} slides. Identify the document's own structure and follow it:

1. **Title/Cover**: Document title, authors/source if available
2. **Main Content** (can span multiple slides): One topic per slide with full details, each stage/step covered, specific numbers and examples; match relevant tables/figures with their explanations
3. **Summary/Conclusion**: Key takeaways with specific numbers if applicable";

const SLIDES_PLAN_TEMPLATE: &str = "\
Organize the document into {min_pages}-{max_pages} slides by distributing the content below.

## Document Summary
{summary}
{assets_section}
{output_fields}

{guidelines}

## Output Format (JSON)
{\"slides\": [{\"id\": \"slide_01\", \"title\": \"...\", \"content\": \"...\", \"tables\": [{\"table_id\": \"Table 1\", \"extract\": \"<table>...</table>\", \"focus\": \"...\"}], \"figures\": [{\"figure_id\": \"Figure 1\", \"focus\": \"...\"}]}]}

Number slide ids sequentially: slide_01, slide_02, ...
Return JSON only.";

const POSTER_PLAN_TEMPLATE: &str = "\
Organize the document into poster sections by distributing the content below.

## Document Summary
{summary}
{assets_section}
## Content Density
{density_guidelines}

{output_fields}

## Section Guidelines

1. **Title/Header**: Title, all authors/source
2. **Background/Motivation**: Problem with context and limitations of existing approaches
3. **Main Content** (core sections): Each component or topic described in detail, key formulas with explanations, paired with figures
4. **Results/Key Data**: Exact numbers, metrics, and comparisons from tables
5. **Conclusion**: Main takeaways listed explicitly

## Output Format (JSON)
{\"sections\": [{\"id\": \"poster_title\", \"title\": \"...\", \"content\": \"...\", \"tables\": [], \"figures\": []}, {\"id\": \"poster_method\", \"title\": \"...\", \"content\": \"...\", \"tables\": [], \"figures\": [{\"figure_id\": \"Figure 1\", \"focus\": \"...\"}]}]}

Prefix section ids with poster_.
Return JSON only.";

/// Density guidance inserted into the poster planning prompt.
pub fn poster_density_guidelines(density: &str) -> &'static str {
    match density {
        "sparse" => {
            "Current density level is **sparse**. Content should be concise but still informative. \
             Keep the main problem, method name and core idea, best performance numbers, and key \
             contributions. Present tables as partial extracts showing only the most important rows \
             with ACTUAL values. Still include key formulas if they are central."
        }
        "dense" => {
            "Current density level is **dense**. Content should be comprehensive with full technical \
             details: complete context and limitations, every component with technical descriptions, \
             full experimental results including ablations, all contributions. INCLUDE key formulas \
             with notation explanations and complete tables with actual values. Copy specific numbers \
             directly from the source."
        }
        _ => {
            "Current density level is **medium**. Content should cover main points with supporting \
             details: the problem with context, how each component works, main results with \
             comparisons using EXACT numbers, and contributions. INCLUDE formulas that define the \
             method, and relevant tables with key rows and ACTUAL data values."
        }
    }
}

pub fn slides_plan_prompt(
    is_paper: bool,
    min_pages: usize,
    max_pages: usize,
    summary: &str,
    assets_section: &str,
) -> String {
    let guidelines = if is_paper {
        PAPER_SLIDES_GUIDELINES
    } else {
        GENERAL_SLIDES_GUIDELINES
    };
    SLIDES_PLAN_TEMPLATE
        .replace("{output_fields}", PLAN_OUTPUT_FIELDS)
        .replace("{guidelines}", guidelines)
        .replace("{min_pages}", &min_pages.to_string())
        .replace("{max_pages}", &max_pages.to_string())
        .replace("{summary}", summary)
        .replace("{assets_section}", assets_section)
}

pub fn poster_plan_prompt(density: &str, summary: &str, assets_section: &str) -> String {
    POSTER_PLAN_TEMPLATE
        .replace("{output_fields}", PLAN_OUTPUT_FIELDS)
        .replace("{density_guidelines}", poster_density_guidelines(density))
        .replace("{summary}", summary)
        .replace("{assets_section}", assets_section)
}

// ── Slide image generation ───────────────────────────────────────────────

pub const FORMAT_SLIDE: &str = "Wide landscape slide layout (16:9 aspect ratio).";

pub const FORMAT_POSTER: &str = "Wide landscape poster layout (16:9 aspect ratio). \
Just ONE poster. Keep information density moderate, leave whitespace for readability.";

const STYLE_HINT_ACADEMIC: &str = "\
Professional STANDARD ACADEMIC style. English text only. Use ROUNDED sans-serif fonts for ALL \
text. Use a MORANDI COLOR PALETTE (soft, muted, low-saturation colors) with LIGHT background. \
Clean simple lines. Figures and tables are CRUCIAL: REDRAW them to match the visual style so \
they BLEND seamlessly with the background and color scheme. Visualize data with CHARTS (bar, \
line, pie, radar), LARGE and meaningful. Layout should be SPACIOUS and ELEGANT. Overall feel: \
minimal, scholarly, professional.";

const STYLE_HINT_VIVID: &str = "\
Bright, friendly illustrated style with a SOPHISTICATED, REFINED color palette (NOT childish \
bright colors). English text only. Use ROUNDED sans-serif fonts for ALL text (NO decorative \
fonts). Bullet point headings should be BOLD. LIMITED COLOR PALETTE (3-4 colors max) of WARM, \
ELEGANT, MUTED tones, consistent throughout all slides. IF the slide has figures/tables: focus \
on them as the main visual content, enlarge when helpful. IF NO figures/tables: add \
illustrations or icons for each paragraph to fill the page. Tables should have PLAIN borders. \
Highlight key numbers with colors. Decorative characters must appear MEANINGFULLY, reacting to \
the content, never as random decoration.";

const COMMON_STYLE_RULES: &str = "\
IF the slide has figures/tables: focus on them as the main visual content, polish them to fit \
the style. IF NO figures/tables: add icons or illustrations for each paragraph to fill the \
page. Tables should have PLAIN borders (NO patterns/decorations). Fill the page well, avoid \
empty space.";

pub const VISUALIZATION_HINTS: &str = "\
Visualization:
- Use diagrams and icons to represent concepts
- Visualize data/numbers as charts
- Use bullet points, highlight key metrics
- Keep background CLEAN and simple";

pub const CONSISTENCY_HINT: &str =
    "IMPORTANT: Maintain consistent colors and style with the reference slide.";

pub const FIGURE_HINT: &str = "\
For reference figures: REDRAW them to match the visual style and color scheme. Preserve the \
original structure and key information, but make them BLEND seamlessly with the design.";

/// Style hint for a configured style; custom styles use the user's text plus
/// the common layout rules.
pub fn style_hint(style: &str, custom_style: Option<&str>) -> String {
    match style {
        "academic" => STYLE_HINT_ACADEMIC.to_string(),
        "vivid" => STYLE_HINT_VIVID.to_string(),
        _ => {
            let custom = custom_style.unwrap_or("Clean minimalist style").trim();
            format!("{custom}\n{COMMON_STYLE_RULES}")
        }
    }
}

/// Where a slide sits in the deck, for layout rule selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidePosition {
    Opening,
    Content,
    Ending,
}

/// Per-position layout rules appended to slide prompts.
pub fn slide_layout_rules(position: SlidePosition) -> &'static str {
    match position {
        SlidePosition::Opening => {
            "Opening Slide Layout:\n\
             - Title: Large font at TOP CENTER\n\
             - Authors/Affiliations: Small font at BOTTOM\n\
             - Main Visual: ONE element in CENTER\n\
             - Background: LIGHT color matching the style theme"
        }
        SlidePosition::Content => {
            "Content Slide Layout:\n\
             - Title: At TOP LEFT of slide\n\
             - Content: Moderate font size, well-organized, good spacing\n\
             - IF figures/tables present: feature them LARGE as main visual content\n\
             - IF NO figures/tables: add icons or illustrations for each paragraph\n\
             - Background: SAME treatment as the previous slide"
        }
        SlidePosition::Ending => {
            "Ending Slide Layout:\n\
             - Title/Heading: At TOP CENTER of slide\n\
             - Main Content: Key takeaways in CENTER\n\
             - Background: SAME treatment as the previous slide"
        }
    }
}

// ── Layout extraction ────────────────────────────────────────────────────

const LAYOUT_TEMPLATE: &str = "\
You are given a slide image. Extract a structured layout for slide reconstruction.
Canvas: {width}x{height} pixels.
{strict_line}
Schema:
{
  \"version\": \"1\",
  \"canvas\": {\"width\": int, \"height\": int},
  \"elements\": [
    {
      \"type\": \"text\",
      \"bbox\": [x0, y0, x1, y1],
      \"text\": \"...\",
      \"font_size\": number (points),
      \"bold\": bool,
      \"italic\": bool,
      \"underline\": bool,
      \"color_rgb\": [r, g, b],
      \"align\": \"left|center|right|justify\"
    },
    {
      \"type\": \"image\",
      \"bbox\": [x0, y0, x1, y1],
      \"description\": \"short description of the visual\"
    },
    {
      \"type\": \"table\",
      \"bbox\": [x0, y0, x1, y1],
      \"rows\": int,
      \"cols\": int,
      \"cells\": [[\"...\"]]
    }
  ]
}
Rules:
- Use integer pixel coordinates.
- Include only visible content elements (no background).
- Keep elements in reading order.
- If a field is unknown, omit it.";

/// Layout extraction prompt; `strict` hardens the JSON-only instruction for
/// the retry after an unparseable reply.
pub fn layout_prompt(width: u32, height: u32, strict: bool) -> String {
    let strict_line = if strict {
        "Return JSON only. No extra text."
    } else {
        "Return JSON only."
    };
    LAYOUT_TEMPLATE
        .replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
        .replace("{strict_line}", strict_line)
}

const TEXT_REFINE_TEMPLATE: &str = "\
You are given a slide image and a list of detected text boxes. Refine the text \
layout to avoid overlaps and match the visual lines. Adjust bboxes and insert \
explicit line breaks (\\n) where needed.
Keep the same text content, only add/remove line breaks for layout. Do NOT \
invent new text. Keep ids unchanged.
Return JSON only: {\"texts\":[{\"id\":int,\"bbox\":[x0,y0,x1,y1],\"text\":\"...\",\"font_size\":number?,\"align\":\"left|center|right|justify\"?}]}
Current text items:
{items}";

pub fn text_refine_prompt(items_json: &str) -> String {
    TEXT_REFINE_TEMPLATE.replace("{items}", items_json)
}

pub fn refine_bbox_prompt(
    width: u32,
    height: u32,
    element_type: &str,
    description: Option<&str>,
) -> String {
    let description_line = description
        .map(|d| format!("Description: {d}\n"))
        .unwrap_or_default();
    format!(
        "You are given a coarse crop of a slide element. Return the tightest bounding box \
         around the main visual content inside this crop. Include labels that are part of the \
         visual (axes, legends). Exclude surrounding whitespace or unrelated slide text.\n\
         Crop size: {width}x{height} pixels.\n\
         Element type: {element_type}.\n\
         {description_line}\
         Return JSON only: {{\"bbox\": [x0, y0, x1, y1]}} with integer pixel values, \
         coordinates relative to the crop (0,0 is top-left). \
         If the crop is already tight, return the full crop bbox."
    )
}

pub fn clean_asset_prompt(element_type: &str, description: Option<&str>) -> String {
    let description_line = description
        .map(|d| format!("Description: {d}\n"))
        .unwrap_or_default();
    format!(
        "Clean up this extracted visual asset. Remove slide background and any surrounding \
         whitespace. Keep only the visual element and any labels that belong to it. Do NOT add \
         or hallucinate new content. Preserve colors and shapes. Output on a solid white \
         background with no transparency.\n\
         Element type: {element_type}.\n\
         {description_line}"
    )
}

pub const BACKGROUND_PROMPT: &str = "\
Create a clean background-only version of the slide. Remove all text, charts, photos, icons, \
and figures. Preserve only the background colors, gradients, shapes, and layout. Match the \
original canvas size and aspect ratio exactly.";
