//! Editable presentation assembly.
//!
//! [`DeckBuilder`] accumulates slides of positioned shapes in pixel space
//! and converts them to physical units on the way in; [`pptx`] serialises
//! the result as an OOXML package. Sizing rules follow the presentation
//! format's hard limits: canvases larger than 56 inches on either axis are
//! scaled down proportionally, never cropped, and dimensions floor at one
//! inch.

pub mod font;
pub mod pptx;

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::layout::{Align, BBox};

pub const DEFAULT_SLIDE_WIDTH_IN: f64 = 10.0;
pub const DEFAULT_SLIDE_HEIGHT_IN: f64 = 5.625;
pub const DEFAULT_DPI: f64 = 96.0;

/// Hard per-axis ceiling of the presentation format, in inches.
pub const MAX_SLIDE_DIMENSION_IN: f64 = 56.0;

/// Floor that keeps degenerate canvases representable.
pub const MIN_SLIDE_DIMENSION_IN: f64 = 1.0;

pub const DEFAULT_FONT_NAME: &str = "Calibri";

/// Fill of the missing-image placeholder.
const PLACEHOLDER_FILL: [u8; 3] = [248, 250, 252];
/// Border of the missing-image placeholder.
const PLACEHOLDER_LINE: [u8; 3] = [203, 213, 225];

// ── Shape model ──────────────────────────────────────────────────────────

/// Physical-unit rectangle on a slide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Rect {
    pub x_in: f64,
    pub y_in: f64,
    pub w_in: f64,
    pub h_in: f64,
}

impl Rect {
    /// Corner offset and extent in EMU.
    pub fn emu(&self) -> (i64, i64, i64, i64) {
        (
            to_emu(self.x_in),
            to_emu(self.y_in),
            to_emu(self.w_in).max(1),
            to_emu(self.h_in).max(1),
        )
    }
}

pub(crate) fn to_emu(inches: f64) -> i64 {
    (inches * pptx::EMU_PER_INCH as f64).round() as i64
}

#[derive(Debug, Clone)]
pub(crate) struct TextShape {
    pub rect: Rect,
    /// Explicit paragraphs, one per rendered line break.
    pub lines: Vec<String>,
    pub font_size_pt: f64,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub color_rgb: Option<[u8; 3]>,
    pub align: Align,
}

#[derive(Debug, Clone)]
pub(crate) struct TableShape {
    pub rect: Rect,
    /// Rectangular grid; ragged source rows are padded with empty cells.
    pub grid: Vec<Vec<String>>,
    pub font_size_pt: f64,
}

#[derive(Debug, Clone)]
pub(crate) enum Shape {
    Picture {
        bytes: Vec<u8>,
        /// `png` or `jpeg`, for the package content types.
        format: &'static str,
        rect: Rect,
    },
    Text(TextShape),
    /// Visible stand-in for an unreadable image.
    Placeholder { rect: Rect, label: String },
    Table(TableShape),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SlideShapes {
    pub shapes: Vec<Shape>,
}

// ── Text styling ─────────────────────────────────────────────────────────

/// Styling carried into [`DeckBuilder::add_text`].
#[derive(Debug, Clone, Default)]
pub struct TextStyle {
    /// Explicit size in points; `None` runs the fitting search.
    pub font_size: Option<f64>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub color_rgb: Option<[u8; 3]>,
    pub align: Option<Align>,
    /// Heading text is always bold.
    pub title: bool,
}

/// Table content accepted by [`DeckBuilder::add_table`].
pub enum TableSource<'a> {
    Html(&'a str),
    Cells(&'a [Vec<String>]),
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Accumulates slides of positioned shapes and writes the deck package.
///
/// All `add_*` element methods take bboxes in source pixel space; the
/// configured DPI converts them to inches at insertion time.
pub struct DeckBuilder {
    slide_width_in: f64,
    slide_height_in: f64,
    dpi: f64,
    slides: Vec<SlideShapes>,
}

impl Default for DeckBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeckBuilder {
    pub fn new() -> Self {
        Self {
            slide_width_in: DEFAULT_SLIDE_WIDTH_IN,
            slide_height_in: DEFAULT_SLIDE_HEIGHT_IN,
            dpi: DEFAULT_DPI,
            slides: Vec::new(),
        }
    }

    pub fn slide_size_in(&self) -> (f64, f64) {
        (self.slide_width_in, self.slide_height_in)
    }

    /// Size slides to a pixel canvas at the builder's DPI.
    ///
    /// A canvas exceeding the 56-inch per-axis ceiling is scaled down
    /// proportionally on both axes (the aspect ratio is never altered) and
    /// the result floors at one inch.
    pub fn set_canvas_px(&mut self, width_px: u32, height_px: u32) {
        let mut width_in = width_px as f64 / self.dpi;
        let mut height_in = height_px as f64 / self.dpi;

        let mut scale = 1.0f64;
        if width_in > MAX_SLIDE_DIMENSION_IN {
            scale = MAX_SLIDE_DIMENSION_IN / width_in;
            warn!(
                "Slide width {width_in:.2}\" exceeds the {MAX_SLIDE_DIMENSION_IN:.0}\" limit, scaling by {scale:.3}x"
            );
        }
        if height_in > MAX_SLIDE_DIMENSION_IN {
            let height_scale = MAX_SLIDE_DIMENSION_IN / height_in;
            if height_scale < scale {
                scale = height_scale;
                warn!(
                    "Slide height {height_in:.2}\" exceeds the {MAX_SLIDE_DIMENSION_IN:.0}\" limit, scaling by {scale:.3}x"
                );
            }
        }
        if scale < 1.0 {
            width_in *= scale;
            height_in *= scale;
            info!(
                "Slide dimensions after scaling: {width_in:.2}\" x {height_in:.2}\" (from {width_px}x{height_px}px @ {:.0} DPI)",
                self.dpi
            );
        }

        self.slide_width_in = width_in.max(MIN_SLIDE_DIMENSION_IN);
        self.slide_height_in = height_in.max(MIN_SLIDE_DIMENSION_IN);
    }

    pub fn set_dpi(&mut self, dpi: f64) {
        if dpi > 0.0 {
            self.dpi = dpi;
        }
    }

    /// Start a new blank slide; subsequent `add_*` calls target it.
    pub fn add_blank_slide(&mut self) {
        self.slides.push(SlideShapes::default());
    }

    pub fn slide_count(&self) -> usize {
        self.slides.len()
    }

    fn current(&mut self) -> &mut SlideShapes {
        if self.slides.is_empty() {
            self.slides.push(SlideShapes::default());
        }
        let last = self.slides.len() - 1;
        &mut self.slides[last]
    }

    fn px_to_in(&self, px: f64) -> f64 {
        px / self.dpi
    }

    fn rect_from(&self, bbox: BBox) -> Rect {
        Rect {
            x_in: self.px_to_in(bbox.x0 as f64),
            y_in: self.px_to_in(bbox.y0 as f64),
            w_in: self.px_to_in(bbox.width() as f64),
            h_in: self.px_to_in(bbox.height() as f64),
        }
    }

    /// Add a text box at `bbox`.
    ///
    /// The box is expanded by 1% around its centre so glyph overhang never
    /// clips against the frame. Without an explicit size the fitting search
    /// picks the largest size that avoids overflow.
    pub fn add_text(&mut self, text: &str, bbox: BBox, style: &TextStyle) {
        let width_px = bbox.width() as f64;
        let height_px = bbox.height() as f64;
        let expand_w = width_px * 0.01;
        let expand_h = height_px * 0.01;
        let rect = Rect {
            x_in: self.px_to_in(bbox.x0 as f64 - expand_w / 2.0),
            y_in: self.px_to_in(bbox.y0 as f64 - expand_h / 2.0),
            w_in: self.px_to_in(width_px + expand_w),
            h_in: self.px_to_in(height_px + expand_h),
        };

        let text = promote_bullet(text);
        let font_size_pt = match style.font_size {
            Some(size) => size.clamp(font::MIN_FONT_SIZE, font::MAX_FONT_SIZE),
            None => {
                let width_pt = width_px / self.dpi * 72.0;
                let height_pt = height_px / self.dpi * 72.0;
                let fit = font::fit_font_size(&text, width_pt, height_pt);
                if !fit.fits && text.len() > 3 {
                    warn!(
                        "Text may overflow: '{}' in {width_px:.0}x{height_px:.0}px box",
                        truncated(&text, 50)
                    );
                }
                fit.size
            }
        };
        debug!(
            "Text '{}' box {width_px:.0}x{height_px:.0}px font {font_size_pt:.1}pt",
            truncated(&text, 35)
        );

        self.current().shapes.push(Shape::Text(TextShape {
            rect,
            lines: text.split('\n').map(str::to_string).collect(),
            font_size_pt,
            bold: style.bold || style.title,
            italic: style.italic,
            underline: style.underline,
            color_rgb: style.color_rgb,
            align: style.align.unwrap_or(Align::Left),
        }));
    }

    /// Add an image at `bbox`, stretched to fill it. An unreadable file
    /// degrades to a visible placeholder, never a build failure.
    pub fn add_image(&mut self, path: &Path, bbox: BBox) {
        let rect = self.rect_from(bbox);
        self.push_image_file(path, rect);
    }

    /// Add an image covering the whole slide (full-bleed backgrounds).
    pub fn add_full_slide_image(&mut self, path: &Path) {
        let rect = Rect {
            x_in: 0.0,
            y_in: 0.0,
            w_in: self.slide_width_in,
            h_in: self.slide_height_in,
        };
        self.push_image_file(path, rect);
    }

    fn push_image_file(&mut self, path: &Path, rect: Rect) {
        match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => {
                let format = match path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                    .as_deref()
                {
                    Some("jpg") | Some("jpeg") => "jpeg",
                    _ => "png",
                };
                self.current().shapes.push(Shape::Picture {
                    bytes,
                    format,
                    rect,
                });
            }
            Ok(_) => {
                warn!("Image is empty: {}, adding placeholder", path.display());
                self.add_placeholder(rect);
            }
            Err(e) => {
                warn!(
                    "Image not found: {} ({e}), adding placeholder",
                    path.display()
                );
                self.add_placeholder(rect);
            }
        }
    }

    /// Add an already-loaded image (rendered page backgrounds).
    pub fn add_image_bytes(&mut self, bytes: Vec<u8>, format: &'static str, bbox: BBox) {
        let rect = self.rect_from(bbox);
        self.current().shapes.push(Shape::Picture {
            bytes,
            format,
            rect,
        });
    }

    /// Add the missing-image placeholder explicitly (referenced file known
    /// absent before insertion).
    pub fn add_image_placeholder(&mut self, bbox: BBox) {
        let rect = self.rect_from(bbox);
        self.add_placeholder(rect);
    }

    fn add_placeholder(&mut self, rect: Rect) {
        self.current().shapes.push(Shape::Placeholder {
            rect,
            label: "Image not found".to_string(),
        });
    }

    /// Add a table at `bbox`.
    ///
    /// The column count follows the first row; longer rows are truncated
    /// and shorter rows padded with empty cells. Cell font size derives
    /// from the row height, clamped to `[8, 18]`pt. Empty tables are
    /// dropped with a warning.
    pub fn add_table(&mut self, source: TableSource<'_>, bbox: BBox) {
        let data = match source {
            TableSource::Html(html) => parse_html_table(html),
            TableSource::Cells(cells) => cells.to_vec(),
        };
        if data.is_empty() || data[0].is_empty() {
            warn!("Empty table data, skipping table");
            return;
        }

        let rows = data.len();
        let cols = data[0].len();
        let grid: Vec<Vec<String>> = data
            .into_iter()
            .map(|mut row| {
                row.truncate(cols);
                row.resize(cols, String::new());
                row
            })
            .collect();

        let cell_height_px = bbox.height() as f64 / rows as f64;
        let font_size_pt = (cell_height_px * 0.3).clamp(8.0, 18.0);

        let rect = self.rect_from(bbox);
        self.current().shapes.push(Shape::Table(TableShape {
            rect,
            grid,
            font_size_pt,
        }));
    }

    /// Serialise the deck to `path`.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::OutputWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        pptx::write_package(self.slide_width_in, self.slide_height_in, &self.slides, path)?;
        info!("Saved presentation to: {}", path.display());
        Ok(())
    }
}

// ── Text helpers ─────────────────────────────────────────────────────────

/// Promote a leading interpunct to a proper bullet.
fn promote_bullet(text: &str) -> String {
    if text.trim_start().starts_with('·') {
        text.replacen('·', "•", 1)
    } else {
        text.to_string()
    }
}

fn truncated(text: &str, max: usize) -> &str {
    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── HTML tables ──────────────────────────────────────────────────────────

/// Extract cell text from an HTML `<table>` fragment.
///
/// Tag-level scan, no entity or attribute handling beyond skipping them:
/// parser output tables are flat `<tr>/<td>/<th>` grids. Rows with no
/// cells are dropped.
pub fn parse_html_table(html: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut current_cell = String::new();
    let mut in_row = false;
    let mut in_cell = false;

    let mut rest = html;
    while let Some(open) = rest.find('<') {
        let text = &rest[..open];
        if in_cell {
            current_cell.push_str(text);
        }
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag_body = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let closing = tag_body.starts_with('/');
        let name: String = tag_body
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match (name.as_str(), closing) {
            ("tr", false) => {
                in_row = true;
                current_row = Vec::new();
            }
            ("tr", true) => {
                in_row = false;
                if !current_row.is_empty() {
                    rows.push(std::mem::take(&mut current_row));
                }
            }
            ("td", false) | ("th", false) => {
                in_cell = true;
                current_cell = String::new();
            }
            ("td", true) | ("th", true) => {
                if in_cell && in_row {
                    current_row.push(decode_entities(current_cell.trim()));
                }
                in_cell = false;
            }
            _ => {}
        }
    }
    rows
}

/// The handful of entities parser tables actually contain.
fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
