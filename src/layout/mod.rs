//! Slide layout model: the `layout.json` schema shared by extraction,
//! refinement, and deck reconstruction.
//!
//! Model output is untrusted, so the typed [`Layout`] is never deserialized
//! directly from a model reply. Replies go through the repair ladder in
//! [`repair`], then [`normalize_layout`] coerces the loose JSON into typed
//! elements, dropping anything unusable. Bundles on disk round-trip through
//! serde.

pub mod extract;
pub mod refine;
pub mod repair;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use extract::SlideExtractor;

/// Element subtypes treated as visual assets during extraction.
pub const IMAGE_ELEMENT_TYPES: &[&str] = &[
    "image", "figure", "diagram", "chart", "photo", "icon", "equation",
];

// ── Geometry ─────────────────────────────────────────────────────────────

/// Pixel-space bounding box, `[x0, y0, x1, y1]` on the wire.
///
/// Deserializes from floats because models emit them; coordinates are
/// rounded to integers on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[i64; 4]")]
pub struct BBox {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl BBox {
    pub fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> i64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i64 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> i64 {
        self.width().max(0) * self.height().max(0)
    }

    /// Degenerate boxes carry no croppable content.
    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    /// Clamp to the canvas, swapping inverted corners.
    pub fn clamped(&self, width: u32, height: u32) -> BBox {
        let w = i64::from(width);
        let h = i64::from(height);
        let mut x0 = self.x0.clamp(0, w);
        let mut y0 = self.y0.clamp(0, h);
        let mut x1 = self.x1.clamp(0, w);
        let mut y1 = self.y1.clamp(0, h);
        if x1 < x0 {
            std::mem::swap(&mut x0, &mut x1);
        }
        if y1 < y0 {
            std::mem::swap(&mut y0, &mut y1);
        }
        BBox { x0, y0, x1, y1 }
    }

    /// Translate by the crop origin, mapping crop-relative coordinates back
    /// to the canvas.
    pub fn offset(&self, dx: i64, dy: i64) -> BBox {
        BBox {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
        }
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        BBox {
            x0: v[0].round() as i64,
            y0: v[1].round() as i64,
            x1: v[2].round() as i64,
            y1: v[3].round() as i64,
        }
    }
}

impl From<BBox> for [i64; 4] {
    fn from(b: BBox) -> Self {
        [b.x0, b.y0, b.x1, b.y1]
    }
}

// ── Elements ─────────────────────────────────────────────────────────────

/// Horizontal text alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Center,
    Right,
    Justify,
}

impl Align {
    pub fn parse(s: &str) -> Option<Align> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Align::Left),
            "center" => Some(Align::Center),
            "right" => Some(Align::Right),
            "justify" => Some(Align::Justify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
            Align::Justify => "justify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextElement {
    pub bbox: BBox,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_rgb: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<Align>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageElement {
    pub bbox: BBox,
    /// Extraction subtype (`chart`, `photo`, ...), kept for refinement
    /// prompts and logs.
    #[serde(default = "default_image_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bundle-relative path of the cropped asset, once extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_path: Option<String>,
}

fn default_image_kind() -> String {
    "image".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableElement {
    pub bbox: BBox,
    /// Row-major cell grid; empty when the table was captured as an image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set when a cell-less table was cropped as an asset instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_path: Option<String>,
}

/// One positioned slide element.
///
/// Legacy subtype tags (`figure`, `chart`, ...) deserialize as images; the
/// normalizer writes the canonical three tags and keeps the subtype in
/// [`ImageElement::kind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    Text(TextElement),
    Table(TableElement),
    #[serde(
        alias = "figure",
        alias = "diagram",
        alias = "chart",
        alias = "photo",
        alias = "icon",
        alias = "equation"
    )]
    Image(ImageElement),
}

impl Element {
    pub fn bbox(&self) -> BBox {
        match self {
            Element::Text(e) => e.bbox,
            Element::Table(e) => e.bbox,
            Element::Image(e) => e.bbox,
        }
    }

    pub fn set_bbox(&mut self, bbox: BBox) {
        match self {
            Element::Text(e) => e.bbox = bbox,
            Element::Table(e) => e.bbox = bbox,
            Element::Image(e) => e.bbox = bbox,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Element::Text(_) => "text",
            Element::Table(_) => "table",
            Element::Image(e) => e.kind.as_str(),
        }
    }
}

// ── Layout ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

/// A reconstructed slide layout, serialized as `layout.json` in each slide
/// bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layout {
    pub version: String,
    pub canvas: Canvas,
    pub elements: Vec<Element>,
    /// Bundle-relative background image path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    /// Bundle-relative directory holding cropped assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<String>,
    /// Path of the rendered slide this layout was extracted from, relative
    /// to the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

// ── Normalization ────────────────────────────────────────────────────────

/// Pull a layout-shaped object out of whatever JSON shape the model chose.
///
/// Accepts a plain object, a one-element array wrapping the object, or a
/// bare array of bbox-carrying element objects.
pub fn coerce_layout_payload(value: Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value),
        Value::Array(items) => {
            if items.is_empty() {
                return None;
            }
            let first_is_layout = matches!(
                items.first(),
                Some(Value::Object(map)) if map.contains_key("elements") || map.contains_key("canvas")
            );
            if first_is_layout {
                return items.into_iter().next();
            }
            let all_elements = items
                .iter()
                .all(|item| matches!(item, Value::Object(map) if map.contains_key("bbox")));
            if all_elements {
                Some(serde_json::json!({ "elements": items }))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Coerce loose layout JSON into a typed [`Layout`] for the given canvas.
///
/// Rules:
/// - `title`/`heading`/`header`/`footer` become text; unknown types are
///   inferred from their fields (`text` key, `cells` key, otherwise image).
/// - Elements without a usable 4-number bbox are dropped; boxes are clamped
///   to the canvas with inverted corners swapped.
/// - Text elements require non-empty text.
/// - `color_rgb` must be three in-range integers or it is dropped.
pub fn normalize_layout(payload: &Value, width: u32, height: u32) -> Layout {
    let version = match payload.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "1".to_string(),
    };

    let mut elements = Vec::new();
    if let Some(items) = payload.get("elements").and_then(Value::as_array) {
        for item in items {
            let Value::Object(map) = item else { continue };
            if let Some(element) = normalize_element(map, width, height) {
                elements.push(element);
            }
        }
    }

    Layout {
        version,
        canvas: Canvas { width, height },
        elements,
        background: None,
        assets_dir: None,
        source_image: None,
    }
}

fn normalize_element(
    map: &serde_json::Map<String, Value>,
    width: u32,
    height: u32,
) -> Option<Element> {
    let mut raw_type = map
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if matches!(raw_type.as_str(), "title" | "heading" | "header" | "footer") {
        raw_type = "text".to_string();
    }
    if raw_type != "text" && raw_type != "table" && !IMAGE_ELEMENT_TYPES.contains(&raw_type.as_str())
    {
        raw_type = if map.contains_key("text") {
            "text".to_string()
        } else if map.contains_key("cells") {
            "table".to_string()
        } else {
            "image".to_string()
        };
    }

    let bbox = coerce_bbox(map.get("bbox")?)?.clamped(width, height);

    match raw_type.as_str() {
        "text" => {
            let text = map
                .get("text")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            Some(Element::Text(TextElement {
                bbox,
                text: text.to_string(),
                font_size: map.get("font_size").and_then(coerce_f64),
                bold: map.get("bold").and_then(Value::as_bool),
                italic: map.get("italic").and_then(Value::as_bool),
                underline: map.get("underline").and_then(Value::as_bool),
                color_rgb: map.get("color_rgb").and_then(coerce_rgb),
                align: map
                    .get("align")
                    .and_then(Value::as_str)
                    .and_then(Align::parse),
            }))
        }
        "table" => {
            let cells = map
                .get("cells")
                .and_then(Value::as_array)
                .map(|rows| rows.iter().map(stringify_row).collect::<Vec<_>>())
                .unwrap_or_default();
            let (rows, cols) = if cells.is_empty() {
                (
                    map.get("rows").and_then(coerce_usize),
                    map.get("cols").and_then(coerce_usize),
                )
            } else {
                (
                    Some(cells.len()),
                    Some(cells.iter().map(Vec::len).max().unwrap_or(0)),
                )
            };
            Some(Element::Table(TableElement {
                bbox,
                cells,
                rows,
                cols,
                description: non_empty_str(map.get("description")),
                asset_path: non_empty_str(map.get("asset_path")),
            }))
        }
        kind => Some(Element::Image(ImageElement {
            bbox,
            kind: kind.to_string(),
            description: non_empty_str(map.get("description")),
            asset_path: non_empty_str(map.get("asset_path")),
        })),
    }
}

fn stringify_row(row: &Value) -> Vec<String> {
    match row {
        Value::Array(cells) => cells.iter().map(stringify_cell).collect(),
        other => vec![stringify_cell(other)],
    }
}

fn stringify_cell(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Four numbers (ints or floats) to a rounded integer box.
pub fn coerce_bbox(value: &Value) -> Option<BBox> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut coords = [0f64; 4];
    for (slot, item) in coords.iter_mut().zip(items) {
        *slot = coerce_f64(item)?;
    }
    Some(BBox::from(coords))
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_usize(value: &Value) -> Option<usize> {
    coerce_f64(value).and_then(|v| {
        if v.is_finite() && v >= 0.0 {
            Some(v as usize)
        } else {
            None
        }
    })
}

fn coerce_rgb(value: &Value) -> Option<[u8; 3]> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    let mut rgb = [0u8; 3];
    for (slot, item) in rgb.iter_mut().zip(items) {
        let channel = item.as_i64()?;
        if !(0..=255).contains(&channel) {
            return None;
        }
        *slot = channel as u8;
    }
    Some(rgb)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
