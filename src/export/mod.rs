//! Deck export: turning generated or parsed material into presentation files.
//!
//! Three entry points cover the two input families:
//!
//! * [`deck_from_images`] — plain deck, one full-bleed picture per slide.
//! * [`deck_from_bundles`] — editable deck from per-slide asset bundles
//!   (`layout.json` + background + cropped assets).
//! * [`deck_from_doc_layout`] — editable deck from an externally parsed
//!   document layout, with element coordinates rescaled from the parser's
//!   page space to the deck target and page backgrounds rendered from the
//!   source PDF (or a still image found alongside the parse).
//!
//! Every degraded input inside a deck (missing bundle, unreadable layout,
//! absent asset) is logged and skipped or placeholdered; only a deck with no
//! usable slides at all is an error.

pub mod doc_layout;
pub(crate) mod pages;
pub(crate) mod pdf;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::deck::{DeckBuilder, TableSource, TextStyle};
use crate::error::EngineError;
use crate::layout::{BBox, Element, Layout};

pub use doc_layout::{find_parsed_layout_dir, DocElement};
pub(crate) use pdf::save_images_as_pdf;

/// Layout file name inside each slide bundle.
const BUNDLE_LAYOUT_FILE: &str = "layout.json";

/// Extensions probed for a still background alongside a parsed layout.
const STILL_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp"];

// ── Plain deck ───────────────────────────────────────────────────────────

/// Write a plain deck with one full-bleed image per slide.
///
/// Missing images are skipped with a warning; the deck fails only when no
/// image survives. Slides use the default 16:9 size.
pub fn deck_from_images(images: &[PathBuf], output: &Path) -> Result<(), EngineError> {
    let mut deck = DeckBuilder::new();
    let mut added = 0usize;
    for image in images {
        if !image.is_file() {
            warn!("Slide image not found, skipping: {}", image.display());
            continue;
        }
        deck.add_blank_slide();
        deck.add_full_slide_image(image);
        added += 1;
    }
    if added == 0 {
        return Err(EngineError::DeckBuild("no slide images to export".into()));
    }
    deck.save(output)?;
    info!("Exported {added} slides to {}", output.display());
    Ok(())
}

// ── Bundle deck ──────────────────────────────────────────────────────────

/// Write an editable deck from per-slide asset bundles.
///
/// Each directory must hold a `layout.json`; directories with a missing or
/// unreadable layout, or a degenerate canvas, are skipped. The first valid
/// canvas fixes the presentation size, and later slides whose canvas differs
/// have their element boxes rescaled to it. With `include_background`, the
/// layout's background image (or its source slide image) is placed
/// full-bleed beneath the elements.
pub fn deck_from_bundles(
    slide_dirs: &[PathBuf],
    output: &Path,
    include_background: bool,
) -> Result<(), EngineError> {
    let mut deck = DeckBuilder::new();
    let mut first_canvas: Option<(f64, f64)> = None;
    let mut added = 0usize;

    for dir in slide_dirs {
        let layout_path = dir.join(BUNDLE_LAYOUT_FILE);
        let layout: Layout = match checkpoint::read_json(&layout_path) {
            Ok(Some(layout)) => layout,
            Ok(None) => {
                warn!("No layout in bundle {}, skipping slide", dir.display());
                continue;
            }
            Err(e) => {
                warn!("Unreadable layout in bundle {}: {e}, skipping slide", dir.display());
                continue;
            }
        };
        let (width, height) = (layout.canvas.width, layout.canvas.height);
        if width == 0 || height == 0 {
            warn!("Degenerate canvas {width}x{height} in {}, skipping slide", dir.display());
            continue;
        }

        let (sx, sy) = match first_canvas {
            None => {
                deck.set_canvas_px(width, height);
                first_canvas = Some((f64::from(width), f64::from(height)));
                (1.0, 1.0)
            }
            Some((fw, fh)) => (fw / f64::from(width), fh / f64::from(height)),
        };

        deck.add_blank_slide();
        added += 1;

        if include_background {
            if let Some(bg) = bundle_background(dir, &layout) {
                deck.add_full_slide_image(&bg);
            }
        }

        for (idx, element) in layout.elements.iter().enumerate() {
            let bbox = scale_bbox(element.bbox(), sx, sy);
            match element {
                Element::Text(text) => {
                    if text.text.trim().is_empty() {
                        continue;
                    }
                    let style = TextStyle {
                        font_size: text.font_size,
                        bold: text.bold.unwrap_or(false),
                        italic: text.italic.unwrap_or(false),
                        underline: text.underline.unwrap_or(false),
                        color_rgb: text.color_rgb,
                        align: text.align,
                        title: false,
                    };
                    deck.add_text(&text.text, bbox, &style);
                }
                Element::Table(table) if !table.cells.is_empty() => {
                    deck.add_table(TableSource::Cells(&table.cells), bbox);
                }
                Element::Table(table) => {
                    place_bundle_asset(&mut deck, dir, table.asset_path.as_deref(), idx, bbox);
                }
                Element::Image(image) => {
                    place_bundle_asset(&mut deck, dir, image.asset_path.as_deref(), idx, bbox);
                }
            }
        }
    }

    if added == 0 {
        return Err(EngineError::DeckBuild("no valid slide bundles".into()));
    }
    deck.save(output)?;
    info!("Exported {added} bundle slides to {}", output.display());
    Ok(())
}

/// Resolve a bundle's background image. A layout without a recorded
/// background falls back to the rendered slide it was extracted from; a
/// recorded path whose file is gone yields no background at all.
fn bundle_background(dir: &Path, layout: &Layout) -> Option<PathBuf> {
    let rel = layout
        .background
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| layout.source_image.as_deref().filter(|s| !s.is_empty()))?;
    let candidate = dir.join(rel);
    candidate.is_file().then_some(candidate)
}

/// Place a bundle asset, trying the recorded path first and the positional
/// `assets/asset-NNN.png` crop (1-based element index) second.
fn place_bundle_asset(
    deck: &mut DeckBuilder,
    dir: &Path,
    asset_path: Option<&str>,
    element_idx: usize,
    bbox: BBox,
) {
    if let Some(rel) = asset_path {
        // A recorded path that fails to read becomes a visible placeholder.
        deck.add_image(&dir.join(rel), bbox);
        return;
    }
    let candidate = dir.join("assets").join(format!("asset-{:03}.png", element_idx + 1));
    if candidate.is_file() {
        deck.add_image(&candidate, bbox);
    } else {
        debug!("No asset for element {} in {}, skipping", element_idx + 1, dir.display());
    }
}

fn scale_bbox(bbox: BBox, sx: f64, sy: f64) -> BBox {
    if sx == 1.0 && sy == 1.0 {
        return bbox;
    }
    BBox::from([
        bbox.x0 as f64 * sx,
        bbox.y0 as f64 * sy,
        bbox.x1 as f64 * sx,
        bbox.y1 as f64 * sy,
    ])
}

// ── Parsed-document deck ─────────────────────────────────────────────────

/// Write an editable deck from an externally parsed document layout.
///
/// `parsed_dir` must contain a `*_content_list.json`. Actual page dimensions
/// come from `layout.json` page-size metadata when present, else from the
/// furthest bbox extent; element boxes are scaled by `target/actual` per
/// axis. When dimensions had to be inferred and `target` is still the
/// default 1920x1080, the target snaps to the inferred size so elements stay
/// at native scale. Backgrounds: the source PDF (found by document stem near
/// the parse) rendered page-by-page at target size, else a single still
/// image backing the first page.
pub async fn deck_from_doc_layout(
    parsed_dir: &Path,
    output: &Path,
    target: (u32, u32),
) -> Result<(), EngineError> {
    let content_list = doc_layout::find_content_list(parsed_dir).ok_or_else(|| {
        EngineError::DeckBuild(format!("no content list in {}", parsed_dir.display()))
    })?;
    let elements = doc_layout::parse_content_list(&content_list)?;
    let stem = doc_layout::base_stem(&content_list);

    let recorded = doc_layout::read_page_size(&parsed_dir.join("layout.json"));
    let inferred = recorded.is_none();
    let actual = recorded
        .or_else(|| doc_layout::infer_page_dimensions(&elements))
        .ok_or_else(|| {
            EngineError::DeckBuild(format!(
                "cannot determine page dimensions for {}",
                content_list.display()
            ))
        })?;

    let mut target = target;
    if inferred && target == (1920, 1080) {
        target = (actual.0.round() as u32, actual.1.round() as u32);
        debug!("Using inferred page size {}x{} as deck target", target.0, target.1);
    }
    let sx = f64::from(target.0) / actual.0;
    let sy = f64::from(target.1) / actual.1;

    // Page backgrounds live in a temp dir for the duration of the build.
    let bg_dir = tempfile::Builder::new()
        .prefix("slideforge-bg-")
        .tempdir()
        .map_err(|source| EngineError::OutputWrite {
            path: std::env::temp_dir(),
            source,
        })?;
    let backgrounds = resolve_backgrounds(parsed_dir, &stem, target, bg_dir.path()).await?;

    let mut deck = DeckBuilder::new();
    deck.set_canvas_px(target.0, target.1);

    let mut pages: BTreeMap<usize, Vec<&DocElement>> = BTreeMap::new();
    for element in &elements {
        pages.entry(element.page_idx).or_default().push(element);
    }
    if pages.is_empty() {
        return Err(EngineError::DeckBuild(format!(
            "content list {} holds no elements",
            content_list.display()
        )));
    }

    for (page_idx, items) in &pages {
        deck.add_blank_slide();
        match backgrounds.get(*page_idx) {
            Some(bg) => deck.add_full_slide_image(bg),
            None => warn!("No background for page {}", page_idx + 1),
        }

        // Pictures and tables go in before text so text is never occluded.
        let mut visual = Vec::new();
        let mut textual = Vec::new();
        for element in items {
            match element.kind.as_str() {
                "image" | "table" | "equation" => visual.push(*element),
                "text" | "title" | "header" | "footer" => textual.push(*element),
                other => debug!("Unhandled element kind '{other}', skipping"),
            }
        }
        for element in visual.into_iter().chain(textual) {
            place_doc_element(&mut deck, parsed_dir, element, sx, sy);
        }
    }

    deck.save(output)?;
    info!(
        "Exported {} parsed pages to {}",
        deck.slide_count(),
        output.display()
    );
    Ok(())
}

/// Backgrounds for a parsed layout: rendered source-PDF pages when the PDF
/// is found and pdfium is available, else a single still image.
async fn resolve_backgrounds(
    parsed_dir: &Path,
    stem: &str,
    target: (u32, u32),
    bg_dir: &Path,
) -> Result<Vec<PathBuf>, EngineError> {
    if let Some(pdf) = doc_layout::find_source_file(parsed_dir, stem, &[".pdf"]) {
        let rendered = pages::render_pdf_backgrounds(&pdf, target, bg_dir).await?;
        if !rendered.is_empty() {
            return Ok(rendered);
        }
    }
    if let Some(still) = doc_layout::find_source_file(parsed_dir, stem, STILL_EXTENSIONS) {
        debug!("Using still image background {}", still.display());
        return Ok(vec![still]);
    }
    Ok(Vec::new())
}

fn place_doc_element(
    deck: &mut DeckBuilder,
    parsed_dir: &Path,
    element: &DocElement,
    sx: f64,
    sy: f64,
) {
    let Some([x0, y0, x1, y1]) = element.bbox4() else {
        debug!("Element without bbox ({}), skipping", element.kind);
        return;
    };
    let bbox = BBox::from([x0 * sx, y0 * sy, x1 * sx, y1 * sy]);

    if element.is_imagelike() {
        place_doc_image(deck, parsed_dir, element, bbox);
        return;
    }
    if element.kind == "table" {
        if let Some(html) = element.table_html() {
            deck.add_table(TableSource::Html(html), bbox);
        } else {
            place_doc_image(deck, parsed_dir, element, bbox);
        }
        return;
    }

    let Some(text) = element.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        return;
    };
    let style = TextStyle {
        title: element.kind == "title" || element.text_level == Some(1),
        ..TextStyle::default()
    };
    deck.add_text(text, bbox, &style);
}

fn place_doc_image(deck: &mut DeckBuilder, parsed_dir: &Path, element: &DocElement, bbox: BBox) {
    let Some(raw) = element.image_path() else {
        warn!("{} element without image path, skipping", element.kind);
        return;
    };
    match doc_layout::resolve_image_path(parsed_dir, raw) {
        Some(path) => deck.add_image(&path, bbox),
        None => {
            warn!("Image {raw} not found near {}, using placeholder", parsed_dir.display());
            deck.add_image_placeholder(bbox);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Canvas, ImageElement, TextElement};
    use image::{Rgb, RgbImage};
    use std::io::Read;
    use tempfile::TempDir;

    fn write_png(path: &Path, w: u32, h: u32) {
        RgbImage::from_pixel(w, h, Rgb([120, 140, 160])).save(path).unwrap();
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn zip_part(path: &Path, name: &str) -> String {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut part = archive.by_name(name).unwrap();
        let mut text = String::new();
        part.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn plain_deck_skips_missing_images() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_png(&a, 32, 18);
        write_png(&b, 32, 18);
        let missing = dir.path().join("gone.png");
        let out = dir.path().join("slides.pptx");

        deck_from_images(&[a, missing, b], &out).unwrap();

        let names = zip_names(&out);
        assert!(names.contains(&"ppt/slides/slide2.xml".to_string()));
        assert!(!names.contains(&"ppt/slides/slide3.xml".to_string()));
    }

    #[test]
    fn plain_deck_with_no_valid_images_fails() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("slides.pptx");
        let err = deck_from_images(&[dir.path().join("x.png")], &out).unwrap_err();
        assert!(matches!(err, EngineError::DeckBuild(_)));
    }

    fn write_bundle(dir: &Path, layout: &Layout) {
        std::fs::create_dir_all(dir).unwrap();
        let text = serde_json::to_string_pretty(layout).unwrap();
        std::fs::write(dir.join(BUNDLE_LAYOUT_FILE), text).unwrap();
    }

    fn text_layout(canvas: (u32, u32), bbox: BBox, text: &str) -> Layout {
        Layout {
            version: "1".into(),
            canvas: Canvas {
                width: canvas.0,
                height: canvas.1,
            },
            elements: vec![Element::Text(TextElement {
                bbox,
                text: text.into(),
                font_size: Some(20.0),
                bold: None,
                italic: None,
                underline: None,
                color_rgb: None,
                align: None,
            })],
            background: None,
            assets_dir: None,
            source_image: None,
        }
    }

    #[test]
    fn bundle_deck_scales_later_canvases_to_the_first() {
        let root = TempDir::new().unwrap();
        let first = root.path().join("slide_01");
        let second = root.path().join("slide_02");
        // Same box in a canvas twice the size must land at the same EMU.
        write_bundle(&first, &text_layout((960, 540), BBox::new(96, 96, 480, 192), "one"));
        write_bundle(&second, &text_layout((1920, 1080), BBox::new(192, 192, 960, 384), "two"));
        let out = root.path().join("deck.pptx");

        deck_from_bundles(&[first, second], &out, false).unwrap();

        let s1 = zip_part(&out, "ppt/slides/slide1.xml");
        let s2 = zip_part(&out, "ppt/slides/slide2.xml");
        // Skip the group-shape offset; the second <a:off> is the text box.
        let off1 = s1.split("<a:off ").nth(2).unwrap()[..40].to_string();
        let off2 = s2.split("<a:off ").nth(2).unwrap()[..40].to_string();
        assert_eq!(off1, off2);
        assert!(!off1.starts_with(r#"x="0""#), "{off1}");
    }

    #[test]
    fn bundle_deck_places_background_and_positional_asset() {
        let root = TempDir::new().unwrap();
        let bundle = root.path().join("slide_01");
        std::fs::create_dir_all(bundle.join("assets")).unwrap();
        write_png(&bundle.join("background.png"), 32, 18);
        // Element index 2 (1-based) with no recorded asset_path.
        write_png(&bundle.join("assets/asset-002.png"), 8, 8);

        let layout = Layout {
            version: "1".into(),
            canvas: Canvas {
                width: 640,
                height: 360,
            },
            elements: vec![
                Element::Text(TextElement {
                    bbox: BBox::new(10, 10, 300, 60),
                    text: "Header".into(),
                    font_size: None,
                    bold: Some(true),
                    italic: None,
                    underline: None,
                    color_rgb: None,
                    align: None,
                }),
                Element::Image(ImageElement {
                    bbox: BBox::new(10, 80, 200, 200),
                    kind: "chart".into(),
                    description: None,
                    asset_path: None,
                }),
            ],
            background: Some("background.png".into()),
            assets_dir: Some("assets".into()),
            source_image: None,
        };
        write_bundle(&bundle, &layout);
        let out = root.path().join("deck.pptx");

        deck_from_bundles(&[bundle], &out, true).unwrap();

        let names = zip_names(&out);
        // Background plus the positional asset crop.
        assert!(names.contains(&"ppt/media/image1.png".to_string()));
        assert!(names.contains(&"ppt/media/image2.png".to_string()));
    }

    #[test]
    fn bundle_deck_skips_broken_bundles_but_fails_when_all_are() {
        let root = TempDir::new().unwrap();
        let no_layout = root.path().join("empty");
        std::fs::create_dir_all(&no_layout).unwrap();
        let bad = root.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(BUNDLE_LAYOUT_FILE), "{not json").unwrap();
        let out = root.path().join("deck.pptx");

        let err =
            deck_from_bundles(&[no_layout.clone(), bad.clone()], &out, true).unwrap_err();
        assert!(matches!(err, EngineError::DeckBuild(_)));

        // One good bundle rescues the deck.
        let good = root.path().join("good");
        write_bundle(&good, &text_layout((640, 360), BBox::new(0, 0, 100, 40), "ok"));
        deck_from_bundles(&[no_layout, bad, good], &out, true).unwrap();
        assert!(zip_names(&out).contains(&"ppt/slides/slide1.xml".to_string()));
    }

    fn write_content_list(dir: &Path, stem: &str, json: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{stem}_content_list.json"));
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn doc_layout_deck_scales_and_backs_first_page() {
        let root = TempDir::new().unwrap();
        let parsed = root.path().join("doc/auto");
        write_content_list(
            &parsed,
            "doc",
            r#"[
                {"type": "title", "text": "A Paper", "text_level": 1, "page_idx": 0, "bbox": [50, 40, 550, 90]},
                {"type": "text", "text": "Body text.", "page_idx": 0, "bbox": [50, 120, 550, 700]},
                {"type": "table", "page_idx": 1, "bbox": [60, 100, 540, 300],
                 "table_body": "<table><tr><td>k</td><td>v</td></tr></table>"},
                {"type": "text", "text": "Second page.", "page_idx": 1, "bbox": [60, 340, 540, 400]}
            ]"#,
        );
        std::fs::write(
            parsed.join("layout.json"),
            r#"{"pdf_info": [{"page_size": [612.0, 792.0]}]}"#,
        )
        .unwrap();
        // Still image next to the parse backs page one only.
        write_png(&root.path().join("doc/doc.png"), 61, 79);
        let out = root.path().join("editable.pptx");

        deck_from_doc_layout(&parsed, &out, (1920, 1080)).await.unwrap();

        let names = zip_names(&out);
        assert!(names.contains(&"ppt/slides/slide2.xml".to_string()));
        assert!(names.contains(&"ppt/media/image1.png".to_string()));
        assert!(!names.contains(&"ppt/media/image2.png".to_string()));

        // 1920px @ 96dpi = 20in.
        let presentation = zip_part(&out, "ppt/presentation.xml");
        assert!(presentation.contains(r#"cx="18288000""#), "{presentation}");
    }

    #[tokio::test]
    async fn doc_layout_deck_snaps_default_target_to_inferred_size() {
        let root = TempDir::new().unwrap();
        let parsed = root.path().join("p");
        write_content_list(
            &parsed,
            "doc",
            r#"[{"type": "text", "text": "t", "page_idx": 0, "bbox": [0, 0, 480, 960]}]"#,
        );
        let out = root.path().join("editable.pptx");

        deck_from_doc_layout(&parsed, &out, (1920, 1080)).await.unwrap();

        // Inferred 480x960 at 96dpi: 5x10in.
        let presentation = zip_part(&out, "ppt/presentation.xml");
        assert!(presentation.contains(r#"cx="4572000""#), "{presentation}");
        assert!(presentation.contains(r#"cy="9144000""#), "{presentation}");
    }

    #[tokio::test]
    async fn doc_layout_without_content_list_fails() {
        let root = TempDir::new().unwrap();
        let out = root.path().join("editable.pptx");
        let err = deck_from_doc_layout(root.path(), &out, (1920, 1080))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DeckBuild(_)));
    }

    #[tokio::test]
    async fn doc_layout_missing_element_image_becomes_placeholder() {
        let root = TempDir::new().unwrap();
        let parsed = root.path().join("p");
        write_content_list(
            &parsed,
            "doc",
            r#"[
                {"type": "image", "img_path": "images/gone.png", "page_idx": 0, "bbox": [0, 0, 200, 100]},
                {"type": "text", "text": "caption", "page_idx": 0, "bbox": [0, 120, 200, 160]}
            ]"#,
        );
        let out = root.path().join("editable.pptx");

        deck_from_doc_layout(&parsed, &out, (1920, 1080)).await.unwrap();

        let slide = zip_part(&out, "ppt/slides/slide1.xml");
        assert!(slide.contains("Image not found"), "{slide}");
    }
}
