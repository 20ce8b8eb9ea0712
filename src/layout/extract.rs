//! Slide bundle extraction: layout JSON, background image, and cropped
//! assets from rendered slide images.
//!
//! One bundle directory per slide:
//!
//! ```text
//! <output_root>/<slide_stem>/
//!     layout.json       normalized element layout
//!     background.png    reconstructed (or copied) background
//!     assets/           cropped visual elements, asset-001.png, ...
//! ```
//!
//! The layout call is fatal for the slide; everything downstream of it
//! (text refinement, background reconstruction, bbox tightening, asset
//! cleanup) degrades to the unrefined form and logs why.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use image::DynamicImage;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::EngineConfig;
use crate::error::{EngineError, Skipped};
use crate::layout::{
    self, coerce_bbox, normalize_layout, repair, Align, BBox, Element, Layout,
};
use crate::model::{ImageData, ImageRequest, ModelClient, TextRequest};
use crate::prompts;

/// Extracts editable slide bundles from rendered slide images.
pub struct SlideExtractor {
    engine: EngineConfig,
    model: Arc<dyn ModelClient>,
}

impl SlideExtractor {
    pub fn new(engine: &EngineConfig, model: Arc<dyn ModelClient>) -> Self {
        Self {
            engine: engine.clone(),
            model,
        }
    }

    /// Extract bundles for every slide image, concurrently up to the
    /// configured cap, returning bundle directories in input order.
    pub async fn extract_all(
        &self,
        images: &[PathBuf],
        output_root: &Path,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let jobs = images.iter().enumerate().map(|(idx, path)| async move {
            (idx, self.extract_slide(path, output_root).await)
        });
        let mut done: Vec<(usize, Result<PathBuf, EngineError>)> = futures::stream::iter(jobs)
            .buffer_unordered(self.engine.concurrency.max(1))
            .collect()
            .await;
        done.sort_by_key(|(idx, _)| *idx);
        done.into_iter().map(|(_, result)| result).collect()
    }

    /// Extract one slide bundle. Returns the bundle directory.
    pub async fn extract_slide(
        &self,
        image_path: &Path,
        output_root: &Path,
    ) -> Result<PathBuf, EngineError> {
        let stem = image_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("slide");
        let slide_dir = output_root.join(stem);
        let assets_dir = slide_dir.join("assets");
        std::fs::create_dir_all(&assets_dir).map_err(|e| EngineError::OutputWrite {
            path: assets_dir.clone(),
            source: e,
        })?;

        let bytes = std::fs::read(image_path).map_err(|e| EngineError::ImageDecode {
            path: image_path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let base_image = image::load_from_memory(&bytes).map_err(|e| EngineError::ImageDecode {
            path: image_path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let (width, height) = (base_image.width(), base_image.height());
        let slide_data = ImageData::from_bytes(&bytes, mime_for(image_path));

        let mut layout = self.extract_layout(&slide_data, width, height).await?;
        layout.background = Some("background.png".to_string());
        layout.assets_dir = Some("assets".to_string());
        layout.source_image = Some(
            relative_path(image_path, &slide_dir)
                .to_string_lossy()
                .into_owned(),
        );

        if self.engine.refine_text_layout {
            match self.refine_text_layout(&slide_data, &mut layout).await {
                Ok(updated) => debug!("Refined {updated} text element(s) for {stem}"),
                Err(reason) => debug!("Text layout kept as extracted for {stem}: {reason}"),
            }
        }

        let background_path = slide_dir.join("background.png");
        if let Err(reason) = self
            .generate_background(&slide_data, width, height, &background_path)
            .await
        {
            warn!("Background reconstruction failed for {stem}: {reason}");
            std::fs::copy(image_path, &background_path).map_err(|e| EngineError::OutputWrite {
                path: background_path.clone(),
                source: e,
            })?;
        }

        let cropped = self
            .crop_assets(&base_image, &assets_dir, &mut layout)
            .await?;
        info!("Extracted {cropped} asset(s) from {stem}");

        checkpoint::write_json_atomic(&slide_dir.join("layout.json"), &layout)?;
        Ok(slide_dir)
    }

    /// Layout-extraction call with one strict-prompt retry round.
    async fn extract_layout(
        &self,
        slide: &ImageData,
        width: u32,
        height: u32,
    ) -> Result<Layout, EngineError> {
        let mut last_output = String::new();
        for attempt in 0..=self.engine.layout_max_retries {
            let request = TextRequest::new(prompts::layout_prompt(width, height, attempt > 0))
                .with_image(slide.clone())
                .json()
                .with_max_tokens(self.engine.layout_max_tokens);
            let raw = match self.model.generate_text(request).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Layout call failed (attempt {}): {e}", attempt + 1);
                    last_output = e.to_string();
                    continue;
                }
            };
            if let Some(payload) = repair::parse_candidates(&raw)
                .into_iter()
                .find_map(layout::coerce_layout_payload)
            {
                return Ok(normalize_layout(&payload, width, height));
            }
            last_output = raw;
        }
        Err(EngineError::ModelOutput {
            context: "slide layout".into(),
            detail: truncate_for_log(&last_output, 200),
        })
    }

    /// One call adjusting text geometry and line breaks against the
    /// rendered slide. Elements are matched by the ids we assigned; the
    /// model cannot add or remove elements.
    async fn refine_text_layout(
        &self,
        slide: &ImageData,
        layout: &mut Layout,
    ) -> Result<usize, Skipped> {
        let mut items = Vec::new();
        let mut mapping = Vec::new();
        for (index, element) in layout.elements.iter().enumerate() {
            if let Element::Text(text) = element {
                items.push(json!({
                    "id": mapping.len() + 1,
                    "bbox": text.bbox,
                    "text": text.text,
                    "font_size": text.font_size,
                    "align": text.align.map(|a| a.as_str()).unwrap_or("left"),
                }));
                mapping.push(index);
            }
        }
        if items.is_empty() {
            return Ok(0);
        }

        let payload = json!({
            "canvas": { "width": layout.canvas.width, "height": layout.canvas.height },
            "texts": items,
        });
        let items_json =
            serde_json::to_string_pretty(&payload).map_err(|e| Skipped::ModelUnusable {
                detail: e.to_string(),
            })?;
        let request = TextRequest::new(prompts::text_refine_prompt(&items_json))
            .with_image(slide.clone())
            .json()
            .with_max_tokens(self.engine.refine_text_max_tokens);
        let raw = self
            .model
            .generate_text(request)
            .await
            .map_err(|e| Skipped::ModelUnusable {
                detail: e.to_string(),
            })?;

        let refined = parse_text_refine_payload(&raw).ok_or_else(|| Skipped::ModelUnusable {
            detail: "no text refinement payload".into(),
        })?;

        let (width, height) = (layout.canvas.width, layout.canvas.height);
        let mut updated = 0;
        for item in &refined {
            let Some(id) = item.get("id").and_then(Value::as_u64) else {
                continue;
            };
            let Some(&index) = mapping.get((id as usize).wrapping_sub(1)) else {
                continue;
            };
            let Some(Element::Text(target)) = layout.elements.get_mut(index) else {
                continue;
            };

            if let Some(bbox) = item.get("bbox").and_then(coerce_bbox) {
                target.bbox = bbox.clamped(width, height);
            }
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    target.text = text.to_string();
                }
            }
            if let Some(size) = item.get("font_size").and_then(Value::as_f64) {
                if size > 0.0 {
                    target.font_size = Some(size);
                }
            }
            if let Some(align) = item
                .get("align")
                .and_then(Value::as_str)
                .and_then(Align::parse)
            {
                target.align = Some(align);
            }
            updated += 1;
        }
        Ok(updated)
    }

    /// Best-effort background reconstruction; the caller copies the
    /// original slide when this fails.
    async fn generate_background(
        &self,
        slide: &ImageData,
        width: u32,
        height: u32,
        output_path: &Path,
    ) -> Result<(), Skipped> {
        let mut request = ImageRequest::new(prompts::BACKGROUND_PROMPT)
            .with_reference(Some("Source Slide".to_string()), slide.clone());
        if let Some(ratio) = super::refine::infer_aspect_ratio(width, height) {
            request = request.with_aspect_ratio(ratio);
        }
        let generated = self
            .model
            .generate_image(request)
            .await
            .map_err(|e| Skipped::ModelUnusable {
                detail: e.to_string(),
            })?;
        let decoded =
            image::load_from_memory(&generated.bytes).map_err(|e| Skipped::Undecodable {
                detail: e.to_string(),
            })?;
        decoded
            .save(output_path)
            .map_err(|e| Skipped::Undecodable {
                detail: format!("save failed: {e}"),
            })?;
        Ok(())
    }

    /// Crop every visual element into a numbered asset file, optionally
    /// tightening and cleaning each crop first. Returns the asset count.
    async fn crop_assets(
        &self,
        base_image: &DynamicImage,
        assets_dir: &Path,
        layout: &mut Layout,
    ) -> Result<usize, EngineError> {
        let assets_prefix = layout.assets_dir.clone().unwrap_or_else(|| "assets".into());
        let mut asset_index = 1usize;
        for element in &mut layout.elements {
            let (is_image, description) = match element {
                Element::Image(img) => {
                    if img.asset_path.is_some() {
                        continue;
                    }
                    (true, img.description.clone())
                }
                Element::Table(table) => {
                    // Tables with cell data are rebuilt as native tables.
                    if !table.cells.is_empty() || table.asset_path.is_some() {
                        continue;
                    }
                    (false, table.description.clone())
                }
                Element::Text(_) => continue,
            };
            let element_type = element.type_name().to_string();
            let bbox = element.bbox();
            if bbox.is_empty() {
                continue;
            }

            if self.engine.refine_assets {
                match self
                    .refine_element_bbox(base_image, bbox, &element_type, description.as_deref())
                    .await
                {
                    Ok(refined) if refined != bbox => {
                        debug!("Tightened {element_type} bbox {bbox:?} -> {refined:?}");
                        element.set_bbox(refined);
                    }
                    Ok(_) => {}
                    Err(reason) => debug!("Keeping original {element_type} bbox: {reason}"),
                }
            }

            let crop_bbox = element.bbox().clamped(base_image.width(), base_image.height());
            if crop_bbox.is_empty() {
                continue;
            }
            let mut crop = base_image.crop_imm(
                crop_bbox.x0 as u32,
                crop_bbox.y0 as u32,
                crop_bbox.width() as u32,
                crop_bbox.height() as u32,
            );

            if self.engine.clean_assets && is_image {
                match self
                    .clean_asset(&crop, &element_type, description.as_deref())
                    .await
                {
                    Ok(cleaned) => {
                        crop = super::refine::resize_to(
                            cleaned,
                            crop_bbox.width() as u32,
                            crop_bbox.height() as u32,
                        );
                    }
                    Err(reason) => debug!("Keeping raw {element_type} crop: {reason}"),
                }
            }

            let asset_name = format!("asset-{asset_index:03}.png");
            asset_index += 1;
            let asset_file = assets_dir.join(&asset_name);
            crop.save(&asset_file).map_err(|e| EngineError::OutputWrite {
                path: asset_file.clone(),
                source: std::io::Error::other(e),
            })?;

            let stored = format!("{assets_prefix}/{asset_name}");
            match element {
                Element::Image(img) => img.asset_path = Some(stored),
                Element::Table(table) => table.asset_path = Some(stored),
                Element::Text(_) => {}
            }
        }
        Ok(asset_index - 1)
    }

    /// Scoped model call returning a tighter bbox for one crop, already
    /// translated back to slide coordinates.
    async fn refine_element_bbox(
        &self,
        base_image: &DynamicImage,
        bbox: BBox,
        element_type: &str,
        description: Option<&str>,
    ) -> Result<BBox, Skipped> {
        let width = bbox.width();
        let height = bbox.height();
        let min = i64::from(self.engine.refine_min_size);
        if width < min || height < min {
            return Err(Skipped::TooSmall {
                width: width.max(0) as u32,
                height: height.max(0) as u32,
                min: self.engine.refine_min_size,
            });
        }

        let crop = base_image.crop_imm(
            bbox.x0 as u32,
            bbox.y0 as u32,
            width as u32,
            height as u32,
        );
        let crop_data = ImageData::from_png(&crop).map_err(|e| Skipped::Undecodable {
            detail: e.to_string(),
        })?;
        let request = TextRequest::new(prompts::refine_bbox_prompt(
            width as u32,
            height as u32,
            element_type,
            description,
        ))
        .with_image(crop_data)
        .json()
        .with_max_tokens(self.engine.refine_max_tokens);
        let raw = self
            .model
            .generate_text(request)
            .await
            .map_err(|e| Skipped::ModelUnusable {
                detail: e.to_string(),
            })?;
        let refined = parse_bbox_payload(&raw).ok_or_else(|| Skipped::ModelUnusable {
            detail: "no bbox in refinement output".into(),
        })?;
        super::refine::accept_refined_bbox(bbox, refined)
    }

    /// Regenerate one crop as a standalone, background-free image and key
    /// out its backdrop. Falls back to the opaque regeneration when keying
    /// is abandoned.
    async fn clean_asset(
        &self,
        crop: &DynamicImage,
        element_type: &str,
        description: Option<&str>,
    ) -> Result<DynamicImage, Skipped> {
        let min = self.engine.clean_min_size;
        if crop.width() < min || crop.height() < min {
            return Err(Skipped::TooSmall {
                width: crop.width(),
                height: crop.height(),
                min,
            });
        }

        let crop_data = ImageData::from_png(crop).map_err(|e| Skipped::Undecodable {
            detail: e.to_string(),
        })?;
        let mut last_detail = String::from("no attempts");
        for _ in 0..self.engine.clean_max_retries.max(1) {
            let mut request = ImageRequest::new(prompts::clean_asset_prompt(
                element_type,
                description,
            ))
            .with_reference(Some("Asset Crop".to_string()), crop_data.clone());
            if let Some(ratio) = super::refine::infer_aspect_ratio(crop.width(), crop.height()) {
                request = request.with_aspect_ratio(ratio);
            }
            let generated = match self.model.generate_image(request).await {
                Ok(generated) => generated,
                Err(e) => {
                    last_detail = e.to_string();
                    continue;
                }
            };
            let decoded = match image::load_from_memory(&generated.bytes) {
                Ok(decoded) => decoded.to_rgba8(),
                Err(e) => {
                    last_detail = e.to_string();
                    continue;
                }
            };
            return Ok(
                match super::refine::apply_color_key(&decoded, self.engine.clean_bg_tolerance) {
                    Ok(keyed) => DynamicImage::ImageRgba8(keyed),
                    Err(reason) => {
                        debug!("Color key abandoned for {element_type}: {reason}");
                        DynamicImage::ImageRgba8(decoded)
                    }
                },
            );
        }
        Err(Skipped::ModelUnusable {
            detail: last_detail,
        })
    }
}

// ── Payload parsing ──────────────────────────────────────────────────────

/// Bbox from a refinement reply: a bare 4-array or `{"bbox": ...}` /
/// `{"box": ...}`.
fn parse_bbox_payload(raw: &str) -> Option<BBox> {
    repair::parse_candidates(raw).iter().find_map(|candidate| {
        coerce_bbox(candidate)
            .or_else(|| candidate.get("bbox").and_then(coerce_bbox))
            .or_else(|| candidate.get("box").and_then(coerce_bbox))
    })
}

/// Text-refinement reply: `{"texts": [...]}` or a bare object array.
fn parse_text_refine_payload(raw: &str) -> Option<Vec<Value>> {
    repair::parse_candidates(raw).into_iter().find_map(|candidate| {
        if let Some(texts) = candidate.get("texts").and_then(Value::as_array) {
            return Some(texts.clone());
        }
        let array = candidate.as_array()?;
        if !array.is_empty() && array.iter().all(Value::is_object) {
            Some(array.clone())
        } else {
            None
        }
    })
}

// ── Small helpers ────────────────────────────────────────────────────────

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// `target` expressed relative to `base`, for bundle-relative source
/// references. Falls back to the target as-is when the two share no root.
fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target_parts: Vec<_> = target.components().collect();
    let base_parts: Vec<_> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && target.is_absolute() {
        return target.to_path_buf();
    }
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    out
}

fn truncate_for_log(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::model::{BoxError, GeneratedImage};

    /// Scripted model: routes calls on prompt markers, records prompts.
    struct ScriptedModel {
        layout_replies: Mutex<Vec<String>>,
        refine_bbox_reply: String,
        text_refine_reply: String,
        background_fails: bool,
        layout_prompts: Mutex<Vec<String>>,
        image_calls: AtomicUsize,
    }

    impl Default for ScriptedModel {
        fn default() -> Self {
            Self {
                layout_replies: Mutex::new(Vec::new()),
                refine_bbox_reply: r#"{"bbox": [0, 0, 120, 90]}"#.to_string(),
                text_refine_reply: r#"{"texts": []}"#.to_string(),
                background_fails: false,
                layout_prompts: Mutex::new(Vec::new()),
                image_calls: AtomicUsize::new(0),
            }
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([120, 140, 160, 255]),
        ));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate_text(&self, request: TextRequest) -> Result<String, BoxError> {
            if request.prompt.contains("Extract a structured layout") {
                self.layout_prompts.lock().unwrap().push(request.prompt.clone());
                let mut replies = self.layout_replies.lock().unwrap();
                if replies.is_empty() {
                    return Err("layout script exhausted".into());
                }
                return Ok(replies.remove(0));
            }
            if request.prompt.contains("tightest bounding box") {
                return Ok(self.refine_bbox_reply.clone());
            }
            if request.prompt.contains("Refine the text layout") {
                return Ok(self.text_refine_reply.clone());
            }
            Err(format!("unexpected text call: {}", &request.prompt[..40]).into())
        }

        async fn generate_image(
            &self,
            request: ImageRequest,
        ) -> Result<GeneratedImage, BoxError> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.contains("background-only") && self.background_fails {
                return Err("background model down".into());
            }
            Ok(GeneratedImage {
                bytes: png_bytes(160, 90),
                mime_type: "image/png".into(),
            })
        }
    }

    fn slide_fixture(dir: &Path) -> PathBuf {
        // 320x180 canvas with a 160x120 "figure" block.
        let mut img = RgbaImage::from_pixel(320, 180, Rgba([250, 250, 250, 255]));
        for y in 20..140 {
            for x in 40..200 {
                img.put_pixel(x, y, Rgba([30, 90, 200, 255]));
            }
        }
        let path = dir.join("slide_01.png");
        DynamicImage::ImageRgba8(img).save(&path).unwrap();
        path
    }

    fn layout_reply() -> String {
        r#"{
            "version": "1",
            "canvas": {"width": 320, "height": 180},
            "elements": [
                {"type": "text", "bbox": [10, 150, 300, 175], "text": "Caption", "font_size": 14},
                {"type": "figure", "bbox": [40, 20, 200, 140], "description": "blue block"}
            ]
        }"#
        .to_string()
    }

    fn extractor(model: ScriptedModel) -> SlideExtractor {
        let engine = EngineConfig::builder().build().unwrap();
        SlideExtractor::new(&engine, Arc::new(model))
    }

    #[tokio::test]
    async fn extracts_a_complete_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let slide = slide_fixture(dir.path());
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec![layout_reply()]),
            ..ScriptedModel::default()
        };
        let out_root = dir.path().join("bundles");

        let bundle = extractor(model)
            .extract_slide(&slide, &out_root)
            .await
            .unwrap();

        assert_eq!(bundle, out_root.join("slide_01"));
        assert!(bundle.join("background.png").exists());
        assert!(bundle.join("assets/asset-001.png").exists());

        let saved: Layout =
            checkpoint::read_json(&bundle.join("layout.json")).unwrap().unwrap();
        assert_eq!(saved.canvas.width, 320);
        assert_eq!(saved.background.as_deref(), Some("background.png"));
        assert_eq!(saved.source_image.as_deref(), Some("../../slide_01.png"));
        let asset_path = saved.elements.iter().find_map(|e| match e {
            Element::Image(img) => img.asset_path.clone(),
            _ => None,
        });
        assert_eq!(asset_path.as_deref(), Some("assets/asset-001.png"));
        // Cleaned asset is resized back to the refined bbox size.
        let asset = image::open(bundle.join("assets/asset-001.png")).unwrap();
        assert_eq!(asset.width(), 120);
        assert_eq!(asset.height(), 90);
    }

    #[tokio::test]
    async fn strict_prompt_is_used_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let slide_bytes = std::fs::read(slide_fixture(dir.path())).unwrap();
        let slide_data = ImageData::from_bytes(&slide_bytes, "image/png");
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec!["garbage".to_string(), layout_reply()]),
            ..ScriptedModel::default()
        };
        let engine = EngineConfig::builder().build().unwrap();
        let model = Arc::new(model);
        let extractor = SlideExtractor::new(&engine, model.clone());

        extractor
            .extract_layout(&slide_data, 320, 180)
            .await
            .unwrap();

        let prompts = model.layout_prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("No extra text"));
        assert!(prompts[1].contains("No extra text"));
    }

    #[tokio::test]
    async fn exhausted_layout_retries_fail_the_slide() {
        let dir = tempfile::tempdir().unwrap();
        let slide = slide_fixture(dir.path());
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec!["nope".to_string(), "still nope".to_string()]),
            ..ScriptedModel::default()
        };

        let err = extractor(model)
            .extract_slide(&slide, &dir.path().join("bundles"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelOutput { .. }), "{err}");
    }

    #[tokio::test]
    async fn background_failure_copies_the_original_slide() {
        let dir = tempfile::tempdir().unwrap();
        let slide = slide_fixture(dir.path());
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec![layout_reply()]),
            background_fails: true,
            ..ScriptedModel::default()
        };

        let bundle = extractor(model)
            .extract_slide(&slide, &dir.path().join("bundles"))
            .await
            .unwrap();

        let background = std::fs::read(bundle.join("background.png")).unwrap();
        let original = std::fs::read(&slide).unwrap();
        assert_eq!(background, original);
    }

    #[tokio::test]
    async fn rejected_refinement_keeps_the_original_bbox() {
        let dir = tempfile::tempdir().unwrap();
        let slide = slide_fixture(dir.path());
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec![layout_reply()]),
            // 10x10 of a 160x120 crop: under the 15% area guard.
            refine_bbox_reply: r#"{"bbox": [0, 0, 10, 10]}"#.to_string(),
            ..ScriptedModel::default()
        };

        let bundle = extractor(model)
            .extract_slide(&slide, &dir.path().join("bundles"))
            .await
            .unwrap();

        let saved: Layout =
            checkpoint::read_json(&bundle.join("layout.json")).unwrap().unwrap();
        let figure_bbox = saved.elements.iter().find_map(|e| match e {
            Element::Image(img) => Some(img.bbox),
            _ => None,
        });
        assert_eq!(figure_bbox, Some(BBox::new(40, 20, 200, 140)));
    }

    #[tokio::test]
    async fn text_refinement_updates_matched_elements() {
        let dir = tempfile::tempdir().unwrap();
        let slide = slide_fixture(dir.path());
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec![layout_reply()]),
            text_refine_reply: r#"{"texts": [
                {"id": 1, "bbox": [12, 148, 302, 176], "text": "Caption\nLine two", "font_size": 12, "align": "center"},
                {"id": 99, "text": "ignored"}
            ]}"#
            .to_string(),
            ..ScriptedModel::default()
        };

        let bundle = extractor(model)
            .extract_slide(&slide, &dir.path().join("bundles"))
            .await
            .unwrap();

        let saved: Layout =
            checkpoint::read_json(&bundle.join("layout.json")).unwrap().unwrap();
        let text = saved
            .elements
            .iter()
            .find_map(|e| match e {
                Element::Text(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(text.text, "Caption\nLine two");
        assert_eq!(text.bbox, BBox::new(12, 148, 302, 176));
        assert_eq!(text.font_size, Some(12.0));
        assert_eq!(text.align, Some(Align::Center));
    }

    #[tokio::test]
    async fn extract_all_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut slides = Vec::new();
        for name in ["slide_01", "slide_02", "slide_03"] {
            let img = RgbaImage::from_pixel(320, 180, Rgba([255, 255, 255, 255]));
            let path = dir.path().join(format!("{name}.png"));
            DynamicImage::ImageRgba8(img).save(&path).unwrap();
            slides.push(path);
        }
        let model = ScriptedModel {
            layout_replies: Mutex::new(vec![
                r#"{"elements": []}"#.to_string(),
                r#"{"elements": []}"#.to_string(),
                r#"{"elements": []}"#.to_string(),
            ]),
            ..ScriptedModel::default()
        };
        let engine = EngineConfig::builder().concurrency(1).build().unwrap();
        let extractor = SlideExtractor::new(&engine, Arc::new(model));

        let bundles = extractor
            .extract_all(&slides, &dir.path().join("bundles"))
            .await
            .unwrap();

        let names: Vec<_> = bundles
            .iter()
            .map(|b| b.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["slide_01", "slide_02", "slide_03"]);
    }

    #[test]
    fn bbox_payload_accepts_bare_and_wrapped_forms() {
        assert_eq!(
            parse_bbox_payload("[1, 2, 3, 4]"),
            Some(BBox::new(1, 2, 3, 4))
        );
        assert_eq!(
            parse_bbox_payload(r#"{"bbox": [5.2, 6.9, 30, 40]}"#),
            Some(BBox::new(5, 7, 30, 40))
        );
        assert_eq!(
            parse_bbox_payload(r#"```json
{"box": [0, 0, 8, 8]}
```"#),
            Some(BBox::new(0, 0, 8, 8))
        );
        assert_eq!(parse_bbox_payload("no coordinates"), None);
    }

    #[test]
    fn relative_path_walks_up_and_down() {
        assert_eq!(
            relative_path(Path::new("/out/run/slide.png"), Path::new("/out/run/bundles/slide")),
            PathBuf::from("../../slide.png")
        );
        assert_eq!(
            relative_path(Path::new("/a/b.png"), Path::new("/a")),
            PathBuf::from("b.png")
        );
    }
}
