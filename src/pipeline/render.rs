//! Render stage: slide images, the combined PDF, decks, and asset bundles.
//!
//! Image generation is the load-bearing half: one model call per planned
//! slide (the opening slide first, alone, so its image can anchor the style
//! of every later call), or a single call for a poster. A failed generation
//! fails the stage.
//!
//! Everything after the images is best-effort: the combined PDF, the plain
//! deck, the editable deck reconstructed from a parsed document layout, and
//! the asset-extraction deck all log a warning on failure and leave the
//! stage green. A deck that cannot be written must never cost the user
//! their rendered slides.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::OutputType;
use crate::error::EngineError;
use crate::export;
use crate::layout::SlideExtractor;
use crate::model::{GeneratedImage, ImageData, ImageRequest};
use crate::pipeline::plan::{OriginElements, PlanCheckpoint, PlannedSlide};
use crate::pipeline::{Pipeline, Stage};
use crate::prompts;

pub async fn run(pipeline: &Pipeline) -> Result<(), EngineError> {
    let paths = pipeline.paths();
    let data: PlanCheckpoint = checkpoint::read_json(&paths.plan_checkpoint())?.ok_or_else(|| {
        EngineError::MissingCheckpoint {
            stage: Stage::Plan.as_str().to_string(),
        }
    })?;

    let run_dir = paths.new_run_dir();
    std::fs::create_dir_all(&run_dir).map_err(|source| EngineError::OutputWrite {
        path: run_dir.clone(),
        source,
    })?;
    info!("Rendering into {}", run_dir.display());

    match pipeline.request().output_type {
        OutputType::Poster => render_poster(pipeline, &data, &run_dir).await,
        OutputType::Slides => {
            let images = render_slides(pipeline, &data, &run_dir).await?;
            export_outputs(pipeline, &images, &run_dir).await;
            Ok(())
        }
    }
}

// ── Poster ───────────────────────────────────────────────────────────────

/// One generation call covering every planned section, saved as
/// `poster.<ext>`. Posters get no PDF or deck exports.
async fn render_poster(
    pipeline: &Pipeline,
    data: &PlanCheckpoint,
    run_dir: &Path,
) -> Result<(), EngineError> {
    let request = pipeline.request();
    let sections = &data.plan.sections;

    let mut prompt = String::new();
    prompt.push_str(prompts::FORMAT_POSTER);
    prompt.push_str("\n\n");
    prompt.push_str(&prompts::style_hint(
        request.style.as_str(),
        request.custom_style.as_deref(),
    ));
    prompt.push_str("\n\n");
    prompt.push_str(prompts::VISUALIZATION_HINTS);
    let references = attach_figures(sections, &data.origin, &mut prompt);
    for (idx, section) in sections.iter().enumerate() {
        prompt.push_str(&format!("\n\n# Section {}: {}\n\n", idx + 1, section.title));
        prompt.push_str(&section.content);
        push_table_extracts(&mut prompt, section, &data.origin);
    }

    let mut model_request = ImageRequest::new(prompt).with_aspect_ratio("16:9");
    model_request.references = references;
    let image = generate_image(pipeline, model_request, "poster").await?;

    let path = run_dir.join(format!("poster.{}", image.extension()));
    checkpoint::write_bytes_atomic(&path, &image.bytes)?;
    info!("Poster written to {}", path.display());
    Ok(())
}

// ── Slides ───────────────────────────────────────────────────────────────

/// Generate one image per planned slide and return their paths in deck
/// order. The opening slide is generated first and attached to every other
/// call as the style reference.
async fn render_slides(
    pipeline: &Pipeline,
    data: &PlanCheckpoint,
    run_dir: &Path,
) -> Result<Vec<PathBuf>, EngineError> {
    let sections = &data.plan.sections;
    if sections.is_empty() {
        return Err(EngineError::ModelOutput {
            context: "render".into(),
            detail: "plan checkpoint holds no slides".into(),
        });
    }

    let opening = &sections[0];
    let image = generate_slide(pipeline, data, opening, None).await?;
    let reference = ImageData::from_bytes(&image.bytes, &image.mime_type);
    let mut paths = vec![save_slide(run_dir, opening, &image)?];
    info!("Opening slide rendered, generating {} more", sections.len() - 1);

    let jobs = sections.iter().enumerate().skip(1).map(|(idx, section)| {
        let reference = reference.clone();
        async move {
            let result = generate_slide(pipeline, data, section, Some(reference)).await;
            (idx, result)
        }
    });
    let mut done: Vec<(usize, Result<GeneratedImage, EngineError>)> = stream::iter(jobs)
        .buffer_unordered(pipeline.engine().concurrency.max(1))
        .collect()
        .await;
    done.sort_by_key(|(idx, _)| *idx);

    for (idx, result) in done {
        let image = result?;
        paths.push(save_slide(run_dir, &sections[idx], &image)?);
    }
    info!("Rendered {} slide image(s)", paths.len());
    Ok(paths)
}

async fn generate_slide(
    pipeline: &Pipeline,
    data: &PlanCheckpoint,
    section: &PlannedSlide,
    reference: Option<ImageData>,
) -> Result<GeneratedImage, EngineError> {
    let request = pipeline.request();
    let mut prompt = String::new();
    prompt.push_str(prompts::FORMAT_SLIDE);
    prompt.push_str("\n\n");
    prompt.push_str(&prompts::style_hint(
        request.style.as_str(),
        request.custom_style.as_deref(),
    ));
    prompt.push_str("\n\n");
    prompt.push_str(prompts::slide_layout_rules(section.kind.position()));
    prompt.push_str("\n\n");
    prompt.push_str(prompts::VISUALIZATION_HINTS);

    let mut references = attach_figures(std::slice::from_ref(section), &data.origin, &mut prompt);
    if let Some(style_reference) = reference {
        prompt.push_str("\n\n");
        prompt.push_str(prompts::CONSISTENCY_HINT);
        references.insert(
            0,
            crate::model::ReferenceImage {
                label: Some("reference slide for style consistency".into()),
                image: style_reference,
            },
        );
    }

    prompt.push_str(&format!("\n\n# {}: {}\n\n", section.id, section.title));
    prompt.push_str(&section.content);
    push_table_extracts(&mut prompt, section, &data.origin);

    let mut model_request = ImageRequest::new(prompt).with_aspect_ratio("16:9");
    model_request.references = references;
    generate_image(pipeline, model_request, &section.id).await
}

async fn generate_image(
    pipeline: &Pipeline,
    request: ImageRequest,
    context: &str,
) -> Result<GeneratedImage, EngineError> {
    debug!(
        "Generating {context} ({} reference image(s))",
        request.references.len()
    );
    pipeline
        .model()
        .generate_image(request)
        .await
        .map_err(|e| EngineError::ModelCall {
            context: context.to_string(),
            detail: e.to_string(),
        })
}

fn save_slide(
    run_dir: &Path,
    section: &PlannedSlide,
    image: &GeneratedImage,
) -> Result<PathBuf, EngineError> {
    let path = run_dir.join(format!("{}.{}", section.id, image.extension()));
    checkpoint::write_bytes_atomic(&path, &image.bytes)?;
    debug!("Saved {}", path.display());
    Ok(path)
}

// ── Prompt assembly ──────────────────────────────────────────────────────

/// Append the table HTML each section references: the model's chosen
/// extract when present, else the full inventoried table.
fn push_table_extracts(prompt: &mut String, section: &PlannedSlide, origin: &OriginElements) {
    for table_ref in &section.tables {
        let html = table_ref
            .extract
            .as_deref()
            .or_else(|| origin.table(&table_ref.table_id).map(|t| t.html.as_str()));
        let Some(html) = html else {
            warn!(
                "Table {} referenced by {} is not in the inventory",
                table_ref.table_id, section.id
            );
            continue;
        };
        prompt.push_str(&format!("\n\n## Table: {}\n", table_ref.table_id));
        if let Some(focus) = &table_ref.focus {
            prompt.push_str(&format!("Focus: {focus}\n"));
        }
        prompt.push_str(html);
    }
}

/// Load every figure the sections reference and return them as labelled
/// reference images; the figure hint is appended once when any loads.
/// Unreadable figures degrade to a warning.
fn attach_figures(
    sections: &[PlannedSlide],
    origin: &OriginElements,
    prompt: &mut String,
) -> Vec<crate::model::ReferenceImage> {
    let mut references = Vec::new();
    for section in sections {
        for figure_ref in &section.figures {
            let Some(figure) = origin.figure(&figure_ref.figure_id) else {
                warn!(
                    "Figure {} referenced by {} is not in the inventory",
                    figure_ref.figure_id, section.id
                );
                continue;
            };
            let path = if origin.base_path.is_empty() {
                PathBuf::from(&figure.path)
            } else {
                Path::new(&origin.base_path).join(&figure.path)
            };
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Figure {} unreadable at {}: {e}", figure.id, path.display());
                    continue;
                }
            };
            let mut label = figure.id.clone();
            if let Some(caption) = &figure.caption {
                label.push_str(": ");
                label.push_str(caption);
            }
            if let Some(focus) = &figure_ref.focus {
                label.push_str(&format!(" (focus: {focus})"));
            }
            references.push(crate::model::ReferenceImage {
                label: Some(label),
                image: ImageData::from_bytes(&bytes, mime_for(&path)),
            });
        }
    }
    if !references.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(prompts::FIGURE_HINT);
    }
    references
}

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

// ── Post-image exports ───────────────────────────────────────────────────

/// The best-effort outputs of §slides: combined PDF, plain deck, editable
/// deck from any parsed document layout, and the asset-extraction deck.
async fn export_outputs(pipeline: &Pipeline, images: &[PathBuf], run_dir: &Path) {
    if images.len() > 1 {
        let pdf_path = run_dir.join("slides.pdf");
        if let Err(e) = export::save_images_as_pdf(images, &pdf_path).await {
            warn!("Combined PDF export failed: {e}");
        }
    }

    let deck_path = run_dir.join("slides.pptx");
    if let Err(e) = export::deck_from_images(images, &deck_path) {
        warn!("Deck export failed: {e}");
    }

    let retrieval_output = pipeline.paths().retrieval_output();
    if let Some(parsed_dir) = export::find_parsed_layout_dir(&retrieval_output) {
        let engine = pipeline.engine();
        let target = (engine.deck_target_width, engine.deck_target_height);
        let editable_path = run_dir.join("slides_editable.pptx");
        if let Err(e) = export::deck_from_doc_layout(&parsed_dir, &editable_path, target).await {
            warn!("Editable deck export failed: {e}");
        }
    } else {
        debug!("No parsed document layout under {}", retrieval_output.display());
    }

    if pipeline.request().extract_assets {
        let extractor = SlideExtractor::new(pipeline.engine(), pipeline.model().clone());
        match extractor.extract_all(images, run_dir).await {
            Ok(bundles) => {
                let assets_path = run_dir.join("slides_editable_assets.pptx");
                if let Err(e) = export::deck_from_bundles(&bundles, &assets_path, true) {
                    warn!("Asset deck export failed: {e}");
                }
            }
            Err(e) => warn!("Asset extraction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{EngineConfig, GenerationConfig};
    use crate::model::{BoxError, ModelClient, RetrievalMode, Retriever, TextRequest};
    use crate::pipeline::plan::{FigureRef, SlideKind, SlidePlan, TableRef};
    use crate::pipeline::summarize::{FigureInfo, TableInfo};

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([40, 90, 160]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Records every image request and answers with a tiny PNG.
    struct RecordingModel {
        requests: Mutex<Vec<ImageRequest>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingModel {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl ModelClient for RecordingModel {
        async fn generate_text(&self, _request: TextRequest) -> Result<String, BoxError> {
            Err("no text calls expected".into())
        }

        async fn generate_image(
            &self,
            request: ImageRequest,
        ) -> Result<GeneratedImage, BoxError> {
            if let Some(marker) = self.fail_on {
                if request.prompt.contains(marker) {
                    return Err(format!("scripted failure for {marker}").into());
                }
            }
            self.requests.lock().unwrap().push(request);
            Ok(GeneratedImage {
                bytes: png_bytes(),
                mime_type: "image/png".into(),
            })
        }
    }

    struct NoRetriever;

    #[async_trait]
    impl Retriever for NoRetriever {
        async fn ingest(
            &self,
            _input: &Path,
            _index_dir: &Path,
            _artifact_dir: &Path,
        ) -> Result<(), BoxError> {
            Ok(())
        }

        async fn query(&self, _query: &str, _mode: RetrievalMode) -> Result<String, BoxError> {
            Err("no queries in render tests".into())
        }
    }

    fn section(id: &str, kind: SlideKind) -> PlannedSlide {
        PlannedSlide {
            id: id.into(),
            title: format!("Title for {id}"),
            kind,
            content: format!("Content for {id}."),
            tables: Vec::new(),
            figures: Vec::new(),
        }
    }

    fn plan_checkpoint(sections: Vec<PlannedSlide>, output_type: &str) -> PlanCheckpoint {
        PlanCheckpoint {
            content_type: "paper".into(),
            origin: OriginElements::default(),
            plan: SlidePlan {
                output_type: output_type.into(),
                sections,
            },
        }
    }

    fn pipeline_with(
        root: &Path,
        model: Arc<RecordingModel>,
        request: GenerationConfig,
    ) -> Pipeline {
        Pipeline::new(
            root,
            request,
            EngineConfig::builder().no_cache().build().unwrap(),
            model,
            Arc::new(NoRetriever),
        )
    }

    fn seed_plan(pipeline: &Pipeline, data: &PlanCheckpoint) {
        checkpoint::write_json_atomic(&pipeline.paths().plan_checkpoint(), data).unwrap();
    }

    #[tokio::test]
    async fn renders_slides_pdf_and_deck() {
        let root = TempDir::new().unwrap();
        let model = Arc::new(RecordingModel::new());
        let pipeline = pipeline_with(
            root.path(),
            model.clone(),
            GenerationConfig::new("demo", root.path().join("in.pdf")),
        );
        seed_plan(
            &pipeline,
            &plan_checkpoint(
                vec![
                    section("slide_01", SlideKind::Opening),
                    section("slide_02", SlideKind::Content),
                    section("slide_03", SlideKind::Ending),
                ],
                "slides",
            ),
        );

        run(&pipeline).await.unwrap();

        let run_dir = pipeline.paths().latest_run_dir().unwrap();
        for name in ["slide_01.png", "slide_02.png", "slide_03.png", "slides.pdf", "slides.pptx"] {
            assert!(run_dir.join(name).is_file(), "missing {name}");
        }
        // No parsed layout and no extraction: no editable decks.
        assert!(!run_dir.join("slides_editable.pptx").exists());
        assert!(!run_dir.join("slides_editable_assets.pptx").exists());
    }

    #[tokio::test]
    async fn later_slides_carry_the_opening_as_reference() {
        let root = TempDir::new().unwrap();
        let model = Arc::new(RecordingModel::new());
        let pipeline = pipeline_with(
            root.path(),
            model.clone(),
            GenerationConfig::new("demo", root.path().join("in.pdf")),
        );
        seed_plan(
            &pipeline,
            &plan_checkpoint(
                vec![
                    section("slide_01", SlideKind::Opening),
                    section("slide_02", SlideKind::Content),
                ],
                "slides",
            ),
        );

        run(&pipeline).await.unwrap();

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let opening = requests
            .iter()
            .find(|r| r.prompt.contains("slide_01"))
            .unwrap();
        let content = requests
            .iter()
            .find(|r| r.prompt.contains("slide_02"))
            .unwrap();
        assert!(opening.references.is_empty());
        assert!(!opening.prompt.contains(prompts::CONSISTENCY_HINT));
        assert_eq!(content.references.len(), 1);
        assert!(content.prompt.contains(prompts::CONSISTENCY_HINT));
        assert!(content.prompt.contains("Content Slide Layout"));
    }

    #[tokio::test]
    async fn referenced_figures_and_tables_reach_the_prompt() {
        let root = TempDir::new().unwrap();
        let figure_file = root.path().join("fig1.png");
        std::fs::write(&figure_file, png_bytes()).unwrap();

        let mut slide = section("slide_01", SlideKind::Opening);
        slide.tables.push(TableRef {
            table_id: "Table 1".into(),
            extract: None,
            focus: Some("accuracy".into()),
        });
        slide.figures.push(FigureRef {
            figure_id: "Figure 1".into(),
            focus: None,
        });
        let mut data = plan_checkpoint(vec![slide], "slides");
        data.origin = OriginElements {
            tables: vec![TableInfo {
                id: "Table 1".into(),
                caption: "Results".into(),
                html: "<table><tr><td>97.2</td></tr></table>".into(),
                line: 0,
            }],
            figures: vec![FigureInfo {
                id: "Figure 1".into(),
                caption: Some("Architecture".into()),
                path: "fig1.png".into(),
                line: 0,
            }],
            base_path: root.path().to_string_lossy().into_owned(),
        };

        let model = Arc::new(RecordingModel::new());
        let pipeline = pipeline_with(
            root.path(),
            model.clone(),
            GenerationConfig::new("demo", root.path().join("in.pdf")),
        );
        seed_plan(&pipeline, &data);

        run(&pipeline).await.unwrap();

        let requests = model.requests.lock().unwrap();
        let request = &requests[0];
        assert!(request.prompt.contains("<table><tr><td>97.2</td></tr></table>"));
        assert!(request.prompt.contains("Focus: accuracy"));
        assert!(request.prompt.contains(prompts::FIGURE_HINT));
        assert_eq!(request.references.len(), 1);
        assert_eq!(
            request.references[0].label.as_deref(),
            Some("Figure 1: Architecture")
        );
    }

    #[tokio::test]
    async fn poster_renders_one_image_and_skips_deck_exports() {
        let root = TempDir::new().unwrap();
        let model = Arc::new(RecordingModel::new());
        let mut request = GenerationConfig::new("demo", root.path().join("in.pdf"));
        request.output_type = OutputType::Poster;
        let pipeline = pipeline_with(root.path(), model.clone(), request);
        seed_plan(
            &pipeline,
            &plan_checkpoint(
                vec![
                    section("poster_title", SlideKind::Content),
                    section("poster_method", SlideKind::Content),
                ],
                "poster",
            ),
        );

        run(&pipeline).await.unwrap();

        let run_dir = pipeline.paths().latest_run_dir().unwrap();
        assert!(run_dir.join("poster.png").is_file());
        assert!(!run_dir.join("slides.pdf").exists());
        assert!(!run_dir.join("slides.pptx").exists());

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("Section 1: Title for poster_title"));
        assert!(requests[0].prompt.contains("Section 2: Title for poster_method"));
    }

    #[tokio::test]
    async fn failed_generation_fails_the_stage() {
        let root = TempDir::new().unwrap();
        let model = Arc::new(RecordingModel {
            requests: Mutex::new(Vec::new()),
            fail_on: Some("slide_02"),
        });
        let pipeline = pipeline_with(
            root.path(),
            model,
            GenerationConfig::new("demo", root.path().join("in.pdf")),
        );
        seed_plan(
            &pipeline,
            &plan_checkpoint(
                vec![
                    section("slide_01", SlideKind::Opening),
                    section("slide_02", SlideKind::Content),
                ],
                "slides",
            ),
        );

        let err = run(&pipeline).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelCall { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_plan_checkpoint_is_reported() {
        let root = TempDir::new().unwrap();
        let pipeline = pipeline_with(
            root.path(),
            Arc::new(RecordingModel::new()),
            GenerationConfig::new("demo", root.path().join("in.pdf")),
        );

        let err = run(&pipeline).await.unwrap_err();
        match err {
            EngineError::MissingCheckpoint { stage } => assert_eq!(stage, "plan"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
