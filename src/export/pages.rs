//! Source-page rasterisation for editable-deck backgrounds.
//!
//! When a parsed document layout is exported, each slide's background is the
//! corresponding page of the original PDF rendered at the exact deck target
//! size. Rendering runs under `spawn_blocking` since pdfium is CPU-bound.
//!
//! Binding to the pdfium system library is allowed to fail: the caller then
//! falls back to a still-image background (or none), so binding failure is a
//! warning and an empty result rather than an error.

use std::path::{Path, PathBuf};

use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Render every page of `pdf_path` to `{out_dir}/page_NNN.png`, each scaled
/// to exactly `target` pixels (both axes, aspect ratio not preserved, so
/// backgrounds line up with layouts that were normalised the same way).
///
/// Returns the written paths in page order. Returns an empty list without
/// error when the pdfium library cannot be bound.
pub(crate) async fn render_pdf_backgrounds(
    pdf_path: &Path,
    target: (u32, u32),
    out_dir: &Path,
) -> Result<Vec<PathBuf>, EngineError> {
    let pdf_path = pdf_path.to_path_buf();
    let out_dir = out_dir.to_path_buf();

    tokio::task::spawn_blocking(move || render_backgrounds_blocking(&pdf_path, target, &out_dir))
        .await
        .map_err(|e| EngineError::Internal(format!("Background render task panicked: {e}")))?
}

fn render_backgrounds_blocking(
    pdf_path: &Path,
    (width, height): (u32, u32),
    out_dir: &Path,
) -> Result<Vec<PathBuf>, EngineError> {
    let bindings = match Pdfium::bind_to_system_library() {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!("pdfium unavailable ({e:?}), skipping page backgrounds");
            return Ok(Vec::new());
        }
    };
    let pdfium = Pdfium::new(bindings);

    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| EngineError::SourceRender {
            path: pdf_path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;

    std::fs::create_dir_all(out_dir).map_err(|source| EngineError::OutputWrite {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(width as i32)
        .set_target_height(height as i32);

    let pages = document.pages();
    let total = pages.len();
    let mut written = Vec::with_capacity(total as usize);

    for idx in 0..total {
        let page = pages.get(idx).map_err(|e| EngineError::SourceRender {
            path: pdf_path.to_path_buf(),
            detail: format!("page {}: {e:?}", idx + 1),
        })?;
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| EngineError::SourceRender {
                    path: pdf_path.to_path_buf(),
                    detail: format!("page {}: {e:?}", idx + 1),
                })?;
        let image = bitmap.as_image();

        let out_path = out_dir.join(format!("page_{:03}.png", idx + 1));
        image.save(&out_path).map_err(|e| EngineError::SourceRender {
            path: pdf_path.to_path_buf(),
            detail: format!("saving page {}: {e}", idx + 1),
        })?;
        debug!("Rendered background page {} → {}", idx + 1, out_path.display());
        written.push(out_path);
    }

    info!(
        "Rasterised {} background pages at {}x{} from {}",
        total,
        width,
        height,
        pdf_path.display()
    );
    Ok(written)
}
