//! Combined-PDF assembly: one page per generated slide image.
//!
//! Every image is decoded, normalised to RGB, re-encoded as JPEG and embedded
//! as a `DCTDecode` XObject drawn full-bleed on a page whose MediaBox matches
//! the image's pixel dimensions at 96 dpi. Assembly runs on a blocking thread
//! because both the image codecs and `lopdf` serialisation are CPU-bound.

use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tracing::{debug, info};

use crate::error::EngineError;

/// JPEG quality for embedded page images.
const JPEG_QUALITY: u8 = 90;

/// Points per pixel at the 96 dpi the deck pipeline renders at.
const PT_PER_PX: f64 = 72.0 / 96.0;

/// Combine `images` into a single PDF at `output`, one page per image, in
/// the given order.
///
/// Fails if `images` is empty, if any image cannot be decoded, or if the
/// document cannot be serialised.
pub(crate) async fn save_images_as_pdf(
    images: &[PathBuf],
    output: &Path,
) -> Result<(), EngineError> {
    let images = images.to_vec();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || build_pdf(&images, &output))
        .await
        .map_err(|e| EngineError::Internal(format!("PDF build task panicked: {e}")))?
}

fn build_pdf(images: &[PathBuf], output: &Path) -> Result<(), EngineError> {
    if images.is_empty() {
        return Err(EngineError::PdfBuild("no images to combine".into()));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(images.len());

    for path in images {
        let page_id = add_image_page(&mut doc, pages_id, path)?;
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EngineError::OutputWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    doc.save(output)
        .map_err(|e| EngineError::PdfBuild(format!("saving {}: {e}", output.display())))?;

    info!("Combined {count} slide images into {}", output.display());
    Ok(())
}

/// Decode one image, embed it as a JPEG XObject and return the new page id.
fn add_image_page(
    doc: &mut Document,
    pages_id: lopdf::ObjectId,
    path: &Path,
) -> Result<lopdf::ObjectId, EngineError> {
    let rgb = image::open(path)
        .map_err(|e| EngineError::ImageDecode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
        .to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| EngineError::PdfBuild(format!("encoding {}: {e}", path.display())))?;

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let w_pt = (f64::from(width) * PT_PER_PX).round() as i64;
    let h_pt = (f64::from(height) * PT_PER_PX).round() as i64;

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    w_pt.into(),
                    0.into(),
                    0.into(),
                    h_pt.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec!["Im0".into()]),
            Operation::new("Q", vec![]),
        ],
    };
    let encoded = content
        .encode()
        .map_err(|e| EngineError::PdfBuild(format!("encoding page content: {e}")))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), w_pt.into(), h_pt.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    });

    debug!(
        "Added PDF page {}x{}pt from {}",
        w_pt,
        h_pt,
        path.display()
    );
    Ok(page_id)
}
