//! Collaborator traits: the model client and the retrieval service.
//!
//! Both are black boxes to the engine (spec of record: prompts in, text or
//! image bytes out; documents in, ranked answers out). They are injected as
//! `Arc<dyn …>` at engine construction and never reached through globals, so
//! tests can script them and callers can wrap them with middleware.
//!
//! Credential handling, rate limiting, and model routing all live behind
//! these traits — the engine only decides *what* to ask and what budget to
//! allow, via the request types here.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

/// Boxed error for collaborator implementations.
///
/// The engine never matches on collaborator error variants; it logs the
/// message and applies its own recovery rules.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ── Image payloads ───────────────────────────────────────────────────────

/// A base64-encoded image attached to a model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// Base64 payload (no data-URI prefix).
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
}

impl ImageData {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Encode raw bytes.
    pub fn from_bytes(bytes: &[u8], mime_type: &str) -> Self {
        Self::new(STANDARD.encode(bytes), mime_type)
    }

    /// Encode a decoded image as PNG.
    ///
    /// PNG keeps text crisp. Lossy artifacts on rendered text measurably
    /// degrade layout extraction, so slides and crops always travel lossless.
    pub fn from_png(img: &DynamicImage) -> Result<Self, image::ImageError> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(Self::from_bytes(&buf, "image/png"))
    }

    /// Decode back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Image bytes produced by the model.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl GeneratedImage {
    /// File extension matching the payload's MIME type.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

// ── Model requests ───────────────────────────────────────────────────────

/// Request for a text-generation call.
#[derive(Debug, Clone, Default)]
pub struct TextRequest {
    pub prompt: String,
    /// Images the model should look at (slides, crops).
    pub images: Vec<ImageData>,
    /// Output token budget; `None` leaves the client's default.
    pub max_tokens: Option<usize>,
    /// Format hint: ask the client to force a JSON response where supported.
    pub json_only: bool,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_only = true;
        self
    }
}

/// One labelled reference image attached to an image-generation call.
///
/// Labels carry figure identifiers and captions so the model can pick the
/// right reference when several are attached.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub label: Option<String>,
    pub image: ImageData,
}

/// Request for an image-generation call.
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    pub prompt: String,
    pub references: Vec<ReferenceImage>,
    /// Aspect-ratio hint like `16:9`; `None` leaves the model unconstrained.
    pub aspect_ratio: Option<String>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, label: Option<String>, image: ImageData) -> Self {
        self.references.push(ReferenceImage { label, image });
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }
}

/// Text- and image-generation boundary.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate text from a prompt plus optional images.
    async fn generate_text(&self, request: TextRequest) -> Result<String, BoxError>;

    /// Generate one image from a prompt plus optional reference images.
    async fn generate_image(&self, request: ImageRequest) -> Result<GeneratedImage, BoxError>;
}

// ── Retrieval ────────────────────────────────────────────────────────────

/// How the retrieval service should search for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Nearby-chunk context only.
    Local,
    /// Corpus-wide context.
    Global,
    /// Both, merged by the service.
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Local => "local",
            RetrievalMode::Global => "global",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

/// Document ingestion and query boundary.
///
/// Both directories are engine-managed so a cached run stays self-contained:
/// `index_dir` holds whatever the retriever needs to answer queries later,
/// and `artifact_dir` receives parsed artifacts (markdown, extracted
/// figures, layout dumps) that later stages scan directly.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Ingest a document (file or directory) into the retrieval index.
    async fn ingest(
        &self,
        input: &Path,
        index_dir: &Path,
        artifact_dir: &Path,
    ) -> Result<(), BoxError>;

    /// Answer one query against the ingested content.
    async fn query(&self, query: &str, mode: RetrievalMode) -> Result<String, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn image_data_round_trip() {
        let data = ImageData::from_bytes(b"hello", "image/png");
        assert_eq!(data.decode().unwrap(), b"hello");
        assert_eq!(data.mime_type, "image/png");
    }

    #[test]
    fn image_data_from_png_is_decodable() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255])));
        let data = ImageData::from_png(&img).expect("encode should succeed");
        let bytes = data.decode().expect("valid base64");
        let back = image::load_from_memory(&bytes).expect("valid png");
        assert_eq!(back.width(), 4);
    }

    #[test]
    fn generated_image_extension() {
        let png = GeneratedImage {
            bytes: vec![],
            mime_type: "image/png".into(),
        };
        let jpg = GeneratedImage {
            bytes: vec![],
            mime_type: "image/jpeg".into(),
        };
        assert_eq!(png.extension(), "png");
        assert_eq!(jpg.extension(), "jpg");
    }

    #[test]
    fn text_request_builders() {
        let req = TextRequest::new("describe").with_max_tokens(64).json();
        assert!(req.json_only);
        assert_eq!(req.max_tokens, Some(64));
    }
}
