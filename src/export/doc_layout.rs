//! Externally parsed document layouts (`*_content_list.json` + `layout.json`).
//!
//! A document parser run leaves a directory containing a content list (one
//! JSON array of positioned elements spanning all pages) and optionally a
//! `layout.json` whose `pdf_info[0].page_size` records the true page
//! dimensions. This module reads both, leniently: extra fields are ignored,
//! absent fields default, and anything structurally unusable is reported so
//! the caller can decide between skipping and failing.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Suffix every content-list file carries.
pub(crate) const CONTENT_LIST_SUFFIX: &str = "_content_list.json";

/// One positioned element from a parsed document layout.
///
/// Coordinates in `bbox` are `[x0, y0, x1, y1]` in the parser's page units;
/// the exporter rescales them to the deck target.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocElement {
    /// Element kind as reported by the parser ("text", "title", "image",
    /// "table", ...). Unknown kinds are carried through and skipped later.
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Heading level; `1` marks a page title.
    #[serde(default)]
    pub text_level: Option<u32>,
    #[serde(default)]
    pub page_idx: usize,
    #[serde(default)]
    pub bbox: Option<Vec<f64>>,
    #[serde(default)]
    pub img_path: Option<String>,
    #[serde(default)]
    table_img_path: Option<String>,
    #[serde(default)]
    equation_img_path: Option<String>,
    #[serde(default)]
    table_body: Option<String>,
    #[serde(default)]
    html_table: Option<String>,
}

impl DocElement {
    /// The bbox as a fixed quadruple, if present and well-formed.
    pub fn bbox4(&self) -> Option<[f64; 4]> {
        let b = self.bbox.as_ref()?;
        if b.len() != 4 {
            return None;
        }
        Some([b[0], b[1], b[2], b[3]])
    }

    /// Table HTML under either key the parser may emit.
    pub fn table_html(&self) -> Option<&str> {
        self.table_body
            .as_deref()
            .or(self.html_table.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Image file reference, under whichever of the kind-specific keys the
    /// parser used.
    pub fn image_path(&self) -> Option<&str> {
        [
            self.img_path.as_deref(),
            self.table_img_path.as_deref(),
            self.equation_img_path.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
    }

    /// True for kinds placed as pictures.
    pub fn is_imagelike(&self) -> bool {
        matches!(self.kind.as_str(), "image" | "equation")
    }
}

/// Parse a content-list file into its elements.
pub(crate) fn parse_content_list(path: &Path) -> Result<Vec<DocElement>, EngineError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::DeckBuild(format!("reading {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| EngineError::DeckBuild(format!("parsing {}: {e}", path.display())))
}

/// First content-list file in `dir`, in name order.
pub(crate) fn find_content_list(dir: &Path) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CONTENT_LIST_SUFFIX))
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// The document stem a content-list file belongs to.
pub(crate) fn base_stem(content_list: &Path) -> String {
    content_list
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(CONTENT_LIST_SUFFIX))
        .unwrap_or_default()
        .to_string()
}

/// Page dimensions recorded in `layout.json` (`pdf_info[0].page_size`),
/// if the file exists and carries a positive pair.
pub(crate) fn read_page_size(layout_json: &Path) -> Option<(f64, f64)> {
    let text = std::fs::read_to_string(layout_json).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unreadable {}: {e}", layout_json.display());
            return None;
        }
    };
    let size = value.get("pdf_info")?.get(0)?.get("page_size")?;
    let width = size.get(0)?.as_f64()?;
    let height = size.get(1)?.as_f64()?;
    if width > 0.0 && height > 0.0 {
        Some((width, height))
    } else {
        None
    }
}

/// Fall back to the furthest bbox extent when no page size is recorded.
pub(crate) fn infer_page_dimensions(elements: &[DocElement]) -> Option<(f64, f64)> {
    let mut max_x = 0.0_f64;
    let mut max_y = 0.0_f64;
    for element in elements {
        if let Some([_, _, x1, y1]) = element.bbox4() {
            max_x = max_x.max(x1);
            max_y = max_y.max(y1);
        }
    }
    if max_x > 0.0 && max_y > 0.0 {
        Some((max_x, max_y))
    } else {
        None
    }
}

/// Locate the most recent parsed-layout directory under `root`.
///
/// Walks the tree for content-list files and scores each by modification
/// time, with a one-second bonus for paths that pass through an `auto`
/// component (the parser's full-pipeline output, preferred over partial
/// modes). Returns the winning file's parent directory.
pub fn find_parsed_layout_dir(root: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    collect_content_lists(root, &mut candidates);
    let best = candidates
        .into_iter()
        .filter_map(|path| {
            let mtime = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()?
                .duration_since(UNIX_EPOCH)
                .ok()?
                .as_secs_f64();
            let bonus = if path.components().any(|c| c.as_os_str() == "auto") {
                1.0
            } else {
                0.0
            };
            Some((path, mtime + bonus))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    debug!("Parsed layout found at {}", best.0.display());
    best.0.parent().map(Path::to_path_buf)
}

fn collect_content_lists(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_content_lists(&path, out);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(CONTENT_LIST_SUFFIX))
        {
            out.push(path);
        }
    }
}

/// Find `{stem}{ext}` near `dir`, checking the directory itself, its parent
/// and its grandparent. Parsers commonly nest results two levels below the
/// source document.
pub(crate) fn find_source_file(dir: &Path, stem: &str, extensions: &[&str]) -> Option<PathBuf> {
    let mut search_dirs = vec![dir.to_path_buf()];
    if let Some(parent) = dir.parent() {
        search_dirs.push(parent.to_path_buf());
        if let Some(grandparent) = parent.parent() {
            search_dirs.push(grandparent.to_path_buf());
        }
    }
    for base in &search_dirs {
        for ext in extensions {
            let candidate = base.join(format!("{stem}{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolve an element's `img_path` against the layout directory.
///
/// Tried in order: the raw path as given, relative to the directory, under
/// the directory's `images/` folder by file name, and directly in the
/// directory by file name.
pub(crate) fn resolve_image_path(dir: &Path, raw: &str) -> Option<PathBuf> {
    let raw_path = PathBuf::from(raw);
    let name = raw_path.file_name().map(PathBuf::from)?;
    let candidates = [
        raw_path.clone(),
        dir.join(&raw_path),
        dir.join("images").join(&name),
        dir.join(&name),
    ];
    candidates.into_iter().find(|c| c.is_file())
}
