//! Content-addressed result cache with cross-process locking.
//!
//! ## Why content addressing?
//!
//! Generation is expensive (minutes of model calls), while requests repeat:
//! the same document is uploaded again, a browser retries, two users share a
//! paper. Keying a cache directory by a digest of `(input bytes, options)`
//! makes re-runs instant and lets the checkpointed pipeline resume inside the
//! same directory after a partial failure.
//!
//! ## Locking model
//!
//! Each entry owns a `.lock` file. A request takes a **blocking** exclusive
//! advisory lock before touching the entry, so identical concurrent requests
//! queue instead of duplicating work: the second caller wakes up, finds the
//! finished run, and returns it as a hit. Eviction only ever takes
//! **non-blocking** locks, so it can never stall a caller or delete an entry
//! that is mid-run.

use crate::checkpoint::{self, write_bytes_atomic, ProjectPaths};
use crate::config::{EngineConfig, GenerationConfig};
use crate::error::EngineError;
use crate::pipeline::Stage;
use sha2::{Digest, Sha256};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Output image extensions recognised when collecting results.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];

/// Editable decks in descending order of preference.
const DECK_CANDIDATES: &[&str] = &[
    "slides_editable_assets.pptx",
    "slides_editable.pptx",
    "slides.pptx",
];

const FALLBACK_FILE_NAME: &str = "input.bin";

// ── Input naming & keys ──────────────────────────────────────────────────

/// One uploaded document: the caller-supplied name plus its raw bytes.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// The sanitized name actually used on disk and in the cache key.
    pub fn safe_name(&self) -> String {
        sanitize_file_name(&self.name, FALLBACK_FILE_NAME)
    }
}

/// Reduce an untrusted file name to a safe directory-entry stem.
///
/// Keeps ASCII alphanumerics plus `.`, `_` and `-`; everything else becomes
/// `_`. Leading underscores and dots are stripped so the result can never be
/// hidden or escape upward. Empty results fall back to `fallback`.
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['_', '.']);
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Project name for checkpoint directories, derived from the input location.
///
/// A single file contributes its stem, a directory its name. The result is
/// sanitized the same way as uploaded file names so the project directory is
/// always a plain path component.
pub fn project_name_for(input_path: &Path) -> String {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    sanitize_file_name(stem, "document")
}

/// Stable, content-addressed key for a set of input files plus options.
///
/// Files are normalised by sorting on sanitized name, so upload order never
/// changes the key. Options are serialised with sorted keys (serde_json maps
/// are ordered), so two equal configurations always encode identically. The
/// digest is truncated to 32 hex chars: collision odds are negligible and the
/// shorter name keeps cache paths readable.
pub fn compute_cache_key(files: &[InputFile], options: &serde_json::Value) -> String {
    let mut pairs: Vec<(String, &[u8])> = files
        .iter()
        .map(|f| (f.safe_name(), f.bytes.as_slice()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut digest = Sha256::new();
    for (name, blob) in &pairs {
        digest.update(name.as_bytes());
        digest.update(b"\0");
        digest.update(blob);
    }
    digest.update(b"\0options\0");
    digest.update(options.to_string().as_bytes());

    let mut key = hex::encode(digest.finalize());
    key.truncate(32);
    key
}

// ── Results ──────────────────────────────────────────────────────────────

/// One collected output image, named by its path relative to the run
/// directory (slide images sit at the top level, bundle assets below it).
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything a finished generation hands back to the caller.
///
/// Contents are owned bytes rather than paths: in ephemeral mode the backing
/// directory is deleted before this struct is returned.
#[derive(Debug, Default)]
pub struct SlideOutputs {
    /// Slide images plus any extracted bundle assets, sorted
    /// case-insensitively by relative path.
    pub images: Vec<OutputImage>,
    /// Combined `slides.pdf`, when more than one slide was produced.
    pub pdf: Option<Vec<u8>>,
    /// Best available deck (asset-based editable, editable, then plain).
    pub deck: Option<Vec<u8>>,
    /// Cache entry key; `None` when the run was ephemeral.
    pub cache_key: Option<String>,
    /// True when a completed prior run was returned without re-running.
    pub cache_hit: bool,
}

// ── Store ────────────────────────────────────────────────────────────────

/// Directory-backed cache of generation runs.
///
/// With no configured root every request runs in a temp directory that is
/// removed afterwards regardless of outcome.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Option<PathBuf>,
    max_items: usize,
}

impl CacheStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            root: config.cache_root.clone(),
            max_items: config.cache_max_items,
        }
    }

    /// Run `run` for the given inputs, serialised per cache entry, reusing a
    /// completed prior run when one exists.
    ///
    /// `run` receives the request with `input_path` and `project` rebound to
    /// the materialised inputs, plus the outputs root it must write under.
    /// The request's own `input_path`/`project` never influence the key.
    pub async fn run_cached<F, Fut>(
        &self,
        files: &[InputFile],
        request: &GenerationConfig,
        run: F,
    ) -> Result<SlideOutputs, EngineError>
    where
        F: FnOnce(GenerationConfig, PathBuf) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        if files.is_empty() {
            return Err(EngineError::InvalidRequest(
                "no input files provided".into(),
            ));
        }

        let Some(root) = self.root.clone() else {
            return self.run_ephemeral(files, request, run).await;
        };

        let key = compute_cache_key(files, &request.cache_options());
        let entry_dir = root.join(&key);
        let inputs_dir = entry_dir.join("inputs");
        let outputs_root = entry_dir.join("outputs");
        let lock_path = entry_dir.join(".lock");

        fs::create_dir_all(&outputs_root).map_err(|source| EngineError::CacheIo {
            path: outputs_root.clone(),
            source,
        })?;

        // Evict before locking: candidates never include this entry, and a
        // held lock elsewhere just skips that candidate.
        let guard = {
            let root = root.clone();
            let key = key.clone();
            let max_items = self.max_items;
            let lock_path = lock_path.clone();
            tokio::task::spawn_blocking(move || -> Result<EntryLock, EngineError> {
                evict_over_capacity(&root, max_items, &key);
                EntryLock::acquire(&lock_path)
            })
            .await
            .map_err(|e| EngineError::Internal(format!("lock task failed: {e}")))??
        };

        let input_path = write_inputs(&inputs_dir, files)?;
        let mut config = request.clone();
        config.project = project_name_for(&input_path);
        config.input_path = input_path;

        let paths = ProjectPaths::new(&outputs_root, &config);
        if let Some(run_dir) = completed_run_dir(&paths) {
            info!("Cache hit for {key}");
            let mut outputs = collect_outputs(&run_dir)?;
            outputs.cache_key = Some(key);
            outputs.cache_hit = true;
            drop(guard);
            return Ok(outputs);
        }

        debug!("Cache miss for {key}, running pipeline");
        let result = run(config, outputs_root.clone()).await;
        let outcome = self.finish_run(result, &paths).map(|mut outputs| {
            outputs.cache_key = Some(key);
            outputs
        });
        drop(guard);
        outcome
    }

    async fn run_ephemeral<F, Fut>(
        &self,
        files: &[InputFile],
        request: &GenerationConfig,
        run: F,
    ) -> Result<SlideOutputs, EngineError>
    where
        F: FnOnce(GenerationConfig, PathBuf) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let temp = tempfile::Builder::new()
            .prefix("slideforge-")
            .tempdir()
            .map_err(|source| EngineError::CacheIo {
                path: std::env::temp_dir(),
                source,
            })?;

        let input_path = write_inputs(&temp.path().join("inputs"), files)?;
        let outputs_root = temp.path().join("outputs");
        fs::create_dir_all(&outputs_root).map_err(|source| EngineError::CacheIo {
            path: outputs_root.clone(),
            source,
        })?;

        let mut config = request.clone();
        config.project = project_name_for(&input_path);
        config.input_path = input_path;

        let paths = ProjectPaths::new(&outputs_root, &config);
        let result = run(config, outputs_root.clone()).await;
        // `temp` drops after collection, deleting the directory either way.
        self.finish_run(result, &paths)
    }

    /// Surface a stored stage failure with its context, then collect the
    /// latest run's outputs.
    fn finish_run(
        &self,
        result: Result<(), EngineError>,
        paths: &ProjectPaths,
    ) -> Result<SlideOutputs, EngineError> {
        let stored = checkpoint::load_state(paths).ok().flatten();
        if let Some(state) = &stored {
            if let Some((stage, detail)) = state.first_failure() {
                return Err(EngineError::StageFailed {
                    stage: stage.as_str().to_string(),
                    detail,
                });
            }
        }
        result?;

        let run_dir = paths
            .latest_run_dir()
            .ok_or_else(|| EngineError::Internal("pipeline produced no run directory".into()))?;
        let outputs = collect_outputs(&run_dir)?;
        if outputs.images.is_empty() && outputs.pdf.is_none() && outputs.deck.is_none() {
            return Err(EngineError::Internal(
                "pipeline finished but produced no outputs".into(),
            ));
        }
        Ok(outputs)
    }
}

/// The latest run directory of a fully completed prior run, if any.
///
/// Unreadable or corrupt state reads as "no hit"; the pipeline rewrites it.
fn completed_run_dir(paths: &ProjectPaths) -> Option<PathBuf> {
    let state = checkpoint::load_state(paths).ok().flatten()?;
    let complete = Stage::all()
        .iter()
        .all(|s| state.status(*s) == checkpoint::StageStatus::Completed);
    if !complete {
        return None;
    }
    let run_dir = paths.latest_run_dir()?;
    // A run without a single image is not worth returning.
    match list_images(&run_dir) {
        Ok(images) if !images.is_empty() => Some(run_dir),
        _ => None,
    }
}

/// Materialise inputs under `inputs_dir`; returns the path the pipeline
/// should treat as its document (the file itself for a single upload, the
/// directory for a batch).
fn write_inputs(inputs_dir: &Path, files: &[InputFile]) -> Result<PathBuf, EngineError> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let target = inputs_dir.join(file.safe_name());
        write_bytes_atomic(&target, &file.bytes)?;
        written.push(target);
    }
    if written.len() == 1 {
        Ok(written.remove(0))
    } else {
        Ok(inputs_dir.to_path_buf())
    }
}

// ── Entry locking ────────────────────────────────────────────────────────

/// Exclusive advisory lock on a cache entry, released on drop.
struct EntryLock {
    file: fs::File,
}

impl EntryLock {
    /// Block until the entry's lock is held.
    fn acquire(lock_path: &Path) -> Result<Self, EngineError> {
        let file = open_lock_file(lock_path)?;
        fs2::FileExt::lock_exclusive(&file).map_err(|source| EngineError::LockFailed {
            path: lock_path.to_path_buf(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn open_lock_file(lock_path: &Path) -> Result<fs::File, EngineError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|source| EngineError::CacheIo {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(lock_path)
        .map_err(|source| EngineError::LockFailed {
            path: lock_path.to_path_buf(),
            source,
        })
}

/// Non-blocking probe used only by eviction. `None` means the entry is busy.
fn try_lock_entry(lock_path: &Path) -> Option<fs::File> {
    let file = open_lock_file(lock_path).ok()?;
    fs2::FileExt::try_lock_exclusive(&file).ok()?;
    Some(file)
}

// ── Eviction ─────────────────────────────────────────────────────────────

/// Delete oldest-by-mtime entries beyond `max_items`, skipping the current
/// request's entry and anything whose lock is held. Best effort throughout;
/// nothing here may fail the caller.
fn evict_over_capacity(root: &Path, max_items: usize, current_key: &str) {
    if max_items == 0 {
        return;
    }
    let Ok(dir) = fs::read_dir(root) else {
        return;
    };

    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name == current_key {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((path, mtime));
    }

    if entries.len() <= max_items {
        return;
    }
    entries.sort_by_key(|(_, mtime)| *mtime);
    let excess = entries.len() - max_items;

    let mut removed = 0usize;
    for (path, _) in entries.into_iter().take(excess) {
        let lock_path = path.join(".lock");
        let Some(lock) = try_lock_entry(&lock_path) else {
            debug!("Skipping eviction of busy entry {}", path.display());
            continue;
        };
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!("Failed to evict {}: {e}", path.display());
        } else {
            removed += 1;
        }
        let _ = fs2::FileExt::unlock(&lock);
    }
    if removed > 0 {
        debug!("Evicted {removed} cache entries from {}", root.display());
    }
}

// ── Output collection ────────────────────────────────────────────────────

/// Gather a run directory's images, PDF and best deck into owned bytes.
fn collect_outputs(run_dir: &Path) -> Result<SlideOutputs, EngineError> {
    let read = |path: &Path| -> Result<Vec<u8>, EngineError> {
        fs::read(path).map_err(|source| EngineError::CacheIo {
            path: path.to_path_buf(),
            source,
        })
    };

    let mut outputs = SlideOutputs::default();

    let pdf_path = run_dir.join("slides.pdf");
    if pdf_path.is_file() {
        outputs.pdf = Some(read(&pdf_path)?);
    }
    for candidate in DECK_CANDIDATES {
        let path = run_dir.join(candidate);
        if path.is_file() {
            outputs.deck = Some(read(&path)?);
            break;
        }
    }

    for path in list_images(run_dir)? {
        let name = path
            .strip_prefix(run_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        outputs.images.push(OutputImage {
            name,
            bytes: read(&path)?,
        });
    }
    Ok(outputs)
}

/// All image files under `run_dir`, recursively, sorted case-insensitively.
fn list_images(run_dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut images = Vec::new();
    let mut stack = vec![run_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| EngineError::CacheIo {
            path: dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_image(&path) {
                images.push(path);
            }
        }
    }
    images.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{save_state, PipelineState, StageStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_at(root: &Path) -> CacheStore {
        let config = EngineConfig::builder()
            .cache_root(root)
            .build()
            .expect("config");
        CacheStore::new(&config)
    }

    fn sample_files() -> Vec<InputFile> {
        vec![
            InputFile::new("paper.pdf", b"alpha".to_vec()),
            InputFile::new("notes.md", b"beta".to_vec()),
        ]
    }

    /// Pretend a pipeline ran: all stages completed, one slide image.
    fn fake_completed_run(config: &GenerationConfig, outputs_root: &Path) {
        let paths = ProjectPaths::new(outputs_root, config);
        let mut state = PipelineState::new(config.clone());
        for stage in Stage::all() {
            state.set_status(*stage, StageStatus::Completed);
        }
        save_state(&paths, &mut state).expect("state");

        let run_dir = paths.config_dir().join("20250101_120000");
        fs::create_dir_all(&run_dir).expect("run dir");
        fs::write(run_dir.join("slide_01.png"), b"png-bytes").expect("image");
        fs::write(run_dir.join("slides.pdf"), b"pdf-bytes").expect("pdf");
        fs::write(run_dir.join("slides.pptx"), b"plain-deck").expect("deck");
        fs::write(run_dir.join("slides_editable.pptx"), b"editable-deck").expect("deck");
    }

    #[test]
    fn sanitize_replaces_and_strips() {
        assert_eq!(sanitize_file_name("my report.pdf", "x"), "my_report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd", "x"), "etc_passwd");
        assert_eq!(sanitize_file_name("___", "fallback.bin"), "fallback.bin");
        assert_eq!(sanitize_file_name("", "fallback.bin"), "fallback.bin");
    }

    #[test]
    fn cache_key_ignores_file_order() {
        let options = GenerationConfig::new("p", "/tmp/p.pdf").cache_options();
        let mut files = sample_files();
        let key_a = compute_cache_key(&files, &options);
        files.reverse();
        let key_b = compute_cache_key(&files, &options);
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.len(), 32);
        assert!(key_a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_key_changes_with_bytes_and_options() {
        let config = GenerationConfig::new("p", "/tmp/p.pdf");
        let files = sample_files();
        let base = compute_cache_key(&files, &config.cache_options());

        let mut changed = sample_files();
        changed[0].bytes[0] ^= 1;
        assert_ne!(base, compute_cache_key(&changed, &config.cache_options()));

        let mut fast = config.clone();
        fast.fast_mode = true;
        assert_ne!(base, compute_cache_key(&files, &fast.cache_options()));
    }

    #[test]
    fn cache_key_ignores_volatile_fields() {
        let files = sample_files();
        let config = GenerationConfig::new("p", "/tmp/p.pdf");
        let mut renamed = config.clone();
        renamed.project = "other".into();
        renamed.input_path = "/elsewhere/p.pdf".into();
        renamed.session_id = Some("session-9".into());
        assert_eq!(
            compute_cache_key(&files, &config.cache_options()),
            compute_cache_key(&files, &renamed.cache_options()),
        );
    }

    #[tokio::test]
    async fn miss_then_hit_runs_pipeline_once() {
        let root = TempDir::new().expect("tempdir");
        let store = store_at(root.path());
        let request = GenerationConfig::new("demo", "/ignored.pdf");
        let files = sample_files();
        let runs = Arc::new(AtomicUsize::new(0));

        for expect_hit in [false, true] {
            let runs = runs.clone();
            let outputs = store
                .run_cached(&files, &request, |config, outputs_root| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    fake_completed_run(&config, &outputs_root);
                    Ok(())
                })
                .await
                .expect("run");
            assert_eq!(outputs.cache_hit, expect_hit);
            assert_eq!(outputs.images.len(), 1);
            assert_eq!(outputs.images[0].name, "slide_01.png");
            assert_eq!(outputs.pdf.as_deref(), Some(&b"pdf-bytes"[..]));
            // Editable deck outranks the plain one.
            assert_eq!(outputs.deck.as_deref(), Some(&b"editable-deck"[..]));
            assert!(outputs.cache_key.is_some());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_identical_requests_execute_once() {
        let root = TempDir::new().expect("tempdir");
        let store = store_at(root.path());
        let request = GenerationConfig::new("demo", "/ignored.pdf");
        let files = sample_files();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = |runs: Arc<AtomicUsize>| {
            let store = store.clone();
            let request = request.clone();
            let files = files.clone();
            async move {
                store
                    .run_cached(&files, &request, |config, outputs_root| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        fake_completed_run(&config, &outputs_root);
                        Ok(())
                    })
                    .await
            }
        };

        let (a, b) = tokio::join!(task(runs.clone()), task(runs.clone()));
        let (a, b) = (a.expect("first"), b.expect("second"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Exactly one of the two observed the populated cache.
        assert!(a.cache_hit != b.cache_hit);
    }

    #[tokio::test]
    async fn changed_byte_gets_a_fresh_entry() {
        let root = TempDir::new().expect("tempdir");
        let store = store_at(root.path());
        let request = GenerationConfig::new("demo", "/ignored.pdf");
        let runs = Arc::new(AtomicUsize::new(0));

        let mut keys = Vec::new();
        for bytes in [b"alpha".to_vec(), b"alphb".to_vec()] {
            let files = vec![InputFile::new("paper.pdf", bytes)];
            let runs = runs.clone();
            let outputs = store
                .run_cached(&files, &request, |config, outputs_root| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    fake_completed_run(&config, &outputs_root);
                    Ok(())
                })
                .await
                .expect("run");
            keys.push(outputs.cache_key.expect("key"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn stored_failure_is_surfaced_with_stage_context() {
        let root = TempDir::new().expect("tempdir");
        let store = store_at(root.path());
        let request = GenerationConfig::new("demo", "/ignored.pdf");
        let files = sample_files();

        let err = store
            .run_cached(&files, &request, |config, outputs_root| async move {
                let paths = ProjectPaths::new(&outputs_root, &config);
                let mut state = PipelineState::new(config.clone());
                state.set_status(Stage::Plan, StageStatus::Failed);
                state.error = Some("model returned garbage".into());
                save_state(&paths, &mut state)?;
                Ok(())
            })
            .await
            .expect_err("failure must surface");
        assert_eq!(
            err.to_string(),
            "stage \"plan\" failed: model returned garbage"
        );
    }

    #[tokio::test]
    async fn eviction_keeps_capacity_and_current_entry() {
        let root = TempDir::new().expect("tempdir");
        let config = EngineConfig::builder()
            .cache_root(root.path())
            .cache_max_items(1)
            .build()
            .expect("config");
        let store = CacheStore::new(&config);
        let request = GenerationConfig::new("demo", "/ignored.pdf");

        // Two stale entries, neither locked.
        for name in ["0ld000000000000000000000000000a1", "0ld000000000000000000000000000a2"] {
            fs::create_dir_all(root.path().join(name).join("outputs")).expect("stale entry");
        }

        let outputs = store
            .run_cached(&sample_files(), &request, |config, outputs_root| async move {
                fake_completed_run(&config, &outputs_root);
                Ok(())
            })
            .await
            .expect("run");
        let key = outputs.cache_key.expect("key");

        let remaining: Vec<String> = fs::read_dir(root.path())
            .expect("read root")
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(remaining.contains(&key));
        // One stale entry survives at capacity 1; the other was evicted.
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn busy_entries_are_never_evicted() {
        let root = TempDir::new().expect("tempdir");
        let busy = root.path().join("busy0000000000000000000000000001");
        fs::create_dir_all(&busy).expect("entry");
        let lock = EntryLock::acquire(&busy.join(".lock")).expect("lock");
        // Created later, so `busy` is the oldest and the only eviction
        // candidate at capacity 1.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let idle = root.path().join("idle0000000000000000000000000002");
        fs::create_dir_all(&idle).expect("entry");

        evict_over_capacity(root.path(), 1, "other");
        assert!(busy.exists());
        assert!(idle.exists());
        drop(lock);

        // Unlocked, the same sweep removes it.
        evict_over_capacity(root.path(), 1, "other");
        assert!(!busy.exists());
        assert!(idle.exists());
    }

    #[tokio::test]
    async fn ephemeral_mode_cleans_up_and_returns_bytes() {
        let config = EngineConfig::builder().no_cache().build().expect("config");
        let store = CacheStore::new(&config);
        let request = GenerationConfig::new("demo", "/ignored.pdf");
        let seen_root: Arc<std::sync::Mutex<Option<PathBuf>>> = Arc::default();

        let outputs = {
            let seen_root = seen_root.clone();
            store
                .run_cached(&sample_files(), &request, |config, outputs_root| async move {
                    *seen_root.lock().unwrap() = Some(outputs_root.clone());
                    fake_completed_run(&config, &outputs_root);
                    Ok(())
                })
                .await
                .expect("run")
        };

        assert!(outputs.cache_key.is_none());
        assert!(!outputs.cache_hit);
        assert_eq!(outputs.images.len(), 1);
        let root = seen_root.lock().unwrap().clone().expect("observed root");
        assert!(!root.exists());
    }
}
