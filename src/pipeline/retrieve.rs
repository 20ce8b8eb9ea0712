//! Retrieve stage: index the document, then run the query set.
//!
//! Papers get a fixed, category-grouped query set tuned to how research
//! papers are structured. Other documents get an adaptive set: a few
//! overview queries first, then a model call that derives content queries
//! from the overview answers.

use crate::checkpoint;
use crate::error::EngineError;
use crate::layout::repair;
use crate::model::RetrievalMode;
use crate::pipeline::Pipeline;
use crate::prompts;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// How many content queries to derive from the overview of a non-paper
/// document.
const GENERAL_QUERY_COUNT: usize = 12;

/// Outcome of one retrieval query. Failures are soft: the summarize stage
/// works with whatever answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub mode: RetrievalMode,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted output of the retrieve stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveCheckpoint {
    /// Query results grouped by category (`content` for non-paper inputs).
    pub results: BTreeMap<String, Vec<QueryResult>>,
    /// Markdown files the retriever's parser produced, absolute paths.
    pub markdown_paths: Vec<String>,
    pub input_path: String,
    pub content_type: String,
}

pub async fn run(pipeline: &Pipeline) -> Result<(), EngineError> {
    let request = pipeline.request();
    let paths = pipeline.paths();

    let input = request.input_path.as_path();
    if !input.exists() {
        return Err(EngineError::Retrieval {
            context: "ingest".into(),
            detail: format!("input path {} does not exist", input.display()),
        });
    }

    let index_dir = paths.retrieval_index();
    let artifact_dir = paths.retrieval_output();
    for dir in [&index_dir, &artifact_dir] {
        fs::create_dir_all(dir).map_err(|source| EngineError::OutputWrite {
            path: dir.clone(),
            source,
        })?;
    }

    info!("Indexing {}", input.display());
    pipeline
        .retriever()
        .ingest(input, &index_dir, &artifact_dir)
        .await
        .map_err(|e| EngineError::Retrieval {
            context: "ingest".into(),
            detail: e.to_string(),
        })?;

    let markdown_paths = collect_markdown(&artifact_dir);
    if !markdown_paths.is_empty() {
        info!("Found {} parsed markdown file(s)", markdown_paths.len());
    }

    let content_type = request.content_type.as_str();
    info!("Running retrieval queries ({content_type})");
    let results = if request.content_type == crate::config::ContentType::Paper {
        run_paper_queries(pipeline).await
    } else {
        run_general_queries(pipeline).await?
    };

    let total: usize = results.values().map(Vec::len).sum();
    info!("Completed {total} queries");

    let checkpoint = RetrieveCheckpoint {
        results,
        markdown_paths,
        input_path: input.display().to_string(),
        content_type: content_type.to_string(),
    };
    checkpoint::write_json_atomic(&paths.retrieve_checkpoint(), &checkpoint)?;
    Ok(())
}

/// Run the fixed paper query set, grouped by category.
async fn run_paper_queries(pipeline: &Pipeline) -> BTreeMap<String, Vec<QueryResult>> {
    let jobs: Vec<(String, usize, String, RetrievalMode)> = prompts::paper_query_groups()
        .iter()
        .flat_map(|group| {
            group.queries.iter().enumerate().map(move |(idx, q)| {
                (group.category.to_string(), idx, q.to_string(), group.mode)
            })
        })
        .collect();

    let mut grouped: BTreeMap<String, Vec<(usize, QueryResult)>> = prompts::paper_query_groups()
        .iter()
        .map(|g| (g.category.to_string(), Vec::new()))
        .collect();

    let answered = batch_query(pipeline, jobs).await;
    for (category, idx, result) in answered {
        grouped.entry(category).or_default().push((idx, result));
    }

    grouped
        .into_iter()
        .map(|(category, mut results)| {
            results.sort_by_key(|(idx, _)| *idx);
            (category, results.into_iter().map(|(_, r)| r).collect())
        })
        .collect()
}

/// Overview first, then model-derived content queries.
async fn run_general_queries(
    pipeline: &Pipeline,
) -> Result<BTreeMap<String, Vec<QueryResult>>, EngineError> {
    info!("Getting document overview");
    let overview_jobs: Vec<(String, usize, String, RetrievalMode)> =
        prompts::GENERAL_OVERVIEW_QUERIES
            .iter()
            .enumerate()
            .map(|(idx, q)| ("overview".to_string(), idx, q.to_string(), RetrievalMode::Hybrid))
            .collect();
    let mut overview_results: Vec<(usize, QueryResult)> = batch_query(pipeline, overview_jobs)
        .await
        .into_iter()
        .map(|(_, idx, r)| (idx, r))
        .collect();
    overview_results.sort_by_key(|(idx, _)| *idx);

    let overview: String = overview_results
        .iter()
        .filter_map(|(_, r)| r.answer.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n");

    info!("Generating queries from overview");
    let queries = generate_content_queries(pipeline, &overview).await;

    info!("Executing {} queries", queries.len());
    let jobs: Vec<(String, usize, String, RetrievalMode)> = queries
        .into_iter()
        .enumerate()
        .map(|(idx, q)| ("content".to_string(), idx, q, RetrievalMode::Hybrid))
        .collect();
    let mut results: Vec<(usize, QueryResult)> = batch_query(pipeline, jobs)
        .await
        .into_iter()
        .map(|(_, idx, r)| (idx, r))
        .collect();
    results.sort_by_key(|(idx, _)| *idx);

    let mut grouped = BTreeMap::new();
    grouped.insert(
        "content".to_string(),
        results.into_iter().map(|(_, r)| r).collect(),
    );
    Ok(grouped)
}

/// Ask the model for document-specific queries; fall back to the overview
/// set when the output is unusable so retrieval still proceeds.
async fn generate_content_queries(pipeline: &Pipeline, overview: &str) -> Vec<String> {
    let prompt = prompts::general_query_gen_prompt(overview, GENERAL_QUERY_COUNT);
    let request = crate::model::TextRequest::new(prompt)
        .json()
        .with_max_tokens(pipeline.engine().plan_max_tokens);

    let fallback = || {
        prompts::GENERAL_OVERVIEW_QUERIES
            .iter()
            .map(|q| q.to_string())
            .collect::<Vec<_>>()
    };

    let raw = match pipeline.model().generate_text(request).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Query generation failed, using overview queries: {e}");
            return fallback();
        }
    };

    let queries: Vec<String> = repair::parse_candidates(&raw)
        .into_iter()
        .find_map(|value| {
            value.get("queries").and_then(|qs| {
                let list = qs.as_array()?;
                let parsed: Vec<String> = list
                    .iter()
                    .filter_map(|q| q.as_str())
                    .map(str::to_string)
                    .filter(|q| !q.trim().is_empty())
                    .collect();
                (!parsed.is_empty()).then_some(parsed)
            })
        })
        .unwrap_or_default();

    if queries.is_empty() {
        warn!("Query generation returned no usable queries, using overview queries");
        return fallback();
    }
    queries.into_iter().take(GENERAL_QUERY_COUNT).collect()
}

/// Run `(category, idx, query, mode)` jobs with bounded concurrency.
/// Output order is arbitrary; callers regroup and re-sort by index.
async fn batch_query(
    pipeline: &Pipeline,
    jobs: Vec<(String, usize, String, RetrievalMode)>,
) -> Vec<(String, usize, QueryResult)> {
    let concurrency = pipeline.engine().concurrency.max(1);
    stream::iter(jobs.into_iter().map(|(category, idx, query, mode)| {
        let retriever = Arc::clone(pipeline.retriever());
        async move {
            let result = match retriever.query(&query, mode).await {
                Ok(answer) => QueryResult {
                    query,
                    answer: Some(answer),
                    mode,
                    success: true,
                    error: None,
                },
                Err(e) => {
                    warn!("Query failed ({category}/{idx}): {e}");
                    QueryResult {
                        query,
                        answer: None,
                        mode,
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            (category, idx, result)
        }
    }))
    .buffer_unordered(concurrency)
    .collect()
    .await
}

/// All `.md` files under `dir`, recursively, sorted for determinism.
fn collect_markdown(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                found.push(path.display().to_string());
            }
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContentType, EngineConfig, GenerationConfig};
    use crate::model::{
        BoxError, GeneratedImage, ImageRequest, ModelClient, Retriever, TextRequest,
    };
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct CannedModel {
        text: String,
    }

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn generate_text(&self, _request: TextRequest) -> Result<String, BoxError> {
            Ok(self.text.clone())
        }

        async fn generate_image(&self, _request: ImageRequest) -> Result<GeneratedImage, BoxError> {
            Err("not used".into())
        }
    }

    /// Answers every query with `answer:<query>`; records queries seen.
    struct EchoRetriever {
        seen: Mutex<Vec<String>>,
    }

    impl EchoRetriever {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Retriever for EchoRetriever {
        async fn ingest(
            &self,
            _input: &Path,
            _index_dir: &Path,
            artifact_dir: &Path,
        ) -> Result<(), BoxError> {
            fs::create_dir_all(artifact_dir.join("parsed"))?;
            fs::write(artifact_dir.join("parsed/doc.md"), "# Parsed\n")?;
            Ok(())
        }

        async fn query(&self, query: &str, _mode: RetrievalMode) -> Result<String, BoxError> {
            self.seen.lock().unwrap().push(query.to_string());
            Ok(format!("answer:{query}"))
        }
    }

    fn pipeline_with(
        root: &Path,
        content_type: ContentType,
        model_text: &str,
    ) -> (Pipeline, PathBuf) {
        let input = root.join("doc.pdf");
        fs::write(&input, b"pdf").expect("input");
        let mut request = GenerationConfig::new("demo", &input);
        request.content_type = content_type;
        let pipeline = Pipeline::new(
            root,
            request,
            EngineConfig::default(),
            Arc::new(CannedModel {
                text: model_text.to_string(),
            }),
            Arc::new(EchoRetriever::new()),
        );
        (pipeline, input)
    }

    #[tokio::test]
    async fn paper_queries_are_grouped_and_ordered() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, input) = pipeline_with(root.path(), ContentType::Paper, "{}");

        run(&pipeline).await.expect("stage");

        let checkpoint: RetrieveCheckpoint =
            checkpoint::read_json(&pipeline.paths().retrieve_checkpoint())
                .expect("readable")
                .expect("written");
        assert_eq!(checkpoint.input_path, input.display().to_string());
        assert_eq!(checkpoint.content_type, "paper");
        assert_eq!(checkpoint.markdown_paths.len(), 1);

        for group in prompts::paper_query_groups() {
            let results = checkpoint
                .results
                .get(group.category)
                .unwrap_or_else(|| panic!("missing category {}", group.category));
            assert_eq!(results.len(), group.queries.len());
            // Concurrency must not scramble within-category order.
            for (result, query) in results.iter().zip(group.queries) {
                assert_eq!(result.query, *query);
                assert_eq!(result.answer.as_deref(), Some(format!("answer:{query}").as_str()));
                assert!(result.success);
            }
        }
    }

    #[tokio::test]
    async fn general_documents_use_generated_queries() {
        let root = TempDir::new().expect("tempdir");
        let generated = r#"{"queries": ["What is chapter one about?", "Who is the audience?"]}"#;
        let (pipeline, _) = pipeline_with(root.path(), ContentType::General, generated);

        run(&pipeline).await.expect("stage");

        let checkpoint: RetrieveCheckpoint =
            checkpoint::read_json(&pipeline.paths().retrieve_checkpoint())
                .expect("readable")
                .expect("written");
        let content = checkpoint.results.get("content").expect("content group");
        assert_eq!(content.len(), 2);
        assert_eq!(content[0].query, "What is chapter one about?");
    }

    #[tokio::test]
    async fn garbage_query_generation_falls_back_to_overview_set() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, _) = pipeline_with(root.path(), ContentType::General, "not json at all");

        run(&pipeline).await.expect("stage");

        let checkpoint: RetrieveCheckpoint =
            checkpoint::read_json(&pipeline.paths().retrieve_checkpoint())
                .expect("readable")
                .expect("written");
        let content = checkpoint.results.get("content").expect("content group");
        assert_eq!(content.len(), prompts::GENERAL_OVERVIEW_QUERIES.len());
    }

    #[tokio::test]
    async fn missing_input_fails_the_stage() {
        let root = TempDir::new().expect("tempdir");
        let request = GenerationConfig::new("demo", root.path().join("absent.pdf"));
        let pipeline = Pipeline::new(
            root.path(),
            request,
            EngineConfig::default(),
            Arc::new(CannedModel { text: String::new() }),
            Arc::new(EchoRetriever::new()),
        );
        let err = run(&pipeline).await.expect_err("must fail");
        assert!(matches!(err, EngineError::Retrieval { .. }));
    }
}
