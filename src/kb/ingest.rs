//! Ingest engine for lexrag
//! parse -> segment -> embed -> persist, each stage timed and gated.
//! Re-ingesting identical content short-circuits via the (kb_id, sha256) key.

use std::path::Path;
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    now_rfc3339, Database, DbError, DocumentRecord, IngestStatus, KnowledgeBase, KnowledgeFile,
    NodeRecord, NodeVectorMap,
};
use crate::gate::{aggregate, GateCheck, GateReport, Stage};
use crate::kb::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::kb::pdf::{PdfError, PdfExtractor};
use crate::kb::segment::{segment_pages, SegmentConfig, SEGMENT_VERSION};
use crate::kb::vectors::{VectorEntry, VectorError, VectorPayload, VectorStore};
use crate::validation::ValidationError;
use crate::CancelFlag;

/// Parser identifier recorded on documents for replay
pub const PARSE_VERSION: &str = "parse.v1";

/// Texts per embedding batch
const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),
    #[error("Knowledge base not found: {0}")]
    KbNotFound(String),
    #[error("Unsupported parser: {0}")]
    UnsupportedParser(String),
    #[error("Ingest cancelled")]
    Cancelled,
}

/// Enumerated parser choice (non-OCR only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Pdfium,
    Markdown,
    PlainText,
}

impl ParserKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdfium => "pdfium",
            Self::Markdown => "markdown",
            Self::PlainText => "plaintext",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pdfium" | "pdf" => Some(Self::Pdfium),
            "markdown" | "md" => Some(Self::Markdown),
            "plaintext" | "text" | "txt" => Some(Self::PlainText),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(Self::Pdfium),
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::PlainText),
            _ => None,
        }
    }
}

/// Per-request ingest options. Unset values fall back to the KB configuration.
#[derive(Debug, Clone, Default)]
pub struct IngestProfile {
    pub parser: Option<ParserKind>,
    pub window: Option<usize>,
    pub min_chars: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub kb_id: String,
    pub source_path: std::path::PathBuf,
    pub file_name: String,
    pub force: bool,
    pub dry_run: bool,
    pub profile: IngestProfile,
}

/// Result envelope for one ingest run
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub file_id: String,
    pub document_id: Option<String>,
    pub ingest_status: IngestStatus,
    pub pages: usize,
    pub node_count: usize,
    pub timing_ms: serde_json::Value,
    pub gate: GateReport,
    /// True when the (kb_id, sha256) key matched an existing success
    pub short_circuited: bool,
}

/// SHA-256 of file contents, the idempotency key within a KB
pub fn file_sha256(path: &Path) -> Result<String, IngestError> {
    let content = std::fs::read(path)?;
    let hash = Sha256::digest(&content);
    Ok(format!("{:x}", hash))
}

/// Run the full ingest pipeline for one source file.
///
/// On stage failure the file row ends `failed`; vectors written before a late
/// failure are reaped so the store never holds orphans for a failed file.
pub async fn ingest_file(
    db: &Database,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    request: &IngestRequest,
    cancel: &CancelFlag,
) -> Result<IngestOutcome, IngestError> {
    crate::validation::validate_source_path(&request.source_path)?;
    let kb = db
        .get_kb(&request.kb_id)?
        .ok_or_else(|| IngestError::KbNotFound(request.kb_id.clone()))?;

    let sha256 = file_sha256(&request.source_path)?;

    // Idempotency: identical content in this KB short-circuits unless forced
    if let Some(existing) = db.find_file_by_sha256(&kb.id, &sha256)? {
        if existing.ingest_status == IngestStatus::Success && !request.force {
            return Ok(IngestOutcome {
                file_id: existing.id,
                document_id: None,
                ingest_status: IngestStatus::Success,
                pages: existing.pages as usize,
                node_count: existing.node_count as usize,
                timing_ms: existing.timing_ms,
                gate: aggregate(
                    Stage::Ingest,
                    vec![GateCheck::pass(
                        "idempotent_short_circuit",
                        format!("sha256 {} already ingested", sha256),
                    )],
                ),
                short_circuited: true,
            });
        }
        // Forced or previously failed: drop the stale copy before re-ingesting
        if !request.dry_run {
            vectors.delete_by_file(&existing.id).await?;
            db.delete_file(&existing.id)?;
        }
    }

    let file_id = Uuid::new_v4().to_string();
    if !request.dry_run {
        db.insert_file(&KnowledgeFile {
            id: file_id.clone(),
            kb_id: kb.id.clone(),
            file_name: request.file_name.clone(),
            sha256: sha256.clone(),
            ingest_status: IngestStatus::Pending,
            pages: 0,
            node_count: 0,
            timing_ms: serde_json::json!({}),
            error_message: None,
            created_at: now_rfc3339(),
        })?;
    }

    match run_stages(db, vectors, embedder, request, &kb, &file_id, cancel).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if !request.dry_run {
                let reaped = vectors.delete_by_file(&file_id).await;
                if let Err(reap_err) = reaped {
                    tracing::warn!("Failed to reap vectors for {}: {}", file_id, reap_err);
                }
                db.mark_file_failed(&file_id, &e.to_string())?;
            }
            Err(e)
        }
    }
}

async fn run_stages(
    db: &Database,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    request: &IngestRequest,
    kb: &KnowledgeBase,
    file_id: &str,
    cancel: &CancelFlag,
) -> Result<IngestOutcome, IngestError> {
    // Parse
    let parse_started = Instant::now();
    let parser = resolve_parser(request)?;
    let pages = parse_source(&request.source_path, parser)?;
    let parse_ms = parse_started.elapsed().as_millis() as u64;

    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }

    // Segment
    let segment_started = Instant::now();
    let segment_config = SegmentConfig {
        window: request.profile.window.unwrap_or(kb.chunk_window),
        min_chars: request.profile.min_chars.unwrap_or(kb.min_node_chars),
        ..SegmentConfig::default()
    };
    let segmented = segment_pages(&pages, &segment_config);
    let segment_ms = segment_started.elapsed().as_millis() as u64;

    let mut checks = vec![];
    if segmented.nodes.is_empty() {
        checks.push(GateCheck::fail("nonempty_nodes", "no nodes after segmentation"));
        let gate = aggregate(Stage::Ingest, checks);
        if !request.dry_run {
            db.mark_file_failed(file_id, "no nodes after segmentation")?;
        }
        return Ok(IngestOutcome {
            file_id: file_id.to_string(),
            document_id: None,
            ingest_status: IngestStatus::Failed,
            pages: pages.len(),
            node_count: 0,
            timing_ms: serde_json::json!({"parse": parse_ms, "segment": segment_ms}),
            gate,
            short_circuited: false,
        });
    }
    checks.push(GateCheck::pass(
        "nonempty_nodes",
        format!("{} nodes", segmented.nodes.len()),
    ));

    let min_len_ok = segmented
        .nodes
        .iter()
        .all(|n| n.text.len() >= segment_config.min_chars);
    checks.push(if min_len_ok {
        GateCheck::pass("min_text_length", format!(">= {} chars", segment_config.min_chars))
    } else {
        GateCheck::fail("min_text_length", "node below minimum length")
    });

    if request.dry_run {
        let gate = aggregate(Stage::Ingest, checks);
        return Ok(IngestOutcome {
            file_id: file_id.to_string(),
            document_id: None,
            ingest_status: IngestStatus::Pending,
            pages: pages.len(),
            node_count: segmented.nodes.len(),
            timing_ms: serde_json::json!({"parse": parse_ms, "segment": segment_ms}),
            gate,
            short_circuited: false,
        });
    }

    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }

    // Embed
    let embed_started = Instant::now();
    let texts: Vec<String> = segmented.nodes.iter().map(|n| n.text.clone()).collect();
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH_SIZE) {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        embeddings.extend(embedder.embed_batch(batch).await?);
    }
    let embed_ms = embed_started.elapsed().as_millis() as u64;

    // Assemble records
    let document_id = Uuid::new_v4().to_string();
    let mut nodes = Vec::with_capacity(segmented.nodes.len());
    let mut maps = Vec::with_capacity(segmented.nodes.len());
    let mut entries = Vec::with_capacity(segmented.nodes.len());

    for (index, (segment, embedding)) in segmented
        .nodes
        .iter()
        .zip(embeddings.into_iter())
        .enumerate()
    {
        let node_id = Uuid::new_v4().to_string();
        let vector_id = Uuid::new_v4().to_string();
        nodes.push(NodeRecord {
            id: node_id.clone(),
            kb_id: kb.id.clone(),
            file_id: file_id.to_string(),
            document_id: document_id.clone(),
            node_index: index as i64,
            text: segment.text.clone(),
            page: segment.page,
            article_id: segment.article_id.clone(),
            section_path: segment.section_path.clone(),
            start_offset: Some(segment.start_offset),
            end_offset: Some(segment.end_offset),
            meta: serde_json::json!({
                "segment_version": SEGMENT_VERSION,
                "window": segment_config.window,
            }),
        });
        maps.push(NodeVectorMap {
            node_id: node_id.clone(),
            vector_id: vector_id.clone(),
            kb_id: kb.id.clone(),
        });
        entries.push(VectorEntry {
            payload: VectorPayload {
                vector_id,
                node_id,
                kb_id: kb.id.clone(),
                file_id: file_id.to_string(),
                document_id: document_id.clone(),
                page: segment.page,
                article_id: segment.article_id.clone().unwrap_or_default(),
                section_path: segment.section_path.clone().unwrap_or_default(),
            },
            embedding,
        });
    }

    checks.push(GateCheck::pass(
        "node_index_contiguous",
        format!("0..{}", nodes.len()),
    ));
    checks.push(if maps.len() == nodes.len() {
        GateCheck::pass("vector_count_matches", format!("{} vectors", maps.len()))
    } else {
        GateCheck::fail(
            "vector_count_matches",
            format!("{} vectors for {} nodes", maps.len(), nodes.len()),
        )
    });

    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }

    // Persist: vectors first, then the relational transaction. A relational
    // failure reaps the just-written vectors in the caller.
    let vector_started = Instant::now();
    vectors.insert(&entries).await?;
    let vector_ms = vector_started.elapsed().as_millis() as u64;

    let db_started = Instant::now();
    let timing = serde_json::json!({
        "parse": parse_ms,
        "segment": segment_ms,
        "embed": embed_ms,
        "vector": vector_ms,
        "db": 0u64,
    });
    let document = DocumentRecord {
        id: document_id.clone(),
        kb_id: kb.id.clone(),
        file_id: file_id.to_string(),
        title: segmented.title.clone(),
        page_count: pages.len() as i64,
        parser: parser.as_str().to_string(),
        parser_version: PARSE_VERSION.to_string(),
    };
    db.persist_ingest(&document, &nodes, &maps, &timing)?;
    let db_ms = db_started.elapsed().as_millis() as u64;

    let gate = aggregate(Stage::Ingest, checks);
    Ok(IngestOutcome {
        file_id: file_id.to_string(),
        document_id: Some(document_id),
        ingest_status: IngestStatus::Success,
        pages: pages.len(),
        node_count: nodes.len(),
        timing_ms: serde_json::json!({
            "parse": parse_ms,
            "segment": segment_ms,
            "embed": embed_ms,
            "vector": vector_ms,
            "db": db_ms,
        }),
        gate,
        short_circuited: false,
    })
}

fn resolve_parser(request: &IngestRequest) -> Result<ParserKind, IngestError> {
    if let Some(parser) = request.profile.parser {
        return Ok(parser);
    }
    let ext = request
        .source_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    ParserKind::from_extension(ext)
        .ok_or_else(|| IngestError::UnsupportedParser(ext.to_string()))
}

/// Parse a source into markdown text, one string per page. Markdown and plain
/// text sources are a single page.
fn parse_source(path: &Path, parser: ParserKind) -> Result<Vec<String>, IngestError> {
    match parser {
        ParserKind::Pdfium => {
            let extractor = PdfExtractor::new();
            Ok(extractor.extract_text(path)?)
        }
        ParserKind::Markdown | ParserKind::PlainText => {
            Ok(vec![std::fs::read_to_string(path)?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::kb::embeddings::HashEmbedder;
    use crate::kb::vectors::{VectorScope, VectorStoreConfig};

    const SAMPLE_MD: &str = r#"# Tenancy Law

## Article 9

The landlord and tenant must specify the rent value in the tenancy contract. It shall not be permissible to increase the rent before two years have passed from the date of the contract.

## Article 25

The landlord may demand eviction of the tenant prior to expiry of the tenancy period. The tenant must be notified through the notary public or by registered mail with twelve months notice.
"#;

    struct Fixture {
        db: Database,
        vectors: VectorStore,
        embedder: HashEmbedder,
        _dir: tempfile::TempDir,
        source: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.insert_kb(&KnowledgeBase {
            id: "kb-1".into(),
            name: "default".into(),
            vector_collection: "nodes".into(),
            embed_provider: "hash".into(),
            embed_model: "hash-v1".into(),
            embed_dim: 32,
            chunk_window: 2,
            min_node_chars: 24,
            created_at: now_rfc3339(),
        })
        .unwrap();

        let mut vectors = VectorStore::new(VectorStoreConfig {
            path: dir.path().join("vectors"),
            embedding_dim: 32,
            table_name: "nodes".into(),
        });
        vectors.init().await.unwrap();

        let source = dir.path().join("tenancy.md");
        std::fs::write(&source, SAMPLE_MD).unwrap();

        Fixture {
            db,
            vectors,
            embedder: HashEmbedder::new(32),
            _dir: dir,
            source,
        }
    }

    fn request(fx: &Fixture) -> IngestRequest {
        IngestRequest {
            kb_id: "kb-1".into(),
            source_path: fx.source.clone(),
            file_name: "tenancy.md".into(),
            force: false,
            dry_run: false,
            profile: IngestProfile::default(),
        }
    }

    #[tokio::test]
    async fn test_ingest_success_end_to_end() {
        let fx = fixture().await;
        let outcome = ingest_file(
            &fx.db,
            &fx.vectors,
            &fx.embedder,
            &request(&fx),
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.ingest_status, IngestStatus::Success);
        assert!(outcome.node_count > 0);
        assert!(outcome.gate.passed());
        assert!(!outcome.short_circuited);

        // Invariants: node count matches vector maps, FTS finds the content
        let node_count = fx.db.count_nodes(&outcome.file_id).unwrap();
        assert_eq!(node_count as usize, outcome.node_count);
        assert_eq!(
            fx.db.count_vector_maps(&outcome.file_id).unwrap(),
            node_count
        );
        assert_eq!(fx.vectors.count().await.unwrap(), outcome.node_count);

        let hits = fx
            .db
            .search_nodes_by_keyword("kb-1", "eviction notary", 10)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].file_id, outcome.file_id);

        // Timings cover every stage
        for key in ["parse", "segment", "embed", "vector", "db"] {
            assert!(outcome.timing_ms.get(key).is_some(), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_reingest_short_circuits() {
        let fx = fixture().await;
        let cancel = CancelFlag::new();
        let first = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &request(&fx), &cancel)
            .await
            .unwrap();
        let second = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &request(&fx), &cancel)
            .await
            .unwrap();

        assert!(second.short_circuited);
        assert_eq!(second.file_id, first.file_id);
        assert_eq!(second.node_count, first.node_count);
        // No duplicate nodes or vectors were written
        assert_eq!(
            fx.db.count_nodes(&first.file_id).unwrap() as usize,
            first.node_count
        );
        assert_eq!(fx.vectors.count().await.unwrap(), first.node_count);
    }

    #[tokio::test]
    async fn test_force_reingest_replaces_file() {
        let fx = fixture().await;
        let cancel = CancelFlag::new();
        let first = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &request(&fx), &cancel)
            .await
            .unwrap();

        let mut forced = request(&fx);
        forced.force = true;
        let second = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &forced, &cancel)
            .await
            .unwrap();

        assert!(!second.short_circuited);
        assert_ne!(second.file_id, first.file_id);
        // The old file's nodes and vectors are gone
        assert_eq!(fx.db.count_nodes(&first.file_id).unwrap(), 0);
        assert_eq!(fx.vectors.count().await.unwrap(), second.node_count);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let fx = fixture().await;
        let mut req = request(&fx);
        req.dry_run = true;
        let outcome = ingest_file(
            &fx.db,
            &fx.vectors,
            &fx.embedder,
            &req,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.ingest_status, IngestStatus::Pending);
        assert!(outcome.node_count > 0);
        assert!(fx.db.get_file(&outcome.file_id).unwrap().is_none());
        assert_eq!(fx.vectors.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_ingest_marks_file_failed() {
        let fx = fixture().await;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &request(&fx), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));

        let sha = file_sha256(&fx.source).unwrap();
        let file = fx.db.find_file_by_sha256("kb-1", &sha).unwrap().unwrap();
        assert_eq!(file.ingest_status, IngestStatus::Failed);
        assert_eq!(fx.vectors.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kb_rejected() {
        let fx = fixture().await;
        let mut req = request(&fx);
        req.kb_id = "missing".into();
        let err = ingest_file(
            &fx.db,
            &fx.vectors,
            &fx.embedder,
            &req,
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::KbNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_file_can_be_retried_without_force() {
        let fx = fixture().await;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let _ = ingest_file(&fx.db, &fx.vectors, &fx.embedder, &request(&fx), &cancel).await;

        // Same content, fresh request: the failed row must not short-circuit
        let outcome = ingest_file(
            &fx.db,
            &fx.vectors,
            &fx.embedder,
            &request(&fx),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.ingest_status, IngestStatus::Success);
    }

    #[tokio::test]
    async fn test_vectors_scoped_to_kb_after_ingest() {
        let fx = fixture().await;
        let outcome = ingest_file(
            &fx.db,
            &fx.vectors,
            &fx.embedder,
            &request(&fx),
            &CancelFlag::new(),
        )
        .await
        .unwrap();

        let query = fx
            .embedder
            .embed_batch(&["rent increase".to_string()])
            .await
            .unwrap();
        let hits = fx
            .vectors
            .search(&VectorScope::kb("kb-1"), &query[0], 5)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.file_id == outcome.file_id));

        let other = fx
            .vectors
            .search(&VectorScope::kb("kb-other"), &query[0], 5)
            .await
            .unwrap();
        assert!(other.is_empty());
    }
}
