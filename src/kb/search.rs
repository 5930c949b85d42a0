//! Hybrid retrieval engine for lexrag
//! Keyword (FTS5/BM25) and vector recall run in parallel, then fuse, then
//! optionally rerank. Every run persists a replayable record; the retrieval
//! gate decides whether generation may see the results.

use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    now_rfc3339, Database, DbError, HitSource, RetrievalHit, RetrievalRecord,
};
use crate::gate::{aggregate, GateCheck, GateReport, Stage};
use crate::kb::embeddings::{cosine_similarity, EmbeddingError, EmbeddingProvider};
use crate::kb::vectors::{VectorError, VectorScope, VectorStore, METRIC_TYPE};
use crate::llm::{ChatConfig, ChatMessage, ChatProvider};
use crate::CancelFlag;

/// Reciprocal Rank Fusion constant; higher values flatten rank differences
pub const RRF_K: f64 = 60.0;

/// Pinned BM25 normalization label recorded in score details
pub const BM25_NORMALIZER: &str = "abs_bm25";

const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Both recall stages failed: {0}")]
    BothRecallsFailed(String),
    #[error("Retrieval cancelled")]
    Cancelled,
}

/// Retrieval sub-stage a candidate was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStage {
    Keyword,
    Vector,
    Fusion,
    Rerank,
}

impl CandidateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::Fusion => "fusion",
            Self::Rerank => "rerank",
        }
    }
}

/// Universal intermediate across retrieval sub-stages. Mappable to a Node
/// (for prompt context) and to a RetrievalHit (for persistence).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Candidate {
    pub node_id: String,
    pub stage: CandidateStage,
    pub score: f64,
    pub score_details: serde_json::Value,
    pub excerpt: String,
    pub page: Option<i64>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    Union,
    Rrf,
    Weighted,
}

impl FusionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Union => "union",
            Self::Rrf => "rrf",
            Self::Weighted => "weighted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "union" => Some(Self::Union),
            "rrf" => Some(Self::Rrf),
            "weighted" => Some(Self::Weighted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategy {
    None,
    CrossEncoder,
    Llm,
}

impl RerankStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CrossEncoder => "cross_encoder",
            Self::Llm => "llm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "cross_encoder" => Some(Self::CrossEncoder),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

/// Per-request retrieval tuning. Zero on `vector_top_k` disables vector
/// recall entirely.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub keyword_top_k: usize,
    pub vector_top_k: usize,
    pub fusion_top_k: usize,
    pub rerank_top_k: usize,
    pub fusion_strategy: FusionStrategy,
    pub rerank_strategy: RerankStrategy,
    /// Model identity for the `llm` rerank strategy; recorded in score
    /// details. The `cross_encoder` strategy records the embedder's model.
    pub rerank_model: Option<String>,
    pub keyword_weight: f64,
    pub vector_weight: f64,
    pub rrf_k: f64,
    /// Persist keyword/vector stage hits beside the final ones
    pub persist_intermediate: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            keyword_top_k: 20,
            vector_top_k: 20,
            fusion_top_k: 10,
            rerank_top_k: 5,
            fusion_strategy: FusionStrategy::Rrf,
            rerank_strategy: RerankStrategy::None,
            rerank_model: None,
            keyword_weight: 0.5,
            vector_weight: 0.5,
            rrf_k: RRF_K,
            persist_intermediate: false,
        }
    }
}

/// Result of one retrieval run
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub record_id: String,
    pub candidates: Vec<Candidate>,
    pub hits: Vec<RetrievalHit>,
    pub gate: GateReport,
    pub provider_snapshot: serde_json::Value,
    pub timing_ms: serde_json::Value,
}

/// Execute the retrieval pipeline for one message and persist the record.
///
/// Weak queries (no searchable tokens) and empty recall both produce a gate
/// `fail`, but the record itself is still written so the refusal is
/// replayable. Cancellation before fusion completes persists nothing.
#[allow(clippy::too_many_arguments)]
pub async fn execute_retrieval(
    db: &Database,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    llm_reranker: Option<&dyn ChatProvider>,
    message_id: &str,
    kb_id: &str,
    query: &str,
    options: &RetrievalOptions,
    cancel: &CancelFlag,
) -> Result<RetrievalOutcome, SearchError> {
    let mut checks: Vec<GateCheck> = Vec::new();

    // Weak-query policy: nothing searchable means recall is skipped entirely
    if Database::fts_match_expr(query).is_none() {
        checks.push(GateCheck::fail("weak_query", "weak_query"));
        let gate = aggregate(Stage::Retrieval, checks);
        let (record, _) = persist_empty(db, embedder, message_id, kb_id, query, options, &json!({}))?;
        return Ok(RetrievalOutcome {
            record_id: record.id,
            candidates: vec![],
            hits: vec![],
            gate,
            provider_snapshot: record.provider_snapshot,
            timing_ms: record.timing_ms,
        });
    }
    checks.push(GateCheck::pass("weak_query", "query has searchable tokens"));

    // Parallel recall: keyword and vector fan out, joined before fusion
    let keyword_started = Instant::now();
    let keyword_future = async {
        db.search_nodes_by_keyword(kb_id, query, options.keyword_top_k)
            .map(keyword_candidates)
    };
    let vector_future = vector_recall(db, vectors, embedder, kb_id, query, options.vector_top_k);
    let (keyword_result, vector_result) = tokio::join!(keyword_future, vector_future);
    let recall_ms = keyword_started.elapsed().as_millis() as u64;

    if cancel.is_cancelled() {
        return Err(SearchError::Cancelled);
    }

    // Single-side failure degrades; double failure is an external error
    let (keyword_cands, vector_cands) = match (keyword_result, vector_result) {
        (Ok(k), Ok(v)) => (k, v),
        (Ok(k), Err(e)) => {
            tracing::warn!("vector recall failed, continuing keyword-only: {}", e);
            checks.push(GateCheck::warn("vector_recall", format!("degraded: {}", e)));
            (k, vec![])
        }
        (Err(e), Ok(v)) => {
            tracing::warn!("keyword recall failed, continuing vector-only: {}", e);
            checks.push(GateCheck::warn("keyword_recall", format!("degraded: {}", e)));
            (vec![], v)
        }
        (Err(ke), Err(ve)) => {
            return Err(SearchError::BothRecallsFailed(format!("{}; {}", ke, ve)));
        }
    };

    // Empty-recall policy: record is written with an empty hit list
    if keyword_cands.is_empty() && vector_cands.is_empty() {
        checks.push(GateCheck::fail("has_hits", "no_evidence"));
        let gate = aggregate(Stage::Retrieval, checks);
        let timing = json!({"recall": recall_ms});
        let (record, _) = persist_empty(db, embedder, message_id, kb_id, query, options, &timing)?;
        return Ok(RetrievalOutcome {
            record_id: record.id,
            candidates: vec![],
            hits: vec![],
            gate,
            provider_snapshot: record.provider_snapshot,
            timing_ms: record.timing_ms,
        });
    }

    // Fusion
    let fusion_started = Instant::now();
    let fused = fuse(&keyword_cands, &vector_cands, options);
    let fusion_ms = fusion_started.elapsed().as_millis() as u64;

    // No partial record if the request died before fusion finished
    if cancel.is_cancelled() {
        return Err(SearchError::Cancelled);
    }

    // Rerank; top_k 0 means the stage is disabled
    let rerank_started = Instant::now();
    let (final_cands, reranked) =
        if options.rerank_strategy == RerankStrategy::None || options.rerank_top_k == 0 {
            (fused, false)
        } else {
            let reranked = rerank(
                query,
                &fused,
                options.rerank_strategy,
                options.rerank_model.as_deref(),
                options.rerank_top_k,
                embedder,
                llm_reranker,
            )
            .await;
            (reranked, true)
        };
    let rerank_ms = rerank_started.elapsed().as_millis() as u64;

    checks.push(GateCheck::pass(
        "has_hits",
        format!("{} fused hits", final_cands.len()),
    ));
    let gate = aggregate(Stage::Retrieval, checks);

    let timing = json!({
        "recall": recall_ms,
        "fusion": fusion_ms,
        "rerank": rerank_ms,
    });

    let intermediate: Vec<(HitSource, &[Candidate])> = if options.persist_intermediate {
        vec![
            (HitSource::Keyword, keyword_cands.as_slice()),
            (HitSource::Vector, vector_cands.as_slice()),
        ]
    } else {
        vec![]
    };
    let final_source = if reranked {
        HitSource::Reranked
    } else {
        HitSource::Fused
    };
    let (record, hits) = persist_with_source(
        db,
        embedder,
        message_id,
        kb_id,
        query,
        options,
        &final_cands,
        final_source,
        &intermediate,
        &timing,
    )?;

    Ok(RetrievalOutcome {
        record_id: record.id,
        candidates: final_cands,
        hits,
        gate,
        provider_snapshot: record.provider_snapshot,
        timing_ms: record.timing_ms,
    })
}

// ── Recall stages ─────────────────────────────────────────────────────────────

fn keyword_candidates(hits: Vec<crate::db::KeywordHit>) -> Vec<Candidate> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| Candidate {
            node_id: hit.node_id,
            stage: CandidateStage::Keyword,
            score: hit.score,
            score_details: json!({
                "raw_bm25": hit.raw_bm25,
                "normalizer": BM25_NORMALIZER,
                "keyword_rank": i + 1,
            }),
            excerpt: hit.excerpt,
            page: Some(hit.page),
            start_offset: hit.start_offset,
            end_offset: hit.end_offset,
            meta: json!({
                "file_id": hit.file_id,
                "document_id": hit.document_id,
                "article_id": hit.article_id,
                "section_path": hit.section_path,
            }),
        })
        .collect()
}

async fn vector_recall(
    db: &Database,
    vectors: &VectorStore,
    embedder: &dyn EmbeddingProvider,
    kb_id: &str,
    query: &str,
    top_k: usize,
) -> Result<Vec<Candidate>, SearchError> {
    if top_k == 0 {
        return Ok(vec![]);
    }

    let query_vectors = embedder.embed_batch(&[query.to_string()]).await?;
    let query_vector = query_vectors
        .first()
        .ok_or_else(|| EmbeddingError::MalformedResponse("empty embedding batch".into()))?;

    let scope = VectorScope::kb(kb_id);
    let hits = vectors.search(&scope, query_vector, top_k).await?;

    // Excerpts and offsets come from the relational store; the payload only
    // carries provenance
    let node_ids: Vec<String> = hits.iter().map(|h| h.node_id.clone()).collect();
    let nodes = db.get_nodes(&node_ids)?;
    let by_id: std::collections::HashMap<&str, &crate::db::NodeRecord> =
        nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    Ok(hits
        .into_iter()
        .enumerate()
        .map(|(i, hit)| {
            let node = by_id.get(hit.node_id.as_str());
            Candidate {
                excerpt: node
                    .map(|n| n.text.chars().take(EXCERPT_CHARS).collect())
                    .unwrap_or_default(),
                start_offset: node.and_then(|n| n.start_offset),
                end_offset: node.and_then(|n| n.end_offset),
                page: Some(hit.page),
                score: hit.score as f64,
                score_details: json!({
                    "metric_type": METRIC_TYPE,
                    "distance": hit.distance,
                    "vector_rank": i + 1,
                }),
                meta: json!({
                    "file_id": hit.file_id,
                    "document_id": hit.document_id,
                    "article_id": empty_to_null(&hit.article_id),
                    "section_path": empty_to_null(&hit.section_path),
                    "vector_id": hit.vector_id,
                }),
                node_id: hit.node_id,
                stage: CandidateStage::Vector,
            }
        })
        .collect())
}

fn empty_to_null(value: &str) -> serde_json::Value {
    if value.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(value.to_string())
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

struct FusionEntry {
    candidate: Candidate,
    keyword_rank: Option<usize>,
    vector_rank: Option<usize>,
    keyword_score: Option<f64>,
    vector_score: Option<f64>,
}

/// Fuse keyword and vector candidates into a deduplicated list. The dedup key
/// is `node_id`; when a node appears on both sides, its score details record
/// both component scores along with the fused score.
pub fn fuse(
    keyword: &[Candidate],
    vector: &[Candidate],
    options: &RetrievalOptions,
) -> Vec<Candidate> {
    let keyword_norm = min_max_normalize(keyword.iter().map(|c| c.score));
    let vector_norm = min_max_normalize(vector.iter().map(|c| c.score));

    let mut entries: Vec<FusionEntry> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (rank, candidate) in keyword.iter().enumerate() {
        index.insert(candidate.node_id.clone(), entries.len());
        entries.push(FusionEntry {
            candidate: candidate.clone(),
            keyword_rank: Some(rank + 1),
            vector_rank: None,
            keyword_score: Some(keyword_norm[rank]),
            vector_score: None,
        });
    }
    for (rank, candidate) in vector.iter().enumerate() {
        match index.get(&candidate.node_id) {
            Some(&i) => {
                entries[i].vector_rank = Some(rank + 1);
                entries[i].vector_score = Some(vector_norm[rank]);
            }
            None => {
                index.insert(candidate.node_id.clone(), entries.len());
                entries.push(FusionEntry {
                    candidate: candidate.clone(),
                    keyword_rank: None,
                    vector_rank: Some(rank + 1),
                    keyword_score: None,
                    vector_score: Some(vector_norm[rank]),
                });
            }
        }
    }

    let rrf_k = if options.rrf_k > 0.0 { options.rrf_k } else { RRF_K };
    let (wk, wv) = normalized_weights(options.keyword_weight, options.vector_weight);

    let mut fused: Vec<Candidate> = entries
        .iter()
        .map(|entry| {
            let score = match options.fusion_strategy {
                FusionStrategy::Union => entry
                    .keyword_score
                    .unwrap_or(0.0)
                    .max(entry.vector_score.unwrap_or(0.0)),
                FusionStrategy::Rrf => {
                    let mut s = 0.0;
                    if let Some(rank) = entry.keyword_rank {
                        s += 1.0 / (rrf_k + rank as f64);
                    }
                    if let Some(rank) = entry.vector_rank {
                        s += 1.0 / (rrf_k + rank as f64);
                    }
                    s
                }
                FusionStrategy::Weighted => {
                    wk * entry.keyword_score.unwrap_or(0.0)
                        + wv * entry.vector_score.unwrap_or(0.0)
                }
            };

            let mut details = json!({
                "fusion_strategy": options.fusion_strategy.as_str(),
                "fused_score": score,
                "keyword_score": entry.keyword_score,
                "vector_score": entry.vector_score,
                "keyword_rank": entry.keyword_rank,
                "vector_rank": entry.vector_rank,
            });
            // Carry the component details forward for replay
            if let Some(object) = details.as_object_mut() {
                object.insert("components".into(), entry.candidate.score_details.clone());
                if options.fusion_strategy == FusionStrategy::Rrf {
                    object.insert("rrf_k".into(), json!(rrf_k));
                }
            }

            Candidate {
                node_id: entry.candidate.node_id.clone(),
                stage: CandidateStage::Fusion,
                score,
                score_details: details,
                excerpt: entry.candidate.excerpt.clone(),
                page: entry.candidate.page,
                start_offset: entry.candidate.start_offset,
                end_offset: entry.candidate.end_offset,
                meta: entry.candidate.meta.clone(),
            }
        })
        .collect();

    // Ties break by keyword rank, then vector rank, then node_id
    let rank_of = |c: &Candidate, key: &str| -> u64 {
        c.score_details
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX)
    };
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_of(a, "keyword_rank").cmp(&rank_of(b, "keyword_rank")))
            .then_with(|| rank_of(a, "vector_rank").cmp(&rank_of(b, "vector_rank")))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    fused.truncate(options.fusion_top_k);
    fused
}

/// Min-max normalize scores over the current result set. Degenerate sets
/// (all-equal scores) map to 1.0 so a lone hit keeps full weight.
fn min_max_normalize(scores: impl Iterator<Item = f64>) -> Vec<f64> {
    let values: Vec<f64> = scores.collect();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() || (max - min).abs() < f64::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

fn normalized_weights(keyword: f64, vector: f64) -> (f64, f64) {
    let total = keyword + vector;
    if total > 0.0 {
        (keyword / total, vector / total)
    } else {
        (0.5, 0.5)
    }
}

// ── Rerank ────────────────────────────────────────────────────────────────────

/// Rerank the fused list with the requested strategy. Any failure degrades to
/// a stable score-order sort, flagged in score details so replays can tell.
/// Score details always carry the model identity that produced (or would have
/// produced) the rerank scores.
async fn rerank(
    query: &str,
    fused: &[Candidate],
    strategy: RerankStrategy,
    rerank_model: Option<&str>,
    top_k: usize,
    embedder: &dyn EmbeddingProvider,
    llm: Option<&dyn ChatProvider>,
) -> Vec<Candidate> {
    if top_k == 0 || fused.is_empty() {
        return vec![];
    }
    let pool: Vec<Candidate> = fused.iter().take(top_k).cloned().collect();

    let scored = match strategy {
        RerankStrategy::None => Ok((vec![], "none".to_string())),
        RerankStrategy::CrossEncoder => cross_encoder_scores(query, &pool, embedder).await,
        RerankStrategy::Llm => llm_scores(query, &pool, llm, rerank_model).await,
    };

    match scored {
        Ok((scores, model)) if !scores.is_empty() => {
            apply_rerank(&pool, &scores, strategy, &model, false, None, top_k)
        }
        Ok((_, model)) => apply_rerank(
            &pool,
            &[],
            RerankStrategy::None,
            &model,
            true,
            Some("rerank_no_scores".into()),
            top_k,
        ),
        Err(reason) => {
            tracing::warn!("rerank degraded to none: {}", reason);
            apply_rerank(
                &pool,
                &[],
                RerankStrategy::None,
                "none",
                true,
                Some(reason),
                top_k,
            )
        }
    }
}

/// Cross-encoder stand-in: score query/passage pairs through the KB's own
/// encoder and use cosine similarity as the rerank signal. Returns the
/// scores with the embedder's model identity.
async fn cross_encoder_scores(
    query: &str,
    pool: &[Candidate],
    embedder: &dyn EmbeddingProvider,
) -> Result<(Vec<(usize, f64)>, String), String> {
    let mut texts = vec![query.to_string()];
    texts.extend(pool.iter().map(|c| c.excerpt.clone()));
    let vectors = embedder
        .embed_batch(&texts)
        .await
        .map_err(|e| format!("rerank_error:{}", e))?;
    let (query_vector, passages) = vectors.split_first().ok_or("rerank_error:empty")?;
    let scores = passages
        .iter()
        .enumerate()
        .filter(|(i, _)| !pool[*i].excerpt.is_empty())
        .map(|(i, v)| (i, cosine_similarity(query_vector, v) as f64))
        .collect();
    Ok((scores, embedder.model().to_string()))
}

/// LLM rerank: ask the model for a 0-10 relevance score per candidate.
/// Returns the scores with the model identity that was asked.
async fn llm_scores(
    query: &str,
    pool: &[Candidate],
    llm: Option<&dyn ChatProvider>,
    rerank_model: Option<&str>,
) -> Result<(Vec<(usize, f64)>, String), String> {
    let provider = llm.ok_or("reranker_unavailable")?;
    let model = rerank_model.unwrap_or("llm").to_string();
    let config = ChatConfig {
        model: model.clone(),
        temperature: 0.0,
        max_tokens: 8,
    };
    let mut scores = Vec::new();
    for (i, candidate) in pool.iter().enumerate() {
        if candidate.excerpt.is_empty() {
            continue;
        }
        let messages = vec![
            ChatMessage::system(
                "Score how relevant the passage is to the query on a 0-10 scale. Reply with only the number.",
            ),
            ChatMessage::user(format!(
                "Query: {}\n\nPassage: {}",
                query, candidate.excerpt
            )),
        ];
        let output = provider
            .chat(&messages, &config)
            .await
            .map_err(|e| format!("rerank_error:{}", e))?;
        if let Ok(value) = output.raw_text.trim().parse::<f64>() {
            scores.push((i, value));
        }
    }
    Ok((scores, model))
}

/// Rebuild the candidate list in rerank order: covered candidates first by
/// rerank score, uncovered ones after by original score; ties by node_id.
fn apply_rerank(
    pool: &[Candidate],
    scores: &[(usize, f64)],
    strategy: RerankStrategy,
    model: &str,
    fallback: bool,
    fallback_reason: Option<String>,
    top_k: usize,
) -> Vec<Candidate> {
    let score_map: std::collections::HashMap<usize, f64> = scores.iter().cloned().collect();

    let mut covered: Vec<(usize, &Candidate)> = pool
        .iter()
        .enumerate()
        .filter(|(i, _)| score_map.contains_key(i))
        .collect();
    covered.sort_by(|(ia, a), (ib, b)| {
        let sa = score_map[ia];
        let sb = score_map[ib];
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let mut uncovered: Vec<(usize, &Candidate)> = pool
        .iter()
        .enumerate()
        .filter(|(i, _)| !score_map.contains_key(i))
        .collect();
    uncovered.sort_by(|(_, a), (_, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    covered
        .into_iter()
        .chain(uncovered)
        .take(top_k)
        .enumerate()
        .map(|(rank, (i, candidate))| {
            let applied = score_map.contains_key(&i);
            let rerank_score = score_map.get(&i).copied();
            let mut details = candidate.score_details.clone();
            if let Some(object) = details.as_object_mut() {
                object.insert("rerank_applied".into(), json!(applied));
                object.insert("rerank_score".into(), json!(rerank_score));
                object.insert("rerank_strategy".into(), json!(strategy.as_str()));
                object.insert("model".into(), json!(model));
                object.insert("rerank_rank".into(), json!(rank + 1));
                object.insert("rerank_fallback".into(), json!(fallback));
                object.insert("rerank_fallback_reason".into(), json!(fallback_reason));
            }
            Candidate {
                node_id: candidate.node_id.clone(),
                stage: CandidateStage::Rerank,
                score: rerank_score.unwrap_or(candidate.score),
                score_details: details,
                excerpt: candidate.excerpt.clone(),
                page: candidate.page,
                start_offset: candidate.start_offset,
                end_offset: candidate.end_offset,
                meta: candidate.meta.clone(),
            }
        })
        .collect()
}

// ── Persistence ───────────────────────────────────────────────────────────────

fn candidate_to_hit(
    candidate: &Candidate,
    record_id: &str,
    source: HitSource,
    rank: usize,
) -> RetrievalHit {
    // Provenance meta travels inside score_details so a persisted hit can be
    // rendered as evidence without a node lookup
    let mut details = candidate.score_details.clone();
    if let Some(object) = details.as_object_mut() {
        object.insert("meta".into(), candidate.meta.clone());
    }
    RetrievalHit {
        id: Uuid::new_v4().to_string(),
        retrieval_record_id: record_id.to_string(),
        node_id: candidate.node_id.clone(),
        source,
        rank: rank as i64 + 1,
        score: candidate.score,
        score_details: details,
        excerpt: candidate.excerpt.clone(),
        page: candidate.page,
        start_offset: candidate.start_offset,
        end_offset: candidate.end_offset,
    }
}

fn provider_snapshot(
    embedder: &dyn EmbeddingProvider,
    options: &RetrievalOptions,
) -> serde_json::Value {
    json!({
        "embed_provider": embedder.name(),
        "embed_model": embedder.model(),
        "embed_dim": embedder.dim(),
        "provider_mode": crate::llm::ProviderRegistry::provider_mode(embedder.name()),
        "fusion_strategy": options.fusion_strategy.as_str(),
        "rerank_strategy": options.rerank_strategy.as_str(),
        "normalizer": BM25_NORMALIZER,
        "metric_type": METRIC_TYPE,
    })
}

/// Persist a record with an empty hit list (weak query / empty recall)
fn persist_empty(
    db: &Database,
    embedder: &dyn EmbeddingProvider,
    message_id: &str,
    kb_id: &str,
    query: &str,
    options: &RetrievalOptions,
    timing: &serde_json::Value,
) -> Result<(RetrievalRecord, Vec<RetrievalHit>), SearchError> {
    persist_with_source(
        db,
        embedder,
        message_id,
        kb_id,
        query,
        options,
        &[],
        HitSource::Fused,
        &[],
        timing,
    )
}

#[allow(clippy::too_many_arguments)]
fn persist_with_source(
    db: &Database,
    embedder: &dyn EmbeddingProvider,
    message_id: &str,
    kb_id: &str,
    query: &str,
    options: &RetrievalOptions,
    final_cands: &[Candidate],
    final_source: HitSource,
    intermediate: &[(HitSource, &[Candidate])],
    timing: &serde_json::Value,
) -> Result<(RetrievalRecord, Vec<RetrievalHit>), SearchError> {
    let record = RetrievalRecord {
        id: Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        kb_id: kb_id.to_string(),
        query_text: query.to_string(),
        keyword_top_k: options.keyword_top_k as i64,
        vector_top_k: options.vector_top_k as i64,
        fusion_top_k: options.fusion_top_k as i64,
        rerank_top_k: options.rerank_top_k as i64,
        fusion_strategy: options.fusion_strategy.as_str().to_string(),
        rerank_strategy: options.rerank_strategy.as_str().to_string(),
        provider_snapshot: provider_snapshot(embedder, options),
        timing_ms: timing.clone(),
        created_at: now_rfc3339(),
    };

    let mut hits: Vec<RetrievalHit> = final_cands
        .iter()
        .enumerate()
        .map(|(rank, c)| candidate_to_hit(c, &record.id, final_source, rank))
        .collect();
    for (source, candidates) in intermediate {
        hits.extend(
            candidates
                .iter()
                .enumerate()
                .map(|(rank, c)| candidate_to_hit(c, &record.id, *source, rank)),
        );
    }

    db.insert_retrieval_record(&record, &hits)?;
    let final_hits: Vec<RetrievalHit> = hits
        .into_iter()
        .filter(|h| h.source == final_source)
        .collect();
    Ok((record, final_hits))
}
