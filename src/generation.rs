//! Generation engine for lexrag
//! Prompt build, model call, structured parse, and citation alignment.
//! The generation record is always written, whatever happens: a failed or
//! hallucinated generation is evidence too.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    now_rfc3339, Database, DbError, GenerationRecord, GenerationStatus, RetrievalHit,
};
use crate::gate::{aggregate, GateCheck, GateReport, Stage};
use crate::llm::{ChatConfig, ChatProvider, LlmError};
use crate::prompts::{build_prompt, PromptError};
use crate::CancelFlag;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),
}

/// Why a generation ended `failed`, when it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationFailure {
    /// Model provider unavailable or errored
    ProviderError,
    /// Request cancelled mid-generation
    Cancelled,
    /// Model answered with zero evidence on the table
    NoEvidenceHallucination,
    /// Every citation pointed outside the evidence set
    NoValidCitations,
}

impl GenerationFailure {
    pub fn reason(self) -> &'static str {
        match self {
            Self::ProviderError => "provider_error",
            Self::Cancelled => "cancelled",
            Self::NoEvidenceHallucination => "no_evidence_hallucination",
            Self::NoValidCitations => "no_valid_citations",
        }
    }
}

/// A verified citation into the evidence set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message_id: String,
    pub retrieval_record_id: String,
    pub query: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub record: GenerationRecord,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub gate: GateReport,
    pub failure: Option<GenerationFailure>,
}

/// The JSON contract the model must satisfy
#[derive(Debug, Deserialize)]
struct RawOutput {
    answer: String,
    #[serde(default)]
    citations: Vec<RawCitation>,
}

#[derive(Debug, Deserialize)]
struct RawCitation {
    node_id: String,
    #[serde(default)]
    rank: Option<i64>,
    #[serde(default)]
    quote: Option<String>,
}

/// Run one generation against the given evidence and persist its record.
pub async fn execute_generation(
    db: &Database,
    provider: &dyn ChatProvider,
    request: &GenerationRequest,
    hits: &[RetrievalHit],
    cancel: &CancelFlag,
) -> Result<GenerationOutcome, GenerationError> {
    let bundle = build_prompt(
        &request.prompt_name,
        &request.prompt_version,
        &request.query,
        hits,
    )?;
    let messages_snapshot = serde_json::to_value(&bundle.messages)
        .unwrap_or(serde_json::Value::Null);

    let config = ChatConfig {
        model: request.model_name.clone(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };

    if cancel.is_cancelled() {
        let outcome = failed_outcome(
            request,
            provider.name(),
            messages_snapshot,
            String::new(),
            GenerationFailure::Cancelled,
        );
        db.insert_generation_record(&outcome.record)?;
        return Ok(outcome);
    }

    let output = match provider.chat(&bundle.messages, &config).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("model call failed: {}", e);
            let outcome = failed_outcome(
                request,
                provider.name(),
                messages_snapshot,
                e.to_string(),
                GenerationFailure::ProviderError,
            );
            db.insert_generation_record(&outcome.record)?;
            return Ok(outcome);
        }
    };

    if cancel.is_cancelled() {
        let outcome = failed_outcome(
            request,
            provider.name(),
            messages_snapshot,
            String::new(),
            GenerationFailure::Cancelled,
        );
        db.insert_generation_record(&outcome.record)?;
        return Ok(outcome);
    }

    let outcome = postprocess(request, hits, &bundle.valid_node_ids, messages_snapshot, output);
    db.insert_generation_record(&outcome.record)?;
    Ok(outcome)
}

/// Strict parse + citation alignment. This is a pure function over the raw
/// model output; it never touches providers or stores.
pub fn postprocess(
    request: &GenerationRequest,
    hits: &[RetrievalHit],
    valid_node_ids: &[String],
    messages_snapshot: serde_json::Value,
    output: crate::llm::ChatOutput,
) -> GenerationOutcome {
    let mut checks = vec![GateCheck::pass("model_call", "model responded")];

    let parsed = parse_structured(&output.raw_text);

    let (status, answer, citations, error_message, failure, structured) = match parsed {
        None => {
            // Unparseable output keeps the raw text; citations are empty
            checks.push(GateCheck::warn("output_parse", "output_not_json"));
            checks.push(GateCheck::skipped("citation_alignment", "nothing to align"));
            (
                GenerationStatus::Partial,
                Some(output.raw_text.clone()),
                vec![],
                Some("output_not_json".to_string()),
                None,
                None,
            )
        }
        Some(raw) => {
            checks.push(GateCheck::pass("output_parse", "valid JSON output"));
            let structured = serde_json::json!({
                "answer": raw.answer,
                "citations": raw.citations.iter().map(|c| serde_json::json!({
                    "node_id": c.node_id,
                    "rank": c.rank,
                })).collect::<Vec<_>>(),
            });

            if hits.is_empty() && !raw.answer.trim().is_empty() {
                // Evidence-free answers are never shown
                checks.push(GateCheck::fail(
                    "citation_alignment",
                    GenerationFailure::NoEvidenceHallucination.reason(),
                ));
                (
                    GenerationStatus::Failed,
                    Some(raw.answer),
                    vec![],
                    Some(GenerationFailure::NoEvidenceHallucination.reason().to_string()),
                    Some(GenerationFailure::NoEvidenceHallucination),
                    Some(structured),
                )
            } else {
                let (aligned, dropped) = align_citations(&raw.citations, valid_node_ids, hits);
                if dropped > 0 && aligned.is_empty() {
                    checks.push(GateCheck::fail(
                        "citation_alignment",
                        GenerationFailure::NoValidCitations.reason(),
                    ));
                    (
                        GenerationStatus::Failed,
                        Some(raw.answer),
                        vec![],
                        Some(GenerationFailure::NoValidCitations.reason().to_string()),
                        Some(GenerationFailure::NoValidCitations),
                        Some(structured),
                    )
                } else if dropped > 0 {
                    checks.push(GateCheck::warn(
                        "citation_alignment",
                        format!("{} citation(s) outside evidence dropped", dropped),
                    ));
                    (
                        GenerationStatus::Partial,
                        Some(raw.answer),
                        aligned,
                        Some("citation_dropped".to_string()),
                        None,
                        Some(structured),
                    )
                } else {
                    checks.push(GateCheck::pass(
                        "citation_alignment",
                        format!("{} citation(s) aligned", aligned.len()),
                    ));
                    (
                        GenerationStatus::Success,
                        Some(raw.answer),
                        aligned,
                        None,
                        None,
                        Some(structured),
                    )
                }
            }
        }
    };

    let record = GenerationRecord {
        id: Uuid::new_v4().to_string(),
        message_id: request.message_id.clone(),
        retrieval_record_id: request.retrieval_record_id.clone(),
        prompt_name: request.prompt_name.clone(),
        prompt_version: request.prompt_version.clone(),
        model_provider: output.provider.clone(),
        model_name: output.model.clone(),
        messages_snapshot,
        output_raw: output.raw_text,
        output_structured: structured,
        citations: serde_json::to_value(&citations).unwrap_or(serde_json::Value::Null),
        status,
        error_message,
        created_at: now_rfc3339(),
    };

    GenerationOutcome {
        record,
        answer,
        citations,
        gate: aggregate(Stage::Generation, checks),
        failure,
    }
}

fn failed_outcome(
    request: &GenerationRequest,
    provider_name: &str,
    messages_snapshot: serde_json::Value,
    detail: String,
    failure: GenerationFailure,
) -> GenerationOutcome {
    let checks = vec![GateCheck::fail("model_call", failure.reason())];
    let record = GenerationRecord {
        id: Uuid::new_v4().to_string(),
        message_id: request.message_id.clone(),
        retrieval_record_id: request.retrieval_record_id.clone(),
        prompt_name: request.prompt_name.clone(),
        prompt_version: request.prompt_version.clone(),
        model_provider: provider_name.to_string(),
        model_name: request.model_name.clone(),
        messages_snapshot,
        output_raw: String::new(),
        output_structured: None,
        citations: serde_json::json!([]),
        status: GenerationStatus::Failed,
        error_message: Some(if detail.is_empty() {
            failure.reason().to_string()
        } else {
            format!("{}: {}", failure.reason(), detail)
        }),
        created_at: now_rfc3339(),
    };
    GenerationOutcome {
        record,
        answer: None,
        citations: vec![],
        gate: aggregate(Stage::Generation, checks),
        failure: Some(failure),
    }
}

/// Parse the model output as the contract JSON, tolerating markdown code
/// fences and surrounding prose.
fn parse_structured(raw: &str) -> Option<RawOutput> {
    let trimmed = raw.trim();
    if let Ok(parsed) = serde_json::from_str::<RawOutput>(trimmed) {
        return Some(parsed);
    }

    // Fenced block: ```json ... ```
    if let Some(stripped) = strip_code_fence(trimmed) {
        if let Ok(parsed) = serde_json::from_str::<RawOutput>(stripped.trim()) {
            return Some(parsed);
        }
    }

    // Last resort: first '{' to last '}'
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<RawOutput>(&trimmed[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.rfind("```")?;
    Some(&rest[..end])
}

/// Keep citations whose node_id is in the evidence set, enriched with the
/// hit's locator fields; count the dropped ones.
fn align_citations(
    raw: &[RawCitation],
    valid_node_ids: &[String],
    hits: &[RetrievalHit],
) -> (Vec<Citation>, usize) {
    let valid: std::collections::HashSet<&str> =
        valid_node_ids.iter().map(|s| s.as_str()).collect();
    let mut aligned = Vec::new();
    let mut dropped = 0usize;
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for citation in raw {
        if !valid.contains(citation.node_id.as_str()) {
            dropped += 1;
            continue;
        }
        if !seen.insert(citation.node_id.as_str()) {
            continue;
        }
        let hit = hits.iter().find(|h| h.node_id == citation.node_id);
        aligned.push(Citation {
            node_id: citation.node_id.clone(),
            rank: citation.rank.or_else(|| hit.map(|h| h.rank)),
            quote: citation.quote.clone(),
            page: hit.and_then(|h| h.page),
            article_id: hit.and_then(|h| {
                h.score_details
                    .get("meta")
                    .and_then(|m| m.get("article_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }),
            section_path: hit.and_then(|h| {
                h.score_details
                    .get("meta")
                    .and_then(|m| m.get("section_path"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }),
        });
    }

    (aligned, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, HitSource};
    use crate::llm::{ChatOutput, MockChatProvider, MockMode};

    fn hit(node_id: &str, rank: i64) -> RetrievalHit {
        RetrievalHit {
            id: format!("hit-{}", rank),
            retrieval_record_id: "ret-1".into(),
            node_id: node_id.into(),
            source: HitSource::Fused,
            rank,
            score: 0.5,
            score_details: serde_json::json!({
                "meta": {"article_id": "9", "section_path": "Law > Article 9"}
            }),
            excerpt: "Rent may not be increased before two years have passed.".into(),
            page: Some(3),
            start_offset: Some(0),
            end_offset: Some(50),
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            message_id: "msg-1".into(),
            retrieval_record_id: "ret-1".into(),
            query: "Can the landlord raise the rent?".into(),
            prompt_name: "legal_qa".into(),
            prompt_version: "v1".into(),
            model_name: "mock-legal".into(),
            temperature: 0.1,
            max_tokens: 512,
        }
    }

    fn output(raw: &str) -> ChatOutput {
        ChatOutput {
            raw_text: raw.into(),
            provider: "mock".into(),
            model: "mock-legal".into(),
            usage: None,
        }
    }

    fn test_db_with_record() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.insert_retrieval_record(
            &crate::db::RetrievalRecord {
                id: "ret-1".into(),
                message_id: "msg-1".into(),
                kb_id: "kb-1".into(),
                query_text: "q".into(),
                keyword_top_k: 10,
                vector_top_k: 10,
                fusion_top_k: 10,
                rerank_top_k: 0,
                fusion_strategy: "rrf".into(),
                rerank_strategy: "none".into(),
                provider_snapshot: serde_json::json!({}),
                timing_ms: serde_json::json!({}),
                created_at: now_rfc3339(),
            },
            &[],
        )
        .unwrap();
        db
    }

    #[test]
    fn test_postprocess_success_with_aligned_citation() {
        let hits = vec![hit("node-a", 1)];
        let outcome = postprocess(
            &request(),
            &hits,
            &["node-a".to_string()],
            serde_json::Value::Null,
            output(r#"{"answer": "No, not before two years.", "citations": [{"node_id": "node-a", "rank": 1}]}"#),
        );

        assert_eq!(outcome.record.status, GenerationStatus::Success);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.citations[0].node_id, "node-a");
        assert_eq!(outcome.citations[0].page, Some(3));
        assert_eq!(outcome.citations[0].article_id.as_deref(), Some("9"));
        assert!(outcome.gate.passed());
        assert!(outcome.failure.is_none());
    }

    #[test]
    fn test_postprocess_drops_drifted_citation_to_partial() {
        let hits = vec![hit("node-a", 1)];
        let outcome = postprocess(
            &request(),
            &hits,
            &["node-a".to_string()],
            serde_json::Value::Null,
            output(
                r#"{"answer": "Answer.", "citations": [{"node_id": "node-a"}, {"node_id": "node-zz"}]}"#,
            ),
        );

        assert_eq!(outcome.record.status, GenerationStatus::Partial);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.record.error_message.as_deref(), Some("citation_dropped"));
    }

    #[test]
    fn test_postprocess_all_citations_drifted_fails() {
        let hits = vec![hit("node-a", 1)];
        let outcome = postprocess(
            &request(),
            &hits,
            &["node-a".to_string()],
            serde_json::Value::Null,
            output(r#"{"answer": "Answer.", "citations": [{"node_id": "node-zz"}]}"#),
        );

        assert_eq!(outcome.record.status, GenerationStatus::Failed);
        assert!(outcome.citations.is_empty());
        assert_eq!(outcome.failure, Some(GenerationFailure::NoValidCitations));
        assert!(outcome.gate.failed());
    }

    #[test]
    fn test_postprocess_non_json_is_partial() {
        let hits = vec![hit("node-a", 1)];
        let outcome = postprocess(
            &request(),
            &hits,
            &["node-a".to_string()],
            serde_json::Value::Null,
            output("The rent can not be raised for two years."),
        );

        assert_eq!(outcome.record.status, GenerationStatus::Partial);
        assert!(outcome.citations.is_empty());
        assert_eq!(
            outcome.record.output_raw,
            "The rent can not be raised for two years."
        );
        assert_eq!(outcome.record.error_message.as_deref(), Some("output_not_json"));
    }

    #[test]
    fn test_postprocess_no_evidence_hallucination() {
        let outcome = postprocess(
            &request(),
            &[],
            &[],
            serde_json::Value::Null,
            output(r#"{"answer": "The law says rent is frozen forever.", "citations": []}"#),
        );

        assert_eq!(outcome.record.status, GenerationStatus::Failed);
        assert_eq!(
            outcome.failure,
            Some(GenerationFailure::NoEvidenceHallucination)
        );
    }

    #[test]
    fn test_parse_structured_tolerates_fences_and_prose() {
        assert!(parse_structured(r#"{"answer": "a", "citations": []}"#).is_some());
        assert!(parse_structured(
            "```json\n{\"answer\": \"a\", \"citations\": []}\n```"
        )
        .is_some());
        assert!(parse_structured(
            "Here is the result: {\"answer\": \"a\", \"citations\": []} hope it helps"
        )
        .is_some());
        assert!(parse_structured("no json here").is_none());
        // Missing required field
        assert!(parse_structured(r#"{"citations": []}"#).is_none());
    }

    #[test]
    fn test_align_citations_dedupes_repeats() {
        let hits = vec![hit("node-a", 1)];
        let raw = vec![
            RawCitation {
                node_id: "node-a".into(),
                rank: Some(1),
                quote: None,
            },
            RawCitation {
                node_id: "node-a".into(),
                rank: Some(1),
                quote: None,
            },
        ];
        let (aligned, dropped) = align_citations(&raw, &["node-a".to_string()], &hits);
        assert_eq!(aligned.len(), 1);
        assert_eq!(dropped, 0);
    }

    #[tokio::test]
    async fn test_execute_generation_persists_record() {
        let db = test_db_with_record();
        let provider = MockChatProvider::new(MockMode::Grounded);
        let hits = vec![hit("node-a", 1)];
        let outcome = execute_generation(&db, &provider, &request(), &hits, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(outcome.record.status, GenerationStatus::Success);
        let stored = db
            .get_generation_record(&outcome.record.id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.message_id, "msg-1");
        assert_eq!(stored.prompt_name, "legal_qa");
        assert!(stored.messages_snapshot.is_array());
        assert_eq!(stored.citations[0]["node_id"], "node-a");
    }

    #[tokio::test]
    async fn test_execute_generation_cancelled_records_failure() {
        let db = test_db_with_record();
        let provider = MockChatProvider::new(MockMode::Grounded);
        let hits = vec![hit("node-a", 1)];
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = execute_generation(&db, &provider, &request(), &hits, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.record.status, GenerationStatus::Failed);
        assert_eq!(outcome.failure, Some(GenerationFailure::Cancelled));
        assert!(outcome
            .record
            .error_message
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        // Record still written despite cancellation
        assert!(db
            .get_generation_record(&outcome.record.id)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_execute_generation_drift_mode_goes_failed() {
        let db = test_db_with_record();
        let provider = MockChatProvider::new(MockMode::DriftCitation);
        let hits = vec![hit("node-a", 1)];
        let outcome = execute_generation(&db, &provider, &request(), &hits, &CancelFlag::new())
            .await
            .unwrap();

        // Drifted citation was dropped; nothing remains
        assert_eq!(outcome.record.status, GenerationStatus::Failed);
        assert_eq!(outcome.failure, Some(GenerationFailure::NoValidCitations));
    }
}
