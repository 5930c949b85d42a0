//! Deterministic evaluator for lexrag
//! Pure rule checks over retrieval and generation results. The evaluator
//! never calls retrieval or generation; given identical input it produces
//! identical verdicts, which is what makes refusals auditable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{now_rfc3339, Database, DbError, EvaluationRecord, GenerationRecord, RetrievalHit};
use crate::gate::{aggregate, CheckStatus, GateCheck, GateStatus, Stage};
use crate::generation::Citation;

/// Rule set version persisted with every record
pub const RULE_VERSION: &str = "eval-rules.v1";

/// Evaluator configuration. The full snapshot is persisted so a verdict can
/// be replayed long after defaults change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub rule_version: String,
    pub require_citations: bool,
    pub coverage_warn_threshold: f64,
    pub coverage_fail_threshold: f64,
    pub min_answer_chars: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            rule_version: RULE_VERSION.to_string(),
            require_citations: true,
            coverage_warn_threshold: 0.8,
            coverage_fail_threshold: 0.5,
            min_answer_chars: 20,
        }
    }
}

impl EvaluatorConfig {
    /// Overlay caller-supplied keys onto the defaults; unknown keys ignored
    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut config = Self::default();
        if let Some(v) = value.get("require_citations").and_then(|v| v.as_bool()) {
            config.require_citations = v;
        }
        if let Some(v) = value.get("coverage_warn_threshold").and_then(|v| v.as_f64()) {
            config.coverage_warn_threshold = v;
        }
        if let Some(v) = value.get("coverage_fail_threshold").and_then(|v| v.as_f64()) {
            config.coverage_fail_threshold = v;
        }
        if let Some(v) = value.get("min_answer_chars").and_then(|v| v.as_u64()) {
            config.min_answer_chars = v as usize;
        }
        config
    }
}

/// Everything the evaluator is allowed to see
#[derive(Debug, Clone)]
pub struct EvaluatorInput<'a> {
    pub hits: &'a [RetrievalHit],
    pub generation: &'a GenerationRecord,
    pub answer: Option<&'a str>,
    pub citations: &'a [Citation],
}

/// User-facing evaluator summary: verdict, rule version, and the warn/fail
/// reasons the caller must display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorSummary {
    pub status: GateStatus,
    pub rule_version: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EvaluatorOutcome {
    pub record: EvaluationRecord,
    pub status: GateStatus,
    pub summary: EvaluatorSummary,
}

/// Run the baseline checks. Each check is a pure function of the input.
pub fn run_checks(input: &EvaluatorInput<'_>, config: &EvaluatorConfig) -> Vec<GateCheck> {
    let answer = input.answer.unwrap_or("");
    let mut checks = Vec::new();

    // require_citations
    if config.require_citations {
        if input.citations.is_empty() {
            checks.push(GateCheck::fail("require_citations", "no citations"));
        } else {
            checks.push(GateCheck::pass(
                "require_citations",
                format!("{} citation(s)", input.citations.len()),
            ));
        }
    } else {
        checks.push(GateCheck::skipped("require_citations", "disabled"));
    }

    // citation_coverage
    if input.citations.is_empty() {
        checks.push(GateCheck::skipped("citation_coverage", "no citations"));
    } else {
        let coverage = citation_coverage(input.citations, input.hits);
        let detail = format!("coverage {:.2}", coverage);
        if coverage < config.coverage_fail_threshold {
            checks.push(GateCheck::fail("citation_coverage", detail));
        } else if coverage < config.coverage_warn_threshold {
            checks.push(GateCheck::warn("citation_coverage", detail));
        } else {
            checks.push(GateCheck::pass("citation_coverage", detail));
        }
    }

    // min_answer_length
    if answer.trim().len() >= config.min_answer_chars {
        checks.push(GateCheck::pass(
            "min_answer_length",
            format!("{} chars", answer.trim().len()),
        ));
    } else {
        checks.push(GateCheck::fail(
            "min_answer_length",
            format!(
                "answer {} chars, minimum {}",
                answer.trim().len(),
                config.min_answer_chars
            ),
        ));
    }

    // no_empty_answer
    if answer.trim().is_empty() {
        checks.push(GateCheck::fail("no_empty_answer", "answer is blank"));
    } else {
        checks.push(GateCheck::pass("no_empty_answer", "answer present"));
    }

    checks
}

/// Fraction of citations whose node is in the retrieval hit set, in [0, 1]
pub fn citation_coverage(citations: &[Citation], hits: &[RetrievalHit]) -> f64 {
    let hit_ids: std::collections::HashSet<&str> =
        hits.iter().map(|h| h.node_id.as_str()).collect();
    let covered = citations
        .iter()
        .filter(|c| hit_ids.contains(c.node_id.as_str()))
        .count();
    covered as f64 / std::cmp::max(1, citations.len()) as f64
}

/// Collect warn/fail details for the user-facing summary
fn collect_warnings(checks: &[GateCheck]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| matches!(c.status, CheckStatus::Warn | CheckStatus::Fail))
        .map(|c| {
            if c.detail.is_empty() {
                c.name.clone()
            } else {
                c.detail.clone()
            }
        })
        .collect()
}

/// Evaluate one message and persist the verdict record.
pub fn execute_evaluator(
    db: &Database,
    message_id: &str,
    retrieval_record_id: &str,
    input: &EvaluatorInput<'_>,
    config: &EvaluatorConfig,
) -> Result<EvaluatorOutcome, DbError> {
    let checks = run_checks(input, config);
    let report = aggregate(Stage::Evaluation, checks);
    let warnings = collect_warnings(&report.checks);

    let coverage = if input.citations.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::json!(citation_coverage(input.citations, input.hits))
    };

    let record = EvaluationRecord {
        id: Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        retrieval_record_id: retrieval_record_id.to_string(),
        generation_record_id: input.generation.id.clone(),
        status: report.status,
        rule_version: config.rule_version.clone(),
        config: serde_json::to_value(config).unwrap_or(serde_json::Value::Null),
        checks: serde_json::to_value(&report.checks).unwrap_or(serde_json::Value::Null),
        scores: serde_json::json!({ "citation_coverage": coverage }),
        meta: serde_json::json!({
            "hit_count": input.hits.len(),
            "citation_count": input.citations.len(),
            "generation_status": input.generation.status.as_str(),
        }),
        created_at: now_rfc3339(),
    };
    db.insert_evaluation_record(&record)?;

    Ok(EvaluatorOutcome {
        status: report.status,
        summary: EvaluatorSummary {
            status: report.status,
            rule_version: config.rule_version.clone(),
            warnings,
        },
        record,
    })
}

// ── Retrieval diagnostics ─────────────────────────────────────────────────────

/// Recall/precision of keyword recall against a substring ground truth.
/// GT is "node.text contains the keyword" (what a reviewer sees when reading
/// the source); KW is what FTS recall actually returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRecallMetrics {
    pub keyword: String,
    pub keyword_top_k: usize,
    pub gt_total: usize,
    pub kw_total: usize,
    pub overlap: usize,
    /// None when the ground truth is empty
    pub recall: Option<f64>,
    /// None when keyword recall returned nothing
    pub precision: Option<f64>,
}

/// Compare FTS keyword recall against substring ground truth for one keyword.
pub fn keyword_recall_diagnostics(
    db: &Database,
    kb_id: &str,
    keyword: &str,
    top_k: usize,
) -> Result<KeywordRecallMetrics, DbError> {
    let keyword = keyword.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut stmt = db.conn().prepare(
        "SELECT id FROM node WHERE kb_id = ?1 AND lower(text) LIKE '%' || lower(?2) || '%'",
    )?;
    let gt_nodes: std::collections::HashSet<String> = stmt
        .query_map(rusqlite::params![kb_id, keyword], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let kw_nodes: std::collections::HashSet<String> = db
        .search_nodes_by_keyword(kb_id, &keyword, top_k)?
        .into_iter()
        .map(|hit| hit.node_id)
        .collect();

    let overlap = gt_nodes.intersection(&kw_nodes).count();
    let recall = if gt_nodes.is_empty() {
        None
    } else {
        Some(overlap as f64 / gt_nodes.len() as f64)
    };
    let precision = if kw_nodes.is_empty() {
        None
    } else {
        Some(overlap as f64 / kw_nodes.len() as f64)
    };

    Ok(KeywordRecallMetrics {
        keyword,
        keyword_top_k: top_k,
        gt_total: gt_nodes.len(),
        kw_total: kw_nodes.len(),
        overlap,
        recall,
        precision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GenerationStatus, HitSource};

    fn hit(node_id: &str) -> RetrievalHit {
        RetrievalHit {
            id: format!("hit-{}", node_id),
            retrieval_record_id: "ret-1".into(),
            node_id: node_id.into(),
            source: HitSource::Fused,
            rank: 1,
            score: 0.5,
            score_details: serde_json::json!({}),
            excerpt: "…".into(),
            page: Some(1),
            start_offset: None,
            end_offset: None,
        }
    }

    fn citation(node_id: &str) -> Citation {
        Citation {
            node_id: node_id.into(),
            rank: Some(1),
            quote: None,
            page: Some(1),
            article_id: None,
            section_path: None,
        }
    }

    fn generation(status: GenerationStatus) -> GenerationRecord {
        GenerationRecord {
            id: "gen-1".into(),
            message_id: "msg-1".into(),
            retrieval_record_id: "ret-1".into(),
            prompt_name: "legal_qa".into(),
            prompt_version: "v1".into(),
            model_provider: "mock".into(),
            model_name: "mock-legal".into(),
            messages_snapshot: serde_json::Value::Null,
            output_raw: String::new(),
            output_structured: None,
            citations: serde_json::json!([]),
            status,
            error_message: None,
            created_at: now_rfc3339(),
        }
    }

    const GOOD_ANSWER: &str = "Rent may not be increased before two years have passed.";

    #[test]
    fn test_all_checks_pass() {
        let hits = vec![hit("a")];
        let citations = vec![citation("a")];
        let generation = generation(GenerationStatus::Success);
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &citations,
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        assert!(checks.iter().all(|c| c.status == CheckStatus::Pass));
        let report = aggregate(Stage::Evaluation, checks);
        assert_eq!(report.status, GateStatus::Pass);
    }

    #[test]
    fn test_missing_citations_fail_overall() {
        let hits = vec![hit("a")];
        let generation = generation(GenerationStatus::Partial);
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &[],
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        let report = aggregate(Stage::Evaluation, checks);
        // require_citations fail forces the overall verdict to fail
        assert_eq!(report.status, GateStatus::Fail);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "require_citations" && c.status == CheckStatus::Fail));
    }

    #[test]
    fn test_coverage_thresholds() {
        let hits = vec![hit("a"), hit("b")];
        let generation = generation(GenerationStatus::Success);

        // 1 of 2 citations covered -> 0.5: warn-band floor is inclusive
        let citations = vec![citation("a"), citation("zz")];
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &citations,
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        let coverage_check = checks
            .iter()
            .find(|c| c.name == "citation_coverage")
            .unwrap();
        assert_eq!(coverage_check.status, CheckStatus::Warn);

        // 1 of 3 covered -> 0.33 < fail threshold
        let citations = vec![citation("a"), citation("y"), citation("z")];
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &citations,
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        let coverage_check = checks
            .iter()
            .find(|c| c.name == "citation_coverage")
            .unwrap();
        assert_eq!(coverage_check.status, CheckStatus::Fail);
    }

    #[test]
    fn test_coverage_always_in_unit_interval() {
        let hits = vec![hit("a")];
        for citations in [
            vec![],
            vec![citation("a")],
            vec![citation("a"), citation("b"), citation("c")],
        ] {
            let coverage = citation_coverage(&citations, &hits);
            assert!((0.0..=1.0).contains(&coverage), "coverage {}", coverage);
        }
    }

    #[test]
    fn test_short_and_empty_answers() {
        let hits = vec![hit("a")];
        let citations = vec![citation("a")];
        let generation = generation(GenerationStatus::Success);

        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some("Too short"),
            citations: &citations,
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        assert!(checks
            .iter()
            .any(|c| c.name == "min_answer_length" && c.status == CheckStatus::Fail));

        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some("   "),
            citations: &citations,
        };
        let checks = run_checks(&input, &EvaluatorConfig::default());
        assert!(checks
            .iter()
            .any(|c| c.name == "no_empty_answer" && c.status == CheckStatus::Fail));
    }

    #[test]
    fn test_disabled_citations_check_skips() {
        let hits = vec![hit("a")];
        let generation = generation(GenerationStatus::Success);
        let config = EvaluatorConfig {
            require_citations: false,
            ..Default::default()
        };
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &[],
        };
        let checks = run_checks(&input, &config);
        assert!(checks
            .iter()
            .any(|c| c.name == "require_citations" && c.status == CheckStatus::Skipped));
        let report = aggregate(Stage::Evaluation, checks);
        // Remaining checks still pass
        assert_eq!(report.status, GateStatus::Pass);
    }

    #[test]
    fn test_config_overlay_from_value() {
        let value = serde_json::json!({
            "require_citations": false,
            "min_answer_chars": 5,
            "unknown_key": "ignored",
        });
        let config = EvaluatorConfig::from_value(&value);
        assert!(!config.require_citations);
        assert_eq!(config.min_answer_chars, 5);
        assert_eq!(config.coverage_warn_threshold, 0.8);
        assert_eq!(config.rule_version, RULE_VERSION);
    }

    #[test]
    fn test_checks_are_deterministic() {
        let hits = vec![hit("a"), hit("b")];
        let citations = vec![citation("a"), citation("x")];
        let generation = generation(GenerationStatus::Partial);
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &citations,
        };
        let config = EvaluatorConfig::default();
        let a = run_checks(&input, &config);
        let b = run_checks(&input, &config);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_keyword_recall_diagnostics() {
        use crate::db::{
            DocumentRecord, IngestStatus, KnowledgeBase, KnowledgeFile, NodeRecord, NodeVectorMap,
        };

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.insert_kb(&KnowledgeBase {
            id: "kb-1".into(),
            name: "default".into(),
            vector_collection: "nodes".into(),
            embed_provider: "hash".into(),
            embed_model: "hash-v1".into(),
            embed_dim: 8,
            chunk_window: 2,
            min_node_chars: 4,
            created_at: now_rfc3339(),
        })
        .unwrap();
        let file = KnowledgeFile {
            id: "file-1".into(),
            kb_id: "kb-1".into(),
            file_name: "f.md".into(),
            sha256: "s".into(),
            ingest_status: IngestStatus::Pending,
            pages: 0,
            node_count: 0,
            timing_ms: serde_json::json!({}),
            error_message: None,
            created_at: now_rfc3339(),
        };
        db.insert_file(&file).unwrap();
        let document = DocumentRecord {
            id: "doc-1".into(),
            kb_id: "kb-1".into(),
            file_id: "file-1".into(),
            title: None,
            page_count: 1,
            parser: "markdown".into(),
            parser_version: "parse.v1".into(),
        };
        let texts = [
            "Eviction requires twelve months notice.",
            "Rent may not be increased for two years.",
            "The eviction notice goes through the notary.",
        ];
        let nodes: Vec<NodeRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| NodeRecord {
                id: format!("node-{}", i),
                kb_id: "kb-1".into(),
                file_id: "file-1".into(),
                document_id: "doc-1".into(),
                node_index: i as i64,
                text: text.to_string(),
                page: 1,
                article_id: None,
                section_path: None,
                start_offset: None,
                end_offset: None,
                meta: serde_json::json!({}),
            })
            .collect();
        let maps: Vec<NodeVectorMap> = nodes
            .iter()
            .map(|n| NodeVectorMap {
                node_id: n.id.clone(),
                vector_id: n.id.clone(),
                kb_id: "kb-1".into(),
            })
            .collect();
        db.persist_ingest(&document, &nodes, &maps, &serde_json::json!({}))
            .unwrap();

        let metrics = keyword_recall_diagnostics(&db, "kb-1", "eviction", 10).unwrap();
        assert_eq!(metrics.gt_total, 2);
        assert_eq!(metrics.kw_total, 2);
        assert_eq!(metrics.overlap, 2);
        assert_eq!(metrics.recall, Some(1.0));
        assert_eq!(metrics.precision, Some(1.0));

        // Keyword absent from the corpus: no ground truth, no recall
        let metrics = keyword_recall_diagnostics(&db, "kb-1", "maritime", 10).unwrap();
        assert_eq!(metrics.gt_total, 0);
        assert!(metrics.recall.is_none());
    }

    #[test]
    fn test_execute_evaluator_persists_snapshot() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let hits = vec![hit("a")];
        let citations = vec![citation("a")];
        let generation = generation(GenerationStatus::Success);
        let input = EvaluatorInput {
            hits: &hits,
            generation: &generation,
            answer: Some(GOOD_ANSWER),
            citations: &citations,
        };
        let outcome = execute_evaluator(
            &db,
            "msg-1",
            "ret-1",
            &input,
            &EvaluatorConfig::default(),
        )
        .unwrap();

        assert_eq!(outcome.status, GateStatus::Pass);
        assert!(outcome.summary.warnings.is_empty());

        let stored = db.get_evaluation_record(&outcome.record.id).unwrap().unwrap();
        assert_eq!(stored.rule_version, RULE_VERSION);
        assert_eq!(stored.config["require_citations"], serde_json::json!(true));
        assert!(stored.checks.is_array());
        assert_eq!(stored.scores["citation_coverage"], serde_json::json!(1.0));
    }
}
