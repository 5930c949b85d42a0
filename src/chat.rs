//! Chat orchestrator for lexrag
//! Composes retrieval -> generation -> evaluation for one message, honoring
//! gate outcomes. The message status is the single observable truth of the
//! turn; the reply envelope carries the record ids that make it replayable.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::db::{
    now_rfc3339, Conversation, Database, Message, MessageStatus, RetrievalHit,
};
use crate::error::{CoreError, ErrorCode};
use crate::evaluator::{
    execute_evaluator, EvaluatorConfig, EvaluatorInput, EvaluatorSummary,
};
use crate::gate::{blocks_downstream, GateStatus, Stage};
use crate::generation::{
    execute_generation, Citation, GenerationFailure, GenerationRequest,
};
use crate::kb::embeddings::EmbeddingRegistry;
use crate::kb::search::{
    execute_retrieval, FusionStrategy, RerankStrategy, RetrievalOptions,
};
use crate::kb::vectors::VectorStore;
use crate::llm::ProviderRegistry;
use crate::prompts::{LEGAL_QA_PROMPT_NAME, LEGAL_QA_PROMPT_VERSION};
use crate::validation;
use crate::CancelFlag;

/// Fixed refusal text; never echoes model output
pub const REFUSAL_TEXT: &str =
    "I cannot answer this question from the knowledge base evidence available.";

const DEFAULT_MODEL_PROVIDER: &str = "mock";
const DEFAULT_MODEL_NAME: &str = "mock-legal";
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Caller-supplied per-request options. Unknown keys are preserved in
/// `extra` and ignored by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    pub keyword_top_k: Option<i64>,
    pub vector_top_k: Option<i64>,
    pub fusion_top_k: Option<i64>,
    pub rerank_top_k: Option<i64>,
    pub fusion_strategy: Option<String>,
    pub rerank_strategy: Option<String>,
    pub embed_provider: Option<String>,
    pub embed_model: Option<String>,
    pub embed_dim: Option<usize>,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    pub prompt_name: Option<String>,
    pub prompt_version: Option<String>,
    pub evaluator_config: Option<serde_json::Value>,
    pub return_records: Option<bool>,
    pub return_hits: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub query: String,
    pub kb_id: String,
    pub conversation_id: Option<String>,
    pub debug: bool,
    pub context: ChatContext,
}

/// Debug payload attached when the caller asks for it
#[derive(Debug, Clone, Serialize)]
pub struct ChatDebug {
    pub retrieval_record_id: String,
    pub generation_record_id: Option<String>,
    pub evaluation_record_id: Option<String>,
    pub hits: Vec<RetrievalHit>,
    pub provider_snapshot: serde_json::Value,
    pub timing_ms: serde_json::Value,
}

/// Reply envelope for one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub conversation_id: String,
    pub message_id: String,
    pub kb_id: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub evaluator: EvaluatorSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<ChatDebug>,
}

/// Run one chat turn end to end.
///
/// Stage order and gate behavior follow the trust-pipeline contract:
/// retrieval gate failure blocks generation and evaluation; generation
/// failure still reaches the evaluator; evaluator failure blocks the answer.
#[allow(clippy::too_many_arguments)]
pub async fn chat(
    db: &Database,
    vectors: &VectorStore,
    embeddings: &EmbeddingRegistry,
    providers: &ProviderRegistry,
    audit: &AuditLog,
    request: &ChatRequest,
    cancel: &CancelFlag,
) -> Result<ChatReply, CoreError> {
    let started = Instant::now();
    validation::validate_query(&request.query)?;

    let kb = db
        .get_kb(&request.kb_id)?
        .ok_or_else(|| CoreError::kb_not_found(&request.kb_id))?;

    // Conversation and pending message
    let conversation_id = match &request.conversation_id {
        Some(id) => {
            db.get_conversation(id)?
                .ok_or_else(|| {
                    CoreError::new(
                        ErrorCode::NOT_FOUND_CONVERSATION,
                        format!("Conversation not found: {}", id),
                        crate::error::ErrorCategory::NotFound,
                    )
                })?
                .id
        }
        None => {
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                kb_id: kb.id.clone(),
                title: None,
                created_at: now_rfc3339(),
            };
            db.insert_conversation(&conversation)?;
            conversation.id
        }
    };

    let message_id = Uuid::new_v4().to_string();
    db.insert_message(&Message {
        id: message_id.clone(),
        conversation_id: conversation_id.clone(),
        role: "user".into(),
        content: request.query.clone(),
        status: MessageStatus::Pending,
        created_at: now_rfc3339(),
    })?;

    // Resolve configuration: context > kb > defaults
    let options = resolve_retrieval_options(&request.context)?;
    let prompt_name = request
        .context
        .prompt_name
        .clone()
        .unwrap_or_else(|| LEGAL_QA_PROMPT_NAME.to_string());
    let prompt_version = request
        .context
        .prompt_version
        .clone()
        .unwrap_or_else(|| LEGAL_QA_PROMPT_VERSION.to_string());
    crate::prompts::resolve_template(&prompt_name, &prompt_version).map_err(|e| {
        CoreError::new(
            ErrorCode::NOT_FOUND_PROMPT,
            e.to_string(),
            crate::error::ErrorCategory::NotFound,
        )
    })?;
    let evaluator_config = request
        .context
        .evaluator_config
        .as_ref()
        .map(EvaluatorConfig::from_value)
        .unwrap_or_default();

    let embed_provider = request
        .context
        .embed_provider
        .as_deref()
        .unwrap_or(&kb.embed_provider);
    let embed_model = request
        .context
        .embed_model
        .as_deref()
        .unwrap_or(&kb.embed_model);
    let embed_dim = request.context.embed_dim.unwrap_or(kb.embed_dim);
    let embedder = embeddings.resolve(embed_provider, embed_model, embed_dim)?;

    let model_provider_name = request
        .context
        .model_provider
        .as_deref()
        .unwrap_or(DEFAULT_MODEL_PROVIDER);
    let provider = providers.resolve(model_provider_name)?;

    // Retrieval (keyword ∥ vector inside)
    let retrieval = match execute_retrieval(
        db,
        vectors,
        embedder.as_ref(),
        Some(provider.as_ref()),
        &message_id,
        &kb.id,
        &request.query,
        &options,
        cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(crate::kb::search::SearchError::Cancelled) => {
            db.update_message_status(&message_id, MessageStatus::Failed)?;
            return Err(CoreError::cancelled());
        }
        Err(e) => {
            db.update_message_status(&message_id, MessageStatus::Failed)?;
            audit.chat_completed(&kb.id, &message_id, "failed");
            return Err(CoreError::external_db(e.to_string()));
        }
    };

    if blocks_downstream(Stage::Retrieval, retrieval.gate.status) {
        db.update_message_status(&message_id, MessageStatus::Blocked)?;
        audit.gate_blocked(&kb.id, &message_id, "retrieval", &retrieval.gate.reasons);
        return Ok(blocked_reply(
            conversation_id,
            message_id,
            &kb.id,
            retrieval.gate.reasons.clone(),
            &evaluator_config,
            Some(&retrieval),
            None,
            None,
            request,
            started,
        ));
    }

    // Generation; its gate never blocks the evaluator
    let generation_request = GenerationRequest {
        message_id: message_id.clone(),
        retrieval_record_id: retrieval.record_id.clone(),
        query: request.query.clone(),
        prompt_name,
        prompt_version,
        model_name: request
            .context
            .model_name
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
        temperature: DEFAULT_TEMPERATURE,
        max_tokens: DEFAULT_MAX_TOKENS,
    };
    let generation = match execute_generation(
        db,
        provider.as_ref(),
        &generation_request,
        &retrieval.hits,
        cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            db.update_message_status(&message_id, MessageStatus::Failed)?;
            return Err(match e {
                crate::generation::GenerationError::Provider(inner) => inner.into(),
                crate::generation::GenerationError::Database(inner) => inner.into(),
                other => CoreError::internal(other.to_string()),
            });
        }
    };

    // Provider-level failures surface as message failed, not blocked
    if matches!(
        generation.failure,
        Some(GenerationFailure::ProviderError) | Some(GenerationFailure::Cancelled)
    ) {
        db.update_message_status(&message_id, MessageStatus::Failed)?;
        audit.chat_completed(&kb.id, &message_id, "failed");
        let reason = generation.failure.map(|f| f.reason().to_string());
        return Ok(ChatReply {
            conversation_id,
            message_id: message_id.clone(),
            kb_id: kb.id.clone(),
            status: MessageStatus::Failed,
            answer: None,
            citations: vec![],
            evaluator: EvaluatorSummary {
                status: GateStatus::Skipped,
                rule_version: evaluator_config.rule_version.clone(),
                warnings: reason.clone().into_iter().collect(),
            },
            reasons: reason.into_iter().collect(),
            refusal: Some(REFUSAL_TEXT.to_string()),
            debug: debug_payload(
                request,
                Some(&retrieval),
                Some(generation.record.id.as_str()),
                None,
                started,
            ),
        });
    }

    // Evaluation always runs once generation produced a record
    let evaluator_input = EvaluatorInput {
        hits: &retrieval.hits,
        generation: &generation.record,
        answer: generation.answer.as_deref(),
        citations: &generation.citations,
    };
    let evaluation = execute_evaluator(
        db,
        &message_id,
        &retrieval.record_id,
        &evaluator_input,
        &evaluator_config,
    )?;

    // Verdict -> message status
    let (message_status, show_answer, mut warnings) = match evaluation.status {
        GateStatus::Pass => (MessageStatus::Success, true, vec![]),
        GateStatus::Partial => (
            MessageStatus::Success,
            true,
            evaluation.summary.warnings.clone(),
        ),
        GateStatus::Skipped => (
            MessageStatus::Success,
            true,
            vec!["evaluator_skipped".to_string()],
        ),
        GateStatus::Fail => (
            MessageStatus::Blocked,
            false,
            evaluation.summary.warnings.clone(),
        ),
    };
    if generation.record.status == crate::db::GenerationStatus::Partial {
        if let Some(error) = &generation.record.error_message {
            warnings.push(error.clone());
        }
    }

    db.update_message_status(&message_id, message_status)?;
    if message_status == MessageStatus::Blocked {
        audit.gate_blocked(&kb.id, &message_id, "evaluation", &warnings);
    } else {
        audit.chat_completed(&kb.id, &message_id, message_status.as_str());
    }

    Ok(ChatReply {
        conversation_id,
        message_id: message_id.clone(),
        kb_id: kb.id.clone(),
        status: message_status,
        answer: if show_answer { generation.answer.clone() } else { None },
        citations: if show_answer {
            generation.citations.clone()
        } else {
            vec![]
        },
        evaluator: EvaluatorSummary {
            status: evaluation.status,
            rule_version: evaluation.summary.rule_version.clone(),
            warnings: warnings.clone(),
        },
        reasons: if message_status == MessageStatus::Blocked {
            warnings
        } else {
            vec![]
        },
        refusal: if show_answer {
            None
        } else {
            Some(REFUSAL_TEXT.to_string())
        },
        debug: debug_payload(
            request,
            Some(&retrieval),
            Some(generation.record.id.as_str()),
            Some(evaluation.record.id.as_str()),
            started,
        ),
    })
}

/// Reply for a retrieval-gate block: no generation, no evaluation record.
/// The evaluator summary degrades to `fail` with the gate reasons so callers
/// see a uniform envelope.
#[allow(clippy::too_many_arguments)]
fn blocked_reply(
    conversation_id: String,
    message_id: String,
    kb_id: &str,
    reasons: Vec<String>,
    evaluator_config: &EvaluatorConfig,
    retrieval: Option<&crate::kb::search::RetrievalOutcome>,
    generation_record_id: Option<&String>,
    evaluation_record_id: Option<&String>,
    request: &ChatRequest,
    started: Instant,
) -> ChatReply {
    ChatReply {
        conversation_id,
        message_id,
        kb_id: kb_id.to_string(),
        status: MessageStatus::Blocked,
        answer: None,
        citations: vec![],
        evaluator: EvaluatorSummary {
            status: GateStatus::Fail,
            rule_version: evaluator_config.rule_version.clone(),
            warnings: reasons.clone(),
        },
        reasons,
        refusal: Some(REFUSAL_TEXT.to_string()),
        debug: debug_payload(
            request,
            retrieval,
            generation_record_id.map(|s| s.as_str()),
            evaluation_record_id.map(|s| s.as_str()),
            started,
        ),
    }
}

fn debug_payload(
    request: &ChatRequest,
    retrieval: Option<&crate::kb::search::RetrievalOutcome>,
    generation_record_id: Option<&str>,
    evaluation_record_id: Option<&str>,
    started: Instant,
) -> Option<ChatDebug> {
    let wants_debug = request.debug
        || request.context.return_records.unwrap_or(false)
        || request.context.return_hits.unwrap_or(false);
    if !wants_debug {
        return None;
    }
    let retrieval = retrieval?;
    let include_hits = request.context.return_hits.unwrap_or(true);

    let mut timing = retrieval.timing_ms.clone();
    if let Some(object) = timing.as_object_mut() {
        object.insert(
            "total".into(),
            serde_json::json!(started.elapsed().as_millis() as u64),
        );
    }

    Some(ChatDebug {
        retrieval_record_id: retrieval.record_id.clone(),
        generation_record_id: generation_record_id.map(String::from),
        evaluation_record_id: evaluation_record_id.map(String::from),
        hits: if include_hits {
            retrieval.hits.clone()
        } else {
            vec![]
        },
        provider_snapshot: retrieval.provider_snapshot.clone(),
        timing_ms: timing,
    })
}

/// Build retrieval options from the request context (context > defaults).
/// Strategy names are validated here so a typo is a BadRequest, not a
/// silent fallback.
fn resolve_retrieval_options(context: &ChatContext) -> Result<RetrievalOptions, CoreError> {
    let defaults = RetrievalOptions::default();

    let resolve_k = |value: Option<i64>, default: usize| -> Result<usize, CoreError> {
        match value {
            Some(v) => Ok(validation::validate_top_k(v)?),
            None => Ok(default),
        }
    };

    let fusion_strategy = match &context.fusion_strategy {
        Some(name) => FusionStrategy::parse(name).ok_or_else(|| {
            CoreError::new(
                ErrorCode::BAD_REQUEST_INVALID_STRATEGY,
                format!("Unknown fusion strategy: {}", name),
                crate::error::ErrorCategory::BadRequest,
            )
        })?,
        None => defaults.fusion_strategy,
    };
    let rerank_strategy = match &context.rerank_strategy {
        Some(name) => RerankStrategy::parse(name).ok_or_else(|| {
            CoreError::new(
                ErrorCode::BAD_REQUEST_INVALID_STRATEGY,
                format!("Unknown rerank strategy: {}", name),
                crate::error::ErrorCategory::BadRequest,
            )
        })?,
        None => defaults.rerank_strategy,
    };

    Ok(RetrievalOptions {
        keyword_top_k: resolve_k(context.keyword_top_k, defaults.keyword_top_k)?,
        vector_top_k: resolve_k(context.vector_top_k, defaults.vector_top_k)?,
        fusion_top_k: resolve_k(context.fusion_top_k, defaults.fusion_top_k)?,
        rerank_top_k: resolve_k(context.rerank_top_k, defaults.rerank_top_k)?,
        fusion_strategy,
        rerank_strategy,
        ..defaults
    })
}
