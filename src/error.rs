//! Core error model for lexrag
//!
//! Provides a unified error surface across the pipeline with:
//! - Stable error codes for callers (HTTP layer, CLI)
//! - A category taxonomy matching the trust-pipeline contract
//! - Optional internal details for logging
//! - Retry hints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error categories for grouping and caller dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Schema or range violation in a stage input
    BadRequest,
    /// Referenced entity absent
    NotFound,
    /// Invariant violation inside a stage; implies a bug
    Pipeline,
    /// DB, vector store, or provider unavailable / timed out
    External,
    /// A gate returned `fail`; downstream was skipped
    GateBlocked,
    /// Request cancelled cooperatively
    Cancelled,
    /// File I/O errors
    Io,
    /// Unexpected internal state
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Pipeline => "pipeline",
            Self::External => "external",
            Self::GateBlocked => "gate_blocked",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable error codes, format: CATEGORY_SPECIFIC_ERROR
pub struct ErrorCode;

impl ErrorCode {
    // Bad request
    pub const BAD_REQUEST_EMPTY_QUERY: &'static str = "BAD_REQUEST_EMPTY_QUERY";
    pub const BAD_REQUEST_INVALID_TOP_K: &'static str = "BAD_REQUEST_INVALID_TOP_K";
    pub const BAD_REQUEST_INVALID_STRATEGY: &'static str = "BAD_REQUEST_INVALID_STRATEGY";
    pub const BAD_REQUEST_EMBED_CONFIG_MISMATCH: &'static str = "BAD_REQUEST_EMBED_CONFIG_MISMATCH";
    pub const BAD_REQUEST_INVALID_INPUT: &'static str = "BAD_REQUEST_INVALID_INPUT";

    // Not found
    pub const NOT_FOUND_KB: &'static str = "NOT_FOUND_KB";
    pub const NOT_FOUND_FILE: &'static str = "NOT_FOUND_FILE";
    pub const NOT_FOUND_NODE: &'static str = "NOT_FOUND_NODE";
    pub const NOT_FOUND_CONVERSATION: &'static str = "NOT_FOUND_CONVERSATION";
    pub const NOT_FOUND_RECORD: &'static str = "NOT_FOUND_RECORD";
    pub const NOT_FOUND_PROVIDER: &'static str = "NOT_FOUND_PROVIDER";
    pub const NOT_FOUND_PROMPT: &'static str = "NOT_FOUND_PROMPT";

    // Pipeline invariants
    pub const PIPELINE_CITATION_OUT_OF_SET: &'static str = "PIPELINE_CITATION_OUT_OF_SET";
    pub const PIPELINE_NODE_INDEX_GAP: &'static str = "PIPELINE_NODE_INDEX_GAP";
    pub const PIPELINE_VECTOR_MAP_MISMATCH: &'static str = "PIPELINE_VECTOR_MAP_MISMATCH";
    pub const PIPELINE_DUPLICATE_HIT: &'static str = "PIPELINE_DUPLICATE_HIT";

    // External dependencies
    pub const EXTERNAL_DB: &'static str = "EXTERNAL_DB";
    pub const EXTERNAL_VECTOR_STORE: &'static str = "EXTERNAL_VECTOR_STORE";
    pub const EXTERNAL_EMBEDDING_PROVIDER: &'static str = "EXTERNAL_EMBEDDING_PROVIDER";
    pub const EXTERNAL_MODEL_PROVIDER: &'static str = "EXTERNAL_MODEL_PROVIDER";

    // Gates
    pub const GATE_NO_EVIDENCE: &'static str = "GATE_NO_EVIDENCE";
    pub const GATE_WEAK_QUERY: &'static str = "GATE_WEAK_QUERY";
    pub const GATE_INGEST_FAILED: &'static str = "GATE_INGEST_FAILED";
    pub const GATE_EVALUATOR_FAILED: &'static str = "GATE_EVALUATOR_FAILED";

    // Misc
    pub const CANCELLED: &'static str = "CANCELLED";
    pub const IO_ERROR: &'static str = "IO_ERROR";
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";
}

/// Crate-level error for orchestrator and CLI surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreError {
    /// Stable error code
    pub code: String,
    /// User-facing message
    pub message: String,
    /// Internal details for logging (never shown to end users)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the operation can be retried
    pub retryable: bool,
    /// Error category
    pub category: ErrorCategory,
}

impl CoreError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            retryable: false,
            category,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    // =========================================================================
    // Convenience constructors
    // =========================================================================

    pub fn empty_query() -> Self {
        Self::new(
            ErrorCode::BAD_REQUEST_EMPTY_QUERY,
            "Query must not be empty",
            ErrorCategory::BadRequest,
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BAD_REQUEST_INVALID_INPUT,
            message,
            ErrorCategory::BadRequest,
        )
    }

    pub fn embed_config_mismatch(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BAD_REQUEST_EMBED_CONFIG_MISMATCH,
            message,
            ErrorCategory::BadRequest,
        )
    }

    pub fn kb_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::NOT_FOUND_KB,
            format!("Knowledge base not found: {}", id),
            ErrorCategory::NotFound,
        )
    }

    pub fn node_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::NOT_FOUND_NODE,
            format!("Node not found: {}", id),
            ErrorCategory::NotFound,
        )
    }

    pub fn record_not_found(kind: &str, id: &str) -> Self {
        Self::new(
            ErrorCode::NOT_FOUND_RECORD,
            format!("{} record not found: {}", kind, id),
            ErrorCategory::NotFound,
        )
    }

    pub fn provider_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::NOT_FOUND_PROVIDER,
            format!("Provider not in allowlist: {}", name),
            ErrorCategory::NotFound,
        )
    }

    pub fn pipeline(code: &str, detail: impl Into<String>) -> Self {
        Self::new(
            code,
            "Pipeline invariant violated",
            ErrorCategory::Pipeline,
        )
        .with_detail(detail)
    }

    pub fn external_db(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EXTERNAL_DB,
            "Document store unavailable",
            ErrorCategory::External,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn external_vector_store(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EXTERNAL_VECTOR_STORE,
            "Vector store unavailable",
            ErrorCategory::External,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn external_embedding(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EXTERNAL_EMBEDDING_PROVIDER,
            "Embedding provider failed",
            ErrorCategory::External,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn external_model(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EXTERNAL_MODEL_PROVIDER,
            "Model provider failed",
            ErrorCategory::External,
        )
        .with_detail(detail)
        .retryable()
    }

    pub fn gate_blocked(code: &str, reasons: &[String]) -> Self {
        Self::new(
            code,
            format!("Blocked by gate: {}", reasons.join(", ")),
            ErrorCategory::GateBlocked,
        )
    }

    pub fn cancelled() -> Self {
        Self::new(
            ErrorCode::CANCELLED,
            "Request cancelled",
            ErrorCategory::Cancelled,
        )
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INTERNAL_ERROR,
            "An internal error occurred",
            ErrorCategory::Internal,
        )
        .with_detail(detail)
    }

    /// Stable lowercase word for CLI `status=<word>` output
    pub fn status_word(&self) -> &'static str {
        match self.category {
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Pipeline => "pipeline_error",
            ErrorCategory::External => "failed",
            ErrorCategory::GateBlocked => "blocked",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Io => "io_error",
            ErrorCategory::Internal => "failed",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CoreError {}

// Conversions from module error types

impl From<crate::db::DbError> for CoreError {
    fn from(e: crate::db::DbError) -> Self {
        match e {
            crate::db::DbError::NotFound(what) => Self::new(
                ErrorCode::NOT_FOUND_RECORD,
                format!("Not found: {}", what),
                ErrorCategory::NotFound,
            ),
            other => Self::external_db(other.to_string()),
        }
    }
}

impl From<crate::kb::vectors::VectorError> for CoreError {
    fn from(e: crate::kb::vectors::VectorError) -> Self {
        Self::external_vector_store(e.to_string())
    }
}

impl From<crate::kb::embeddings::EmbeddingError> for CoreError {
    fn from(e: crate::kb::embeddings::EmbeddingError) -> Self {
        use crate::kb::embeddings::EmbeddingError;
        match e {
            // Deterministic configuration errors; retrying cannot help
            EmbeddingError::DimensionMismatch { .. } | EmbeddingError::ModelMismatch { .. } => {
                Self::embed_config_mismatch(e.to_string())
            }
            other => Self::external_embedding(other.to_string()),
        }
    }
}

impl From<crate::llm::LlmError> for CoreError {
    fn from(e: crate::llm::LlmError) -> Self {
        match e {
            crate::llm::LlmError::UnknownProvider(name) => Self::provider_not_found(&name),
            other => Self::external_model(other.to_string()),
        }
    }
}

impl From<crate::validation::ValidationError> for CoreError {
    fn from(e: crate::validation::ValidationError) -> Self {
        match e {
            crate::validation::ValidationError::EmptyInput => Self::empty_query(),
            other => Self::invalid_input(other.to_string()),
        }
    }
}

impl From<crate::kb::ingest::IngestError> for CoreError {
    fn from(e: crate::kb::ingest::IngestError) -> Self {
        use crate::kb::ingest::IngestError;
        match e {
            IngestError::KbNotFound(id) => Self::kb_not_found(&id),
            IngestError::Validation(inner) => inner.into(),
            IngestError::UnsupportedParser(p) => {
                Self::invalid_input(format!("Unsupported parser: {}", p))
            }
            IngestError::Cancelled => Self::cancelled(),
            IngestError::Database(inner) => inner.into(),
            IngestError::Vector(inner) => inner.into(),
            IngestError::Embedding(inner) => inner.into(),
            IngestError::Pdf(inner) => Self::new(
                ErrorCode::BAD_REQUEST_INVALID_INPUT,
                "Failed to parse source document",
                ErrorCategory::BadRequest,
            )
            .with_detail(inner.to_string()),
            IngestError::Io(inner) => inner.into(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::IO_ERROR, "I/O error", ErrorCategory::Io).with_detail(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = CoreError::empty_query();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("BAD_REQUEST_EMPTY_QUERY"));
        assert!(json.contains("bad_request"));
    }

    #[test]
    fn test_external_errors_are_retryable() {
        assert!(CoreError::external_db("timeout").retryable);
        assert!(CoreError::external_model("503").retryable);
        assert!(!CoreError::empty_query().retryable);
    }

    #[test]
    fn test_status_word() {
        assert_eq!(CoreError::empty_query().status_word(), "bad_request");
        assert_eq!(
            CoreError::gate_blocked(ErrorCode::GATE_NO_EVIDENCE, &["no_evidence".into()])
                .status_word(),
            "blocked"
        );
        assert_eq!(CoreError::external_db("x").status_word(), "failed");
    }

    #[test]
    fn test_embed_mismatches_are_bad_request_not_retryable() {
        let err: CoreError = crate::kb::embeddings::EmbeddingError::ModelMismatch {
            expected: "hash-v1".into(),
            requested: "text-embedding-3-small".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::BAD_REQUEST_EMBED_CONFIG_MISMATCH);
        assert_eq!(err.category, ErrorCategory::BadRequest);
        assert!(!err.retryable);

        let err: CoreError = crate::kb::embeddings::EmbeddingError::DimensionMismatch {
            expected: 64,
            actual: 1536,
        }
        .into();
        assert_eq!(err.code, ErrorCode::BAD_REQUEST_EMBED_CONFIG_MISMATCH);
        assert!(!err.retryable);
    }

    #[test]
    fn test_display_includes_code() {
        let err = CoreError::kb_not_found("default");
        let text = err.to_string();
        assert!(text.contains("NOT_FOUND_KB"));
        assert!(text.contains("default"));
    }
}
