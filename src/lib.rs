//! lexrag - trusted RAG core for legal question answering
//!
//! For every query the core produces an answer with a verifiable, replayable
//! evidence chain, or an explicit refusal. Four gated stages: ingest,
//! retrieval, generation, evaluation. Every intermediate artifact is
//! persisted and addressable by id.

pub mod audit;
pub mod chat;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod generation;
pub mod kb;
pub mod llm;
pub mod prompts;
pub mod validation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::chat::{ChatReply, ChatRequest};
use crate::db::Database;
use crate::error::CoreError;
use crate::kb::embeddings::EmbeddingRegistry;
use crate::kb::ingest::{ingest_file, IngestOutcome, IngestRequest};
use crate::kb::vectors::VectorStore;
use crate::llm::ProviderRegistry;

/// Request-scoped cancellation flag, honored cooperatively at every
/// suspension point in the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide core state: stores, provider registries, and the audit log.
/// Engines take explicit references; this struct owns the locking.
pub struct CoreState {
    pub db: tokio::sync::Mutex<Database>,
    pub vectors: tokio::sync::RwLock<VectorStore>,
    pub embeddings: EmbeddingRegistry,
    pub chat_providers: ProviderRegistry,
    pub audit: AuditLog,
}

impl CoreState {
    pub fn new(
        db: Database,
        vectors: VectorStore,
        embeddings: EmbeddingRegistry,
        chat_providers: ProviderRegistry,
        audit: AuditLog,
    ) -> Self {
        Self {
            db: tokio::sync::Mutex::new(db),
            vectors: tokio::sync::RwLock::new(vectors),
            embeddings,
            chat_providers,
            audit,
        }
    }

    /// Run one chat turn
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancelFlag,
    ) -> Result<ChatReply, CoreError> {
        let db = self.db.lock().await;
        let vectors = self.vectors.read().await;
        chat::chat(
            &db,
            &vectors,
            &self.embeddings,
            &self.chat_providers,
            &self.audit,
            request,
            cancel,
        )
        .await
    }

    /// Ingest one source file into a KB, resolving the KB's embedding
    /// configuration
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancelFlag,
    ) -> Result<IngestOutcome, CoreError> {
        let db = self.db.lock().await;
        let vectors = self.vectors.read().await;
        let kb = db
            .get_kb(&request.kb_id)?
            .ok_or_else(|| CoreError::kb_not_found(&request.kb_id))?;
        let embedder =
            self.embeddings
                .resolve(&kb.embed_provider, &kb.embed_model, kb.embed_dim)?;

        let outcome = ingest_file(&db, &vectors, embedder.as_ref(), request, cancel).await?;
        self.audit.ingest_completed(
            &kb.id,
            &outcome.file_id,
            outcome.ingest_status.as_str(),
            outcome.node_count,
            outcome.short_circuited,
        );
        Ok(outcome)
    }
}
