//! Document store for lexrag
//! SQLite with FTS5 full-text search over evidence nodes, plus the
//! record tables that make every pipeline stage replayable.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Characters of node text copied into hit excerpts
const EXCERPT_CHARS: usize = 240;

/// Minimal stopword list used to detect queries with no searchable content
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "was", "what", "when", "where", "which", "who", "with",
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Database corruption detected")]
    Corruption,
    #[error("FTS5 not available in this build")]
    Fts5NotAvailable,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Entities ──────────────────────────────────────────────────────────────────

/// A named corpus with its own embedding configuration and vector collection.
/// Immutable once a file references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub vector_collection: String,
    pub embed_provider: String,
    pub embed_model: String,
    pub embed_dim: usize,
    /// Sentence-window size used by the segmenter
    pub chunk_window: usize,
    /// Minimum characters a node must carry
    pub min_node_chars: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Success,
    Failed,
}

impl IngestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One ingested source file. `sha256` is the idempotency key within a KB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: String,
    pub kb_id: String,
    pub file_name: String,
    pub sha256: String,
    pub ingest_status: IngestStatus,
    pub pages: i64,
    pub node_count: i64,
    pub timing_ms: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// Logical document derived from a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub kb_id: String,
    pub file_id: String,
    pub title: Option<String>,
    pub page_count: i64,
    pub parser: String,
    pub parser_version: String,
}

/// Smallest addressable evidence unit: an ordered chunk of a parsed document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub kb_id: String,
    pub file_id: String,
    pub document_id: String,
    /// 0-based, contiguous per file, reading order
    pub node_index: i64,
    pub text: String,
    pub page: i64,
    pub article_id: Option<String>,
    pub section_path: Option<String>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub meta: serde_json::Value,
}

/// Exactly one live vector per node per embed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVectorMap {
    pub node_id: String,
    pub vector_id: String,
    pub kb_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kb_id: String,
    pub title: Option<String>,
    pub created_at: String,
}

/// The single observable truth of a query outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Success,
    Failed,
    Blocked,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: String,
}

/// Provenance of a persisted hit: the last stage that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Keyword,
    Vector,
    Fused,
    Reranked,
}

impl HitSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::Fused => "fused",
            Self::Reranked => "reranked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyword" => Some(Self::Keyword),
            "vector" => Some(Self::Vector),
            "fused" => Some(Self::Fused),
            "reranked" => Some(Self::Reranked),
            _ => None,
        }
    }
}

/// Snapshot of one retrieval execution, 1:1 with a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub id: String,
    pub message_id: String,
    pub kb_id: String,
    pub query_text: String,
    pub keyword_top_k: i64,
    pub vector_top_k: i64,
    pub fusion_top_k: i64,
    pub rerank_top_k: i64,
    pub fusion_strategy: String,
    pub rerank_strategy: String,
    pub provider_snapshot: serde_json::Value,
    pub timing_ms: serde_json::Value,
    pub created_at: String,
}

/// A retrieval result referring to a node, with provenance and scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub id: String,
    pub retrieval_record_id: String,
    pub node_id: String,
    pub source: HitSource,
    pub rank: i64,
    pub score: f64,
    pub score_details: serde_json::Value,
    pub excerpt: String,
    pub page: Option<i64>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    Partial,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Replayable snapshot of one model generation, 1:1 with a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: String,
    pub message_id: String,
    pub retrieval_record_id: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub model_provider: String,
    pub model_name: String,
    pub messages_snapshot: serde_json::Value,
    pub output_raw: String,
    pub output_structured: Option<serde_json::Value>,
    pub citations: serde_json::Value,
    pub status: GenerationStatus,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// Evaluator verdict snapshot for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: String,
    pub message_id: String,
    pub retrieval_record_id: String,
    pub generation_record_id: String,
    pub status: crate::gate::GateStatus,
    pub rule_version: String,
    pub config: serde_json::Value,
    pub checks: serde_json::Value,
    pub scores: serde_json::Value,
    pub meta: serde_json::Value,
    pub created_at: String,
}

/// Keyword recall row with the raw and normalized BM25 score
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub node_id: String,
    pub file_id: String,
    pub document_id: String,
    /// Raw SQLite bm25() value (better matches are more negative)
    pub raw_bm25: f64,
    /// Normalized higher-is-better score (`abs_bm25`)
    pub score: f64,
    pub excerpt: String,
    pub text: String,
    pub page: i64,
    pub article_id: Option<String>,
    pub section_path: Option<String>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
}

// ── Database ──────────────────────────────────────────────────────────────────

/// Document store handle. Transactions are scoped to a single ingest
/// (all-or-nothing per file).
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.verify_fts5()?;
        Ok(db)
    }

    /// Open an in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.verify_fts5()?;
        Ok(db)
    }

    /// Initialize schema, running migrations as needed
    pub fn initialize(&self) -> Result<(), DbError> {
        self.check_integrity()?;
        let version = self.get_schema_version()?;
        if version < CURRENT_SCHEMA_VERSION {
            self.run_migrations(version)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Verify FTS5 is available (hard requirement for keyword recall)
    pub fn verify_fts5(&self) -> Result<bool, DbError> {
        let result: SqliteResult<i32> = self.conn.query_row(
            "SELECT 1 WHERE EXISTS (SELECT 1 FROM pragma_compile_options WHERE compile_options = 'ENABLE_FTS5')",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                match self.conn.execute(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS _fts5_test USING fts5(content)",
                    [],
                ) {
                    Ok(_) => {
                        self.conn.execute("DROP TABLE IF EXISTS _fts5_test", [])?;
                        Ok(true)
                    }
                    Err(_) => Err(DbError::Fts5NotAvailable),
                }
            }
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    pub fn check_integrity(&self) -> Result<(), DbError> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(DbError::Corruption);
        }
        Ok(())
    }

    fn get_schema_version(&self) -> Result<i32, DbError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let version: SqliteResult<String> = self.conn.query_row(
            "SELECT value FROM settings WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        );

        match version {
            Ok(v) => v
                .parse()
                .map_err(|_| DbError::Migration("Invalid schema version".into())),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    fn set_schema_version(&self, version: i32) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?)",
            params![version.to_string()],
        )?;
        Ok(())
    }

    fn run_migrations(&self, from_version: i32) -> Result<(), DbError> {
        let tx = self.conn.unchecked_transaction()?;
        if from_version < 1 {
            self.migrate_v1()?;
        }
        tx.commit()?;
        self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// Migration to v1: full trust-pipeline schema
    fn migrate_v1(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_base (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                vector_collection TEXT NOT NULL,
                embed_provider TEXT NOT NULL,
                embed_model TEXT NOT NULL,
                embed_dim INTEGER NOT NULL,
                chunk_window INTEGER NOT NULL DEFAULT 2,
                min_node_chars INTEGER NOT NULL DEFAULT 24,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS knowledge_file (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL REFERENCES knowledge_base(id) ON DELETE CASCADE,
                file_name TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                ingest_status TEXT NOT NULL DEFAULT 'pending',
                pages INTEGER NOT NULL DEFAULT 0,
                node_count INTEGER NOT NULL DEFAULT 0,
                timing_ms TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(kb_id, sha256)
            );
            CREATE INDEX IF NOT EXISTS idx_file_kb ON knowledge_file(kb_id);

            CREATE TABLE IF NOT EXISTS document (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL REFERENCES knowledge_base(id) ON DELETE CASCADE,
                file_id TEXT NOT NULL REFERENCES knowledge_file(id) ON DELETE CASCADE,
                title TEXT,
                page_count INTEGER NOT NULL DEFAULT 0,
                parser TEXT NOT NULL,
                parser_version TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_document_file ON document(file_id);

            CREATE TABLE IF NOT EXISTS node (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL,
                file_id TEXT NOT NULL REFERENCES knowledge_file(id) ON DELETE CASCADE,
                document_id TEXT NOT NULL REFERENCES document(id) ON DELETE CASCADE,
                node_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                article_id TEXT,
                section_path TEXT,
                start_offset INTEGER,
                end_offset INTEGER,
                meta TEXT NOT NULL DEFAULT '{}',
                UNIQUE(file_id, node_index)
            );
            CREATE INDEX IF NOT EXISTS idx_node_kb ON node(kb_id);
            CREATE INDEX IF NOT EXISTS idx_node_document_page ON node(document_id, page);

            CREATE VIRTUAL TABLE IF NOT EXISTS node_fts USING fts5(
                text,
                content='node',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS node_fts_ai AFTER INSERT ON node BEGIN
                INSERT INTO node_fts(rowid, text) VALUES (new.rowid, new.text);
            END;
            CREATE TRIGGER IF NOT EXISTS node_fts_ad AFTER DELETE ON node BEGIN
                INSERT INTO node_fts(node_fts, rowid, text) VALUES('delete', old.rowid, old.text);
            END;
            CREATE TRIGGER IF NOT EXISTS node_fts_au AFTER UPDATE ON node BEGIN
                INSERT INTO node_fts(node_fts, rowid, text) VALUES('delete', old.rowid, old.text);
                INSERT INTO node_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TABLE IF NOT EXISTS node_vector_map (
                node_id TEXT PRIMARY KEY REFERENCES node(id) ON DELETE CASCADE,
                vector_id TEXT NOT NULL,
                kb_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nvm_kb ON node_vector_map(kb_id);

            CREATE TABLE IF NOT EXISTS conversation (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversation(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_conversation ON message(conversation_id);

            CREATE TABLE IF NOT EXISTS retrieval_record (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                kb_id TEXT NOT NULL,
                query_text TEXT NOT NULL,
                keyword_top_k INTEGER NOT NULL,
                vector_top_k INTEGER NOT NULL,
                fusion_top_k INTEGER NOT NULL,
                rerank_top_k INTEGER NOT NULL,
                fusion_strategy TEXT NOT NULL,
                rerank_strategy TEXT NOT NULL,
                provider_snapshot TEXT NOT NULL DEFAULT '{}',
                timing_ms TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS retrieval_hit (
                id TEXT PRIMARY KEY,
                retrieval_record_id TEXT NOT NULL REFERENCES retrieval_record(id) ON DELETE CASCADE,
                node_id TEXT NOT NULL,
                source TEXT NOT NULL,
                rank INTEGER NOT NULL,
                score REAL NOT NULL,
                score_details TEXT NOT NULL DEFAULT '{}',
                excerpt TEXT NOT NULL DEFAULT '',
                page INTEGER,
                start_offset INTEGER,
                end_offset INTEGER,
                UNIQUE(retrieval_record_id, source, node_id)
            );
            CREATE INDEX IF NOT EXISTS idx_hit_record ON retrieval_hit(retrieval_record_id);

            CREATE TABLE IF NOT EXISTS generation_record (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                retrieval_record_id TEXT NOT NULL REFERENCES retrieval_record(id) ON DELETE CASCADE,
                prompt_name TEXT NOT NULL,
                prompt_version TEXT NOT NULL DEFAULT '',
                model_provider TEXT NOT NULL,
                model_name TEXT NOT NULL,
                messages_snapshot TEXT NOT NULL DEFAULT '{}',
                output_raw TEXT NOT NULL DEFAULT '',
                output_structured TEXT,
                citations TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'success',
                error_message TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evaluation_record (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                retrieval_record_id TEXT NOT NULL,
                generation_record_id TEXT NOT NULL,
                status TEXT NOT NULL,
                rule_version TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                checks TEXT NOT NULL DEFAULT '[]',
                scores TEXT NOT NULL DEFAULT '{}',
                meta TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_eval_message ON evaluation_record(message_id);
            "#,
        )?;
        Ok(())
    }

    // ── Knowledge bases ───────────────────────────────────────────────────────

    pub fn insert_kb(&self, kb: &KnowledgeBase) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO knowledge_base
                (id, name, vector_collection, embed_provider, embed_model, embed_dim,
                 chunk_window, min_node_chars, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                kb.id,
                kb.name,
                kb.vector_collection,
                kb.embed_provider,
                kb.embed_model,
                kb.embed_dim as i64,
                kb.chunk_window as i64,
                kb.min_node_chars as i64,
                kb.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_kb(&self, id: &str) -> Result<Option<KnowledgeBase>, DbError> {
        let kb = self
            .conn
            .query_row(
                "SELECT id, name, vector_collection, embed_provider, embed_model, embed_dim,
                        chunk_window, min_node_chars, created_at
                 FROM knowledge_base WHERE id = ?",
                params![id],
                Self::map_kb,
            )
            .optional()?;
        Ok(kb)
    }

    pub fn list_kbs(&self) -> Result<Vec<KnowledgeBase>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, vector_collection, embed_provider, embed_model, embed_dim,
                    chunk_window, min_node_chars, created_at
             FROM knowledge_base ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], Self::map_kb)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_kb(row: &rusqlite::Row<'_>) -> SqliteResult<KnowledgeBase> {
        Ok(KnowledgeBase {
            id: row.get(0)?,
            name: row.get(1)?,
            vector_collection: row.get(2)?,
            embed_provider: row.get(3)?,
            embed_model: row.get(4)?,
            embed_dim: row.get::<_, i64>(5)? as usize,
            chunk_window: row.get::<_, i64>(6)? as usize,
            min_node_chars: row.get::<_, i64>(7)? as usize,
            created_at: row.get(8)?,
        })
    }

    // ── Knowledge files ───────────────────────────────────────────────────────

    pub fn insert_file(&self, file: &KnowledgeFile) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO knowledge_file
                (id, kb_id, file_name, sha256, ingest_status, pages, node_count,
                 timing_ms, error_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                file.id,
                file.kb_id,
                file.file_name,
                file.sha256,
                file.ingest_status.as_str(),
                file.pages,
                file.node_count,
                serde_json::to_string(&file.timing_ms)?,
                file.error_message,
                file.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, id: &str) -> Result<Option<KnowledgeFile>, DbError> {
        let file = self
            .conn
            .query_row(
                "SELECT id, kb_id, file_name, sha256, ingest_status, pages, node_count,
                        timing_ms, error_message, created_at
                 FROM knowledge_file WHERE id = ?",
                params![id],
                Self::map_file,
            )
            .optional()?;
        Ok(file)
    }

    /// Idempotency lookup: same content in the same KB
    pub fn find_file_by_sha256(
        &self,
        kb_id: &str,
        sha256: &str,
    ) -> Result<Option<KnowledgeFile>, DbError> {
        let file = self
            .conn
            .query_row(
                "SELECT id, kb_id, file_name, sha256, ingest_status, pages, node_count,
                        timing_ms, error_message, created_at
                 FROM knowledge_file WHERE kb_id = ? AND sha256 = ?",
                params![kb_id, sha256],
                Self::map_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn mark_file_failed(&self, id: &str, error: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE knowledge_file SET ingest_status = 'failed', error_message = ? WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }

    pub fn delete_file(&self, id: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM knowledge_file WHERE id = ?", params![id])?;
        Ok(())
    }

    fn map_file(row: &rusqlite::Row<'_>) -> SqliteResult<KnowledgeFile> {
        let status: String = row.get(4)?;
        let timing: String = row.get(7)?;
        Ok(KnowledgeFile {
            id: row.get(0)?,
            kb_id: row.get(1)?,
            file_name: row.get(2)?,
            sha256: row.get(3)?,
            ingest_status: IngestStatus::parse(&status).unwrap_or(IngestStatus::Failed),
            pages: row.get(5)?,
            node_count: row.get(6)?,
            timing_ms: serde_json::from_str(&timing).unwrap_or(serde_json::Value::Null),
            error_message: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    // ── Documents and nodes ───────────────────────────────────────────────────

    /// Persist the parsed output of one file in a single transaction:
    /// document + nodes + vector mappings, then flip the file to `success`.
    /// Verifies node ordering and the node/vector-map count invariant first.
    pub fn persist_ingest(
        &self,
        document: &DocumentRecord,
        nodes: &[NodeRecord],
        maps: &[NodeVectorMap],
        timing_ms: &serde_json::Value,
    ) -> Result<(), DbError> {
        for (i, node) in nodes.iter().enumerate() {
            if node.node_index != i as i64 {
                return Err(DbError::Invariant(format!(
                    "node_index gap: expected {} got {}",
                    i, node.node_index
                )));
            }
        }
        if nodes.len() != maps.len() {
            return Err(DbError::Invariant(format!(
                "vector map count {} != node count {}",
                maps.len(),
                nodes.len()
            )));
        }

        let tx = self.conn.unchecked_transaction()?;

        Self::insert_document_on(&tx, document)?;
        for node in nodes {
            Self::insert_node_on(&tx, node)?;
        }
        for map in maps {
            Self::upsert_node_vector_map_on(&tx, map)?;
        }

        tx.execute(
            "UPDATE knowledge_file
             SET ingest_status = 'success', pages = ?, node_count = ?, timing_ms = ?
             WHERE id = ?",
            params![
                document.page_count,
                nodes.len() as i64,
                serde_json::to_string(timing_ms)?,
                document.file_id,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn insert_document(&self, document: &DocumentRecord) -> Result<(), DbError> {
        Self::insert_document_on(&self.conn, document)
    }

    pub fn insert_node(&self, node: &NodeRecord) -> Result<(), DbError> {
        Self::insert_node_on(&self.conn, node)
    }

    /// Exactly one live vector per node per embed configuration
    pub fn upsert_node_vector_map(&self, map: &NodeVectorMap) -> Result<(), DbError> {
        Self::upsert_node_vector_map_on(&self.conn, map)
    }

    fn insert_document_on(conn: &Connection, document: &DocumentRecord) -> Result<(), DbError> {
        conn.execute(
            "INSERT INTO document (id, kb_id, file_id, title, page_count, parser, parser_version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                document.id,
                document.kb_id,
                document.file_id,
                document.title,
                document.page_count,
                document.parser,
                document.parser_version,
            ],
        )?;
        Ok(())
    }

    fn insert_node_on(conn: &Connection, node: &NodeRecord) -> Result<(), DbError> {
        conn.execute(
            "INSERT INTO node
                (id, kb_id, file_id, document_id, node_index, text, page,
                 article_id, section_path, start_offset, end_offset, meta)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                node.id,
                node.kb_id,
                node.file_id,
                node.document_id,
                node.node_index,
                node.text,
                node.page,
                node.article_id,
                node.section_path,
                node.start_offset,
                node.end_offset,
                serde_json::to_string(&node.meta)?,
            ],
        )?;
        Ok(())
    }

    fn upsert_node_vector_map_on(conn: &Connection, map: &NodeVectorMap) -> Result<(), DbError> {
        conn.execute(
            "INSERT OR REPLACE INTO node_vector_map (node_id, vector_id, kb_id)
             VALUES (?, ?, ?)",
            params![map.node_id, map.vector_id, map.kb_id],
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, DbError> {
        let node = self
            .conn
            .query_row(
                "SELECT id, kb_id, file_id, document_id, node_index, text, page,
                        article_id, section_path, start_offset, end_offset, meta
                 FROM node WHERE id = ?",
                params![id],
                Self::map_node,
            )
            .optional()?;
        Ok(node)
    }

    pub fn get_nodes(&self, ids: &[String]) -> Result<Vec<NodeRecord>, DbError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders: String = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, kb_id, file_id, document_id, node_index, text, page,
                    article_id, section_path, start_offset, end_offset, meta
             FROM node WHERE id IN ({})",
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), Self::map_node)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_nodes(&self, file_id: &str) -> Result<i64, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM node WHERE file_id = ?",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_vector_maps(&self, file_id: &str) -> Result<i64, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM node_vector_map WHERE node_id IN
                (SELECT id FROM node WHERE file_id = ?)",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Evidence preview: node texts of a page in reading order, capped at
    /// `max_chars` characters.
    pub fn get_page(
        &self,
        document_id: &str,
        page: i64,
        max_chars: usize,
    ) -> Result<Option<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT text FROM node WHERE document_id = ? AND page = ? ORDER BY node_index",
        )?;
        let texts = stmt
            .query_map(params![document_id, page], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if texts.is_empty() {
            return Ok(None);
        }
        let joined = texts.join("\n\n");
        Ok(Some(joined.chars().take(max_chars).collect()))
    }

    fn map_node(row: &rusqlite::Row<'_>) -> SqliteResult<NodeRecord> {
        let meta: String = row.get(11)?;
        Ok(NodeRecord {
            id: row.get(0)?,
            kb_id: row.get(1)?,
            file_id: row.get(2)?,
            document_id: row.get(3)?,
            node_index: row.get(4)?,
            text: row.get(5)?,
            page: row.get(6)?,
            article_id: row.get(7)?,
            section_path: row.get(8)?,
            start_offset: row.get(9)?,
            end_offset: row.get(10)?,
            meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        })
    }

    // ── Keyword search ────────────────────────────────────────────────────────

    /// Build an FTS5 MATCH expression from free text. Returns `None` when the
    /// query carries no searchable tokens (empty or stopwords only), which the
    /// retrieval gate reports as `weak_query`.
    pub fn fts_match_expr(query: &str) -> Option<String> {
        let tokens: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .map(|t| format!("\"{}\"", t))
            .collect();
        if tokens.is_empty() {
            return None;
        }
        Some(tokens.join(" OR "))
    }

    /// BM25 keyword recall over node text, scoped to one KB.
    /// Raw bm25() is lower-is-better; the returned `score` is normalized to
    /// higher-is-better via absolute value (`abs_bm25`).
    pub fn search_nodes_by_keyword(
        &self,
        kb_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>, DbError> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let match_expr = match Self::fts_match_expr(query) {
            Some(expr) => expr,
            None => return Ok(vec![]),
        };

        let mut stmt = self.conn.prepare(
            "SELECT node.id, node.file_id, node.document_id, node.text, node.page,
                    node.article_id, node.section_path, node.start_offset, node.end_offset,
                    bm25(node_fts) AS rank
             FROM node_fts
             JOIN node ON node_fts.rowid = node.rowid
             WHERE node_fts MATCH ?1 AND node.kb_id = ?2
             ORDER BY rank
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(params![match_expr, kb_id, top_k as i64], |row| {
                let text: String = row.get(3)?;
                let raw: f64 = row.get(9)?;
                Ok(KeywordHit {
                    node_id: row.get(0)?,
                    file_id: row.get(1)?,
                    document_id: row.get(2)?,
                    excerpt: text.chars().take(EXCERPT_CHARS).collect(),
                    text,
                    page: row.get(4)?,
                    article_id: row.get(5)?,
                    section_path: row.get(6)?,
                    start_offset: row.get(7)?,
                    end_offset: row.get(8)?,
                    raw_bm25: raw,
                    score: raw.abs(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    // ── Conversations and messages ────────────────────────────────────────────

    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO conversation (id, kb_id, title, created_at) VALUES (?, ?, ?, ?)",
            params![
                conversation.id,
                conversation.kb_id,
                conversation.title,
                conversation.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, DbError> {
        let conversation = self
            .conn
            .query_row(
                "SELECT id, kb_id, title, created_at FROM conversation WHERE id = ?",
                params![id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        kb_id: row.get(1)?,
                        title: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn insert_message(&self, message: &Message) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO message (id, conversation_id, role, content, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                message.id,
                message.conversation_id,
                message.role,
                message.content,
                message.status.as_str(),
                message.created_at
            ],
        )?;
        Ok(())
    }

    pub fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE message SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>, DbError> {
        let message = self
            .conn
            .query_row(
                "SELECT id, conversation_id, role, content, status, created_at
                 FROM message WHERE id = ?",
                params![id],
                |row| {
                    let status: String = row.get(4)?;
                    Ok(Message {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        role: row.get(2)?,
                        content: row.get(3)?,
                        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Failed),
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(message)
    }

    // ── Retrieval records ─────────────────────────────────────────────────────

    /// Write the record and its hits atomically
    pub fn insert_retrieval_record(
        &self,
        record: &RetrievalRecord,
        hits: &[RetrievalHit],
    ) -> Result<(), DbError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO retrieval_record
                (id, message_id, kb_id, query_text, keyword_top_k, vector_top_k,
                 fusion_top_k, rerank_top_k, fusion_strategy, rerank_strategy,
                 provider_snapshot, timing_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.message_id,
                record.kb_id,
                record.query_text,
                record.keyword_top_k,
                record.vector_top_k,
                record.fusion_top_k,
                record.rerank_top_k,
                record.fusion_strategy,
                record.rerank_strategy,
                serde_json::to_string(&record.provider_snapshot)?,
                serde_json::to_string(&record.timing_ms)?,
                record.created_at,
            ],
        )?;
        for hit in hits {
            tx.execute(
                "INSERT INTO retrieval_hit
                    (id, retrieval_record_id, node_id, source, rank, score,
                     score_details, excerpt, page, start_offset, end_offset)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    hit.id,
                    hit.retrieval_record_id,
                    hit.node_id,
                    hit.source.as_str(),
                    hit.rank,
                    hit.score,
                    serde_json::to_string(&hit.score_details)?,
                    hit.excerpt,
                    hit.page,
                    hit.start_offset,
                    hit.end_offset,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_retrieval_record(&self, id: &str) -> Result<Option<RetrievalRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, message_id, kb_id, query_text, keyword_top_k, vector_top_k,
                        fusion_top_k, rerank_top_k, fusion_strategy, rerank_strategy,
                        provider_snapshot, timing_ms, created_at
                 FROM retrieval_record WHERE id = ?",
                params![id],
                Self::map_retrieval_record,
            )
            .optional()?;
        Ok(record)
    }

    fn map_retrieval_record(row: &rusqlite::Row<'_>) -> SqliteResult<RetrievalRecord> {
        let snapshot: String = row.get(10)?;
        let timing: String = row.get(11)?;
        Ok(RetrievalRecord {
            id: row.get(0)?,
            message_id: row.get(1)?,
            kb_id: row.get(2)?,
            query_text: row.get(3)?,
            keyword_top_k: row.get(4)?,
            vector_top_k: row.get(5)?,
            fusion_top_k: row.get(6)?,
            rerank_top_k: row.get(7)?,
            fusion_strategy: row.get(8)?,
            rerank_strategy: row.get(9)?,
            provider_snapshot: serde_json::from_str(&snapshot).unwrap_or(serde_json::Value::Null),
            timing_ms: serde_json::from_str(&timing).unwrap_or(serde_json::Value::Null),
            created_at: row.get(12)?,
        })
    }

    /// Hits of a record, final stage first, rank order within each source
    pub fn get_retrieval_hits(&self, record_id: &str) -> Result<Vec<RetrievalHit>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, retrieval_record_id, node_id, source, rank, score,
                    score_details, excerpt, page, start_offset, end_offset
             FROM retrieval_hit WHERE retrieval_record_id = ?
             ORDER BY source, rank",
        )?;
        let rows = stmt
            .query_map(params![record_id], |row| {
                let source: String = row.get(3)?;
                let details: String = row.get(6)?;
                Ok(RetrievalHit {
                    id: row.get(0)?,
                    retrieval_record_id: row.get(1)?,
                    node_id: row.get(2)?,
                    source: HitSource::parse(&source).unwrap_or(HitSource::Fused),
                    rank: row.get(4)?,
                    score: row.get(5)?,
                    score_details: serde_json::from_str(&details)
                        .unwrap_or(serde_json::Value::Null),
                    excerpt: row.get(7)?,
                    page: row.get(8)?,
                    start_offset: row.get(9)?,
                    end_offset: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Generation records ────────────────────────────────────────────────────

    pub fn insert_generation_record(&self, record: &GenerationRecord) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO generation_record
                (id, message_id, retrieval_record_id, prompt_name, prompt_version,
                 model_provider, model_name, messages_snapshot, output_raw,
                 output_structured, citations, status, error_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.message_id,
                record.retrieval_record_id,
                record.prompt_name,
                record.prompt_version,
                record.model_provider,
                record.model_name,
                serde_json::to_string(&record.messages_snapshot)?,
                record.output_raw,
                record
                    .output_structured
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&record.citations)?,
                record.status.as_str(),
                record.error_message,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_generation_record(&self, id: &str) -> Result<Option<GenerationRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, message_id, retrieval_record_id, prompt_name, prompt_version,
                        model_provider, model_name, messages_snapshot, output_raw,
                        output_structured, citations, status, error_message, created_at
                 FROM generation_record WHERE id = ?",
                params![id],
                |row| {
                    let snapshot: String = row.get(7)?;
                    let structured: Option<String> = row.get(9)?;
                    let citations: String = row.get(10)?;
                    let status: String = row.get(11)?;
                    Ok(GenerationRecord {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        retrieval_record_id: row.get(2)?,
                        prompt_name: row.get(3)?,
                        prompt_version: row.get(4)?,
                        model_provider: row.get(5)?,
                        model_name: row.get(6)?,
                        messages_snapshot: serde_json::from_str(&snapshot)
                            .unwrap_or(serde_json::Value::Null),
                        output_raw: row.get(8)?,
                        output_structured: structured
                            .and_then(|s| serde_json::from_str(&s).ok()),
                        citations: serde_json::from_str(&citations)
                            .unwrap_or(serde_json::Value::Null),
                        status: GenerationStatus::parse(&status)
                            .unwrap_or(GenerationStatus::Failed),
                        error_message: row.get(12)?,
                        created_at: row.get(13)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ── Evaluation records ────────────────────────────────────────────────────

    pub fn insert_evaluation_record(&self, record: &EvaluationRecord) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO evaluation_record
                (id, message_id, retrieval_record_id, generation_record_id, status,
                 rule_version, config, checks, scores, meta, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                record.message_id,
                record.retrieval_record_id,
                record.generation_record_id,
                record.status.as_str(),
                record.rule_version,
                serde_json::to_string(&record.config)?,
                serde_json::to_string(&record.checks)?,
                serde_json::to_string(&record.scores)?,
                serde_json::to_string(&record.meta)?,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_evaluation_record(&self, id: &str) -> Result<Option<EvaluationRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, message_id, retrieval_record_id, generation_record_id, status,
                        rule_version, config, checks, scores, meta, created_at
                 FROM evaluation_record WHERE id = ?",
                params![id],
                |row| {
                    let status: String = row.get(4)?;
                    let config: String = row.get(6)?;
                    let checks: String = row.get(7)?;
                    let scores: String = row.get(8)?;
                    let meta: String = row.get(9)?;
                    Ok(EvaluationRecord {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        retrieval_record_id: row.get(2)?,
                        generation_record_id: row.get(3)?,
                        status: crate::gate::GateStatus::parse(&status)
                            .unwrap_or(crate::gate::GateStatus::Fail),
                        rule_version: row.get(5)?,
                        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
                        checks: serde_json::from_str(&checks).unwrap_or(serde_json::Value::Null),
                        scores: serde_json::from_str(&scores).unwrap_or(serde_json::Value::Null),
                        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

/// RFC3339 timestamp for record columns
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn test_kb(db: &Database) -> KnowledgeBase {
        let kb = KnowledgeBase {
            id: "kb-1".into(),
            name: "default".into(),
            vector_collection: "kb_default".into(),
            embed_provider: "hash".into(),
            embed_model: "hash-v1".into(),
            embed_dim: 64,
            chunk_window: 2,
            min_node_chars: 24,
            created_at: now_rfc3339(),
        };
        db.insert_kb(&kb).unwrap();
        kb
    }

    fn seed_file(db: &Database, kb_id: &str, sha: &str) -> (KnowledgeFile, DocumentRecord) {
        let file = KnowledgeFile {
            id: uuid::Uuid::new_v4().to_string(),
            kb_id: kb_id.into(),
            file_name: "tenancy.pdf".into(),
            sha256: sha.into(),
            ingest_status: IngestStatus::Pending,
            pages: 0,
            node_count: 0,
            timing_ms: serde_json::json!({}),
            error_message: None,
            created_at: now_rfc3339(),
        };
        db.insert_file(&file).unwrap();
        let document = DocumentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kb_id: kb_id.into(),
            file_id: file.id.clone(),
            title: Some("Tenancy Law".into()),
            page_count: 2,
            parser: "pdfium".into(),
            parser_version: "1".into(),
        };
        (file, document)
    }

    fn node(kb: &str, file: &str, doc: &str, index: i64, text: &str, page: i64) -> NodeRecord {
        NodeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kb_id: kb.into(),
            file_id: file.into(),
            document_id: doc.into(),
            node_index: index,
            text: text.into(),
            page,
            article_id: None,
            section_path: None,
            start_offset: Some(0),
            end_offset: Some(text.len() as i64),
            meta: serde_json::json!({}),
        }
    }

    #[test]
    fn test_schema_initializes() {
        let db = test_db();
        assert!(db.verify_fts5().unwrap());
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_kb_roundtrip_and_unique_name() {
        let db = test_db();
        let kb = test_kb(&db);
        let loaded = db.get_kb(&kb.id).unwrap().unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.embed_dim, 64);

        // Second KB with the same name is rejected
        let mut dup = kb.clone();
        dup.id = "kb-2".into();
        assert!(db.insert_kb(&dup).is_err());
    }

    #[test]
    fn test_sha256_unique_per_kb() {
        let db = test_db();
        let kb = test_kb(&db);
        let (_f1, _) = seed_file(&db, &kb.id, "aaaa");
        let f2 = KnowledgeFile {
            id: uuid::Uuid::new_v4().to_string(),
            kb_id: kb.id.clone(),
            file_name: "copy.pdf".into(),
            sha256: "aaaa".into(),
            ingest_status: IngestStatus::Pending,
            pages: 0,
            node_count: 0,
            timing_ms: serde_json::json!({}),
            error_message: None,
            created_at: now_rfc3339(),
        };
        assert!(db.insert_file(&f2).is_err());
        assert!(db.find_file_by_sha256(&kb.id, "aaaa").unwrap().is_some());
    }

    #[test]
    fn test_persist_ingest_and_keyword_search() {
        let db = test_db();
        let kb = test_kb(&db);
        let (file, document) = seed_file(&db, &kb.id, "bbbb");

        let nodes = vec![
            node(
                &kb.id,
                &file.id,
                &document.id,
                0,
                "The landlord may not increase rent during the lease term.",
                1,
            ),
            node(
                &kb.id,
                &file.id,
                &document.id,
                1,
                "Eviction requires twelve months written notice through a notary.",
                2,
            ),
        ];
        let maps: Vec<NodeVectorMap> = nodes
            .iter()
            .map(|n| NodeVectorMap {
                node_id: n.id.clone(),
                vector_id: format!("vec-{}", n.node_index),
                kb_id: kb.id.clone(),
            })
            .collect();

        db.persist_ingest(&document, &nodes, &maps, &serde_json::json!({"db": 1}))
            .unwrap();

        let stored = db.get_file(&file.id).unwrap().unwrap();
        assert_eq!(stored.ingest_status, IngestStatus::Success);
        assert_eq!(stored.node_count, 2);
        assert_eq!(db.count_nodes(&file.id).unwrap(), 2);
        assert_eq!(db.count_vector_maps(&file.id).unwrap(), 2);

        let hits = db
            .search_nodes_by_keyword(&kb.id, "rent increase", 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id, nodes[0].id);
        assert!(hits[0].score >= 0.0, "normalized score is higher-is-better");

        // Scoped to the KB: another kb_id sees nothing
        let other = db
            .search_nodes_by_keyword("other-kb", "rent increase", 10)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_persist_ingest_rejects_index_gap() {
        let db = test_db();
        let kb = test_kb(&db);
        let (file, document) = seed_file(&db, &kb.id, "cccc");

        let nodes = vec![
            node(&kb.id, &file.id, &document.id, 0, "first node text here", 1),
            node(&kb.id, &file.id, &document.id, 2, "third node text here", 1),
        ];
        let maps: Vec<NodeVectorMap> = nodes
            .iter()
            .map(|n| NodeVectorMap {
                node_id: n.id.clone(),
                vector_id: "v".into(),
                kb_id: kb.id.clone(),
            })
            .collect();

        let err = db
            .persist_ingest(&document, &nodes, &maps, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, DbError::Invariant(_)));
        // Nothing was written
        assert_eq!(db.count_nodes(&file.id).unwrap(), 0);
    }

    #[test]
    fn test_persist_ingest_rejects_map_mismatch() {
        let db = test_db();
        let kb = test_kb(&db);
        let (file, document) = seed_file(&db, &kb.id, "dddd");
        let nodes = vec![node(&kb.id, &file.id, &document.id, 0, "some text", 1)];
        let err = db
            .persist_ingest(&document, &nodes, &[], &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, DbError::Invariant(_)));
    }

    #[test]
    fn test_upsert_node_vector_map_replaces() {
        let db = test_db();
        let kb = test_kb(&db);
        let (file, document) = seed_file(&db, &kb.id, "ffff");
        let nodes = vec![node(&kb.id, &file.id, &document.id, 0, "some node text here", 1)];
        let maps = vec![NodeVectorMap {
            node_id: nodes[0].id.clone(),
            vector_id: "vec-old".into(),
            kb_id: kb.id.clone(),
        }];
        db.persist_ingest(&document, &nodes, &maps, &serde_json::json!({}))
            .unwrap();

        // Re-embedding replaces the mapping instead of adding a second one
        db.upsert_node_vector_map(&NodeVectorMap {
            node_id: nodes[0].id.clone(),
            vector_id: "vec-new".into(),
            kb_id: kb.id.clone(),
        })
        .unwrap();
        assert_eq!(db.count_vector_maps(&file.id).unwrap(), 1);
        let vector_id: String = db
            .conn()
            .query_row(
                "SELECT vector_id FROM node_vector_map WHERE node_id = ?",
                params![nodes[0].id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(vector_id, "vec-new");
    }

    #[test]
    fn test_fts_match_expr_weak_query() {
        assert!(Database::fts_match_expr("the of and").is_none());
        assert!(Database::fts_match_expr("   ").is_none());
        let expr = Database::fts_match_expr("rental rules").unwrap();
        assert!(expr.contains("\"rental\""));
        assert!(expr.contains(" OR "));
    }

    #[test]
    fn test_get_page_preview() {
        let db = test_db();
        let kb = test_kb(&db);
        let (file, document) = seed_file(&db, &kb.id, "eeee");
        let nodes = vec![
            node(&kb.id, &file.id, &document.id, 0, "Page one first node.", 1),
            node(&kb.id, &file.id, &document.id, 1, "Page one second node.", 1),
            node(&kb.id, &file.id, &document.id, 2, "Page two node.", 2),
        ];
        let maps: Vec<NodeVectorMap> = nodes
            .iter()
            .map(|n| NodeVectorMap {
                node_id: n.id.clone(),
                vector_id: n.id.clone(),
                kb_id: kb.id.clone(),
            })
            .collect();
        db.persist_ingest(&document, &nodes, &maps, &serde_json::json!({}))
            .unwrap();

        let page = db.get_page(&document.id, 1, 1000).unwrap().unwrap();
        assert!(page.starts_with("Page one first node."));
        assert!(page.contains("Page one second node."));
        assert!(!page.contains("Page two"));

        let truncated = db.get_page(&document.id, 1, 8).unwrap().unwrap();
        assert_eq!(truncated.chars().count(), 8);

        assert!(db.get_page(&document.id, 9, 1000).unwrap().is_none());
    }

    #[test]
    fn test_message_lifecycle() {
        let db = test_db();
        let kb = test_kb(&db);
        let conversation = Conversation {
            id: "conv-1".into(),
            kb_id: kb.id.clone(),
            title: None,
            created_at: now_rfc3339(),
        };
        db.insert_conversation(&conversation).unwrap();
        let message = Message {
            id: "msg-1".into(),
            conversation_id: conversation.id.clone(),
            role: "user".into(),
            content: "What are the rental rules?".into(),
            status: MessageStatus::Pending,
            created_at: now_rfc3339(),
        };
        db.insert_message(&message).unwrap();
        db.update_message_status("msg-1", MessageStatus::Blocked)
            .unwrap();
        let loaded = db.get_message("msg-1").unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Blocked);

        assert!(db
            .update_message_status("missing", MessageStatus::Success)
            .is_err());
    }

    #[test]
    fn test_retrieval_record_roundtrip_and_unique_hits() {
        let db = test_db();
        let kb = test_kb(&db);
        let conversation = Conversation {
            id: "conv-1".into(),
            kb_id: kb.id.clone(),
            title: None,
            created_at: now_rfc3339(),
        };
        db.insert_conversation(&conversation).unwrap();

        let record = RetrievalRecord {
            id: "ret-1".into(),
            message_id: "msg-1".into(),
            kb_id: kb.id.clone(),
            query_text: "rental rules".into(),
            keyword_top_k: 20,
            vector_top_k: 20,
            fusion_top_k: 10,
            rerank_top_k: 5,
            fusion_strategy: "rrf".into(),
            rerank_strategy: "none".into(),
            provider_snapshot: serde_json::json!({"embed_provider": "hash"}),
            timing_ms: serde_json::json!({"keyword": 3}),
            created_at: now_rfc3339(),
        };
        let hit = RetrievalHit {
            id: "hit-1".into(),
            retrieval_record_id: "ret-1".into(),
            node_id: "node-1".into(),
            source: HitSource::Fused,
            rank: 1,
            score: 0.5,
            score_details: serde_json::json!({"normalizer": "abs_bm25"}),
            excerpt: "…".into(),
            page: Some(1),
            start_offset: None,
            end_offset: None,
        };
        let dup = RetrievalHit {
            id: "hit-2".into(),
            ..hit.clone()
        };
        // Duplicate (record, source, node) violates uniqueness
        assert!(db
            .insert_retrieval_record(&record, &[hit.clone(), dup])
            .is_err());
        // Atomic: the failed transaction left nothing behind
        assert!(db.get_retrieval_record("ret-1").unwrap().is_none());

        db.insert_retrieval_record(&record, &[hit]).unwrap();
        let loaded = db.get_retrieval_record("ret-1").unwrap().unwrap();
        assert_eq!(loaded.fusion_strategy, "rrf");
        let hits = db.get_retrieval_hits("ret-1").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, HitSource::Fused);
        assert_eq!(
            hits[0].score_details["normalizer"],
            serde_json::json!("abs_bm25")
        );
    }

    #[test]
    fn test_generation_and_evaluation_records() {
        let db = test_db();
        let kb = test_kb(&db);
        let record = RetrievalRecord {
            id: "ret-1".into(),
            message_id: "msg-1".into(),
            kb_id: kb.id.clone(),
            query_text: "q".into(),
            keyword_top_k: 10,
            vector_top_k: 10,
            fusion_top_k: 10,
            rerank_top_k: 0,
            fusion_strategy: "union".into(),
            rerank_strategy: "none".into(),
            provider_snapshot: serde_json::json!({}),
            timing_ms: serde_json::json!({}),
            created_at: now_rfc3339(),
        };
        db.insert_retrieval_record(&record, &[]).unwrap();

        let generation = GenerationRecord {
            id: "gen-1".into(),
            message_id: "msg-1".into(),
            retrieval_record_id: "ret-1".into(),
            prompt_name: "legal_qa".into(),
            prompt_version: "v1".into(),
            model_provider: "mock".into(),
            model_name: "mock-legal".into(),
            messages_snapshot: serde_json::json!([{"role": "system", "content": "…"}]),
            output_raw: "{\"answer\": \"…\"}".into(),
            output_structured: Some(serde_json::json!({"answer": "…"})),
            citations: serde_json::json!([{"node_id": "node-1", "rank": 1}]),
            status: GenerationStatus::Success,
            error_message: None,
            created_at: now_rfc3339(),
        };
        db.insert_generation_record(&generation).unwrap();
        let loaded = db.get_generation_record("gen-1").unwrap().unwrap();
        assert_eq!(loaded.status, GenerationStatus::Success);
        assert!(loaded.output_structured.is_some());

        // 1:1 with message
        let mut second = generation.clone();
        second.id = "gen-2".into();
        assert!(db.insert_generation_record(&second).is_err());

        let evaluation = EvaluationRecord {
            id: "eval-1".into(),
            message_id: "msg-1".into(),
            retrieval_record_id: "ret-1".into(),
            generation_record_id: "gen-1".into(),
            status: crate::gate::GateStatus::Pass,
            rule_version: "eval-rules.v1".into(),
            config: serde_json::json!({"require_citations": true}),
            checks: serde_json::json!([]),
            scores: serde_json::json!({"citation_coverage": 1.0}),
            meta: serde_json::json!({}),
            created_at: now_rfc3339(),
        };
        db.insert_evaluation_record(&evaluation).unwrap();
        let loaded = db.get_evaluation_record("eval-1").unwrap().unwrap();
        assert_eq!(loaded.status, crate::gate::GateStatus::Pass);
        assert_eq!(loaded.rule_version, "eval-rules.v1");
    }
}
