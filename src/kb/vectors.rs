//! Vector storage module for lexrag
//! LanceDB-backed, payload-bearing vector index scoped by knowledge base.
//! Every entity carries enough payload to rebuild provenance without touching
//! the relational store: node, KB, file, document, page, article, section.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use arrow_array::types::Float32Type;
use arrow_array::{
    FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};

/// Metric recorded in every hit's score details so downstream components can
/// normalize without guessing.
pub const METRIC_TYPE: &str = "cosine";

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("LanceDB error: {0}")]
    LanceDb(String),
    #[error("Vector store not initialized")]
    NotInitialized,
    #[error("Arrow error: {0}")]
    Arrow(String),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Vector store configuration
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub path: PathBuf,
    pub embedding_dim: usize,
    pub table_name: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./vectors"),
            embedding_dim: 64,
            table_name: "nodes".into(),
        }
    }
}

/// Search scope. `kb_id` is mandatory: cross-KB recall is never allowed.
#[derive(Debug, Clone)]
pub struct VectorScope {
    pub kb_id: String,
    pub file_id: Option<String>,
    pub document_id: Option<String>,
}

impl VectorScope {
    pub fn kb(kb_id: impl Into<String>) -> Self {
        Self {
            kb_id: kb_id.into(),
            file_id: None,
            document_id: None,
        }
    }

    /// SQL filter expression for the scope
    pub fn filter_expr(&self) -> String {
        let mut expr = format!("kb_id = '{}'", escape(&self.kb_id));
        if let Some(file_id) = &self.file_id {
            expr.push_str(&format!(" AND file_id = '{}'", escape(file_id)));
        }
        if let Some(document_id) = &self.document_id {
            expr.push_str(&format!(" AND document_id = '{}'", escape(document_id)));
        }
        expr
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Provenance payload stored beside each vector. Optional strings are stored
/// as empty strings, never NULL.
#[derive(Debug, Clone)]
pub struct VectorPayload {
    pub vector_id: String,
    pub node_id: String,
    pub kb_id: String,
    pub file_id: String,
    pub document_id: String,
    pub page: i64,
    pub article_id: String,
    pub section_path: String,
}

/// One insert entry: payload plus its embedding
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub payload: VectorPayload,
    pub embedding: Vec<f32>,
}

/// One search result with the full payload
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub vector_id: String,
    pub node_id: String,
    pub file_id: String,
    pub document_id: String,
    pub page: i64,
    pub article_id: String,
    pub section_path: String,
    /// Raw cosine distance from the index
    pub distance: f32,
    /// Higher-is-better similarity (`1 - distance`)
    pub score: f32,
}

/// Vector store manager. Long-lived per process; writes are batched per file.
pub struct VectorStore {
    config: VectorStoreConfig,
    connection: Option<Connection>,
    table: Option<Table>,
}

impl VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        Self {
            config,
            connection: None,
            table: None,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Connect and open (or create) the table
    pub async fn init(&mut self) -> Result<(), VectorError> {
        std::fs::create_dir_all(&self.config.path)?;

        let db_path = self.config.path.to_string_lossy().to_string();
        let conn = connect(&db_path)
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        self.connection = Some(conn);
        self.create_table().await
    }

    /// Column layout for the node vectors table
    fn create_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("vector_id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.config.embedding_dim as i32,
                ),
                false,
            ),
            Field::new("node_id", DataType::Utf8, false),
            Field::new("kb_id", DataType::Utf8, false),
            Field::new("file_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("page", DataType::Int64, false),
            Field::new("article_id", DataType::Utf8, false),
            Field::new("section_path", DataType::Utf8, false),
        ]))
    }

    async fn create_table(&mut self) -> Result<(), VectorError> {
        let conn = self.connection.as_ref().ok_or(VectorError::NotInitialized)?;

        let table_names = conn
            .table_names()
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;

        if table_names.contains(&self.config.table_name) {
            let table = conn
                .open_table(&self.config.table_name)
                .execute()
                .await
                .map_err(|e| VectorError::LanceDb(e.to_string()))?;
            self.table = Some(table);
        } else {
            let schema = self.create_schema();
            let batch = self
                .build_batch(&[])
                .map_err(|e| VectorError::Arrow(e.to_string()))?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

            let table = conn
                .create_table(&self.config.table_name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| VectorError::LanceDb(e.to_string()))?;
            self.table = Some(table);
        }

        Ok(())
    }

    fn build_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch, VectorError> {
        let dim = self.config.embedding_dim as i32;

        let vector_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.vector_id.clone())
                .collect::<Vec<_>>(),
        );
        let embeddings = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            entries
                .iter()
                .map(|e| Some(e.embedding.iter().map(|&v| Some(v)).collect::<Vec<_>>())),
            dim,
        );
        let node_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.node_id.clone())
                .collect::<Vec<_>>(),
        );
        let kb_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.kb_id.clone())
                .collect::<Vec<_>>(),
        );
        let file_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.file_id.clone())
                .collect::<Vec<_>>(),
        );
        let document_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.document_id.clone())
                .collect::<Vec<_>>(),
        );
        let pages = Int64Array::from(entries.iter().map(|e| e.payload.page).collect::<Vec<_>>());
        let article_ids = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.article_id.clone())
                .collect::<Vec<_>>(),
        );
        let section_paths = StringArray::from(
            entries
                .iter()
                .map(|e| e.payload.section_path.clone())
                .collect::<Vec<_>>(),
        );

        RecordBatch::try_new(
            self.create_schema(),
            vec![
                Arc::new(vector_ids),
                Arc::new(embeddings),
                Arc::new(node_ids),
                Arc::new(kb_ids),
                Arc::new(file_ids),
                Arc::new(document_ids),
                Arc::new(pages),
                Arc::new(article_ids),
                Arc::new(section_paths),
            ],
        )
        .map_err(|e| VectorError::Arrow(e.to_string()))
    }

    /// Insert a batch of payload-bearing vectors (one call per ingested file)
    pub async fn insert(&self, entries: &[VectorEntry]) -> Result<(), VectorError> {
        let table = self.table.as_ref().ok_or(VectorError::NotInitialized)?;
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            if entry.embedding.len() != self.config.embedding_dim {
                return Err(VectorError::DimensionMismatch {
                    expected: self.config.embedding_dim,
                    actual: entry.embedding.len(),
                });
            }
        }

        let schema = self.create_schema();
        let batch = self.build_batch(entries)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        Ok(())
    }

    /// k-NN search within a scope. The scope always includes `kb_id`.
    pub async fn search(
        &self,
        scope: &VectorScope,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let table = self.table.as_ref().ok_or(VectorError::NotInitialized)?;
        if top_k == 0 {
            return Ok(vec![]);
        }
        if query_embedding.len() != self.config.embedding_dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: query_embedding.len(),
            });
        }

        let query = table
            .vector_search(query_embedding)
            .map_err(|e| VectorError::LanceDb(e.to_string()))?
            .distance_type(DistanceType::Cosine)
            .only_if(scope.filter_expr())
            .limit(top_k);

        let results = query
            .execute()
            .await
            .map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

        use futures::StreamExt;
        let batches: Vec<Result<RecordBatch, lancedb::Error>> = results.collect().await;

        let mut hits = Vec::new();
        for batch_result in batches {
            let batch =
                batch_result.map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

            let vector_ids = string_column(&batch, "vector_id")?;
            let node_ids = string_column(&batch, "node_id")?;
            let file_ids = string_column(&batch, "file_id")?;
            let document_ids = string_column(&batch, "document_id")?;
            let article_ids = string_column(&batch, "article_id")?;
            let section_paths = string_column(&batch, "section_path")?;

            let pages = batch
                .column_by_name("page")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>().cloned())
                .ok_or_else(|| VectorError::Arrow("missing page column".into()))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>().cloned())
                .ok_or_else(|| VectorError::Arrow("missing _distance column".into()))?;

            for i in 0..batch.num_rows() {
                let distance = distances.value(i);
                hits.push(VectorHit {
                    vector_id: vector_ids.value(i).to_string(),
                    node_id: node_ids.value(i).to_string(),
                    file_id: file_ids.value(i).to_string(),
                    document_id: document_ids.value(i).to_string(),
                    page: pages.value(i),
                    article_id: article_ids.value(i).to_string(),
                    section_path: section_paths.value(i).to_string(),
                    distance,
                    score: 1.0 - distance,
                });
            }
        }

        Ok(hits)
    }

    /// Reap all vectors of a file (orphan cleanup after a failed ingest, or
    /// file deletion)
    pub async fn delete_by_file(&self, file_id: &str) -> Result<(), VectorError> {
        let table = self.table.as_ref().ok_or(VectorError::NotInitialized)?;
        table
            .delete(&format!("file_id = '{}'", escape(file_id)))
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, VectorError> {
        let table = self.table.as_ref().ok_or(VectorError::NotInitialized)?;
        table
            .count_rows(None)
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))
    }
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<StringArray, VectorError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>().cloned())
        .ok_or_else(|| VectorError::Arrow(format!("missing {} column", name)))
}
