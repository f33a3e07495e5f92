//! Ingestion pipeline: registered file → queryable document.
//!
//! Every document, tabular or not, is uploaded to the provider file store so
//! the project thread can attach it. Tabular files additionally get a
//! dataframe loaded into the execution service; unstructured files get
//! extracted text, cleaned, chunked, embedded, and stored. Tabular
//! registration failure is non-fatal — the document stays answerable through
//! the thread path — while extraction/embedding failure fails the ingest.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::extract::{classify, extract_text, FileKind};
use crate::models::{DataFrameSchema, Document, IngestReport};
use crate::openai::OpenAiClient;
use crate::storage::StorageClient;
use crate::tabular::TabularClient;

pub struct Ingestor {
    pool: SqlitePool,
    config: Config,
    openai: Arc<OpenAiClient>,
    tabular: Arc<TabularClient>,
    storage: Arc<StorageClient>,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        openai: Arc<OpenAiClient>,
        tabular: Arc<TabularClient>,
        storage: Arc<StorageClient>,
    ) -> Self {
        Self {
            pool,
            config,
            openai,
            tabular,
            storage,
        }
    }

    /// Run the full pipeline for one registered document owned by `user_id`.
    /// `storage_path` overrides the stored path when the caller re-uploaded
    /// the file.
    pub async fn ingest(
        &self,
        document_id: &str,
        user_id: &str,
        storage_path: Option<&str>,
    ) -> EngineResult<IngestReport> {
        let mut document = fetch_document(&self.pool, document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {}", document_id)))?;
        if document.user_id != user_id {
            return Err(EngineError::NotFound(format!("document {}", document_id)));
        }

        if let Some(path) = storage_path {
            if path != document.storage_path {
                sqlx::query("UPDATE documents SET storage_path = ? WHERE id = ?")
                    .bind(path)
                    .bind(&document.id)
                    .execute(&self.pool)
                    .await?;
                document.storage_path = path.to_string();
            }
        }

        let bytes = self
            .storage
            .download(&document.storage_path)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?
            .ok_or_else(|| {
                EngineError::NotFound(format!("storage object {}", document.storage_path))
            })?;
        let content_hash = hex_sha256(&bytes);

        let provider_file_id = match document.provider_file_id {
            Some(ref id) => id.clone(),
            None => {
                let id = self
                    .openai
                    .upload_file(&document.filename, bytes.clone())
                    .await
                    .map_err(|e| EngineError::Upstream(e.to_string()))?;
                sqlx::query("UPDATE documents SET provider_file_id = ? WHERE id = ?")
                    .bind(&id)
                    .bind(&document.id)
                    .execute(&self.pool)
                    .await?;
                id
            }
        };

        let report = match classify(&document.filename) {
            FileKind::Tabular => {
                let row_count = self.register_dataframe(&document, &bytes).await;
                IngestReport {
                    success: true,
                    provider_file_id,
                    chunks_written: 0,
                    row_count,
                }
            }
            FileKind::Pdf | FileKind::Text => {
                let chunks_written = self
                    .index_text(&document, &bytes, &content_hash)
                    .await?;
                IngestReport {
                    success: true,
                    provider_file_id,
                    chunks_written,
                    row_count: None,
                }
            }
        };

        sqlx::query("UPDATE documents SET content_hash = ? WHERE id = ?")
            .bind(&content_hash)
            .bind(&document.id)
            .execute(&self.pool)
            .await?;

        info!(
            document_id = %document.id,
            filename = %document.filename,
            chunks = report.chunks_written,
            "ingest complete"
        );
        Ok(report)
    }

    /// Load the file into the tabular service and cache the returned schema.
    /// Failures are logged and swallowed.
    async fn register_dataframe(&self, document: &Document, bytes: &[u8]) -> Option<i64> {
        match self
            .tabular
            .load(&document.id, bytes, &document.file_type)
            .await
        {
            Ok(schema) => {
                if let Err(e) = self.store_schema(&schema).await {
                    warn!(document_id = %document.id, error = %e, "failed to cache dataframe schema");
                    return None;
                }
                Some(schema.row_count)
            }
            Err(e) => {
                warn!(
                    document_id = %document.id,
                    error = %e,
                    "tabular load failed, document remains thread-answerable"
                );
                None
            }
        }
    }

    async fn store_schema(&self, schema: &DataFrameSchema) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dataframe_schemas (document_id, row_count, columns_json, sample_json, loaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(document_id) DO UPDATE SET
                row_count = excluded.row_count,
                columns_json = excluded.columns_json,
                sample_json = excluded.sample_json,
                loaded_at = excluded.loaded_at
            "#,
        )
        .bind(&schema.document_id)
        .bind(schema.row_count)
        .bind(serde_json::to_string(&schema.columns).map_err(anyhow::Error::from)?)
        .bind(serde_json::to_string(&schema.sample_rows).map_err(anyhow::Error::from)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Extract, clean, store the body, then chunk and embed. When the
    /// content hash is unchanged and chunks already exist, the embedding
    /// work is skipped.
    async fn index_text(
        &self,
        document: &Document,
        bytes: &[u8],
        content_hash: &str,
    ) -> EngineResult<u64> {
        let stored_hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM documents WHERE id = ?")
                .bind(&document.id)
                .fetch_one(&self.pool)
                .await?;
        if stored_hash.as_deref() == Some(content_hash) {
            let existing: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?")
                    .bind(&document.id)
                    .fetch_one(&self.pool)
                    .await?;
            if existing > 0 {
                info!(document_id = %document.id, "content unchanged, skipping re-embedding");
                return Ok(0);
            }
        }

        let body = extract_text(bytes, classify(&document.filename));

        sqlx::query("UPDATE documents SET body = ? WHERE id = ?")
            .bind(&body)
            .bind(&document.id)
            .execute(&self.pool)
            .await?;

        let windows = chunk_text(
            &body,
            self.config.chunking.chunk_chars,
            self.config.chunking.overlap_chars,
        );
        if windows.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = windows.iter().map(|w| w.content.clone()).collect();
        let embeddings = self
            .openai
            .embed_texts(&texts)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        if embeddings.len() != windows.len() {
            return Err(EngineError::Upstream(format!(
                "embedding count mismatch: {} inputs, {} vectors",
                windows.len(),
                embeddings.len()
            )));
        }

        // Replace chunks atomically so a reader never sees a half-indexed
        // document.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        for (window, embedding) in windows.iter().zip(embeddings.iter()) {
            sqlx::query(
                "INSERT INTO document_chunks (id, document_id, position, content, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&document.id)
            .bind(window.position)
            .bind(&window.content)
            .bind(crate::embedding::vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(windows.len() as u64)
    }
}

/// Look up a document row by id.
pub async fn fetch_document(pool: &SqlitePool, document_id: &str) -> EngineResult<Option<Document>> {
    let row = sqlx::query(
        "SELECT id, project_id, user_id, filename, storage_path, file_type,
                provider_file_id, body
         FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Document {
        id: row.get("id"),
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        storage_path: row.get("storage_path"),
        file_type: row.get("file_type"),
        provider_file_id: row.get("provider_file_id"),
        body: row.get("body"),
    }))
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
