//! Principal-scoped vector retrieval over document chunks.
//!
//! Isolation is enforced inside the SQL itself: every candidate row must
//! belong to the requesting principal, optionally narrowed further to one
//! document or one project. Similarity is computed in Rust over the stored
//! embedding BLOBs; results are strictly above the threshold, descending,
//! capped at `k`. An empty result is a valid, non-error outcome.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity};

/// Mandatory retrieval scope. `user_id` is the requesting principal and is
/// always applied; the optional ids narrow within that principal's data.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub user_id: String,
    pub document_id: Option<String>,
    pub project_id: Option<String>,
}

impl SearchScope {
    pub fn document(user_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: Some(document_id.into()),
            project_id: None,
        }
    }

    pub fn project(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: None,
            project_id: Some(project_id.into()),
        }
    }
}

/// A chunk ranked by similarity to the query vector.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub position: i64,
    pub content: String,
    pub similarity: f32,
}

pub async fn search(
    pool: &SqlitePool,
    query_vec: &[f32],
    scope: &SearchScope,
    threshold: f32,
    k: i64,
) -> Result<Vec<RetrievedChunk>> {
    let mut sql = String::from(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.position, c.content, c.embedding,
               d.filename
        FROM document_chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE d.user_id = ?
        "#,
    );
    if scope.document_id.is_some() {
        sql.push_str(" AND c.document_id = ?");
    }
    if scope.project_id.is_some() {
        sql.push_str(" AND d.project_id = ?");
    }

    let mut query = sqlx::query(&sql).bind(&scope.user_id);
    if let Some(ref document_id) = scope.document_id {
        query = query.bind(document_id);
    }
    if let Some(ref project_id) = scope.project_id {
        query = query.bind(project_id);
    }

    let rows = query.fetch_all(pool).await?;

    let mut candidates: Vec<RetrievedChunk> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let similarity = cosine_similarity(query_vec, &vec);
            if similarity > threshold {
                Some(RetrievedChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    filename: row.get("filename"),
                    position: row.get("position"),
                    content: row.get("content"),
                    similarity,
                })
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(k as usize);

    Ok(candidates)
}
