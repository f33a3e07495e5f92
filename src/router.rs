//! Retrieval router: picks exactly one answering strategy per query.
//!
//! 1. Document has a registered dataframe schema → `Structured`.
//! 2. Else its full extracted text exists and fits the configured ceiling →
//!    `FullText` (verbatim inclusion, no search).
//! 3. Else → `Vector`.
//!
//! The decision and the amount of context actually available are retained in
//! the response metadata for diagnostics; they are never shown to end users.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{DataFrameSchema, Document, Strategy};

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub strategy: Strategy,
    pub context_chars: usize,
}

pub async fn choose_route(
    pool: &SqlitePool,
    document: &Document,
    fulltext_max_chars: usize,
) -> Result<RouteDecision> {
    if load_schema(pool, &document.id).await?.is_some() {
        return Ok(RouteDecision {
            strategy: Strategy::Structured,
            context_chars: 0,
        });
    }

    if let Some(ref body) = document.body {
        let chars = body.chars().count();
        if chars > 0 && chars <= fulltext_max_chars {
            return Ok(RouteDecision {
                strategy: Strategy::FullText,
                context_chars: chars,
            });
        }
    }

    Ok(RouteDecision {
        strategy: Strategy::Vector,
        context_chars: 0,
    })
}

/// Fetch the locally cached dataframe schema for a document, if the tabular
/// service load succeeded at ingest time.
pub async fn load_schema(pool: &SqlitePool, document_id: &str) -> Result<Option<DataFrameSchema>> {
    let row = sqlx::query(
        "SELECT row_count, columns_json, sample_json FROM dataframe_schemas WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let row_count: i64 = row.get("row_count");
    let columns_json: String = row.get("columns_json");
    let sample_json: String = row.get("sample_json");

    Ok(Some(DataFrameSchema {
        document_id: document_id.to_string(),
        row_count,
        columns: serde_json::from_str(&columns_json)?,
        sample_rows: serde_json::from_str(&sample_json)?,
    }))
}
