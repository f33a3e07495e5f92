//! Core data models flowing through the ingestion and answering pipeline.

use serde::{Deserialize, Serialize};

/// An uploaded file registered with the engine. `body` holds the cleaned
/// extracted text for unstructured documents; tabular documents instead get
/// a row in `dataframe_schemas`.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub filename: String,
    pub storage_path: String,
    pub file_type: String,
    pub provider_file_id: Option<String>,
    pub body: Option<String>,
}

/// A fixed-size overlapping window of a document's extracted text, stored
/// with its embedding. Immutable once written.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub position: i64,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

/// Per-column statistics returned by the tabular service's `load` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub dtype: String,
    pub null_count: i64,
    pub unique_count: i64,
    #[serde(default)]
    pub sample_values: Vec<serde_json::Value>,
}

/// Local record of the external dataframe handle: schema plus a literal
/// row sample, keyed by document id. Treated as a cache the engine may
/// repopulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFrameSchema {
    pub document_id: String,
    pub row_count: i64,
    pub columns: Vec<ColumnStats>,
    pub sample_rows: Vec<serde_json::Value>,
}

/// A retrieved chunk with its similarity to the query, surfaced to callers
/// as a citation.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub filename: String,
    pub snippet: String,
    pub similarity: f32,
    pub position: i64,
}

/// The answering strategy the router picked for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Structured,
    FullText,
    Vector,
    Thread,
}

/// Internal diagnostics attached to every response. Strategy and context
/// size are for operators; they are never rendered into user-facing text.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub strategy: Strategy,
    pub context_chars: usize,
    pub fallback: bool,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub success: bool,
    pub provider_file_id: String,
    pub chunks_written: u64,
    pub row_count: Option<i64>,
}
