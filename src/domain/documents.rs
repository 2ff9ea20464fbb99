use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion state of a document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "failed" => Self::Failed,
            _ => Self::Processing,
        }
    }
}

/// Document metadata row (file bytes are loaded separately)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: i64,
    pub property_id: i64,
    pub filename: String,
    pub file_size: i64,
    pub status: String,
    pub uploaded_at: DateTime<Utc>,
    pub chunks_indexed: i64,
}

/// Response DTO for document listings
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub document_id: i64,
    pub property_id: i64,
    pub filename: String,
    pub file_size: i64,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    pub chunks_indexed: i64,
}

impl From<DocumentRow> for DocumentResponse {
    fn from(d: DocumentRow) -> Self {
        Self {
            document_id: d.id,
            property_id: d.property_id,
            filename: d.filename,
            file_size: d.file_size,
            status: DocumentStatus::parse(&d.status),
            uploaded_at: d.uploaded_at,
            chunks_indexed: d.chunks_indexed,
        }
    }
}

/// Result of ingesting one PDF
#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub document_id: i64,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub chunks_indexed: usize,
    pub timeline_items_stored: usize,
}

/// A ZIP entry that could not be ingested
#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub filename: String,
    pub reason: String,
}

/// Result of ingesting a ZIP archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveUploadResponse {
    pub archive_filename: String,
    pub processed_count: usize,
    pub failed_count: usize,
    pub documents: Vec<IngestedDocument>,
    pub failed_documents: Vec<FailedDocument>,
}

/// `POST /documents/upload` answers with either shape
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UploadResponse {
    Document(IngestedDocument),
    Archive(ArchiveUploadResponse),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentListQuery {
    #[serde(default)]
    pub property_id: Option<i64>,
}

/// Index statistics for the caller's documents
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DocumentStatusResponse {
    pub documents_in_db: i64,
    pub documents_indexed: i64,
    pub documents_failed: i64,
    pub documents_with_chunks: i64,
    pub chunks_indexed: i64,
    pub timeline_items: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceQuery {
    pub document_id: i64,
    pub chunk_id: String,
    #[serde(default = "default_snippet_chars")]
    pub max_chars: i64,
}

fn default_snippet_chars() -> i64 {
    1200
}

/// Text of a cited chunk
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnippetResponse {
    pub document_id: i64,
    pub chunk_id: String,
    pub filename: String,
    pub snippet: String,
    pub total_chars: usize,
}
