//! Document queries scoped to the owning user

use sqlx::PgPool;
use tracing::info;

use crate::app::AppState;
use crate::domain::documents::{
    DocumentResponse, DocumentRow, DocumentStatus, DocumentStatusResponse, IngestedDocument,
    SourceQuery, SourceSnippetResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::services::ingest;

/// Bounds for `max_chars` on source snippets
pub const MIN_SNIPPET_CHARS: i64 = 1;
pub const MAX_SNIPPET_CHARS: i64 = 5000;

pub async fn list_documents(
    db: &PgPool,
    user_id: i64,
    property_id: Option<i64>,
) -> ApiResult<Vec<DocumentResponse>> {
    let rows = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT d.id, d.property_id, d.filename, d.file_size, d.status, d.uploaded_at,
               (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) AS chunks_indexed
        FROM documents d
        JOIN properties p ON p.id = d.property_id
        WHERE p.user_id = $1
          AND ($2::BIGINT IS NULL OR d.property_id = $2)
        ORDER BY d.uploaded_at DESC, d.id DESC
        "#,
    )
    .bind(user_id)
    .bind(property_id)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(DocumentResponse::from).collect())
}

/// Index counters over the caller's documents
pub async fn index_status(
    db: &PgPool,
    user_id: i64,
    property_id: Option<i64>,
) -> ApiResult<DocumentStatusResponse> {
    let status = sqlx::query_as::<_, DocumentStatusResponse>(
        r#"
        WITH docs AS (
            SELECT d.id, d.status,
                   (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) AS chunk_count,
                   (SELECT COUNT(*) FROM timeline_items t WHERE t.document_id = d.id) AS item_count
            FROM documents d
            JOIN properties p ON p.id = d.property_id
            WHERE p.user_id = $1
              AND ($2::BIGINT IS NULL OR d.property_id = $2)
        )
        SELECT COUNT(*) AS documents_in_db,
               COUNT(*) FILTER (WHERE status = 'indexed') AS documents_indexed,
               COUNT(*) FILTER (WHERE status = 'failed') AS documents_failed,
               COUNT(*) FILTER (WHERE chunk_count > 0) AS documents_with_chunks,
               COALESCE(SUM(chunk_count), 0)::BIGINT AS chunks_indexed,
               COALESCE(SUM(item_count), 0)::BIGINT AS timeline_items
        FROM docs
        "#,
    )
    .bind(user_id)
    .bind(property_id)
    .fetch_one(db)
    .await?;
    Ok(status)
}

/// First `max_chars` characters of `text`, with `max_chars` clamped.
pub fn snippet(text: &str, max_chars: i64) -> String {
    let limit = max_chars.clamp(MIN_SNIPPET_CHARS, MAX_SNIPPET_CHARS) as usize;
    text.chars().take(limit).collect()
}

/// Text of a chunk the caller may read.
pub async fn source_snippet(
    db: &PgPool,
    user_id: i64,
    query: &SourceQuery,
) -> ApiResult<SourceSnippetResponse> {
    let (text, filename): (String, String) = sqlx::query_as(
        r#"
        SELECT c.text, d.filename
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        JOIN properties p ON p.id = d.property_id
        WHERE c.document_id = $1 AND c.chunk_id = $2 AND p.user_id = $3
        "#,
    )
    .bind(query.document_id)
    .bind(&query.chunk_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found("Source chunk not found"))?;

    Ok(SourceSnippetResponse {
        document_id: query.document_id,
        chunk_id: query.chunk_id.clone(),
        filename,
        snippet: snippet(&text, query.max_chars),
        total_chars: text.chars().count(),
    })
}

/// Filename and PDF bytes of a document the caller owns
pub async fn document_file(
    db: &PgPool,
    user_id: i64,
    document_id: i64,
) -> ApiResult<(String, Vec<u8>)> {
    sqlx::query_as(
        r#"
        SELECT d.filename, d.file_bytes
        FROM documents d
        JOIN properties p ON p.id = d.property_id
        WHERE d.id = $1 AND p.user_id = $2
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found("Document not found"))
}

/// Delete a document; chunks, timeline items and translations cascade.
pub async fn delete_document(db: &PgPool, user_id: i64, document_id: i64) -> ApiResult<()> {
    let result = sqlx::query(
        r#"
        DELETE FROM documents d
        USING properties p
        WHERE d.id = $1 AND p.id = d.property_id AND p.user_id = $2
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Document not found"));
    }
    info!(document_id, "Document deleted");
    Ok(())
}

/// Re-derive chunks and timeline items from the stored PDF.
pub async fn reindex_document(
    state: &AppState,
    user_id: i64,
    document_id: i64,
    request_id: Option<&str>,
) -> ApiResult<IngestedDocument> {
    let (property_id, filename, uploaded_at, file_bytes): (
        i64,
        String,
        chrono::DateTime<chrono::Utc>,
        Vec<u8>,
    ) = sqlx::query_as(
        r#"
        SELECT d.property_id, d.filename, d.uploaded_at, d.file_bytes
        FROM documents d
        JOIN properties p ON p.id = d.property_id
        WHERE d.id = $1 AND p.user_id = $2
        "#,
    )
    .bind(document_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Document not found"))?;

    sqlx::query("UPDATE documents SET status = 'processing' WHERE id = $1")
        .bind(document_id)
        .execute(&state.db)
        .await?;

    let (chunks_indexed, timeline_items_stored) =
        ingest::index_document(state, document_id, property_id, file_bytes, request_id).await?;

    Ok(IngestedDocument {
        document_id,
        filename,
        uploaded_at,
        status: DocumentStatus::Indexed,
        chunks_indexed,
        timeline_items_stored,
    })
}
