use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::api::NoContent;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::documents::{
    ArchiveUploadResponse, DocumentListQuery, DocumentResponse, DocumentStatusResponse,
    FailedDocument, IngestedDocument, SourceQuery, SourceSnippetResponse, UploadResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestIdExt;
use crate::services::ingest::{self, UploadKind};
use crate::services::{documents, properties, rag};

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Upload exceeds the request size limit".to_string())
    } else {
        ApiError::bad_request(format!("Invalid multipart body: {}", err.body_text()))
    }
}

/// Upload a PDF, or a ZIP of PDFs, into a property
pub async fn upload_document(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let request_id = headers.request_id();
    let mut property_id: Option<i64> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                upload = Some((filename, data.to_vec()));
            }
            Some("property_id") => {
                let raw = field.text().await.map_err(multipart_error)?;
                let id = raw
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::bad_request("property_id must be an integer"))?;
                property_id = Some(id);
            }
            _ => {}
        }
    }

    let property_id = property_id.ok_or_else(|| ApiError::bad_request("property_id is required"))?;
    let (filename, content) = upload.ok_or_else(|| ApiError::bad_request("file is required"))?;
    properties::owned_property_or_404(&state.db, auth.user_id, property_id).await?;

    let safe_filename = ingest::sanitize_filename(&filename)?;
    tracing::info!(
        user_id = auth.user_id,
        property_id,
        filename = %safe_filename,
        size = content.len(),
        "Upload received"
    );

    let response = match ingest::upload_kind(&safe_filename)? {
        UploadKind::Pdf => {
            let doc =
                ingest::ingest_pdf(&state, property_id, &safe_filename, content, request_id)
                    .await?;
            UploadResponse::Document(doc)
        }
        UploadKind::Zip => UploadResponse::Archive(
            ingest_archive(&state, property_id, safe_filename, content, request_id).await?,
        ),
    };

    rag::invalidate_user_answers(state.cache.as_ref(), auth.user_id).await;
    Ok(Json(response))
}

pub(crate) async fn ingest_archive(
    state: &AppState,
    property_id: i64,
    archive_filename: String,
    content: Vec<u8>,
    request_id: Option<&str>,
) -> ApiResult<ArchiveUploadResponse> {
    let entries = tokio::task::spawn_blocking(move || ingest::read_pdf_archive(&content))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("ZIP reader task failed: {e}")))??;

    let mut documents = Vec::new();
    let mut failed = Vec::new();

    for entry in entries {
        let inner_name = match ingest::sanitize_filename(&entry.name) {
            Ok(name) => name,
            Err(e) => {
                failed.push(FailedDocument {
                    filename: entry.name,
                    reason: e.public_message(),
                });
                continue;
            }
        };
        let bytes = match entry.content {
            Ok(bytes) => bytes,
            Err(reason) => {
                failed.push(FailedDocument {
                    filename: inner_name,
                    reason,
                });
                continue;
            }
        };

        match ingest::ingest_pdf(state, property_id, &inner_name, bytes, request_id).await {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                tracing::warn!(filename = %inner_name, error = %e, "ZIP entry rejected");
                failed.push(FailedDocument {
                    filename: inner_name,
                    reason: e.public_message(),
                });
            }
        }
    }

    if documents.is_empty() {
        return Err(ApiError::bad_request(
            "No valid PDFs could be processed from ZIP",
        ));
    }

    Ok(ArchiveUploadResponse {
        archive_filename,
        processed_count: documents.len(),
        failed_count: failed.len(),
        documents,
        failed_documents: failed,
    })
}

/// List the caller's documents, optionally for one property
pub async fn list_documents(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentListQuery>,
) -> ApiResult<Json<Vec<DocumentResponse>>> {
    if let Some(property_id) = query.property_id {
        properties::owned_property_or_404(&state.db, auth.user_id, property_id).await?;
    }
    let docs = documents::list_documents(&state.db, auth.user_id, query.property_id).await?;
    Ok(Json(docs))
}

pub async fn documents_status(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentListQuery>,
) -> ApiResult<Json<DocumentStatusResponse>> {
    if let Some(property_id) = query.property_id {
        properties::owned_property_or_404(&state.db, auth.user_id, property_id).await?;
    }
    let status = documents::index_status(&state.db, auth.user_id, query.property_id).await?;
    Ok(Json(status))
}

/// Text of a chunk cited by a chat answer
pub async fn get_source(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourceQuery>,
) -> ApiResult<Json<SourceSnippetResponse>> {
    let snippet = documents::source_snippet(&state.db, auth.user_id, &query).await?;
    Ok(Json(snippet))
}

/// Original PDF bytes, shown inline
pub async fn get_file(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let (filename, bytes) = documents::document_file(&state.db, auth.user_id, document_id).await?;

    // Stored names are already restricted to [A-Za-z0-9._-]
    let disposition = format!("inline; filename=\"{filename}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

pub async fn delete_document(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<i64>,
) -> ApiResult<NoContent> {
    documents::delete_document(&state.db, auth.user_id, document_id).await?;
    rag::invalidate_user_answers(state.cache.as_ref(), auth.user_id).await;
    Ok(NoContent)
}

/// Re-run text extraction, embedding and timeline extraction
pub async fn reindex_document(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(document_id): Path<i64>,
) -> ApiResult<Json<IngestedDocument>> {
    tracing::info!(user_id = auth.user_id, document_id, "Reindexing document");
    let doc =
        documents::reindex_document(&state, auth.user_id, document_id, headers.request_id())
            .await?;
    rag::invalidate_user_answers(state.cache.as_ref(), auth.user_id).await;
    Ok(Json(doc))
}
