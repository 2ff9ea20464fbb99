use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::timeline::{
    ExtractDocumentsResponse, RebuildResponse, TimelineDocumentsRequest, TimelineExtraction,
    TimelineExtractRequest, TimelineItemResponse, TimelineQuery, TimelineRebuildQuery,
};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestIdExt;
use crate::services::{properties, timeline};

/// Stored timeline of a property, translated on request
pub async fn list_timeline(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Vec<TimelineItemResponse>>> {
    properties::owned_property_or_404(&state.db, auth.user_id, query.property_id).await?;

    let items = timeline::list_timeline(
        &state,
        query.property_id,
        query.document_id,
        query.language,
        headers.request_id(),
    )
    .await?;
    Ok(Json(items))
}

/// Extract timeline items from pasted text without storing them
pub async fn extract(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TimelineExtractRequest>,
) -> ApiResult<Json<TimelineExtraction>> {
    let raw_text = req.raw_text.trim();
    if raw_text.is_empty() {
        return Err(ApiError::bad_request("raw_text must not be empty"));
    }

    let items = timeline::extract_timeline(
        state.llm.as_ref(),
        &state.settings,
        raw_text,
        headers.request_id(),
    )
    .await?;
    Ok(Json(TimelineExtraction { items }))
}

pub async fn extract_documents(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TimelineDocumentsRequest>,
) -> ApiResult<Json<ExtractDocumentsResponse>> {
    properties::owned_property_or_404(&state.db, auth.user_id, req.property_id).await?;

    let response = timeline::extract_documents(
        &state,
        req.property_id,
        req.document_ids.as_deref(),
        headers.request_id(),
    )
    .await?;
    Ok(Json(response))
}

/// Re-extract the timeline of every document in a property
pub async fn rebuild(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TimelineRebuildQuery>,
) -> ApiResult<Json<RebuildResponse>> {
    properties::owned_property_or_404(&state.db, auth.user_id, query.property_id).await?;

    let response = timeline::rebuild(&state, query.property_id, headers.request_id()).await?;
    tracing::info!(
        user_id = auth.user_id,
        property_id = query.property_id,
        items = response.items_count,
        "Timeline rebuilt"
    );
    Ok(Json(response))
}
