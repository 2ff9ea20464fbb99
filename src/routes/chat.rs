use axum::{extract::State, http::HeaderMap, Json};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::chat::{ChatAnswer, ChatRequest};
use crate::error::ApiResult;
use crate::middleware::RequestIdExt;
use crate::services::rag;

/// Answer a question from the caller's documents
pub async fn chat(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<ChatAnswer>> {
    tracing::info!(
        user_id = auth.user_id,
        property_id = ?req.property_id,
        language = req.language.code(),
        "Chat question"
    );

    let answer = rag::chat(&state, auth.user_id, req, headers.request_id()).await?;
    Ok(Json(answer))
}
