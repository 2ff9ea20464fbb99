use axum::{extract::State, Json};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::users::MeResponse;
use crate::error::{ApiError, ApiResult};
use crate::services::users;

/// Get current authenticated user info
pub async fn get_me(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MeResponse>> {
    let user = users::get_user(&state.db, auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(MeResponse {
        user_id: user.id,
        uid: user.external_id,
        email: user.email.or_else(|| auth.email.clone()),
        email_verified: auth.claims().email_verified.unwrap_or(false),
        sign_in_provider: auth.sign_in_provider().map(str::to_string),
        created_at: user.created_at,
    }))
}
