use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::{Created, NoContent};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::properties::{CreatePropertyRequest, PropertyResponse, UpdatePropertyRequest};
use crate::error::ApiResult;
use crate::services::{properties, rag};

/// List the caller's properties, newest first
pub async fn list_properties(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<PropertyResponse>>> {
    let rows = properties::list_properties(&state.db, auth.user_id).await?;
    Ok(Json(rows.into_iter().map(PropertyResponse::from).collect()))
}

/// Create a property
pub async fn create_property(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePropertyRequest>,
) -> ApiResult<Created<PropertyResponse>> {
    let name = properties::normalize_name(&req.name)?;
    let address = properties::normalize_optional(req.address_optional);

    let row =
        properties::create_property(&state.db, auth.user_id, &name, address.as_deref()).await?;

    tracing::info!(user_id = auth.user_id, property_id = row.id, "Property created");
    Ok(Created(PropertyResponse::from(row)))
}

pub async fn get_property(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(property_id): Path<i64>,
) -> ApiResult<Json<PropertyResponse>> {
    let row = properties::get_property(&state.db, auth.user_id, property_id).await?;
    Ok(Json(PropertyResponse::from(row)))
}

/// Rename a property or change its address. A blank address clears it.
pub async fn update_property(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(property_id): Path<i64>,
    Json(req): Json<UpdatePropertyRequest>,
) -> ApiResult<Json<PropertyResponse>> {
    let property = properties::owned_property_or_404(&state.db, auth.user_id, property_id).await?;

    let name = req
        .name
        .as_deref()
        .map(properties::normalize_name)
        .transpose()?;
    let address = req
        .address_optional
        .map(|a| properties::normalize_optional(Some(a)));

    properties::update_property(
        &state.db,
        &property,
        name.as_deref(),
        address.as_ref().map(|a| a.as_deref()),
    )
    .await?;

    let row = properties::get_property(&state.db, auth.user_id, property_id).await?;
    Ok(Json(PropertyResponse::from(row)))
}

/// Delete a property with all of its documents
pub async fn delete_property(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(property_id): Path<i64>,
) -> ApiResult<NoContent> {
    properties::owned_property_or_404(&state.db, auth.user_id, property_id).await?;
    properties::delete_property(&state.db, property_id).await?;
    rag::invalidate_user_answers(state.cache.as_ref(), auth.user_id).await;

    tracing::info!(user_id = auth.user_id, property_id, "Property deleted");
    Ok(NoContent)
}
