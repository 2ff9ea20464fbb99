use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::db;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub database: String,
    pub redis: String,
    pub llm: String,
}

/// Health check endpoint - public
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let redis_check = async {
        match &state.cache {
            Some(cache) => Some(cache.health_check().await.is_ok()),
            None => None,
        }
    };

    // Check all services in parallel
    let (db_ok, redis_ok, llm_result) = tokio::join!(
        db::health_check(&state.db),
        redis_check,
        state.llm.health_check(),
    );
    let llm_ok = llm_result.is_ok();

    let status = if !db_ok {
        "unhealthy"
    } else if llm_ok && redis_ok != Some(false) {
        "healthy"
    } else {
        // DB is critical, others are degraded
        "degraded"
    };

    let status_code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let label = |ok: bool| if ok { "ok" } else { "error" };

    (
        status_code,
        Json(HealthResponse {
            ok: db_ok,
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                database: label(db_ok).to_string(),
                redis: redis_ok.map(label).unwrap_or("disabled").to_string(),
                llm: label(llm_ok).to_string(),
            },
        }),
    )
}
