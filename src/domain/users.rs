use chrono::{DateTime, Utc};
use serde::Serialize;

/// Local user row, keyed by the identity-provider subject
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Response DTO for `GET /auth/me`
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub user_id: i64,
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_in_provider: Option<String>,
    pub created_at: DateTime<Utc>,
}
