use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a property name
pub const MAX_PROPERTY_NAME_CHARS: usize = 200;

/// Property entity: the grouping unit documents are uploaded into
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Property {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub address_optional: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Property row joined with its document count
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PropertyWithCount {
    pub id: i64,
    pub name: String,
    pub address_optional: Option<String>,
    pub created_at: DateTime<Utc>,
    pub document_count: i64,
}

/// Request DTO for creating a property
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePropertyRequest {
    pub name: String,
    #[serde(default)]
    pub address_optional: Option<String>,
}

/// Request DTO for updating a property
#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePropertyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address_optional: Option<String>,
}

/// Response DTO for property
#[derive(Debug, Clone, Serialize)]
pub struct PropertyResponse {
    pub property_id: i64,
    pub name: String,
    pub address_optional: Option<String>,
    pub created_at: DateTime<Utc>,
    pub document_count: i64,
}

impl From<PropertyWithCount> for PropertyResponse {
    fn from(p: PropertyWithCount) -> Self {
        Self {
            property_id: p.id,
            name: p.name,
            address_optional: p.address_optional,
            created_at: p.created_at,
            document_count: p.document_count,
        }
    }
}
