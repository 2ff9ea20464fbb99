//! Property ownership and persistence

use sqlx::PgPool;

use crate::domain::properties::{Property, PropertyWithCount, MAX_PROPERTY_NAME_CHARS};
use crate::error::{ApiError, ApiResult};

const PROPERTY_WITH_COUNT: &str = r#"
    SELECT p.id, p.name, p.address_optional, p.created_at,
           (SELECT COUNT(*) FROM documents d WHERE d.property_id = p.id) AS document_count
    FROM properties p
"#;

/// Load a property owned by `user_id`; anything else is reported as missing.
pub async fn owned_property_or_404(
    db: &PgPool,
    user_id: i64,
    property_id: i64,
) -> ApiResult<Property> {
    sqlx::query_as::<_, Property>(
        r#"
        SELECT id, user_id, name, address_optional, created_at
        FROM properties
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(property_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found("Property not found"))
}

/// Trim and check a property name.
pub fn normalize_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if name.chars().count() > MAX_PROPERTY_NAME_CHARS {
        return Err(ApiError::bad_request(format!(
            "name must be at most {} characters",
            MAX_PROPERTY_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}

/// Blank optional text becomes `None`.
pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn list_properties(db: &PgPool, user_id: i64) -> ApiResult<Vec<PropertyWithCount>> {
    let sql = format!("{PROPERTY_WITH_COUNT} WHERE p.user_id = $1 ORDER BY p.created_at DESC, p.id DESC");
    let rows = sqlx::query_as::<_, PropertyWithCount>(&sql)
        .bind(user_id)
        .fetch_all(db)
        .await?;
    Ok(rows)
}

pub async fn get_property(
    db: &PgPool,
    user_id: i64,
    property_id: i64,
) -> ApiResult<PropertyWithCount> {
    let sql = format!("{PROPERTY_WITH_COUNT} WHERE p.id = $1 AND p.user_id = $2");
    sqlx::query_as::<_, PropertyWithCount>(&sql)
        .bind(property_id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Property not found"))
}

pub async fn create_property(
    db: &PgPool,
    user_id: i64,
    name: &str,
    address: Option<&str>,
) -> ApiResult<PropertyWithCount> {
    let row = sqlx::query_as::<_, PropertyWithCount>(
        r#"
        INSERT INTO properties (user_id, name, address_optional)
        VALUES ($1, $2, $3)
        RETURNING id, name, address_optional, created_at, 0::BIGINT AS document_count
        "#,
    )
    .bind(user_id)
    .bind(name)
    .bind(address)
    .fetch_one(db)
    .await?;
    Ok(row)
}

pub async fn update_property(
    db: &PgPool,
    property: &Property,
    name: Option<&str>,
    address: Option<Option<&str>>,
) -> ApiResult<()> {
    let name = name.unwrap_or(&property.name);
    let address = match address {
        Some(value) => value,
        None => property.address_optional.as_deref(),
    };

    sqlx::query("UPDATE properties SET name = $1, address_optional = $2 WHERE id = $3")
        .bind(name)
        .bind(address)
        .bind(property.id)
        .execute(db)
        .await?;
    Ok(())
}

/// Delete a property; documents and everything derived from them cascade.
pub async fn delete_property(db: &PgPool, property_id: i64) -> ApiResult<()> {
    sqlx::query("DELETE FROM properties WHERE id = $1")
        .bind(property_id)
        .execute(db)
        .await?;
    Ok(())
}
