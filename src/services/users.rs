//! Local user records for identity-provider subjects

use sqlx::PgPool;

use crate::domain::users::User;

/// Find or create the user for `external_id`, refreshing the stored email.
pub async fn upsert_user(
    db: &PgPool,
    external_id: &str,
    email: Option<&str>,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (external_id, email)
        VALUES ($1, $2)
        ON CONFLICT (external_id)
        DO UPDATE SET email = COALESCE(EXCLUDED.email, users.email)
        RETURNING id, external_id, email, created_at
        "#,
    )
    .bind(external_id)
    .bind(email)
    .fetch_one(db)
    .await
}

pub async fn get_user(db: &PgPool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, external_id, email, created_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await
}
