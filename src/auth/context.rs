use super::Claims;

/// Authenticated user, attached to handlers through [`super::RequireAuth`]
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Local user row id
    pub user_id: i64,

    /// Identity-provider subject
    pub external_id: String,

    pub email: Option<String>,

    claims: Claims,
}

impl AuthContext {
    pub fn new(user_id: i64, claims: Claims) -> Self {
        Self {
            user_id,
            external_id: claims.sub.clone(),
            email: claims.email.clone(),
            claims,
        }
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn sign_in_provider(&self) -> Option<&str> {
        self.claims
            .firebase
            .as_ref()
            .and_then(|f| f.sign_in_provider.as_deref())
    }
}
