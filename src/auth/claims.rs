use serde::{Deserialize, Serialize};

/// Claims of a Firebase ID token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (Firebase uid)
    pub sub: String,

    /// Audience (Firebase project id)
    pub aud: String,

    /// Issuer
    pub iss: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Time the user signed in (Unix timestamp)
    #[serde(default)]
    pub auth_time: Option<i64>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub email_verified: Option<bool>,

    /// Provider details from Firebase
    #[serde(default)]
    pub firebase: Option<FirebaseClaims>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirebaseClaims {
    #[serde(default)]
    pub sign_in_provider: Option<String>,
}
