//! Firebase ID token verification against Google's published signing keys

use anyhow::{Context, Result};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, CACHE_CONTROL};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Claims;

/// Minimum spacing between two key downloads
const REFETCH_COOLDOWN: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Accepted clock skew for `auth_time`
const AUTH_TIME_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: String,
    e: String,
}

/// The currently trusted keys, replaced as a whole on every download
#[derive(Default)]
struct KeySet {
    keys: HashMap<String, DecodingKey>,
    expires_at: Option<Instant>,
    fetched_at: Option<Instant>,
}

impl KeySet {
    fn fresh_key(&self, kid: &str) -> Option<DecodingKey> {
        match self.expires_at {
            Some(expiry) if Instant::now() < expiry => self.keys.get(kid).cloned(),
            _ => None,
        }
    }

    fn fetched_recently(&self) -> bool {
        self.fetched_at
            .map_or(false, |at| at.elapsed() < REFETCH_COOLDOWN)
    }
}

/// Signing-key cache shared by all requests
#[derive(Clone)]
pub struct JwksCache {
    keys: Arc<RwLock<KeySet>>,
    http: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: String,
    max_ttl: Duration,
}

impl JwksCache {
    /// `ttl_seconds` caps how long a downloaded key set is trusted, even
    /// when Google's `Cache-Control` allows longer.
    pub fn new(
        http: reqwest::Client,
        jwks_url: String,
        issuer: String,
        audience: String,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            keys: Arc::new(RwLock::new(KeySet::default())),
            http,
            jwks_url,
            issuer,
            audience,
            max_ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Verify an ID token and return its claims
    pub async fn verify_token(&self, token: &str) -> Result<Claims> {
        let header = decode_header(token).context("Invalid JWT header")?;
        if header.alg != Algorithm::RS256 {
            anyhow::bail!("Unexpected JWT algorithm {:?}", header.alg);
        }
        let kid = header.kid.context("JWT missing kid header")?;

        let key = self.key_for(&kid).await?;
        let claims = decode::<Claims>(token, &key, &self.validation())
            .context("JWT validation failed")?
            .claims;

        check_subject_and_auth_time(&claims, chrono::Utc::now().timestamp())?;
        Ok(claims)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);
        validation.validate_nbf = true;
        validation
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.keys.read().fresh_key(kid) {
            return Ok(key);
        }

        self.refresh().await?;

        self.keys
            .read()
            .keys
            .get(kid)
            .cloned()
            .with_context(|| format!("No signing key with kid {kid}"))
    }

    async fn refresh(&self) -> Result<()> {
        if self.keys.read().fetched_recently() {
            return Ok(());
        }

        tracing::debug!(url = %self.jwks_url, "Downloading signing keys");

        let response = self
            .http
            .get(&self.jwks_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            anyhow::bail!("JWKS fetch failed with status: {}", response.status());
        }

        let ttl = max_age(response.headers())
            .map_or(self.max_ttl, |advertised| advertised.min(self.max_ttl));
        let set: JwkSet = response.json().await.context("Failed to parse JWKS")?;

        let mut keys = HashMap::with_capacity(set.keys.len());
        for jwk in set.keys.into_iter().filter(|k| k.kty == "RSA") {
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(e) => tracing::warn!(kid = %jwk.kid, error = %e, "Skipping unusable JWK"),
            }
        }

        let now = Instant::now();
        let mut current = self.keys.write();
        *current = KeySet {
            keys,
            expires_at: Some(now + ttl),
            fetched_at: Some(now),
        };
        tracing::info!(
            keys = current.keys.len(),
            ttl_seconds = ttl.as_secs(),
            "Signing keys refreshed"
        );
        Ok(())
    }

    /// Download the key set ahead of the first request
    pub async fn warm_cache(&self) -> Result<()> {
        self.refresh().await
    }
}

/// `max-age` from a `Cache-Control` response header
fn max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|directive| {
            let (name, seconds) = directive.trim().split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            seconds.trim().parse::<u64>().ok().map(Duration::from_secs)
        })
}

/// Firebase requires a non-empty `sub` and an `auth_time` in the past.
fn check_subject_and_auth_time(claims: &Claims, now: i64) -> Result<()> {
    if claims.sub.trim().is_empty() {
        anyhow::bail!("JWT has an empty subject");
    }
    if let Some(auth_time) = claims.auth_time {
        if auth_time > now + AUTH_TIME_LEEWAY_SECS {
            anyhow::bail!("JWT auth_time lies in the future");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn cache() -> JwksCache {
        JwksCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/jwks".to_string(),
            "https://securetoken.google.com/ndiah-test".to_string(),
            "ndiah-test".to_string(),
            60,
        )
    }

    fn claims(sub: &str, auth_time: Option<i64>) -> Claims {
        serde_json::from_value(serde_json::json!({
            "sub": sub,
            "aud": "ndiah-test",
            "iss": "https://securetoken.google.com/ndiah-test",
            "iat": 1,
            "exp": 2,
            "auth_time": auth_time,
            "email": "owner@example.com",
            "firebase": { "sign_in_provider": "password", "identities": {} }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_garbage_token_without_fetching() {
        let err = cache().verify_token("not-a-jwt").await.unwrap_err();
        assert!(err.to_string().contains("Invalid JWT header"));
    }

    #[tokio::test]
    async fn rejects_hmac_signed_token() {
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims("uid-1", None),
            &jsonwebtoken::EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let err = cache().verify_token(&token).await.unwrap_err();
        assert!(err.to_string().contains("Unexpected JWT algorithm"));
    }

    #[test]
    fn max_age_is_read_from_cache_control() {
        let mut headers = HeaderMap::new();
        assert_eq!(max_age(&headers), None);

        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=19302, must-revalidate, no-transform"),
        );
        assert_eq!(max_age(&headers), Some(Duration::from_secs(19302)));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert_eq!(max_age(&headers), None);
    }

    #[test]
    fn empty_subject_and_future_auth_time_are_rejected() {
        let now = 1_700_000_000;
        check_subject_and_auth_time(&claims("uid-1", Some(now - 10)), now).unwrap();
        check_subject_and_auth_time(&claims("uid-1", None), now).unwrap();

        let err = check_subject_and_auth_time(&claims("  ", None), now).unwrap_err();
        assert!(err.to_string().contains("empty subject"));

        let err = check_subject_and_auth_time(&claims("uid-1", Some(now + 3600)), now).unwrap_err();
        assert!(err.to_string().contains("auth_time"));
    }

    #[test]
    fn expired_key_set_yields_no_key() {
        let mut set = KeySet::default();
        set.keys.insert(
            "k1".to_string(),
            DecodingKey::from_secret(b"unused"),
        );
        assert!(set.fresh_key("k1").is_none());

        set.expires_at = Some(Instant::now() + Duration::from_secs(60));
        assert!(set.fresh_key("k1").is_some());
        assert!(set.fresh_key("k2").is_none());
    }

    #[test]
    fn claims_accept_firebase_shape() {
        let ctx = crate::auth::AuthContext::new(7, claims("uid-1", Some(1)));
        assert_eq!(ctx.user_id, 7);
        assert_eq!(ctx.external_id, "uid-1");
        assert_eq!(ctx.email.as_deref(), Some("owner@example.com"));
        assert_eq!(ctx.sign_in_provider(), Some("password"));
    }
}
