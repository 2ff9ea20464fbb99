mod api;
mod app;
mod auth;
mod config;
mod db;
mod domain;
mod error;
mod logging;
mod middleware;
mod routes;
mod services;

use anyhow::Result;
use std::sync::Arc;

use services::{LlmProvider, OpenAiClient, RedisCache};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;
    settings.validate()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting ndiah backend"
    );

    // Create database pool and bring the schema up to date
    let pool = db::create_pool(&settings).await?;
    db::run_migrations(&pool).await?;

    // Redis is optional; without it chat answers are not cached
    let cache = match &settings.redis_url {
        Some(url) => match RedisCache::new(url, settings.redis_cache_ttl_seconds).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable - chat answers will not be cached");
                None
            }
        },
        None => {
            tracing::info!("REDIS_URL not set - chat answer cache disabled");
            None
        }
    };

    // Create LLM client
    let llm = OpenAiClient::new(
        &settings.openai_base_url,
        &settings.openai_api_key,
        &settings.openai_model,
        &settings.embed_model,
        settings.openai_timeout_seconds,
        settings.openai_max_retry_seconds,
    )?;

    // Optionally check LLM provider health (non-blocking)
    tokio::spawn({
        let llm = llm.clone();
        async move {
            match llm.health_check().await {
                Ok(()) => tracing::info!("LLM provider is reachable"),
                Err(e) => tracing::warn!(error = %e, "LLM provider health check failed"),
            }
        }
    });

    // Create JWKS cache for Firebase ID token verification
    let http_client = reqwest::Client::new();
    let jwks_cache = auth::JwksCache::new(
        http_client,
        settings.auth_jwks_url.clone(),
        settings.firebase_issuer(),
        settings.firebase_project_id.clone(),
        settings.jwks_cache_ttl_seconds,
    );

    if let Err(e) = jwks_cache.warm_cache().await {
        tracing::warn!(error = %e, "Failed to warm JWKS cache - will fetch on first request");
    }

    let server_addr = settings.server_addr.clone();
    let state = app::AppState::new(pool, settings, jwks_cache, cache, Arc::new(llm));

    let app = app::create_app(state);

    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    tracing::info!("Listening on {}", server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
