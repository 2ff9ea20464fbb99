pub mod chat;
pub mod documents;
pub mod health;
pub mod me;
pub mod properties;
pub mod timeline;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    // Uploads carry whole PDFs and archives, so they get their own body limit
    let uploads = Router::new()
        .route("/documents/upload", post(documents::upload_document))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes));

    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        // Protected routes
        .route("/auth/me", get(me::get_me))
        // Properties
        .route(
            "/properties",
            get(properties::list_properties).post(properties::create_property),
        )
        .route(
            "/properties/:property_id",
            get(properties::get_property)
                .patch(properties::update_property)
                .delete(properties::delete_property),
        )
        // Documents
        .route("/documents", get(documents::list_documents))
        .route("/documents/status", get(documents::documents_status))
        .route("/documents/source", get(documents::get_source))
        .route("/documents/:document_id", delete(documents::delete_document))
        .route("/documents/:document_id/file", get(documents::get_file))
        .route("/documents/:document_id/reindex", post(documents::reindex_document))
        .merge(uploads)
        // Chat
        .route("/chat", post(chat::chat))
        // Timeline
        .route("/timeline", get(timeline::list_timeline))
        .route("/timeline/extract", post(timeline::extract))
        .route("/timeline/extract-documents", post(timeline::extract_documents))
        .route("/timeline/rebuild", post(timeline::rebuild))
}
