//! Service layer: persistence, ingestion, retrieval and LLM integration.

pub mod cache;
pub mod documents;
pub mod ingest;
pub mod llm;
pub mod properties;
pub mod rag;
pub mod timeline;
pub mod users;

pub use cache::RedisCache;
pub use llm::{LlmProvider, OpenAiClient};
