//! Retrieval-augmented answers over a user's document chunks.
//!
//! Retrieval is a brute-force cosine ranking of the caller's stored chunk
//! vectors against the embedded question. The top chunks become labelled
//! context for a JSON-mode chat completion.

use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

use crate::app::AppState;
use crate::domain::chat::{
    ChatAnswer, ChatRequest, ChatSource, ChunkCandidate, Language, RetrievedChunk,
};
use crate::error::{ApiError, ApiResult};
use crate::services::cache::{keys, RedisCache};
use crate::services::llm::{ChatJsonRequest, LlmProvider};
use crate::services::properties;

/// Chunks handed to the model per question
pub const DEFAULT_TOP_K: usize = 6;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 {
        return 0.0;
    }
    let denom = (norm_a.sqrt() * norm_b.sqrt()).max(1e-12);
    dot / denom
}

/// Score candidates against `query` and keep the best `max(1, k)`.
pub fn rank_candidates(
    query: &[f32],
    candidates: Vec<ChunkCandidate>,
    k: usize,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = candidates
        .into_iter()
        .filter(|c| !c.embedding.is_empty())
        .map(|c| RetrievedChunk {
            score: cosine_similarity(query, &c.embedding),
            document_id: c.document_id,
            property_id: c.property_id,
            chunk_id: c.chunk_id,
            text: c.text,
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k.max(1));
    scored
}

/// Embed the question and rank the caller's chunks.
#[instrument(skip(state, question, request_id))]
pub async fn search(
    state: &AppState,
    question: &str,
    user_id: i64,
    property_id: Option<i64>,
    k: usize,
    request_id: Option<&str>,
) -> ApiResult<Vec<RetrievedChunk>> {
    let query = state
        .llm
        .embed(&[question.to_string()], request_id)
        .await
        .map_err(|e| {
            warn!(error = %e, "Question embedding failed");
            ApiError::upstream("Embedding request failed")
        })?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::upstream("Embedding request failed"))?;

    let candidates = sqlx::query_as::<_, ChunkCandidate>(
        r#"
        SELECT c.document_id, d.property_id, c.chunk_id, c.text, c.embedding
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        JOIN properties p ON p.id = d.property_id
        WHERE p.user_id = $1
          AND ($2::BIGINT IS NULL OR d.property_id = $2)
          AND cardinality(c.embedding) > 0
        "#,
    )
    .bind(user_id)
    .bind(property_id)
    .fetch_all(&state.db)
    .await?;

    let considered = candidates.len();
    let hits = rank_candidates(&query, candidates, k);
    debug!(considered, returned = hits.len(), "Chunks ranked");
    Ok(hits)
}

/// Fixed answer when nothing relevant was retrieved
pub fn fallback_answer(question: &str, language: Language) -> ChatAnswer {
    let (answer, missing) = match language {
        Language::De => (
            "Im bereitgestellten Kontext wurden keine passenden Informationen gefunden.",
            "Keine relevanten Kontextstellen zur Frage vorhanden",
        ),
        Language::En => (
            "No matching information was found in the provided context.",
            "No relevant context passages available for the question",
        ),
        Language::Fr => (
            "Aucune information correspondante n'a ete trouvee dans le contexte fourni.",
            "Aucun passage de contexte pertinent disponible pour la question",
        ),
    };
    ChatAnswer {
        answer: answer.to_string(),
        key_points: Vec::new(),
        sources: Vec::new(),
        missing_info: vec![format!("{missing}: {question}")],
    }
}

/// Context blocks labelled `[DOC {document_id} | {chunk_id}]`
pub fn build_context(contexts: &[RetrievedChunk]) -> String {
    contexts
        .iter()
        .map(|c| format!("[DOC {} | {}]\n{}", c.document_id, c.chunk_id, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn system_prompt(language: Language) -> String {
    let lang = language.english_name();
    format!(
        "You assist owners of condominium apartments. Use ONLY the provided context.\n\
         The context is in the documents' original language, usually German. Read it as is.\n\
         Answer in {lang} and write key_points in {lang}.\n\
         If the context lacks information, list it under missing_info instead of guessing.\n\
         Keep numbers, dates, currencies and amounts exactly as in the context.\n\
         Explain legal and financial terms in plain language for non-native speakers.\n\
         Never translate or alter source labels; DOC and chunk identifiers stay unchanged.\n\
         Return only JSON in this form:\n\
         {{\"answer\":\"...\",\"key_points\":[\"...\"],\"sources\":[{{\"document_id\":number,\"chunk_id\":\"...\"}}],\"missing_info\":[\"...\"]}}\n\
         sources may only reference DOC/chunk labels present in the context."
    )
}

/// Drop citations that do not point at a retrieved chunk.
pub fn filter_sources(sources: Vec<ChatSource>, contexts: &[RetrievedChunk]) -> Vec<ChatSource> {
    let allowed: HashSet<(i64, &str)> = contexts
        .iter()
        .map(|c| (c.document_id, c.chunk_id.as_str()))
        .collect();
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| allowed.contains(&(s.document_id, s.chunk_id.as_str())))
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Answer `question` from `contexts` in `language`.
#[instrument(skip(llm, question, contexts), fields(contexts = contexts.len()))]
pub async fn answer_with_context(
    llm: &dyn LlmProvider,
    question: &str,
    contexts: &[RetrievedChunk],
    language: Language,
    request_id: Option<&str>,
) -> ApiResult<ChatAnswer> {
    if contexts.is_empty() {
        return Ok(fallback_answer(question, language));
    }

    let user = format!(
        "KONTEXT:\n{}\n\nFRAGE:\n{}",
        build_context(contexts),
        question
    );
    let mut request = ChatJsonRequest::new(system_prompt(language), user);
    request.request_id = request_id.map(str::to_string);

    let content = llm.complete_json(request).await.map_err(|e| {
        warn!(error = %e, "Chat completion request failed");
        ApiError::upstream("Chat completion request failed")
    })?;

    let mut answer: ChatAnswer = serde_json::from_str(&content).map_err(|e| {
        warn!(error = %e, "Chat completion response unusable");
        ApiError::upstream("Chat completion response parsing failed")
    })?;

    let cited = answer.sources.len();
    answer.sources = filter_sources(answer.sources, contexts);
    if answer.sources.len() != cited {
        debug!(
            dropped = cited - answer.sources.len(),
            "Dropped citations outside the retrieved context"
        );
    }
    Ok(answer)
}

/// Full chat flow: validate, serve from cache, retrieve, answer, cache.
pub async fn chat(
    state: &AppState,
    user_id: i64,
    request: ChatRequest,
    request_id: Option<&str>,
) -> ApiResult<ChatAnswer> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::bad_request("question must not be empty"));
    }
    if let Some(property_id) = request.property_id {
        properties::owned_property_or_404(&state.db, user_id, property_id).await?;
    }

    let cache_key = keys::chat_answer(user_id, request.property_id, request.language, question);
    if let Some(cache) = &state.cache {
        if let Some(hit) = cache.get::<ChatAnswer>(&cache_key).await {
            return Ok(hit);
        }
    }

    let contexts = search(
        state,
        question,
        user_id,
        request.property_id,
        DEFAULT_TOP_K,
        request_id,
    )
    .await?;
    let answer = answer_with_context(
        state.llm.as_ref(),
        question,
        &contexts,
        request.language,
        request_id,
    )
    .await?;

    if let Some(cache) = &state.cache {
        if let Err(e) = cache.set(&cache_key, &answer).await {
            warn!(error = %e, "Failed to cache chat answer");
        }
    }

    info!(
        user_id,
        contexts = contexts.len(),
        sources = answer.sources.len(),
        "Chat answered"
    );
    Ok(answer)
}

/// Forget cached answers of a user after their documents changed.
pub async fn invalidate_user_answers(cache: Option<&RedisCache>, user_id: i64) {
    let Some(cache) = cache else {
        return;
    };
    match cache.delete_pattern(&keys::chat_user_pattern(user_id)).await {
        Ok(deleted) => debug!(user_id, deleted, "Chat answers invalidated"),
        Err(e) => warn!(user_id, error = %e, "Failed to invalidate chat answers"),
    }
}
