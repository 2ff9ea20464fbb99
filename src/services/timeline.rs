//! Timeline extraction, storage and translation.
//!
//! Extraction sends a condensed copy of the document text to the chat model
//! and keeps only items with a real calendar date. Stored items are German;
//! other languages are translated on read and cached per item keyed by a
//! fingerprint of the source text.

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::app::AppState;
use crate::config::Settings;
use crate::domain::chat::Language;
use crate::domain::timeline::{
    DocumentFailure, ExtractDocumentsResponse, ExtractedTimelineItem, MergedTimelineItem,
    RebuildResponse, TimelineCategory, TimelineItemResponse, TimelineItemRow, TranslatedFields,
    TranslationRow,
};
use crate::error::{ApiError, ApiResult};
use crate::services::ingest;
use crate::services::llm::{ChatJsonRequest, LlmProvider};

const MAX_SOURCE_QUOTE_CHARS: usize = 160;

/// Parallel translation requests per listing
const TRANSLATION_CONCURRENCY: usize = 4;

/// Keys some models use instead of `items`
const ITEM_ARRAY_ALIASES: [&str; 4] = ["timeline", "events", "entries", "results"];

static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}\.\d{1,2}\.\d{2,4})\b").expect("valid regex")
});
static KEYWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(f[aä]llig|frist|sp[aä]testens|zahlung|nachzahlung|versammlung|etv|termin|sitzung|widerspruch|einreichung)\b",
    )
    .expect("valid regex")
});
static TIME_24H: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[01]\d|2[0-3]):[0-5]\d$").expect("valid regex"));
static FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_-]*\s*").expect("valid regex"));
static FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```$").expect("valid regex"));

const EXTRACTION_PROMPT: &str = r#"Du liest deutsche Unterlagen einer Wohnungseigentümergemeinschaft (Hausgeldabrechnung, Wirtschaftsplan, Einladung oder Protokoll der ETV, Aushänge) und listest die Ereignisse, auf die der Eigentümer reagieren muss.

Regeln:
1. Nur Einträge mit exaktem Kalenderdatum (YYYY-MM-DD). Angaben nur mit Monat oder Jahr weglassen.
2. Höchstens 25 Einträge. Vorrang: deadline vor payment vor meeting vor info.
3. title: knapp, höchstens 80 Zeichen. description: ein bis zwei verständliche Sätze.
4. amount_eur nur bei einem ausdrücklich genannten Eurobetrag, Dezimalpunkt (z. B. 219.29), sonst null.
5. time_24h (HH:MM) nur wenn eine Uhrzeit im Text steht, sonst null.
6. Kategorien:
   - meeting: Versammlung, Termin, Sitzung, Begehung
   - payment: Hausgeld, Vorschuss, Nachzahlung, Erstattung, Umlage, Zuführung zur Rücklage
   - deadline: fällig bis, Frist, spätestens, Widerspruch bis, Einreichung bis
   - info: datierter Hinweis, der in keine andere Kategorie passt
7. Nichts erfinden oder ableiten.
8. source_quote: kurzes wörtliches Zitat, das den Eintrag belegt, höchstens 160 Zeichen.
9. Antworte nur mit JSON in dieser Form:
{"items":[{"title":"...","date_iso":"YYYY-MM-DD","time_24h":null,"category":"meeting|payment|deadline|info","amount_eur":null,"description":"...","source_quote":"..."}]}"#;

/// Shrink long text to the lines that look like they carry events.
///
/// Lines with a date or a deadline/payment/meeting keyword are kept with two
/// lines of context on each side. When that leaves too little, the head and
/// tail of the document are added around it. Lengths are in characters.
pub fn compress_for_timeline(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut selected = BTreeSet::new();
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        if DATE_PATTERN.is_match(line) || KEYWORD_PATTERN.is_match(line) {
            let end = (i + 3).min(lines.len());
            selected.extend(i.saturating_sub(2)..end);
        }
    }

    let mut condensed = selected
        .into_iter()
        .map(|i| lines[i])
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if condensed.chars().count() < (max_chars / 4).min(4000) {
        let head: String = text.chars().take(max_chars / 2).collect();
        let tail_len = max_chars / 4;
        let total = text.chars().count();
        let tail: String = text.chars().skip(total.saturating_sub(tail_len)).collect();
        condensed = format!("{head}\n...\n{condensed}\n...\n{tail}")
            .trim()
            .to_string();
    }

    condensed.chars().take(max_chars).collect()
}

/// Pull the raw item array out of a model response.
pub fn parse_timeline_payload(content: &str) -> Result<Vec<Value>, String> {
    let mut normalized = content.trim().to_string();
    if normalized.is_empty() {
        return Err("empty response".to_string());
    }
    if normalized.starts_with("```") {
        normalized = FENCE_OPEN.replace(&normalized, "").into_owned();
        normalized = FENCE_CLOSE.replace(&normalized, "").into_owned();
    }

    let data: Value = serde_json::from_str(&normalized).map_err(|e| e.to_string())?;
    match data {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove("items") {
                return Ok(items);
            }
            ITEM_ARRAY_ALIASES
                .iter()
                .find_map(|alias| match map.remove(*alias) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| "no item array in response".to_string())
        }
        _ => Err("response root is not an object".to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RawTimelineItem {
    title: String,
    date_iso: String,
    #[serde(default)]
    time_24h: Option<String>,
    category: String,
    #[serde(default)]
    amount_eur: Option<Value>,
    description: String,
    #[serde(default)]
    source_quote: Option<String>,
}

/// Validate one raw item; `None` drops it.
fn validate_item(value: Value) -> Option<ExtractedTimelineItem> {
    let raw: RawTimelineItem = serde_json::from_value(value).ok()?;

    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }
    let date_iso = NaiveDate::parse_from_str(raw.date_iso.trim(), "%Y-%m-%d").ok()?;
    let category = TimelineCategory::parse(&raw.category)?;

    let amount_eur = match raw.amount_eur {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n.as_f64()?),
        Some(Value::String(s)) => Some(s.trim().parse::<f64>().ok()?),
        Some(_) => return None,
    };
    if amount_eur.is_some_and(|a| !a.is_finite()) {
        return None;
    }

    let time_24h = raw
        .time_24h
        .map(|t| t.trim().to_string())
        .filter(|t| TIME_24H.is_match(t));

    let source_quote = match raw.source_quote.map(|q| q.trim().to_string()) {
        Some(q) if q.chars().count() > MAX_SOURCE_QUOTE_CHARS => return None,
        Some(q) if q.is_empty() => None,
        other => other,
    };

    Some(ExtractedTimelineItem {
        title: title.to_string(),
        date_iso,
        time_24h,
        category,
        amount_eur,
        description: raw.description.trim().to_string(),
        source_quote,
    })
}

/// Validate, order by category priority then date, time and title, and cap.
pub fn select_items(raw_items: Vec<Value>, max_items: usize) -> Vec<ExtractedTimelineItem> {
    let mut items: Vec<ExtractedTimelineItem> =
        raw_items.into_iter().filter_map(validate_item).collect();

    items.sort_by_cached_key(|item| {
        (
            item.category.priority(),
            item.date_iso,
            item.time_24h.clone().unwrap_or_else(|| "99:99".to_string()),
            item.title.to_lowercase(),
        )
    });
    items.truncate(max_items);
    items
}

/// Ask the chat model for the dated events in `text`.
///
/// Blank text yields no items without calling the model.
#[instrument(skip(llm, settings, text, request_id), fields(chars = text.len()))]
pub async fn extract_timeline(
    llm: &dyn LlmProvider,
    settings: &Settings,
    text: &str,
    request_id: Option<&str>,
) -> ApiResult<Vec<ExtractedTimelineItem>> {
    let input = compress_for_timeline(text, settings.timeline_extraction_input_chars);
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut request = ChatJsonRequest::new(EXTRACTION_PROMPT, input);
    request.max_completion_tokens = Some(settings.timeline_extraction_response_tokens);
    request.timeout = Some(Duration::from_secs(
        settings.timeline_extraction_timeout_seconds,
    ));
    request.request_id = request_id.map(str::to_string);

    let content = llm.complete_json(request).await.map_err(|e| {
        warn!(error = %e, "Timeline extraction request failed");
        if e.is_timeout() {
            ApiError::upstream("Timeline extraction request timed out")
        } else {
            ApiError::upstream("Timeline extraction request failed")
        }
    })?;

    let raw_items = parse_timeline_payload(&content).map_err(|reason| {
        warn!(reason = %reason, "Timeline extraction response unusable");
        ApiError::upstream("Timeline extraction response parsing failed")
    })?;

    let items = select_items(raw_items, settings.timeline_extraction_max_items);
    debug!(items = items.len(), "Timeline items extracted");
    Ok(items)
}

/// Swap a document's timeline items in one transaction.
pub async fn replace_items(
    db: &PgPool,
    document_id: i64,
    property_id: i64,
    items: &[ExtractedTimelineItem],
) -> ApiResult<usize> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM timeline_items WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    if !items.is_empty() {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO timeline_items (document_id, property_id, title, date_iso, time_24h, \
             category, amount_eur, description, source_quote) ",
        );
        builder.push_values(items, |mut b, item| {
            b.push_bind(document_id)
                .push_bind(property_id)
                .push_bind(item.title.clone())
                .push_bind(item.date_iso)
                .push_bind(item.time_24h.clone())
                .push_bind(item.category.as_str())
                .push_bind(item.amount_eur.and_then(to_decimal))
                .push_bind(item.description.clone())
                .push_bind(item.source_quote.clone());
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(items.len())
}

fn to_decimal(amount: f64) -> Option<Decimal> {
    Decimal::from_f64_retain(amount).map(|d| d.round_dp(2))
}

/// Hex SHA-256 over the German title and description
pub fn fingerprint(title: &str, description: &str) -> String {
    hex::encode(Sha256::digest(format!("{title}\n{description}").as_bytes()))
}

fn translation_prompt(language: Language) -> String {
    format!(
        "You are a strict translation engine.\n\
         Translate the German source text to {}.\n\
         Rules:\n\
         1) Translate only, do not paraphrase.\n\
         2) Keep meaning, tone and level of detail.\n\
         3) Keep numbers, units and punctuation unless grammar requires a change.\n\
         4) Return only JSON with the keys title and description.\n\
         5) No comments, notes or extra keys.",
        language.english_name()
    )
}

/// Translate a title/description pair with the chat model.
pub async fn translate_fields(
    llm: &dyn LlmProvider,
    title: &str,
    description: &str,
    language: Language,
    request_id: Option<&str>,
) -> ApiResult<TranslatedFields> {
    let payload = serde_json::json!({ "title": title, "description": description });
    let mut request = ChatJsonRequest::new(translation_prompt(language), payload.to_string());
    request.temperature = Some(0.0);
    request.request_id = request_id.map(str::to_string);

    let content = llm.complete_json(request).await.map_err(|e| {
        warn!(error = %e, "Timeline translation request failed");
        ApiError::upstream("Timeline translation request failed")
    })?;

    serde_json::from_str(&content)
        .map_err(|_| ApiError::upstream("Timeline translation response parsing failed"))
}

/// Stored items of a property, translated when `language` is not German.
#[instrument(skip(state, request_id))]
pub async fn list_timeline(
    state: &AppState,
    property_id: i64,
    document_id: Option<i64>,
    language: Language,
    request_id: Option<&str>,
) -> ApiResult<Vec<TimelineItemResponse>> {
    let rows = sqlx::query_as::<_, TimelineItemRow>(
        r#"
        SELECT t.id, t.property_id, t.document_id, d.filename,
               d.uploaded_at AS document_uploaded_at, t.title, t.date_iso, t.time_24h,
               t.category, t.amount_eur, t.description, t.source_quote
        FROM timeline_items t
        JOIN documents d ON d.id = t.document_id
        WHERE t.property_id = $1
          AND d.property_id = $1
          AND ($2::BIGINT IS NULL OR t.document_id = $2)
        ORDER BY t.date_iso ASC, t.time_24h ASC NULLS LAST, t.id ASC
        "#,
    )
    .bind(property_id)
    .bind(document_id)
    .fetch_all(&state.db)
    .await?;

    if language == Language::De || rows.is_empty() {
        return Ok(rows.into_iter().map(TimelineItemResponse::from).collect());
    }

    let translations = translations_for(state, &rows, language, request_id).await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let translated = translations.get(&row.id).cloned();
            let mut response = TimelineItemResponse::from(row);
            if let Some(fields) = translated {
                response.title = fields.title;
                response.description = fields.description;
            }
            response
        })
        .collect())
}

/// Cached or fresh translations keyed by item id. Items whose translation
/// failed are absent and served in German.
async fn translations_for(
    state: &AppState,
    rows: &[TimelineItemRow],
    language: Language,
    request_id: Option<&str>,
) -> ApiResult<HashMap<i64, TranslatedFields>> {
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let cached = sqlx::query_as::<_, TranslationRow>(
        r#"
        SELECT timeline_item_id, translated_title, translated_description, source_fingerprint
        FROM timeline_item_translations
        WHERE language = $1 AND timeline_item_id = ANY($2)
        "#,
    )
    .bind(language.code())
    .bind(&ids)
    .fetch_all(&state.db)
    .await?;
    let cached: HashMap<i64, TranslationRow> =
        cached.into_iter().map(|c| (c.timeline_item_id, c)).collect();

    let mut translated = HashMap::with_capacity(rows.len());
    let mut pending: Vec<(i64, String, String, String)> = Vec::new();
    for row in rows {
        let fp = fingerprint(&row.title, &row.description);
        match cached.get(&row.id) {
            Some(hit) if hit.source_fingerprint == fp => {
                translated.insert(
                    row.id,
                    TranslatedFields {
                        title: hit.translated_title.clone(),
                        description: hit.translated_description.clone(),
                    },
                );
            }
            _ => pending.push((row.id, row.title.clone(), row.description.clone(), fp)),
        }
    }

    if pending.is_empty() {
        return Ok(translated);
    }

    let llm = state.llm.clone();
    let request_id = request_id.map(str::to_string);
    let results: Vec<(i64, String, ApiResult<TranslatedFields>)> = stream::iter(pending)
        .map(|(item_id, title, description, fp)| {
            let llm = llm.clone();
            let request_id = request_id.clone();
            async move {
                let result = translate_fields(
                    llm.as_ref(),
                    &title,
                    &description,
                    language,
                    request_id.as_deref(),
                )
                .await;
                (item_id, fp, result)
            }
        })
        .buffer_unordered(TRANSLATION_CONCURRENCY)
        .collect()
        .await;

    let mut stored = 0usize;
    for (item_id, fp, result) in results {
        let fields = match result {
            Ok(fields) => fields,
            Err(e) => {
                warn!(item_id, error = %e, "Serving untranslated timeline item");
                continue;
            }
        };
        if let Err(e) = store_translation(&state.db, item_id, language, &fields, &fp).await {
            warn!(item_id, error = %e, "Failed to cache timeline translation");
        } else {
            stored += 1;
        }
        translated.insert(item_id, fields);
    }

    debug!(stored, language = language.code(), "Timeline translations cached");
    Ok(translated)
}

async fn store_translation(
    db: &PgPool,
    item_id: i64,
    language: Language,
    fields: &TranslatedFields,
    fingerprint: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO timeline_item_translations
            (timeline_item_id, language, translated_title, translated_description, source_fingerprint)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT ON CONSTRAINT uq_timeline_item_language DO UPDATE SET
            translated_title = EXCLUDED.translated_title,
            translated_description = EXCLUDED.translated_description,
            source_fingerprint = EXCLUDED.source_fingerprint,
            updated_at = now()
        "#,
    )
    .bind(item_id)
    .bind(language.code())
    .bind(&fields.title)
    .bind(&fields.description)
    .bind(fingerprint)
    .execute(db)
    .await?;
    Ok(())
}

/// Document considered by a bulk extraction
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimelineSourceDocument {
    pub id: i64,
    pub property_id: i64,
    pub filename: String,
    pub extracted_text: Option<String>,
}

/// Result of re-deriving one document's timeline
#[derive(Debug)]
pub enum DocumentTimeline {
    Stored(Vec<ExtractedTimelineItem>),
    EmptyText,
}

/// Documents of a property, oldest first, optionally limited to `document_ids`.
pub async fn source_documents(
    db: &PgPool,
    property_id: i64,
    document_ids: Option<&[i64]>,
) -> ApiResult<Vec<TimelineSourceDocument>> {
    let filter: Option<Vec<i64>> = document_ids
        .filter(|ids| !ids.is_empty())
        .map(|ids| ids.to_vec());

    let docs = sqlx::query_as::<_, TimelineSourceDocument>(
        r#"
        SELECT id, property_id, filename, extracted_text
        FROM documents
        WHERE property_id = $1
          AND ($2::BIGINT[] IS NULL OR id = ANY($2))
        ORDER BY uploaded_at ASC, id ASC
        "#,
    )
    .bind(property_id)
    .bind(filter)
    .fetch_all(db)
    .await?;
    Ok(docs)
}

/// Stored text of a document, extracting it from the PDF when missing or blank.
async fn document_text(db: &PgPool, doc: &TimelineSourceDocument) -> ApiResult<String> {
    if let Some(text) = doc.extracted_text.as_ref().filter(|t| !t.trim().is_empty()) {
        return Ok(text.clone());
    }

    let bytes: Vec<u8> = sqlx::query_scalar("SELECT file_bytes FROM documents WHERE id = $1")
        .bind(doc.id)
        .fetch_one(db)
        .await?;
    ingest::extract_pdf_text(bytes).await.map_err(|e| {
        warn!(document_id = doc.id, error = %e, "PDF text extraction failed");
        ApiError::bad_request("PDF text could not be extracted")
    })
}

/// Re-extract and replace the timeline items of one document.
pub async fn refresh_document(
    state: &AppState,
    doc: &TimelineSourceDocument,
    request_id: Option<&str>,
) -> ApiResult<DocumentTimeline> {
    let text = document_text(&state.db, doc).await?;
    if text.trim().is_empty() {
        return Ok(DocumentTimeline::EmptyText);
    }

    let items = extract_timeline(state.llm.as_ref(), &state.settings, &text, request_id).await?;
    replace_items(&state.db, doc.id, doc.property_id, &items).await?;
    Ok(DocumentTimeline::Stored(items))
}

/// Merged extraction order: date, then time (missing last), then title.
pub fn sort_merged(items: &mut [MergedTimelineItem]) {
    items.sort_by_cached_key(|m| {
        (
            m.item.date_iso,
            m.item.time_24h.clone().unwrap_or_else(|| "99:99".to_string()),
            m.item.title.clone(),
        )
    });
}

fn failure(doc: &TimelineSourceDocument, reason: impl Into<String>) -> DocumentFailure {
    DocumentFailure {
        document_id: doc.id,
        filename: doc.filename.clone(),
        reason: reason.into(),
    }
}

/// Re-extract the timeline of selected documents and return the merged items.
#[instrument(skip(state, document_ids, request_id))]
pub async fn extract_documents(
    state: &AppState,
    property_id: i64,
    document_ids: Option<&[i64]>,
    request_id: Option<&str>,
) -> ApiResult<ExtractDocumentsResponse> {
    let docs = source_documents(&state.db, property_id, document_ids).await?;
    if docs.is_empty() {
        return Err(ApiError::bad_request(
            "No documents available for timeline extraction",
        ));
    }

    let mut items = Vec::new();
    let mut failed = Vec::new();
    let mut processed = 0usize;

    for doc in &docs {
        match refresh_document(state, doc, request_id).await {
            Ok(DocumentTimeline::Stored(extracted)) => {
                processed += 1;
                items.extend(extracted.into_iter().map(|item| MergedTimelineItem {
                    item,
                    property_id,
                    document_id: doc.id,
                    filename: doc.filename.clone(),
                    source: format!("Dokument: {}", doc.filename),
                }));
            }
            Ok(DocumentTimeline::EmptyText) => failed.push(failure(doc, "empty_text")),
            Err(ApiError::Upstream(reason)) => failed.push(failure(doc, reason)),
            Err(e) => {
                warn!(document_id = doc.id, error = %e, "Timeline extraction failed");
                failed.push(failure(doc, "document_timeline_extraction_failed"));
            }
        }
    }

    if processed == 0 && !failed.is_empty() {
        return Err(ApiError::upstream(
            "Timeline extraction failed for all selected documents",
        ));
    }

    sort_merged(&mut items);
    info!(
        documents = docs.len(),
        processed,
        failed = failed.len(),
        items = items.len(),
        "Timeline extracted from documents"
    );

    Ok(ExtractDocumentsResponse {
        items,
        documents_considered: docs.len(),
        documents_processed: processed,
        documents_failed: failed,
    })
}

/// Re-extract the timeline of every document in a property.
#[instrument(skip(state, request_id))]
pub async fn rebuild(
    state: &AppState,
    property_id: i64,
    request_id: Option<&str>,
) -> ApiResult<RebuildResponse> {
    let docs = source_documents(&state.db, property_id, None).await?;
    if docs.is_empty() {
        return Err(ApiError::bad_request(
            "No documents available for timeline rebuild",
        ));
    }

    let mut items_count = 0usize;
    let mut processed = 0usize;
    let mut failed = Vec::new();

    for doc in &docs {
        match refresh_document(state, doc, request_id).await {
            Ok(DocumentTimeline::Stored(items)) => {
                items_count += items.len();
                processed += 1;
            }
            Ok(DocumentTimeline::EmptyText) => processed += 1,
            Err(ApiError::Upstream(_)) => {
                failed.push(failure(doc, "document_timeline_extraction_failed"))
            }
            Err(e) => {
                warn!(document_id = doc.id, error = %e, "Timeline rebuild failed");
                failed.push(failure(doc, "document_timeline_rebuild_failed"));
            }
        }
    }

    if processed == 0 && !failed.is_empty() {
        return Err(ApiError::upstream(
            "Timeline extraction failed for all selected documents",
        ));
    }

    Ok(RebuildResponse {
        items_count,
        updated_at: Utc::now(),
        documents_considered: docs.len(),
        documents_processed: processed,
        documents_failed: failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::fake::FakeLlm;
    use crate::services::llm::LlmError;
    use serde_json::json;

    fn item(title: &str, date: &str, category: &str) -> Value {
        json!({
            "title": title,
            "date_iso": date,
            "time_24h": null,
            "category": category,
            "amount_eur": null,
            "description": "Beschreibung",
            "source_quote": null,
        })
    }

    #[test]
    fn short_text_is_only_trimmed() {
        assert_eq!(compress_for_timeline("  Hallo\nWelt \n", 100), "Hallo\nWelt");
        assert_eq!(compress_for_timeline("   ", 100), "");
    }

    #[test]
    fn long_text_keeps_event_lines_with_context() {
        let mut lines: Vec<String> = (0..200).map(|i| format!("Fuelltext Zeile {i}")).collect();
        lines[100] = "Die Versammlung findet am 12.05.2025 statt".to_string();
        let text = lines.join("\n");

        let compressed = compress_for_timeline(&text, 2000);
        assert!(compressed.contains("Die Versammlung findet am 12.05.2025 statt"));
        assert!(compressed.contains("Fuelltext Zeile 98"));
        assert!(compressed.contains("Fuelltext Zeile 102"));
        // Too little matched, so head and tail are added
        assert!(compressed.starts_with("Fuelltext Zeile 0"));
        assert!(compressed.contains("\n...\n"));
        assert!(compressed.chars().count() <= 2000);
    }

    #[test]
    fn keyword_match_is_case_insensitive_and_umlaut_aware() {
        assert!(KEYWORD_PATTERN.is_match("Nachzahlung FÄLLIG zum Monatsende"));
        assert!(KEYWORD_PATTERN.is_match("Zahlung spätestens bis"));
        assert!(KEYWORD_PATTERN.is_match("Einladung zur ETV"));
        assert!(!KEYWORD_PATTERN.is_match("Wetter"));
        assert!(DATE_PATTERN.is_match("am 1.3.25"));
        assert!(DATE_PATTERN.is_match("bis 2025-03-01"));
    }

    #[test]
    fn payload_accepts_fences_lists_and_aliases() {
        let fenced = "```json\n{\"items\": [{\"title\": \"a\"}]}\n```";
        assert_eq!(parse_timeline_payload(fenced).unwrap().len(), 1);

        assert_eq!(parse_timeline_payload("[{}, {}]").unwrap().len(), 2);
        assert_eq!(
            parse_timeline_payload(r#"{"events": [{}]}"#).unwrap().len(),
            1
        );
        assert_eq!(
            parse_timeline_payload(r#"{"items": null, "results": []}"#)
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn payload_rejects_unusable_shapes() {
        assert!(parse_timeline_payload("").is_err());
        assert!(parse_timeline_payload("not json").is_err());
        assert!(parse_timeline_payload("42").is_err());
        assert!(parse_timeline_payload(r#"{"data": {}}"#).is_err());
    }

    #[test]
    fn invalid_items_are_dropped() {
        let mut long_quote = item("Zitat", "2025-04-01", "info");
        long_quote["source_quote"] = json!("x".repeat(161));
        let mut bad_amount = item("Betrag", "2025-04-01", "payment");
        bad_amount["amount_eur"] = json!("viel");

        let raw = vec![
            item("Gültig", "2025-03-01", "payment"),
            item("Kein Tag", "2025-03", "deadline"),
            item("Schaltjahr", "2025-02-29", "deadline"),
            item("Unbekannt", "2025-03-01", "reminder"),
            item("   ", "2025-03-01", "info"),
            json!({"title": "Ohne Kategorie", "date_iso": "2025-03-01", "description": "x"}),
            long_quote,
            bad_amount,
        ];

        let items = select_items(raw, 25);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Gültig");
        assert_eq!(items[0].date_iso, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[test]
    fn malformed_time_is_cleared_and_amount_strings_parse() {
        let mut raw = item("Hausgeld", "2025-03-01", "payment");
        raw["time_24h"] = json!("25:00");
        raw["amount_eur"] = json!("219.29");
        raw["source_quote"] = json!("  ");

        let items = select_items(vec![raw], 25);
        assert_eq!(items[0].time_24h, None);
        assert_eq!(items[0].amount_eur, Some(219.29));
        assert_eq!(items[0].source_quote, None);
    }

    #[test]
    fn items_sort_by_priority_then_date_then_time() {
        let mut late_meeting = item("ETV", "2025-01-10", "meeting");
        late_meeting["time_24h"] = json!("18:00");
        let mut early_meeting = item("Begehung", "2025-01-10", "meeting");
        early_meeting["time_24h"] = json!("09:30");

        let raw = vec![
            item("Info", "2024-12-01", "info"),
            late_meeting,
            item("Ohne Uhrzeit", "2025-01-10", "meeting"),
            early_meeting,
            item("Hausgeld", "2025-02-01", "payment"),
            item("Widerspruch", "2025-06-30", "deadline"),
        ];

        let titles: Vec<String> = select_items(raw, 25).into_iter().map(|i| i.title).collect();
        assert_eq!(
            titles,
            vec!["Widerspruch", "Hausgeld", "Begehung", "ETV", "Ohne Uhrzeit", "Info"]
        );
    }

    #[test]
    fn selection_is_capped() {
        let raw: Vec<Value> = (1..=9)
            .map(|d| item(&format!("T{d}"), &format!("2025-01-0{d}"), "info"))
            .collect();
        let items = select_items(raw, 3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].title, "T3");
    }

    #[tokio::test]
    async fn blank_text_skips_the_model() {
        let llm = FakeLlm::new();
        let items = extract_timeline(&llm, &Settings::for_tests(), " \n ", None)
            .await
            .unwrap();
        assert!(items.is_empty());
        assert!(llm.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn extraction_uses_timeline_limits() {
        let llm = FakeLlm::new().with_completion(
            &json!({ "items": [item("Hausgeld fällig", "2025-03-01", "payment")] }).to_string(),
        );
        let settings = Settings::for_tests();

        let items = extract_timeline(&llm, &settings, "Hausgeld fällig am 01.03.2025", Some("rid-7"))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, TimelineCategory::Payment);

        let requests = llm.requests.lock();
        assert_eq!(
            requests[0].max_completion_tokens,
            Some(settings.timeline_extraction_response_tokens)
        );
        assert_eq!(
            requests[0].timeout,
            Some(Duration::from_secs(settings.timeline_extraction_timeout_seconds))
        );
        assert_eq!(requests[0].user, "Hausgeld fällig am 01.03.2025");
        assert_eq!(requests[0].request_id.as_deref(), Some("rid-7"));
    }

    #[tokio::test]
    async fn extraction_errors_have_stable_messages() {
        let settings = Settings::for_tests();

        let llm = FakeLlm::new().with_error(LlmError::Timeout);
        let err = extract_timeline(&llm, &settings, "Termin am 01.03.2025", None)
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), "Timeline extraction request timed out");

        let llm = FakeLlm::new().with_error(LlmError::Status {
            status: 400,
            body: "bad".to_string(),
        });
        let err = extract_timeline(&llm, &settings, "Termin am 01.03.2025", None)
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), "Timeline extraction request failed");

        let llm = FakeLlm::new().with_completion("sorry, no JSON today");
        let err = extract_timeline(&llm, &settings, "Termin am 01.03.2025", None)
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), "Timeline extraction response parsing failed");
    }

    #[test]
    fn fingerprint_tracks_source_text() {
        let a = fingerprint("Hausgeld", "Zahlung bis 1.3.");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint("Hausgeld", "Zahlung bis 1.3."));
        assert_ne!(a, fingerprint("Hausgeld", "Zahlung bis 2.3."));
    }

    #[tokio::test]
    async fn translation_is_deterministic_json() {
        let llm = FakeLlm::new()
            .with_completion(r#"{"title": "House money", "description": "Pay by March 1."}"#);
        let fields = translate_fields(&llm, "Hausgeld", "Zahlen bis 1.3.", Language::En, Some("rid-1"))
            .await
            .unwrap();
        assert_eq!(fields.title, "House money");

        let requests = llm.requests.lock();
        assert_eq!(requests[0].temperature, Some(0.0));
        assert!(requests[0].system.contains("to English"));
        assert_eq!(requests[0].request_id.as_deref(), Some("rid-1"));
        let payload: Value = serde_json::from_str(&requests[0].user).unwrap();
        assert_eq!(payload["title"], "Hausgeld");
    }

    #[tokio::test]
    async fn translation_rejects_partial_output() {
        let llm = FakeLlm::new().with_completion(r#"{"title": "Only a title"}"#);
        let err = translate_fields(&llm, "Hausgeld", "x", Language::Fr, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.public_message(),
            "Timeline translation response parsing failed"
        );
    }

    #[test]
    fn amounts_round_to_cents() {
        assert_eq!(to_decimal(219.29).unwrap().to_string(), "219.29");
        assert_eq!(to_decimal(10.005).map(|d| d.scale() <= 2), Some(true));
        assert!(to_decimal(f64::NAN).is_none());
    }

    #[test]
    fn merged_items_sort_by_date_time_title() {
        let make = |title: &str, date: (i32, u32, u32), time: Option<&str>| MergedTimelineItem {
            item: ExtractedTimelineItem {
                title: title.to_string(),
                date_iso: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
                time_24h: time.map(str::to_string),
                category: TimelineCategory::Info,
                amount_eur: None,
                description: String::new(),
                source_quote: None,
            },
            property_id: 1,
            document_id: 2,
            filename: "a.pdf".to_string(),
            source: "Dokument: a.pdf".to_string(),
        };

        let mut items = vec![
            make("B", (2025, 3, 1), None),
            make("A", (2025, 3, 1), None),
            make("C", (2025, 3, 1), Some("10:00")),
            make("D", (2025, 2, 1), None),
        ];
        sort_merged(&mut items);
        let titles: Vec<&str> = items.iter().map(|m| m.item.title.as_str()).collect();
        assert_eq!(titles, vec!["D", "C", "A", "B"]);
    }

    fn state_with(pool: PgPool, llm: &std::sync::Arc<FakeLlm>) -> std::sync::Arc<AppState> {
        AppState::for_tests(pool, Settings::for_tests(), llm.clone())
    }

    async fn cache_translation(
        pool: &PgPool,
        item_id: i64,
        title: &str,
        fingerprint: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timeline_item_translations
                (timeline_item_id, language, translated_title, translated_description, source_fingerprint)
            VALUES ($1, 'en', $2, 'cached description', $3)
            "#,
        )
        .bind(item_id)
        .bind(title)
        .bind(fingerprint)
        .execute(pool)
        .await?;
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn stale_translations_are_refreshed_once(pool: PgPool) -> anyhow::Result<()> {
        let current = fingerprint("Eigentümerversammlung", "Ordentliche Eigentümerversammlung");
        cache_translation(&pool, 1000, "Owners' meeting", &current).await?;
        cache_translation(&pool, 1001, "Outdated", "stale").await?;

        let llm = std::sync::Arc::new(FakeLlm::new().with_completion(
            &json!({ "title": "Service charge top-up", "description": "Top-up from the 2024 statement" })
                .to_string(),
        ));
        let state = state_with(pool.clone(), &llm);

        let items = list_timeline(&state, 10, None, Language::En, Some("rid-9")).await?;
        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Service charge top-up", "Owners' meeting"]);
        assert_eq!(llm.requests.lock().len(), 1);
        assert_eq!(llm.requests.lock()[0].request_id.as_deref(), Some("rid-9"));

        let (stored_fp,): (String,) = sqlx::query_as(
            "SELECT source_fingerprint FROM timeline_item_translations WHERE timeline_item_id = 1001",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(
            stored_fp,
            fingerprint("Hausgeld Nachzahlung", "Nachzahlung aus der Jahresabrechnung 2024")
        );

        let again = list_timeline(&state, 10, None, Language::En, None).await?;
        assert_eq!(again[0].title, "Service charge top-up");
        assert_eq!(llm.requests.lock().len(), 1);
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn failed_translations_fall_back_to_german(pool: PgPool) -> anyhow::Result<()> {
        let llm = std::sync::Arc::new(
            FakeLlm::new()
                .with_error(LlmError::Timeout)
                .with_error(LlmError::Timeout),
        );
        let state = state_with(pool.clone(), &llm);

        let items = list_timeline(&state, 10, None, Language::Fr, None).await?;
        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Hausgeld Nachzahlung", "Eigentümerversammlung"]);
        assert_eq!(llm.requests.lock().len(), 2);

        let (cached,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM timeline_item_translations")
            .fetch_one(&pool)
            .await?;
        assert_eq!(cached, 0);
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn extract_documents_reports_each_failure(pool: PgPool) -> anyhow::Result<()> {
        let llm = std::sync::Arc::new(
            FakeLlm::new()
                .with_completion(
                    &json!({ "items": [item("Eigentümerversammlung", "2025-05-12", "meeting")] })
                        .to_string(),
                )
                .with_error(LlmError::Timeout),
        );
        let state = state_with(pool.clone(), &llm);

        let response = extract_documents(&state, 10, None, Some("rid-3")).await?;
        assert_eq!(response.documents_considered, 3);
        assert_eq!(response.documents_processed, 1);
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].document_id, 100);
        assert_eq!(response.items[0].source, "Dokument: Protokoll_ETV.pdf");

        // blank stored text falls back to the unreadable PDF bytes
        let failures: Vec<(i64, &str)> = response
            .documents_failed
            .iter()
            .map(|f| (f.document_id, f.reason.as_str()))
            .collect();
        assert_eq!(
            failures,
            vec![
                (101, "document_timeline_extraction_failed"),
                (102, "Timeline extraction request timed out"),
            ]
        );

        let requests = llm.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.request_id.as_deref() == Some("rid-3")));
        drop(requests);

        let kept: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM timeline_items WHERE document_id = 102")
                .fetch_all(&pool)
                .await?;
        assert_eq!(kept, vec![(1001,)]);
        let (replaced,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM timeline_items WHERE document_id = 100 AND id = 1000")
                .fetch_one(&pool)
                .await?;
        assert_eq!(replaced, 0);
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn extract_documents_rejects_empty_and_all_failed_selections(
        pool: PgPool,
    ) -> anyhow::Result<()> {
        let llm = std::sync::Arc::new(FakeLlm::new().with_error(LlmError::Timeout));
        let state = state_with(pool, &llm);

        let err = extract_documents(&state, 10, Some(&[200, 999][..]), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.public_message(),
            "No documents available for timeline extraction"
        );

        let err = extract_documents(&state, 10, Some(&[101, 102][..]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
        assert_eq!(
            err.public_message(),
            "Timeline extraction failed for all selected documents"
        );
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn rebuild_counts_processed_and_failed_documents(pool: PgPool) -> anyhow::Result<()> {
        let llm = std::sync::Arc::new(
            FakeLlm::new()
                .with_completion(
                    &json!({ "items": [
                        item("Eigentümerversammlung", "2025-05-12", "meeting"),
                        item("Einladung versenden", "2025-04-20", "deadline"),
                    ] })
                    .to_string(),
                )
                .with_completion("not json"),
        );
        let state = state_with(pool.clone(), &llm);

        let response = rebuild(&state, 10, None).await?;
        assert_eq!(response.items_count, 2);
        assert_eq!(response.documents_considered, 3);
        assert_eq!(response.documents_processed, 1);
        let failures: Vec<(i64, &str)> = response
            .documents_failed
            .iter()
            .map(|f| (f.document_id, f.reason.as_str()))
            .collect();
        assert_eq!(
            failures,
            vec![
                (101, "document_timeline_rebuild_failed"),
                (102, "document_timeline_extraction_failed"),
            ]
        );

        let (stored,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM timeline_items WHERE document_id = 100")
                .fetch_one(&pool)
                .await?;
        assert_eq!(stored, 2);

        let err = rebuild(&state, 20, None).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn failed_item_replacement_keeps_old_items(pool: PgPool) -> anyhow::Result<()> {
        let items = select_items(vec![item("Neu", "2025-06-01", "info")], 25);
        // unknown property violates the foreign key after the delete ran
        let err = replace_items(&pool, 100, 999, &items).await.unwrap_err();
        assert!(matches!(err, ApiError::Database(_)));

        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM timeline_items WHERE document_id = 100")
                .fetch_all(&pool)
                .await?;
        assert_eq!(ids, vec![(1000,)]);
        Ok(())
    }
}
