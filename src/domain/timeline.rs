use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::chat::Language;

/// Timeline entry category, in display priority order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TimelineCategory {
    Deadline,
    Payment,
    Meeting,
    Info,
}

impl TimelineCategory {
    /// Lower sorts first
    pub fn priority(&self) -> u8 {
        match self {
            Self::Deadline => 0,
            Self::Payment => 1,
            Self::Meeting => 2,
            Self::Info => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::Payment => "payment",
            Self::Meeting => "meeting",
            Self::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "deadline" => Some(Self::Deadline),
            "payment" => Some(Self::Payment),
            "meeting" => Some(Self::Meeting),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// A validated event extracted from document text
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExtractedTimelineItem {
    pub title: String,
    pub date_iso: NaiveDate,
    pub time_24h: Option<String>,
    pub category: TimelineCategory,
    pub amount_eur: Option<f64>,
    pub description: String,
    pub source_quote: Option<String>,
}

/// Response DTO for `POST /timeline/extract`
#[derive(Debug, Clone, Serialize, Default)]
pub struct TimelineExtraction {
    pub items: Vec<ExtractedTimelineItem>,
}

/// Stored timeline item joined with its document
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimelineItemRow {
    pub id: i64,
    pub property_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub document_uploaded_at: DateTime<Utc>,
    pub title: String,
    pub date_iso: NaiveDate,
    pub time_24h: Option<String>,
    pub category: String,
    pub amount_eur: Option<Decimal>,
    pub description: String,
    pub source_quote: Option<String>,
}

/// Response DTO for `GET /timeline`
#[derive(Debug, Clone, Serialize)]
pub struct TimelineItemResponse {
    pub timeline_item_id: i64,
    pub property_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub document_uploaded_at: DateTime<Utc>,
    pub title: String,
    pub date_iso: NaiveDate,
    pub time_24h: Option<String>,
    pub category: String,
    pub amount_eur: Option<f64>,
    pub description: String,
    pub source_quote: Option<String>,
}

impl From<TimelineItemRow> for TimelineItemResponse {
    fn from(row: TimelineItemRow) -> Self {
        Self {
            timeline_item_id: row.id,
            property_id: row.property_id,
            document_id: row.document_id,
            filename: row.filename,
            document_uploaded_at: row.document_uploaded_at,
            title: row.title,
            date_iso: row.date_iso,
            time_24h: row.time_24h,
            category: row.category,
            amount_eur: row.amount_eur.and_then(|a| a.to_f64()),
            description: row.description,
            source_quote: row.source_quote,
        }
    }
}

/// Cached translation of a timeline item
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TranslationRow {
    pub timeline_item_id: i64,
    pub translated_title: String,
    pub translated_description: String,
    pub source_fingerprint: String,
}

/// Translated title and description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslatedFields {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineQuery {
    pub property_id: i64,
    #[serde(default)]
    pub document_id: Option<i64>,
    #[serde(default)]
    pub language: Language,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineExtractRequest {
    pub raw_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineDocumentsRequest {
    pub property_id: i64,
    #[serde(default)]
    pub document_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineRebuildQuery {
    pub property_id: i64,
}

/// Extracted item tagged with the document it came from
#[derive(Debug, Clone, Serialize)]
pub struct MergedTimelineItem {
    #[serde(flatten)]
    pub item: ExtractedTimelineItem,
    pub property_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub source: String,
}

/// A document skipped during bulk extraction
#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub document_id: i64,
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractDocumentsResponse {
    pub items: Vec<MergedTimelineItem>,
    pub documents_considered: usize,
    pub documents_processed: usize,
    pub documents_failed: Vec<DocumentFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildResponse {
    pub items_count: usize,
    pub updated_at: DateTime<Utc>,
    pub documents_considered: usize,
    pub documents_processed: usize,
    pub documents_failed: Vec<DocumentFailure>,
}
