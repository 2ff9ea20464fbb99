use serde::{de, Deserialize, Deserializer, Serialize};

/// Languages answers and timeline entries can be served in.
/// Documents themselves are German.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    De,
    En,
    Fr,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Self::De => "de",
            Self::En => "en",
            Self::Fr => "fr",
        }
    }

    /// English name used inside prompts
    pub fn english_name(&self) -> &'static str {
        match self {
            Self::De => "German",
            Self::En => "English",
            Self::Fr => "French",
        }
    }
}

/// Request DTO for `POST /chat`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub property_id: Option<i64>,
    #[serde(default)]
    pub language: Language,
}

/// A chunk reference cited by an answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatSource {
    #[serde(deserialize_with = "integer_or_numeric_string")]
    pub document_id: i64,
    pub chunk_id: String,
}

/// Models emit ids both as `4` and as `"4"`.
fn integer_or_numeric_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Integer(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Integer(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid document id {text:?}"))),
    }
}

/// Citations that do not parse are dropped instead of failing the answer.
fn readable_sources<'de, D>(deserializer: D) -> Result<Vec<ChatSource>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}

/// Structured answer returned by `POST /chat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatAnswer {
    pub answer: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default, deserialize_with = "readable_sources")]
    pub sources: Vec<ChatSource>,
    #[serde(default)]
    pub missing_info: Vec<String>,
}

/// A stored chunk considered for retrieval
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkCandidate {
    pub document_id: i64,
    pub property_id: i64,
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A chunk selected as answer context, with its similarity score
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub document_id: i64,
    pub property_id: i64,
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
}
