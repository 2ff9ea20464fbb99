//! Document ingestion: upload validation, ZIP unpacking, text extraction,
//! chunking and indexing.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::PgPool;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use tracing::{info, instrument, warn};

use crate::app::AppState;
use crate::domain::documents::{DocumentStatus, IngestedDocument};
use crate::error::{ApiError, ApiResult};
use crate::services::timeline;

/// Maximum PDFs accepted from one archive
pub const MAX_ZIP_PDF_FILES: usize = 100;
/// Maximum declared uncompressed size of all PDFs in one archive
pub const MAX_ZIP_TOTAL_PDF_BYTES: u64 = 200 * 1024 * 1024;

/// Chunk window, in characters
pub const CHUNK_CHARS: usize = 1200;
/// Characters shared by consecutive chunks
pub const CHUNK_OVERLAP: usize = 200;

/// Rows per chunk INSERT statement
const CHUNK_INSERT_BATCH: usize = 500;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));
static INLINE_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Pdf,
    Zip,
}

/// Reduce an uploaded name to a safe basename.
pub fn sanitize_filename(filename: &str) -> ApiResult<String> {
    let base = filename
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or_default()
        .trim();
    let safe = UNSAFE_FILENAME_CHARS.replace_all(base, "_");
    let safe = safe.trim_matches(&['.', '_'][..]);
    if safe.is_empty() {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    Ok(safe.to_string())
}

pub fn upload_kind(safe_filename: &str) -> ApiResult<UploadKind> {
    let lower = safe_filename.to_lowercase();
    if lower.ends_with(".pdf") {
        Ok(UploadKind::Pdf)
    } else if lower.ends_with(".zip") {
        Ok(UploadKind::Zip)
    } else {
        Err(ApiError::bad_request("Only PDF or ZIP files are supported"))
    }
}

/// Signature and size checks for a single PDF.
pub fn validate_pdf(content: &[u8], max_bytes: usize) -> ApiResult<()> {
    if !content.starts_with(b"%PDF") {
        return Err(ApiError::bad_request("Uploaded file is not a valid PDF"));
    }
    if content.len() > max_bytes {
        return Err(ApiError::PayloadTooLarge(format!(
            "PDF exceeds size limit ({} bytes)",
            max_bytes
        )));
    }
    Ok(())
}

/// Pick `name`, or `stem_2.ext`, `stem_3.ext`, ... when taken.
pub fn unique_filename(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let mut counter = 2;
    loop {
        let candidate = format!("{stem}_{counter}{ext}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// A PDF entry read from an uploaded archive
#[derive(Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Result<Vec<u8>, String>,
}

/// Validate an archive and read its PDF entries.
///
/// Archive-level problems are errors; a single unreadable entry is reported
/// in its [`ArchiveEntry::content`].
pub fn read_pdf_archive(content: &[u8]) -> ApiResult<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(content))
        .map_err(|_| ApiError::bad_request("Uploaded ZIP file is invalid"))?;

    let mut pdf_indexes = Vec::new();
    let mut total_size: u64 = 0;
    for i in 0..archive.len() {
        let entry = match archive.by_index_raw(i) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(index = i, error = %e, "Skipping unreadable ZIP entry header");
                continue;
            }
        };
        if entry.is_dir() || !entry.name().to_lowercase().ends_with(".pdf") {
            continue;
        }
        total_size = total_size.saturating_add(entry.size());
        pdf_indexes.push(i);
    }

    if pdf_indexes.is_empty() {
        return Err(ApiError::bad_request("ZIP contains no PDF files"));
    }
    if pdf_indexes.len() > MAX_ZIP_PDF_FILES {
        return Err(ApiError::bad_request(format!(
            "ZIP contains too many PDFs (max {})",
            MAX_ZIP_PDF_FILES
        )));
    }
    if total_size > MAX_ZIP_TOTAL_PDF_BYTES {
        return Err(ApiError::bad_request(format!(
            "ZIP PDF content exceeds size limit ({} bytes)",
            MAX_ZIP_TOTAL_PDF_BYTES
        )));
    }

    let mut entries = Vec::with_capacity(pdf_indexes.len());
    for i in pdf_indexes {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                entries.push(ArchiveEntry {
                    name: format!("entry-{i}"),
                    content: Err(format!("Failed to read PDF from ZIP: {e}")),
                });
                continue;
            }
        };
        let name = entry.name().to_string();
        let declared = entry.size();

        // The declared size is untrusted; read one byte past it to notice lies
        let mut buf = Vec::with_capacity(declared.min(MAX_ZIP_TOTAL_PDF_BYTES) as usize);
        let read = (&mut entry).take(declared.saturating_add(1)).read_to_end(&mut buf);
        let content = match read {
            Ok(_) if buf.len() as u64 > declared => {
                Err("ZIP entry is larger than its declared size".to_string())
            }
            Ok(_) => Ok(buf),
            Err(_) => Err("Failed to process PDF from ZIP".to_string()),
        };
        entries.push(ArchiveEntry { name, content });
    }

    Ok(entries)
}

/// Normalise whitespace and split text into overlapping windows.
pub fn chunk_text(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let normalized = INLINE_WHITESPACE.replace_all(&normalized, " ");
    let normalized: String = normalized
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let normalized = BLANK_LINES.replace_all(&normalized, "\n\n");
    let chars: Vec<char> = normalized.trim().chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + CHUNK_CHARS).min(chars.len());
        if end < chars.len() {
            if let Some(brk) = find_break(&chars, start + CHUNK_CHARS / 2, end) {
                end = brk;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(CHUNK_OVERLAP).max(start + 1);
    }
    chunks
}

/// Latest paragraph, line or word boundary in `floor..end`, as an exclusive end.
fn find_break(chars: &[char], floor: usize, end: usize) -> Option<usize> {
    let window = floor..end;
    window
        .clone()
        .rev()
        .find(|&i| i > 0 && chars[i] == '\n' && chars[i - 1] == '\n')
        .or_else(|| window.clone().rev().find(|&i| chars[i] == '\n'))
        .or_else(|| window.rev().find(|&i| chars[i] == ' '))
        .map(|i| i + 1)
}

/// Extract text from PDF bytes on the blocking pool.
pub async fn extract_pdf_text(content: Vec<u8>) -> Result<String, String> {
    tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem(&content).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| format!("PDF parser crashed: {e}"))?
}

/// Validate, store and index one PDF into `property_id`.
#[instrument(skip(state, content, request_id), fields(size = content.len()))]
pub async fn ingest_pdf(
    state: &AppState,
    property_id: i64,
    filename: &str,
    content: Vec<u8>,
    request_id: Option<&str>,
) -> ApiResult<IngestedDocument> {
    let safe_filename = sanitize_filename(filename)?;
    if upload_kind(&safe_filename)? != UploadKind::Pdf {
        return Err(ApiError::bad_request("Only PDF files are supported"));
    }
    validate_pdf(&content, state.settings.max_pdf_bytes)?;

    let max_documents = state.settings.free_tier_max_documents_per_property;
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT filename FROM documents WHERE property_id = $1")
            .bind(property_id)
            .fetch_all(&state.db)
            .await?;
    if existing.len() as i64 >= max_documents {
        return Err(ApiError::Forbidden(format!(
            "Document limit reached for this property (max {})",
            max_documents
        )));
    }
    let taken: HashSet<String> = existing.into_iter().collect();
    let final_filename = unique_filename(&safe_filename, &taken);

    let (document_id, uploaded_at): (i64, chrono::DateTime<chrono::Utc>) = sqlx::query_as(
        r#"
        INSERT INTO documents (property_id, filename, content_type, file_bytes, file_size, status)
        VALUES ($1, $2, 'application/pdf', $3, $4, 'processing')
        RETURNING id, uploaded_at
        "#,
    )
    .bind(property_id)
    .bind(&final_filename)
    .bind(&content)
    .bind(content.len() as i64)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        let duplicate = e
            .as_database_error()
            .map_or(false, |db| db.is_unique_violation());
        if duplicate {
            ApiError::Conflict("A document with this filename is already being uploaded".into())
        } else {
            ApiError::Database(e)
        }
    })?;

    info!(document_id, filename = %final_filename, "Document stored");

    let (chunks_indexed, timeline_items_stored) =
        index_document(state, document_id, property_id, content, request_id).await?;

    Ok(IngestedDocument {
        document_id,
        filename: final_filename,
        uploaded_at,
        status: DocumentStatus::Indexed,
        chunks_indexed,
        timeline_items_stored,
    })
}

/// Derive text, chunks and timeline items for a stored PDF.
pub async fn index_document(
    state: &AppState,
    document_id: i64,
    property_id: i64,
    content: Vec<u8>,
    request_id: Option<&str>,
) -> ApiResult<(usize, usize)> {
    let text = match extract_pdf_text(content).await {
        Ok(text) => text,
        Err(e) => {
            warn!(document_id, error = %e, "PDF text extraction failed");
            record_status(&state.db, document_id, DocumentStatus::Failed).await;
            return Err(ApiError::bad_request("PDF text could not be extracted"));
        }
    };
    index_text(state, document_id, property_id, &text, request_id).await
}

/// Store `text` as the document's text and rebuild its chunks and timeline.
///
/// Marks the document `indexed`, or `failed` when any step fails.
pub async fn index_text(
    state: &AppState,
    document_id: i64,
    property_id: i64,
    text: &str,
    request_id: Option<&str>,
) -> ApiResult<(usize, usize)> {
    let result = derive_from_text(state, document_id, property_id, text, request_id).await;

    let status = if result.is_ok() {
        DocumentStatus::Indexed
    } else {
        DocumentStatus::Failed
    };
    record_status(&state.db, document_id, status).await;

    result
}

async fn derive_from_text(
    state: &AppState,
    document_id: i64,
    property_id: i64,
    text: &str,
    request_id: Option<&str>,
) -> ApiResult<(usize, usize)> {
    sqlx::query("UPDATE documents SET extracted_text = $1 WHERE id = $2")
        .bind(text)
        .bind(document_id)
        .execute(&state.db)
        .await?;

    let chunks = chunk_text(text);
    let embeddings = if chunks.is_empty() {
        Vec::new()
    } else {
        state.llm.embed(&chunks, request_id).await.map_err(|e| {
            warn!(document_id, error = %e, "Embedding request failed");
            ApiError::upstream("Embedding request failed")
        })?
    };
    if embeddings.len() != chunks.len() {
        return Err(ApiError::upstream("Embedding request failed"));
    }
    replace_chunks(&state.db, document_id, &chunks, embeddings).await?;

    let items =
        timeline::extract_timeline(state.llm.as_ref(), &state.settings, text, request_id).await?;
    let stored = timeline::replace_items(&state.db, document_id, property_id, &items).await?;

    info!(
        document_id,
        chunks = chunks.len(),
        timeline_items = stored,
        "Document indexed"
    );
    Ok((chunks.len(), stored))
}

async fn record_status(db: &PgPool, document_id: i64, status: DocumentStatus) {
    let result = sqlx::query("UPDATE documents SET status = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(document_id)
        .execute(db)
        .await;
    if let Err(e) = result {
        warn!(document_id, error = %e, "Failed to update document status");
    }
}

/// Swap a document's chunks in one transaction.
async fn replace_chunks(
    db: &PgPool,
    document_id: i64,
    chunks: &[String],
    embeddings: Vec<Vec<f32>>,
) -> ApiResult<()> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    let rows: Vec<(String, &String, Vec<f32>)> = chunks
        .iter()
        .zip(embeddings)
        .enumerate()
        .map(|(i, (text, embedding))| (format!("{document_id}-{i}"), text, embedding))
        .collect();

    for batch in rows.chunks(CHUNK_INSERT_BATCH) {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO chunks (document_id, chunk_id, text, embedding) ",
        );
        builder.push_values(batch, |mut b, (chunk_id, text, embedding)| {
            b.push_bind(document_id)
                .push_bind(chunk_id.clone())
                .push_bind((*text).clone())
                .push_bind(embedding.clone());
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::services::llm::fake::FakeLlm;
    use std::io::Write;
    use std::sync::Arc;

    /// One-page PDF showing `text` in Helvetica
    pub(crate) fn minimal_pdf(text: &str) -> Vec<u8> {
        let stream = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET");
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
                .to_string(),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
                .to_string(),
            format!("<< /Length {} >>\nstream\n{stream}\nendstream", stream.len()),
        ];

        let mut pdf = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::with_capacity(objects.len());
        for (i, body) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
        }
        let xref_at = pdf.len();
        let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
        for offset in offsets {
            xref.push_str(&format!("{offset:010} 00000 n \n"));
        }
        xref.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        ));
        pdf.extend_from_slice(xref.as_bytes());
        pdf
    }

    pub(crate) fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                if name.ends_with('/') {
                    writer.add_directory(*name, options).unwrap();
                } else {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(data).unwrap();
                }
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn sanitize_keeps_basename_and_safe_chars() {
        assert_eq!(
            sanitize_filename("../../etc/Abrechnung 2024 (final).pdf").unwrap(),
            "Abrechnung_2024_final_.pdf"
        );
        assert_eq!(sanitize_filename("C:\\Users\\x\\plan.pdf").unwrap(), "plan.pdf");
        assert_eq!(sanitize_filename("Wirtschaftsplan_ä.pdf").unwrap(), "Wirtschaftsplan__.pdf");
        assert_eq!(sanitize_filename("..hidden.pdf").unwrap(), "hidden.pdf");
    }

    #[test]
    fn sanitize_rejects_names_without_safe_chars() {
        for name in ["", "   ", "../", "äöü", "..."] {
            let err = sanitize_filename(name).unwrap_err();
            assert_eq!(err.public_message(), "Invalid filename", "input {name:?}");
        }
    }

    #[test]
    fn upload_kind_by_extension() {
        assert_eq!(upload_kind("a.PDF").unwrap(), UploadKind::Pdf);
        assert_eq!(upload_kind("bundle.zip").unwrap(), UploadKind::Zip);
        let err = upload_kind("notes.txt").unwrap_err();
        assert_eq!(err.public_message(), "Only PDF or ZIP files are supported");
    }

    #[test]
    fn pdf_signature_and_size_are_checked() {
        let err = validate_pdf(b"not-a-real-pdf", 1024).unwrap_err();
        assert_eq!(err.public_message(), "Uploaded file is not a valid PDF");

        let err = validate_pdf(b"%PDF-1.7 0123456789", 8).unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));

        validate_pdf(b"%PDF-1.7", 1024).unwrap();
    }

    #[test]
    fn unique_filename_appends_counter() {
        let mut taken = HashSet::new();
        assert_eq!(unique_filename("plan.pdf", &taken), "plan.pdf");
        taken.insert("plan.pdf".to_string());
        assert_eq!(unique_filename("plan.pdf", &taken), "plan_2.pdf");
        taken.insert("plan_2.pdf".to_string());
        assert_eq!(unique_filename("plan.pdf", &taken), "plan_3.pdf");
        taken.insert("README".to_string());
        assert_eq!(unique_filename("README", &taken), "README_2");
    }

    #[test]
    fn invalid_zip_is_rejected() {
        let err = read_pdf_archive(b"not-a-real-zip").unwrap_err();
        assert_eq!(err.public_message(), "Uploaded ZIP file is invalid");
    }

    #[test]
    fn zip_without_pdfs_is_rejected() {
        let archive = zip_of(&[("notes.txt", b"hello".as_slice()), ("docs/", b"".as_slice())]);
        let err = read_pdf_archive(&archive).unwrap_err();
        assert_eq!(err.public_message(), "ZIP contains no PDF files");
    }

    #[test]
    fn zip_with_too_many_pdfs_is_rejected() {
        let names: Vec<String> = (0..=MAX_ZIP_PDF_FILES).map(|i| format!("{i}.pdf")).collect();
        let entries: Vec<(&str, &[u8])> =
            names.iter().map(|n| (n.as_str(), b"%PDF-1.4".as_slice())).collect();
        let err = read_pdf_archive(&zip_of(&entries)).unwrap_err();
        assert_eq!(err.public_message(), "ZIP contains too many PDFs (max 100)");
    }

    #[test]
    fn zip_pdf_entries_are_read_in_order() {
        let archive = zip_of(&[
            ("a/Protokoll.pdf", b"%PDF-1.4 one".as_slice()),
            ("readme.md", b"skip".as_slice()),
            ("B.PDF", b"%PDF-1.4 two".as_slice()),
        ]);
        let entries = read_pdf_archive(&archive).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a/Protokoll.pdf");
        assert_eq!(entries[0].content.as_deref().unwrap(), b"%PDF-1.4 one");
        assert_eq!(entries[1].name, "B.PDF");
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text(" \n\n\t ").is_empty());
    }

    #[test]
    fn short_text_is_one_normalized_chunk() {
        let chunks = chunk_text("Hausgeld   fällig\r\n\r\n\r\n\r\nam 01.03.2025  ");
        assert_eq!(chunks, vec!["Hausgeld fällig\n\nam 01.03.2025".to_string()]);
    }

    #[test]
    fn long_text_is_split_with_overlap_and_bounded() {
        let sentence = "Die Eigentümerversammlung findet am 12.05.2025 statt. ";
        let text = sentence.repeat(100);
        let chunks = chunk_text(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= CHUNK_CHARS);
        }
        // consecutive chunks share text
        let tail: String = chunks[0]
            .chars()
            .rev()
            .take(50)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        assert!(chunks[1].contains(tail.trim()));
    }

    #[test]
    fn chunks_break_on_paragraphs_when_possible() {
        let first = "a".repeat(800);
        let second = "b".repeat(800);
        let chunks = chunk_text(&format!("{first}\n\n{second}"));
        assert_eq!(chunks[0], first);
        assert!(chunks.last().unwrap().ends_with(&second));
    }

    fn state_with(pool: PgPool, settings: Settings, llm: &Arc<FakeLlm>) -> Arc<AppState> {
        AppState::for_tests(pool, settings, llm.clone())
    }

    async fn chunk_rows(pool: &PgPool, document_id: i64) -> sqlx::Result<Vec<(String, String)>> {
        sqlx::query_as("SELECT chunk_id, text FROM chunks WHERE document_id = $1 ORDER BY id")
            .bind(document_id)
            .fetch_all(pool)
            .await
    }

    async fn status_of(pool: &PgPool, document_id: i64) -> sqlx::Result<String> {
        sqlx::query_scalar("SELECT status FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_one(pool)
            .await
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn reindexing_replaces_chunks_and_items(pool: PgPool) -> anyhow::Result<()> {
        let llm = Arc::new(
            FakeLlm::new()
                .with_completion(r#"{"items":[]}"#)
                .with_completion(r#"{"items":[]}"#),
        );
        let state = state_with(pool.clone(), Settings::for_tests(), &llm);

        let text = "Hausgeld Zahlung bis 15.03.2025";
        let counts = index_text(&state, 100, 10, text, Some("rid-1")).await?;
        assert_eq!(counts, (1, 0));
        assert_eq!(
            chunk_rows(&pool, 100).await?,
            vec![("100-0".to_string(), text.to_string())]
        );

        let long = "Die Versammlung beschliesst den Wirtschaftsplan. ".repeat(60);
        let (chunks, _) = index_text(&state, 100, 10, &long, None).await?;
        assert!(chunks > 1);
        let rows = chunk_rows(&pool, 100).await?;
        assert_eq!(rows.len(), chunks);
        let ids: Vec<String> = rows.into_iter().map(|(id, _)| id).collect();
        let expected: Vec<String> = (0..chunks).map(|i| format!("100-{i}")).collect();
        assert_eq!(ids, expected);

        let (items,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM timeline_items WHERE document_id = 100")
                .fetch_one(&pool)
                .await?;
        assert_eq!(items, 0);
        assert_eq!(status_of(&pool, 100).await?, "indexed");
        assert_eq!(
            llm.embed_calls.lock().as_slice(),
            &[Some("rid-1".to_string()), None]
        );
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn failed_chunk_insert_keeps_old_chunks(pool: PgPool) -> anyhow::Result<()> {
        let chunks = vec!["neu".to_string(), "kaputt\0".to_string()];
        let err = replace_chunks(&pool, 100, &chunks, vec![vec![1.0, 0.0], vec![0.0, 1.0]])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Database(_)));

        let rows = chunk_rows(&pool, 100).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "100-0");
        assert!(rows[0].1.starts_with("Die nächste Versammlung"));
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn embedding_failure_marks_document_failed(pool: PgPool) -> anyhow::Result<()> {
        let llm = Arc::new(FakeLlm::new().failing_embeddings());
        let state = state_with(pool.clone(), Settings::for_tests(), &llm);

        let err = index_text(&state, 100, 10, "Hausgeld Zahlung", Some("rid-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
        assert_eq!(err.public_message(), "Embedding request failed");
        assert_eq!(status_of(&pool, 100).await?, "failed");
        assert_eq!(llm.embed_calls.lock().as_slice(), &[Some("rid-2".to_string())]);
        assert_eq!(chunk_rows(&pool, 100).await?.len(), 1);
        assert!(llm.requests.lock().is_empty());
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn blank_text_indexes_without_model_calls(pool: PgPool) -> anyhow::Result<()> {
        let llm = Arc::new(FakeLlm::new().failing_embeddings());
        let state = state_with(pool.clone(), Settings::for_tests(), &llm);

        let counts = index_text(&state, 101, 10, " \n ", None).await?;
        assert_eq!(counts, (0, 0));
        assert_eq!(status_of(&pool, 101).await?, "indexed");
        assert!(llm.embed_calls.lock().is_empty());
        assert!(llm.requests.lock().is_empty());
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn full_property_rejects_uploads(pool: PgPool) -> anyhow::Result<()> {
        let mut settings = Settings::for_tests();
        settings.free_tier_max_documents_per_property = 3;
        let state = state_with(pool.clone(), settings, &Arc::new(FakeLlm::new()));

        let err = ingest_pdf(&state, 10, "Neu.pdf", minimal_pdf("Hausgeld"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert_eq!(
            err.public_message(),
            "Document limit reached for this property (max 3)"
        );

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE property_id = 10")
                .fetch_one(&pool)
                .await?;
        assert_eq!(count, 3);
        Ok(())
    }

    #[sqlx::test(
        migrator = "crate::db::MIGRATOR",
        fixtures(path = "../../fixtures", scripts("owners", "documents"))
    )]
    async fn taken_filenames_get_numbered(pool: PgPool) -> anyhow::Result<()> {
        let state = state_with(pool.clone(), Settings::for_tests(), &Arc::new(FakeLlm::new()));

        for expected in ["Protokoll_ETV_2.pdf", "Protokoll_ETV_3.pdf"] {
            let err = ingest_pdf(&state, 10, "Protokoll ETV.pdf", b"%PDF-1.4 broken".to_vec(), None)
                .await
                .unwrap_err();
            assert_eq!(err.public_message(), "PDF text could not be extracted");

            let (status,): (String,) = sqlx::query_as(
                "SELECT status FROM documents WHERE property_id = 10 AND filename = $1",
            )
            .bind(expected)
            .fetch_one(&pool)
            .await?;
            assert_eq!(status, "failed");
        }

        // the same name in another property is free
        let llm = Arc::new(FakeLlm::new().with_completion(r#"{"items":[]}"#));
        let state = state_with(pool.clone(), Settings::for_tests(), &llm);
        let doc = ingest_pdf(&state, 20, "Protokoll ETV.pdf", minimal_pdf("Hausgeld 2025"), None).await?;
        assert_eq!(doc.filename, "Protokoll_ETV.pdf");
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(doc.chunks_indexed, 1);
        Ok(())
    }
}
