//! Input validation for lexrag
//! Checks queries, identifiers, and source paths before they enter the pipeline

use std::path::Path;
use thiserror::Error;

/// Maximum size for a chat query
pub const MAX_QUERY_BYTES: usize = 10_000;

/// Maximum length for KB identifiers
pub const MAX_KB_ID_LEN: usize = 64;

/// Maximum size for a source document (50MB)
pub const MAX_SOURCE_BYTES: u64 = 50 * 1024 * 1024;

/// Source file extensions the ingest engine accepts (non-OCR)
const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "md", "markdown", "txt"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Empty input not allowed")]
    EmptyInput,
    #[error("Input exceeds size limit: {size} bytes (max: {max} bytes)")]
    InputTooLarge { size: usize, max: usize },
    #[error("Source file exceeds size limit: {size} bytes (max: {max} bytes)")]
    SourceTooLarge { size: u64, max: u64 },
    #[error("Invalid KB id: {0}")]
    InvalidKbId(String),
    #[error("Source path not found: {0}")]
    SourceNotFound(String),
    #[error("Unsupported source type: {0}")]
    UnsupportedSourceType(String),
    #[error("Invalid top_k value: {0}")]
    InvalidTopK(i64),
}

/// Normalize a user-provided KB name into a valid slug id.
/// Lowercases, replaces spaces/underscores with hyphens, drops other
/// non-alphanumeric characters, and trims to the maximum length.
///
/// # Examples
/// ```
/// use lexrag::validation::normalize_kb_id;
/// assert_eq!(normalize_kb_id("UAE Rental Law"), "uae-rental-law");
/// assert_eq!(normalize_kb_id("Civil_Code"), "civil-code");
/// ```
pub fn normalize_kb_id(name: &str) -> String {
    let mut slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();

    slug.chars().take(MAX_KB_ID_LEN).collect()
}

/// Validate a KB id (already normalized)
pub fn validate_kb_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if id.len() > MAX_KB_ID_LEN {
        return Err(ValidationError::InvalidKbId(format!(
            "{} exceeds {} characters",
            id, MAX_KB_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ValidationError::InvalidKbId(id.to_string()));
    }
    Ok(())
}

/// Validate a chat or search query
pub fn validate_query(query: &str) -> Result<(), ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if query.len() > MAX_QUERY_BYTES {
        return Err(ValidationError::InputTooLarge {
            size: query.len(),
            max: MAX_QUERY_BYTES,
        });
    }
    Ok(())
}

/// Validate a top_k request value (0 is allowed: it disables the stage)
pub fn validate_top_k(value: i64) -> Result<usize, ValidationError> {
    if !(0..=1000).contains(&value) {
        return Err(ValidationError::InvalidTopK(value));
    }
    Ok(value as usize)
}

/// Validate a source path for ingest: must exist, be a supported type,
/// and stay under the size limit.
pub fn validate_source_path(path: &Path) -> Result<(), ValidationError> {
    if !path.exists() {
        return Err(ValidationError::SourceNotFound(
            path.display().to_string(),
        ));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ValidationError::UnsupportedSourceType(ext));
    }

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > MAX_SOURCE_BYTES {
            return Err(ValidationError::SourceTooLarge {
                size: meta.len(),
                max: MAX_SOURCE_BYTES,
            });
        }
    }

    Ok(())
}
