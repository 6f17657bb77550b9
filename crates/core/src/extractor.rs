use crate::error::ExtractError;
use lopdf::Document;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
}

const TEXT_EXTENSIONS: [&str; 11] = [
    "txt", "md", "markdown", "json", "jsonl", "csv", "tsv", "log", "rst", "yaml", "yml",
];

const TEXT_MIME_TYPES: [&str; 5] = [
    "application/json",
    "application/x-ndjson",
    "application/yaml",
    "application/x-yaml",
    "application/csv",
];

/// Decide how to read a document from its declared MIME type, falling back to
/// the file extension when the type is missing or generic.
pub fn detect_kind(file_type: &str, file_name: &str) -> Option<DocumentKind> {
    let mime = file_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime == "application/pdf" {
        return Some(DocumentKind::Pdf);
    }
    if mime.starts_with("text/") || TEXT_MIME_TYPES.contains(&mime.as_str()) {
        return Some(DocumentKind::PlainText);
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())?;

    if extension == "pdf" {
        Some(DocumentKind::Pdf)
    } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        Some(DocumentKind::PlainText)
    } else {
        None
    }
}

pub fn extract_text(file_type: &str, file_name: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    match detect_kind(file_type, file_name) {
        Some(DocumentKind::PlainText) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Some(DocumentKind::Pdf) => extract_pdf_text(bytes),
        None => Err(ExtractError::UnsupportedType(format!(
            "{file_type} ({file_name})"
        ))),
    }
}

/// Page texts joined by a blank line, in page order. Pages without text are
/// skipped; a PDF with no text at all is an error.
fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let document =
        Document::load_mem(bytes).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| ExtractError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(text.trim_end().to_string());
        }
    }

    if pages.is_empty() {
        return Err(ExtractError::PdfParse(
            "pdf had no readable page text".to_string(),
        ));
    }

    Ok(pages.join("\n\n"))
}
