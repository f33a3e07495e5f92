//! File classification and text extraction.
//!
//! Tabular files are not parsed here; their bytes go to the external
//! dataframe service. Everything else is reduced to cleaned plain text, with
//! a lossy raw-byte decode as the fallback when a format parser fails —
//! ingestion must not hard-fail on a bad parse.

/// Extension-based classification of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// csv / xlsx / xls — loaded by the tabular service.
    Tabular,
    Pdf,
    /// txt and anything unrecognized.
    Text,
}

pub fn classify(filename: &str) -> FileKind {
    let ext = filename
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" | "xlsx" | "xls" => FileKind::Tabular,
        "pdf" => FileKind::Pdf,
        _ => FileKind::Text,
    }
}

/// Extracts plain text from raw bytes. Never errors: parser failures fall
/// back to a lossy UTF-8 decode of the raw bytes.
pub fn extract_text(bytes: &[u8], kind: FileKind) -> String {
    let raw = match kind {
        FileKind::Pdf => match pdf_extract::extract_text_from_mem(bytes) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "PDF extraction failed, falling back to raw decode");
                String::from_utf8_lossy(bytes).into_owned()
            }
        },
        FileKind::Text | FileKind::Tabular => String::from_utf8_lossy(bytes).into_owned(),
    };
    clean_whitespace(&raw)
}

/// Collapses runs of spaces/tabs, limits blank runs to one empty line, and
/// trims the ends.
pub fn clean_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        let mut compact = String::with_capacity(line.len());
        let mut last_space = false;
        for ch in line.chars() {
            if ch == ' ' || ch == '\t' {
                if !last_space {
                    compact.push(' ');
                }
                last_space = true;
            } else {
                compact.push(ch);
                last_space = false;
            }
        }
        let trimmed = compact.trim();

        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }

        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(trimmed);
    }

    out.trim().to_string()
}
