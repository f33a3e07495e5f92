//! Sliding-window text chunker.
//!
//! Splits cleaned document text into fixed-size character windows with a
//! fixed overlap (default 1000 chars with 200-char overlap, i.e. stride 800).
//! Windows are cut on `char` boundaries so multi-byte text is safe. Empty
//! text produces no chunks; a chunkless document is a valid state the router
//! must handle.

/// A window of extracted text, positioned by its ordinal index.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    pub position: i64,
    pub content: String,
}

/// Split `text` into overlapping windows of `chunk_chars` characters,
/// advancing by `chunk_chars - overlap_chars` each step. Positions are
/// contiguous starting at 0.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<TextWindow> {
    assert!(chunk_chars > 0);
    assert!(overlap_chars < chunk_chars);

    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let stride = chunk_chars - overlap_chars;
    let mut windows = Vec::new();
    let mut start = 0usize;
    let mut position: i64 = 0;

    while start < chars.len() {
        let end = (start + chunk_chars).min(chars.len());
        windows.push(TextWindow {
            position,
            content: chars[start..end].iter().collect(),
        });
        position += 1;

        if end == chars.len() {
            break;
        }
        start += stride;
    }

    windows
}
