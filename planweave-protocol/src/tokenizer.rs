//! Chunk-boundary-safe record tokenizer.
//!
//! Model output arrives in arbitrarily sized text chunks. Records are
//! delimited by [`RECORD_SEPARATOR`]; some upstream models drop the
//! separator and emit a blank line before the next JSON object instead,
//! which the tokenizer normalises before splitting. The sequence of
//! records produced is invariant under re-chunking of the same text.

/// Record delimiter on the wire: SYMBOL FOR RECORD SEPARATOR.
pub const RECORD_SEPARATOR: char = '\u{241E}';

/// The fallback boundary some models emit instead of the separator.
const BLANK_LINE_BOUNDARY: &str = "\n\n{";

/// Splits a chunked text stream into complete record strings.
///
/// Text after the last separator is buffered until a later chunk
/// completes it; [`RecordTokenizer::finish`] reports it as dropped if the
/// stream ends first.
#[derive(Debug, Default)]
pub struct RecordTokenizer {
    buffer: String,
}

impl RecordTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every record completed by it.
    ///
    /// Returned strings are trimmed and non-empty; empty segments between
    /// adjacent separators are discarded.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        // The blank-line boundary can straddle a chunk split, so the
        // whole unconsumed buffer is normalised each time. Replacement
        // removes the pattern, so this never rewrites the same text twice.
        if self.buffer.contains(BLANK_LINE_BOUNDARY) {
            self.buffer = self
                .buffer
                .replace(BLANK_LINE_BOUNDARY, "\u{241E}{");
        }

        let mut records = Vec::new();
        while let Some(idx) = self.buffer.find(RECORD_SEPARATOR) {
            let segment: String = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + RECORD_SEPARATOR.len_utf8());
            let trimmed = segment.trim();
            if !trimmed.is_empty() {
                records.push(trimmed.to_string());
            }
        }
        records
    }

    /// End of stream. Any unterminated trailing text is dropped, not
    /// emitted; it is returned so the caller can log it.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            tracing::warn!(
                dropped_len = trimmed.len(),
                "stream ended mid-record; dropping unterminated text"
            );
            Some(trimmed.to_string())
        }
    }

    /// Bytes currently buffered awaiting a separator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
