//! Sentence-based text chunking for retrieval.
//!
//! Book text is normalized (whitespace collapsed), split into sentences, and
//! packed greedily into chunks of at most `max_chunk_size` characters.
//! Consecutive chunks share a word-aligned overlap of up to `overlap_size`
//! characters taken from the tail of the previous chunk, so a retrieval hit
//! near a boundary still carries its lead-in. A sentence longer than the
//! chunk budget becomes its own oversized chunk rather than being split
//! mid-sentence.
//!
//! Every chunk records its character span in the normalized text, and chunk
//! ids are deterministic (`{book_id}:{seq:05}`) so re-ingesting a book
//! yields identical ids.

use crate::config::ChunkingConfig;
use crate::error::Result;

/// One retrievable piece of a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Deterministic id, unique within the book.
    pub id: String,
    /// Book this chunk belongs to.
    pub book_id: String,
    /// Zero-based position within the book's chunk sequence.
    pub seq: u32,
    /// Chunk text, a contiguous slice of the normalized book text.
    pub text: String,
    /// Start of the chunk in the normalized text (character offset).
    pub char_start: usize,
    /// End of the chunk in the normalized text (exclusive character offset).
    pub char_end: usize,
}

impl TextChunk {
    /// Deterministic chunk id for a book position.
    #[must_use]
    pub fn id_for(book_id: &str, seq: u32) -> String {
        format!("{book_id}:{seq:05}")
    }
}

/// Splits normalized text into overlapping sentence-aligned chunks.
#[derive(Debug, Clone)]
pub struct TextChunker {
    max_chunk_size: usize,
    overlap_size: usize,
}

impl TextChunker {
    /// Chunker with validated sizes.
    ///
    /// # Errors
    ///
    /// Returns a config error when `max_chunk_size` is zero or the overlap
    /// is not strictly smaller than the chunk size.
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_chunk_size: config.max_chunk_size,
            overlap_size: config.overlap_size,
        })
    }

    /// Chunk `text` for `book_id`. Whitespace-only input yields no chunks.
    #[must_use]
    pub fn chunk(&self, book_id: &str, text: &str) -> Vec<TextChunk> {
        let normalized = normalize_whitespace(text);
        if normalized.is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = normalized.chars().collect();

        // Chunk spans as character ranges into the normalized text. The
        // current chunk is always contiguous: overlaps are suffixes of the
        // previous chunk and the next sentence follows one space later.
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (start, end) in sentence_spans(&chars) {
            let sentence_len = end - start;
            current = Some(match current {
                None => (start, end),
                Some((c_start, c_end)) => {
                    if (c_end - c_start) + sentence_len > self.max_chunk_size {
                        spans.push((c_start, c_end));
                        let kept = last_words_len(&chars[c_start..c_end], self.overlap_size);
                        if kept > 0 {
                            (c_end - kept, end)
                        } else {
                            (start, end)
                        }
                    } else {
                        (c_start, end)
                    }
                }
            });
        }
        if let Some(span) = current {
            spans.push(span);
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| {
                let seq = i as u32;
                TextChunk {
                    id: TextChunk::id_for(book_id, seq),
                    book_id: book_id.to_owned(),
                    seq,
                    text: chars[start..end].iter().collect(),
                    char_start: start,
                    char_end: end,
                }
            })
            .collect()
    }
}

/// Collapse all whitespace runs to single spaces and trim the ends.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Sentence ranges over normalized text, split after runs of `.`, `!`, `?`.
/// A trailing fragment without terminal punctuation is kept as a sentence.
fn sentence_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if is_terminator(chars[i]) {
            while i < chars.len() && is_terminator(chars[i]) {
                i += 1;
            }
            spans.push((start, i));
            while i < chars.len() && chars[i] == ' ' {
                i += 1;
            }
            start = i;
        } else {
            i += 1;
        }
    }
    if start < chars.len() {
        spans.push((start, chars.len()));
    }
    spans
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Character length of the longest whole-word suffix of `chars` that fits
/// in `max_chars`, counting the single spaces between words. Zero when even
/// the last word alone is too long.
fn last_words_len(chars: &[char], max_chars: usize) -> usize {
    let mut kept = 0;
    let mut word = 0;
    for &c in chars.iter().rev() {
        if c == ' ' {
            let candidate = if kept == 0 { word } else { kept + 1 + word };
            if candidate > max_chars {
                return kept;
            }
            kept = candidate;
            word = 0;
        } else {
            word += 1;
        }
    }
    let candidate = if kept == 0 { word } else { kept + 1 + word };
    if candidate > max_chars { kept } else { candidate }
}
