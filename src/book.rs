//! Book records.
//!
//! A book is created once on import and its content never changes
//! afterwards; deletion cascades through chunks, indices, sessions, and
//! notes at the storage layer. Import derives lightweight metadata from the
//! text so callers can show word/page counts without re-scanning.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Words per rendered page for the derived page count.
const WORDS_PER_PAGE: usize = 250;

/// One imported book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    /// Stable id (`book-` prefixed UUID).
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    /// BCP 47 language tag, defaulting to `en`.
    pub language: String,
    /// Full raw text as imported.
    pub text: String,
    pub word_count: usize,
    pub page_count: usize,
    pub added_at: DateTime<Utc>,
}

impl Book {
    /// Import a book, deriving word and page counts from the text.
    #[must_use]
    pub fn import(title: impl Into<String>, author: Option<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let word_count = text.split_whitespace().count();
        Self {
            id: format!("book-{}", Uuid::new_v4()),
            title: title.into(),
            author,
            language: "en".to_owned(),
            text,
            word_count,
            page_count: (word_count / WORDS_PER_PAGE).max(1),
            added_at: Utc::now(),
        }
    }

    /// Same as [`Book::import`] with an explicit language tag.
    #[must_use]
    pub fn import_with_language(
        title: impl Into<String>,
        author: Option<String>,
        text: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        let mut book = Self::import(title, author, text);
        book.language = language.into();
        book
    }
}
