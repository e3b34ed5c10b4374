//! Reading notes.
//!
//! Notes are either created directly by the user or extracted from a
//! conversation turn by the generation capability. Extraction copies the
//! message's content and scope at extraction time; a note never links back
//! to live conversation state and is deletable on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::capability::{GenerationRequest, TextGenerator};
use crate::config::NotesConfig;
use crate::error::Result;
use crate::session::Message;
use crate::storage::SqliteStore;

/// What a note captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Highlight,
    Comment,
    Vocabulary,
    Summary,
}

impl NoteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::Highlight => "highlight",
            NoteKind::Comment => "comment",
            NoteKind::Vocabulary => "vocabulary",
            NoteKind::Summary => "summary",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "highlight" => Some(NoteKind::Highlight),
            "comment" => Some(NoteKind::Comment),
            "vocabulary" => Some(NoteKind::Vocabulary),
            "summary" => Some(NoteKind::Summary),
            _ => None,
        }
    }
}

/// One stored note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// Stable id (`note-` prefixed UUID).
    pub id: String,
    pub session_id: String,
    pub book_id: String,
    pub kind: NoteKind,
    pub content: String,
    /// Surrounding text the note was taken from, when available.
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Note {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        book_id: impl Into<String>,
        kind: NoteKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("note-{}", Uuid::new_v4()),
            session_id: session_id.into(),
            book_id: book_id.into(),
            kind,
            content: content.into(),
            context: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Note storage plus generation-backed extraction.
pub struct NotesService {
    store: Arc<SqliteStore>,
    config: NotesConfig,
}

impl NotesService {
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, config: NotesConfig) -> Self {
        Self { store, config }
    }

    /// Store a user-authored note.
    pub fn add_note(
        &self,
        session_id: &str,
        book_id: &str,
        kind: NoteKind,
        content: &str,
        context: Option<String>,
        tags: Vec<String>,
    ) -> Result<Note> {
        let mut note = Note::new(session_id, book_id, kind, content);
        note.context = context;
        note.tags = tags;
        self.store.save_note(&note)?;
        Ok(note)
    }

    /// Extract notes of `kind` from a conversation turn.
    ///
    /// The generation capability is asked for a list; numbered and
    /// dash-prefixed lines are parsed out, blanks and fragments shorter
    /// than the configured minimum dropped, and each surviving line stored
    /// as a note scoped to the message's session and book.
    ///
    /// # Errors
    ///
    /// Generation and persistence failures propagate; nothing is stored on
    /// failure.
    pub async fn extract_notes(
        &self,
        message: &Message,
        book_id: &str,
        kind: NoteKind,
        generator: &Arc<dyn TextGenerator>,
    ) -> Result<Vec<Note>> {
        let request = GenerationRequest::new(format!(
            "{}\n\n{}",
            extraction_instruction(kind),
            message.content
        ))
        .with_max_tokens(self.config.extraction_max_tokens)
        .with_temperature(self.config.extraction_temperature);
        let response = generator.generate(&request).await?;

        let lines = parse_note_lines(&response, self.config.min_line_chars);
        debug!(
            "extracted {} {} notes from message {}",
            lines.len(),
            kind.as_str(),
            message.id
        );
        let mut notes = Vec::with_capacity(lines.len());
        for line in lines {
            let mut note = Note::new(&message.session_id, book_id, kind, line);
            note.context = Some(message.content.clone());
            self.store.save_note(&note)?;
            notes.push(note);
        }
        Ok(notes)
    }

    /// Notes for a book, newest first, optionally filtered by kind.
    pub fn notes_for_book(&self, book_id: &str, kind: Option<NoteKind>) -> Result<Vec<Note>> {
        self.store.notes_for_book(book_id, kind)
    }

    /// Remove one note. Returns whether a note was actually deleted.
    pub fn delete_note(&self, note_id: &str) -> Result<bool> {
        self.store.delete_note(note_id)
    }
}

fn extraction_instruction(kind: NoteKind) -> &'static str {
    match kind {
        NoteKind::Highlight => {
            "Extract the most memorable passages or phrases from this exchange as a short list:"
        }
        NoteKind::Comment => {
            "Extract 3-5 key insights or notable points from this exchange as a short list:"
        }
        NoteKind::Vocabulary => {
            "List notable or difficult words from this exchange with a brief gloss, one per line:"
        }
        NoteKind::Summary => "Summarize the main points of this exchange as a short list:",
    }
}

/// Pull list items out of a generated response: `1.`/`1)` numbering and
/// `-`/`*`/`•` bullets are stripped, blank and too-short lines dropped.
fn parse_note_lines(response: &str, min_chars: usize) -> Vec<String> {
    response
        .lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty() && line.chars().count() >= min_chars)
        .map(str::to_owned)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        return rest.trim_start();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line
}
