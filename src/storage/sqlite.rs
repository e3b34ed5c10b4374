//! SQLite-backed persistence for books, chunks, sessions, notes, and
//! vector index metadata.
//!
//! Thread-safe via an internal `Mutex<Connection>`. All writes are
//! serialized; reads can proceed concurrently with WAL mode on the SQLite
//! side, though we still acquire the mutex for simplicity. Writes are
//! last-wins keyed by record id; parent tables (books, sessions) use
//! upserts so a re-save never trips the `ON DELETE CASCADE` chains hanging
//! off them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::schema::{apply_schema, read_schema_version};
use super::{IndexMeta, KEPT_INDEX_VERSIONS};
use crate::book::Book;
use crate::chunker::TextChunk;
use crate::error::{Result, TomeError};
use crate::index::{bytes_to_vector, vector_to_bytes};
use crate::notes::{Note, NoteKind};
use crate::session::{ConversationSession, Message};

/// SQLite store shared across the engine's components.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_schema(&conn)?;
        debug!("opened store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral sessions.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version stamped into the database, if any.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    // -----------------------------------------------------------------------
    // Books
    // -----------------------------------------------------------------------

    /// Insert or update a book record (last-wins by id).
    pub fn save_book(&self, book: &Book) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO books (id, title, author, language, text, word_count, page_count, added_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
             title = excluded.title, author = excluded.author, language = excluded.language, \
             text = excluded.text, word_count = excluded.word_count, \
             page_count = excluded.page_count, added_at = excluded.added_at",
            params![
                book.id,
                book.title,
                book.author,
                book.language,
                book.text,
                db_int(book.word_count),
                db_int(book.page_count),
                book.added_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        let conn = self.lock()?;
        let book = conn
            .query_row(
                "SELECT id, title, author, language, text, word_count, page_count, added_at \
                 FROM books WHERE id = ?1",
                params![book_id],
                row_to_book,
            )
            .optional()?;
        Ok(book)
    }

    /// All books, oldest import first.
    pub fn list_books(&self) -> Result<Vec<Book>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, author, language, text, word_count, page_count, added_at \
             FROM books ORDER BY added_at, id",
        )?;
        let rows = stmt.query_map([], row_to_book)?;

        let mut books = Vec::new();
        for book in rows {
            books.push(book?);
        }
        Ok(books)
    }

    /// Delete a book; chunks, sessions, notes, and index metadata cascade.
    ///
    /// Returns the persisted index file paths that referenced the book so
    /// the caller can remove them from disk.
    pub fn delete_book(&self, book_id: &str) -> Result<Vec<PathBuf>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT path FROM index_meta WHERE book_id = ?1 ORDER BY version")?;
        let rows = stmt.query_map(params![book_id], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for path in rows {
            paths.push(PathBuf::from(path?));
        }
        drop(stmt);

        let deleted = conn.execute("DELETE FROM books WHERE id = ?1", params![book_id])?;
        debug!("deleted book {book_id} ({deleted} row)");
        Ok(paths)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Insert or replace one chunk record with its embedding, if computed.
    pub fn save_chunk(&self, chunk: &TextChunk, embedding: Option<&[f32]>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO chunks (id, book_id, seq, text, char_start, char_end, embedding) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.id,
                chunk.book_id,
                i64::from(chunk.seq),
                chunk.text,
                db_int(chunk.char_start),
                db_int(chunk.char_end),
                embedding.map(vector_to_bytes),
            ],
        )?;
        Ok(())
    }

    /// Chunk records for a book in sequence order (without embeddings).
    pub fn chunks_for_book(&self, book_id: &str) -> Result<Vec<TextChunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, book_id, seq, text, char_start, char_end \
             FROM chunks WHERE book_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![book_id], row_to_chunk)?;

        let mut chunks = Vec::new();
        for chunk in rows {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    pub fn chunk_text(&self, chunk_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let text = conn
            .query_row(
                "SELECT text FROM chunks WHERE id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }

    /// Stored embedding for a chunk, when one was computed.
    pub fn chunk_embedding(&self, chunk_id: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.lock()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT embedding FROM chunks WHERE id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten().as_deref().and_then(bytes_to_vector))
    }

    pub fn chunk_count(&self, book_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE book_id = ?1",
            params![book_id],
            |row| row.get(0),
        )?;
        Ok(usize_col(count))
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert or update a session with its full message history
    /// (last-wins by id).
    pub fn save_session(&self, session: &ConversationSession) -> Result<()> {
        let conn = self.lock()?;
        let messages = serde_json::to_string(&session.messages)?;
        conn.execute(
            "INSERT INTO sessions (id, book_id, started_at, ended_at, summary, messages) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET \
             book_id = excluded.book_id, started_at = excluded.started_at, \
             ended_at = excluded.ended_at, summary = excluded.summary, \
             messages = excluded.messages",
            params![
                session.id,
                session.book_id,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
                session.summary,
                messages,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        let conn = self.lock()?;
        let session = conn
            .query_row(
                "SELECT id, book_id, started_at, ended_at, summary, messages \
                 FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions for a book, most recently started first.
    pub fn sessions_for_book(&self, book_id: &str) -> Result<Vec<ConversationSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, book_id, started_at, ended_at, summary, messages \
             FROM sessions WHERE book_id = ?1 ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map(params![book_id], row_to_session)?;

        let mut sessions = Vec::new();
        for session in rows {
            sessions.push(session?);
        }
        Ok(sessions)
    }

    // -----------------------------------------------------------------------
    // Notes
    // -----------------------------------------------------------------------

    pub fn save_note(&self, note: &Note) -> Result<()> {
        let conn = self.lock()?;
        let tags = serde_json::to_string(&note.tags).unwrap_or_else(|_| "[]".to_owned());
        conn.execute(
            "INSERT OR REPLACE INTO notes \
             (id, session_id, book_id, kind, content, context, tags, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                note.id,
                note.session_id,
                note.book_id,
                note.kind.as_str(),
                note.content,
                note.context,
                tags,
                note.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Notes for a book, newest first, optionally filtered by kind.
    pub fn notes_for_book(&self, book_id: &str, kind: Option<NoteKind>) -> Result<Vec<Note>> {
        let conn = self.lock()?;
        let sql_all = "SELECT id, session_id, book_id, kind, content, context, tags, created_at \
                       FROM notes WHERE book_id = ?1 ORDER BY created_at DESC, id";
        let sql_kind = "SELECT id, session_id, book_id, kind, content, context, tags, created_at \
                        FROM notes WHERE book_id = ?1 AND kind = ?2 \
                        ORDER BY created_at DESC, id";

        let mut notes = Vec::new();
        match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(sql_kind)?;
                let rows = stmt.query_map(params![book_id, kind.as_str()], row_to_note)?;
                for note in rows {
                    notes.push(note?);
                }
            }
            None => {
                let mut stmt = conn.prepare(sql_all)?;
                let rows = stmt.query_map(params![book_id], row_to_note)?;
                for note in rows {
                    notes.push(note?);
                }
            }
        }
        Ok(notes)
    }

    /// Remove one note. Returns whether a row was deleted.
    pub fn delete_note(&self, note_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id])?;
        Ok(rows > 0)
    }

    // -----------------------------------------------------------------------
    // Index metadata
    // -----------------------------------------------------------------------

    /// Most recent index version for a book, if one was ever persisted.
    pub fn latest_index_meta(&self, book_id: &str) -> Result<Option<IndexMeta>> {
        let conn = self.lock()?;
        let meta = conn
            .query_row(
                "SELECT book_id, version, path, dimension, entry_count, created_at \
                 FROM index_meta WHERE book_id = ?1 ORDER BY version DESC LIMIT 1",
                params![book_id],
                row_to_index_meta,
            )
            .optional()?;
        Ok(meta)
    }

    /// Record a freshly persisted index version and prune old rows, keeping
    /// the [`KEPT_INDEX_VERSIONS`] most recent.
    ///
    /// Returns the file paths of the pruned versions so the caller can
    /// remove them from disk.
    pub fn record_index_version(&self, meta: &IndexMeta) -> Result<Vec<PathBuf>> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO index_meta \
             (book_id, version, path, dimension, entry_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meta.book_id,
                i64::from(meta.version),
                meta.path.to_string_lossy(),
                db_int(meta.dimension),
                db_int(meta.entry_count),
                meta.created_at.to_rfc3339(),
            ],
        )?;

        let mut stmt = conn.prepare(
            "SELECT version, path FROM index_meta WHERE book_id = ?1 \
             ORDER BY version DESC LIMIT -1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![meta.book_id, db_int(KEPT_INDEX_VERSIONS)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut stale = Vec::new();
        for row in rows {
            stale.push(row?);
        }
        drop(stmt);

        for (version, _path) in &stale {
            conn.execute(
                "DELETE FROM index_meta WHERE book_id = ?1 AND version = ?2",
                params![meta.book_id, version],
            )?;
            debug!("pruned index version {version} for book {}", meta.book_id);
        }

        Ok(stale.into_iter().map(|(_, path)| PathBuf::from(path)).collect())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Acquire the connection mutex.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TomeError::Storage(format!("connection lock poisoned: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    let added_at: String = row.get(7)?;
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        language: row.get(3)?,
        text: row.get(4)?,
        word_count: usize_col(row.get(5)?),
        page_count: usize_col(row.get(6)?),
        added_at: parse_ts(&added_at),
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<TextChunk> {
    Ok(TextChunk {
        id: row.get(0)?,
        book_id: row.get(1)?,
        seq: u32_col(row.get(2)?),
        text: row.get(3)?,
        char_start: usize_col(row.get(4)?),
        char_end: usize_col(row.get(5)?),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSession> {
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let messages_json: String = row.get(5)?;
    let messages: Vec<Message> = serde_json::from_str(&messages_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ConversationSession {
        id: row.get(0)?,
        book_id: row.get(1)?,
        started_at: parse_ts(&started_at),
        ended_at: ended_at.as_deref().map(parse_ts),
        summary: row.get(4)?,
        messages,
    })
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let kind: String = row.get(3)?;
    let tags_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(Note {
        id: row.get(0)?,
        session_id: row.get(1)?,
        book_id: row.get(2)?,
        kind: NoteKind::parse(&kind).unwrap_or(NoteKind::Comment),
        content: row.get(4)?,
        context: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_index_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexMeta> {
    let path: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(IndexMeta {
        book_id: row.get(0)?,
        version: u32_col(row.get(1)?),
        path: PathBuf::from(path),
        dimension: usize_col(row.get(3)?),
        entry_count: usize_col(row.get(4)?),
        created_at: parse_ts(&created_at),
    })
}

// ---------------------------------------------------------------------------
// Value conversions
// ---------------------------------------------------------------------------

fn db_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn usize_col(v: i64) -> usize {
    usize::try_from(v).unwrap_or_default()
}

fn u32_col(v: i64) -> u32 {
    u32::try_from(v).unwrap_or_default()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
