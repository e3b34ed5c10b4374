#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Durability checks for the SQLite library: rows written through one store
//! handle read back identically after dropping it and reopening the same
//! file, which stands in for an app restart.

use tome::book::Book;
use tome::chunker::TextChunk;
use tome::notes::{Note, NoteKind};
use tome::session::{ConversationSession, Role};
use tome::storage::{CURRENT_SCHEMA_VERSION, SqliteStore};

fn keeper_book() -> Book {
    Book::import(
        "Night Watch",
        Some("A. Keeper".to_owned()),
        "The lamp burned through the fog. Ships passed in silence.",
    )
}

#[test]
fn a_fresh_database_is_stamped_with_the_schema_version() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("library.db");

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.schema_version().unwrap(), Some(CURRENT_SCHEMA_VERSION));
    drop(store);

    // Reopening applies the schema again without disturbing the stamp.
    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.schema_version().unwrap(), Some(CURRENT_SCHEMA_VERSION));
}

#[test]
fn books_and_chunks_read_back_identically_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("library.db");

    let book = keeper_book();
    let first = TextChunk {
        id: TextChunk::id_for(&book.id, 0),
        book_id: book.id.clone(),
        seq: 0,
        text: "The lamp burned through the fog.".to_owned(),
        char_start: 0,
        char_end: 32,
    };
    let second = TextChunk {
        id: TextChunk::id_for(&book.id, 1),
        book_id: book.id.clone(),
        seq: 1,
        text: "Ships passed in silence.".to_owned(),
        char_start: 33,
        char_end: 57,
    };

    {
        let store = SqliteStore::open(&db).unwrap();
        store.save_book(&book).unwrap();
        // Saved out of order; reads come back ordered by seq.
        store.save_chunk(&second, None).unwrap();
        store.save_chunk(&first, Some(&[0.25, -1.5, 3.0])).unwrap();
    }

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.get_book(&book.id).unwrap(), Some(book.clone()));
    assert_eq!(
        store.chunks_for_book(&book.id).unwrap(),
        vec![first.clone(), second.clone()]
    );
    assert_eq!(store.chunk_count(&book.id).unwrap(), 2);
    assert_eq!(
        store.chunk_embedding(&first.id).unwrap(),
        Some(vec![0.25, -1.5, 3.0])
    );
    assert_eq!(store.chunk_embedding(&second.id).unwrap(), None);
}

#[test]
fn sessions_messages_and_notes_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("library.db");

    let book = keeper_book();
    let mut session = ConversationSession::new(book.id.clone());
    session.append(Role::User, "Who tends the lamp?", Vec::new());
    session.append(
        Role::Assistant,
        "The keeper does, every night.",
        vec![TextChunk::id_for(&book.id, 0)],
    );
    session.summary = Some("Talked about the keeper's routine.".to_owned());

    let mut highlight = Note::new(
        session.id.clone(),
        book.id.clone(),
        NoteKind::Highlight,
        "The lamp burned through the fog.",
    );
    highlight.context = Some("Opening line.".to_owned());
    highlight.tags = vec!["atmosphere".to_owned()];
    let aside = Note::new(
        session.id.clone(),
        book.id.clone(),
        NoteKind::Comment,
        "Check the ship schedule.",
    );

    {
        let store = SqliteStore::open(&db).unwrap();
        store.save_book(&book).unwrap();
        store.save_session(&session).unwrap();
        store.save_note(&highlight).unwrap();
        store.save_note(&aside).unwrap();
    }

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.get_session(&session.id).unwrap(), Some(session.clone()));
    assert_eq!(store.sessions_for_book(&book.id).unwrap(), vec![session]);

    let highlights = store
        .notes_for_book(&book.id, Some(NoteKind::Highlight))
        .unwrap();
    assert_eq!(highlights, vec![highlight.clone()]);
    assert_eq!(store.notes_for_book(&book.id, None).unwrap().len(), 2);

    assert!(store.delete_note(&aside.id).unwrap());
    assert!(!store.delete_note(&aside.id).unwrap());
    assert_eq!(
        store.notes_for_book(&book.id, None).unwrap(),
        vec![highlight]
    );
}
