//! Library maintenance CLI for tome.
//!
//! Storage-only commands for inspecting and pruning the local book library.
//! Ingestion and conversation need live models and run through the host
//! application, not this tool.

use std::sync::Arc;

use tome::config::TomeConfig;
use tome::download::HttpDownloader;
use tome::engine::RetrievalAugmentedEngine;
use tome::lifecycle::ModelLifecycleManager;
use tome::notes::NoteKind;
use tome::storage::SqliteStore;

const USAGE: &str = "\
Usage: tome <command>

Commands:
  books                    List books in the library
  sessions <book-id>       List conversation sessions for a book
  notes <book-id> [kind]   List notes for a book
                           (kind: highlight | comment | vocabulary | summary)
  delete <book-id>         Delete a book, its sessions, notes, and index files
  config                   Show the active configuration
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing goes to stderr so stdout stays clean for command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        usage_exit();
    };
    let config = load_config()?;

    match command {
        "books" => {
            let store = open_store(&config)?;
            list_books(&store)
        }
        "sessions" => {
            let Some(book_id) = args.get(1) else {
                usage_exit();
            };
            let store = open_store(&config)?;
            list_sessions(&store, book_id)
        }
        "notes" => {
            let Some(book_id) = args.get(1) else {
                usage_exit();
            };
            let kind = match args.get(2) {
                None => None,
                Some(s) => Some(
                    NoteKind::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown note kind: {s}"))?,
                ),
            };
            let store = open_store(&config)?;
            list_notes(&store, book_id, kind)
        }
        "delete" => {
            let Some(book_id) = args.get(1) else {
                usage_exit();
            };
            delete_book(config, book_id).await
        }
        "config" => {
            show_config(&config);
            Ok(())
        }
        _ => usage_exit(),
    }
}

fn usage_exit() -> ! {
    eprint!("{USAGE}");
    std::process::exit(2);
}

fn load_config() -> anyhow::Result<TomeConfig> {
    let path = TomeConfig::default_config_path();
    let config = if path.exists() {
        TomeConfig::from_file(&path)?
    } else {
        TomeConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn open_store(config: &TomeConfig) -> anyhow::Result<SqliteStore> {
    Ok(SqliteStore::open(
        &config.storage.data_dir.join("library.db"),
    )?)
}

fn list_books(store: &SqliteStore) -> anyhow::Result<()> {
    let books = store.list_books()?;
    if books.is_empty() {
        println!("library is empty");
        return Ok(());
    }
    for book in books {
        let author = book.author.as_deref().unwrap_or("unknown author");
        let chunks = store.chunk_count(&book.id)?;
        println!(
            "{}  {} by {author} ({} words, {chunks} chunks, added {})",
            book.id,
            book.title,
            book.word_count,
            book.added_at.format("%Y-%m-%d"),
        );
    }
    Ok(())
}

fn list_sessions(store: &SqliteStore, book_id: &str) -> anyhow::Result<()> {
    let sessions = store.sessions_for_book(book_id)?;
    if sessions.is_empty() {
        println!("no sessions for {book_id}");
        return Ok(());
    }
    for session in sessions {
        let state = if session.ended_at.is_some() {
            "closed"
        } else {
            "open"
        };
        println!(
            "{}  {}  {state}  {} messages",
            session.id,
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.messages.len(),
        );
        if let Some(summary) = session.summary.as_deref() {
            if !summary.is_empty() {
                println!("    {summary}");
            }
        }
    }
    Ok(())
}

fn list_notes(store: &SqliteStore, book_id: &str, kind: Option<NoteKind>) -> anyhow::Result<()> {
    let notes = store.notes_for_book(book_id, kind)?;
    if notes.is_empty() {
        println!("no notes for {book_id}");
        return Ok(());
    }
    for note in notes {
        println!(
            "{}  [{}]  {}",
            note.created_at.format("%Y-%m-%d"),
            note.kind.as_str(),
            note.content,
        );
    }
    Ok(())
}

async fn delete_book(config: TomeConfig, book_id: &str) -> anyhow::Result<()> {
    let store = Arc::new(open_store(&config)?);
    if store.get_book(book_id)?.is_none() {
        anyhow::bail!("unknown book: {book_id}");
    }
    let lifecycle = Arc::new(ModelLifecycleManager::new(
        &config.models.cache_dir,
        Arc::new(HttpDownloader::quiet()),
    ));
    let engine = RetrievalAugmentedEngine::new(config, Arc::clone(&store), lifecycle)?;
    engine.delete_book(book_id).await?;
    println!("deleted {book_id}");
    Ok(())
}

fn show_config(config: &TomeConfig) {
    println!("config file: {}", TomeConfig::default_config_path().display());
    println!("data dir:    {}", config.storage.data_dir.display());
    println!("model cache: {}", config.models.cache_dir.display());
    println!("embedding model:  {}", config.models.embedding_model);
    println!("generation model: {}", config.models.generation_model);
    println!(
        "voice models:     {} (stt), {} (tts)",
        config.voice.stt_model, config.voice.tts_model
    );
}
