//! Retrieval-augmented conversation engine.
//!
//! Ties the pieces together: books are chunked and embedded into a
//! per-book [`VectorIndex`], questions retrieve the closest chunks and are
//! answered by the generation model with the retrieved passages and recent
//! conversation history in the prompt. Indexes are persisted next to the
//! database and restored lazily on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::book::Book;
use crate::capability::{GenerationRequest, TextEmbedder, TextGenerator};
use crate::chunker::TextChunker;
use crate::config::TomeConfig;
use crate::error::{Result, TomeError};
use crate::index::VectorIndex;
use crate::lifecycle::ModelLifecycleManager;
use crate::notes::{Note, NoteKind, NotesService};
use crate::progress::ProgressCallback;
use crate::session::{ConversationSession, ConversationState, Message, Role};
use crate::storage::{IndexMeta, SqliteStore};

/// Ingestion progress callback: `(chunks_done, chunks_total)`, reported
/// after each chunk completes, so `chunks_done` runs from 1 to the total.
pub type IngestProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// System instruction for grounded answers.
const ANSWER_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that answers questions based on the given context.";

/// A generated answer and the chunk ids that were in its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Retrieval rank order, best match first.
    pub chunk_refs: Vec<String>,
}

/// Coordinates chunking, embedding, retrieval, and generation over the
/// shared store and model lifecycle.
pub struct RetrievalAugmentedEngine {
    config: TomeConfig,
    store: Arc<SqliteStore>,
    lifecycle: Arc<ModelLifecycleManager>,
    chunker: TextChunker,
    conversation: ConversationState,
    notes: NotesService,
    indices_dir: PathBuf,
    /// Loaded per-book indexes; each behind its own lock so ingestion of
    /// one book never blocks answers about another.
    indices: Mutex<HashMap<String, Arc<Mutex<VectorIndex>>>>,
    /// Serializes answer turns so history reads and appends stay paired.
    turn: Mutex<()>,
}

impl RetrievalAugmentedEngine {
    /// Build an engine over an open store and model lifecycle.
    ///
    /// # Errors
    ///
    /// Returns a config error when `config` fails validation.
    pub fn new(
        config: TomeConfig,
        store: Arc<SqliteStore>,
        lifecycle: Arc<ModelLifecycleManager>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = TextChunker::new(&config.chunking)?;
        let conversation = ConversationState::new(Arc::clone(&store), config.conversation.clone());
        let notes = NotesService::new(Arc::clone(&store), config.notes.clone());
        let indices_dir = config.storage.data_dir.join("indices");
        Ok(Self {
            config,
            store,
            lifecycle,
            chunker,
            conversation,
            notes,
            indices_dir,
            indices: Mutex::new(HashMap::new()),
            turn: Mutex::new(()),
        })
    }

    /// Ensure the embedding and generation models are ready, downloading
    /// and initializing them as needed. Holds a reference on each until
    /// [`Self::shutdown`].
    ///
    /// # Errors
    ///
    /// Download and initialization failures propagate.
    pub async fn prepare(&self, on_progress: Option<ProgressCallback>) -> Result<()> {
        self.lifecycle
            .ensure_ready(&self.config.models.embedding_model, on_progress.clone())
            .await?;
        self.lifecycle
            .ensure_ready(&self.config.models.generation_model, on_progress)
            .await?;
        Ok(())
    }

    /// Close any open session and release the engine's model references.
    ///
    /// # Errors
    ///
    /// Persistence errors from closing the session propagate.
    pub async fn shutdown(&self) -> Result<()> {
        if self.conversation.active_session().await.is_some() {
            let generator = self.peek_generator().await;
            self.conversation.end_session(generator).await?;
        }
        self.lifecycle
            .release(&self.config.models.generation_model)
            .await;
        self.lifecycle
            .release(&self.config.models.embedding_model)
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Import a book and index it: chunk, embed, and add every chunk in
    /// order, then persist the index.
    ///
    /// On a mid-pass failure the chunks embedded so far stay in the store
    /// and the in-memory index; [`Self::reindex_book`] resumes from there.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` when the embedding model is not ready (nothing is
    /// written in that case); embedding and persistence failures propagate.
    pub async fn ingest_book(
        &self,
        title: &str,
        author: Option<String>,
        text: &str,
        on_progress: Option<IngestProgress>,
    ) -> Result<Book> {
        self.embedder().await?;

        let book = Book::import(title, author, text);
        self.store.save_book(&book)?;
        info!(
            "imported \"{}\" as {} ({} words, {} pages)",
            book.title, book.id, book.word_count, book.page_count
        );
        self.index_book(&book, on_progress).await?;
        Ok(book)
    }

    /// Re-run chunking and indexing for a stored book, skipping chunks the
    /// index already holds and reusing stored embeddings where present.
    /// Returns the number of chunks newly added.
    ///
    /// # Errors
    ///
    /// Unknown book ids are a config error; embedding and persistence
    /// failures propagate.
    pub async fn reindex_book(
        &self,
        book_id: &str,
        on_progress: Option<IngestProgress>,
    ) -> Result<usize> {
        let book = self
            .store
            .get_book(book_id)?
            .ok_or_else(|| TomeError::Config(format!("unknown book: {book_id}")))?;
        self.index_book(&book, on_progress).await
    }

    async fn index_book(&self, book: &Book, on_progress: Option<IngestProgress>) -> Result<usize> {
        let embedder = self.embedder().await?;
        let chunks = self.chunker.chunk(&book.id, &book.text);
        if chunks.is_empty() {
            debug!("book {} has no indexable text", book.id);
            return Ok(0);
        }

        let handle = self.ingest_index(&book.id, embedder.dimension()).await?;
        let mut index = handle.lock().await;
        let total = chunks.len();
        let mut added = 0usize;
        for (done, chunk) in chunks.iter().enumerate() {
            if !index.contains(&chunk.id) {
                let vector = match self.store.chunk_embedding(&chunk.id)? {
                    Some(stored) if stored.len() == index.dimension() => stored,
                    _ => embedder.embed(&chunk.text).await?,
                };
                self.store.save_chunk(chunk, Some(&vector))?;
                index.add(&chunk.id, &vector)?;
                added += 1;
            }
            if let Some(report) = &on_progress {
                report(done + 1, total);
            }
        }

        if added > 0 {
            self.persist_index(&book.id, &index)?;
        }
        info!("indexed {added} of {total} chunks for {}", book.id);
        Ok(added)
    }

    // -----------------------------------------------------------------------
    // Answering
    // -----------------------------------------------------------------------

    /// Answer a question about the active session's book.
    ///
    /// Embeds the query, retrieves the closest chunks, and prompts the
    /// generation model with recent history and the retrieved passages.
    /// History is extended with the new turn pair only after generation
    /// succeeds.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` when either model is not ready (answering never
    /// triggers downloads), `NoActiveSession` without an open session,
    /// `IndexCorrupt` when the persisted index fails verification, and
    /// generation failures propagate.
    pub async fn answer(&self, query: &str) -> Result<Answer> {
        let _turn = self.turn.lock().await;
        let embedder = self.embedder().await?;
        let generator = self.generator().await?;
        let (book_id, history) = self.conversation.recent_history().await?;

        let query = query.trim();
        let query_vector = embedder.embed(query).await?;
        let hits = match self.query_index(&book_id).await? {
            Some(handle) => handle
                .lock()
                .await
                .search(&query_vector, self.config.retrieval.top_k)?,
            None => Vec::new(),
        };

        let mut passages = Vec::with_capacity(hits.len());
        for hit in &hits {
            match self.store.chunk_text(&hit.chunk_id)? {
                Some(text) => passages.push((hit.chunk_id.clone(), text)),
                None => warn!("indexed chunk {} has no stored text", hit.chunk_id),
            }
        }

        let (prompt, chunk_refs) = assemble_prompt(
            query,
            &history,
            &passages,
            self.config.generation.context_budget_chars,
        );
        debug!(
            "answering with {} of {} retrieved chunks in the prompt",
            chunk_refs.len(),
            passages.len()
        );

        let request = GenerationRequest::new(prompt)
            .with_system_prompt(ANSWER_SYSTEM_PROMPT)
            .with_max_tokens(self.config.generation.max_tokens)
            .with_temperature(self.config.generation.temperature)
            .with_top_p(self.config.generation.top_p);
        let text = generator.generate(&request).await?;

        self.conversation
            .append_turn(Role::User, query, Vec::new())
            .await?;
        self.conversation
            .append_turn(Role::Assistant, &text, chunk_refs.clone())
            .await?;
        Ok(Answer { text, chunk_refs })
    }

    // -----------------------------------------------------------------------
    // Sessions and notes
    // -----------------------------------------------------------------------

    /// Open a conversation session for a stored book.
    ///
    /// # Errors
    ///
    /// Unknown book ids are a config error.
    pub async fn start_session(&self, book_id: &str) -> Result<ConversationSession> {
        if self.store.get_book(book_id)?.is_none() {
            return Err(TomeError::Config(format!("unknown book: {book_id}")));
        }
        self.conversation.start_session(book_id).await
    }

    /// Close the active session, summarizing it when the generation model
    /// is ready.
    ///
    /// # Errors
    ///
    /// `NoActiveSession` without an open session.
    pub async fn end_session(&self) -> Result<ConversationSession> {
        let generator = self.peek_generator().await;
        self.conversation.end_session(generator).await
    }

    /// Extract notes of `kind` from a past message via the generation model.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` when the generation model is not ready; unknown
    /// sessions are a config error.
    pub async fn extract_notes(&self, message: &Message, kind: NoteKind) -> Result<Vec<Note>> {
        let generator = self.generator().await?;
        let Some(session) = self.store.get_session(&message.session_id)? else {
            return Err(TomeError::Config(format!(
                "unknown session: {}",
                message.session_id
            )));
        };
        self.notes
            .extract_notes(message, &session.book_id, kind, &generator)
            .await
    }

    /// Conversation state, for history inspection and manual note hooks.
    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Notes service, for manual notes and queries.
    pub fn notes(&self) -> &NotesService {
        &self.notes
    }

    // -----------------------------------------------------------------------
    // Library
    // -----------------------------------------------------------------------

    pub fn list_books(&self) -> Result<Vec<Book>> {
        self.store.list_books()
    }

    pub fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        self.store.get_book(book_id)
    }

    /// Delete a book with its chunks, sessions, notes, and index files.
    /// An active session for the book is dropped without summarizing.
    ///
    /// # Errors
    ///
    /// Database failures propagate; index file removal is best-effort.
    pub async fn delete_book(&self, book_id: &str) -> Result<()> {
        self.conversation.detach_book(book_id).await;
        self.indices.lock().await.remove(book_id);
        let paths = self.store.delete_book(book_id)?;
        for path in paths {
            remove_index_files(&path);
        }
        info!("deleted book {book_id}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn embedder(&self) -> Result<Arc<dyn TextEmbedder>> {
        let name = &self.config.models.embedding_model;
        self.lifecycle
            .capability(name)
            .await?
            .as_embedder()
            .ok_or_else(|| TomeError::Config(format!("model {name} cannot embed")))
    }

    async fn generator(&self) -> Result<Arc<dyn TextGenerator>> {
        let name = &self.config.models.generation_model;
        self.lifecycle
            .capability(name)
            .await?
            .as_generator()
            .ok_or_else(|| TomeError::Config(format!("model {name} cannot generate")))
    }

    /// Generator handle if the model happens to be ready, for paths that
    /// degrade gracefully without it.
    async fn peek_generator(&self) -> Option<Arc<dyn TextGenerator>> {
        self.lifecycle
            .capability(&self.config.models.generation_model)
            .await
            .ok()
            .and_then(|c| c.as_generator())
    }

    /// Index handle for ingestion: restore the latest persisted version,
    /// or start fresh when none exists or restoring fails (the pass
    /// re-embeds whatever the fresh index is missing).
    async fn ingest_index(
        &self,
        book_id: &str,
        dimension: usize,
    ) -> Result<Arc<Mutex<VectorIndex>>> {
        let mut indices = self.indices.lock().await;
        if let Some(handle) = indices.get(book_id) {
            return Ok(Arc::clone(handle));
        }
        let index = match self.store.latest_index_meta(book_id)? {
            Some(meta) => match VectorIndex::restore(&meta.path) {
                Ok(index) => {
                    debug!(
                        "restored index v{} for {book_id} ({} entries)",
                        meta.version,
                        index.len()
                    );
                    index
                }
                Err(e) => {
                    warn!("index v{} for {book_id} unusable, rebuilding: {e}", meta.version);
                    VectorIndex::new(dimension)?
                }
            },
            None => VectorIndex::new(dimension)?,
        };
        let handle = Arc::new(Mutex::new(index));
        indices.insert(book_id.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Index handle for answering: `None` when the book was never indexed;
    /// a persisted index that fails verification is an error here, not a
    /// silent empty result.
    async fn query_index(&self, book_id: &str) -> Result<Option<Arc<Mutex<VectorIndex>>>> {
        let mut indices = self.indices.lock().await;
        if let Some(handle) = indices.get(book_id) {
            return Ok(Some(Arc::clone(handle)));
        }
        let Some(meta) = self.store.latest_index_meta(book_id)? else {
            return Ok(None);
        };
        let index = VectorIndex::restore(&meta.path)?;
        debug!(
            "restored index v{} for {book_id} ({} entries)",
            meta.version,
            index.len()
        );
        let handle = Arc::new(Mutex::new(index));
        indices.insert(book_id.to_owned(), Arc::clone(&handle));
        Ok(Some(handle))
    }

    /// Write the index to a fresh version file, record it, and remove
    /// files of pruned versions.
    fn persist_index(&self, book_id: &str, index: &VectorIndex) -> Result<()> {
        let version = self
            .store
            .latest_index_meta(book_id)?
            .map_or(1, |meta| meta.version + 1);
        std::fs::create_dir_all(&self.indices_dir)?;
        let path = self.indices_dir.join(format!("{book_id}.v{version}.tvec"));
        index.persist(&path)?;

        let meta = IndexMeta {
            book_id: book_id.to_owned(),
            version,
            path,
            dimension: index.dimension(),
            entry_count: index.len(),
            created_at: Utc::now(),
        };
        let pruned = self.store.record_index_version(&meta)?;
        for stale in pruned {
            remove_index_files(&stale);
        }
        debug!(
            "persisted index v{version} for {book_id} ({} entries)",
            index.len()
        );
        Ok(())
    }
}

/// Assemble the generation prompt from recent history, retrieved passages
/// in rank order, and the query.
///
/// When the rendering exceeds `budget_chars`, oldest history turns are
/// dropped first, then lowest-ranked passages; the query is never dropped,
/// even when the result still exceeds the budget. Returns the prompt and
/// the chunk ids that stayed in it.
fn assemble_prompt(
    query: &str,
    history: &[Message],
    passages: &[(String, String)],
    budget_chars: usize,
) -> (String, Vec<String>) {
    let tail = format!("Question: {query}\n\nAnswer:");
    let mut kept_history = history;
    let mut kept_passages = passages.len();
    loop {
        let prompt = render_prompt(kept_history, &passages[..kept_passages], &tail);
        if prompt.chars().count() <= budget_chars
            || (kept_history.is_empty() && kept_passages == 0)
        {
            let chunk_refs = passages[..kept_passages]
                .iter()
                .map(|(id, _)| id.clone())
                .collect();
            return (prompt, chunk_refs);
        }
        if kept_history.is_empty() {
            kept_passages -= 1;
        } else {
            kept_history = &kept_history[1..];
        }
    }
}

fn render_prompt(history: &[Message], passages: &[(String, String)], tail: &str) -> String {
    let mut out = String::new();
    if !history.is_empty() {
        out.push_str("Previous conversation:\n");
        for message in history {
            out.push_str(speaker(message.role));
            out.push_str(": ");
            out.push_str(&message.content);
            out.push('\n');
        }
        out.push('\n');
    }
    if !passages.is_empty() {
        out.push_str("Context:\n");
        let total = passages.len();
        for (rank, (_, text)) in passages.iter().enumerate() {
            out.push_str(&format!("[CHUNK {}/{}] {text}\n\n", rank + 1, total));
        }
    }
    out.push_str(tail);
    out
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Best-effort removal of an index file and its sidecar.
fn remove_index_files(path: &Path) {
    for target in [path.to_path_buf(), crate::index::sidecar_path(path)] {
        if let Err(e) = std::fs::remove_file(&target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove stale index file {}: {e}", target.display());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
