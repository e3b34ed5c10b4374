//! Conversation sessions and bounded history.
//!
//! One session is active at a time. Every appended turn is persisted
//! immediately (last-wins by session id), so the durable history never lags
//! the live object. Prompt assembly works from a bounded projection of the
//! most recent turns; trimming for a prompt never mutates what is stored.
//!
//! Closing a session generates a short summary through the generation
//! capability when one is available, and degrades to an empty summary
//! (logged, not raised) when it is not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{GenerationRequest, TextGenerator};
use crate::config::ConversationConfig;
use crate::error::{Result, TomeError};
use crate::storage::SqliteStore;

/// Instruction prefixed to the transcript when summarizing a session.
pub(crate) const SUMMARY_INSTRUCTION: &str =
    "Summarize this conversation about the book in 2-3 sentences:";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Stable id (`msg-` prefixed UUID).
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Chunk ids the assistant drew on (empty for user turns).
    #[serde(default)]
    pub chunk_refs: Vec<String>,
}

/// One conversation about one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSession {
    /// Stable id (`session-` prefixed UUID).
    pub id: String,
    pub book_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Generated at close; empty string when generation was unavailable.
    pub summary: Option<String>,
    pub messages: Vec<Message>,
}

impl ConversationSession {
    #[must_use]
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            book_id: book_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            summary: None,
            messages: Vec::new(),
        }
    }

    /// Append a turn, returning a clone of the stored message.
    pub fn append(&mut self, role: Role, content: impl Into<String>, chunk_refs: Vec<String>) -> Message {
        let message = Message {
            id: format!("msg-{}", Uuid::new_v4()),
            session_id: self.id.clone(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            chunk_refs,
        };
        self.messages.push(message.clone());
        message
    }

    /// The most recent `n` messages, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// `role: content` lines for summarization and note extraction.
    #[must_use]
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Owns the active session and its persistence.
pub struct ConversationState {
    store: Arc<SqliteStore>,
    config: ConversationConfig,
    active: Mutex<Option<ConversationSession>>,
}

impl ConversationState {
    #[must_use]
    pub fn new(store: Arc<SqliteStore>, config: ConversationConfig) -> Self {
        Self {
            store,
            config,
            active: Mutex::new(None),
        }
    }

    /// Start a session for `book_id`, persisting it immediately.
    ///
    /// An already-active session is closed first without a summary; starting
    /// over is taken as abandoning the previous conversation.
    pub async fn start_session(&self, book_id: &str) -> Result<ConversationSession> {
        let mut active = self.active.lock().await;
        if let Some(mut previous) = active.take() {
            warn!("session {} abandoned by a new session", previous.id);
            previous.ended_at = Some(Utc::now());
            self.store.save_session(&previous)?;
        }
        let session = ConversationSession::new(book_id);
        self.store.save_session(&session)?;
        info!("session {} started for book {book_id}", session.id);
        *active = Some(session.clone());
        Ok(session)
    }

    /// Append a turn to the active session and persist the updated history.
    ///
    /// # Errors
    ///
    /// `NoActiveSession` when no session is open.
    pub async fn append_turn(
        &self,
        role: Role,
        content: &str,
        chunk_refs: Vec<String>,
    ) -> Result<Message> {
        let mut active = self.active.lock().await;
        let session = active.as_mut().ok_or(TomeError::NoActiveSession)?;
        let message = session.append(role, content, chunk_refs);
        self.store.save_session(session)?;
        Ok(message)
    }

    /// Book id and bounded history projection of the active session: the
    /// most recent `max_history_turns` messages, oldest first. Stored
    /// history is never touched.
    ///
    /// # Errors
    ///
    /// `NoActiveSession` when no session is open.
    pub async fn recent_history(&self) -> Result<(String, Vec<Message>)> {
        let active = self.active.lock().await;
        let session = active.as_ref().ok_or(TomeError::NoActiveSession)?;
        Ok((
            session.book_id.clone(),
            session.recent(self.config.max_history_turns).to_vec(),
        ))
    }

    /// Clone of the active session, if any.
    pub async fn active_session(&self) -> Option<ConversationSession> {
        self.active.lock().await.clone()
    }

    /// Book id of the active session, if any.
    pub async fn active_book(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.book_id.clone())
    }

    /// Close the active session, generating a summary when a generator is
    /// supplied. Summary failures degrade to an empty summary rather than
    /// failing the close.
    ///
    /// # Errors
    ///
    /// `NoActiveSession` when no session is open; persistence errors
    /// propagate.
    pub async fn end_session(
        &self,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> Result<ConversationSession> {
        let mut active = self.active.lock().await;
        let mut session = active.take().ok_or(TomeError::NoActiveSession)?;
        session.ended_at = Some(Utc::now());
        session.summary = Some(self.summarize(&session, generator).await);
        self.store.save_session(&session)?;
        info!("session {} closed", session.id);
        Ok(session)
    }

    /// Drop the active session without persisting, used when its book is
    /// being deleted and the row will cascade away.
    pub async fn detach_book(&self, book_id: &str) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|s| s.book_id == book_id) {
            debug!("active session detached, book {book_id} is being deleted");
            *active = None;
        }
    }

    async fn summarize(
        &self,
        session: &ConversationSession,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> String {
        if session.messages.is_empty() {
            return String::new();
        }
        let Some(generator) = generator else {
            warn!(
                "session {} closing without a ready generator, summary left empty",
                session.id
            );
            return String::new();
        };
        let request =
            GenerationRequest::new(format!("{SUMMARY_INSTRUCTION}\n\n{}", session.transcript()))
                .with_max_tokens(self.config.summary_max_tokens)
                .with_temperature(self.config.summary_temperature);
        match generator.generate(&request).await {
            Ok(summary) => summary.trim().to_owned(),
            Err(e) => {
                warn!("summary generation failed for session {}: {e}", session.id);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use async_trait::async_trait;

    struct CannedGenerator(&'static str);

    #[async_trait]
    impl TextGenerator for CannedGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Ok(self.0.to_owned())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Err(TomeError::Capability("generator offline".into()))
        }
    }

    fn state() -> ConversationState {
        ConversationState::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            ConversationConfig::default(),
        )
    }

    fn seeded_state() -> ConversationState {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .save_book(&crate::book::Book::import("T", None, "text."))
            .unwrap();
        ConversationState::new(store, ConversationConfig::default())
    }

    async fn start_for_seeded_book(state: &ConversationState) -> ConversationSession {
        let book_id = {
            let books = state.store.list_books().unwrap();
            books[0].id.clone()
        };
        state.start_session(&book_id).await.unwrap()
    }

    #[tokio::test]
    async fn turns_require_an_active_session() {
        let state = state();
        let err = state
            .append_turn(Role::User, "hello", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TomeError::NoActiveSession));
        assert!(matches!(
            state.recent_history().await.unwrap_err(),
            TomeError::NoActiveSession
        ));
        assert!(matches!(
            state.end_session(None).await.unwrap_err(),
            TomeError::NoActiveSession
        ));
    }

    #[tokio::test]
    async fn history_projection_is_bounded_and_nondestructive() {
        let state = seeded_state();
        start_for_seeded_book(&state).await;
        for i in 0..6 {
            state
                .append_turn(Role::User, &format!("turn {i}"), Vec::new())
                .await
                .unwrap();
        }

        let (_, recent) = state.recent_history().await.unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, "turn 2");
        assert_eq!(recent[3].content, "turn 5");

        // The projection trims nothing from the stored session.
        let session = state.active_session().await.unwrap();
        assert_eq!(session.messages.len(), 6);
    }

    #[tokio::test]
    async fn end_session_summarizes_with_a_generator() {
        let state = seeded_state();
        start_for_seeded_book(&state).await;
        state
            .append_turn(Role::User, "who is Ishmael?", Vec::new())
            .await
            .unwrap();
        let closed = state
            .end_session(Some(Arc::new(CannedGenerator("A chat about Ishmael."))))
            .await
            .unwrap();
        assert_eq!(closed.summary.as_deref(), Some("A chat about Ishmael."));
        assert!(closed.ended_at.is_some());
        assert!(state.active_session().await.is_none());
    }

    #[tokio::test]
    async fn summary_degrades_to_empty_on_failure() {
        let state = seeded_state();
        start_for_seeded_book(&state).await;
        state
            .append_turn(Role::User, "hello", Vec::new())
            .await
            .unwrap();
        let closed = state
            .end_session(Some(Arc::new(FailingGenerator)))
            .await
            .unwrap();
        assert_eq!(closed.summary.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn empty_session_closes_with_empty_summary() {
        let state = seeded_state();
        start_for_seeded_book(&state).await;
        let closed = state.end_session(None).await.unwrap();
        assert_eq!(closed.summary.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn starting_over_abandons_the_previous_session() {
        let state = seeded_state();
        let first = start_for_seeded_book(&state).await;
        let second = start_for_seeded_book(&state).await;
        assert_ne!(first.id, second.id);

        let stored = state.store.get_session(&first.id).unwrap().unwrap();
        assert!(stored.ended_at.is_some());
        assert!(stored.summary.is_none());
    }

    #[test]
    fn transcript_renders_role_labels() {
        let mut session = ConversationSession::new("book-1");
        session.append(Role::User, "hi", Vec::new());
        session.append(Role::Assistant, "hello", Vec::new());
        assert_eq!(session.transcript(), "user: hi\nassistant: hello");
    }

    #[test]
    fn recent_handles_short_histories() {
        let mut session = ConversationSession::new("book-1");
        session.append(Role::User, "only", Vec::new());
        assert_eq!(session.recent(4).len(), 1);
        assert_eq!(session.recent(0).len(), 0);
    }
}
