//! Error types for the tome engine.

/// Top-level error type for the retrieval-augmented conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum TomeError {
    /// A required model capability has not reached the `ready` state.
    #[error("model not ready: {0}")]
    ModelNotReady(String),

    /// Model artifact download failed; any partial file has been removed.
    #[error("model download failed: {0}")]
    ModelDownloadFailed(String),

    /// Native model load/initialization failed; the artifact is kept.
    #[error("model initialization failed: {0}")]
    ModelInitFailed(String),

    /// An embedding's width does not match the index dimension.
    #[error("embedding dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Persisted index bytes and sidecar mapping disagree.
    #[error("vector index corrupt: {0}")]
    IndexCorrupt(String),

    /// A chunk id was added to the index twice.
    #[error("duplicate chunk: {0}")]
    DuplicateChunk(String),

    /// A session-scoped operation was called with no open session.
    #[error("no active conversation session")]
    NoActiveSession,

    /// Microphone access was not granted.
    #[error("recording permission denied")]
    RecordingPermissionDenied,

    /// Audio capture or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// A model capability call (transcribe/embed/generate/synthesize) failed.
    #[error("capability error: {0}")]
    Capability(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persistence layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for TomeError {
    fn from(e: rusqlite::Error) -> Self {
        TomeError::Storage(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TomeError>;
