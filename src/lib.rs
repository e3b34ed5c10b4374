//! Tome: offline retrieval-augmented conversation engine for book readers.
//!
//! This crate lets a reader talk to an assistant about a book in their own
//! library, entirely on-device:
//! Book text → chunks → embeddings → vector index → retrieval → answer
//!
//! # Architecture
//!
//! The engine is assembled from independent components, each injectable for
//! testing:
//! - **Chunking**: sentence-based splitting with word-aligned overlap
//! - **Vector index**: per-book append-only index, persisted with a sidecar
//! - **Model lifecycle**: single-flight download/initialize/release with
//!   blended progress
//! - **Conversation**: per-book sessions with a bounded history projection
//!   and close-time summaries
//! - **Engine**: ingest and answer orchestration over storage, index, and
//!   models
//! - **Voice**: capture → transcribe → answer → synthesize → playback, with
//!   barge-in

pub mod audio;
pub mod book;
pub mod capability;
pub mod catalog;
pub mod chunker;
pub mod config;
pub mod dirs;
pub mod download;
pub mod engine;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod notes;
pub mod progress;
pub mod session;
pub mod storage;
pub mod voice;

pub use config::TomeConfig;
pub use engine::{Answer, RetrievalAugmentedEngine};
pub use error::{Result, TomeError};
pub use lifecycle::ModelLifecycleManager;
pub use progress::{ProgressCallback, ProgressUpdate};
pub use voice::{VoiceEvent, VoicePipeline, VoiceState};
