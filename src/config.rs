//! Configuration types for the retrieval-augmented conversation engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomeConfig {
    /// Book text chunking settings.
    pub chunking: ChunkingConfig,
    /// Passage retrieval settings.
    pub retrieval: RetrievalConfig,
    /// Answer generation settings.
    pub generation: GenerationConfig,
    /// Conversation session settings.
    pub conversation: ConversationConfig,
    /// Note extraction settings.
    pub notes: NotesConfig,
    /// Voice pipeline settings.
    pub voice: VoiceConfig,
    /// Model management settings.
    pub models: ModelsConfig,
    /// Persistence settings.
    pub storage: StorageConfig,
}

/// Book text chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    ///
    /// A single sentence longer than this becomes its own oversized chunk.
    pub max_chunk_size: usize,
    /// Trailing overlap carried into the next chunk, in characters.
    ///
    /// Overlap is word-boundary-aligned and never splits a word, so the
    /// carried text may be shorter than this (down to empty when even the
    /// last word alone is too long).
    pub overlap_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            overlap_size: 50,
        }
    }
}

impl ChunkingConfig {
    /// Validate the chunking parameters.
    ///
    /// # Errors
    ///
    /// Returns a config error if `max_chunk_size` is zero or `overlap_size`
    /// is not strictly smaller than `max_chunk_size`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_chunk_size == 0 {
            return Err(crate::error::TomeError::Config(
                "max_chunk_size must be at least 1".into(),
            ));
        }
        if self.overlap_size >= self.max_chunk_size {
            return Err(crate::error::TomeError::Config(format!(
                "overlap_size ({}) must be smaller than max_chunk_size ({})",
                self.overlap_size, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// Passage retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of chunks retrieved per query.
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

/// Answer generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens generated per answer.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Prompt budget in characters.
    ///
    /// When the assembled prompt exceeds this, oldest history turns are
    /// dropped first, then lowest-ranked retrieved chunks; the query itself
    /// is never truncated.
    pub context_budget_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            context_budget_chars: 4096,
        }
    }
}

/// Conversation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Most recent turns included when assembling a prompt.
    ///
    /// A per-call projection only; persisted history is never trimmed.
    pub max_history_turns: usize,
    /// Maximum tokens for the close-time session summary.
    pub summary_max_tokens: u32,
    /// Sampling temperature for the session summary.
    pub summary_temperature: f32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 4,
            summary_max_tokens: 300,
            summary_temperature: 0.4,
        }
    }
}

/// Note extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotesConfig {
    /// Maximum tokens for a note-extraction response.
    pub extraction_max_tokens: u32,
    /// Sampling temperature for note extraction.
    pub extraction_temperature: f32,
    /// Extracted lines shorter than this are discarded as noise.
    pub min_line_chars: usize,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            extraction_max_tokens: 500,
            extraction_temperature: 0.3,
            min_line_chars: 3,
        }
    }
}

/// Voice pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Minimum buffered audio, in seconds, before a segment is handed to
    /// transcription.
    pub min_segment_secs: f32,
    /// Model name for speech-to-text.
    pub stt_model: String,
    /// Model name for speech synthesis.
    pub tts_model: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            min_segment_secs: 2.0,
            stt_model: "whisper-tiny".into(),
            tts_model: "en-us-amy".into(),
        }
    }
}

/// Model management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory for downloaded model artifacts.
    pub cache_dir: PathBuf,
    /// Model name for text embedding.
    pub embedding_model: String,
    /// Model name for answer generation.
    pub generation_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_dir: crate::dirs::models_dir(),
            embedding_model: "mistral-7b-instruct-q4".into(),
            generation_model: "mistral-7b-instruct-q4".into(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the library database and index files.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::dirs::data_dir(),
        }
    }
}

impl TomeConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::TomeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::TomeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::dirs::config_file()
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first config error found.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.chunking.validate()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TomeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.max_chunk_size, 512);
        assert_eq!(config.chunking.overlap_size, 50);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.generation.max_tokens, 512);
        assert_eq!(config.conversation.max_history_turns, 4);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let config = ChunkingConfig {
            max_chunk_size: 20,
            overlap_size: 20,
        };
        assert!(config.validate().is_err());

        let config = ChunkingConfig {
            max_chunk_size: 0,
            overlap_size: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = TomeConfig::default();
        config.chunking.max_chunk_size = 256;
        config.retrieval.top_k = 5;
        config.voice.stt_model = "whisper-base".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = TomeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.chunking.max_chunk_size, 256);
        assert_eq!(loaded.retrieval.top_k, 5);
        assert_eq!(loaded.voice.stt_model, "whisper-base");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = TomeConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        let result = TomeConfig::from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = TomeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("max_chunk_size"));
        assert!(toml_str.contains("top_k"));
        assert!(toml_str.contains("stt_model"));
    }
}
