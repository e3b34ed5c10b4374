//! Model capability interfaces.
//!
//! The engine never talks to a native inference backend directly. Each
//! heavyweight model is exposed as one of four capabilities (transcription,
//! embedding, generation, or synthesis) obtained from the
//! [`crate::lifecycle::ModelLifecycleManager`] once the model is `ready`.
//! Concrete backends implement these traits; tests substitute deterministic
//! in-memory fakes.

use async_trait::async_trait;
use std::sync::Arc;

use crate::audio::AudioClip;
use crate::error::Result;

/// Options for a transcription call.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// ISO language hint (`None` = autodetect).
    pub language: Option<String>,
    /// Translate to English instead of transcribing verbatim.
    pub translate: bool,
}

/// A bounded generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// User-visible prompt body.
    pub prompt: String,
    /// Optional system instruction prepended by the backend.
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
}

impl GenerationRequest {
    /// Request with the crate's default sampling bounds.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
        }
    }

    /// Set the system instruction.
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the token bound.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the nucleus sampling cutoff.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

/// Speech-to-text capability.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe mono f32 samples at `sample_rate` into text.
    ///
    /// An empty or whitespace-only result means silence/no speech.
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        options: &TranscribeOptions,
    ) -> Result<String>;
}

/// Text embedding capability.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed `text` into a fixed-width vector of [`TextEmbedder::dimension`] floats.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Width of every vector this embedder produces.
    fn dimension(&self) -> usize;
}

/// Text generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a bounded completion for `request`.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Combined embedding + generation capability.
///
/// Local LLM backends typically serve both from one loaded model; a single
/// handle avoids loading the weights twice.
pub trait LanguageModel: TextEmbedder + TextGenerator {}

impl<T: TextEmbedder + TextGenerator> LanguageModel for T {}

/// Speech synthesis capability.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into a playable clip.
    async fn synthesize(&self, text: &str) -> Result<AudioClip>;
}

/// Which capability a model provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Speech-to-text.
    SpeechToText,
    /// Text embedding only.
    Embedding,
    /// Text generation only.
    Generation,
    /// Combined embedding + generation.
    Language,
    /// Speech synthesis.
    Synthesis,
}

impl CapabilityKind {
    /// Short label for logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            CapabilityKind::SpeechToText => "stt",
            CapabilityKind::Embedding => "embedding",
            CapabilityKind::Generation => "generation",
            CapabilityKind::Language => "language",
            CapabilityKind::Synthesis => "synthesis",
        }
    }
}

/// A ready model's capability handle.
///
/// Cheap to clone; dropping every clone releases the backend.
#[derive(Clone)]
pub enum ModelCapability {
    /// Speech-to-text handle.
    SpeechToText(Arc<dyn SpeechToText>),
    /// Embedding-only handle.
    Embedder(Arc<dyn TextEmbedder>),
    /// Generation-only handle.
    Generator(Arc<dyn TextGenerator>),
    /// Combined embedding + generation handle.
    Language(Arc<dyn LanguageModel>),
    /// Synthesis handle.
    Synthesizer(Arc<dyn SpeechSynthesizer>),
}

impl ModelCapability {
    /// The kind of capability held.
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            ModelCapability::SpeechToText(_) => CapabilityKind::SpeechToText,
            ModelCapability::Embedder(_) => CapabilityKind::Embedding,
            ModelCapability::Generator(_) => CapabilityKind::Generation,
            ModelCapability::Language(_) => CapabilityKind::Language,
            ModelCapability::Synthesizer(_) => CapabilityKind::Synthesis,
        }
    }

    /// The transcription handle, if this capability provides one.
    #[must_use]
    pub fn as_speech_to_text(&self) -> Option<Arc<dyn SpeechToText>> {
        match self {
            ModelCapability::SpeechToText(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    /// The embedding handle, if this capability provides one.
    #[must_use]
    pub fn as_embedder(&self) -> Option<Arc<dyn TextEmbedder>> {
        match self {
            ModelCapability::Embedder(e) => Some(Arc::clone(e)),
            ModelCapability::Language(l) => {
                let embedder: Arc<dyn TextEmbedder> = l.clone();
                Some(embedder)
            }
            _ => None,
        }
    }

    /// The generation handle, if this capability provides one.
    #[must_use]
    pub fn as_generator(&self) -> Option<Arc<dyn TextGenerator>> {
        match self {
            ModelCapability::Generator(g) => Some(Arc::clone(g)),
            ModelCapability::Language(l) => {
                let generator: Arc<dyn TextGenerator> = l.clone();
                Some(generator)
            }
            _ => None,
        }
    }

    /// The synthesis handle, if this capability provides one.
    #[must_use]
    pub fn as_synthesizer(&self) -> Option<Arc<dyn SpeechSynthesizer>> {
        match self {
            ModelCapability::Synthesizer(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ModelCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelCapability")
            .field(&self.kind().label())
            .finish()
    }
}
