//! Built-in model registry.
//!
//! Names, source URLs, declared sizes, and progress weights for the model
//! set the companion ships with. Callers can register additional
//! [`ModelSpec`]s with the lifecycle manager; these are just the defaults.

use crate::capability::CapabilityKind;

/// Speech-to-text model name.
pub const WHISPER_TINY: &str = "whisper-tiny";
/// Speech synthesis voice name.
pub const EN_US_AMY: &str = "en-us-amy";
/// Combined embedding + generation model name.
pub const MISTRAL_7B_INSTRUCT_Q4: &str = "mistral-7b-instruct-q4";

/// Everything the lifecycle manager needs to know about one model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Registry name, also the artifact subdirectory.
    pub name: String,
    /// Direct download URL for the artifact.
    pub url: String,
    /// Declared artifact size in bytes (progress denominator fallback).
    pub size_bytes: u64,
    /// Capability the loaded model provides.
    pub kind: CapabilityKind,
    /// Share of overall progress owned by the download stage.
    ///
    /// Heavier models spend proportionally longer downloading, so their
    /// weight leans toward the download side (0.5–0.8).
    pub download_weight: f32,
}

impl ModelSpec {
    /// Construct a spec.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        size_bytes: u64,
        kind: CapabilityKind,
        download_weight: f32,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            size_bytes,
            kind,
            download_weight,
        }
    }

    /// Artifact filename, taken from the final URL path segment.
    #[must_use]
    pub fn artifact_filename(&self) -> &str {
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(self.name.as_str())
    }
}

/// The shipped model set.
#[must_use]
pub fn builtin_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new(
            WHISPER_TINY,
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
            75_000_000,
            CapabilityKind::SpeechToText,
            0.5,
        ),
        ModelSpec::new(
            EN_US_AMY,
            "https://huggingface.co/rhasspy/piper-voices/resolve/main/en/en_US/amy/medium/en_US-amy-medium.onnx",
            50_000_000,
            CapabilityKind::Synthesis,
            0.5,
        ),
        ModelSpec::new(
            MISTRAL_7B_INSTRUCT_Q4,
            "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.1-GGUF/resolve/main/mistral-7b-instruct-v0.1.Q4_K_M.gguf",
            4_200_000_000,
            CapabilityKind::Language,
            0.8,
        ),
    ]
}

/// Look up a shipped model by name.
#[must_use]
pub fn builtin_model(name: &str) -> Option<ModelSpec> {
    builtin_models().into_iter().find(|m| m.name == name)
}
