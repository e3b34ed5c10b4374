#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Voice pipeline integration: spoken questions flow through transcription,
//! retrieval, and synthesis, and every completed exchange lands in the
//! persisted session history.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tome::audio::{AudioCapture, AudioClip, AudioFrame, AudioPlayback};
use tome::capability::{
    CapabilityKind, GenerationRequest, ModelCapability, SpeechSynthesizer, SpeechToText,
    TextEmbedder, TextGenerator, TranscribeOptions,
};
use tome::catalog::ModelSpec;
use tome::config::TomeConfig;
use tome::download::{ByteProgress, Downloader};
use tome::engine::RetrievalAugmentedEngine;
use tome::error::Result;
use tome::lifecycle::{CapabilityLoader, ModelLifecycleManager};
use tome::session::Role;
use tome::storage::SqliteStore;
use tome::voice::{VoicePipeline, VoiceState};

const LANGUAGE_MODEL: &str = "shelf-llm";
const STT_MODEL: &str = "listener";
const TTS_MODEL: &str = "speaker";
const REPLY: &str = "The storm came from the north.";
/// Two seconds at 16 kHz, the default segment threshold.
const SEGMENT: usize = 32_000;

struct InstantDownloader;

impl Downloader for InstantDownloader {
    fn download(&self, _url: &str, dest: &Path, _on_progress: ByteProgress) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, b"weights")?;
        Ok(dest.to_path_buf())
    }
}

struct FlatModel;

#[async_trait]
impl TextEmbedder for FlatModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0])
    }

    fn dimension(&self) -> usize {
        2
    }
}

#[async_trait]
impl TextGenerator for FlatModel {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Ok(REPLY.to_owned())
    }
}

struct ScriptEars {
    transcripts: Mutex<VecDeque<String>>,
}

impl ScriptEars {
    fn new(transcripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| (*t).to_owned()).collect()),
        })
    }
}

#[async_trait]
impl SpeechToText for ScriptEars {
    async fn transcribe(
        &self,
        _samples: &[f32],
        _sample_rate: u32,
        _options: &TranscribeOptions,
    ) -> Result<String> {
        Ok(self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

struct ToneSynth;

#[async_trait]
impl SpeechSynthesizer for ToneSynth {
    async fn synthesize(&self, _text: &str) -> Result<AudioClip> {
        Ok(AudioClip {
            samples: vec![0.0; 400],
            sample_rate: 16_000,
        })
    }
}

struct WiredCapture {
    sender: Mutex<Option<mpsc::Sender<AudioFrame>>>,
}

impl WiredCapture {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
        })
    }

    fn feed(&self, samples: usize) {
        let sender = self.sender.lock().unwrap().clone().expect("capture running");
        sender
            .try_send(AudioFrame::new(vec![0.1; samples], 16_000))
            .expect("frame channel open");
    }
}

#[async_trait]
impl AudioCapture for WiredCapture {
    async fn start(&self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        *self.sender.lock().unwrap() = Some(frames);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.sender.lock().unwrap() = None;
        Ok(())
    }
}

struct HeldPlayback {
    release: Notify,
}

impl HeldPlayback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl AudioPlayback for HeldPlayback {
    async fn play(&self, _clip: AudioClip, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Ok(()),
            () = self.release.notified() => Ok(()),
        }
    }
}

struct VoiceRig {
    pipeline: VoicePipeline,
    capture: Arc<WiredCapture>,
    playback: Arc<HeldPlayback>,
    store: Arc<SqliteStore>,
    book_id: String,
    _tmp: tempfile::TempDir,
}

async fn voice_rig(transcripts: &[&str]) -> VoiceRig {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = TomeConfig::default();
    config.storage.data_dir = tmp.path().to_path_buf();
    config.models.cache_dir = tmp.path().join("models");
    config.models.embedding_model = LANGUAGE_MODEL.into();
    config.models.generation_model = LANGUAGE_MODEL.into();
    config.voice.stt_model = STT_MODEL.into();
    config.voice.tts_model = TTS_MODEL.into();

    let store = Arc::new(SqliteStore::open(&tmp.path().join("library.db")).unwrap());
    let lifecycle = Arc::new(ModelLifecycleManager::new(
        &config.models.cache_dir,
        Arc::new(InstantDownloader),
    ));
    let language: CapabilityLoader =
        Arc::new(|_| Ok(ModelCapability::Language(Arc::new(FlatModel))));
    lifecycle
        .register(spec(LANGUAGE_MODEL, CapabilityKind::Language), language)
        .await
        .unwrap();
    let ears = ScriptEars::new(transcripts);
    let stt: CapabilityLoader =
        Arc::new(move |_| Ok(ModelCapability::SpeechToText(ears.clone())));
    lifecycle
        .register(spec(STT_MODEL, CapabilityKind::SpeechToText), stt)
        .await
        .unwrap();
    let tts: CapabilityLoader = Arc::new(|_| Ok(ModelCapability::Synthesizer(Arc::new(ToneSynth))));
    lifecycle
        .register(spec(TTS_MODEL, CapabilityKind::Synthesis), tts)
        .await
        .unwrap();

    let engine = Arc::new(
        RetrievalAugmentedEngine::new(config.clone(), Arc::clone(&store), Arc::clone(&lifecycle))
            .unwrap(),
    );
    engine.prepare(None).await.unwrap();
    let book = engine
        .ingest_book(
            "The Keeper",
            None,
            "The lighthouse keeper lit the lamp at dusk.",
            None,
        )
        .await
        .unwrap();
    engine.start_session(&book.id).await.unwrap();

    let capture = WiredCapture::new();
    let playback = HeldPlayback::new();
    let pipeline = VoicePipeline::new(
        config.voice.clone(),
        engine,
        lifecycle,
        capture.clone(),
        playback.clone(),
    );
    pipeline.prepare(None).await.unwrap();

    VoiceRig {
        pipeline,
        capture,
        playback,
        store,
        book_id: book.id,
        _tmp: tmp,
    }
}

fn spec(name: &str, kind: CapabilityKind) -> ModelSpec {
    ModelSpec::new(
        name,
        format!("https://example.com/{name}.bin"),
        8,
        kind,
        0.5,
    )
}

async fn wait_for_state(rig: &VoiceRig, want: VoiceState) {
    let mut state = rig.pipeline.subscribe_state();
    timeout(Duration::from_secs(2), state.wait_for(|s| *s == want))
        .await
        .expect("state timeout")
        .expect("state channel open");
}

#[tokio::test]
async fn a_spoken_question_lands_in_the_session_history() {
    let rig = voice_rig(&["What did the storm do?"]).await;

    rig.pipeline.start_listening().await.expect("listen");
    rig.capture.feed(SEGMENT);
    wait_for_state(&rig, VoiceState::Speaking).await;
    rig.playback.release.notify_one();
    wait_for_state(&rig, VoiceState::Idle).await;

    let sessions = rig.store.sessions_for_book(&rig.book_id).unwrap();
    assert_eq!(sessions.len(), 1);
    let messages = &sessions[0].messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "What did the storm do?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, REPLY);
    assert!(!messages[1].chunk_refs.is_empty(), "answer cites the book");
}

#[tokio::test]
async fn barge_in_yields_two_recorded_exchanges() {
    let rig = voice_rig(&["What did the storm do?", "And the ships?"]).await;

    rig.pipeline.start_listening().await.unwrap();
    rig.capture.feed(SEGMENT);
    wait_for_state(&rig, VoiceState::Speaking).await;

    // Speak over the answer; the pipeline returns to capture.
    rig.pipeline.start_listening().await.unwrap();
    wait_for_state(&rig, VoiceState::Capturing).await;
    rig.capture.feed(SEGMENT);
    wait_for_state(&rig, VoiceState::Speaking).await;
    rig.playback.release.notify_one();
    wait_for_state(&rig, VoiceState::Idle).await;

    let sessions = rig.store.sessions_for_book(&rig.book_id).unwrap();
    let messages = &sessions[0].messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].content, "What did the storm do?");
    assert_eq!(messages[2].content, "And the ships?");
    assert!(messages[1].role == Role::Assistant && messages[3].role == Role::Assistant);
}

#[tokio::test]
async fn stopping_midway_leaves_no_partial_history() {
    let rig = voice_rig(&["Never answered"]).await;

    rig.pipeline.start_listening().await.unwrap();
    wait_for_state(&rig, VoiceState::Capturing).await;
    rig.pipeline.stop_listening().await;
    wait_for_state(&rig, VoiceState::Idle).await;

    let sessions = rig.store.sessions_for_book(&rig.book_id).unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].messages.is_empty(), "no partial exchange stored");
}
