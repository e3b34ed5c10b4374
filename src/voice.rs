//! Voice conversation pipeline: capture, transcribe, answer, speak.
//!
//! A small state machine drives one exchange at a time. Listening starts
//! on request, microphone audio accumulates until a minimum segment is
//! buffered, the segment is transcribed, and a non-empty transcript is
//! handed to the engine; the answer is synthesized and played back. The
//! user can stop listening from any state, and speaking over playback
//! (barge-in) stops the clip and returns to capture.
//!
//! State changes, transcripts, and answers are published on a broadcast
//! channel. Completions that land after a stop are discarded via an epoch
//! counter bumped on every stop and restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioCapture, AudioFrame, AudioPlayback};
use crate::capability::{SpeechSynthesizer, SpeechToText, TranscribeOptions};
use crate::config::VoiceConfig;
use crate::engine::RetrievalAugmentedEngine;
use crate::error::{Result, TomeError};
use crate::lifecycle::ModelLifecycleManager;
use crate::progress::ProgressCallback;

const FRAME_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 32;

/// Pipeline position, observable via [`VoicePipeline::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Capturing,
    Transcribing,
    Processing,
    Synthesizing,
    Speaking,
}

/// Event published to pipeline observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    StateChanged(VoiceState),
    /// Non-empty transcript about to be answered.
    Transcript(String),
    /// Generated answer about to be synthesized.
    Answer(String),
    /// A stage failed; the pipeline has already transitioned.
    Error(String),
}

/// How one listening round ended.
enum RoundOutcome {
    /// Exchange completed; the pipeline went idle.
    Finished,
    /// Playback was interrupted; capture should restart.
    BargeIn,
    /// The run was cancelled or superseded.
    Cancelled,
}

struct Control {
    run_cancel: Option<CancellationToken>,
    play_cancel: Option<CancellationToken>,
}

struct Inner {
    config: VoiceConfig,
    engine: Arc<RetrievalAugmentedEngine>,
    lifecycle: Arc<ModelLifecycleManager>,
    capture: Arc<dyn AudioCapture>,
    playback: Arc<dyn AudioPlayback>,
    state: watch::Sender<VoiceState>,
    events: broadcast::Sender<VoiceEvent>,
    /// Bumped on every stop and listen start; tasks carry the epoch they
    /// were started under and go silent once it is stale.
    epoch: AtomicU64,
    control: tokio::sync::Mutex<Control>,
}

impl Inner {
    /// Publish a state change unless `epoch` is stale. Returns whether the
    /// caller is still current.
    fn set_state(&self, epoch: u64, next: VoiceState) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.state.send_replace(next);
        let _ = self.events.send(VoiceEvent::StateChanged(next));
        true
    }

    fn emit(&self, epoch: u64, event: VoiceEvent) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            let _ = self.events.send(event);
        }
    }
}

/// Voice conversation pipeline handle.
///
/// Not `Clone`; share via `Arc` like the engine.
pub struct VoicePipeline {
    inner: Arc<Inner>,
}

impl VoicePipeline {
    pub fn new(
        config: VoiceConfig,
        engine: Arc<RetrievalAugmentedEngine>,
        lifecycle: Arc<ModelLifecycleManager>,
        capture: Arc<dyn AudioCapture>,
        playback: Arc<dyn AudioPlayback>,
    ) -> Self {
        let (state, _) = watch::channel(VoiceState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                lifecycle,
                capture,
                playback,
                state,
                events,
                epoch: AtomicU64::new(0),
                control: tokio::sync::Mutex::new(Control {
                    run_cancel: None,
                    play_cancel: None,
                }),
            }),
        }
    }

    /// Ensure the speech models are ready, downloading and initializing
    /// them as needed. Holds a reference on each until [`Self::shutdown`].
    ///
    /// # Errors
    ///
    /// Download and initialization failures propagate.
    pub async fn prepare(&self, on_progress: Option<ProgressCallback>) -> Result<()> {
        self.inner
            .lifecycle
            .ensure_ready(&self.inner.config.stt_model, on_progress.clone())
            .await?;
        self.inner
            .lifecycle
            .ensure_ready(&self.inner.config.tts_model, on_progress)
            .await?;
        Ok(())
    }

    /// Stop listening and release the pipeline's model references.
    pub async fn shutdown(&self) {
        self.stop_listening().await;
        self.inner
            .lifecycle
            .release(&self.inner.config.tts_model)
            .await;
        self.inner
            .lifecycle
            .release(&self.inner.config.stt_model)
            .await;
    }

    /// Current pipeline state.
    #[must_use]
    pub fn state(&self) -> VoiceState {
        *self.inner.state.borrow()
    }

    /// Watch receiver for state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<VoiceState> {
        self.inner.state.subscribe()
    }

    /// Event stream receiver. Subscribe before starting to observe every
    /// transition of a run.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events.subscribe()
    }

    /// Begin listening, or barge in when called while the assistant is
    /// speaking: playback stops and capture resumes. A no-op in every
    /// other non-idle state.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` when the speech models are not ready (listening
    /// never triggers downloads) and `RecordingPermissionDenied` when
    /// microphone access is refused; the pipeline stays idle on error.
    pub async fn start_listening(&self) -> Result<()> {
        let mut control = self.inner.control.lock().await;
        match self.state() {
            VoiceState::Speaking => {
                if let Some(play) = control.play_cancel.take() {
                    info!("barge-in: stopping playback to listen");
                    play.cancel();
                }
                Ok(())
            }
            VoiceState::Idle => {
                let stt = self.stt().await?;
                let tts = self.tts().await?;

                let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
                self.inner.capture.start(frames_tx).await?;

                let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = CancellationToken::new();
                control.run_cancel = Some(cancel.clone());
                let inner = Arc::clone(&self.inner);
                inner.set_state(epoch, VoiceState::Capturing);
                tokio::spawn(run_listener(inner, stt, tts, frames_rx, cancel, epoch));
                Ok(())
            }
            other => {
                debug!("start_listening ignored in state {other:?}");
                Ok(())
            }
        }
    }

    /// Stop listening from any state: capture and playback are cancelled,
    /// in-flight completions are discarded, and the pipeline goes idle.
    pub async fn stop_listening(&self) {
        let mut control = self.inner.control.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = control.run_cancel.take() {
            cancel.cancel();
        }
        if let Some(play) = control.play_cancel.take() {
            play.cancel();
        }
        if let Err(e) = self.inner.capture.stop().await {
            warn!("capture stop failed: {e}");
        }
        let was = self.inner.state.send_replace(VoiceState::Idle);
        if was != VoiceState::Idle {
            let _ = self
                .inner
                .events
                .send(VoiceEvent::StateChanged(VoiceState::Idle));
            debug!("listening stopped from {was:?}");
        }
    }

    async fn stt(&self) -> Result<Arc<dyn SpeechToText>> {
        let name = &self.inner.config.stt_model;
        self.inner
            .lifecycle
            .capability(name)
            .await?
            .as_speech_to_text()
            .ok_or_else(|| TomeError::Config(format!("model {name} cannot transcribe")))
    }

    async fn tts(&self) -> Result<Arc<dyn SpeechSynthesizer>> {
        let name = &self.inner.config.tts_model;
        self.inner
            .lifecycle
            .capability(name)
            .await?
            .as_synthesizer()
            .ok_or_else(|| TomeError::Config(format!("model {name} cannot synthesize")))
    }
}

/// Samples to buffer before a segment is handed to transcription.
fn segment_samples(config: &VoiceConfig) -> usize {
    let samples = (config.sample_rate as f32 * config.min_segment_secs).ceil() as usize;
    samples.max(1)
}

/// Listening task: runs rounds until the exchange finishes, the run is
/// cancelled, or a capture restart fails. Each barge-in starts a new round.
async fn run_listener(
    inner: Arc<Inner>,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn SpeechSynthesizer>,
    first_frames: mpsc::Receiver<AudioFrame>,
    cancel: CancellationToken,
    epoch: u64,
) {
    let mut frames = first_frames;
    loop {
        match listen_round(&inner, &stt, &tts, frames, &cancel, epoch).await {
            RoundOutcome::BargeIn => {
                if cancel.is_cancelled() {
                    return;
                }
                let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
                match inner.capture.start(frames_tx).await {
                    Ok(()) => {
                        if !inner.set_state(epoch, VoiceState::Capturing) {
                            // A stop raced the restart; the mic it just
                            // opened must not stay hot.
                            if let Err(e) = inner.capture.stop().await {
                                warn!("capture stop failed: {e}");
                            }
                            return;
                        }
                        frames = frames_rx;
                    }
                    Err(e) => {
                        inner.emit(epoch, VoiceEvent::Error(e.to_string()));
                        inner.set_state(epoch, VoiceState::Idle);
                        return;
                    }
                }
            }
            RoundOutcome::Finished | RoundOutcome::Cancelled => return,
        }
    }
}

/// One listening round: buffer audio, transcribe, answer, speak.
async fn listen_round(
    inner: &Arc<Inner>,
    stt: &Arc<dyn SpeechToText>,
    tts: &Arc<dyn SpeechSynthesizer>,
    mut frames: mpsc::Receiver<AudioFrame>,
    cancel: &CancellationToken,
    epoch: u64,
) -> RoundOutcome {
    let min_samples = segment_samples(&inner.config);
    let mut buffer: Vec<f32> = Vec::new();

    // Capture until a segment transcribes to something non-empty. The mic
    // keeps feeding the channel while a transcription is in flight.
    let text = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return RoundOutcome::Cancelled,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            // Device failure if the epoch is still ours; an ordinary stop
            // already moved the pipeline to idle under a newer epoch.
            if inner.set_state(epoch, VoiceState::Idle) {
                inner.emit(
                    epoch,
                    VoiceEvent::Error("audio capture ended unexpectedly".into()),
                );
            }
            return RoundOutcome::Cancelled;
        };
        buffer.extend_from_slice(&frame.samples);
        if buffer.len() < min_samples {
            continue;
        }

        let segment = std::mem::take(&mut buffer);
        if !inner.set_state(epoch, VoiceState::Transcribing) {
            return RoundOutcome::Cancelled;
        }
        debug!(
            "transcribing {:.1}s segment",
            segment.len() as f32 / inner.config.sample_rate as f32
        );
        let options = TranscribeOptions::default();
        let transcribed = stt
            .transcribe(&segment, inner.config.sample_rate, &options)
            .await;
        if cancel.is_cancelled() {
            // Completed after a stop; discard silently.
            return RoundOutcome::Cancelled;
        }
        match transcribed {
            Ok(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    debug!("segment was silence");
                    if !inner.set_state(epoch, VoiceState::Capturing) {
                        return RoundOutcome::Cancelled;
                    }
                    continue;
                }
                break trimmed.to_owned();
            }
            Err(e) => {
                inner.emit(epoch, VoiceEvent::Error(e.to_string()));
                if !inner.set_state(epoch, VoiceState::Capturing) {
                    return RoundOutcome::Cancelled;
                }
            }
        }
    };

    inner.emit(epoch, VoiceEvent::Transcript(text.clone()));

    // Handoff: release the mic; audio buffered past the segment is dropped
    // with the receiver.
    if let Err(e) = inner.capture.stop().await {
        warn!("capture stop failed: {e}");
    }
    drop(frames);
    if !inner.set_state(epoch, VoiceState::Processing) {
        return RoundOutcome::Cancelled;
    }

    let answer = match inner.engine.answer(&text).await {
        Ok(answer) => answer,
        Err(e) => {
            if cancel.is_cancelled() {
                return RoundOutcome::Cancelled;
            }
            inner.emit(epoch, VoiceEvent::Error(e.to_string()));
            inner.set_state(epoch, VoiceState::Idle);
            return RoundOutcome::Finished;
        }
    };
    inner.emit(epoch, VoiceEvent::Answer(answer.text.clone()));
    if !inner.set_state(epoch, VoiceState::Synthesizing) {
        return RoundOutcome::Cancelled;
    }

    let clip = match tts.synthesize(&answer.text).await {
        Ok(clip) => clip,
        Err(e) => {
            if cancel.is_cancelled() {
                return RoundOutcome::Cancelled;
            }
            inner.emit(epoch, VoiceEvent::Error(e.to_string()));
            inner.set_state(epoch, VoiceState::Idle);
            return RoundOutcome::Finished;
        }
    };

    let play_cancel = CancellationToken::new();
    {
        let mut control = inner.control.lock().await;
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return RoundOutcome::Cancelled;
        }
        control.play_cancel = Some(play_cancel.clone());
    }
    if !inner.set_state(epoch, VoiceState::Speaking) {
        return RoundOutcome::Cancelled;
    }
    let played = tokio::select! {
        () = cancel.cancelled() => return RoundOutcome::Cancelled,
        played = inner.playback.play(clip, play_cancel.clone()) => played,
    };
    {
        let mut control = inner.control.lock().await;
        if inner.epoch.load(Ordering::SeqCst) == epoch {
            control.play_cancel = None;
        }
    }
    if cancel.is_cancelled() {
        return RoundOutcome::Cancelled;
    }
    if play_cancel.is_cancelled() {
        info!("playback interrupted, returning to capture");
        return RoundOutcome::BargeIn;
    }
    if let Err(e) = played {
        inner.emit(epoch, VoiceEvent::Error(e.to_string()));
    }
    inner.set_state(epoch, VoiceState::Idle);
    RoundOutcome::Finished
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
