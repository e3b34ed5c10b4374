//! Audio collaborator interfaces for the voice pipeline.
//!
//! Capture and playback devices sit outside the engine; the pipeline talks
//! to them through these traits so platform backends (and in-memory test
//! doubles) are interchangeable. Samples are mono f32 in `[-1, 1]`.

use async_trait::async_trait;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A batch of captured microphone samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate the frame was captured at.
    pub sample_rate: u32,
    /// When the frame left the device, for latency accounting.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Create a frame stamped with the current instant.
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    /// Frame duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// A complete synthesized utterance ready for playback.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Mono f32 samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate of the clip.
    pub sample_rate: u32,
}

impl AudioClip {
    /// Clip duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Microphone capture collaborator.
///
/// `start` begins delivering frames on the provided channel until `stop` is
/// called; repeated `start` calls while running are backend-defined but must
/// not duplicate frame streams.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Begin capturing and deliver frames to `frames`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TomeError::RecordingPermissionDenied`] when
    /// microphone access is not granted, or an audio error for device
    /// failures.
    async fn start(&self, frames: mpsc::Sender<AudioFrame>) -> Result<()>;

    /// Stop capturing. Safe to call when not capturing.
    async fn stop(&self) -> Result<()>;
}

/// Speaker playback collaborator.
#[async_trait]
pub trait AudioPlayback: Send + Sync {
    /// Play `clip`, returning when playback finishes or `cancel` fires.
    ///
    /// Cancellation must take effect promptly (well under one clip's
    /// duration); the pipeline relies on it for barge-in.
    async fn play(&self, clip: AudioClip, cancel: CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn frame_duration_from_samples() {
        let frame = AudioFrame::new(vec![0.0; 16_000], 16_000);
        assert!((frame.duration_secs() - 1.0).abs() < f32::EPSILON);

        let frame = AudioFrame::new(vec![0.0; 8_000], 16_000);
        assert!((frame.duration_secs() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_sample_rate_has_zero_duration() {
        let frame = AudioFrame::new(vec![0.0; 100], 0);
        assert!((frame.duration_secs() - 0.0).abs() < f32::EPSILON);

        let clip = AudioClip {
            samples: vec![0.0; 100],
            sample_rate: 0,
        };
        assert!((clip.duration_secs() - 0.0).abs() < f32::EPSILON);
    }
}
