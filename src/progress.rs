//! Progress reporting for model download and initialization.
//!
//! Lifecycle progress is reported to callers as a stream of typed updates
//! carrying one monotonically non-decreasing fraction in `[0, 1]`, blended
//! across the download and load stages with a per-model weight. This
//! decouples model loading from presentation (CLI indicatif vs. UI state).

use std::sync::Arc;

/// Stage of a model's journey to `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    /// Fetching the artifact from the download collaborator.
    Download,
    /// Loading the artifact into the native backend.
    Load,
    /// The model reached `ready`.
    Ready,
}

/// A single progress update for one model.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Model name the update refers to.
    pub model: String,
    /// Stage the lifecycle is currently in.
    pub stage: ProgressStage,
    /// Blended overall fraction in `[0, 1]`, non-decreasing per operation.
    pub fraction: f32,
    /// Bytes written so far (download stage only).
    pub bytes_downloaded: Option<u64>,
    /// Total bytes expected (download stage only, when known).
    pub total_bytes: Option<u64>,
}

/// Callback type for receiving progress updates.
///
/// Shared (`Arc`) rather than boxed so the lifecycle manager can fan one
/// operation's updates out to every joined waiter.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Maps per-stage completion into one monotone overall fraction.
///
/// The download stage owns `download_weight` of the total and the load stage
/// the remainder. Emitted fractions never decrease, even if a caller reports
/// stage progress out of order (e.g. a ranged-resume download restarting its
/// byte counter).
#[derive(Debug, Clone)]
pub struct ProgressBlend {
    download_weight: f32,
    last: f32,
}

impl ProgressBlend {
    /// Create a blend with the given download weight, clamped to `[0, 1]`.
    #[must_use]
    pub fn new(download_weight: f32) -> Self {
        Self {
            download_weight: download_weight.clamp(0.0, 1.0),
            last: 0.0,
        }
    }

    /// Overall fraction for `bytes` of `total` downloaded.
    ///
    /// With an unknown total the download stage contributes nothing until
    /// [`ProgressBlend::download_complete`].
    pub fn download(&mut self, bytes: u64, total: Option<u64>) -> f32 {
        let stage = match total {
            Some(total) if total > 0 => (bytes as f64 / total as f64).min(1.0) as f32,
            _ => 0.0,
        };
        self.advance(self.download_weight * stage)
    }

    /// Overall fraction once the artifact is fully on disk.
    pub fn download_complete(&mut self) -> f32 {
        self.advance(self.download_weight)
    }

    /// Overall fraction for a partially-loaded model.
    pub fn load(&mut self, stage_fraction: f32) -> f32 {
        let stage = stage_fraction.clamp(0.0, 1.0);
        self.advance(self.download_weight + (1.0 - self.download_weight) * stage)
    }

    /// Overall fraction once the model is `ready`.
    pub fn complete(&mut self) -> f32 {
        self.advance(1.0)
    }

    /// Last fraction handed out.
    #[must_use]
    pub fn current(&self) -> f32 {
        self.last
    }

    fn advance(&mut self, candidate: f32) -> f32 {
        self.last = self.last.max(candidate.clamp(0.0, 1.0));
        self.last
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Mutex;

    #[test]
    fn blend_weights_download_and_load() {
        let mut blend = ProgressBlend::new(0.8);
        assert!((blend.download(0, Some(100)) - 0.0).abs() < f32::EPSILON);
        assert!((blend.download(50, Some(100)) - 0.4).abs() < 1e-6);
        assert!((blend.download_complete() - 0.8).abs() < 1e-6);
        assert!((blend.load(0.5) - 0.9).abs() < 1e-6);
        assert!((blend.complete() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn blend_never_decreases() {
        let mut blend = ProgressBlend::new(0.5);
        let a = blend.download(90, Some(100));
        // Byte counter restarts (resume from scratch); the fraction must hold.
        let b = blend.download(10, Some(100));
        assert!(b >= a);
        let c = blend.load(0.0);
        assert!(c >= b);
        assert!((blend.complete() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn blend_with_unknown_total_jumps_on_completion() {
        let mut blend = ProgressBlend::new(0.6);
        assert!((blend.download(1_000_000, None) - 0.0).abs() < f32::EPSILON);
        assert!((blend.download_complete() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn blend_weight_is_clamped() {
        let mut blend = ProgressBlend::new(1.7);
        assert!((blend.download_complete() - 1.0).abs() < f32::EPSILON);

        let mut blend = ProgressBlend::new(-0.3);
        assert!((blend.download_complete() - 0.0).abs() < f32::EPSILON);
        assert!((blend.load(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn callback_receives_updates() {
        let seen: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let callback: ProgressCallback = Arc::new(move |update: ProgressUpdate| {
            let Ok(mut guard) = seen_clone.lock() else {
                return;
            };
            guard.push(update.fraction);
        });

        let mut blend = ProgressBlend::new(0.5);
        for bytes in [0u64, 25, 50, 100] {
            callback(ProgressUpdate {
                model: "mistral-7b-instruct-q4".into(),
                stage: ProgressStage::Download,
                fraction: blend.download(bytes, Some(100)),
                bytes_downloaded: Some(bytes),
                total_bytes: Some(100),
            });
        }
        callback(ProgressUpdate {
            model: "mistral-7b-instruct-q4".into(),
            stage: ProgressStage::Ready,
            fraction: blend.complete(),
            bytes_downloaded: None,
            total_bytes: None,
        });

        let guard = seen.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(guard.len(), 5);
        assert!(guard.windows(2).all(|w| w[0] <= w[1]));
        assert!((guard[4] - 1.0).abs() < f32::EPSILON);
    }
}
