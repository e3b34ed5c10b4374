//! Model lifecycle management.
//!
//! Every heavyweight model (speech-to-text, embedding/generation, synthesis)
//! moves through `absent → downloading → downloaded → initializing → ready`,
//! with `failed` reachable from any non-ready state. [`ModelLifecycleManager`]
//! owns those transitions: it guarantees at most one download/initialize in
//! flight per model name (concurrent callers join the in-flight operation),
//! fans blended progress out to every joined waiter, reference-counts ready
//! capabilities, and resets failures to a retryable state.
//!
//! Progress is a monotone fraction in `[0, 1]`: the download stage owns
//! `download_weight` of it and the native load the remainder, blended by
//! [`crate::progress::ProgressBlend`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};

use crate::capability::ModelCapability;
use crate::catalog::ModelSpec;
use crate::download::{ByteProgress, Downloader};
use crate::error::{Result, TomeError};
use crate::progress::{ProgressBlend, ProgressCallback, ProgressStage, ProgressUpdate};

/// Turns a downloaded artifact into a loaded capability.
///
/// Runs on the blocking thread pool; implementations may block.
pub type CapabilityLoader = Arc<dyn Fn(&Path) -> Result<ModelCapability> + Send + Sync>;

/// Lifecycle state of one named model resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// No artifact on disk.
    Absent,
    /// Artifact download in flight.
    Downloading,
    /// Artifact on disk, not loaded.
    Downloaded,
    /// Native load in flight.
    Initializing,
    /// Loaded and usable.
    Ready,
    /// Last operation failed; the next `ensure_ready` retries from
    /// `absent` (download failure, artifact removed) or `downloaded`
    /// (initialization failure, artifact kept).
    Failed,
}

/// Which stage an in-flight operation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailedStage {
    Download,
    Init,
}

/// Failure broadcast to every joined waiter.
#[derive(Debug, Clone)]
struct StageFailure {
    stage: FailedStage,
    message: String,
}

impl StageFailure {
    fn into_error(self) -> TomeError {
        match self.stage {
            FailedStage::Download => TomeError::ModelDownloadFailed(self.message),
            FailedStage::Init => TomeError::ModelInitFailed(self.message),
        }
    }
}

type WaitOutcome = std::result::Result<ModelCapability, StageFailure>;

/// Shared state of one in-flight download/initialize operation.
struct InFlight {
    blend: std::sync::Mutex<ProgressBlend>,
    observers: std::sync::Mutex<Vec<ProgressCallback>>,
}

impl InFlight {
    fn new(download_weight: f32) -> Self {
        Self {
            blend: std::sync::Mutex::new(ProgressBlend::new(download_weight)),
            observers: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, callback: ProgressCallback) {
        let Ok(mut observers) = self.observers.lock() else {
            return;
        };
        observers.push(callback);
    }

    fn emit(&self, update: ProgressUpdate) {
        let observers: Vec<ProgressCallback> = {
            let Ok(guard) = self.observers.lock() else {
                return;
            };
            guard.clone()
        };
        for observer in observers {
            observer(update.clone());
        }
    }
}

/// One registered model resource.
struct ModelEntry {
    spec: ModelSpec,
    loader: CapabilityLoader,
    state: ModelState,
    capability: Option<ModelCapability>,
    refcount: Arc<AtomicUsize>,
    /// Last known overall fraction, stored as f32 bits.
    fraction: Arc<AtomicU32>,
    last_error: Option<String>,
    waiters: Vec<oneshot::Sender<WaitOutcome>>,
    inflight: Option<Arc<InFlight>>,
}

impl ModelEntry {
    fn set_fraction(&self, value: f32) {
        self.fraction.store(value.to_bits(), Ordering::Relaxed);
    }

    fn get_fraction(&self) -> f32 {
        f32::from_bits(self.fraction.load(Ordering::Relaxed))
    }
}

/// Tracks download/initialization/readiness for every named model.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    cache_dir: PathBuf,
    downloader: Arc<dyn Downloader>,
    entries: Mutex<HashMap<String, ModelEntry>>,
}

impl Inner {
    fn artifact_path(&self, spec: &ModelSpec) -> PathBuf {
        self.cache_dir
            .join(&spec.name)
            .join(spec.artifact_filename())
    }
}

impl ModelLifecycleManager {
    /// Manager downloading into `cache_dir` via `downloader`.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_dir: cache_dir.into(),
                downloader,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a model with the loader that turns its artifact into a
    /// capability. The initial state is `downloaded` when the artifact is
    /// already on disk, `absent` otherwise.
    ///
    /// # Errors
    ///
    /// Returns a config error if `name` is already registered.
    pub async fn register(&self, spec: ModelSpec, loader: CapabilityLoader) -> Result<()> {
        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(&spec.name) {
            return Err(TomeError::Config(format!(
                "model {} already registered",
                spec.name
            )));
        }
        let state = if self.inner.artifact_path(&spec).exists() {
            ModelState::Downloaded
        } else {
            ModelState::Absent
        };
        debug!("registered model {} ({:?})", spec.name, state);
        entries.insert(
            spec.name.clone(),
            ModelEntry {
                spec,
                loader,
                state,
                capability: None,
                refcount: Arc::new(AtomicUsize::new(0)),
                fraction: Arc::new(AtomicU32::new(0)),
                last_error: None,
                waiters: Vec::new(),
                inflight: None,
            },
        );
        Ok(())
    }

    /// Bring a model to `ready`, joining any operation already in flight.
    ///
    /// Returns the capability handle and increments the model's reference
    /// count. `on_progress` receives monotone blended fractions for the
    /// remainder of the operation (immediately `1.0` when already ready).
    ///
    /// # Errors
    ///
    /// `ModelDownloadFailed` / `ModelInitFailed` propagate the stage that
    /// failed (shared by every joined caller); a config error is returned
    /// for unregistered names.
    pub async fn ensure_ready(
        &self,
        name: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ModelCapability> {
        let rx = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| TomeError::Config(format!("unknown model: {name}")))?;

            if entry.state == ModelState::Ready {
                if let Some(capability) = entry.capability.clone() {
                    entry.refcount.fetch_add(1, Ordering::SeqCst);
                    entry.set_fraction(1.0);
                    if let Some(callback) = on_progress {
                        callback(ProgressUpdate {
                            model: name.to_owned(),
                            stage: ProgressStage::Ready,
                            fraction: 1.0,
                            bytes_downloaded: None,
                            total_bytes: None,
                        });
                    }
                    return Ok(capability);
                }
                // Handle lost without a release; treat as loadable again.
                warn!("model {name} marked ready without a capability, reloading");
                entry.state = ModelState::Downloaded;
            }

            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);

            let joining = matches!(
                entry.state,
                ModelState::Downloading | ModelState::Initializing
            );
            if joining {
                if let (Some(inflight), Some(callback)) = (entry.inflight.as_ref(), on_progress) {
                    inflight.subscribe(callback);
                }
            } else {
                let inflight = Arc::new(InFlight::new(entry.spec.download_weight));
                if let Some(callback) = on_progress {
                    inflight.subscribe(callback);
                }
                entry.inflight = Some(Arc::clone(&inflight));
                entry.last_error = None;
                entry.set_fraction(0.0);
                entry.state = if self.inner.artifact_path(&entry.spec).exists() {
                    ModelState::Initializing
                } else {
                    ModelState::Downloading
                };
                debug!("model {name}: starting from {:?}", entry.state);
                tokio::spawn(drive(Arc::clone(&self.inner), name.to_owned()));
            }
            rx
        };

        match rx.await {
            Ok(Ok(capability)) => {
                let entries = self.inner.entries.lock().await;
                if let Some(entry) = entries.get(name) {
                    entry.refcount.fetch_add(1, Ordering::SeqCst);
                }
                Ok(capability)
            }
            Ok(Err(failure)) => Err(failure.into_error()),
            Err(_) => Err(TomeError::Channel(format!(
                "lifecycle operation for {name} dropped"
            ))),
        }
    }

    /// Decrement a model's reference count, freeing the native resources at
    /// zero (state returns to `downloaded` while the artifact remains).
    /// No-op for unreferenced or unknown models.
    pub async fn release(&self, name: &str) {
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        let mut current = entry.refcount.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return;
            }
            match entry.refcount.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if entry.refcount.load(Ordering::SeqCst) == 0 && entry.state == ModelState::Ready {
            entry.capability = None;
            entry.state = if self.inner.artifact_path(&entry.spec).exists() {
                ModelState::Downloaded
            } else {
                ModelState::Absent
            };
            info!("model {name}: released, native resources freed");
        }
    }

    /// Current lifecycle state, `None` for unregistered names.
    pub async fn state(&self, name: &str) -> Option<ModelState> {
        let entries = self.inner.entries.lock().await;
        entries.get(name).map(|e| e.state)
    }

    /// Last known overall progress fraction.
    pub async fn progress(&self, name: &str) -> Option<f32> {
        let entries = self.inner.entries.lock().await;
        entries.get(name).map(ModelEntry::get_fraction)
    }

    /// Message from the most recent failure, if any.
    pub async fn last_error(&self, name: &str) -> Option<String> {
        let entries = self.inner.entries.lock().await;
        entries.get(name).and_then(|e| e.last_error.clone())
    }

    /// The capability handle of a `ready` model without driving its
    /// lifecycle or touching reference counts.
    ///
    /// # Errors
    ///
    /// `ModelNotReady` unless the model is currently `ready`; a config error
    /// for unregistered names.
    pub async fn capability(&self, name: &str) -> Result<ModelCapability> {
        let entries = self.inner.entries.lock().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| TomeError::Config(format!("unknown model: {name}")))?;
        match (&entry.state, &entry.capability) {
            (ModelState::Ready, Some(capability)) => Ok(capability.clone()),
            _ => Err(TomeError::ModelNotReady(name.to_owned())),
        }
    }

    /// Names of registered models whose artifacts are present on disk.
    pub async fn downloaded_models(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().await;
        let mut names: Vec<String> = entries
            .values()
            .filter(|e| self.inner.artifact_path(&e.spec).exists())
            .map(|e| e.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Absolute artifact path for a registered model.
    pub async fn artifact_path(&self, name: &str) -> Option<PathBuf> {
        let entries = self.inner.entries.lock().await;
        entries.get(name).map(|e| self.inner.artifact_path(&e.spec))
    }

    /// Remove a model's on-disk artifact and reset it to `absent`.
    ///
    /// # Errors
    ///
    /// A config error when the model is unknown or currently in use
    /// (downloading, initializing, or ready).
    pub async fn delete_artifact(&self, name: &str) -> Result<()> {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| TomeError::Config(format!("unknown model: {name}")))?;
        if matches!(
            entry.state,
            ModelState::Downloading | ModelState::Initializing | ModelState::Ready
        ) {
            return Err(TomeError::Config(format!("model {name} is in use")));
        }
        let path = self.inner.artifact_path(&entry.spec);
        remove_artifact_files(&path);
        entry.state = ModelState::Absent;
        entry.set_fraction(0.0);
        info!("model {name}: artifact deleted");
        Ok(())
    }

    /// Drop every loaded capability regardless of reference counts and
    /// reset states to `downloaded`/`absent`. Models with operations still
    /// in flight are skipped (logged). Intended for application shutdown.
    pub async fn cleanup(&self) {
        let mut entries = self.inner.entries.lock().await;
        for (name, entry) in entries.iter_mut() {
            match entry.state {
                ModelState::Downloading | ModelState::Initializing => {
                    warn!("model {name}: cleanup skipped, operation in flight");
                }
                _ => {
                    entry.capability = None;
                    entry.refcount.store(0, Ordering::SeqCst);
                    entry.state = if self.inner.artifact_path(&entry.spec).exists() {
                        ModelState::Downloaded
                    } else {
                        ModelState::Absent
                    };
                }
            }
        }
        info!("model lifecycle cleaned up");
    }
}

/// Drive one model from its current state to `ready`, notifying waiters.
async fn drive(inner: Arc<Inner>, name: String) {
    let (spec, loader, inflight, fraction, needs_download) = {
        let entries = inner.entries.lock().await;
        let Some(entry) = entries.get(&name) else {
            return;
        };
        let Some(inflight) = entry.inflight.clone() else {
            return;
        };
        (
            entry.spec.clone(),
            Arc::clone(&entry.loader),
            inflight,
            Arc::clone(&entry.fraction),
            entry.state == ModelState::Downloading,
        )
    };

    let artifact = inner.artifact_path(&spec);

    if needs_download {
        info!("model {name}: downloading {}", spec.url);
        let sink: ByteProgress = {
            let inflight = Arc::clone(&inflight);
            let fraction = Arc::clone(&fraction);
            let model = name.clone();
            let declared = spec.size_bytes;
            Arc::new(move |bytes, total| {
                let total = total.or(Some(declared)).filter(|t| *t > 0);
                let value = {
                    let Ok(mut blend) = inflight.blend.lock() else {
                        return;
                    };
                    blend.download(bytes, total)
                };
                fraction.store(value.to_bits(), Ordering::Relaxed);
                inflight.emit(ProgressUpdate {
                    model: model.clone(),
                    stage: ProgressStage::Download,
                    fraction: value,
                    bytes_downloaded: Some(bytes),
                    total_bytes: total,
                });
            })
        };

        let downloader = Arc::clone(&inner.downloader);
        let url = spec.url.clone();
        let dest = artifact.clone();
        let outcome = tokio::task::spawn_blocking(move || downloader.download(&url, &dest, sink))
            .await
            .map_err(|e| TomeError::ModelDownloadFailed(format!("download task failed: {e}")))
            .and_then(|r| r);

        if let Err(e) = outcome {
            // A retry must start clean: no partial artifact left behind.
            remove_artifact_files(&artifact);
            finish_failure(&inner, &name, FailedStage::Download, e.to_string()).await;
            return;
        }

        let value = {
            let mut blend = match inflight.blend.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            blend.download_complete()
        };
        fraction.store(value.to_bits(), Ordering::Relaxed);
        {
            let mut entries = inner.entries.lock().await;
            if let Some(entry) = entries.get_mut(&name) {
                entry.state = ModelState::Downloaded;
            }
        }
        inflight.emit(ProgressUpdate {
            model: name.clone(),
            stage: ProgressStage::Download,
            fraction: value,
            bytes_downloaded: Some(spec.size_bytes),
            total_bytes: Some(spec.size_bytes),
        });
    } else {
        // Artifact already on disk; the download stage is complete by
        // definition and the fraction jumps to its weight.
        let value = {
            let mut blend = match inflight.blend.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            blend.download_complete()
        };
        fraction.store(value.to_bits(), Ordering::Relaxed);
    }

    {
        let mut entries = inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(&name) {
            entry.state = ModelState::Initializing;
        }
    }
    inflight.emit(ProgressUpdate {
        model: name.clone(),
        stage: ProgressStage::Load,
        fraction: f32::from_bits(fraction.load(Ordering::Relaxed)),
        bytes_downloaded: None,
        total_bytes: None,
    });

    info!("model {name}: initializing");
    let start = Instant::now();
    let load_path = artifact.clone();
    let load_loader = Arc::clone(&loader);
    let loaded = tokio::task::spawn_blocking(move || load_loader(&load_path))
        .await
        .map_err(|e| TomeError::ModelInitFailed(format!("load task failed: {e}")))
        .and_then(|r| r);

    let capability = match loaded {
        Ok(capability) => capability,
        Err(e) => {
            // Artifact is kept; a retry skips straight to initializing.
            finish_failure(&inner, &name, FailedStage::Init, e.to_string()).await;
            return;
        }
    };
    info!(
        "model {name}: initialized in {:.1}s",
        start.elapsed().as_secs_f64()
    );

    let value = {
        let mut blend = match inflight.blend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        blend.complete()
    };
    fraction.store(value.to_bits(), Ordering::Relaxed);

    let waiters = {
        let mut entries = inner.entries.lock().await;
        let Some(entry) = entries.get_mut(&name) else {
            return;
        };
        entry.state = ModelState::Ready;
        entry.capability = Some(capability.clone());
        entry.inflight = None;
        std::mem::take(&mut entry.waiters)
    };
    inflight.emit(ProgressUpdate {
        model: name.clone(),
        stage: ProgressStage::Ready,
        fraction: value,
        bytes_downloaded: None,
        total_bytes: None,
    });
    for waiter in waiters {
        let _ = waiter.send(Ok(capability.clone()));
    }
}

/// Record a stage failure and notify every joined waiter.
async fn finish_failure(inner: &Arc<Inner>, name: &str, stage: FailedStage, message: String) {
    error!("model {name}: {stage:?} failed: {message}");
    let waiters = {
        let mut entries = inner.entries.lock().await;
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        entry.state = ModelState::Failed;
        entry.last_error = Some(message.clone());
        entry.inflight = None;
        std::mem::take(&mut entry.waiters)
    };
    let failure = StageFailure { stage, message };
    for waiter in waiters {
        let _ = waiter.send(Err(failure.clone()));
    }
}

/// Best-effort removal of an artifact and its partial-download twin.
fn remove_artifact_files(artifact: &Path) {
    std::fs::remove_file(artifact).ok();
    std::fs::remove_file(artifact.with_extension("part")).ok();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::capability::{GenerationRequest, TextEmbedder, TextGenerator};
    use crate::catalog::ModelSpec;
    use async_trait::async_trait;

    struct FakeEmbedder;

    #[async_trait]
    impl TextEmbedder for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    struct FakeGenerator;

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Ok("ok".into())
        }
    }

    /// Writes a small file and counts invocations; optionally fails first.
    struct FakeDownloader {
        calls: AtomicUsize,
        failures_remaining: AtomicUsize,
    }

    impl FakeDownloader {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures_remaining: AtomicUsize::new(failures),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Downloader for FakeDownloader {
        fn download(&self, _url: &str, dest: &Path, on_progress: ByteProgress) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let failing = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                // Leave a partial behind; the manager must clean it up.
                std::fs::write(dest.with_extension("part"), b"partial")?;
                return Err(TomeError::ModelDownloadFailed("connection reset".into()));
            }
            on_progress(4, Some(8));
            on_progress(8, Some(8));
            std::fs::write(dest, b"artifact")?;
            Ok(dest.to_path_buf())
        }
    }

    fn spec(name: &str) -> ModelSpec {
        ModelSpec::new(
            name,
            format!("https://example.com/{name}.bin"),
            8,
            crate::capability::CapabilityKind::Embedding,
            0.5,
        )
    }

    fn embedder_loader(loads: Arc<AtomicUsize>) -> CapabilityLoader {
        Arc::new(move |_path| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(ModelCapability::Embedder(Arc::new(FakeEmbedder)))
        })
    }

    fn failing_loader(failures: Arc<AtomicUsize>, loads: Arc<AtomicUsize>) -> CapabilityLoader {
        Arc::new(move |_path| {
            loads.fetch_add(1, Ordering::SeqCst);
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TomeError::ModelInitFailed("bad weights".into()));
            }
            Ok(ModelCapability::Generator(Arc::new(FakeGenerator)))
        })
    }

    fn temp_cache() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("tome-lifecycle-")
            .tempdir()
            .unwrap()
    }

    #[tokio::test]
    async fn ensure_ready_downloads_and_initializes() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), embedder_loader(loads.clone()))
            .await
            .unwrap();

        assert_eq!(manager.state("m").await, Some(ModelState::Absent));
        let capability = manager.ensure_ready("m", None).await.unwrap();
        assert!(capability.as_embedder().is_some());
        assert_eq!(manager.state("m").await, Some(ModelState::Ready));
        assert_eq!(downloader.calls(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(manager.artifact_path("m").await.unwrap().exists());
    }

    #[tokio::test]
    async fn repeated_ensure_ready_is_idempotent() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), embedder_loader(loads.clone()))
            .await
            .unwrap();

        manager.ensure_ready("m", None).await.unwrap();
        manager.ensure_ready("m", None).await.unwrap();
        assert_eq!(downloader.calls(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!((manager.progress("m").await.unwrap() - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn concurrent_callers_join_single_flight() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("mistral-7b-instruct-q4"), embedder_loader(loads.clone()))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            manager.ensure_ready("mistral-7b-instruct-q4", None),
            manager.ensure_ready("mistral-7b-instruct-q4", None),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(downloader.calls(), 1, "exactly one download");
        assert_eq!(loads.load(Ordering::SeqCst), 1, "exactly one initialize");
        assert_eq!(
            manager.state("mistral-7b-instruct-q4").await,
            Some(ModelState::Ready)
        );
    }

    #[tokio::test]
    async fn download_failure_cleans_partial_and_allows_retry() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(1);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), embedder_loader(loads.clone()))
            .await
            .unwrap();

        let err = manager.ensure_ready("m", None).await.unwrap_err();
        assert!(matches!(err, TomeError::ModelDownloadFailed(_)));
        assert_eq!(manager.state("m").await, Some(ModelState::Failed));
        assert!(manager.last_error("m").await.is_some());

        let artifact = manager.artifact_path("m").await.unwrap();
        assert!(!artifact.exists(), "no artifact after failed download");
        assert!(
            !artifact.with_extension("part").exists(),
            "no stale partial file"
        );

        // Retry re-attempts the download from scratch and succeeds.
        manager.ensure_ready("m", None).await.unwrap();
        assert_eq!(downloader.calls(), 2);
        assert_eq!(manager.state("m").await, Some(ModelState::Ready));
    }

    #[tokio::test]
    async fn init_failure_keeps_artifact_and_skips_redownload() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let failures = Arc::new(AtomicUsize::new(1));
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), failing_loader(failures, loads.clone()))
            .await
            .unwrap();

        let err = manager.ensure_ready("m", None).await.unwrap_err();
        assert!(matches!(err, TomeError::ModelInitFailed(_)));
        assert_eq!(manager.state("m").await, Some(ModelState::Failed));
        assert!(manager.artifact_path("m").await.unwrap().exists());

        manager.ensure_ready("m", None).await.unwrap();
        assert_eq!(downloader.calls(), 1, "artifact not re-downloaded");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_frees_at_zero_references() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), embedder_loader(loads.clone()))
            .await
            .unwrap();

        manager.ensure_ready("m", None).await.unwrap();
        manager.ensure_ready("m", None).await.unwrap();

        manager.release("m").await;
        assert_eq!(manager.state("m").await, Some(ModelState::Ready));
        manager.release("m").await;
        assert_eq!(manager.state("m").await, Some(ModelState::Downloaded));
        // Releasing an unreferenced model is a no-op.
        manager.release("m").await;
        assert_eq!(manager.state("m").await, Some(ModelState::Downloaded));

        // A later ensure_ready reloads without re-downloading.
        manager.ensure_ready("m", None).await.unwrap();
        assert_eq!(downloader.calls(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn progress_fractions_are_monotone_and_complete() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader.clone());
        manager
            .register(spec("m"), embedder_loader(loads))
            .await
            .unwrap();

        let seen: Arc<std::sync::Mutex<Vec<f32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |update: ProgressUpdate| {
            let Ok(mut guard) = sink.lock() else {
                return;
            };
            guard.push(update.fraction);
        });

        manager.ensure_ready("m", Some(callback)).await.unwrap();

        let fractions = seen.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert!(!fractions.is_empty());
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert!((fractions.last().copied().unwrap() - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn capability_peek_requires_ready() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader);
        manager
            .register(spec("m"), embedder_loader(loads))
            .await
            .unwrap();

        let err = manager.capability("m").await.unwrap_err();
        assert!(matches!(err, TomeError::ModelNotReady(_)));

        manager.ensure_ready("m", None).await.unwrap();
        assert!(manager.capability("m").await.is_ok());
    }

    #[tokio::test]
    async fn delete_artifact_refuses_models_in_use() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader);
        manager
            .register(spec("m"), embedder_loader(loads))
            .await
            .unwrap();

        manager.ensure_ready("m", None).await.unwrap();
        assert!(manager.delete_artifact("m").await.is_err());

        manager.release("m").await;
        manager.delete_artifact("m").await.unwrap();
        assert_eq!(manager.state("m").await, Some(ModelState::Absent));
        assert!(manager.downloaded_models().await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_resets_everything() {
        let cache = temp_cache();
        let downloader = FakeDownloader::new(0);
        let loads = Arc::new(AtomicUsize::new(0));
        let manager = ModelLifecycleManager::new(cache.path(), downloader);
        manager
            .register(spec("m"), embedder_loader(loads))
            .await
            .unwrap();

        manager.ensure_ready("m", None).await.unwrap();
        manager.cleanup().await;
        assert_eq!(manager.state("m").await, Some(ModelState::Downloaded));
        assert!(manager.capability("m").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let cache = temp_cache();
        let manager = ModelLifecycleManager::new(cache.path(), FakeDownloader::new(0));
        let loads = Arc::new(AtomicUsize::new(0));
        manager
            .register(spec("m"), embedder_loader(loads.clone()))
            .await
            .unwrap();
        assert!(manager.register(spec("m"), embedder_loader(loads)).await.is_err());
    }
}
