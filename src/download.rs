//! Model artifact downloads.
//!
//! The lifecycle manager fetches artifacts through the [`Downloader`]
//! collaborator so tests can substitute an in-memory fake. The shipped
//! backend streams over HTTP into a `.part` temp file and renames it into
//! place, resuming a previous partial via a ranged request when one exists.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, TomeError};

/// Byte-level progress sink: `(bytes_written, total_bytes)`.
///
/// `total_bytes` is `None` when the server does not report a length.
pub type ByteProgress = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Download collaborator contract.
///
/// Implementations are blocking; callers run them on the blocking thread
/// pool. Re-invocation with the same arguments must be idempotent: an
/// already-complete destination is returned as-is, and a leftover partial is
/// resumed rather than restarted where the server allows it.
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest`, reporting byte progress along the way.
    ///
    /// # Errors
    ///
    /// Returns [`TomeError::ModelDownloadFailed`] on transport or filesystem
    /// failure. Any partial file is left in place for a later resume; the
    /// lifecycle manager decides whether to clean it up.
    fn download(&self, url: &str, dest: &Path, on_progress: ByteProgress) -> Result<PathBuf>;
}

/// HTTP downloader backed by `ureq`.
pub struct HttpDownloader {
    show_console_progress: bool,
}

impl HttpDownloader {
    /// Downloader with a console progress bar.
    #[must_use]
    pub fn new() -> Self {
        Self {
            show_console_progress: true,
        }
    }

    /// Downloader without console output (embedding in a UI).
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            show_console_progress: false,
        }
    }

    fn progress_bar(&self, filename: &str) -> ProgressBar {
        if !self.show_console_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
        ) {
            pb.set_style(style);
        }
        pb.set_message(filename.to_owned());
        pb
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path, on_progress: ByteProgress) -> Result<PathBuf> {
        let filename = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_owned());

        if dest.exists() {
            debug!("{filename} already downloaded");
            return Ok(dest.to_path_buf());
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to a temp file then rename (atomic-ish on same filesystem).
        let tmp = dest.with_extension("part");
        let mut offset = match std::fs::metadata(&tmp) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let resp = match request(url, offset) {
            Ok(resp) => resp,
            Err(RequestOutcome::RangeNotSatisfiable) => {
                // Stale or oversized partial; start over.
                warn!("{filename}: stored partial rejected by server, restarting");
                std::fs::remove_file(&tmp).ok();
                offset = 0;
                request(url, 0).map_err(|e| e.into_error(&filename))?
            }
            Err(e) => return Err(e.into_error(&filename)),
        };

        let resumed = offset > 0 && resp.status() == 206;
        if offset > 0 && !resumed {
            // Server ignored the range request; restart from scratch.
            offset = 0;
        }

        let total_bytes = if resumed {
            resp.header("content-range").and_then(content_range_total)
        } else {
            resp.header("content-length")
                .and_then(|v| v.parse::<u64>().ok())
        };

        if resumed {
            info!("{filename}: resuming download at {offset} bytes");
        }

        let pb = self.progress_bar(&filename);
        if let Some(len) = total_bytes {
            pb.set_length(len);
            pb.set_position(offset);
        }

        let mut file = if resumed {
            std::fs::OpenOptions::new().append(true).open(&tmp)?
        } else {
            std::fs::File::create(&tmp)?
        };

        let mut reader = resp.into_reader();
        let mut buf = [0u8; 64 * 1024];
        let mut bytes_written = offset;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| TomeError::ModelDownloadFailed(format!("{filename}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            pb.inc(n as u64);
            bytes_written += n as u64;
            on_progress(bytes_written, total_bytes);
        }
        file.flush()?;
        pb.finish();

        std::fs::rename(&tmp, dest)?;
        info!("{filename}: downloaded {bytes_written} bytes");

        Ok(dest.to_path_buf())
    }
}

enum RequestOutcome {
    RangeNotSatisfiable,
    Failed(String),
}

impl RequestOutcome {
    fn into_error(self, filename: &str) -> TomeError {
        match self {
            RequestOutcome::RangeNotSatisfiable => {
                TomeError::ModelDownloadFailed(format!("{filename}: range not satisfiable"))
            }
            RequestOutcome::Failed(msg) => {
                TomeError::ModelDownloadFailed(format!("{filename}: {msg}"))
            }
        }
    }
}

fn request(url: &str, offset: u64) -> std::result::Result<ureq::Response, RequestOutcome> {
    let req = if offset > 0 {
        ureq::get(url).set("Range", &format!("bytes={offset}-"))
    } else {
        ureq::get(url)
    };
    match req.call() {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(416, _)) => Err(RequestOutcome::RangeNotSatisfiable),
        Err(e) => Err(RequestOutcome::Failed(e.to_string())),
    }
}

/// Total size from a `Content-Range: bytes start-end/total` header.
fn content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}
