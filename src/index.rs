//! Per-book vector index.
//!
//! An append-only flat index over embedding vectors. The index owns the
//! mapping from backend ordinals to chunk ids: vectors are only ever
//! appended, so ordinal `i` in the backend always corresponds to
//! `chunk_ids[i]`. Duplicate chunk ids are rejected before the backend is
//! touched, which keeps that correspondence intact even on error paths.
//!
//! Persistence writes two files: a little-endian binary vector file and a
//! JSON sidecar carrying the chunk ids. Restore cross-checks dimension and
//! count between the two and fails with `IndexCorrupt` on any mismatch
//! rather than serving misaligned results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, TomeError};

/// Current binary layout version.
const LAYOUT_VERSION: u32 = 1;
/// Magic bytes opening the vector file.
const MAGIC: [u8; 4] = *b"TVEC";

/// One retrieval result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Chunk the vector belongs to.
    pub chunk_id: String,
    /// Squared L2 distance to the query (smaller is closer).
    pub distance: f32,
}

/// Vector storage addressed by insertion ordinal.
///
/// Implementations are append-only; the ordinal returned by `add` is the
/// number of vectors stored before the call.
pub trait VectorBackend: Send + Sync {
    fn dimension(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Append a vector, returning its ordinal.
    fn add(&mut self, vector: &[f32]) -> Result<usize>;
    /// The `k` nearest ordinals by squared L2 distance, ascending.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>>;
    /// Copy of the vector stored at `ordinal`.
    fn reconstruct(&self, ordinal: usize) -> Result<Vec<f32>>;
}

/// Exact brute-force backend over a contiguous row-major buffer.
#[derive(Debug, Clone)]
pub struct FlatBackend {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatBackend {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Rebuild from a row-major buffer of `count` rows.
    fn from_raw(dimension: usize, data: Vec<f32>, count: usize) -> Result<Self> {
        if data.len() != count * dimension {
            return Err(TomeError::IndexCorrupt(format!(
                "vector file holds {} values, expected {} ({count} rows of {dimension})",
                data.len(),
                count * dimension
            )));
        }
        Ok(Self { dimension, data })
    }

    fn row(&self, ordinal: usize) -> Option<&[f32]> {
        let start = ordinal * self.dimension;
        self.data.get(start..start + self.dimension)
    }
}

impl VectorBackend for FlatBackend {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    fn add(&mut self, vector: &[f32]) -> Result<usize> {
        if vector.len() != self.dimension {
            return Err(TomeError::DimensionMismatch(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        let ordinal = self.len();
        self.data.extend_from_slice(vector);
        Ok(ordinal)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(TomeError::DimensionMismatch(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        let mut hits: Vec<(usize, f32)> = (0..self.len())
            .filter_map(|ordinal| self.row(ordinal).map(|row| (ordinal, squared_l2(query, row))))
            .collect();
        hits.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn reconstruct(&self, ordinal: usize) -> Result<Vec<f32>> {
        self.row(ordinal).map(<[f32]>::to_vec).ok_or_else(|| {
            TomeError::IndexCorrupt(format!("ordinal {ordinal} out of range"))
        })
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Row-major little-endian byte form of a vector (embedding blob layout).
pub(crate) fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * std::mem::size_of::<f32>());
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Inverse of [`vector_to_bytes`]; `None` when the length is not a
/// multiple of four bytes.
pub(crate) fn bytes_to_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % std::mem::size_of::<f32>() != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Sidecar describing the vector file next to it.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSidecar {
    version: u32,
    dimension: usize,
    count: usize,
    chunk_ids: Vec<String>,
}

/// Append-only vector index mapping chunk ids to embedding vectors.
pub struct VectorIndex {
    dimension: usize,
    chunk_ids: Vec<String>,
    positions: HashMap<String, usize>,
    backend: Box<dyn VectorBackend>,
}

impl VectorIndex {
    /// Empty index over the flat backend.
    ///
    /// # Errors
    ///
    /// Rejects a zero dimension.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(TomeError::Config(
                "index dimension must be at least 1".into(),
            ));
        }
        Ok(Self {
            dimension,
            chunk_ids: Vec::new(),
            positions: HashMap::new(),
            backend: Box::new(FlatBackend::new(dimension)),
        })
    }

    /// Empty index over a caller-supplied backend.
    #[must_use]
    pub fn with_backend(backend: Box<dyn VectorBackend>) -> Self {
        Self {
            dimension: backend.dimension(),
            chunk_ids: Vec::new(),
            positions: HashMap::new(),
            backend,
        }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    /// Chunk ids in insertion order (ordinal order).
    #[must_use]
    pub fn chunk_ids(&self) -> &[String] {
        &self.chunk_ids
    }

    /// Append one chunk's vector, returning its insertion ordinal.
    ///
    /// # Errors
    ///
    /// `DuplicateChunk` when the id is already indexed (checked before the
    /// backend is touched), `DimensionMismatch` for a wrong-sized vector.
    pub fn add(&mut self, chunk_id: &str, vector: &[f32]) -> Result<usize> {
        if self.contains(chunk_id) {
            return Err(TomeError::DuplicateChunk(chunk_id.to_owned()));
        }
        if vector.len() != self.dimension {
            return Err(TomeError::DimensionMismatch(format!(
                "vector for {chunk_id} has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        let ordinal = self.backend.add(vector)?;
        if ordinal != self.chunk_ids.len() {
            return Err(TomeError::IndexCorrupt(format!(
                "backend ordinal {ordinal} diverged from {} stored ids",
                self.chunk_ids.len()
            )));
        }
        self.positions.insert(chunk_id.to_owned(), ordinal);
        self.chunk_ids.push(chunk_id.to_owned());
        Ok(ordinal)
    }

    /// The `k` nearest chunks, ascending by squared L2 distance. `k` is
    /// clamped to the index size; an empty index returns no hits.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` for a wrong-sized query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(TomeError::DimensionMismatch(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let hits = self.backend.search(query, k.min(self.len()))?;
        hits.into_iter()
            .map(|(ordinal, distance)| {
                self.chunk_ids
                    .get(ordinal)
                    .map(|chunk_id| SearchHit {
                        chunk_id: chunk_id.clone(),
                        distance,
                    })
                    .ok_or_else(|| {
                        TomeError::IndexCorrupt(format!(
                            "backend returned ordinal {ordinal} beyond {} ids",
                            self.chunk_ids.len()
                        ))
                    })
            })
            .collect()
    }

    /// Write the vector file at `path` and its `.json` sidecar.
    ///
    /// Both files go through a temp-and-rename so a crash mid-write never
    /// leaves a torn index behind.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut binary =
            Vec::with_capacity(16 + self.len() * self.dimension * std::mem::size_of::<f32>());
        binary.extend_from_slice(&MAGIC);
        binary.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
        let dimension = u32::try_from(self.dimension)
            .map_err(|_| TomeError::IndexCorrupt("dimension exceeds layout limit".into()))?;
        let count = u32::try_from(self.len())
            .map_err(|_| TomeError::IndexCorrupt("index exceeds layout limit".into()))?;
        binary.extend_from_slice(&dimension.to_le_bytes());
        binary.extend_from_slice(&count.to_le_bytes());
        for ordinal in 0..self.len() {
            binary.extend_from_slice(&vector_to_bytes(&self.backend.reconstruct(ordinal)?));
        }
        write_atomic(path, &binary)?;

        let sidecar = IndexSidecar {
            version: LAYOUT_VERSION,
            dimension: self.dimension,
            count: self.len(),
            chunk_ids: self.chunk_ids.clone(),
        };
        write_atomic(&sidecar_path(path), serde_json::to_vec_pretty(&sidecar)?.as_slice())?;

        debug!(
            "persisted index at {} ({} vectors, dimension {})",
            path.display(),
            self.len(),
            self.dimension
        );
        Ok(())
    }

    /// Load an index persisted by [`VectorIndex::persist`].
    ///
    /// # Errors
    ///
    /// `IndexCorrupt` when either file is missing or unreadable, the
    /// sidecar is not valid JSON, the two files disagree on dimension or
    /// count, the layout version is unknown, or the vector file is
    /// truncated.
    pub fn restore(path: &Path) -> Result<Self> {
        let raw = std::fs::read(sidecar_path(path))
            .map_err(|e| TomeError::IndexCorrupt(format!("sidecar unreadable: {e}")))?;
        let sidecar: IndexSidecar = serde_json::from_slice(&raw)
            .map_err(|e| TomeError::IndexCorrupt(format!("sidecar malformed: {e}")))?;
        if sidecar.version != LAYOUT_VERSION {
            return Err(TomeError::IndexCorrupt(format!(
                "unsupported sidecar version {}",
                sidecar.version
            )));
        }
        if sidecar.chunk_ids.len() != sidecar.count {
            return Err(TomeError::IndexCorrupt(format!(
                "sidecar says {} vectors but lists {} chunk ids",
                sidecar.count,
                sidecar.chunk_ids.len()
            )));
        }

        let binary = std::fs::read(path)
            .map_err(|e| TomeError::IndexCorrupt(format!("vector file unreadable: {e}")))?;
        if binary.len() < 16 {
            return Err(TomeError::IndexCorrupt("vector file truncated".into()));
        }
        if binary[0..4] != MAGIC {
            return Err(TomeError::IndexCorrupt("bad magic in vector file".into()));
        }
        let version = read_u32(&binary, 4);
        if version != LAYOUT_VERSION {
            return Err(TomeError::IndexCorrupt(format!(
                "unsupported layout version {version}"
            )));
        }
        let dimension = read_u32(&binary, 8) as usize;
        let count = read_u32(&binary, 12) as usize;
        if dimension != sidecar.dimension {
            return Err(TomeError::IndexCorrupt(format!(
                "vector file dimension {dimension} does not match sidecar {}",
                sidecar.dimension
            )));
        }
        if count != sidecar.count {
            return Err(TomeError::IndexCorrupt(format!(
                "vector file count {count} does not match sidecar {}",
                sidecar.count
            )));
        }

        let body = &binary[16..];
        if body.len() != count * dimension * std::mem::size_of::<f32>() {
            return Err(TomeError::IndexCorrupt(format!(
                "vector file body is {} bytes, expected {}",
                body.len(),
                count * dimension * std::mem::size_of::<f32>()
            )));
        }
        let data = bytes_to_vector(body)
            .ok_or_else(|| TomeError::IndexCorrupt("vector file body misaligned".into()))?;

        let backend = FlatBackend::from_raw(dimension, data, count)?;
        let positions = sidecar
            .chunk_ids
            .iter()
            .enumerate()
            .map(|(ordinal, id)| (id.clone(), ordinal))
            .collect::<HashMap<_, _>>();
        if positions.len() != sidecar.chunk_ids.len() {
            return Err(TomeError::IndexCorrupt(
                "sidecar lists duplicate chunk ids".into(),
            ));
        }

        debug!(
            "restored index from {} ({count} vectors, dimension {dimension})",
            path.display()
        );
        Ok(Self {
            dimension,
            chunk_ids: sidecar.chunk_ids,
            positions,
            backend: Box::new(backend),
        })
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// `<path>.json`, appended rather than replacing the extension.
pub(crate) fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".json");
    PathBuf::from(os)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = {
        let mut os = path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    };
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}
