//! Collaborator interfaces for loading raw volumes and persisting filtered
//! ones, plus a plain binary store.
//!
//! The on-disk format of [`BinVolumeStore`] is three little-endian `u32`
//! extents `(ny, nx, nz)` followed by `ny * nx * nz` little-endian `i32`
//! samples in `(y, x, z)` row-major order.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::error::{PipelineError, Result};

/// One independent unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub tile: usize,
    pub round: usize,
    pub channel: usize,
}

impl JobKey {
    pub fn new(tile: usize, round: usize, channel: usize) -> Self {
        Self {
            tile,
            round,
            channel,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}_r{}_c{}", self.tile, self.round, self.channel)
    }
}

/// Source of raw `(y, x, z)` volumes.
pub trait VolumeLoader: Sync {
    fn load_volume(&self, key: JobKey) -> Result<Array3<u16>>;
}

/// Destination for filtered volumes.
///
/// Implementations must never leave a partially written volume where
/// [`exists`](Self::exists) would report it as complete.
pub trait FilteredStore: Sync {
    fn exists(&self, key: JobKey) -> bool;
    fn save_filtered_volume(&self, key: JobKey, volume: ArrayView3<'_, i32>) -> Result<PathBuf>;
}

/// [`FilteredStore`] writing one `.bin` file per job under `root`.
#[derive(Clone, Debug)]
pub struct BinVolumeStore {
    root: PathBuf,
}

impl BinVolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: JobKey) -> PathBuf {
        self.root.join(format!("{key}.bin"))
    }

    pub fn read(&self, key: JobKey) -> Result<Array3<i32>> {
        read_volume(&self.path_for(key))
    }
}

impl FilteredStore for BinVolumeStore {
    fn exists(&self, key: JobKey) -> bool {
        self.path_for(key).is_file()
    }

    fn save_filtered_volume(&self, key: JobKey, volume: ArrayView3<'_, i32>) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("bin.partial");
        write_volume(&tmp, volume).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PipelineError::io(&tmp, e)
        })?;
        fs::rename(&tmp, &path).map_err(|e| PipelineError::io(&path, e))?;
        #[cfg(feature = "tracing")]
        debug!(%key, path = %path.display(), "saved filtered volume");
        Ok(path)
    }
}

fn write_volume(path: &Path, volume: ArrayView3<'_, i32>) -> std::io::Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    let (ny, nx, nz) = volume.dim();
    for extent in [ny, nx, nz] {
        let extent = u32::try_from(extent)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "extent exceeds u32"))?;
        f.write_all(&extent.to_le_bytes())?;
    }
    for v in volume.iter() {
        f.write_all(&v.to_le_bytes())?;
    }
    f.flush()
}

/// Read a volume written by [`BinVolumeStore`].
pub fn read_volume(path: &Path) -> Result<Array3<i32>> {
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(|e| PipelineError::io(path, e))?;
    let corrupt = |reason: &str| PipelineError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let (header, body) = buf
        .split_at_checked(12)
        .ok_or_else(|| corrupt("truncated header"))?;
    let mut dims = [0usize; 3];
    for (d, chunk) in dims.iter_mut().zip(header.chunks_exact(4)) {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        *d = u32::from_le_bytes(word) as usize;
    }
    let expected_bytes = dims
        .iter()
        .try_fold(4usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| corrupt("extents overflow"))?;
    if body.len() != expected_bytes {
        return Err(corrupt("sample count does not match header"));
    }
    let data: Vec<i32> = body
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), data)
        .map_err(|e| corrupt(&e.to_string()))
}
