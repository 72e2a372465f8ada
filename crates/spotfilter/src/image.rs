//! Raw volume loading from per-plane grayscale images.

use std::path::{Path, PathBuf};

use image::{ImageBuffer, ImageReader, Luma};
use ndarray::Array3;

use crate::error::{PipelineError, Result};
use crate::io::{JobKey, VolumeLoader};

/// Loads `{dir}/t{tile}_r{round}_c{channel}_z{z}.png` for `z` in `0..n_z`
/// and stacks the planes along the z axis.
///
/// Any format the `image` crate decodes works; samples are converted to
/// 16-bit luma.
#[derive(Clone, Debug)]
pub struct PngPlaneLoader {
    dir: PathBuf,
    n_z: usize,
}

impl PngPlaneLoader {
    pub fn new(dir: impl Into<PathBuf>, n_z: usize) -> Self {
        Self {
            dir: dir.into(),
            n_z: n_z.max(1),
        }
    }

    pub fn plane_path(&self, key: JobKey, z: usize) -> PathBuf {
        self.dir.join(format!("{key}_z{z}.png"))
    }

    fn load_plane(&self, key: JobKey, z: usize) -> Result<ImageBuffer<Luma<u16>, Vec<u16>>> {
        let path = self.plane_path(key, z);
        if !path.is_file() {
            return Err(PipelineError::MissingPlane { key, z });
        }
        let reader = ImageReader::open(&path).map_err(|e| PipelineError::io(&path, e))?;
        let img = reader.decode().map_err(|source| PipelineError::Image {
            path: path.clone(),
            source,
        })?;
        Ok(img.to_luma16())
    }
}

impl VolumeLoader for PngPlaneLoader {
    fn load_volume(&self, key: JobKey) -> Result<Array3<u16>> {
        let first = self.load_plane(key, 0)?;
        let (w, h) = first.dimensions();
        let (ny, nx) = (h as usize, w as usize);
        let mut volume = Array3::<u16>::zeros((ny, nx, self.n_z));
        copy_plane(&mut volume, 0, &first);
        for z in 1..self.n_z {
            let plane = self.load_plane(key, z)?;
            if plane.dimensions() != (w, h) {
                return Err(PipelineError::Corrupt {
                    path: self.plane_path(key, z),
                    reason: format!(
                        "plane is {:?}, expected {:?}",
                        plane.dimensions(),
                        (w, h)
                    ),
                });
            }
            copy_plane(&mut volume, z, &plane);
        }
        Ok(volume)
    }
}

fn copy_plane(volume: &mut Array3<u16>, z: usize, plane: &ImageBuffer<Luma<u16>, Vec<u16>>) {
    for (x, y, px) in plane.enumerate_pixels() {
        volume[[y as usize, x as usize, z]] = px.0[0];
    }
}

/// Write one z plane of a raw volume as a 16-bit PNG.
pub fn save_plane(path: &Path, volume: &Array3<u16>, z: usize) -> Result<()> {
    let (ny, nx, _) = volume.dim();
    let img = ImageBuffer::from_fn(nx as u32, ny as u32, |x, y| {
        Luma([volume[[y as usize, x as usize, z]]])
    });
    img.save(path).map_err(|source| PipelineError::Image {
        path: path.to_path_buf(),
        source,
    })
}
