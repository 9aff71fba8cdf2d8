use std::collections::HashMap;

use log::{debug, warn};
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

use crate::enums::{ProgressPhase, SliceDownsampleMode};
use crate::error::SvrError;
use crate::geometry::Vec3;
use crate::progress::RunContext;
use crate::slice::{ReconstructionSlice, SliceSeries};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Image {0} not found")]
    NotFound(String),

    #[error("Image {image_id} is missing {attribute}")]
    MissingAttribute {
        image_id: String,
        attribute: &'static str,
    },

    #[error("Image {image_id} has {actual} pixels, expected {expected}")]
    PixelCountMismatch {
        image_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Image {0} has degenerate geometry")]
    InvalidGeometry(String),

    #[error("Pixel decoding failed for {image_id}: {reason}")]
    Decode { image_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Decoded pixels of one image, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelData {
    pub rows: usize,
    pub columns: usize,
    pub pixels: Vec<f32>,
}

/// Spatial metadata of one image as declared by its source.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceGeometry {
    pub row_spacing_mm: f64,
    pub col_spacing_mm: f64,
    pub ipp_mm: Vec3,
    /// World direction of +1 row.
    pub row_dir: Vec3,
    /// World direction of +1 column.
    pub col_dir: Vec3,
    pub slice_thickness_mm: Option<f64>,
    pub spacing_between_slices_mm: Option<f64>,
}

pub trait PixelSource {
    fn pixel_data(&self, image_id: &str) -> Result<PixelData, SourceError>;
}

pub trait GeometrySource {
    fn slice_geometry(&self, image_id: &str) -> Result<SliceGeometry, SourceError>;
}

/// One selected series: its UID and the images that make it up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeriesInput {
    pub series_uid: String,
    pub image_ids: Vec<String>,
}

/// Both collaborators backed by a map, for hosts that decode elsewhere.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    images: HashMap<String, (PixelData, SliceGeometry)>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: impl Into<String>, pixels: PixelData, geometry: SliceGeometry) {
        self.images.insert(image_id.into(), (pixels, geometry));
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl PixelSource for InMemorySource {
    fn pixel_data(&self, image_id: &str) -> Result<PixelData, SourceError> {
        self.images
            .get(image_id)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| SourceError::NotFound(image_id.to_string()))
    }
}

impl GeometrySource for InMemorySource {
    fn slice_geometry(&self, image_id: &str) -> Result<SliceGeometry, SourceError> {
        self.images
            .get(image_id)
            .map(|(_, g)| g.clone())
            .ok_or_else(|| SourceError::NotFound(image_id.to_string()))
    }
}

/// Turns source images into [`ReconstructionSlice`]s, applying the
/// downsampling policy.
pub struct SliceLoader {
    pub mode: SliceDownsampleMode,
    pub max_size: usize,
    pub target_voxel_size_mm: Option<f64>,
}

impl SliceLoader {
    pub fn new(mode: SliceDownsampleMode, max_size: usize, target_voxel_size_mm: Option<f64>) -> Self {
        Self {
            mode,
            max_size: max_size.max(1),
            target_voxel_size_mm,
        }
    }

    /// Loads every image of a series. Images that fail to load are logged
    /// and skipped; the returned series may be empty.
    pub fn load_series<S: PixelSource + GeometrySource + ?Sized>(
        &self,
        source: &S,
        input: &SeriesInput,
        ctx: &RunContext,
    ) -> Result<SliceSeries, SvrError> {
        let mut slices = Vec::with_capacity(input.image_ids.len());
        for image_id in &input.image_ids {
            ctx.check_cancelled()?;
            match self.load_slice(source, image_id) {
                Ok(slice) => slices.push(slice),
                Err(e) => warn!("Skipping image {image_id} of series {}: {e}", input.series_uid),
            }
        }

        // Order along the series normal so neighbours are adjacent.
        if let Some(normal) = slices.first().map(|s| s.normal_dir) {
            slices.sort_by(|a, b| {
                a.ipp_mm
                    .dot(&normal)
                    .partial_cmp(&b.ipp_mm.dot(&normal))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        debug!(
            "Loaded {}/{} slices of series {}",
            slices.len(),
            input.image_ids.len(),
            input.series_uid
        );
        ctx.report(
            ProgressPhase::Loading,
            slices.len(),
            input.image_ids.len(),
            format!("Loaded series {}", input.series_uid),
        );
        Ok(SliceSeries::new(input.series_uid.clone(), slices))
    }

    pub fn load_slice<S: PixelSource + GeometrySource + ?Sized>(
        &self,
        source: &S,
        image_id: &str,
    ) -> Result<ReconstructionSlice, SourceError> {
        let data = source.pixel_data(image_id)?;
        let geometry = source.slice_geometry(image_id)?;

        let expected = data.rows * data.columns;
        if expected == 0 || data.pixels.len() != expected {
            return Err(SourceError::PixelCountMismatch {
                image_id: image_id.to_string(),
                expected,
                actual: data.pixels.len(),
            });
        }

        let pixels: Vec<f32> = data
            .pixels
            .into_iter()
            .map(|v| if v.is_finite() { v } else { 0.0 })
            .collect();
        let pixels = Array2::from_shape_vec((data.rows, data.columns), pixels).map_err(|_| {
            SourceError::PixelCountMismatch {
                image_id: image_id.to_string(),
                expected,
                actual: expected,
            }
        })?;

        let factor = self.downsample_factor(data.rows, data.columns, &geometry);
        let (pixels, ipp_mm, row_spacing, col_spacing) = if factor > 1 {
            let half = (factor - 1) as f64 * 0.5;
            let ipp = geometry.ipp_mm
                + geometry.row_dir.normalize() * (half * geometry.row_spacing_mm)
                + geometry.col_dir.normalize() * (half * geometry.col_spacing_mm);
            (
                Self::downsample(&pixels.view(), factor),
                ipp,
                geometry.row_spacing_mm * factor as f64,
                geometry.col_spacing_mm * factor as f64,
            )
        } else {
            (
                pixels,
                geometry.ipp_mm,
                geometry.row_spacing_mm,
                geometry.col_spacing_mm,
            )
        };

        let slice = ReconstructionSlice::new(
            pixels,
            ipp_mm,
            geometry.row_dir,
            geometry.col_dir,
            row_spacing,
            col_spacing,
        )
        .ok_or_else(|| SourceError::InvalidGeometry(image_id.to_string()))?;

        Ok(slice.with_thickness(geometry.slice_thickness_mm, geometry.spacing_between_slices_mm))
    }

    /// Integer pixel-block size applied to both axes.
    pub fn downsample_factor(&self, rows: usize, columns: usize, geometry: &SliceGeometry) -> usize {
        let largest = rows.max(columns);
        let fixed = largest.div_ceil(self.max_size).max(1);

        match (self.mode, self.target_voxel_size_mm) {
            (SliceDownsampleMode::VoxelAware, Some(voxel)) => {
                let spacing = geometry.row_spacing_mm.min(geometry.col_spacing_mm);
                let voxel_aware = if spacing > 0.0 {
                    (voxel / spacing).floor().max(1.0) as usize
                } else {
                    1
                };
                fixed.max(voxel_aware)
            }
            _ => fixed,
        }
    }

    /// Block mean; edge blocks average the pixels they contain.
    pub fn downsample(pixels: &ArrayView2<f32>, factor: usize) -> Array2<f32> {
        let (rows, cols) = pixels.dim();
        let out_rows = rows.div_ceil(factor);
        let out_cols = cols.div_ceil(factor);
        Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
            let r0 = r * factor;
            let c0 = c * factor;
            let r1 = (r0 + factor).min(rows);
            let c1 = (c0 + factor).min(cols);
            let block = pixels.slice(ndarray::s![r0..r1, c0..c1]);
            block.sum() / block.len() as f32
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn geometry() -> SliceGeometry {
        SliceGeometry {
            row_spacing_mm: 0.5,
            col_spacing_mm: 0.5,
            ipp_mm: Vec3::zeros(),
            row_dir: Vec3::y(),
            col_dir: Vec3::x(),
            slice_thickness_mm: Some(3.0),
            spacing_between_slices_mm: None,
        }
    }

    fn source_with(rows: usize, cols: usize) -> InMemorySource {
        let mut source = InMemorySource::new();
        source.insert(
            "a",
            PixelData {
                rows,
                columns: cols,
                pixels: (0..rows * cols).map(|v| v as f32).collect(),
            },
            geometry(),
        );
        source
    }

    #[test]
    fn fixed_mode_caps_largest_dimension() {
        let loader = SliceLoader::new(SliceDownsampleMode::Fixed, 256, Some(4.0));
        assert_eq!(loader.downsample_factor(512, 300, &geometry()), 2);
        assert_eq!(loader.downsample_factor(200, 100, &geometry()), 1);
        assert_eq!(loader.downsample_factor(513, 10, &geometry()), 3);
    }

    #[test]
    fn voxel_aware_mode_follows_target_voxel() {
        let loader = SliceLoader::new(SliceDownsampleMode::VoxelAware, 1024, Some(2.0));
        assert_eq!(loader.downsample_factor(128, 128, &geometry()), 4);
        let loader = SliceLoader::new(SliceDownsampleMode::VoxelAware, 1024, None);
        assert_eq!(loader.downsample_factor(128, 128, &geometry()), 1);
    }

    #[test]
    fn block_mean_handles_partial_edges() {
        let px = array![[1.0f32, 3.0, 5.0], [1.0, 3.0, 7.0], [2.0, 2.0, 9.0]];
        let out = SliceLoader::downsample(&px.view(), 2);
        assert_eq!(out.dim(), (2, 2));
        assert_relative_eq!(out[[0, 0]], 2.0);
        assert_relative_eq!(out[[0, 1]], 6.0);
        assert_relative_eq!(out[[1, 0]], 2.0);
        assert_relative_eq!(out[[1, 1]], 9.0);
    }

    #[test]
    fn downsampled_slice_keeps_world_footprint() {
        let loader = SliceLoader::new(SliceDownsampleMode::Fixed, 4, None);
        let slice = loader.load_slice(&source_with(8, 8), "a").unwrap();
        assert_eq!(slice.dim(), (4, 4));
        assert_relative_eq!(slice.row_spacing_mm, 1.0);
        // First block center sits half a source pixel inside the corner.
        assert_relative_eq!(slice.ipp_mm, Vec3::new(0.25, 0.25, 0.0));
        assert_eq!(slice.slice_thickness_mm, Some(3.0));
    }

    #[test]
    fn broken_images_are_skipped() {
        let mut source = source_with(4, 4);
        source.insert(
            "short",
            PixelData {
                rows: 4,
                columns: 4,
                pixels: vec![0.0; 3],
            },
            geometry(),
        );
        let input = SeriesInput {
            series_uid: "s".into(),
            image_ids: vec!["a".into(), "short".into(), "missing".into()],
        };
        let loader = SliceLoader::new(SliceDownsampleMode::Fixed, 256, None);
        let series = loader.load_series(&source, &input, &RunContext::detached()).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn non_finite_pixels_become_zero() {
        let mut source = InMemorySource::new();
        source.insert(
            "nan",
            PixelData {
                rows: 1,
                columns: 2,
                pixels: vec![f32::NAN, 4.0],
            },
            geometry(),
        );
        let loader = SliceLoader::new(SliceDownsampleMode::Fixed, 256, None);
        let slice = loader.load_slice(&source, "nan").unwrap();
        assert_eq!(slice.pixels[[0, 0]], 0.0);
        assert_eq!(slice.pixels[[0, 1]], 4.0);
    }
}
