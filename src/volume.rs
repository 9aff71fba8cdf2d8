use crate::enums::Orientation;
use crate::error::SvrError;
use crate::geometry::{Bounds, Vec3};
use crate::interpolator::Interpolator;

use image::{ImageBuffer, Luma};
use ndarray::{Array3, ArrayView2, Axis, s};
use rayon::prelude::*;

/// Axis-aligned isotropic output lattice. Voxel `(0, 0, 0)` is centered on
/// `origin_mm`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconstructionGrid {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub origin_mm: Vec3,
    pub voxel_size_mm: f64,
}

impl ReconstructionGrid {
    pub fn new(dims: (usize, usize, usize), origin_mm: Vec3, voxel_size_mm: f64) -> Self {
        Self {
            nx: dims.0,
            ny: dims.1,
            nz: dims.2,
            origin_mm,
            voxel_size_mm,
        }
    }

    /// `(nx, ny, nz)`
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.nx, self.ny, self.nz)
    }

    pub fn voxel_count(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.nx + z * self.nx * self.ny
    }

    /// Fractional voxel coordinate of a world point.
    #[inline]
    pub fn world_to_voxel(&self, p: &Vec3) -> Vec3 {
        (p - self.origin_mm) / self.voxel_size_mm
    }

    #[inline]
    pub fn voxel_to_world(&self, x: f64, y: f64, z: f64) -> Vec3 {
        self.origin_mm + Vec3::new(x, y, z) * self.voxel_size_mm
    }

    /// World box spanned by the voxel centers.
    pub fn bounds(&self) -> Bounds {
        Bounds::new(
            self.origin_mm,
            self.voxel_to_world(
                (self.nx - 1) as f64,
                (self.ny - 1) as f64,
                (self.nz - 1) as f64,
            ),
        )
    }
}

/// Dense reconstruction result. `data` is shaped `(nz, ny, nx)` so that its
/// standard layout is `x + y * nx + z * nx * ny`.
#[derive(Clone, Debug)]
pub struct Volume {
    pub grid: ReconstructionGrid,
    pub data: Array3<f32>,
}

impl Volume {
    pub fn zeros(grid: ReconstructionGrid) -> Self {
        Self {
            data: Array3::zeros((grid.nz, grid.ny, grid.nx)),
            grid,
        }
    }

    /// Wraps a flat buffer, checking it against the grid.
    pub fn from_vec(grid: ReconstructionGrid, data: Vec<f32>) -> Result<Self, SvrError> {
        let expected = grid.voxel_count();
        let actual = data.len();
        let data = Array3::from_shape_vec((grid.nz, grid.ny, grid.nx), data)
            .map_err(|_| SvrError::GridMismatch { expected, actual })?;
        Ok(Self { grid, data })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Flat voxel buffer.
    pub fn as_slice(&self) -> Result<&[f32], SvrError> {
        let expected = self.grid.voxel_count();
        let actual = self.data.len();
        self.data
            .as_slice()
            .filter(|d| d.len() == expected)
            .ok_or(SvrError::GridMismatch { expected, actual })
    }

    pub fn as_slice_mut(&mut self) -> Result<&mut [f32], SvrError> {
        let expected = self.grid.voxel_count();
        let actual = self.data.len();
        self.data
            .as_slice_mut()
            .filter(|d| d.len() == expected)
            .ok_or(SvrError::GridMismatch { expected, actual })
    }

    pub fn value(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    /// Trilinear read at a world point; 0 outside the grid.
    pub fn sample_world(&self, p: &Vec3) -> f32 {
        match self.data.as_slice() {
            Some(data) => {
                let v = self.grid.world_to_voxel(p);
                Interpolator::trilinear_sample(data, self.grid.dims(), v.x, v.y, v.z)
            }
            None => 0.0,
        }
    }

    /// Resamples onto `target`; voxels mapping outside this grid become 0.
    pub fn resample_to(&self, target: &ReconstructionGrid) -> Result<Volume, SvrError> {
        let src = self.as_slice()?;
        let src_grid = self.grid;
        let mut out = Volume::zeros(*target);
        let (nx, ny) = (target.nx, target.ny);

        out.data
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut plane)| {
                for y in 0..ny {
                    for x in 0..nx {
                        let world = target.voxel_to_world(x as f64, y as f64, z as f64);
                        let v = src_grid.world_to_voxel(&world);
                        plane[[y, x]] =
                            Interpolator::trilinear_sample(src, src_grid.dims(), v.x, v.y, v.z);
                    }
                }
            });

        Ok(out)
    }

    /// Mean squared difference over voxels, for grids of equal size.
    pub fn mean_squared_error(&self, other: &Volume) -> Result<f64, SvrError> {
        let a = self.as_slice()?;
        let b = other.as_slice()?;
        if a.len() != b.len() {
            return Err(SvrError::GridMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        let sum: f64 = a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum();
        Ok(sum / a.len().max(1) as f64)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    #[inline]
    fn normalize_to_u8(value: f32) -> u8 {
        (value * 255.0).round().clamp(0.0, 255.0) as u8
    }

    // Extract slice to image conversion
    fn slice_to_image(slice: &ArrayView2<'_, f32>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// 8-bit preview of one plane. Rows run along y (axial) or z (coronal,
    /// sagittal).
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, orientation)?;
        Self::slice_to_image(&slice)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn patterned(grid: ReconstructionGrid) -> Volume {
        let data = (0..grid.voxel_count())
            .map(|i| ((i * 7919) % 101) as f32 / 100.0)
            .collect();
        Volume::from_vec(grid, data).unwrap()
    }

    #[test]
    fn flat_layout_is_x_fastest() {
        let grid = ReconstructionGrid::new((3, 4, 5), Vec3::zeros(), 1.0);
        let v = patterned(grid);
        let flat = v.as_slice().unwrap();
        assert_eq!(flat[grid.index(2, 1, 3)], v.value(2, 1, 3));
        assert_eq!(v.dim(), (5, 4, 3));
    }

    #[test]
    fn wrong_buffer_length_is_rejected() {
        let grid = ReconstructionGrid::new((3, 3, 3), Vec3::zeros(), 1.0);
        assert!(matches!(
            Volume::from_vec(grid, vec![0.0; 26]),
            Err(SvrError::GridMismatch { expected: 27, actual: 26 })
        ));
    }

    #[test]
    fn resample_round_trip_reproduces_volume() {
        let a = ReconstructionGrid::new((6, 5, 4), Vec3::new(-3.0, 2.0, 10.0), 1.5);
        let b = ReconstructionGrid::new((6, 5, 4), Vec3::new(-3.0, 2.0, 10.0), 1.5);
        let original = patterned(a);
        let there = original.resample_to(&b).unwrap();
        let back = there.resample_to(&a).unwrap();
        for (x, y) in original.as_slice().unwrap().iter().zip(back.as_slice().unwrap()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn resample_outside_source_is_zero() {
        let a = ReconstructionGrid::new((4, 4, 4), Vec3::zeros(), 1.0);
        let b = ReconstructionGrid::new((4, 4, 4), Vec3::new(10.0, 0.0, 0.0), 1.0);
        let v = Volume::from_vec(a, vec![1.0; 64]).unwrap();
        let r = v.resample_to(&b).unwrap();
        assert!(r.as_slice().unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn sample_world_matches_voxel_centers() {
        let grid = ReconstructionGrid::new((4, 4, 4), Vec3::new(1.0, 1.0, 1.0), 2.0);
        let v = patterned(grid);
        let p = grid.voxel_to_world(1.0, 2.0, 3.0);
        assert_eq!(v.sample_world(&p), v.value(1, 2, 3));
    }

    #[test]
    fn axis_views_have_expected_shapes() {
        let grid = ReconstructionGrid::new((3, 4, 5), Vec3::zeros(), 1.0);
        let v = Volume::zeros(grid);
        assert_eq!(v.get_slice_from_axis(0, &Orientation::Axial).unwrap().dim(), (4, 3));
        assert_eq!(v.get_slice_from_axis(0, &Orientation::Coronal).unwrap().dim(), (5, 3));
        assert_eq!(v.get_slice_from_axis(2, &Orientation::Sagittal).unwrap().dim(), (5, 4));
        assert!(v.get_slice_from_axis(5, &Orientation::Axial).is_none());
    }

    #[test]
    fn preview_images_scale_unit_range() {
        let grid = ReconstructionGrid::new((3, 4, 5), Vec3::zeros(), 1.0);
        let mut v = Volume::zeros(grid);
        v.data[[2, 1, 0]] = 1.0;
        v.data[[2, 2, 0]] = 0.5;
        let image = v.get_image_from_axis(2, &Orientation::Axial).unwrap();
        assert_eq!(image.dimensions(), (3, 4));
        assert_eq!(image.get_pixel(0, 1).0, [255]);
        assert_eq!(image.get_pixel(0, 2).0, [128]);
        assert_eq!(image.get_pixel(1, 1).0, [0]);
        assert!(v.get_image_from_axis(3, &Orientation::Sagittal).is_none());
    }
}
