//! Synthetic inputs: analytic phantoms and stacks of thick slices sampled
//! from them.

use crate::enums::Orientation;
use crate::geometry::{Bounds, Vec3};
use crate::slice_loader::{InMemorySource, PixelData, SeriesInput, SliceGeometry};

/// An intensity field over patient space.
pub trait Phantom: Sync {
    fn intensity(&self, p: &Vec3) -> f32;
}

/// Constant intensity inside an axis-aligned box, zero outside.
#[derive(Clone, Copy, Debug)]
pub struct CubePhantom {
    pub bounds: Bounds,
    pub intensity: f32,
}

impl Phantom for CubePhantom {
    fn intensity(&self, p: &Vec3) -> f32 {
        if self.bounds.contains(p) { self.intensity } else { 0.0 }
    }
}

/// Gaussian-profiled ellipsoid on top of an optional background.
#[derive(Clone, Copy, Debug)]
pub struct BlobPhantom {
    pub center: Vec3,
    pub radii_mm: Vec3,
    pub peak: f32,
    pub background: f32,
}

impl Phantom for BlobPhantom {
    fn intensity(&self, p: &Vec3) -> f32 {
        let d = (p - self.center).component_div(&self.radii_mm);
        self.background + self.peak * (-d.norm_squared()).exp() as f32
    }
}

/// Sum of several phantoms.
pub struct CompositePhantom(pub Vec<Box<dyn Phantom>>);

impl Phantom for CompositePhantom {
    fn intensity(&self, p: &Vec3) -> f32 {
        self.0.iter().map(|ph| ph.intensity(p)).sum()
    }
}

/// Layout of one synthetic series.
#[derive(Clone, Debug)]
pub struct StackSpec {
    pub series_uid: String,
    pub orientation: Orientation,
    /// World position of pixel (0, 0) of the first slice.
    pub origin_mm: Vec3,
    pub rows: usize,
    pub cols: usize,
    pub slices: usize,
    pub pixel_spacing_mm: f64,
    pub slice_spacing_mm: f64,
    pub thickness_mm: f64,
    /// Points averaged across the thickness of each pixel.
    pub thickness_samples: usize,
}

impl StackSpec {
    /// A stack covering `bounds` in the given orientation.
    pub fn covering(
        series_uid: impl Into<String>,
        orientation: Orientation,
        bounds: &Bounds,
        pixel_spacing_mm: f64,
        slice_spacing_mm: f64,
        thickness_mm: f64,
    ) -> Self {
        let (row_axis, col_axis, slice_axis) = axes(orientation);
        let extent = bounds.extent();
        let count = |len: f64, step: f64| (len / step).floor() as usize + 1;
        Self {
            series_uid: series_uid.into(),
            orientation,
            origin_mm: bounds.min,
            rows: count(extent.dot(&row_axis), pixel_spacing_mm),
            cols: count(extent.dot(&col_axis), pixel_spacing_mm),
            slices: count(extent.dot(&slice_axis), slice_spacing_mm),
            pixel_spacing_mm,
            slice_spacing_mm,
            thickness_mm,
            thickness_samples: 5,
        }
    }

    pub fn with_origin(mut self, origin_mm: Vec3) -> Self {
        self.origin_mm = origin_mm;
        self
    }
}

/// `(row_dir, col_dir, stacking direction)` of each orientation.
fn axes(orientation: Orientation) -> (Vec3, Vec3, Vec3) {
    match orientation {
        Orientation::Axial => (Vec3::y(), Vec3::x(), Vec3::z()),
        Orientation::Coronal => (Vec3::z(), Vec3::x(), Vec3::y()),
        Orientation::Sagittal => (Vec3::z(), Vec3::y(), Vec3::x()),
    }
}

/// Samples `phantom` into `source` and returns the series description.
pub fn synthesize_stack(phantom: &dyn Phantom, stack: &StackSpec, source: &mut InMemorySource) -> SeriesInput {
    let (row_dir, col_dir, step_dir) = axes(stack.orientation);
    let n = stack.thickness_samples.max(1);
    let offsets: Vec<f64> = if stack.thickness_mm > 0.0 && n > 1 {
        (0..n)
            .map(|i| -0.5 * stack.thickness_mm + stack.thickness_mm * (i as f64 + 0.5) / n as f64)
            .collect()
    } else {
        vec![0.0]
    };

    let mut image_ids = Vec::with_capacity(stack.slices);
    for k in 0..stack.slices {
        let ipp = stack.origin_mm + step_dir * (k as f64 * stack.slice_spacing_mm);
        let mut pixels = Vec::with_capacity(stack.rows * stack.cols);
        for r in 0..stack.rows {
            for c in 0..stack.cols {
                let p = ipp
                    + row_dir * (r as f64 * stack.pixel_spacing_mm)
                    + col_dir * (c as f64 * stack.pixel_spacing_mm);
                let sum: f32 = offsets.iter().map(|o| phantom.intensity(&(p + step_dir * *o))).sum();
                pixels.push(sum / offsets.len() as f32);
            }
        }

        let image_id = format!("{}/{k}", stack.series_uid);
        source.insert(
            image_id.clone(),
            PixelData {
                rows: stack.rows,
                columns: stack.cols,
                pixels,
            },
            SliceGeometry {
                row_spacing_mm: stack.pixel_spacing_mm,
                col_spacing_mm: stack.pixel_spacing_mm,
                ipp_mm: ipp,
                row_dir,
                col_dir,
                slice_thickness_mm: (stack.thickness_mm > 0.0).then_some(stack.thickness_mm),
                spacing_between_slices_mm: Some(stack.slice_spacing_mm),
            },
        );
        image_ids.push(image_id);
    }

    SeriesInput {
        series_uid: stack.series_uid.clone(),
        image_ids,
    }
}

/// Axial, coronal and sagittal stacks of `phantom` over `bounds`.
pub fn orthogonal_stacks(
    phantom: &dyn Phantom,
    bounds: &Bounds,
    pixel_spacing_mm: f64,
    slice_spacing_mm: f64,
    thickness_mm: f64,
) -> (InMemorySource, Vec<SeriesInput>) {
    let mut source = InMemorySource::new();
    let inputs = [
        ("axial", Orientation::Axial),
        ("coronal", Orientation::Coronal),
        ("sagittal", Orientation::Sagittal),
    ]
    .into_iter()
    .map(|(uid, orientation)| {
        let stack =
            StackSpec::covering(uid, orientation, bounds, pixel_spacing_mm, slice_spacing_mm, thickness_mm);
        synthesize_stack(phantom, &stack, &mut source)
    })
    .collect();
    (source, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice_loader::{GeometrySource, PixelSource};

    #[test]
    fn stacks_cover_the_requested_box() {
        let bounds = Bounds::new(Vec3::zeros(), Vec3::new(10.0, 20.0, 30.0));
        let stack = StackSpec::covering("c", Orientation::Coronal, &bounds, 1.0, 2.0, 2.0);
        // Rows along z, columns along x, slices along y.
        assert_eq!((stack.rows, stack.cols, stack.slices), (31, 11, 11));
    }

    #[test]
    fn synthesized_pixels_follow_the_phantom() {
        let cube = CubePhantom {
            bounds: Bounds::new(Vec3::repeat(2.0), Vec3::repeat(6.0)),
            intensity: 100.0,
        };
        let bounds = Bounds::new(Vec3::zeros(), Vec3::repeat(8.0));
        let mut source = InMemorySource::new();
        let stack = StackSpec {
            thickness_samples: 1,
            ..StackSpec::covering("a", Orientation::Axial, &bounds, 1.0, 1.0, 0.0)
        };
        let input = synthesize_stack(&cube, &stack, &mut source);
        assert_eq!(input.image_ids.len(), 9);
        assert_eq!(source.len(), 9);

        let data = source.pixel_data(&input.image_ids[4]).unwrap();
        let geometry = source.slice_geometry(&input.image_ids[4]).unwrap();
        assert_eq!(geometry.ipp_mm, Vec3::new(0.0, 0.0, 4.0));
        assert_eq!(data.pixels[3 * data.columns + 4], 100.0);
        assert_eq!(data.pixels[0], 0.0);
        assert_eq!(geometry.slice_thickness_mm, None);
    }

    #[test]
    fn thick_slices_average_across_edges() {
        let cube = CubePhantom {
            bounds: Bounds::new(Vec3::new(-10.0, -10.0, 0.0), Vec3::new(10.0, 10.0, 10.0)),
            intensity: 1.0,
        };
        let stack = StackSpec {
            series_uid: "edge".into(),
            orientation: Orientation::Axial,
            origin_mm: Vec3::zeros(),
            rows: 1,
            cols: 1,
            slices: 1,
            pixel_spacing_mm: 1.0,
            slice_spacing_mm: 4.0,
            thickness_mm: 4.0,
            thickness_samples: 4,
        };
        let mut source = InMemorySource::new();
        let input = synthesize_stack(&cube, &stack, &mut source);
        let data = source.pixel_data(&input.image_ids[0]).unwrap();
        assert_eq!(data.pixels, vec![0.5]);
    }

    #[test]
    fn blob_peaks_at_center() {
        let blob = BlobPhantom {
            center: Vec3::new(5.0, 5.0, 5.0),
            radii_mm: Vec3::new(3.0, 2.0, 4.0),
            peak: 2.0,
            background: 0.5,
        };
        assert_eq!(blob.intensity(&blob.center), 2.5);
        assert!(blob.intensity(&Vec3::zeros()) < 0.6);
    }

    #[test]
    fn orthogonal_stacks_share_one_source() {
        let cube = CubePhantom {
            bounds: Bounds::new(Vec3::zeros(), Vec3::repeat(4.0)),
            intensity: 1.0,
        };
        let (source, inputs) = orthogonal_stacks(&cube, &Bounds::new(Vec3::zeros(), Vec3::repeat(4.0)), 1.0, 2.0, 2.0);
        assert_eq!(inputs.len(), 3);
        assert_eq!(source.len(), 9);
    }
}
