//! Trims slices to the region that can influence the output grid.

use log::debug;
use ndarray::s;

use crate::geometry::Bounds;
use crate::slice::{ReconstructionSlice, SliceSeries};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CropOutcome {
    /// The slice now holds only the pixels overlapping the bounds.
    Included { rows: usize, cols: usize },
    /// The slice misses the bounds and was left untouched.
    NotIncluded,
}

/// Crops `slice` to `bounds`.
///
/// The slice plane must lie within `tolerance_mm` of the slab spanned by the
/// box along the slice normal, and the box must project onto the pixel grid.
pub fn crop_slice(slice: &mut ReconstructionSlice, bounds: &Bounds, tolerance_mm: f64) -> CropOutcome {
    let corners = bounds.corners();
    let (rows, cols) = slice.dim();
    if rows == 0 || cols == 0 {
        return CropOutcome::NotIncluded;
    }

    let mut r_min = f64::INFINITY;
    let mut r_max = f64::NEG_INFINITY;
    let mut c_min = f64::INFINITY;
    let mut c_max = f64::NEG_INFINITY;
    let mut n_min = f64::INFINITY;
    let mut n_max = f64::NEG_INFINITY;
    for corner in &corners {
        let (r, c, n) = slice.pixel_coords(corner);
        r_min = r_min.min(r);
        r_max = r_max.max(r);
        c_min = c_min.min(c);
        c_max = c_max.max(c);
        n_min = n_min.min(n);
        n_max = n_max.max(n);
    }

    if n_min > tolerance_mm || n_max < -tolerance_mm {
        return CropOutcome::NotIncluded;
    }

    let last_row = (rows - 1) as f64;
    let last_col = (cols - 1) as f64;
    let r0 = (r_min.floor() - 1.0).max(0.0);
    let r1 = (r_max.ceil() + 1.0).min(last_row);
    let c0 = (c_min.floor() - 1.0).max(0.0);
    let c1 = (c_max.ceil() + 1.0).min(last_col);
    if r0 > r1 || c0 > c1 {
        return CropOutcome::NotIncluded;
    }

    let (r0, r1, c0, c1) = (r0 as usize, r1 as usize, c0 as usize, c1 as usize);
    if r0 > 0 || c0 > 0 || r1 + 1 < rows || c1 + 1 < cols {
        slice.ipp_mm = slice.world_at(r0 as f64, c0 as f64);
        slice.pixels = slice.pixels.slice(s![r0..=r1, c0..=c1]).to_owned();
    }

    let (rows, cols) = slice.dim();
    CropOutcome::Included { rows, cols }
}

/// Crops every slice of every series and drops those not included.
/// Returns the number of slices kept.
pub fn crop_series(
    series: &mut [SliceSeries],
    bounds: &Bounds,
    tolerance_mm: impl Fn(&ReconstructionSlice) -> f64,
) -> usize {
    let mut kept = 0;
    for s in series.iter_mut() {
        let before = s.len();
        s.slices
            .retain_mut(|slice| {
                let tol = tolerance_mm(slice);
                !matches!(crop_slice(slice, bounds, tol), CropOutcome::NotIncluded)
            });
        debug!("Series {}: kept {}/{} slices after cropping", s.series_uid, s.len(), before);
        kept += s.len();
    }
    kept
}
