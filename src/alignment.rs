//! Reference-series selection and bounding-box-center alignment.

use log::{debug, warn};

use crate::config::RoiOptions;
use crate::geometry::Vec3;
use crate::slice::SliceSeries;

/// Shifts above this magnitude are reported as suspicious.
pub const LARGE_SHIFT_WARN_MM: f64 = 50.0;

/// Index of the reference series: the series the ROI was drawn on if it is
/// loaded, otherwise the series with the most slices (first on ties).
pub fn select_reference(series: &[SliceSeries], roi: Option<&RoiOptions>) -> Option<usize> {
    let from_roi = roi
        .and_then(|r| r.source_series_uid.as_deref())
        .and_then(|uid| series.iter().position(|s| s.series_uid == uid && !s.is_empty()));
    if from_roi.is_some() {
        return from_roi;
    }

    let mut best: Option<usize> = None;
    for (i, s) in series.iter().enumerate() {
        if s.is_empty() {
            continue;
        }
        if best.is_none_or(|b| s.len() > series[b].len()) {
            best = Some(i);
        }
    }
    best
}

/// Translates every non-reference series so its bounding-box center lands
/// on the reference center. Returns the applied shift per series (zero for
/// the reference and for empty series).
pub fn align_bounds_centers(series: &mut [SliceSeries], reference: usize) -> Vec<Vec3> {
    let mut shifts = vec![Vec3::zeros(); series.len()];
    let Some(target) = series.get(reference).map(|s| s.bounds().center()) else {
        return shifts;
    };

    for (i, s) in series.iter_mut().enumerate() {
        if i == reference || s.is_empty() {
            continue;
        }
        let shift = target - s.bounds().center();
        let magnitude = shift.norm();
        if magnitude > LARGE_SHIFT_WARN_MM {
            warn!(
                "Series {} shifted by {magnitude:.1} mm to match the reference center",
                s.series_uid
            );
        } else {
            debug!("Series {} shifted by {magnitude:.2} mm", s.series_uid);
        }
        s.translate(&shift);
        shifts[i] = shift;
    }
    shifts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{Orientation, RoiMode};
    use crate::geometry::BoundsMm;
    use crate::slice::ReconstructionSlice;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn stack(uid: &str, count: usize, origin: Vec3) -> SliceSeries {
        let slices = (0..count)
            .map(|k| {
                ReconstructionSlice::new(
                    Array2::zeros((5, 5)),
                    origin + Vec3::new(0.0, 0.0, k as f64),
                    Vec3::y(),
                    Vec3::x(),
                    1.0,
                    1.0,
                )
                .unwrap()
            })
            .collect();
        SliceSeries::new(uid, slices)
    }

    fn roi(uid: Option<&str>) -> RoiOptions {
        RoiOptions {
            mode: RoiMode::Hard,
            bounds_mm: BoundsMm {
                min: [0.0; 3],
                max: [1.0; 3],
            },
            source_series_uid: uid.map(str::to_string),
            source_plane: Orientation::Axial,
        }
    }

    #[test]
    fn reference_prefers_roi_source_series() {
        let series = vec![stack("a", 3, Vec3::zeros()), stack("b", 9, Vec3::zeros())];
        assert_eq!(select_reference(&series, Some(&roi(Some("a")))), Some(0));
        assert_eq!(select_reference(&series, Some(&roi(Some("zz")))), Some(1));
        assert_eq!(select_reference(&series, None), Some(1));
        assert_eq!(select_reference(&[], None), None);
    }

    #[test]
    fn ties_keep_first_series() {
        let series = vec![stack("a", 4, Vec3::zeros()), stack("b", 4, Vec3::zeros())];
        assert_eq!(select_reference(&series, None), Some(0));
    }

    #[test]
    fn centers_are_matched_by_translation() {
        let mut series = vec![
            stack("ref", 5, Vec3::zeros()),
            stack("moved", 5, Vec3::new(12.0, -3.0, 4.0)),
        ];
        let shifts = align_bounds_centers(&mut series, 0);
        assert_eq!(shifts[0], Vec3::zeros());
        assert_relative_eq!(shifts[1], Vec3::new(-12.0, 3.0, -4.0));
        assert_relative_eq!(series[0].bounds().center(), series[1].bounds().center());
        // Orientation untouched.
        assert_eq!(series[1].slices[0].row_dir, Vec3::y());
    }
}
