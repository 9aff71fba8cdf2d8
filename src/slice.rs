use ndarray::Array2;

use crate::geometry::{Bounds, Vec3};
use crate::rigid::{RigidTransform, orthonormalize};

/// One 2D observation positioned in patient space.
///
/// Pixel `(r, c)` sits at `ipp_mm + row_dir * r * row_spacing_mm +
/// col_dir * c * col_spacing_mm`. `row_dir`, `col_dir` and `normal_dir` are
/// kept a right-handed orthonormal basis.
#[derive(Clone, Debug)]
pub struct ReconstructionSlice {
    /// Intensities indexed `[row, col]`.
    pub pixels: Array2<f32>,
    pub ipp_mm: Vec3,
    pub row_dir: Vec3,
    pub col_dir: Vec3,
    pub normal_dir: Vec3,
    pub row_spacing_mm: f64,
    pub col_spacing_mm: f64,
    pub slice_thickness_mm: Option<f64>,
    pub spacing_between_slices_mm: Option<f64>,
}

impl ReconstructionSlice {
    /// Builds a slice, orthonormalizing the supplied directions. `None` when
    /// the directions are degenerate or a spacing is not positive.
    pub fn new(
        pixels: Array2<f32>,
        ipp_mm: Vec3,
        row_dir: Vec3,
        col_dir: Vec3,
        row_spacing_mm: f64,
        col_spacing_mm: f64,
    ) -> Option<Self> {
        if !(row_spacing_mm > 0.0 && col_spacing_mm > 0.0) {
            return None;
        }
        let (row_dir, col_dir, normal_dir) = orthonormalize(&row_dir, &col_dir)?;
        Some(Self {
            pixels,
            ipp_mm,
            row_dir,
            col_dir,
            normal_dir,
            row_spacing_mm,
            col_spacing_mm,
            slice_thickness_mm: None,
            spacing_between_slices_mm: None,
        })
    }

    pub fn with_thickness(mut self, thickness_mm: Option<f64>, spacing_mm: Option<f64>) -> Self {
        self.slice_thickness_mm = thickness_mm.filter(|t| *t > 0.0);
        self.spacing_between_slices_mm = spacing_mm.filter(|s| *s > 0.0);
        self
    }

    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    #[inline]
    pub fn world_at(&self, row: f64, col: f64) -> Vec3 {
        self.ipp_mm
            + self.row_dir * (row * self.row_spacing_mm)
            + self.col_dir * (col * self.col_spacing_mm)
    }

    /// Fractional `(row, col, offset along normal)` of a world point.
    #[inline]
    pub fn pixel_coords(&self, p: &Vec3) -> (f64, f64, f64) {
        let d = p - self.ipp_mm;
        (
            d.dot(&self.row_dir) / self.row_spacing_mm,
            d.dot(&self.col_dir) / self.col_spacing_mm,
            d.dot(&self.normal_dir),
        )
    }

    /// Physical extent along the normal: the thickness hint, then the
    /// inter-slice spacing, else 0 (an infinitely thin plane).
    pub fn effective_thickness_mm(&self) -> f64 {
        self.slice_thickness_mm
            .or(self.spacing_between_slices_mm)
            .unwrap_or(0.0)
    }

    pub fn min_pixel_spacing_mm(&self) -> f64 {
        self.row_spacing_mm.min(self.col_spacing_mm)
    }

    /// Box spanned by the four corner pixel centers.
    pub fn bounds(&self) -> Bounds {
        let (rows, cols) = self.dim();
        let r = rows.saturating_sub(1) as f64;
        let c = cols.saturating_sub(1) as f64;
        Bounds::from_points([
            self.world_at(0.0, 0.0),
            self.world_at(r, 0.0),
            self.world_at(0.0, c),
            self.world_at(r, c),
        ])
    }

    pub fn translate(&mut self, offset: &Vec3) {
        self.ipp_mm += offset;
    }

    /// Moves the slice rigidly and re-orthonormalizes its basis.
    pub fn apply_rigid(&mut self, transform: &RigidTransform) {
        self.ipp_mm = transform.apply_point(&self.ipp_mm);
        let row = transform.apply_direction(&self.row_dir);
        let col = transform.apply_direction(&self.col_dir);
        // A rotation cannot collapse an orthonormal pair.
        if let Some((row, col, normal)) = orthonormalize(&row, &col) {
            self.row_dir = row;
            self.col_dir = col;
            self.normal_dir = normal;
        }
    }
}

/// All slices of one acquired series.
#[derive(Clone, Debug, Default)]
pub struct SliceSeries {
    pub series_uid: String,
    pub slices: Vec<ReconstructionSlice>,
}

impl SliceSeries {
    pub fn new(series_uid: impl Into<String>, slices: Vec<ReconstructionSlice>) -> Self {
        Self {
            series_uid: series_uid.into(),
            slices,
        }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn bounds(&self) -> Bounds {
        self.slices
            .iter()
            .fold(Bounds::empty(), |acc, s| acc.union(&s.bounds()))
    }

    pub fn pixel_count(&self) -> usize {
        self.slices.iter().map(|s| s.pixels.len()).sum()
    }

    pub fn translate(&mut self, offset: &Vec3) {
        for slice in &mut self.slices {
            slice.translate(offset);
        }
    }

    pub fn apply_rigid(&mut self, transform: &RigidTransform) {
        for slice in &mut self.slices {
            slice.apply_rigid(transform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rigid::RigidParams;
    use approx::assert_relative_eq;

    fn axial(rows: usize, cols: usize) -> ReconstructionSlice {
        ReconstructionSlice::new(
            Array2::zeros((rows, cols)),
            Vec3::new(10.0, 20.0, 5.0),
            Vec3::y(),
            Vec3::x(),
            2.0,
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn world_and_pixel_coordinates_agree() {
        let s = axial(8, 16);
        let p = s.world_at(3.0, 7.0);
        assert_relative_eq!(p, Vec3::new(13.5, 26.0, 5.0));
        let (r, c, n) = s.pixel_coords(&p);
        assert_relative_eq!(r, 3.0);
        assert_relative_eq!(c, 7.0);
        assert_relative_eq!(n, 0.0);
    }

    #[test]
    fn basis_is_right_handed() {
        let s = axial(2, 2);
        assert_relative_eq!(s.normal_dir, Vec3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(s.row_dir.cross(&s.col_dir).dot(&s.normal_dir), 1.0);
    }

    #[test]
    fn rigid_update_keeps_basis_orthonormal() {
        let mut s = axial(4, 4);
        let params = RigidParams {
            tx: 1.0,
            rx: 0.2,
            ry: -0.1,
            rz: 0.35,
            ..Default::default()
        };
        s.apply_rigid(&RigidTransform::new(&params, Vec3::new(0.0, 0.0, 5.0)));
        assert_relative_eq!(s.row_dir.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(s.col_dir.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(s.row_dir.dot(&s.col_dir), 0.0, epsilon = 1e-12);
        assert_relative_eq!(s.normal_dir, s.row_dir.cross(&s.col_dir), epsilon = 1e-12);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        let px = Array2::zeros((2, 2));
        assert!(ReconstructionSlice::new(px.clone(), Vec3::zeros(), Vec3::x(), Vec3::x(), 1.0, 1.0).is_none());
        assert!(ReconstructionSlice::new(px, Vec3::zeros(), Vec3::x(), Vec3::y(), 0.0, 1.0).is_none());
    }

    #[test]
    fn thickness_falls_back_to_spacing() {
        let s = axial(2, 2).with_thickness(None, Some(3.0));
        assert_eq!(s.effective_thickness_mm(), 3.0);
        let s = axial(2, 2).with_thickness(Some(1.5), Some(3.0));
        assert_eq!(s.effective_thickness_mm(), 1.5);
        assert_eq!(axial(2, 2).effective_thickness_mm(), 0.0);
    }
}
