const EDGE_EPSILON: f64 = 1e-6;

/// Which upper edge counts as inside the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Support {
    /// Each axis in `[0, dim - 1)`: the eight corners are distinct voxels.
    Strict,
    /// Each axis in `[0, dim - 1]`: the coordinate's ceiling stays inside.
    Inclusive,
}

/// The eight voxels surrounding a fractional coordinate and their
/// interpolation weights. Weights sum to one.
#[derive(Clone, Copy, Debug)]
pub struct TrilinearStencil {
    pub indices: [usize; 8],
    pub weights: [f32; 8],
}

impl TrilinearStencil {
    #[inline]
    pub fn sample(&self, data: &[f32]) -> f32 {
        let mut acc = 0.0f32;
        for k in 0..8 {
            acc = data[self.indices[k]].mul_add(self.weights[k], acc);
        }
        acc
    }

    /// Distributes `value` over the eight voxels.
    #[inline]
    pub fn splat(&self, data: &mut [f32], value: f32) {
        for k in 0..8 {
            data[self.indices[k]] += value * self.weights[k];
        }
    }
}

pub struct Interpolator;

impl Interpolator {
    /// Builds the stencil for voxel coordinate `(x, y, z)` in a grid of
    /// `dims = (nx, ny, nz)` laid out as `x + y * nx + z * nx * ny`.
    ///
    /// Returns `None` outside the requested support.
    #[inline]
    pub fn stencil(
        dims: (usize, usize, usize),
        x: f64,
        y: f64,
        z: f64,
        support: Support,
    ) -> Option<TrilinearStencil> {
        let (nx, ny, nz) = dims;
        let (x0, fx) = Self::axis(x, nx, support)?;
        let (y0, fy) = Self::axis(y, ny, support)?;
        let (z0, fz) = Self::axis(z, nz, support)?;

        let (fx, fy, fz) = (fx as f32, fy as f32, fz as f32);
        let (gx, gy, gz) = (1.0 - fx, 1.0 - fy, 1.0 - fz);

        let plane = nx * ny;
        let base = x0 + y0 * nx + z0 * plane;

        Some(TrilinearStencil {
            indices: [
                base,
                base + 1,
                base + nx,
                base + nx + 1,
                base + plane,
                base + plane + 1,
                base + plane + nx,
                base + plane + nx + 1,
            ],
            weights: [
                gx * gy * gz,
                fx * gy * gz,
                gx * fy * gz,
                fx * fy * gz,
                gx * gy * fz,
                fx * gy * fz,
                gx * fy * fz,
                fx * fy * fz,
            ],
        })
    }

    // Lower corner and fraction along one axis.
    #[inline]
    fn axis(v: f64, dim: usize, support: Support) -> Option<(usize, f64)> {
        if dim < 2 || v.is_nan() {
            return None;
        }
        let upper = (dim - 1) as f64;
        let v = match support {
            Support::Strict if v >= 0.0 && v < upper => v,
            // Round-off from world/voxel conversions must not drop edge voxels.
            Support::Inclusive if v >= -EDGE_EPSILON && v <= upper + EDGE_EPSILON => {
                v.clamp(0.0, upper)
            }
            _ => return None,
        };
        let v0 = (v.floor() as usize).min(dim - 2);
        Some((v0, v - v0 as f64))
    }

    /// Trilinear read with inclusive support; 0 outside the grid.
    #[inline]
    pub fn trilinear_sample(data: &[f32], dims: (usize, usize, usize), x: f64, y: f64, z: f64) -> f32 {
        Self::stencil(dims, x, y, z, Support::Inclusive)
            .map(|s| s.sample(data))
            .unwrap_or(0.0)
    }

    /// Adds `value` to the eight voxels around `(x, y, z)`. Returns `false`
    /// and leaves `data` untouched outside strict support.
    #[inline]
    pub fn splat_trilinear(
        data: &mut [f32],
        dims: (usize, usize, usize),
        x: f64,
        y: f64,
        z: f64,
        value: f32,
    ) -> bool {
        match Self::stencil(dims, x, y, z, Support::Strict) {
            Some(s) => {
                s.splat(data, value);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(dims: (usize, usize, usize)) -> Vec<f32> {
        (0..dims.0 * dims.1 * dims.2).map(|i| i as f32 * 0.37 + 1.0).collect()
    }

    #[test]
    fn integer_coordinate_returns_voxel_exactly() {
        let dims = (4, 3, 5);
        let data = ramp(dims);
        for z in 0..dims.2 {
            for y in 0..dims.1 {
                for x in 0..dims.0 {
                    let idx = x + y * dims.0 + z * dims.0 * dims.1;
                    let v = Interpolator::trilinear_sample(&data, dims, x as f64, y as f64, z as f64);
                    assert_eq!(v, data[idx]);
                }
            }
        }
    }

    #[test]
    fn sampling_beyond_grid_returns_zero() {
        let dims = (4, 4, 4);
        let data = vec![1.0; 64];
        assert_eq!(Interpolator::trilinear_sample(&data, dims, 3.01, 1.0, 1.0), 0.0);
        assert_eq!(Interpolator::trilinear_sample(&data, dims, 1.0, -0.01, 1.0), 0.0);
        assert_eq!(Interpolator::trilinear_sample(&data, dims, 1.0, 1.0, f64::NAN), 0.0);
        assert_relative_eq!(Interpolator::trilinear_sample(&data, dims, 2.5, 2.5, 2.5), 1.0);
    }

    #[test]
    fn strict_support_excludes_upper_edge() {
        let dims = (3, 3, 3);
        assert!(Interpolator::stencil(dims, 2.0, 1.0, 1.0, Support::Strict).is_none());
        assert!(Interpolator::stencil(dims, 2.0, 1.0, 1.0, Support::Inclusive).is_some());
        assert!(Interpolator::stencil(dims, 1.999, 1.0, 1.0, Support::Strict).is_some());
    }

    #[test]
    fn splat_weights_sum_to_value() {
        let dims = (5, 5, 5);
        let mut data = vec![0.0f32; 125];
        assert!(Interpolator::splat_trilinear(&mut data, dims, 1.3, 2.7, 0.45, 1.0));
        assert_eq!(data.iter().filter(|v| **v > 0.0).count(), 8);
        assert_relative_eq!(data.iter().sum::<f32>(), 1.0, epsilon = 1e-6);

        let mut scaled = vec![0.0f32; 125];
        Interpolator::splat_trilinear(&mut scaled, dims, 3.9, 0.1, 2.5, 2.5);
        assert_relative_eq!(scaled.iter().sum::<f32>(), 2.5, epsilon = 1e-5);
    }

    #[test]
    fn splat_outside_support_is_ignored() {
        let dims = (3, 3, 3);
        let mut data = vec![0.0f32; 27];
        assert!(!Interpolator::splat_trilinear(&mut data, dims, 2.0, 0.5, 0.5, 1.0));
        assert!(data.iter().all(|v| *v == 0.0));
    }
}
