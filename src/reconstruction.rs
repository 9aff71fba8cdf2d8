//! Forward/backward-projection solver.
//!
//! Every slice pixel observes the volume through a short point-spread
//! kernel along the slice normal, each kernel tap reading (or writing) the
//! volume trilinearly. The initial estimate is the normalized splat of all
//! positive observations; refinement iterates
//! forward projection → robust residual → backprojection → update.
//!
//! Accumulation order is fixed (slice order, then row-major pixels), so a
//! run is bitwise reproducible.

use log::debug;
use rayon::prelude::*;
use web_time::Instant;

use crate::config::SolverOptions;
use crate::enums::{ProgressPhase, PsfMode, RobustLoss};
use crate::error::SvrError;
use crate::geometry::Vec3;
use crate::interpolator::{Interpolator, Support, TrilinearStencil};
use crate::progress::RunContext;
use crate::slice::ReconstructionSlice;
use crate::volume::{ReconstructionGrid, Volume};

pub const PSF_MIN_SAMPLES: usize = 1;
pub const PSF_MAX_SAMPLES: usize = 7;
/// Accumulated weights at or below this count as "no data".
pub const WEIGHT_EPSILON: f32 = 1e-6;

/// Taps of a slice profile along its normal. Weights sum to one.
#[derive(Clone, Debug, PartialEq)]
pub struct PsfKernel {
    pub offsets_mm: Vec<f64>,
    pub weights: Vec<f32>,
}

impl PsfKernel {
    pub fn single() -> Self {
        Self {
            offsets_mm: vec![0.0],
            weights: vec![1.0],
        }
    }

    /// Kernel for a slice of `thickness_mm` on a grid of `voxel_size_mm`:
    /// roughly one tap per voxel across the thickness, odd, within
    /// [`PSF_MIN_SAMPLES`, `PSF_MAX_SAMPLES`].
    pub fn for_slice(mode: PsfMode, thickness_mm: f64, voxel_size_mm: f64) -> Self {
        if mode == PsfMode::None || !(thickness_mm > 0.0) || !(voxel_size_mm > 0.0) {
            return Self::single();
        }
        let mut samples = (thickness_mm / voxel_size_mm).ceil() as usize;
        if samples % 2 == 0 {
            samples += 1;
        }
        Self::with_samples(mode, thickness_mm, samples)
    }

    /// `samples` taps at the centers of equal sub-intervals of the
    /// thickness. Even counts are rounded up to odd.
    pub fn with_samples(mode: PsfMode, thickness_mm: f64, samples: usize) -> Self {
        let mut n = samples.clamp(PSF_MIN_SAMPLES, PSF_MAX_SAMPLES);
        if n % 2 == 0 {
            n += 1;
        }
        if mode == PsfMode::None || n == 1 || !(thickness_mm > 0.0) {
            return Self::single();
        }

        let offsets_mm: Vec<f64> = (0..n)
            .map(|i| -0.5 * thickness_mm + thickness_mm * (i as f64 + 0.5) / n as f64)
            .collect();
        let raw: Vec<f64> = match mode {
            PsfMode::Gaussian => {
                // FWHM equal to the slice thickness.
                let sigma = thickness_mm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
                offsets_mm
                    .iter()
                    .map(|o| (-0.5 * (o / sigma).powi(2)).exp())
                    .collect()
            }
            _ => vec![1.0; n],
        };
        let total: f64 = raw.iter().sum();
        Self {
            offsets_mm,
            weights: raw.iter().map(|w| (w / total) as f32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Weight applied to a residual before backprojection.
#[inline]
pub fn robust_weight(loss: RobustLoss, residual: f32, delta: f32) -> f32 {
    let a = residual.abs();
    match loss {
        RobustLoss::None => 1.0,
        RobustLoss::Huber => {
            if a <= delta {
                1.0
            } else {
                delta / a
            }
        }
        RobustLoss::Tukey => {
            if a >= delta {
                0.0
            } else {
                let u = residual / delta;
                let t = 1.0 - u * u;
                t * t
            }
        }
    }
}

/// Maps a slice's pixels to voxel coordinates of one grid.
struct SliceProjector {
    origin: Vec3,
    step_row: Vec3,
    step_col: Vec3,
    taps: Vec<(Vec3, f32)>,
}

impl SliceProjector {
    fn new(slice: &ReconstructionSlice, grid: &ReconstructionGrid, psf_mode: PsfMode) -> Self {
        let inv = 1.0 / grid.voxel_size_mm;
        let kernel = PsfKernel::for_slice(psf_mode, slice.effective_thickness_mm(), grid.voxel_size_mm);
        Self {
            origin: grid.world_to_voxel(&slice.ipp_mm),
            step_row: slice.row_dir * (slice.row_spacing_mm * inv),
            step_col: slice.col_dir * (slice.col_spacing_mm * inv),
            taps: kernel
                .offsets_mm
                .iter()
                .zip(&kernel.weights)
                .map(|(o, w)| (slice.normal_dir * (o * inv), *w))
                .collect(),
        }
    }

    /// Collects the in-support taps of pixel `(row, col)`; returns their
    /// total weight.
    #[inline]
    fn stencils(
        &self,
        dims: (usize, usize, usize),
        row: usize,
        col: usize,
        out: &mut Vec<(TrilinearStencil, f32)>,
    ) -> f32 {
        out.clear();
        let center = self.origin + self.step_row * row as f64 + self.step_col * col as f64;
        let mut used = 0.0;
        for (offset, w) in &self.taps {
            let v = center + offset;
            if let Some(s) = Interpolator::stencil(dims, v.x, v.y, v.z, Support::Strict) {
                out.push((s, *w));
                used += w;
            }
        }
        used
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), SvrError> {
    if expected != actual {
        return Err(SvrError::GridMismatch { expected, actual });
    }
    Ok(())
}

/// Full solve: initial estimate followed by `options.iterations` rounds of
/// refinement.
pub fn reconstruct(
    slices: &[&ReconstructionSlice],
    grid: &ReconstructionGrid,
    options: &SolverOptions,
    ctx: &RunContext,
) -> Result<Volume, SvrError> {
    let (mut volume, weights) = initial_estimate(slices, grid, options, ctx)?;
    if options.iterations > 0 {
        refine_with_buffer(&mut volume, slices, options, options.iterations, weights, ctx)?;
    }
    Ok(volume)
}

/// Normalized splat of every positive observation. Returns the volume and
/// the weight buffer for reuse by refinement.
pub fn initial_estimate(
    slices: &[&ReconstructionSlice],
    grid: &ReconstructionGrid,
    options: &SolverOptions,
    ctx: &RunContext,
) -> Result<(Volume, Vec<f32>), SvrError> {
    let started = Instant::now();
    let mut volume = Volume::zeros(*grid);
    let mut weights = vec![0.0f32; grid.voxel_count()];
    let dims = grid.dims();
    let mut taps = Vec::with_capacity(PSF_MAX_SAMPLES);

    {
        let values = volume.as_slice_mut()?;
        check_len(values.len(), weights.len())?;

        for (i, slice) in slices.iter().enumerate() {
            ctx.check_cancelled()?;
            let projector = SliceProjector::new(slice, grid, options.psf_mode);
            for ((row, col), &observed) in slice.pixels.indexed_iter() {
                if !(observed > 0.0) {
                    continue;
                }
                projector.stencils(dims, row, col, &mut taps);
                for (stencil, w) in &taps {
                    stencil.splat(values, observed * w);
                    stencil.splat(&mut weights, *w);
                }
            }
            if i % 16 == 15 {
                ctx.report(ProgressPhase::Reconstructing, i + 1, slices.len(), "Splatting slices");
            }
        }

        values
            .par_iter_mut()
            .zip(weights.par_iter())
            .for_each(|(v, w)| *v = if *w > WEIGHT_EPSILON { *v / *w } else { 0.0 });
    }

    debug!(
        "Initial estimate of {} voxels from {} slices in {:?}",
        grid.voxel_count(),
        slices.len(),
        started.elapsed()
    );
    Ok((volume, weights))
}

/// Refines `volume` in place without re-splatting.
pub fn refine(
    volume: &mut Volume,
    slices: &[&ReconstructionSlice],
    options: &SolverOptions,
    iterations: usize,
    ctx: &RunContext,
) -> Result<(), SvrError> {
    let weights = vec![0.0f32; volume.grid.voxel_count()];
    refine_with_buffer(volume, slices, options, iterations, weights, ctx)
}

fn refine_with_buffer(
    volume: &mut Volume,
    slices: &[&ReconstructionSlice],
    options: &SolverOptions,
    iterations: usize,
    mut weights: Vec<f32>,
    ctx: &RunContext,
) -> Result<(), SvrError> {
    let grid = volume.grid;
    let dims = grid.dims();
    let projectors: Vec<SliceProjector> = slices
        .iter()
        .map(|s| SliceProjector::new(s, &grid, options.psf_mode))
        .collect();
    let mut update = vec![0.0f32; grid.voxel_count()];
    let mut taps = Vec::with_capacity(PSF_MAX_SAMPLES);

    let values = volume.as_slice_mut()?;
    check_len(values.len(), weights.len())?;

    for iteration in 0..iterations {
        ctx.check_cancelled()?;
        let started = Instant::now();
        update.fill(0.0);
        weights.fill(0.0);
        let mut loss = 0.0f64;
        let mut observed_pixels = 0usize;

        for (slice, projector) in slices.iter().zip(&projectors) {
            ctx.check_cancelled()?;
            for ((row, col), &observed) in slice.pixels.indexed_iter() {
                let used = projector.stencils(dims, row, col, &mut taps);
                if used <= WEIGHT_EPSILON {
                    continue;
                }
                let predicted = taps
                    .iter()
                    .map(|(s, w)| s.sample(values) * w)
                    .sum::<f32>()
                    / used;
                let residual = observed - predicted;
                loss += (residual * residual) as f64;
                observed_pixels += 1;

                let rw = robust_weight(options.robust_loss, residual, options.robust_delta);
                for (stencil, w) in &taps {
                    let share = w / used;
                    stencil.splat(&mut update, share * rw * residual);
                    stencil.splat(&mut weights, share);
                }
            }
        }

        let step = options.step_size;
        let clamp = options.clamp_output;
        values
            .par_iter_mut()
            .zip(update.par_iter())
            .zip(weights.par_iter())
            .for_each(|((v, u), w)| {
                if *w > WEIGHT_EPSILON {
                    *v += step * *u / *w;
                    if clamp {
                        *v = v.clamp(0.0, 1.0);
                    }
                }
            });

        if options.laplacian_weight > 0.0 {
            smooth_laplacian(values, &mut update, dims, options.laplacian_weight, clamp);
        }

        debug!(
            "Iteration {}/{iterations}: rmse {:.5} over {observed_pixels} pixels in {:?}",
            iteration + 1,
            (loss / observed_pixels.max(1) as f64).sqrt(),
            started.elapsed()
        );
        ctx.report(
            ProgressPhase::Reconstructing,
            iteration + 1,
            iterations,
            format!("Refinement iteration {}/{iterations}", iteration + 1),
        );
    }
    Ok(())
}

/// One explicit step of `v += weight * ∇²v` on interior voxels. `scratch`
/// must be as long as `values`.
pub fn smooth_laplacian(
    values: &mut [f32],
    scratch: &mut [f32],
    dims: (usize, usize, usize),
    weight: f32,
    clamp: bool,
) {
    let (nx, ny, nz) = dims;
    if nx < 3 || ny < 3 || nz < 3 {
        return;
    }
    scratch.copy_from_slice(values);
    let src: &[f32] = scratch;
    let plane = nx * ny;

    values
        .par_chunks_mut(plane)
        .enumerate()
        .filter(|(z, _)| *z > 0 && *z < nz - 1)
        .for_each(|(z, out)| {
            for y in 1..ny - 1 {
                for x in 1..nx - 1 {
                    let i = x + y * nx;
                    let g = z * plane + i;
                    let center = src[g];
                    let lap = src[g - 1] + src[g + 1] + src[g - nx] + src[g + nx]
                        + src[g - plane]
                        + src[g + plane]
                        - 6.0 * center;
                    let v = center + weight * lap;
                    out[i] = if clamp { v.clamp(0.0, 1.0) } else { v };
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn psf_kernels_are_normalized_and_odd() {
        for mode in [PsfMode::Box, PsfMode::Gaussian] {
            for n in 0..10 {
                let k = PsfKernel::with_samples(mode, 3.0, n);
                assert_eq!(k.len() % 2, 1);
                assert!(k.len() <= PSF_MAX_SAMPLES);
                assert_relative_eq!(k.weights.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
            }
        }
        assert_eq!(PsfKernel::with_samples(PsfMode::None, 3.0, 5), PsfKernel::single());
    }

    #[test]
    fn psf_taps_span_the_thickness() {
        let k = PsfKernel::with_samples(PsfMode::Box, 4.0, 5);
        assert_relative_eq!(k.offsets_mm[0], -1.6, epsilon = 1e-12);
        assert_relative_eq!(k.offsets_mm[2], 0.0, epsilon = 1e-12);
        assert_relative_eq!(k.offsets_mm[4], 1.6, epsilon = 1e-12);
        assert!(k.weights.iter().all(|w| (*w - 0.2).abs() < 1e-6));

        let g = PsfKernel::with_samples(PsfMode::Gaussian, 4.0, 5);
        assert!(g.weights[2] > g.weights[1] && g.weights[1] > g.weights[0]);
        assert_relative_eq!(g.weights[0], g.weights[4]);
    }

    #[test]
    fn psf_sample_count_follows_voxel_size() {
        assert_eq!(PsfKernel::for_slice(PsfMode::Box, 4.0, 1.0).len(), 5);
        assert_eq!(PsfKernel::for_slice(PsfMode::Box, 0.5, 1.0).len(), 1);
        assert_eq!(PsfKernel::for_slice(PsfMode::Box, 40.0, 1.0).len(), 7);
        assert_eq!(PsfKernel::for_slice(PsfMode::Gaussian, 0.0, 1.0).len(), 1);
    }

    #[test]
    fn robust_weights_match_definitions() {
        assert_eq!(robust_weight(RobustLoss::None, 9.0, 0.1), 1.0);
        assert_eq!(robust_weight(RobustLoss::Huber, 0.05, 0.1), 1.0);
        assert_relative_eq!(robust_weight(RobustLoss::Huber, -0.4, 0.1), 0.25);
        assert_eq!(robust_weight(RobustLoss::Tukey, 0.1, 0.1), 0.0);
        assert_relative_eq!(robust_weight(RobustLoss::Tukey, 0.05, 0.1), 0.5625);
        assert_eq!(robust_weight(RobustLoss::Tukey, 0.0, 0.1), 1.0);
    }

    fn axial_stack(value: f32, count: usize, size: usize) -> Vec<ReconstructionSlice> {
        (0..count)
            .map(|k| {
                ReconstructionSlice::new(
                    Array2::from_elem((size, size), value),
                    Vec3::new(0.0, 0.0, k as f64),
                    Vec3::y(),
                    Vec3::x(),
                    1.0,
                    1.0,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn aligned_splat_reproduces_pixels() {
        let stack = axial_stack(0.6, 6, 8);
        let refs: Vec<&ReconstructionSlice> = stack.iter().collect();
        let grid = ReconstructionGrid::new((10, 10, 8), Vec3::zeros(), 1.0);
        let volume = reconstruct(&refs, &grid, &SolverOptions::backprojection_only(), &RunContext::detached()).unwrap();
        // Strict support stops at the last index on each axis.
        assert_relative_eq!(volume.value(3, 4, 2), 0.6, epsilon = 1e-6);
        assert_relative_eq!(volume.value(0, 0, 0), 0.6, epsilon = 1e-6);
        assert_eq!(volume.value(9, 9, 7), 0.0);
        assert_eq!(volume.value(8, 3, 3), 0.0);
    }

    #[test]
    fn refinement_keeps_a_consistent_volume() {
        let stack = axial_stack(0.5, 6, 8);
        let refs: Vec<&ReconstructionSlice> = stack.iter().collect();
        let grid = ReconstructionGrid::new((10, 10, 8), Vec3::zeros(), 1.0);
        let options = SolverOptions {
            iterations: 3,
            psf_mode: PsfMode::None,
            laplacian_weight: 0.0,
            ..SolverOptions::default()
        };
        let volume = reconstruct(&refs, &grid, &options, &RunContext::detached()).unwrap();
        assert_relative_eq!(volume.value(4, 4, 2), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn refinement_moves_towards_observations() {
        let stack = axial_stack(0.8, 5, 6);
        let refs: Vec<&ReconstructionSlice> = stack.iter().collect();
        let grid = ReconstructionGrid::new((6, 6, 6), Vec3::zeros(), 1.0);
        let mut volume = Volume::zeros(grid);
        let options = SolverOptions {
            psf_mode: PsfMode::None,
            robust_loss: RobustLoss::None,
            step_size: 1.0,
            ..SolverOptions::default()
        };
        refine(&mut volume, &refs, &options, 1, &RunContext::detached()).unwrap();
        assert_relative_eq!(volume.value(2, 2, 2), 0.8, epsilon = 1e-5);
    }

    #[test]
    fn laplacian_flattens_a_spike() {
        let dims = (3, 3, 3);
        let mut values = vec![0.0f32; 27];
        values[13] = 1.0;
        let mut scratch = vec![0.0f32; 27];
        smooth_laplacian(&mut values, &mut scratch, dims, 0.1, true);
        assert_relative_eq!(values[13], 0.4, epsilon = 1e-6);
        // Boundary voxels are not written.
        assert_eq!(values[12], 0.0);
    }

    #[test]
    fn cancelled_run_returns_no_volume() {
        let stack = axial_stack(0.5, 3, 4);
        let refs: Vec<&ReconstructionSlice> = stack.iter().collect();
        let grid = ReconstructionGrid::new((4, 4, 4), Vec3::zeros(), 1.0);
        let ctx = RunContext::detached();
        ctx.token().cancel();
        let result = reconstruct(&refs, &grid, &SolverOptions::default(), &ctx);
        assert!(matches!(result, Err(SvrError::Cancelled)));
    }

    #[test]
    fn empty_input_gives_zero_volume() {
        let grid = ReconstructionGrid::new((4, 4, 4), Vec3::zeros(), 1.0);
        let volume = reconstruct(&[], &grid, &SolverOptions::default(), &RunContext::detached()).unwrap();
        assert!(volume.as_slice().unwrap().iter().all(|v| *v == 0.0));
    }
}
