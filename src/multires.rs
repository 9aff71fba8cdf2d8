//! Coarse-to-fine reconstruction: a cheap solve on an enlarged voxel grid,
//! upsampled onto the fine grid as the starting point of fine refinement.

use log::info;
use web_time::Instant;

use crate::config::SolverOptions;
use crate::error::SvrError;
use crate::geometry::Bounds;
use crate::grid_planner::GridPlanner;
use crate::progress::RunContext;
use crate::reconstruction::{reconstruct, refine};
use crate::slice::ReconstructionSlice;
use crate::volume::{ReconstructionGrid, Volume};

pub struct MultiResolution {
    pub factor: f64,
    pub coarse_iterations: usize,
}

impl MultiResolution {
    pub fn new(factor: f64, coarse_iterations: usize) -> Self {
        Self {
            factor,
            coarse_iterations,
        }
    }

    /// Grid of the coarse pass: same bounds, voxel size scaled by `factor`,
    /// dimension cap applied.
    pub fn coarse_grid(
        &self,
        planner: &GridPlanner,
        bounds: &Bounds,
        fine: &ReconstructionGrid,
    ) -> ReconstructionGrid {
        planner.grid_for_voxel_size(bounds, fine.voxel_size_mm * self.factor)
    }

    /// Reconstructs on `fine`. Without refinement iterations this is the
    /// single-resolution solve.
    pub fn reconstruct(
        &self,
        slices: &[&ReconstructionSlice],
        planner: &GridPlanner,
        bounds: &Bounds,
        fine: &ReconstructionGrid,
        options: &SolverOptions,
        ctx: &RunContext,
    ) -> Result<Volume, SvrError> {
        if options.iterations == 0 {
            return reconstruct(slices, fine, options, ctx);
        }

        let started = Instant::now();
        let coarse_grid = self.coarse_grid(planner, bounds, fine);
        let coarse_options = SolverOptions {
            iterations: self.coarse_iterations,
            ..*options
        };
        info!(
            "Coarse pass on {}x{}x{} at {:.3} mm",
            coarse_grid.nx, coarse_grid.ny, coarse_grid.nz, coarse_grid.voxel_size_mm
        );
        let coarse = reconstruct(slices, &coarse_grid, &coarse_options, ctx)?;
        ctx.check_cancelled()?;

        let mut volume = coarse.resample_to(fine)?;
        drop(coarse);
        refine(&mut volume, slices, options, options.iterations, ctx)?;
        info!("Multi-resolution reconstruction finished in {:?}", started.elapsed());
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;
    use ndarray::Array2;

    fn stack() -> Vec<ReconstructionSlice> {
        (0..8)
            .map(|k| {
                ReconstructionSlice::new(
                    Array2::from_elem((12, 12), 0.7),
                    Vec3::new(0.0, 0.0, k as f64 * 1.5),
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
    fn output_lives_on_the_fine_grid() {
        let slices = stack();
        let refs: Vec<&ReconstructionSlice> = slices.iter().collect();
        let planner = GridPlanner::default();
        let bounds = Bounds::new(Vec3::zeros(), Vec3::new(11.0, 11.0, 10.5));
        let fine = planner.plan(&bounds, 1.0, 2).unwrap();
        let driver = MultiResolution::new(2.0, 2);

        let coarse = driver.coarse_grid(&planner, &bounds, &fine);
        assert_eq!(coarse.voxel_size_mm, 2.0);
        assert!(coarse.voxel_count() < fine.voxel_count());

        let options = SolverOptions {
            iterations: 2,
            ..SolverOptions::default()
        };
        let volume = driver
            .reconstruct(&refs, &planner, &bounds, &fine, &options, &RunContext::detached())
            .unwrap();
        assert_eq!(volume.grid, fine);
        assert!(volume.as_slice().unwrap().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn no_iterations_is_single_resolution() {
        let slices = stack();
        let refs: Vec<&ReconstructionSlice> = slices.iter().collect();
        let planner = GridPlanner::default();
        let bounds = Bounds::new(Vec3::zeros(), Vec3::new(11.0, 11.0, 10.5));
        let fine = planner.plan(&bounds, 1.0, 0).unwrap();
        let options = SolverOptions::backprojection_only();
        let ctx = RunContext::detached();

        let multi = MultiResolution::new(2.0, 2)
            .reconstruct(&refs, &planner, &bounds, &fine, &options, &ctx)
            .unwrap();
        let single = reconstruct(&refs, &fine, &options, &ctx).unwrap();
        assert_eq!(multi.data, single.data);
    }
}
