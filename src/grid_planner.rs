//! Chooses the output lattice under a per-axis cap and a peak-memory budget.

use log::{debug, info};

use crate::config::{DEFAULT_MEMORY_BUDGET_BYTES, ReconstructionOptions};
use crate::error::SvrError;
use crate::geometry::Bounds;
use crate::volume::ReconstructionGrid;

const BYTES_PER_VOXEL: u64 = std::mem::size_of::<f32>() as u64;
const MAX_ATTEMPTS: usize = 16;
// Slack on the cube-root escalation so the `+1` per axis does not undo it.
const BUDGET_ESCALATION_MARGIN: f64 = 1.05;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridPlanner {
    pub max_volume_dim: usize,
    pub memory_budget_bytes: u64,
}

impl Default for GridPlanner {
    fn default() -> Self {
        Self {
            max_volume_dim: 256,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
        }
    }
}

impl GridPlanner {
    pub fn new(max_volume_dim: usize, memory_budget_bytes: u64) -> Self {
        Self {
            max_volume_dim: max_volume_dim.max(4),
            memory_budget_bytes,
        }
    }

    pub fn from_options(options: &ReconstructionOptions) -> Self {
        Self::new(options.max_volume_dim, options.memory_budget_bytes)
    }

    /// `ceil(extent / voxel) + 1` per axis, at least 2.
    pub fn dims_for(bounds: &Bounds, voxel_size_mm: f64) -> (usize, usize, usize) {
        let extent = bounds.extent();
        let axis = |e: f64| ((e.max(0.0) / voxel_size_mm).ceil() as usize).saturating_add(1).max(2);
        (axis(extent.x), axis(extent.y), axis(extent.z))
    }

    /// Peak bytes of the persistent buffers: value and weight, plus the
    /// update buffer when refining.
    pub fn estimate_peak_bytes(voxel_count: usize, iterations: usize) -> u64 {
        let buffers = if iterations > 0 { 3 } else { 2 };
        (voxel_count as u64).saturating_mul(BYTES_PER_VOXEL * buffers)
    }

    /// Same as [`Self::estimate_peak_bytes`] for a lattice that may not fit
    /// in memory at all; saturates at `u64::MAX`.
    pub fn estimate_for_dims(dims: (usize, usize, usize), iterations: usize) -> u64 {
        let count = (dims.0 as u64)
            .checked_mul(dims.1 as u64)
            .and_then(|n| n.checked_mul(dims.2 as u64));
        match count {
            Some(count) => Self::estimate_peak_bytes(count as usize, iterations),
            None => u64::MAX,
        }
    }

    /// Grows the voxel size until no axis exceeds `max_volume_dim`.
    /// Returns the dims and the voxel size that produced them.
    pub fn fit_max_dim(&self, bounds: &Bounds, voxel_size_mm: f64) -> ((usize, usize, usize), f64) {
        let mut voxel = voxel_size_mm;
        for _ in 0..MAX_ATTEMPTS {
            let dims = Self::dims_for(bounds, voxel);
            let largest = dims.0.max(dims.1).max(dims.2);
            if largest <= self.max_volume_dim {
                return (dims, voxel);
            }
            voxel *= largest as f64 / self.max_volume_dim as f64;
        }

        // Guarantees ceil(extent / voxel) <= max - 2 on every axis.
        let extent = bounds.extent();
        let longest = extent.x.max(extent.y).max(extent.z);
        voxel = voxel.max(longest / (self.max_volume_dim - 2) as f64);
        (Self::dims_for(bounds, voxel), voxel)
    }

    /// Grid for `bounds` honoring only the dimension cap; used for scoring
    /// and coarse grids whose memory is covered by the main plan.
    pub fn grid_for_voxel_size(&self, bounds: &Bounds, voxel_size_mm: f64) -> ReconstructionGrid {
        let (dims, voxel) = self.fit_max_dim(bounds, voxel_size_mm);
        ReconstructionGrid::new(dims, bounds.min, voxel)
    }

    /// Plans the output grid. Never returns a grid over either limit.
    pub fn plan(
        &self,
        bounds: &Bounds,
        voxel_size_mm: f64,
        iterations: usize,
    ) -> Result<ReconstructionGrid, SvrError> {
        if bounds.is_empty() || !bounds.extent().iter().all(|e| e.is_finite()) {
            return Err(SvrError::InvalidConfig(
                "reconstruction bounds are empty or not finite".to_string(),
            ));
        }
        if !(voxel_size_mm.is_finite() && voxel_size_mm > 0.0) {
            return Err(SvrError::InvalidConfig(format!(
                "voxel size must be positive, got {voxel_size_mm}"
            )));
        }

        let mut voxel = voxel_size_mm;
        let mut estimate = 0;
        for attempt in 0..MAX_ATTEMPTS {
            let (dims, fitted) = self.fit_max_dim(bounds, voxel);
            voxel = fitted;
            estimate = Self::estimate_for_dims(dims, iterations);

            if estimate <= self.memory_budget_bytes {
                if voxel > voxel_size_mm {
                    info!(
                        "Voxel size raised from {voxel_size_mm:.3} to {voxel:.3} mm to fit limits"
                    );
                }
                debug!(
                    "Planned grid {}x{}x{} at {voxel:.3} mm ({estimate} bytes peak)",
                    dims.0, dims.1, dims.2
                );
                return Ok(ReconstructionGrid::new(dims, bounds.min, voxel));
            }

            let factor = (estimate as f64 / self.memory_budget_bytes as f64).cbrt();
            debug!("Attempt {attempt}: {estimate} bytes over budget, scaling voxel by {factor:.3}");
            voxel *= factor * BUDGET_ESCALATION_MARGIN;
        }

        Err(SvrError::MemoryBudgetExceeded {
            estimated_bytes: estimate,
            budget_bytes: self.memory_budget_bytes,
            voxel_size_mm: voxel,
        })
    }
}
